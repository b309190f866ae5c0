//! Notification preferences persisted as JSON in the settings table.

use log::{debug, warn};
use rusqlite::Connection;
use tether_notify::NotificationPreferences;

use crate::{settings, StoreError};

pub const PREFERENCES_KEY: &str = "notifications.preferences";

/// Key used before schema v2.
pub const LEGACY_PREFERENCES_KEY: &str = "notificationPreferences";

/// Load the stored preferences, or the defaults when none are stored.
///
/// Older layouts are upgraded and written back.
pub fn load(conn: &Connection) -> Result<NotificationPreferences, StoreError> {
    let Some(json) = settings::get(conn, PREFERENCES_KEY)? else {
        debug!("no stored notification preferences, using defaults");
        return Ok(NotificationPreferences::default());
    };
    let stored: NotificationPreferences = serde_json::from_str(&json)?;
    let stored_version = stored.version;
    let prefs = stored.upgrade();
    if prefs.version != stored_version {
        save(conn, &prefs)?;
    }
    Ok(prefs)
}

/// Like [`load`], but unreadable values fall back to the defaults.
pub fn load_or_default(conn: &Connection) -> NotificationPreferences {
    match load(conn) {
        Ok(prefs) => prefs,
        Err(err) => {
            warn!("ignoring stored notification preferences: {err}");
            NotificationPreferences::default()
        }
    }
}

pub fn save(conn: &Connection, prefs: &NotificationPreferences) -> Result<(), StoreError> {
    let json = serde_json::to_string(prefs)?;
    settings::set(conn, PREFERENCES_KEY, &json)?;
    Ok(())
}
