//! Per-kind notification toggles applied between the classifier and delivery.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use log::{debug, info};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::event::{NotificationEvent, NotificationKind};

/// Current preferences layout.
///
/// Version 1 had no master `enabled` switch and named the agent toggle
/// `claudeTurn`.
pub const PREFERENCES_VERSION: u32 = 2;

fn legacy_version() -> u32 {
    1
}

/// User preferences for which events become notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NotificationPreferences {
    #[serde(default = "legacy_version")]
    pub version: u32,
    pub enabled: bool,
    pub session_start: bool,
    pub session_exit: bool,
    pub command_error: bool,
    pub command_completion: bool,
    pub bell: bool,
    #[serde(alias = "claudeTurn")]
    pub agent_turn: bool,
    pub sound: bool,
    pub vibration: bool,
}

impl Default for NotificationPreferences {
    fn default() -> Self {
        Self {
            version: PREFERENCES_VERSION,
            enabled: true,
            session_start: false,
            session_exit: true,
            command_error: true,
            command_completion: true,
            bell: true,
            agent_turn: true,
            sound: true,
            vibration: false,
        }
    }
}

impl NotificationPreferences {
    /// Parse stored JSON, upgrading older layouts.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        let prefs: Self = serde_json::from_str(json)?;
        Ok(prefs.upgrade())
    }

    /// Bring preferences from an older version up to the current one.
    pub fn upgrade(mut self) -> Self {
        if self.version < 2 {
            // v1 had no master switch; every stored toggle was live.
            self.enabled = true;
        }
        if self.version < PREFERENCES_VERSION {
            info!(
                "upgrading notification preferences v{} -> v{}",
                self.version, PREFERENCES_VERSION
            );
            self.version = PREFERENCES_VERSION;
        }
        self
    }

    pub fn allows(&self, kind: NotificationKind) -> bool {
        if !self.enabled {
            return false;
        }
        match kind {
            NotificationKind::SessionStart => self.session_start,
            NotificationKind::SessionExit => self.session_exit,
            NotificationKind::CommandError => self.command_error,
            NotificationKind::CommandCompletion => self.command_completion,
            NotificationKind::Bell => self.bell,
            NotificationKind::AgentTurn => self.agent_turn,
        }
    }

    /// Apply the fields present in `patch`.
    pub fn merge(&mut self, patch: &PreferencesPatch) {
        let fields = [
            (&mut self.enabled, patch.enabled),
            (&mut self.session_start, patch.session_start),
            (&mut self.session_exit, patch.session_exit),
            (&mut self.command_error, patch.command_error),
            (&mut self.command_completion, patch.command_completion),
            (&mut self.bell, patch.bell),
            (&mut self.agent_turn, patch.agent_turn),
            (&mut self.sound, patch.sound),
            (&mut self.vibration, patch.vibration),
        ];
        for (field, value) in fields {
            if let Some(value) = value {
                *field = value;
            }
        }
    }
}

/// A partial preferences update sent by a client.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PreferencesPatch {
    pub enabled: Option<bool>,
    pub session_start: Option<bool>,
    pub session_exit: Option<bool>,
    pub command_error: Option<bool>,
    pub command_completion: Option<bool>,
    pub bell: Option<bool>,
    #[serde(alias = "claudeTurn")]
    pub agent_turn: Option<bool>,
    pub sound: Option<bool>,
    pub vibration: Option<bool>,
}

/// An event that passed the gate, ready for delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    #[serde(flatten)]
    pub event: NotificationEvent,
    pub sound: bool,
    pub vibration: bool,
}

/// Owner of the live preferences. Gates observe changes through a watch
/// channel.
#[derive(Debug)]
pub struct PreferencesHandle {
    tx: watch::Sender<NotificationPreferences>,
}

impl PreferencesHandle {
    pub fn new(initial: NotificationPreferences) -> Self {
        let (tx, _rx) = watch::channel(initial.upgrade());
        Self { tx }
    }

    pub fn current(&self) -> NotificationPreferences {
        self.tx.borrow().clone()
    }

    /// Merge a patch and publish the result to every gate.
    pub fn update(&self, patch: &PreferencesPatch) -> NotificationPreferences {
        self.tx.send_modify(|prefs| prefs.merge(patch));
        let updated = self.current();
        debug!("notification preferences updated: {:?}", updated);
        updated
    }

    /// Replace the preferences wholesale.
    pub fn replace(&self, prefs: NotificationPreferences) {
        self.tx.send_replace(prefs.upgrade());
    }

    pub fn subscribe(&self) -> watch::Receiver<NotificationPreferences> {
        self.tx.subscribe()
    }

    pub fn gate(&self, bell_window: Duration) -> NotificationGate {
        NotificationGate::new(self.subscribe(), bell_window)
    }
}

impl Default for PreferencesHandle {
    fn default() -> Self {
        Self::new(NotificationPreferences::default())
    }
}

/// Filters classified events against the current preferences.
///
/// Bells from one session arriving within `bell_window` of the last delivered
/// bell are dropped; a zero window delivers every bell.
pub struct NotificationGate {
    prefs: watch::Receiver<NotificationPreferences>,
    bell_window: Duration,
    last_bell: HashMap<String, Instant>,
}

impl NotificationGate {
    pub fn new(prefs: watch::Receiver<NotificationPreferences>, bell_window: Duration) -> Self {
        Self {
            prefs,
            bell_window,
            last_bell: HashMap::new(),
        }
    }

    pub fn filter(&mut self, event: NotificationEvent, now: Instant) -> Option<Notification> {
        let prefs = self.prefs.borrow_and_update().clone();

        if event.kind == NotificationKind::SessionExit {
            self.last_bell.remove(&event.session_id);
        }
        if !prefs.allows(event.kind) {
            return None;
        }
        if event.kind == NotificationKind::Bell && !self.bell_window.is_zero() {
            if let Some(last) = self.last_bell.get(&event.session_id) {
                if now.saturating_duration_since(*last) < self.bell_window {
                    return None;
                }
            }
            self.last_bell.insert(event.session_id.clone(), now);
        }

        Some(Notification {
            event,
            sound: prefs.sound,
            vibration: prefs.vibration,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::NotificationPayload;

    fn event(kind: NotificationKind, session: &str) -> NotificationEvent {
        NotificationEvent::new(kind, session, NotificationPayload::None)
    }

    #[test]
    fn test_defaults_fill_missing_fields() {
        let prefs = NotificationPreferences::from_json(r#"{"version":2,"bell":false}"#).unwrap();
        assert!(!prefs.bell);
        assert!(prefs.session_exit);
        assert!(prefs.enabled);
    }

    #[test]
    fn test_legacy_prefs_upgrade() {
        let prefs =
            NotificationPreferences::from_json(r#"{"claudeTurn":false,"enabled":false,"extra":1}"#)
                .unwrap();
        assert_eq!(prefs.version, PREFERENCES_VERSION);
        assert!(!prefs.agent_turn);
        // v1 stored no master switch.
        assert!(prefs.enabled);
    }

    #[test]
    fn test_serializes_camel_case() {
        let json = serde_json::to_value(NotificationPreferences::default()).unwrap();
        assert_eq!(json["commandCompletion"], true);
        assert_eq!(json["agentTurn"], true);
        assert_eq!(json["version"], PREFERENCES_VERSION);
    }

    #[test]
    fn test_merge_only_present_fields() {
        let mut prefs = NotificationPreferences::default();
        prefs.merge(&PreferencesPatch {
            bell: Some(false),
            vibration: Some(true),
            ..Default::default()
        });
        assert!(!prefs.bell);
        assert!(prefs.vibration);
        assert!(prefs.command_error);
    }

    #[test]
    fn test_gate_applies_toggles_and_flags() {
        let handle = PreferencesHandle::default();
        let mut gate = handle.gate(Duration::ZERO);
        let now = Instant::now();

        assert!(gate.filter(event(NotificationKind::SessionStart, "a"), now).is_none());
        let passed = gate.filter(event(NotificationKind::SessionExit, "a"), now).unwrap();
        assert!(passed.sound);
        assert!(!passed.vibration);
        assert_eq!(passed.event.kind, NotificationKind::SessionExit);
    }

    #[test]
    fn test_gate_sees_preference_changes() {
        let handle = PreferencesHandle::default();
        let mut gate = handle.gate(Duration::ZERO);
        let now = Instant::now();
        assert!(gate.filter(event(NotificationKind::Bell, "a"), now).is_some());

        handle.update(&PreferencesPatch {
            bell: Some(false),
            ..Default::default()
        });
        assert!(gate.filter(event(NotificationKind::Bell, "a"), now).is_none());

        handle.update(&PreferencesPatch {
            enabled: Some(false),
            bell: Some(true),
            ..Default::default()
        });
        assert!(gate.filter(event(NotificationKind::SessionExit, "a"), now).is_none());
    }

    #[test]
    fn test_bell_window_is_per_session() {
        let handle = PreferencesHandle::default();
        let mut gate = handle.gate(Duration::from_millis(500));
        let t0 = Instant::now();

        assert!(gate.filter(event(NotificationKind::Bell, "a"), t0).is_some());
        assert!(gate
            .filter(event(NotificationKind::Bell, "a"), t0 + Duration::from_millis(100))
            .is_none());
        assert!(gate
            .filter(event(NotificationKind::Bell, "b"), t0 + Duration::from_millis(100))
            .is_some());
        assert!(gate
            .filter(event(NotificationKind::Bell, "a"), t0 + Duration::from_millis(600))
            .is_some());
    }
}
