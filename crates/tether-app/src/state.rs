//! Daemon state shared by every connection.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use log::debug;
use rusqlite::Connection;
use tether_notify::{Notification, NotificationEvent, NotificationGate, PreferencesHandle};
use tether_pty::{NativePtyBackend, PtyBackend, RegistryError, SessionRegistry};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::config::Config;

/// Gated notifications buffered per slow listener before it starts lagging.
const NOTIFICATION_BACKLOG: usize = 256;

pub struct AppState {
    pub config: Config,
    pub registry: Arc<SessionRegistry>,
    /// Live notification preferences; persisted through `db`, whose lock
    /// also serializes preference writes.
    pub preferences: Arc<PreferencesHandle>,
    pub db: Arc<Mutex<Connection>>,
    /// Notifications that passed the gate.
    pub notifications: broadcast::Sender<Notification>,
    shutdown: broadcast::Sender<()>,
}

impl AppState {
    /// Build the state on the native PTY backend. The returned receiver
    /// carries raw classifier events for [`start_notifier`].
    pub fn new(
        config: Config,
        db: Connection,
    ) -> Result<(Self, mpsc::UnboundedReceiver<NotificationEvent>), RegistryError> {
        Self::with_backend(config, db, Arc::new(NativePtyBackend))
    }

    pub fn with_backend(
        config: Config,
        db: Connection,
        backend: Arc<dyn PtyBackend>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<NotificationEvent>), RegistryError> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let registry = SessionRegistry::new(backend, config.session_options(), events_tx)?;
        let preferences = Arc::new(PreferencesHandle::new(
            tether_db::preferences::load_or_default(&db),
        ));
        let (notifications, _) = broadcast::channel(NOTIFICATION_BACKLOG);
        let (shutdown, _) = broadcast::channel(1);
        let state = Self {
            config,
            registry: Arc::new(registry),
            preferences,
            db: Arc::new(Mutex::new(db)),
            notifications,
            shutdown,
        };
        Ok((state, events_rx))
    }

    pub fn gate(&self) -> NotificationGate {
        self.preferences.gate(self.config.bell_window())
    }

    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown.subscribe()
    }

    /// Ask the accept loop and open connections to stop.
    pub fn trigger_shutdown(&self) {
        let _ = self.shutdown.send(());
    }
}

/// Forward classifier events through the gate to notification listeners.
///
/// Ends when every session sender is gone.
pub fn start_notifier(
    mut events: mpsc::UnboundedReceiver<NotificationEvent>,
    mut gate: NotificationGate,
    out: broadcast::Sender<Notification>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let kind = event.kind;
            match gate.filter(event, Instant::now()) {
                Some(notification) => {
                    // No listeners is fine; the event is simply not delivered.
                    let _ = out.send(notification);
                }
                None => debug!("notification {kind:?} suppressed by preferences"),
            }
        }
    })
}
