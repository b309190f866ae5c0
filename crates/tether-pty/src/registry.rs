use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tether_notify::{EventClassifier, NotificationEvent};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::pty::{NativePtyBackend, PtyBackend, PtyError};
use crate::session::{KillOutcome, Session, SessionId, SessionOptions, SessionSpec, SessionSummary};

/// Errors from registry operations.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("failed to spawn process: {0}")]
    Spawn(String),
    #[error("session {0} not found")]
    NotFound(SessionId),
    #[error("session id {0} is already in use")]
    SessionIdConflict(SessionId),
    #[error("session {0} is still running")]
    SessionStillRunning(SessionId),
    #[error("process is not running")]
    ProcessNotRunning,
    #[error("invalid geometry {cols}x{rows}")]
    InvalidGeometry { cols: u16, rows: u16 },
    #[error("session {0} did not exit after a forced kill")]
    KillTimeout(SessionId),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<PtyError> for RegistryError {
    fn from(err: PtyError) -> Self {
        match err {
            PtyError::Spawn(reason) => RegistryError::Spawn(reason),
            PtyError::ProcessNotRunning => RegistryError::ProcessNotRunning,
            PtyError::InvalidGeometry { cols, rows } => RegistryError::InvalidGeometry { cols, rows },
            PtyError::Io(err) => RegistryError::Internal(err.to_string()),
        }
    }
}

/// Result of killing every live session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KillReport {
    pub killed: Vec<SessionId>,
    /// Sessions that outlived the kill, with the reason.
    pub failed: Vec<(SessionId, String)>,
}

enum Slot {
    /// Id reserved while the process is being spawned.
    Starting,
    Ready(Arc<Session>),
}

/// Owns every session. Ids are unique for the lifetime of the entry.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, Slot>>,
    backend: Arc<dyn PtyBackend>,
    options: SessionOptions,
    notifications: mpsc::UnboundedSender<NotificationEvent>,
}

impl SessionRegistry {
    /// Fails if the classifier configuration does not compile.
    pub fn new(
        backend: Arc<dyn PtyBackend>,
        options: SessionOptions,
        notifications: mpsc::UnboundedSender<NotificationEvent>,
    ) -> Result<Self, RegistryError> {
        options
            .classifier
            .build_matchers()
            .map_err(|e| RegistryError::Internal(format!("invalid classifier pattern: {e}")))?;
        Ok(Self {
            sessions: RwLock::new(HashMap::new()),
            backend,
            options,
            notifications,
        })
    }

    pub fn native(
        options: SessionOptions,
        notifications: mpsc::UnboundedSender<NotificationEvent>,
    ) -> Result<Self, RegistryError> {
        Self::new(Arc::new(NativePtyBackend), options, notifications)
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<SessionId, Slot>> {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<SessionId, Slot>> {
        self.sessions.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawn a session and register it.
    ///
    /// The id is reserved before spawning so concurrent creates with the same
    /// id cannot both succeed. Must be called from within a Tokio runtime.
    pub fn create(&self, spec: SessionSpec) -> Result<SessionId, RegistryError> {
        let id = spec
            .id
            .clone()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        {
            let mut sessions = self.write();
            if sessions.contains_key(&id) {
                return Err(RegistryError::SessionIdConflict(id));
            }
            sessions.insert(id.clone(), Slot::Starting);
        }

        let started = EventClassifier::from_config(id.as_str(), &self.options.classifier)
            .map_err(|e| RegistryError::Internal(e.to_string()))
            .and_then(|classifier| {
                Session::start(
                    id.clone(),
                    &spec,
                    self.backend.as_ref(),
                    classifier,
                    &self.options,
                    self.notifications.clone(),
                )
                .map_err(RegistryError::from)
            });

        let mut sessions = self.write();
        match started {
            Ok(session) => {
                sessions.insert(id.clone(), Slot::Ready(session));
                info!("created session {id}");
                Ok(id)
            }
            Err(err) => {
                sessions.remove(&id);
                warn!("failed to create session {id}: {err}");
                Err(err)
            }
        }
    }

    pub fn get(&self, id: &str) -> Result<Arc<Session>, RegistryError> {
        match self.read().get(id) {
            Some(Slot::Ready(session)) => Ok(Arc::clone(session)),
            Some(Slot::Starting) | None => Err(RegistryError::NotFound(id.to_string())),
        }
    }

    /// Summaries ordered by creation time.
    pub fn list(&self) -> Vec<SessionSummary> {
        let mut summaries: Vec<SessionSummary> =
            self.ready_sessions().iter().map(|s| s.summary()).collect();
        summaries.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        summaries
    }

    pub fn len(&self) -> usize {
        self.ready_sessions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn write_input(&self, id: &str, bytes: &[u8]) -> Result<(), RegistryError> {
        Ok(self.get(id)?.write_input(bytes)?)
    }

    pub fn resize(&self, id: &str, cols: u16, rows: u16) -> Result<u64, RegistryError> {
        Ok(self.get(id)?.resize(cols, rows)?)
    }

    /// Kill one session. Killing an exited session succeeds.
    pub async fn kill(&self, id: &str) -> Result<(), RegistryError> {
        let session = self.get(id)?;
        kill_session(session, &self.options).await
    }

    /// Kill every live session concurrently.
    pub async fn kill_all(&self) -> KillReport {
        let live: Vec<Arc<Session>> = self
            .ready_sessions()
            .into_iter()
            .filter(|session| !session.is_exited())
            .collect();

        let mut tasks = JoinSet::new();
        for session in live {
            let options = self.options.clone();
            tasks.spawn(async move {
                let id = session.id().to_string();
                (id, kill_session(session, &options).await)
            });
        }

        let mut report = KillReport::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((id, Ok(()))) => report.killed.push(id),
                Ok((id, Err(err))) => report.failed.push((id, err.to_string())),
                Err(err) => warn!("kill task failed: {err}"),
            }
        }
        report.killed.sort();
        report.failed.sort();
        info!(
            "kill_all: {} killed, {} failed",
            report.killed.len(),
            report.failed.len()
        );
        report
    }

    /// Remove an exited session.
    pub fn cleanup(&self, id: &str) -> Result<(), RegistryError> {
        let mut sessions = self.write();
        match sessions.get(id) {
            Some(Slot::Ready(session)) if session.is_exited() => {}
            Some(Slot::Ready(_)) | Some(Slot::Starting) => {
                return Err(RegistryError::SessionStillRunning(id.to_string()));
            }
            None => return Err(RegistryError::NotFound(id.to_string())),
        }
        sessions.remove(id);
        debug!("cleaned up session {id}");
        Ok(())
    }

    /// Remove every exited session, returning the removed ids.
    pub fn cleanup_all_exited(&self) -> Vec<SessionId> {
        let mut sessions = self.write();
        let mut removed: Vec<SessionId> = sessions
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Ready(session) if session.is_exited()))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &removed {
            sessions.remove(id);
        }
        removed.sort();
        if !removed.is_empty() {
            debug!("cleaned up {} exited sessions", removed.len());
        }
        removed
    }

    /// Kill everything, release every PTY and empty the registry.
    pub async fn shutdown(&self) -> KillReport {
        let report = self.kill_all().await;
        let drained: Vec<Slot> = self.write().drain().map(|(_, slot)| slot).collect();
        for slot in drained {
            if let Slot::Ready(session) = slot {
                session.release();
            }
        }
        report
    }

    fn ready_sessions(&self) -> Vec<Arc<Session>> {
        self.read()
            .values()
            .filter_map(|slot| match slot {
                Slot::Ready(session) => Some(Arc::clone(session)),
                Slot::Starting => None,
            })
            .collect()
    }
}

async fn kill_session(session: Arc<Session>, options: &SessionOptions) -> Result<(), RegistryError> {
    match session.kill(options.kill_grace, options.kill_timeout).await {
        KillOutcome::AlreadyExited(_) | KillOutcome::Exited(_) => Ok(()),
        KillOutcome::TimedOut => Err(RegistryError::KillTimeout(session.id().to_string())),
    }
}
