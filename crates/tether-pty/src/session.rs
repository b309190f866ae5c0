use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use log::{debug, info, trace, warn};
use serde::{Deserialize, Serialize};
use tether_notify::{ClassifierConfig, EventClassifier, NotificationEvent};
use tether_vt::{BufferConfig, BufferError, Frame, Snapshot, TerminalBuffer};
use tokio::sync::{mpsc, watch};

use crate::multiplexer::{PollResult, Publisher, SharedBuffer, Subscription, SubscriptionMode};
use crate::pty::{
    validate_geometry, ExitStatus, PtyBackend, PtyCommand, PtyError, PtyEvent, PtyHandle, Signal,
};

/// Unique identifier for a terminal session.
pub type SessionId = String;

/// Tunables shared by every session of a registry.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionOptions {
    pub buffer: BufferConfig,
    pub classifier: ClassifierConfig,
    /// Time allowed to exit after a hangup before the kill is forced.
    pub kill_grace: Duration,
    /// Time allowed to exit after a forced kill.
    pub kill_timeout: Duration,
    /// How long to keep reading output after the child has exited.
    pub exit_drain: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            buffer: BufferConfig::default(),
            classifier: ClassifierConfig::default(),
            kill_grace: Duration::from_secs(2),
            kill_timeout: Duration::from_secs(3),
            exit_drain: Duration::from_millis(500),
        }
    }
}

/// Everything needed to create a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSpec {
    /// Caller-chosen id; a UUID is generated when absent.
    pub id: Option<SessionId>,
    pub command: PtyCommand,
    /// The caller asked for a native window. Recorded only; the process
    /// still runs on a headless PTY.
    pub spawn_window: bool,
    pub cols: u16,
    pub rows: u16,
}

impl Default for SessionSpec {
    fn default() -> Self {
        Self {
            id: None,
            command: PtyCommand::shell(),
            spawn_window: false,
            cols: 80,
            rows: 24,
        }
    }
}

impl SessionSpec {
    pub fn new(command: PtyCommand) -> Self {
        Self {
            command,
            ..Self::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<SessionId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_size(mut self, cols: u16, rows: u16) -> Self {
        self.cols = cols;
        self.rows = rows;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum SessionStatus {
    Starting,
    Running,
    Exited(ExitStatus),
}

impl SessionStatus {
    pub fn is_exited(&self) -> bool {
        matches!(self, SessionStatus::Exited(_))
    }

    pub fn exit(&self) -> Option<&ExitStatus> {
        match self {
            SessionStatus::Exited(exit) => Some(exit),
            _ => None,
        }
    }
}

/// Listing entry for one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: SessionId,
    pub argv: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub spawn_window: bool,
    pub created_at: DateTime<Utc>,
    pub status: SessionStatus,
    pub cols: u16,
    pub rows: u16,
    pub title: Option<String>,
    pub revision: u64,
    pub subscribers: usize,
}

/// How a kill request ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KillOutcome {
    AlreadyExited(ExitStatus),
    Exited(ExitStatus),
    TimedOut,
}

/// A process on a PTY, its terminal buffer and its subscribers.
///
/// A driver task owns the output side: it is the only writer of output into
/// the buffer and the only source of lifecycle transitions. Resizes are the
/// one other buffer mutation and hold `resizing` across the PTY and buffer.
pub struct Session {
    id: SessionId,
    command: PtyCommand,
    spawn_window: bool,
    created_at: DateTime<Utc>,
    pty: PtyHandle,
    buffer: SharedBuffer,
    publisher: Publisher,
    classifier: Mutex<EventClassifier>,
    resizing: Mutex<()>,
    status: watch::Sender<SessionStatus>,
    notifications: mpsc::UnboundedSender<NotificationEvent>,
}

impl Session {
    /// Spawn the process and start its driver task.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(
        id: SessionId,
        spec: &SessionSpec,
        backend: &dyn PtyBackend,
        classifier: EventClassifier,
        options: &SessionOptions,
        notifications: mpsc::UnboundedSender<NotificationEvent>,
    ) -> Result<Arc<Self>, PtyError> {
        validate_geometry(spec.cols, spec.rows)?;
        let buffer = TerminalBuffer::new(spec.cols, spec.rows, options.buffer)
            .map_err(PtyError::from)?;
        let spawned = backend.spawn(&spec.command, spec.cols, spec.rows)?;

        let buffer = SharedBuffer::new(buffer);
        let session = Arc::new(Self {
            id,
            command: spec.command.clone(),
            spawn_window: spec.spawn_window,
            created_at: Utc::now(),
            pty: PtyHandle::new(spawned.process),
            publisher: Publisher::new(buffer.clone()),
            buffer,
            classifier: Mutex::new(classifier),
            resizing: Mutex::new(()),
            status: watch::channel(SessionStatus::Starting).0,
            notifications,
        });

        session.status.send_replace(SessionStatus::Running);
        let started = session.classifier().on_running();
        session.emit(started);
        info!(
            "session {} running {:?} (pid {:?})",
            session.id,
            session.command.argv(),
            session.pty.pid()
        );

        tokio::spawn(drive(
            Arc::clone(&session),
            spawned.events,
            options.exit_drain,
        ));
        Ok(session)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn spawn_window(&self) -> bool {
        self.spawn_window
    }

    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    pub fn is_exited(&self) -> bool {
        self.status.borrow().is_exited()
    }

    pub fn watch_status(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }

    pub fn summary(&self) -> SessionSummary {
        let (cols, rows, revision, title) = {
            let buffer = self.buffer.lock();
            (buffer.cols(), buffer.rows(), buffer.revision(), buffer.title())
        };
        SessionSummary {
            id: self.id.clone(),
            argv: self.command.argv(),
            cwd: self.command.cwd.clone(),
            spawn_window: self.spawn_window,
            created_at: self.created_at,
            status: self.status(),
            cols,
            rows,
            title,
            revision,
            subscribers: self.publisher.subscriber_count(),
        }
    }

    /// Send input to the process.
    pub fn write_input(&self, bytes: &[u8]) -> Result<(), PtyError> {
        if self.is_exited() {
            return Err(PtyError::ProcessNotRunning);
        }
        self.pty.write(bytes)?;
        self.classifier().on_input(bytes, Instant::now());
        Ok(())
    }

    /// Resize the PTY, then the buffer. Returns the new buffer revision.
    ///
    /// Concurrent resizes are serialized so the buffer always ends at the
    /// size the PTY last accepted.
    pub fn resize(&self, cols: u16, rows: u16) -> Result<u64, PtyError> {
        validate_geometry(cols, rows)?;
        let _resizing = self.resizing.lock().unwrap_or_else(PoisonError::into_inner);
        if self.is_exited() {
            return Err(PtyError::ProcessNotRunning);
        }
        self.pty.resize(cols, rows)?;
        let (revision, frame) = {
            let mut buffer = self.buffer.lock();
            let revision = buffer.resize(cols, rows)?;
            (revision, buffer.frame())
        };
        self.publisher.publish(frame);
        debug!("session {} resized to {cols}x{rows}", self.id);
        Ok(revision)
    }

    pub fn signal(&self, signal: Signal) -> Result<(), PtyError> {
        self.pty.signal(signal)
    }

    /// Hang up, escalate to a forced kill, and give up after both waits.
    pub async fn kill(&self, grace: Duration, timeout: Duration) -> KillOutcome {
        let exited = self.status.borrow().exit().cloned();
        if let Some(exit) = exited {
            return KillOutcome::AlreadyExited(exit);
        }

        info!("killing session {}", self.id);
        match self.pty.signal(Signal::Hangup) {
            Ok(()) | Err(PtyError::ProcessNotRunning) => {}
            Err(err) => warn!("session {}: hangup failed: {err}", self.id),
        }
        if let Some(exit) = self.wait_exit(grace).await {
            return KillOutcome::Exited(exit);
        }

        warn!(
            "session {} still running {:?} after hangup, forcing kill",
            self.id, grace
        );
        match self.pty.force_kill() {
            Ok(()) | Err(PtyError::ProcessNotRunning) => {}
            Err(err) => warn!("session {}: forced kill failed: {err}", self.id),
        }
        match self.wait_exit(timeout).await {
            Some(exit) => KillOutcome::Exited(exit),
            None => KillOutcome::TimedOut,
        }
    }

    /// Wait up to `limit` for the session to exit.
    pub async fn wait_exit(&self, limit: Duration) -> Option<ExitStatus> {
        let mut rx = self.status.subscribe();
        let exit = match tokio::time::timeout(limit, rx.wait_for(SessionStatus::is_exited)).await {
            Ok(Ok(status)) => status.exit().cloned(),
            _ => None,
        };
        exit
    }

    pub fn attach(&self, mode: SubscriptionMode) -> Subscription {
        let subscription = self.publisher.attach(mode);
        debug!(
            "session {}: {:?} subscriber attached ({} total)",
            self.id,
            mode,
            self.publisher.subscriber_count()
        );
        subscription
    }

    pub fn poll(&self, since: u64) -> PollResult {
        self.publisher.poll(since)
    }

    pub fn subscriber_count(&self) -> usize {
        self.publisher.subscriber_count()
    }

    pub fn snapshot(&self) -> Snapshot {
        self.buffer.lock().snapshot()
    }

    pub fn frame(&self) -> Arc<Frame> {
        self.buffer.lock().frame()
    }

    /// Kill the child if alive and close the PTY.
    pub fn release(&self) {
        self.pty.release();
    }

    fn classifier(&self) -> MutexGuard<'_, EventClassifier> {
        self.classifier.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, events: Vec<NotificationEvent>) {
        for event in events {
            trace!("session {}: {:?}", self.id, event.kind);
            if self.notifications.send(event).is_err() {
                trace!("notification receiver gone; dropping event");
            }
        }
    }

    fn apply_output(&self, bytes: &[u8]) {
        let now = Instant::now();
        let (frame, replies) = {
            let mut buffer = self.buffer.lock();
            buffer.apply_output(bytes);
            (buffer.frame(), buffer.take_pty_writes())
        };
        for reply in replies {
            if let Err(err) = self.pty.write(reply.as_bytes()) {
                debug!("session {}: terminal reply not delivered: {err}", self.id);
            }
        }
        self.publisher.publish(frame);
        let events = self.classifier().on_output(bytes, now);
        self.emit(events);
    }

    fn finish(&self, exit: ExitStatus) {
        self.pty.mark_exited();
        let frame = self.buffer.lock().frame();
        let events = self.classifier().on_exit(exit.code);
        self.emit(events);
        self.status.send_replace(SessionStatus::Exited(exit.clone()));
        self.publisher.publish_exit(frame, exit.clone());
        info!(
            "session {} exited with code {}{}",
            self.id,
            exit.code,
            exit.signal
                .as_deref()
                .map(|signal| format!(" ({signal})"))
                .unwrap_or_default()
        );
    }
}

impl From<BufferError> for PtyError {
    fn from(err: BufferError) -> Self {
        match err {
            BufferError::InvalidGeometry { cols, rows } => PtyError::InvalidGeometry { cols, rows },
        }
    }
}

/// Consume PTY events in order until the session has exited.
///
/// When the child exits before its output stream closes, reading continues
/// for up to `exit_drain` so trailing output still reaches the buffer.
async fn drive(
    session: Arc<Session>,
    mut events: mpsc::UnboundedReceiver<PtyEvent>,
    exit_drain: Duration,
) {
    let mut stream_closed = false;
    let mut pending_exit: Option<(ExitStatus, tokio::time::Instant)> = None;

    let exit = loop {
        let event = match &pending_exit {
            None => events.recv().await,
            Some((_, deadline)) => tokio::time::timeout_at(*deadline, events.recv())
                .await
                .unwrap_or(None),
        };

        match event {
            Some(PtyEvent::Output(bytes)) => session.apply_output(&bytes),
            Some(PtyEvent::Exited(status)) => {
                if stream_closed {
                    break status;
                }
                pending_exit = Some((status, tokio::time::Instant::now() + exit_drain));
            }
            Some(PtyEvent::Closed(None)) => {
                stream_closed = true;
                if let Some((status, _)) = pending_exit.take() {
                    break status;
                }
            }
            Some(PtyEvent::Closed(Some(err))) => {
                warn!("session {}: PTY read failed: {err}", session.id);
                break pending_exit
                    .take()
                    .map(|(status, _)| status)
                    .unwrap_or_else(ExitStatus::read_failure);
            }
            None => {
                break pending_exit
                    .take()
                    .map(|(status, _)| status)
                    .unwrap_or_else(ExitStatus::read_failure);
            }
        }
    };

    session.finish(exit);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::multiplexer::SubscriptionMessage;
    use crate::pty::{NativePtyBackend, PtyProcess, SpawnedPty};
    use tether_notify::NotificationKind;

    fn start(
        command: PtyCommand,
    ) -> (Arc<Session>, mpsc::UnboundedReceiver<NotificationEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let options = SessionOptions::default();
        let classifier = EventClassifier::from_config("t", &options.classifier).unwrap();
        let session = Session::start(
            "t".to_string(),
            &SessionSpec::new(command),
            &NativePtyBackend,
            classifier,
            &options,
            tx,
        )
        .unwrap();
        (session, rx)
    }

    async fn wait_for_line(session: &Session, expected: &str) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if session
                .frame()
                .text_lines()
                .iter()
                .any(|line| line.trim() == expected)
            {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_echo_and_exit_zero() {
        let (session, mut notifications) = start(PtyCommand::new("/bin/sh"));
        assert_eq!(session.status(), SessionStatus::Running);

        session.write_input(b"echo hi\n").unwrap();
        assert!(wait_for_line(&session, "hi").await);

        session.write_input(b"exit\n").unwrap();
        let exit = session.wait_exit(Duration::from_secs(5)).await.unwrap();
        assert_eq!(exit.code, 0);
        assert!(session.is_exited());

        let mut kinds = Vec::new();
        while let Ok(event) = notifications.try_recv() {
            kinds.push(event.kind);
        }
        assert_eq!(kinds.first(), Some(&NotificationKind::SessionStart));
        assert_eq!(
            kinds
                .iter()
                .filter(|kind| **kind == NotificationKind::SessionExit)
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn test_output_after_exit_is_kept() {
        let (session, _rx) = start(PtyCommand::new("/bin/sh").arg("-c").arg("echo last words"));
        let exit = session.wait_exit(Duration::from_secs(5)).await.unwrap();
        assert!(exit.success());
        assert!(session.frame().contains_text("last words"));
    }

    #[tokio::test]
    async fn test_write_after_exit_fails() {
        let (session, _rx) = start(PtyCommand::new("/bin/sh").arg("-c").arg("exit 4"));
        let exit = session.wait_exit(Duration::from_secs(5)).await.unwrap();
        assert_eq!(exit.code, 4);
        assert!(matches!(
            session.write_input(b"x"),
            Err(PtyError::ProcessNotRunning)
        ));
        assert!(matches!(
            session.resize(100, 30),
            Err(PtyError::ProcessNotRunning)
        ));
    }

    #[tokio::test]
    async fn test_resize_validation() {
        let (session, _rx) = start(PtyCommand::new("/bin/sh"));
        let before = session.frame();
        assert!(matches!(
            session.resize(0, 24),
            Err(PtyError::InvalidGeometry { cols: 0, rows: 24 })
        ));
        let after = session.frame();
        assert_eq!((after.cols, after.rows), (before.cols, before.rows));

        session.resize(100, 30).unwrap();
        let summary = session.summary();
        assert_eq!((summary.cols, summary.rows), (100, 30));
        session.release();
    }

    /// Records the last size the PTY accepted. Never produces output.
    struct SizedProcess {
        size: Arc<Mutex<(u16, u16)>>,
        _events: mpsc::UnboundedSender<PtyEvent>,
    }

    impl PtyProcess for SizedProcess {
        fn pid(&self) -> Option<u32> {
            None
        }

        fn write(&mut self, _data: &[u8]) -> Result<(), PtyError> {
            Ok(())
        }

        fn resize(&mut self, cols: u16, rows: u16) -> Result<(), PtyError> {
            std::thread::sleep(Duration::from_millis(u64::from(cols % 3)));
            *self.size.lock().unwrap() = (cols, rows);
            Ok(())
        }

        fn signal(&mut self, _signal: Signal) -> Result<(), PtyError> {
            Ok(())
        }

        fn force_kill(&mut self) -> Result<(), PtyError> {
            Ok(())
        }

        fn release(&mut self) {}
    }

    struct SizedBackend {
        size: Arc<Mutex<(u16, u16)>>,
    }

    impl PtyBackend for SizedBackend {
        fn spawn(&self, _command: &PtyCommand, cols: u16, rows: u16) -> Result<SpawnedPty, PtyError> {
            *self.size.lock().unwrap() = (cols, rows);
            let (tx, events) = mpsc::unbounded_channel();
            Ok(SpawnedPty {
                process: Box::new(SizedProcess {
                    size: Arc::clone(&self.size),
                    _events: tx,
                }),
                events,
            })
        }
    }

    #[tokio::test]
    async fn test_concurrent_resizes_leave_pty_and_buffer_agreeing() {
        let size = Arc::new(Mutex::new((0, 0)));
        let backend = SizedBackend {
            size: Arc::clone(&size),
        };
        let (tx, _rx) = mpsc::unbounded_channel();
        let options = SessionOptions::default();
        let classifier = EventClassifier::from_config("r", &options.classifier).unwrap();
        let session = Session::start(
            "r".to_string(),
            &SessionSpec::new(PtyCommand::new("fake")),
            &backend,
            classifier,
            &options,
            tx,
        )
        .unwrap();

        for round in 0..20u16 {
            std::thread::scope(|scope| {
                for worker in 0..4u16 {
                    let session = &session;
                    scope.spawn(move || {
                        session.resize(40 + round + worker, 10 + worker).unwrap();
                    });
                }
            });
            let frame = session.frame();
            assert_eq!(*size.lock().unwrap(), (frame.cols, frame.rows), "round {round}");
        }
        session.release();
    }

    #[tokio::test]
    async fn test_kill_hangs_up_shell() {
        let (session, _rx) = start(PtyCommand::new("/bin/sh"));
        let outcome = session
            .kill(Duration::from_secs(2), Duration::from_secs(2))
            .await;
        assert!(matches!(outcome, KillOutcome::Exited(_)));
        assert!(matches!(
            session
                .kill(Duration::from_millis(10), Duration::from_millis(10))
                .await,
            KillOutcome::AlreadyExited(_)
        ));
    }

    #[tokio::test]
    async fn test_subscriber_sees_output_then_exit() {
        let (session, _rx) = start(PtyCommand::new("/bin/sh"));
        let mut sub = session.attach(SubscriptionMode::Binary);
        let Some(SubscriptionMessage::Snapshot(snapshot)) = sub.next().await else {
            panic!("expected snapshot");
        };
        let mut frame = snapshot.frame;

        session.write_input(b"echo SUB_OK; exit 7\n").unwrap();
        let exit = loop {
            let message = tokio::time::timeout(Duration::from_secs(5), sub.next())
                .await
                .unwrap();
            match message {
                Some(SubscriptionMessage::Update(diff)) => frame.apply(&diff).unwrap(),
                Some(SubscriptionMessage::Snapshot(snapshot)) => frame = snapshot.frame,
                Some(SubscriptionMessage::Exit(exit)) => break exit,
                Some(SubscriptionMessage::Screen(_)) | None => panic!("unexpected message"),
            }
        };
        assert_eq!(exit.code, 7);
        assert!(frame.contains_text("SUB_OK"));
        assert!(frame.same_content(&session.frame()));
    }

    #[tokio::test]
    async fn test_summary_reports_command() {
        let (session, _rx) = start(PtyCommand::new("/bin/sh").arg("-i"));
        let summary = session.summary();
        assert_eq!(summary.id, "t");
        assert_eq!(summary.argv, vec!["/bin/sh".to_string(), "-i".to_string()]);
        assert!(!summary.spawn_window);
        assert_eq!(summary.status, SessionStatus::Running);
        session.release();
    }
}
