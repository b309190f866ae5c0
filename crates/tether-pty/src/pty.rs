use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};

use log::{debug, trace, warn};
use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Errors from PTY operations.
#[derive(Debug, thiserror::Error)]
pub enum PtyError {
    #[error("failed to spawn process: {0}")]
    Spawn(String),
    #[error("process is not running")]
    ProcessNotRunning,
    #[error("invalid geometry {cols}x{rows}")]
    InvalidGeometry { cols: u16, rows: u16 },
    #[error("PTY I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// What to run inside a PTY.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PtyCommand {
    /// Program to run; `None` runs the user's default shell.
    pub program: Option<String>,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    /// Environment overrides on top of the daemon's environment.
    pub env: Vec<(String, String)>,
}

impl PtyCommand {
    pub fn shell() -> Self {
        Self::default()
    }

    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: Some(program.into()),
            ..Self::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Program path after applying the default shell.
    pub fn resolved_program(&self) -> String {
        self.program.clone().unwrap_or_else(default_shell)
    }

    /// argv as it will be executed.
    pub fn argv(&self) -> Vec<String> {
        std::iter::once(self.resolved_program())
            .chain(self.args.iter().cloned())
            .collect()
    }

    fn to_builder(&self) -> CommandBuilder {
        let mut cmd = CommandBuilder::new(self.resolved_program());
        cmd.args(&self.args);
        if let Some(cwd) = &self.cwd {
            cmd.cwd(cwd);
        }
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        cmd
    }
}

/// Signals deliverable to the child.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Signal {
    Interrupt,
    Terminate,
    Hangup,
    Kill,
}

impl Signal {
    fn as_raw(self) -> libc::c_int {
        match self {
            Signal::Interrupt => libc::SIGINT,
            Signal::Terminate => libc::SIGTERM,
            Signal::Hangup => libc::SIGHUP,
            Signal::Kill => libc::SIGKILL,
        }
    }
}

/// How the child ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitStatus {
    pub code: i32,
    /// Name of the terminating signal, if the child was killed by one.
    pub signal: Option<String>,
}

impl ExitStatus {
    /// Exit code used when the PTY failed before the child's status was known.
    pub const READ_FAILURE_CODE: i32 = -1;

    pub fn code(code: i32) -> Self {
        Self { code, signal: None }
    }

    pub fn read_failure() -> Self {
        Self::code(Self::READ_FAILURE_CODE)
    }

    pub fn success(&self) -> bool {
        self.code == 0 && self.signal.is_none()
    }
}

impl From<portable_pty::ExitStatus> for ExitStatus {
    fn from(status: portable_pty::ExitStatus) -> Self {
        Self {
            code: status.exit_code() as i32,
            signal: status.signal().map(str::to_string),
        }
    }
}

/// Produced by the reader and waiter threads. Output chunks are ordered;
/// `Exited` can arrive before the stream is `Closed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PtyEvent {
    Output(Vec<u8>),
    /// The output stream ended; `Some` carries a read error.
    Closed(Option<String>),
    Exited(ExitStatus),
}

/// Control half of a spawned process. Output arrives separately as
/// [`PtyEvent`]s.
pub trait PtyProcess: Send {
    fn pid(&self) -> Option<u32>;

    fn write(&mut self, data: &[u8]) -> Result<(), PtyError>;

    fn resize(&mut self, cols: u16, rows: u16) -> Result<(), PtyError>;

    fn signal(&mut self, signal: Signal) -> Result<(), PtyError>;

    fn force_kill(&mut self) -> Result<(), PtyError>;

    /// Kill the child if alive and close the master.
    fn release(&mut self);
}

/// A freshly spawned process and the stream of its events.
pub struct SpawnedPty {
    pub process: Box<dyn PtyProcess>,
    pub events: mpsc::UnboundedReceiver<PtyEvent>,
}

/// Spawns processes on pseudo-terminals.
pub trait PtyBackend: Send + Sync {
    fn spawn(&self, command: &PtyCommand, cols: u16, rows: u16) -> Result<SpawnedPty, PtyError>;
}

/// Backend on the host's native PTY system.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativePtyBackend;

impl PtyBackend for NativePtyBackend {
    fn spawn(&self, command: &PtyCommand, cols: u16, rows: u16) -> Result<SpawnedPty, PtyError> {
        validate_geometry(cols, rows)?;
        let pty_system = native_pty_system();

        let pair = pty_system
            .openpty(pty_size(cols, rows))
            .map_err(|e| PtyError::Spawn(format!("failed to open PTY: {e}")))?;

        let child = pair
            .slave
            .spawn_command(command.to_builder())
            .map_err(|e| PtyError::Spawn(format!("{}: {e}", command.resolved_program())))?;
        // Only the child keeps the slave open, so its exit closes the stream.
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| PtyError::Spawn(format!("failed to clone reader: {e}")))?;

        let writer = pair
            .master
            .take_writer()
            .map_err(|e| PtyError::Spawn(format!("failed to take writer: {e}")))?;

        let pid = child.process_id();
        let killer = child.clone_killer();
        let (tx, events) = mpsc::unbounded_channel();

        let label = pid.map_or_else(|| "?".to_string(), |pid| pid.to_string());
        start_reader_thread(&label, reader, tx.clone())?;
        start_waiter_thread(&label, child, tx)?;
        debug!("spawned {:?} (pid {label}) at {cols}x{rows}", command.argv());

        Ok(SpawnedPty {
            process: Box::new(NativeProcess {
                master: Some(pair.master),
                writer: Some(writer),
                killer,
                pid,
            }),
            events,
        })
    }
}

struct NativeProcess {
    master: Option<Box<dyn MasterPty + Send>>,
    writer: Option<Box<dyn Write + Send>>,
    killer: Box<dyn ChildKiller + Send + Sync>,
    pid: Option<u32>,
}

impl PtyProcess for NativeProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn write(&mut self, data: &[u8]) -> Result<(), PtyError> {
        let writer = self.writer.as_mut().ok_or(PtyError::ProcessNotRunning)?;
        writer.write_all(data)?;
        writer.flush()?;
        Ok(())
    }

    fn resize(&mut self, cols: u16, rows: u16) -> Result<(), PtyError> {
        let master = self.master.as_ref().ok_or(PtyError::ProcessNotRunning)?;
        master
            .resize(pty_size(cols, rows))
            .map_err(|e| PtyError::Io(std::io::Error::other(e.to_string())))
    }

    fn signal(&mut self, signal: Signal) -> Result<(), PtyError> {
        let pid = self.pid.ok_or(PtyError::ProcessNotRunning)?;
        // SAFETY: kill(2) has no memory-safety preconditions.
        let rc = unsafe { libc::kill(pid as libc::pid_t, signal.as_raw()) };
        if rc == 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            Err(PtyError::ProcessNotRunning)
        } else {
            Err(PtyError::Io(err))
        }
    }

    fn force_kill(&mut self) -> Result<(), PtyError> {
        match self.pid {
            Some(_) => self.signal(Signal::Kill),
            None => self.killer.kill().map_err(PtyError::Io),
        }
    }

    fn release(&mut self) {
        if self.master.is_none() {
            return;
        }
        if let Err(err) = self.killer.kill() {
            trace!("release: kill failed (child likely gone): {err}");
        }
        self.writer = None;
        self.master = None;
    }
}

fn start_reader_thread(
    label: &str,
    mut reader: Box<dyn Read + Send>,
    tx: mpsc::UnboundedSender<PtyEvent>,
) -> Result<(), PtyError> {
    std::thread::Builder::new()
        .name(format!("pty-read-{label}"))
        .spawn(move || {
            let mut buf = [0u8; 65536];
            let closed = loop {
                match reader.read(&mut buf) {
                    Ok(0) => break None,
                    Ok(n) => {
                        if tx.send(PtyEvent::Output(buf[..n].to_vec())).is_err() {
                            return;
                        }
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                    // Linux reports a hung-up master as EIO.
                    Err(err) if err.raw_os_error() == Some(libc::EIO) => break None,
                    Err(err) => break Some(err.to_string()),
                }
            };
            let _ = tx.send(PtyEvent::Closed(closed));
        })
        .map(|_| ())
        .map_err(|e| PtyError::Spawn(format!("failed to start reader thread: {e}")))
}

fn start_waiter_thread(
    label: &str,
    mut child: Box<dyn Child + Send + Sync>,
    tx: mpsc::UnboundedSender<PtyEvent>,
) -> Result<(), PtyError> {
    std::thread::Builder::new()
        .name(format!("pty-wait-{label}"))
        .spawn(move || {
            let status = match child.wait() {
                Ok(status) => ExitStatus::from(status),
                Err(err) => {
                    warn!("waiting for child failed: {err}");
                    ExitStatus::read_failure()
                }
            };
            let _ = tx.send(PtyEvent::Exited(status));
        })
        .map(|_| ())
        .map_err(|e| PtyError::Spawn(format!("failed to start waiter thread: {e}")))
}

/// Owns one session's process. Writes and resizes are serialized through
/// the handle's mutex.
pub struct PtyHandle {
    process: Mutex<Option<Box<dyn PtyProcess>>>,
    pid: Option<u32>,
}

impl PtyHandle {
    pub fn new(process: Box<dyn PtyProcess>) -> Self {
        let pid = process.pid();
        Self {
            process: Mutex::new(Some(process)),
            pid,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn lock(&self) -> MutexGuard<'_, Option<Box<dyn PtyProcess>>> {
        self.process.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_process<R>(
        &self,
        f: impl FnOnce(&mut dyn PtyProcess) -> Result<R, PtyError>,
    ) -> Result<R, PtyError> {
        let mut guard = self.lock();
        let process = guard.as_mut().ok_or(PtyError::ProcessNotRunning)?;
        f(process.as_mut())
    }

    /// Write bytes to the PTY master (user input -> process).
    pub fn write(&self, data: &[u8]) -> Result<(), PtyError> {
        self.with_process(|p| p.write(data))
    }

    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), PtyError> {
        validate_geometry(cols, rows)?;
        self.with_process(|p| p.resize(cols, rows))
    }

    pub fn signal(&self, signal: Signal) -> Result<(), PtyError> {
        self.with_process(|p| p.signal(signal))
    }

    pub fn force_kill(&self) -> Result<(), PtyError> {
        self.with_process(|p| p.force_kill())
    }

    /// The child has exited: later writes and resizes fail with
    /// [`PtyError::ProcessNotRunning`].
    pub fn mark_exited(&self) {
        // The child is already reaped; closing the master must not signal
        // a pid that may have been reused.
        drop(self.lock().take());
    }

    pub fn is_released(&self) -> bool {
        self.lock().is_none()
    }

    /// Kill the child if still alive and drop the master. Idempotent.
    pub fn release(&self) {
        if let Some(mut process) = self.lock().take() {
            process.release();
        }
    }
}

impl Drop for PtyHandle {
    fn drop(&mut self) {
        self.release();
    }
}

pub(crate) fn validate_geometry(cols: u16, rows: u16) -> Result<(), PtyError> {
    if cols == 0 || rows == 0 {
        return Err(PtyError::InvalidGeometry { cols, rows });
    }
    Ok(())
}

fn pty_size(cols: u16, rows: u16) -> PtySize {
    PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

/// Returns the user's default shell, falling back to `/bin/sh`.
pub fn default_shell() -> String {
    std::env::var("SHELL")
        .ok()
        .filter(|shell| !shell.is_empty())
        .unwrap_or_else(|| "/bin/sh".to_string())
}
