//! tether-pty: terminal sessions and their lifecycle.
//!
//! This crate sits between the PTY (a real process) and the terminal buffer
//! (screen state). Each session's driver task reads process output, feeds it
//! into its `TerminalBuffer`, and fans new frames out to subscribers.
//!
//! # Architecture
//!
//! - [`PtyHandle`]: Process control: write, resize, signal, release.
//!   Spawning goes through a [`PtyBackend`].
//! - [`Session`]: A process, its buffer, classifier and subscribers.
//! - [`SessionRegistry`]: Owns all sessions: create, kill, cleanup.
//! - [`Publisher`] / [`Subscription`]: Snapshot-then-diff delivery to any
//!   number of viewers.

pub mod multiplexer;
pub mod pty;
pub mod registry;
pub mod session;

pub use multiplexer::{
    PollResult, Publisher, SharedBuffer, Subscription, SubscriptionMessage, SubscriptionMode,
};
pub use pty::{
    default_shell, ExitStatus, NativePtyBackend, PtyBackend, PtyCommand, PtyError, PtyEvent,
    PtyHandle, PtyProcess, Signal, SpawnedPty,
};
pub use registry::{KillReport, RegistryError, SessionRegistry};
pub use session::{
    KillOutcome, Session, SessionId, SessionOptions, SessionSpec, SessionStatus, SessionSummary,
};
