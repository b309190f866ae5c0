//! Fan-out of one session's terminal buffer to any number of subscribers.
//!
//! The driver publishes each new [`Frame`] into a watch channel; it never
//! waits on subscribers. Each [`Subscription`] remembers the last frame it
//! delivered and, when woken, diffs straight to the newest frame, so a slow
//! subscriber skips intermediate states instead of queueing them.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tether_vt::{Frame, FrameDiff, Snapshot, TerminalBuffer};
use tokio::sync::watch;

use crate::pty::ExitStatus;

/// A terminal buffer shared between the driver and readers.
#[derive(Clone)]
pub struct SharedBuffer(Arc<Mutex<TerminalBuffer>>);

impl SharedBuffer {
    pub fn new(buffer: TerminalBuffer) -> Self {
        Self(Arc::new(Mutex::new(buffer)))
    }

    /// Lock the buffer. A panic while holding the lock leaves the buffer
    /// usable, so poisoning is ignored.
    pub fn lock(&self) -> MutexGuard<'_, TerminalBuffer> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// How a subscriber wants updates rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionMode {
    /// Row diffs with styled cells.
    Binary,
    /// The whole visible screen as text on every update.
    Text,
}

/// One message to a subscriber.
#[derive(Debug, Clone)]
pub enum SubscriptionMessage {
    /// Full state; the subscriber's new baseline.
    Snapshot(Snapshot),
    /// Changes from the previously delivered revision (binary mode).
    Update(FrameDiff),
    /// The complete visible screen (text mode).
    Screen(Arc<Frame>),
    /// The process exited. Always the last message.
    Exit(ExitStatus),
}

/// Result of a pull-mode poll.
#[derive(Debug, Clone)]
pub enum PollResult {
    Unchanged { revision: u64 },
    Update(FrameDiff),
    Snapshot(Snapshot),
}

#[derive(Debug, Clone)]
struct Published {
    frame: Arc<Frame>,
    exit: Option<ExitStatus>,
}

/// Driver side of the fan-out.
pub struct Publisher {
    tx: watch::Sender<Published>,
    buffer: SharedBuffer,
}

impl Publisher {
    pub fn new(buffer: SharedBuffer) -> Self {
        let frame = buffer.lock().frame();
        let (tx, _rx) = watch::channel(Published { frame, exit: None });
        Self { tx, buffer }
    }

    /// Make `frame` the newest state. Older or equal revisions are ignored.
    pub fn publish(&self, frame: Arc<Frame>) {
        self.tx.send_if_modified(|published| {
            if frame.revision <= published.frame.revision {
                return false;
            }
            published.frame = frame;
            true
        });
    }

    /// Publish the final frame together with the exit marker.
    pub fn publish_exit(&self, frame: Arc<Frame>, exit: ExitStatus) {
        self.tx.send_modify(|published| {
            if frame.revision > published.frame.revision {
                published.frame = frame;
            }
            published.exit = Some(exit);
        });
    }

    pub fn latest(&self) -> Arc<Frame> {
        Arc::clone(&self.tx.borrow().frame)
    }

    pub fn attach(&self, mode: SubscriptionMode) -> Subscription {
        Subscription {
            rx: Some(self.tx.subscribe()),
            buffer: self.buffer.clone(),
            mode,
            last: None,
            closed: false,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Pull-mode read: what changed since `since`.
    pub fn poll(&self, since: u64) -> PollResult {
        let mut buffer = self.buffer.lock();
        let revision = buffer.revision();
        if since == revision {
            return PollResult::Unchanged { revision };
        }
        if since < revision {
            if let Some(diff) = buffer.diff_since(since) {
                return PollResult::Update(diff);
            }
        }
        PollResult::Snapshot(buffer.snapshot())
    }
}

/// A live view of one session. Dropping it detaches.
pub struct Subscription {
    rx: Option<watch::Receiver<Published>>,
    buffer: SharedBuffer,
    mode: SubscriptionMode,
    last: Option<Arc<Frame>>,
    closed: bool,
}

impl Subscription {
    pub fn mode(&self) -> SubscriptionMode {
        self.mode
    }

    /// Revision of the last frame handed out.
    pub fn last_revision(&self) -> Option<u64> {
        self.last.as_ref().map(|frame| frame.revision)
    }

    /// Wait for the next message. `None` once detached or after `Exit`.
    pub async fn next(&mut self) -> Option<SubscriptionMessage> {
        loop {
            let (frame, exit) = {
                let rx = self.rx.as_mut()?;
                let published = rx.borrow_and_update();
                (Arc::clone(&published.frame), published.exit.clone())
            };

            let Some(last) = &self.last else {
                return Some(self.resync());
            };
            if frame.revision > last.revision {
                return Some(self.advance_to(frame));
            }
            if let Some(exit) = exit {
                self.detach();
                return Some(SubscriptionMessage::Exit(exit));
            }
            if self.closed {
                self.detach();
                return None;
            }

            let rx = self.rx.as_mut()?;
            if rx.changed().await.is_err() {
                // Look at the final value once more before giving up.
                self.closed = true;
            }
        }
    }

    /// Stop receiving. Safe to call more than once.
    pub fn detach(&mut self) {
        self.rx = None;
    }

    pub fn is_attached(&self) -> bool {
        self.rx.is_some()
    }

    fn resync(&mut self) -> SubscriptionMessage {
        let snapshot = self.buffer.lock().snapshot();
        self.last = Some(Arc::new(snapshot.frame.clone()));
        SubscriptionMessage::Snapshot(snapshot)
    }

    fn advance_to(&mut self, frame: Arc<Frame>) -> SubscriptionMessage {
        match self.mode {
            SubscriptionMode::Text => {
                self.last = Some(Arc::clone(&frame));
                SubscriptionMessage::Screen(frame)
            }
            SubscriptionMode::Binary => {
                let diff = self.last.as_ref().and_then(|last| last.diff_to(&frame));
                match diff {
                    Some(diff) => {
                        self.last = Some(frame);
                        SubscriptionMessage::Update(diff)
                    }
                    None => self.resync(),
                }
            }
        }
    }
}
