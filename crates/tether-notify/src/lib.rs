//! tether-notify: turns terminal activity into user notifications.
//!
//! # Architecture
//!
//! - [`EventClassifier`]: Per-session state machine fed with PTY output,
//!   submitted input and lifecycle changes. Emits [`NotificationEvent`]s.
//! - [`PromptMatcher`]: Pluggable heuristics that find command boundaries and
//!   agent turns in scanned output.
//! - [`NotificationGate`]: Applies the user's [`NotificationPreferences`]
//!   before delivery.

pub mod classifier;
pub mod event;
pub mod gate;
pub mod matcher;
pub mod scan;

pub use classifier::{ClassifierConfig, EventClassifier, DEFAULT_LONG_COMMAND_THRESHOLD};
pub use event::{NotificationEvent, NotificationKind, NotificationPayload};
pub use gate::{
    Notification, NotificationGate, NotificationPreferences, PreferencesHandle, PreferencesPatch,
    PREFERENCES_VERSION,
};
pub use matcher::{
    AgentPromptMatcher, PromptMark, PromptMatcher, RegexPromptMatcher, ShellIntegrationMatcher,
    DEFAULT_AGENT_PATTERNS, DEFAULT_PROMPT_PATTERN,
};
pub use scan::{OutputScanner, Scan};
