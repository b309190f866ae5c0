use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The closed set of notification-worthy things a session can do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NotificationKind {
    SessionStart,
    SessionExit,
    CommandError,
    CommandCompletion,
    Bell,
    #[serde(alias = "claudeTurn")]
    AgentTurn,
}

impl NotificationKind {
    pub const ALL: [NotificationKind; 6] = [
        NotificationKind::SessionStart,
        NotificationKind::SessionExit,
        NotificationKind::CommandError,
        NotificationKind::CommandCompletion,
        NotificationKind::Bell,
        NotificationKind::AgentTurn,
    ];
}

/// Extra data carried by an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum NotificationPayload {
    None,
    ExitCode {
        code: i32,
    },
    Elapsed {
        elapsed_ms: u64,
        exit_code: Option<i32>,
    },
}

impl NotificationPayload {
    pub fn elapsed(elapsed: Duration, exit_code: Option<i32>) -> Self {
        NotificationPayload::Elapsed {
            elapsed_ms: elapsed.as_millis() as u64,
            exit_code,
        }
    }
}

/// A classified event, produced once and consumed once by the gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationEvent {
    pub kind: NotificationKind,
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    pub payload: NotificationPayload,
}

impl NotificationEvent {
    pub fn new(kind: NotificationKind, session_id: &str, payload: NotificationPayload) -> Self {
        Self {
            kind,
            session_id: session_id.to_string(),
            timestamp: Utc::now(),
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_wire_names() {
        let json = serde_json::to_string(&NotificationKind::CommandCompletion).unwrap();
        assert_eq!(json, "\"commandCompletion\"");

        let legacy: NotificationKind = serde_json::from_str("\"claudeTurn\"").unwrap();
        assert_eq!(legacy, NotificationKind::AgentTurn);
    }

    #[test]
    fn test_elapsed_payload_in_millis() {
        let payload = NotificationPayload::elapsed(Duration::from_secs(5), Some(0));
        assert_eq!(
            payload,
            NotificationPayload::Elapsed {
                elapsed_ms: 5000,
                exit_code: Some(0)
            }
        );
    }
}
