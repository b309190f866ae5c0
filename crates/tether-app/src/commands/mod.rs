//! Handlers for one-shot control requests.
//!
//! Every failure is reported to the client as an `error` response naming the
//! operation that failed.

pub mod preferences;
pub mod session;

use crate::ipc::{ControlRequest, ControlResponse};
use crate::logging;
use crate::state::AppState;

/// Run a request that yields a single response.
///
/// `attach` and `notifications` change the connection into a stream and are
/// handled by the server before dispatch.
pub async fn dispatch(state: &AppState, request: ControlRequest) -> ControlResponse {
    let result = match request {
        ControlRequest::Create(req) => session::create_session(state, req),
        ControlRequest::List => Ok(session::list_sessions(state)),
        ControlRequest::Input { id, text, bytes } => session::write_input(state, &id, text, bytes),
        ControlRequest::Resize { id, cols, rows } => {
            session::resize_session(state, &id, cols, rows)
        }
        ControlRequest::Signal { id, signal } => session::signal_session(state, &id, signal),
        ControlRequest::Kill { id } => session::kill_session(state, &id).await,
        ControlRequest::KillAll => Ok(session::kill_all(state).await),
        ControlRequest::Cleanup { id } => session::cleanup_session(state, &id),
        ControlRequest::CleanupAllExited => Ok(session::cleanup_all_exited(state)),
        ControlRequest::Snapshot { id } => session::snapshot(state, &id),
        ControlRequest::Poll { id, since } => session::poll(state, &id, since),
        ControlRequest::GetPreferences => Ok(preferences::get_preferences(state)),
        ControlRequest::SetPreferences { patch } => {
            preferences::set_preferences(state, patch).await
        }
        ControlRequest::Log {
            client,
            level,
            message,
        } => {
            logging::log_client(&client, logging::parse_level(&level), &message);
            Ok(ControlResponse::Ok)
        }
        ControlRequest::Attach { .. } | ControlRequest::Notifications => {
            Err("streaming requests must be the first request on a connection".into())
        }
    };
    result.unwrap_or_else(ControlResponse::error)
}
