//! Session lifecycle commands.

use tether_pty::{PollResult, PtyCommand, SessionSpec, Signal};

use crate::ipc::{ControlResponse, CreateSession};
use crate::state::AppState;

pub fn create_session(state: &AppState, req: CreateSession) -> Result<ControlResponse, String> {
    let terminal = &state.config.terminal;
    let mut command = match req.command {
        Some(program) => PtyCommand::new(program),
        None => PtyCommand::shell(),
    };
    command.args = req.args;
    command.cwd = req.cwd;
    command.env = req.env;

    let spec = SessionSpec {
        id: req.id,
        command,
        spawn_window: req.spawn_window,
        cols: req.cols.unwrap_or(terminal.default_cols),
        rows: req.rows.unwrap_or(terminal.default_rows),
    };
    let id = state
        .registry
        .create(spec)
        .map_err(|e| format!("failed to create session: {e}"))?;
    Ok(ControlResponse::Created { id })
}

pub fn list_sessions(state: &AppState) -> ControlResponse {
    ControlResponse::Sessions {
        sessions: state.registry.list(),
    }
}

pub fn write_input(
    state: &AppState,
    id: &str,
    text: Option<String>,
    bytes: Option<Vec<u8>>,
) -> Result<ControlResponse, String> {
    let data = match (text, bytes) {
        (Some(text), None) => text.into_bytes(),
        (None, Some(bytes)) => bytes,
        _ => return Err("failed to write input: exactly one of text or bytes is required".into()),
    };
    state
        .registry
        .write_input(id, &data)
        .map_err(|e| format!("failed to write input: {e}"))?;
    Ok(ControlResponse::Ok)
}

pub fn resize_session(
    state: &AppState,
    id: &str,
    cols: u16,
    rows: u16,
) -> Result<ControlResponse, String> {
    let revision = state
        .registry
        .resize(id, cols, rows)
        .map_err(|e| format!("failed to resize session: {e}"))?;
    Ok(ControlResponse::Resized { revision })
}

pub fn signal_session(state: &AppState, id: &str, signal: Signal) -> Result<ControlResponse, String> {
    let session = state
        .registry
        .get(id)
        .map_err(|e| format!("failed to signal session: {e}"))?;
    session
        .signal(signal)
        .map_err(|e| format!("failed to signal session: {e}"))?;
    Ok(ControlResponse::Ok)
}

pub async fn kill_session(state: &AppState, id: &str) -> Result<ControlResponse, String> {
    state
        .registry
        .kill(id)
        .await
        .map_err(|e| format!("failed to kill session: {e}"))?;
    Ok(ControlResponse::Ok)
}

pub async fn kill_all(state: &AppState) -> ControlResponse {
    ControlResponse::Killed {
        report: state.registry.kill_all().await,
    }
}

pub fn cleanup_session(state: &AppState, id: &str) -> Result<ControlResponse, String> {
    state
        .registry
        .cleanup(id)
        .map_err(|e| format!("failed to clean up session: {e}"))?;
    Ok(ControlResponse::CleanedUp {
        ids: vec![id.to_string()],
    })
}

pub fn cleanup_all_exited(state: &AppState) -> ControlResponse {
    ControlResponse::CleanedUp {
        ids: state.registry.cleanup_all_exited(),
    }
}

pub fn snapshot(state: &AppState, id: &str) -> Result<ControlResponse, String> {
    let session = state
        .registry
        .get(id)
        .map_err(|e| format!("failed to snapshot session: {e}"))?;
    Ok(ControlResponse::Snapshot {
        snapshot: session.snapshot(),
    })
}

pub fn poll(state: &AppState, id: &str, since: u64) -> Result<ControlResponse, String> {
    let session = state
        .registry
        .get(id)
        .map_err(|e| format!("failed to poll session: {e}"))?;
    Ok(match session.poll(since) {
        PollResult::Unchanged { revision } => ControlResponse::Unchanged { revision },
        PollResult::Update(diff) => ControlResponse::Update { diff },
        PollResult::Snapshot(snapshot) => ControlResponse::Snapshot { snapshot },
    })
}
