//! Notification preference commands. Changes are persisted before they are
//! published to the gate.

use std::sync::Arc;

use tether_notify::PreferencesPatch;

use crate::ipc::ControlResponse;
use crate::state::AppState;

pub fn get_preferences(state: &AppState) -> ControlResponse {
    ControlResponse::Preferences {
        preferences: state.preferences.current(),
    }
}

/// Merge `patch` into the live preferences, persist the result, then publish
/// it. The db lock is held throughout so concurrent patches all land.
pub async fn set_preferences(
    state: &AppState,
    patch: PreferencesPatch,
) -> Result<ControlResponse, String> {
    let db = Arc::clone(&state.db);
    let preferences = Arc::clone(&state.preferences);
    let updated = tokio::task::spawn_blocking(move || {
        let conn = db.lock().map_err(|e| format!("db lock poisoned: {e}"))?;
        let mut updated = preferences.current();
        updated.merge(&patch);
        tether_db::preferences::save(&conn, &updated)
            .map_err(|e| format!("failed to save preferences: {e}"))?;
        preferences.replace(updated.clone());
        Ok::<_, String>(updated)
    })
    .await
    .map_err(|e| format!("task join error: {e}"))??;

    Ok(ControlResponse::Preferences {
        preferences: updated,
    })
}
