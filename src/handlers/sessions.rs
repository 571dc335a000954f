use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

/// `GET /api/v1/sessions`
pub async fn list_sessions(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let registry = state.relay.registry();
    let sessions = registry.summaries();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "count": sessions.len(),
        "busy": sessions.iter().filter(|s| s.busy).count(),
        "sessions": sessions
    })))
}

/// `GET /api/v1/sessions/{id}`
pub async fn get_session(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let session_id = path.into_inner();
    let session = state
        .relay
        .registry()
        .get(&session_id)
        .ok_or_else(|| AppError::NotFound(format!("Session '{}' not found", session_id)))?;

    Ok(HttpResponse::Ok().json(session.detail()))
}

/// `DELETE /api/v1/sessions/{id}`
///
/// The connected client, if any, receives `session_closed`.
pub async fn delete_session(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let session_id = path.into_inner();
    if !state.relay.destroy(&session_id) {
        return Err(AppError::NotFound(format!("Session '{}' not found", session_id)));
    }

    Ok(HttpResponse::Ok().json(json!({
        "status": "destroyed",
        "session_id": session_id,
        "timestamp": chrono::Utc::now().to_rfc3339()
    })))
}
