//! HTTP REST API routes

mod roster_routes;
mod session_routes;

use axum::{
    http::StatusCode,
    routing::{get, post, put},
    Router,
};
use std::sync::Arc;

use crate::application::services::SessionError;
use crate::infrastructure::state::AppState;

/// Create all API routes
pub fn create_routes() -> Router<Arc<AppState>> {
    Router::new()
        // Session routes
        .route("/api/sessions", get(session_routes::list_sessions))
        .route("/api/sessions", post(session_routes::create_session))
        .route(
            "/api/sessions/{id}/activate",
            post(session_routes::activate_session),
        )
        .route(
            "/api/sessions/{id}/snapshot",
            get(session_routes::get_snapshot),
        )
        .route("/api/sessions/{id}/events", get(session_routes::read_events))
        .route("/api/sessions/{id}/end", post(session_routes::end_session))
        // Roster routes
        .route(
            "/api/tables/{table_id}/roster/{user_id}",
            put(roster_routes::grant_role).delete(roster_routes::revoke_role),
        )
}

/// Map a coordinator error to a status and a `CODE: message` body
pub(crate) fn error_response(err: SessionError) -> (StatusCode, String) {
    let status = match &err {
        SessionError::InvalidNotation(_)
        | SessionError::OutOfRange(_)
        | SessionError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        SessionError::Unauthorized { .. } => StatusCode::UNAUTHORIZED,
        SessionError::Forbidden(_) => StatusCode::FORBIDDEN,
        SessionError::SessionNotFound(_) => StatusCode::NOT_FOUND,
        SessionError::NoActiveTurn | SessionError::ConflictRetry(_) => StatusCode::CONFLICT,
        SessionError::SessionEnded(_) => StatusCode::GONE,
        SessionError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        tracing::error!(error = %err, "Request failed");
    }
    (status, format!("{}: {}", err.code(), err))
}
