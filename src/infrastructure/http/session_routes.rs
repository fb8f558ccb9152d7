use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;

use crate::application::dto::{
    ActorRequestDto, CreateSessionRequestDto, SessionSnapshot, SessionSummaryDto,
};
use crate::application::services::{JoinRequest, ReplayCursor};
use crate::domain::entities::EventRecord;
use crate::domain::value_objects::{SessionId, TableId, UserId};
use crate::infrastructure::http::error_response;
use crate::infrastructure::state::AppState;

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    pub user_id: String,
    /// Events with a greater sequence than this
    pub after: Option<u64>,
    /// The most recent N events
    pub last: Option<usize>,
}

fn parse_session_id(id: &str) -> Result<SessionId, (StatusCode, String)> {
    SessionId::parse(id).ok_or_else(|| (StatusCode::BAD_REQUEST, "Invalid session ID".to_string()))
}

/// List live and recently ended sessions.
pub async fn list_sessions(State(state): State<Arc<AppState>>) -> Json<Vec<SessionSummaryDto>> {
    Json(state.coordinator.list_sessions().await)
}

pub async fn create_session(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateSessionRequestDto>,
) -> Result<(StatusCode, Json<SessionSnapshot>), (StatusCode, String)> {
    let table_id = TableId::parse(&req.table_id)
        .ok_or_else(|| (StatusCode::BAD_REQUEST, "Invalid table ID".to_string()))?;
    let gm = JoinRequest {
        user_id: UserId::new(req.gm_user_id.clone()),
        display_name: req.gm_display_name.unwrap_or(req.gm_user_id),
        character: None,
    };

    let snapshot = state
        .coordinator
        .create_session(table_id, gm, req.scheduled)
        .await
        .map_err(error_response)?;
    Ok((StatusCode::CREATED, Json(snapshot.as_ref().clone())))
}

pub async fn activate_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<ActorRequestDto>,
) -> Result<Json<SessionSnapshot>, (StatusCode, String)> {
    let session_id = parse_session_id(&id)?;
    let snapshot = state
        .coordinator
        .activate_session(session_id, &UserId::new(req.user_id))
        .await
        .map_err(error_response)?;
    Ok(Json(snapshot.as_ref().clone()))
}

pub async fn get_snapshot(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<SessionSnapshot>, (StatusCode, String)> {
    let session_id = parse_session_id(&id)?;
    let snapshot = state
        .coordinator
        .get_snapshot(session_id)
        .await
        .map_err(error_response)?;
    Ok(Json(snapshot.as_ref().clone()))
}

/// Event history as `user_id` is allowed to see it
pub async fn read_events(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<Vec<EventRecord>>, (StatusCode, String)> {
    let session_id = parse_session_id(&id)?;
    let cursor = match (query.after, query.last) {
        (Some(_), Some(_)) => {
            return Err((
                StatusCode::BAD_REQUEST,
                "Use either 'after' or 'last', not both".to_string(),
            ))
        }
        (Some(after), None) => ReplayCursor::Since(after),
        (None, Some(last)) => ReplayCursor::Last(last),
        (None, None) => ReplayCursor::Last(state.config.session.replay_limit),
    };

    let events = state
        .coordinator
        .read_events(session_id, &UserId::new(query.user_id), cursor)
        .await
        .map_err(error_response)?;
    Ok(Json(events))
}

pub async fn end_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<ActorRequestDto>,
) -> Result<Json<SessionSnapshot>, (StatusCode, String)> {
    let session_id = parse_session_id(&id)?;
    let snapshot = state
        .coordinator
        .end_session(session_id, &UserId::new(req.user_id))
        .await
        .map_err(error_response)?;
    Ok(Json(snapshot.as_ref().clone()))
}
