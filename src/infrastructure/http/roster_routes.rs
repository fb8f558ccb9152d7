//! Table roster routes
//!
//! Stand-in for the external identity service: grants decide who may run a
//! table as GM and, without open enrollment, who may join at all.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};

use crate::application::dto::GrantRoleRequestDto;
use crate::domain::value_objects::{TableId, UserId};
use crate::infrastructure::state::AppState;

fn parse_table_id(id: &str) -> Result<TableId, (StatusCode, String)> {
    TableId::parse(id).ok_or_else(|| (StatusCode::BAD_REQUEST, "Invalid table ID".to_string()))
}

pub async fn grant_role(
    State(state): State<Arc<AppState>>,
    Path((table_id, user_id)): Path<(String, String)>,
    Json(req): Json<GrantRoleRequestDto>,
) -> Result<StatusCode, (StatusCode, String)> {
    let table_id = parse_table_id(&table_id)?;
    state
        .roster
        .grant(table_id, UserId::new(user_id), req.role)
        .await;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn revoke_role(
    State(state): State<Arc<AppState>>,
    Path((table_id, user_id)): Path<(String, String)>,
) -> Result<StatusCode, (StatusCode, String)> {
    let table_id = parse_table_id(&table_id)?;
    if state.roster.revoke(table_id, &UserId::new(user_id)).await {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err((StatusCode::NOT_FOUND, "No grant for this user".to_string()))
    }
}
