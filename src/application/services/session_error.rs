//! Session errors - What the coordinator and event log report to callers
//!
//! Domain, dice and store failures are folded into one taxonomy here; the
//! transport layers only map it to status codes.

use crate::application::ports::outbound::StoreError;
use crate::domain::aggregates::TurnError;
use crate::domain::value_objects::{DiceError, SessionId, UserId};

/// Errors surfaced by the session coordinator and event log
#[derive(Debug, Clone, thiserror::Error)]
pub enum SessionError {
    #[error("Invalid dice notation: '{0}'")]
    InvalidNotation(String),

    #[error("{0}")]
    OutOfRange(String),

    #[error("{user_id} is not a participant of session {session_id}")]
    Unauthorized {
        session_id: SessionId,
        user_id: UserId,
    },

    #[error("{0} is not allowed to perform this action")]
    Forbidden(UserId),

    #[error("No turn is active")]
    NoActiveTurn,

    #[error("Session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("Session {0} has ended")]
    SessionEnded(SessionId),

    #[error("Session {0} kept changing underneath the operation; retry")]
    ConflictRetry(SessionId),

    /// A well-formed request that is not valid in the current state
    #[error("{0}")]
    InvalidRequest(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl SessionError {
    /// Stable machine-readable code for transports
    pub fn code(&self) -> &'static str {
        match self {
            SessionError::InvalidNotation(_) => "INVALID_NOTATION",
            SessionError::OutOfRange(_) => "OUT_OF_RANGE",
            SessionError::Unauthorized { .. } => "UNAUTHORIZED",
            SessionError::Forbidden(_) => "FORBIDDEN",
            SessionError::NoActiveTurn => "NO_ACTIVE_TURN",
            SessionError::SessionNotFound(_) => "SESSION_NOT_FOUND",
            SessionError::SessionEnded(_) => "SESSION_ENDED",
            SessionError::ConflictRetry(_) => "CONFLICT_RETRY",
            SessionError::InvalidRequest(_) => "INVALID_REQUEST",
            SessionError::Storage(_) => "STORAGE_ERROR",
        }
    }

    /// Map a scheduler rejection into the session taxonomy
    pub fn from_turn(session_id: SessionId, err: TurnError) -> Self {
        match err {
            TurnError::NoActiveTurn => SessionError::NoActiveTurn,
            TurnError::SessionEnded => SessionError::SessionEnded(session_id),
            other => SessionError::InvalidRequest(other.to_string()),
        }
    }
}

impl From<DiceError> for SessionError {
    fn from(err: DiceError) -> Self {
        match err {
            DiceError::InvalidNotation(notation) => SessionError::InvalidNotation(notation),
            out_of_range @ DiceError::OutOfRange { .. } => {
                SessionError::OutOfRange(out_of_range.to_string())
            }
        }
    }
}

impl From<StoreError> for SessionError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => SessionError::SessionNotFound(id),
            StoreError::VersionConflict { session_id, .. } => SessionError::ConflictRetry(session_id),
            other => SessionError::Storage(other.to_string()),
        }
    }
}
