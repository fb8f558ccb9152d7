//! Identity port - Role lookup supplied by the identity provider
//!
//! The engine trusts the user id it is handed and only asks which role that
//! user holds at a table.

use async_trait::async_trait;

use crate::domain::entities::ParticipantRole;
use crate::domain::value_objects::{TableId, UserId};

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait IdentityPort: Send + Sync {
    /// Role the user holds at the table, or `None` when they are not a member
    async fn resolve_role(
        &self,
        table_id: TableId,
        user_id: &UserId,
    ) -> Option<ParticipantRole>;
}
