//! Table roster - In-process stand-in for the identity provider
//!
//! Holds explicit role grants per table. With open enrollment, anyone without
//! a grant resolves as a player; otherwise they are not a member.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::application::ports::outbound::IdentityPort;
use crate::domain::entities::ParticipantRole;
use crate::domain::value_objects::{TableId, UserId};

pub struct TableRoster {
    grants: RwLock<HashMap<TableId, HashMap<UserId, ParticipantRole>>>,
    open_enrollment: bool,
}

impl TableRoster {
    pub fn new(open_enrollment: bool) -> Self {
        Self {
            grants: RwLock::new(HashMap::new()),
            open_enrollment,
        }
    }

    pub async fn grant(&self, table_id: TableId, user_id: UserId, role: ParticipantRole) {
        tracing::info!(table_id = %table_id, user_id = %user_id, role = ?role, "Roster role granted");
        self.grants
            .write()
            .await
            .entry(table_id)
            .or_default()
            .insert(user_id, role);
    }

    /// Remove a grant; returns whether one existed
    pub async fn revoke(&self, table_id: TableId, user_id: &UserId) -> bool {
        let mut grants = self.grants.write().await;
        grants
            .get_mut(&table_id)
            .map(|table| table.remove(user_id).is_some())
            .unwrap_or(false)
    }
}

#[async_trait]
impl IdentityPort for TableRoster {
    async fn resolve_role(
        &self,
        table_id: TableId,
        user_id: &UserId,
    ) -> Option<ParticipantRole> {
        let grants = self.grants.read().await;
        let granted = grants.get(&table_id).and_then(|t| t.get(user_id)).copied();
        granted.or(self.open_enrollment.then_some(ParticipantRole::Player))
    }
}
