//! Shared application state

use std::sync::Arc;

use anyhow::Result;

use crate::application::services::SessionCoordinator;
use crate::infrastructure::clock::SystemClock;
use crate::infrastructure::config::AppConfig;
use crate::infrastructure::identity::TableRoster;
use crate::infrastructure::persistence::create_session_store;

/// Shared application state
pub struct AppState {
    pub config: AppConfig,
    pub coordinator: Arc<SessionCoordinator>,
    /// Role grants per table; also the coordinator's identity port
    pub roster: Arc<TableRoster>,
}

impl AppState {
    pub async fn new(config: AppConfig) -> Result<Self> {
        let store = create_session_store(&config.store).await?;
        let roster = Arc::new(TableRoster::new(config.open_enrollment));

        let coordinator = Arc::new(SessionCoordinator::new(
            store,
            roster.clone(),
            Arc::new(SystemClock::new()),
            config.session.coordinator_settings()?,
        ));

        Ok(Self::from_parts(config, coordinator, roster))
    }

    pub fn from_parts(
        config: AppConfig,
        coordinator: Arc<SessionCoordinator>,
        roster: Arc<TableRoster>,
    ) -> Self {
        Self {
            config,
            coordinator,
            roster,
        }
    }
}

#[cfg(test)]
impl AppState {
    /// In-memory state with open enrollment and a real clock
    pub fn for_tests() -> Arc<Self> {
        use crate::infrastructure::config::{SessionConfig, StoreConfig};
        use crate::infrastructure::persistence::InMemorySessionStore;

        let config = AppConfig {
            server_port: 0,
            session: SessionConfig {
                turn_duration_secs: 60,
                event_buffer_capacity: 64,
                subscriber_channel_capacity: 16,
                replay_limit: 50,
                max_conflict_retries: 2,
                ended_session_retention_hours: 24,
                cleanup_interval_secs: 3600,
            },
            store: StoreConfig {
                backend: "memory".to_string(),
                sqlite_path: String::new(),
            },
            open_enrollment: true,
        };
        let roster = Arc::new(TableRoster::new(config.open_enrollment));
        let coordinator = Arc::new(SessionCoordinator::new(
            Arc::new(InMemorySessionStore::new()),
            roster.clone(),
            Arc::new(SystemClock::new()),
            config.session.coordinator_settings().unwrap(),
        ));
        Arc::new(Self::from_parts(config, coordinator, roster))
    }
}
