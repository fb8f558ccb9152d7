//! Application configuration

use std::env;
use std::str::FromStr;

use anyhow::{Context, Result};

use crate::application::services::{CoordinatorSettings, EventLogSettings};

/// Application configuration loaded from environment
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// HTTP/WebSocket server port
    pub server_port: u16,

    pub session: SessionConfig,
    pub store: StoreConfig,

    /// Users missing from a table roster join as players
    pub open_enrollment: bool,
}

/// Timing and buffering of live sessions
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Length of one turn before it auto-advances
    pub turn_duration_secs: u64,
    /// Recent events kept in memory per session for replay
    pub event_buffer_capacity: usize,
    /// Live fan-out capacity before a slow subscriber lags
    pub subscriber_channel_capacity: usize,
    /// Cap on a "last N events" replay
    pub replay_limit: usize,
    /// Retries after an optimistic-concurrency conflict
    pub max_conflict_retries: u32,
    /// How long an ended session stays readable
    pub ended_session_retention_hours: u64,
    /// How often ended sessions are swept
    pub cleanup_interval_secs: u64,
}

/// Session store configuration
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Backend type: "memory" or "sqlite"
    pub backend: String,
    /// SQLite database file (used when backend is "sqlite")
    pub sqlite_path: String,
}

impl AppConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            server_port: parse_var("SERVER_PORT", "3000")?,
            session: SessionConfig::from_env()?,
            store: StoreConfig {
                backend: env::var("STORE_BACKEND").unwrap_or_else(|_| "sqlite".to_string()),
                sqlite_path: env::var("SQLITE_PATH")
                    .unwrap_or_else(|_| "./data/sessions.db".to_string()),
            },
            open_enrollment: parse_var("OPEN_ENROLLMENT", "true")?,
        })
    }
}

impl SessionConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            turn_duration_secs: parse_var("TURN_DURATION_SECS", "60")?,
            event_buffer_capacity: parse_var("EVENT_BUFFER_CAPACITY", "512")?,
            subscriber_channel_capacity: parse_var("SUBSCRIBER_CHANNEL_CAPACITY", "256")?,
            replay_limit: parse_var("REPLAY_LIMIT", "200")?,
            max_conflict_retries: parse_var("MAX_CONFLICT_RETRIES", "2")?,
            ended_session_retention_hours: parse_var("ENDED_SESSION_RETENTION_HOURS", "24")?,
            cleanup_interval_secs: parse_var("CLEANUP_INTERVAL_SECS", "3600")?,
        })
    }

    pub fn coordinator_settings(&self) -> Result<CoordinatorSettings> {
        Ok(CoordinatorSettings {
            turn_duration: duration_var(
                "TURN_DURATION_SECS",
                self.turn_duration_secs.max(1),
                chrono::Duration::try_seconds,
            )?,
            max_conflict_retries: self.max_conflict_retries,
            log: EventLogSettings {
                buffer_capacity: self.event_buffer_capacity,
                channel_capacity: self.subscriber_channel_capacity.max(1),
                replay_limit: self.replay_limit,
            },
            ended_retention: duration_var(
                "ENDED_SESSION_RETENTION_HOURS",
                self.ended_session_retention_hours,
                chrono::Duration::try_hours,
            )?,
        })
    }
}

/// Convert a count of `unit`s into a duration, rejecting values chrono cannot hold
fn duration_var(
    name: &str,
    value: u64,
    unit: fn(i64) -> Option<chrono::Duration>,
) -> Result<chrono::Duration> {
    i64::try_from(value)
        .ok()
        .and_then(unit)
        .with_context(|| format!("{name} is out of range: {value}"))
}

fn parse_var<T>(name: &str, default: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .with_context(|| format!("{name} has an invalid value"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coordinator_settings_from_session_config() {
        let config = SessionConfig {
            turn_duration_secs: 90,
            event_buffer_capacity: 10,
            subscriber_channel_capacity: 0,
            replay_limit: 5,
            max_conflict_retries: 3,
            ended_session_retention_hours: 2,
            cleanup_interval_secs: 60,
        };
        let settings = config.coordinator_settings().unwrap();
        assert_eq!(settings.turn_duration, chrono::Duration::seconds(90));
        assert_eq!(settings.log.channel_capacity, 1);
        assert_eq!(settings.log.replay_limit, 5);
        assert_eq!(settings.ended_retention, chrono::Duration::hours(2));
    }

    #[test]
    fn test_oversized_durations_are_rejected() {
        let mut config = SessionConfig {
            turn_duration_secs: 60,
            event_buffer_capacity: 10,
            subscriber_channel_capacity: 10,
            replay_limit: 5,
            max_conflict_retries: 2,
            ended_session_retention_hours: u64::MAX,
            cleanup_interval_secs: 60,
        };
        let err = config.coordinator_settings().unwrap_err();
        assert!(err.to_string().contains("ENDED_SESSION_RETENTION_HOURS"));

        config.ended_session_retention_hours = i64::MAX as u64;
        assert!(config.coordinator_settings().is_err());

        config.ended_session_retention_hours = 24;
        config.turn_duration_secs = u64::MAX / 2;
        let err = config.coordinator_settings().unwrap_err();
        assert!(err.to_string().contains("TURN_DURATION_SECS"));
    }

    #[test]
    fn test_parse_var_uses_default_and_rejects_garbage() {
        let port: u16 = parse_var("TABLETOP_TEST_UNSET_PORT", "3000").unwrap();
        assert_eq!(port, 3000);

        let bad: Result<u16> = parse_var("TABLETOP_TEST_UNSET_BAD", "not-a-port");
        assert!(bad.is_err());
    }
}
