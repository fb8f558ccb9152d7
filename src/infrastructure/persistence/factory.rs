//! Store factory - Creates the session store selected by configuration

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};

use crate::application::ports::outbound::SessionStorePort;
use crate::infrastructure::config::StoreConfig;
use crate::infrastructure::persistence::{InMemorySessionStore, SqliteSessionStore};

/// Build the configured backend ("memory" or "sqlite")
pub async fn create_session_store(config: &StoreConfig) -> Result<Arc<dyn SessionStorePort>> {
    match config.backend.as_str() {
        "memory" => {
            tracing::info!("Using in-memory session store");
            Ok(Arc::new(InMemorySessionStore::new()))
        }
        "sqlite" => {
            if let Some(parent) = Path::new(&config.sqlite_path).parent() {
                if !parent.as_os_str().is_empty() {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .with_context(|| format!("Failed to create {}", parent.display()))?;
                }
            }

            let options = SqliteConnectOptions::new()
                .filename(&config.sqlite_path)
                .create_if_missing(true);
            let pool = SqlitePoolOptions::new()
                .max_connections(5)
                .connect_with(options)
                .await
                .with_context(|| format!("Failed to open SQLite database at {}", config.sqlite_path))?;

            let store = SqliteSessionStore::new(pool)
                .await
                .context("Failed to initialize session tables")?;
            tracing::info!(path = %config.sqlite_path, "Using SQLite session store");
            Ok(Arc::new(store))
        }
        other => anyhow::bail!("Unknown STORE_BACKEND '{other}' (expected 'memory' or 'sqlite')"),
    }
}
