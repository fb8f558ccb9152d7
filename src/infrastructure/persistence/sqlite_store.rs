//! SQLite session store
//!
//! Session state and events are stored as JSON documents; the columns beside
//! them exist for lookups and the version check.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;

use crate::application::ports::outbound::{SessionRecord, SessionStorePort, StoreError};
use crate::domain::entities::EventRecord;
use crate::domain::value_objects::SessionId;

pub struct SqliteSessionStore {
    pool: SqlitePool,
}

impl SqliteSessionStore {
    pub async fn new(pool: SqlitePool) -> Result<Self, sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS live_sessions (
                id TEXT PRIMARY KEY,
                table_id TEXT NOT NULL,
                lifecycle TEXT NOT NULL,
                version INTEGER NOT NULL,
                state TEXT NOT NULL,
                updated_at TIMESTAMP NOT NULL
            )
        "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS session_events (
                session_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                record TEXT NOT NULL,
                PRIMARY KEY (session_id, seq)
            )
        "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }
}

fn db_err(e: sqlx::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn from_json<T: serde::de::DeserializeOwned>(json: &str) -> Result<T, StoreError> {
    serde_json::from_str(json).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn events_from_rows(rows: Vec<(String,)>) -> Result<Vec<EventRecord>, StoreError> {
    rows.iter().map(|(json,)| from_json(json)).collect()
}

#[async_trait]
impl SessionStorePort for SqliteSessionStore {
    async fn create_session(&self, record: &SessionRecord) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO live_sessions (id, table_id, lifecycle, version, state, updated_at) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(record.session.id.to_string())
        .bind(record.session.table_id.to_string())
        .bind(record.session.lifecycle.as_str())
        .bind(record.version as i64)
        .bind(to_json(record)?)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn load_session(&self, id: SessionId) -> Result<Option<SessionRecord>, StoreError> {
        let row: Option<(String,)> = sqlx::query_as("SELECT state FROM live_sessions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.map(|(json,)| from_json(&json)).transpose()
    }

    async fn list_open_sessions(&self) -> Result<Vec<SessionRecord>, StoreError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT state FROM live_sessions WHERE lifecycle != 'ended' ORDER BY updated_at",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(|(json,)| from_json(json)).collect()
    }

    async fn list_ended_sessions(&self) -> Result<Vec<SessionRecord>, StoreError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT state FROM live_sessions WHERE lifecycle = 'ended' ORDER BY updated_at",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(|(json,)| from_json(json)).collect()
    }

    async fn save_session(
        &self,
        record: &SessionRecord,
        expected_version: u64,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE live_sessions SET lifecycle = ?, version = ?, state = ?, updated_at = ? WHERE id = ? AND version = ?",
        )
        .bind(record.session.lifecycle.as_str())
        .bind(record.version as i64)
        .bind(to_json(record)?)
        .bind(Utc::now())
        .bind(record.session.id.to_string())
        .bind(expected_version as i64)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            // Either gone or moved on; tell them apart for the caller
            let exists: Option<(i64,)> = sqlx::query_as("SELECT version FROM live_sessions WHERE id = ?")
                .bind(record.session.id.to_string())
                .fetch_optional(&self.pool)
                .await
                .map_err(db_err)?;
            return Err(match exists {
                Some(_) => StoreError::VersionConflict {
                    session_id: record.session.id,
                    expected: expected_version,
                },
                None => StoreError::NotFound(record.session.id),
            });
        }
        Ok(())
    }

    async fn append_event(&self, event: &EventRecord) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO session_events (session_id, seq, record) VALUES (?, ?, ?)")
            .bind(event.session_id.to_string())
            .bind(event.sequence as i64)
            .bind(to_json(event)?)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn events_since(
        &self,
        id: SessionId,
        after_seq: u64,
        limit: Option<usize>,
    ) -> Result<Vec<EventRecord>, StoreError> {
        // SQLite treats a negative LIMIT as unbounded
        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT record FROM session_events WHERE session_id = ? AND seq > ? ORDER BY seq LIMIT ?",
        )
        .bind(id.to_string())
        .bind(after_seq as i64)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        events_from_rows(rows)
    }

    async fn latest_events(&self, id: SessionId, n: usize) -> Result<Vec<EventRecord>, StoreError> {
        let mut rows: Vec<(String,)> = sqlx::query_as(
            "SELECT record FROM session_events WHERE session_id = ? ORDER BY seq DESC LIMIT ?",
        )
        .bind(id.to_string())
        .bind(n as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.reverse();
        events_from_rows(rows)
    }

    async fn last_sequence(&self, id: SessionId) -> Result<u64, StoreError> {
        let (last,): (Option<i64>,) =
            sqlx::query_as("SELECT MAX(seq) FROM session_events WHERE session_id = ?")
                .bind(id.to_string())
                .fetch_one(&self.pool)
                .await
                .map_err(db_err)?;
        Ok(last.unwrap_or(0).max(0) as u64)
    }

    async fn purge_session(&self, id: SessionId) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        sqlx::query("DELETE FROM session_events WHERE session_id = ?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        sqlx::query("DELETE FROM live_sessions WHERE id = ?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::aggregates::TurnScheduler;
    use crate::domain::entities::{
        EventDraft, Participant, ParticipantRole, SceneBoard, SceneUpdate, Session,
    };
    use crate::domain::value_objects::TableId;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn store() -> SqliteSessionStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        SqliteSessionStore::new(pool).await.unwrap()
    }

    fn record() -> SessionRecord {
        let now = Utc::now();
        let mut scheduler = TurnScheduler::new(chrono::Duration::seconds(60));
        scheduler.activate().unwrap();
        let mut scene = SceneBoard::new();
        scene.apply(
            SceneUpdate {
                image: Some("forest.jpg".into()),
                text: "You enter the forest.".into(),
                ..Default::default()
            },
            "gm".into(),
            now,
        );
        SessionRecord {
            session: Session::new(TableId::new(), "gm".into(), false, now),
            participants: vec![Participant::new("gm".into(), ParticipantRole::Gm, "GM", now)],
            scheduler,
            scene,
            version: 0,
        }
    }

    #[tokio::test]
    async fn test_record_survives_round_trip_through_json_column() {
        let store = store().await;
        let record = record();
        store.create_session(&record).await.unwrap();

        let loaded = store.load_session(record.session.id).await.unwrap().unwrap();
        assert_eq!(loaded, record);
        assert!(store.load_session(SessionId::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_versioned_save() {
        let store = store().await;
        let mut record = record();
        store.create_session(&record).await.unwrap();

        record.version = 1;
        store.save_session(&record, 0).await.unwrap();

        let result = store.save_session(&record, 0).await;
        assert!(matches!(result, Err(StoreError::VersionConflict { .. })));

        let mut unknown = self::record();
        unknown.version = 1;
        let result = store.save_session(&unknown, 0).await;
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_open_and_ended_listed_apart() {
        let store = store().await;
        let open = record();
        let mut ended = record();
        store.create_session(&open).await.unwrap();
        store.create_session(&ended).await.unwrap();

        ended.session.end(Utc::now());
        ended.version = 1;
        store.save_session(&ended, 0).await.unwrap();

        let listed = store.list_open_sessions().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].session.id, open.session.id);

        let listed = store.list_ended_sessions().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].session.id, ended.session.id);
        assert_eq!(listed[0].session.ended_at, ended.session.ended_at);
    }

    #[tokio::test]
    async fn test_events_are_ordered_and_unique() {
        let store = store().await;
        let id = SessionId::new();
        for seq in 1..=6 {
            let event = EventRecord::from_draft(id, seq, EventDraft::text("a".into(), format!("{seq}")), Utc::now());
            store.append_event(&event).await.unwrap();
        }

        let duplicate = EventRecord::from_draft(id, 3, EventDraft::text("a".into(), "dup"), Utc::now());
        assert!(store.append_event(&duplicate).await.is_err());

        let all = store.events_since(id, 0, None).await.unwrap();
        assert_eq!(all.iter().map(|e| e.sequence).collect::<Vec<_>>(), vec![1, 2, 3, 4, 5, 6]);

        let page = store.events_since(id, 2, Some(3)).await.unwrap();
        assert_eq!(page.iter().map(|e| e.sequence).collect::<Vec<_>>(), vec![3, 4, 5]);

        let latest = store.latest_events(id, 2).await.unwrap();
        assert_eq!(latest.iter().map(|e| e.sequence).collect::<Vec<_>>(), vec![5, 6]);

        assert_eq!(store.last_sequence(id).await.unwrap(), 6);
        assert_eq!(store.last_sequence(SessionId::new()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_purge_removes_state_and_events() {
        let store = store().await;
        let record = record();
        let id = record.session.id;
        store.create_session(&record).await.unwrap();
        let event = EventRecord::from_draft(id, 1, EventDraft::text("gm".into(), "hi"), Utc::now());
        store.append_event(&event).await.unwrap();

        store.purge_session(id).await.unwrap();
        assert!(store.load_session(id).await.unwrap().is_none());
        assert_eq!(store.last_sequence(id).await.unwrap(), 0);
    }
}
