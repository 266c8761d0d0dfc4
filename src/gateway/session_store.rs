//! Concrete Session Store collaborator. Persists ACP-level sessions and
//! their message history in SQLite via `sqlx`, behind the interface the
//! orchestrator depends on — an embedder is free to swap this out for a
//! different backend as long as it implements the same operations.

use chrono::{DateTime, Utc};
use log::debug;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};

use crate::gateway::error::GatewayError;
use crate::gateway::models::Message;

/// One persisted ACP-level session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionRecord {
    pub acp_session_id: String,
    pub agent_name: String,
    pub zed_session_id: Option<String>,
    pub working_directory: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub is_active: bool,
    pub last_run_id: Option<String>,
}

/// One stored message in a session's history.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    pub run_id: String,
    pub message: Message,
    pub sequence_number: i64,
    pub created_at: DateTime<Utc>,
}

pub struct SessionStore {
    pool: SqlitePool,
}

impl SessionStore {
    /// Opens (creating if absent) the SQLite database at `path` and runs
    /// the store's schema against it.
    pub async fn connect(path: &str) -> Result<Self, GatewayError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        // A ":memory:" database is private to a single connection; capping
        // the pool at one connection keeps every query against the same
        // database instead of fanning out across unrelated in-memory dbs.
        let max_connections = if path == ":memory:" { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(|err| GatewayError::Internal(format!("failed to open session database: {err}")))?;
        let store = Self { pool };
        store.run_schema().await?;
        Ok(store)
    }

    async fn run_schema(&self) -> Result<(), GatewayError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS acp_sessions (
                acp_session_id TEXT PRIMARY KEY,
                agent_name TEXT NOT NULL,
                zed_session_id TEXT,
                working_directory TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1,
                last_run_id TEXT,
                metadata_json TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|err| GatewayError::Internal(err.to_string()))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS session_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                acp_session_id TEXT NOT NULL REFERENCES acp_sessions(acp_session_id),
                run_id TEXT NOT NULL,
                message_role TEXT NOT NULL,
                message_json TEXT NOT NULL,
                sequence_number INTEGER NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|err| GatewayError::Internal(err.to_string()))?;
        Ok(())
    }

    /// Returns the existing session for `acp_session_id`, creating one with
    /// no agent-assigned session id yet if none exists. A fresh record's
    /// `zed_session_id` is `None` — the orchestrator must treat that as
    /// "no agent session exists yet" and call `start_session`, never
    /// `load_session`, on first use.
    pub async fn get_or_create(
        &self,
        acp_session_id: &str,
        agent: &str,
        working_directory: &str,
    ) -> Result<SessionRecord, GatewayError> {
        if let Some(existing) = self.get(acp_session_id).await? {
            debug!("reusing existing session {acp_session_id}");
            return Ok(existing);
        }

        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO acp_sessions
                (acp_session_id, agent_name, zed_session_id, working_directory, created_at, updated_at, is_active, last_run_id, metadata_json)
            VALUES (?, ?, NULL, ?, ?, ?, 1, NULL, NULL)
            "#,
        )
        .bind(acp_session_id)
        .bind(agent)
        .bind(working_directory)
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|err| GatewayError::Internal(err.to_string()))?;

        Ok(SessionRecord {
            acp_session_id: acp_session_id.to_string(),
            agent_name: agent.to_string(),
            zed_session_id: None,
            working_directory: working_directory.to_string(),
            created_at: now,
            updated_at: now,
            is_active: true,
            last_run_id: None,
        })
    }

    pub async fn update_zed_session_id(
        &self,
        acp_session_id: &str,
        zed_session_id: &str,
    ) -> Result<(), GatewayError> {
        sqlx::query("UPDATE acp_sessions SET zed_session_id = ?, updated_at = ? WHERE acp_session_id = ?")
            .bind(zed_session_id)
            .bind(Utc::now().to_rfc3339())
            .bind(acp_session_id)
            .execute(&self.pool)
            .await
            .map_err(|err| GatewayError::Internal(err.to_string()))?;
        Ok(())
    }

    pub async fn append_message(
        &self,
        acp_session_id: &str,
        run_id: &str,
        message: &Message,
        sequence_number: i64,
    ) -> Result<(), GatewayError> {
        let message_json = serde_json::to_string(message)
            .map_err(|err| GatewayError::Internal(err.to_string()))?;
        let role = serde_json::to_value(message.role)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| "unknown".to_string());

        sqlx::query(
            r#"
            INSERT INTO session_history (acp_session_id, run_id, message_role, message_json, sequence_number, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(acp_session_id)
        .bind(run_id)
        .bind(role)
        .bind(message_json)
        .bind(sequence_number)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|err| GatewayError::Internal(err.to_string()))?;

        self.update_activity(acp_session_id, run_id).await
    }

    pub async fn get_history(
        &self,
        acp_session_id: &str,
        limit: Option<i64>,
    ) -> Result<Vec<HistoryEntry>, GatewayError> {
        let rows = sqlx::query(
            r#"
            SELECT run_id, message_json, sequence_number, created_at
            FROM session_history
            WHERE acp_session_id = ?
            ORDER BY sequence_number ASC
            LIMIT ?
            "#,
        )
        .bind(acp_session_id)
        .bind(limit.unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(|err| GatewayError::Internal(err.to_string()))?;

        rows.into_iter()
            .map(|row| {
                let message_json: String = row.try_get("message_json").unwrap_or_default();
                let message: Message = serde_json::from_str(&message_json)
                    .map_err(|err| GatewayError::Internal(err.to_string()))?;
                let created_at_raw: String = row.try_get("created_at").unwrap_or_default();
                let created_at = DateTime::parse_from_rfc3339(&created_at_raw)
                    .map(|dt| dt.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now());
                Ok(HistoryEntry {
                    run_id: row.try_get("run_id").unwrap_or_default(),
                    message,
                    sequence_number: row.try_get("sequence_number").unwrap_or_default(),
                    created_at,
                })
            })
            .collect()
    }

    pub async fn get(&self, acp_session_id: &str) -> Result<Option<SessionRecord>, GatewayError> {
        let row = sqlx::query(
            r#"
            SELECT acp_session_id, agent_name, zed_session_id, working_directory, created_at, updated_at, is_active, last_run_id
            FROM acp_sessions WHERE acp_session_id = ?
            "#,
        )
        .bind(acp_session_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|err| GatewayError::Internal(err.to_string()))?;

        Ok(row.map(row_to_session))
    }

    pub async fn list(&self, agent_name: Option<&str>, active_only: bool) -> Result<Vec<SessionRecord>, GatewayError> {
        let rows = sqlx::query(
            r#"
            SELECT acp_session_id, agent_name, zed_session_id, working_directory, created_at, updated_at, is_active, last_run_id
            FROM acp_sessions
            WHERE (?1 IS NULL OR agent_name = ?1)
              AND (?2 = 0 OR is_active = 1)
            ORDER BY updated_at DESC
            "#,
        )
        .bind(agent_name)
        .bind(active_only as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|err| GatewayError::Internal(err.to_string()))?;

        Ok(rows.into_iter().map(row_to_session).collect())
    }

    pub async fn delete(&self, acp_session_id: &str) -> Result<bool, GatewayError> {
        let result = sqlx::query("DELETE FROM acp_sessions WHERE acp_session_id = ?")
            .bind(acp_session_id)
            .execute(&self.pool)
            .await
            .map_err(|err| GatewayError::Internal(err.to_string()))?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn update_activity(&self, acp_session_id: &str, run_id: &str) -> Result<(), GatewayError> {
        sqlx::query("UPDATE acp_sessions SET updated_at = ?, last_run_id = ? WHERE acp_session_id = ?")
            .bind(Utc::now().to_rfc3339())
            .bind(run_id)
            .bind(acp_session_id)
            .execute(&self.pool)
            .await
            .map_err(|err| GatewayError::Internal(err.to_string()))?;
        Ok(())
    }
}

fn row_to_session(row: sqlx::sqlite::SqliteRow) -> SessionRecord {
    let created_at_raw: String = row.try_get("created_at").unwrap_or_default();
    let updated_at_raw: String = row.try_get("updated_at").unwrap_or_default();
    SessionRecord {
        acp_session_id: row.try_get("acp_session_id").unwrap_or_default(),
        agent_name: row.try_get("agent_name").unwrap_or_default(),
        zed_session_id: row.try_get("zed_session_id").ok(),
        working_directory: row.try_get("working_directory").unwrap_or_default(),
        created_at: DateTime::parse_from_rfc3339(&created_at_raw)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        updated_at: DateTime::parse_from_rfc3339(&updated_at_raw)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        is_active: row.try_get::<i64, _>("is_active").unwrap_or(1) != 0,
        last_run_id: row.try_get("last_run_id").ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::models::{MessagePart, Role};

    async fn memory_store() -> SessionStore {
        SessionStore::connect(":memory:").await.unwrap()
    }

    #[tokio::test]
    async fn get_or_create_is_idempotent() {
        let store = memory_store().await;
        let first = store.get_or_create("s1", "test", "/tmp").await.unwrap();
        let second = store.get_or_create("s1", "test", "/tmp").await.unwrap();
        assert_eq!(first.acp_session_id, second.acp_session_id);
        assert_eq!(store.list(None, true).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn get_or_create_leaves_zed_session_id_unset_on_first_use() {
        let store = memory_store().await;
        let created = store.get_or_create("s1", "test", "/tmp").await.unwrap();
        assert!(created.zed_session_id.is_none());

        store.update_zed_session_id("s1", "zed-abc").await.unwrap();
        let reused = store.get_or_create("s1", "test", "/tmp").await.unwrap();
        assert_eq!(reused.zed_session_id.as_deref(), Some("zed-abc"));
    }

    #[tokio::test]
    async fn append_and_read_history_preserves_order() {
        let store = memory_store().await;
        store.get_or_create("s1", "test", "/tmp").await.unwrap();
        let msg = Message {
            role: Role::User,
            content: vec![MessagePart::text("hello")],
        };
        store.append_message("s1", "run-1", &msg, 0).await.unwrap();
        store.append_message("s1", "run-2", &msg, 1).await.unwrap();
        let history = store.get_history("s1", None).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].run_id, "run-1");
        assert_eq!(history[1].run_id, "run-2");
    }

    #[tokio::test]
    async fn delete_removes_session() {
        let store = memory_store().await;
        store.get_or_create("s1", "test", "/tmp").await.unwrap();
        assert!(store.delete("s1").await.unwrap());
        assert!(store.get("s1").await.unwrap().is_none());
        assert!(!store.delete("s1").await.unwrap());
    }
}
