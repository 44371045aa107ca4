use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use stepwise_core::error::{Result, StepwiseError};

use crate::sqlite::open_connection;

fn db_err(e: impl std::fmt::Display) -> StepwiseError {
    StepwiseError::Datastore(e.to_string())
}

/// One row of [`ConversationStore::list`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversationSummary {
    pub id: String,
    pub component: String,
    /// Status tag of the last `execute()` call, if any.
    pub status: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Persists serialized conversations so suspended executions survive a
/// process restart.
pub struct ConversationStore {
    conn: Mutex<Connection>,
}

impl ConversationStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = open_connection(path)?;
        debug!(path = %path.display(), "Conversation store opened");
        Self::init(conn)
    }

    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory().map_err(db_err)?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                component TEXT NOT NULL,
                status TEXT,
                data TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );",
        )
        .map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Insert or replace a serialized conversation. `data` must carry the
    /// `id` and `component` fields every serialized conversation has.
    pub fn save(&self, data: &Value) -> Result<()> {
        let id = data["id"]
            .as_str()
            .ok_or_else(|| StepwiseError::Conversation("serialized conversation has no id".into()))?;
        let component = data["component"]["name"]
            .as_str()
            .or_else(|| data["component"].as_str())
            .unwrap_or_default();
        let status = data["status"]["status"].as_str();

        let conn = self.conn.lock().map_err(db_err)?;
        conn.execute(
            "INSERT OR REPLACE INTO conversations (id, component, status, data, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                id,
                component,
                status,
                serde_json::to_string(data)?,
                Utc::now().to_rfc3339()
            ],
        )
        .map_err(db_err)?;
        debug!(conversation_id = id, "Conversation saved");
        Ok(())
    }

    pub fn load(&self, id: &str) -> Result<Option<Value>> {
        let conn = self.conn.lock().map_err(db_err)?;
        let data: Option<String> = conn
            .query_row(
                "SELECT data FROM conversations WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        data.map(|d| serde_json::from_str(&d).map_err(StepwiseError::from))
            .transpose()
    }

    pub fn delete(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock().map_err(db_err)?;
        let n = conn
            .execute("DELETE FROM conversations WHERE id = ?1", params![id])
            .map_err(db_err)?;
        Ok(n > 0)
    }

    /// Stored conversations, most recently updated first.
    pub fn list(&self) -> Result<Vec<ConversationSummary>> {
        let conn = self.conn.lock().map_err(db_err)?;
        let mut stmt = conn
            .prepare(
                "SELECT id, component, status, updated_at FROM conversations
                 ORDER BY updated_at DESC",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })
            .map_err(db_err)?;

        let mut out = Vec::new();
        for row in rows {
            let (id, component, status, updated_at) = row.map_err(db_err)?;
            let updated_at = DateTime::parse_from_rfc3339(&updated_at)
                .map(|t| t.with_timezone(&Utc))
                .map_err(db_err)?;
            out.push(ConversationSummary {
                id,
                component,
                status,
                updated_at,
            });
        }
        Ok(out)
    }
}
