use std::path::Path;
use std::sync::Mutex;

use futures::future::BoxFuture;
use rusqlite::{params, Connection};
use tracing::debug;

use stepwise_core::error::{Result, StepwiseError};
use stepwise_core::property::Property;
use stepwise_core::traits::{Datastore, Entity, Filter, Query};

use crate::schema::{apply_query, matches, Schemas};

fn db_err(e: impl std::fmt::Display) -> StepwiseError {
    StepwiseError::Datastore(e.to_string())
}

pub(crate) fn open_connection(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| StepwiseError::Datastore(format!("Failed to create db directory: {}", e)))?;
    }
    let conn = Connection::open(path).map_err(db_err)?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
        .map_err(db_err)?;
    Ok(conn)
}

/// SQLite-backed datastore. Entities are stored as JSON documents, one
/// row each, keyed by collection.
pub struct SqliteDatastore {
    conn: Mutex<Connection>,
    schemas: Schemas,
}

impl SqliteDatastore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = open_connection(path)?;
        debug!(path = %path.display(), "SQLite datastore opened");
        Self::init(conn)
    }

    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory().map_err(db_err)?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS entities (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                collection TEXT NOT NULL,
                data TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_entities_collection
                ON entities(collection, id);",
        )
        .map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
            schemas: Schemas::new(),
        })
    }

    pub fn with_collection(mut self, name: impl Into<String>, properties: Vec<Property>) -> Self {
        self.schemas.insert(name, properties);
        self
    }

    /// Rows of a collection matching the filter, as `(rowid, entity)`.
    fn select(conn: &Connection, collection: &str, filter: &Filter) -> Result<Vec<(i64, Entity)>> {
        let mut stmt = conn
            .prepare("SELECT id, data FROM entities WHERE collection = ?1 ORDER BY id")
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![collection], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(db_err)?;

        let mut out = Vec::new();
        for row in rows {
            let (id, data) = row.map_err(db_err)?;
            let entity: Entity = serde_json::from_str(&data)?;
            if matches(&entity, filter) {
                out.push((id, entity));
            }
        }
        Ok(out)
    }
}

impl Datastore for SqliteDatastore {
    fn create(&self, collection: &str, entities: Vec<Entity>) -> BoxFuture<'_, Result<Vec<Entity>>> {
        let collection = collection.to_string();
        Box::pin(async move {
            let validated = entities
                .into_iter()
                .map(|e| self.schemas.validate(&collection, e))
                .collect::<Result<Vec<_>>>()?;

            let mut conn = self.conn.lock().map_err(db_err)?;
            let tx = conn.transaction().map_err(db_err)?;
            for entity in &validated {
                tx.execute(
                    "INSERT INTO entities (collection, data) VALUES (?1, ?2)",
                    params![collection, serde_json::to_string(entity)?],
                )
                .map_err(db_err)?;
            }
            tx.commit().map_err(db_err)?;
            Ok(validated)
        })
    }

    fn list(&self, collection: &str, filter: Filter) -> BoxFuture<'_, Result<Vec<Entity>>> {
        self.query(collection, Query::new(filter))
    }

    fn update(
        &self,
        collection: &str,
        filter: Filter,
        values: Entity,
    ) -> BoxFuture<'_, Result<Vec<Entity>>> {
        let collection = collection.to_string();
        Box::pin(async move {
            self.schemas.check_filter(&collection, &filter)?;
            let mut conn = self.conn.lock().map_err(db_err)?;
            let tx = conn.transaction().map_err(db_err)?;

            let mut out = Vec::new();
            for (id, mut entity) in Self::select(&tx, &collection, &filter)? {
                entity.extend(values.clone());
                let entity = self.schemas.validate(&collection, entity)?;
                tx.execute(
                    "UPDATE entities SET data = ?1 WHERE id = ?2",
                    params![serde_json::to_string(&entity)?, id],
                )
                .map_err(db_err)?;
                out.push(entity);
            }
            tx.commit().map_err(db_err)?;
            Ok(out)
        })
    }

    fn delete(&self, collection: &str, filter: Filter) -> BoxFuture<'_, Result<usize>> {
        let collection = collection.to_string();
        Box::pin(async move {
            self.schemas.check_filter(&collection, &filter)?;
            let mut conn = self.conn.lock().map_err(db_err)?;
            let tx = conn.transaction().map_err(db_err)?;
            let ids: Vec<i64> = Self::select(&tx, &collection, &filter)?
                .into_iter()
                .map(|(id, _)| id)
                .collect();
            for id in &ids {
                tx.execute("DELETE FROM entities WHERE id = ?1", params![id])
                    .map_err(db_err)?;
            }
            tx.commit().map_err(db_err)?;
            Ok(ids.len())
        })
    }

    fn query(&self, collection: &str, query: Query) -> BoxFuture<'_, Result<Vec<Entity>>> {
        let collection = collection.to_string();
        Box::pin(async move {
            self.schemas.check_filter(&collection, &query.filter)?;
            let conn = self.conn.lock().map_err(db_err)?;
            let rows = Self::select(&conn, &collection, &query.filter)?
                .into_iter()
                .map(|(_, e)| e)
                .collect();
            Ok(apply_query(rows, &query))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn entity(v: Value) -> Entity {
        v.as_object().cloned().unwrap()
    }

    fn summaries(ds: SqliteDatastore) -> SqliteDatastore {
        ds.with_collection(
            "summaries",
            vec![Property::string("message_id"), Property::string("summary")],
        )
    }

    #[tokio::test]
    async fn test_create_and_query() {
        let ds = summaries(SqliteDatastore::in_memory().unwrap());
        ds.create(
            "summaries",
            vec![
                entity(json!({"message_id": "m1", "summary": "short"})),
                entity(json!({"message_id": "m2", "summary": "shorter"})),
            ],
        )
        .await
        .unwrap();

        let hit = ds
            .list("summaries", Filter::from([("message_id".to_string(), json!("m2"))]))
            .await
            .unwrap();
        assert_eq!(hit.len(), 1);
        assert_eq!(hit[0]["summary"], "shorter");

        let ordered = ds
            .query("summaries", Query::default().order_by("message_id", true).limit(1))
            .await
            .unwrap();
        assert_eq!(ordered[0]["message_id"], "m2");
    }

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("data.db");
        {
            let ds = summaries(SqliteDatastore::open(&path).unwrap());
            ds.create("summaries", vec![entity(json!({"message_id": "m1", "summary": "s"}))])
                .await
                .unwrap();
        }
        let ds = summaries(SqliteDatastore::open(&path).unwrap());
        assert_eq!(ds.list("summaries", Filter::new()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_update_and_delete() {
        let ds = summaries(SqliteDatastore::in_memory().unwrap());
        ds.create("summaries", vec![entity(json!({"message_id": "m1", "summary": "old"}))])
            .await
            .unwrap();
        let updated = ds
            .update("summaries", Filter::new(), entity(json!({"summary": "new"})))
            .await
            .unwrap();
        assert_eq!(updated[0]["summary"], "new");
        assert_eq!(ds.delete("summaries", Filter::new()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_schema_violation_rejected() {
        let ds = summaries(SqliteDatastore::in_memory().unwrap());
        let err = ds
            .create("summaries", vec![entity(json!({"message_id": "m1"}))])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "Validation");
    }
}
