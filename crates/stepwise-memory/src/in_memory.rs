use std::collections::HashMap;
use std::sync::Mutex;

use futures::future::BoxFuture;
use stepwise_core::error::{Result, StepwiseError};
use stepwise_core::property::Property;
use stepwise_core::traits::{Datastore, Entity, Filter, Query};

use crate::schema::{apply_query, matches, Schemas};

/// Process-local datastore. Contents are lost when it is dropped.
#[derive(Debug, Default)]
pub struct InMemoryDatastore {
    schemas: Schemas,
    data: Mutex<HashMap<String, Vec<Entity>>>,
}

impl InMemoryDatastore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_collection(mut self, name: impl Into<String>, properties: Vec<Property>) -> Self {
        self.schemas.insert(name, properties);
        self
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Vec<Entity>>>> {
        self.data
            .lock()
            .map_err(|e| StepwiseError::Datastore(e.to_string()))
    }
}

impl Datastore for InMemoryDatastore {
    fn create(&self, collection: &str, entities: Vec<Entity>) -> BoxFuture<'_, Result<Vec<Entity>>> {
        let collection = collection.to_string();
        Box::pin(async move {
            let validated = entities
                .into_iter()
                .map(|e| self.schemas.validate(&collection, e))
                .collect::<Result<Vec<_>>>()?;
            self.lock()?
                .entry(collection)
                .or_default()
                .extend(validated.iter().cloned());
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
            let mut data = self.lock()?;
            let rows = data.entry(collection.clone()).or_default();

            // Validate every change before applying any of them.
            let mut changes = Vec::new();
            for (idx, row) in rows.iter().enumerate() {
                if matches(row, &filter) {
                    let mut updated = row.clone();
                    updated.extend(values.clone());
                    changes.push((idx, self.schemas.validate(&collection, updated)?));
                }
            }
            let mut out = Vec::with_capacity(changes.len());
            for (idx, updated) in changes {
                rows[idx] = updated.clone();
                out.push(updated);
            }
            Ok(out)
        })
    }

    fn delete(&self, collection: &str, filter: Filter) -> BoxFuture<'_, Result<usize>> {
        let collection = collection.to_string();
        Box::pin(async move {
            self.schemas.check_filter(&collection, &filter)?;
            let mut data = self.lock()?;
            let rows = data.entry(collection).or_default();
            let before = rows.len();
            rows.retain(|row| !matches(row, &filter));
            Ok(before - rows.len())
        })
    }

    fn query(&self, collection: &str, query: Query) -> BoxFuture<'_, Result<Vec<Entity>>> {
        let collection = collection.to_string();
        Box::pin(async move {
            self.schemas.check_filter(&collection, &query.filter)?;
            let data = self.lock()?;
            let rows: Vec<Entity> = data
                .get(&collection)
                .map(|rows| {
                    rows.iter()
                        .filter(|row| matches(row, &query.filter))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default();
            Ok(apply_query(rows, &query))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn store() -> InMemoryDatastore {
        InMemoryDatastore::new().with_collection(
            "notes",
            vec![
                Property::string("topic"),
                Property::string("body"),
                Property::boolean("pinned").with_default(json!(false)),
            ],
        )
    }

    fn entity(v: Value) -> Entity {
        v.as_object().cloned().unwrap()
    }

    fn filter(field: &str, v: Value) -> Filter {
        Filter::from([(field.to_string(), v)])
    }

    #[tokio::test]
    async fn test_crud() {
        let ds = store();
        ds.create(
            "notes",
            vec![
                entity(json!({"topic": "rust", "body": "ownership"})),
                entity(json!({"topic": "go", "body": "goroutines"})),
            ],
        )
        .await
        .unwrap();

        let rust = ds.list("notes", filter("topic", json!("rust"))).await.unwrap();
        assert_eq!(rust.len(), 1);
        assert_eq!(rust[0]["pinned"], json!(false));

        let updated = ds
            .update("notes", filter("topic", json!("rust")), entity(json!({"pinned": true})))
            .await
            .unwrap();
        assert_eq!(updated[0]["pinned"], json!(true));

        assert_eq!(ds.delete("notes", Filter::new()).await.unwrap(), 2);
        assert!(ds.list("notes", Filter::new()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_update_changes_nothing() {
        let ds = store();
        ds.create("notes", vec![entity(json!({"topic": "a", "body": "b"}))])
            .await
            .unwrap();
        let err = ds
            .update("notes", Filter::new(), entity(json!({"pinned": "maybe"})))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "Validation");
        let rows = ds.list("notes", Filter::new()).await.unwrap();
        assert_eq!(rows[0]["pinned"], json!(false));
    }
}
