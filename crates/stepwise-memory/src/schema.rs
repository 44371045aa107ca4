//! Entity schemas and the filter/ordering rules shared by every datastore.

use std::cmp::Ordering;
use std::collections::HashMap;

use serde_json::Value;

use stepwise_core::error::{Result, StepwiseError};
use stepwise_core::property::{coerce_values, Property};
use stepwise_core::traits::{Entity, Filter, Query};

/// Declared collections and the properties their entities carry.
#[derive(Debug, Clone, Default)]
pub struct Schemas {
    collections: HashMap<String, Vec<Property>>,
}

impl Schemas {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, collection: impl Into<String>, properties: Vec<Property>) {
        self.collections.insert(collection.into(), properties);
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.collections.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    fn properties(&self, collection: &str) -> Result<&[Property]> {
        self.collections
            .get(collection)
            .map(|p| p.as_slice())
            .ok_or_else(|| StepwiseError::Datastore(format!("unknown collection '{}'", collection)))
    }

    /// Coerce an entity against its collection schema. Fields the schema does
    /// not declare are rejected.
    pub fn validate(&self, collection: &str, entity: Entity) -> Result<Entity> {
        let properties = self.properties(collection)?;
        if let Some(extra) = entity.keys().find(|k| !properties.iter().any(|p| &p.name == *k)) {
            return Err(StepwiseError::validation(
                format!("{}.{}", collection, extra),
                "field is not declared in the collection schema",
            ));
        }
        coerce_values(properties, entity, collection)
    }

    /// Check a filter only names declared fields.
    pub fn check_filter(&self, collection: &str, filter: &Filter) -> Result<()> {
        let properties = self.properties(collection)?;
        match filter.keys().find(|k| !properties.iter().any(|p| &p.name == *k)) {
            Some(field) => Err(StepwiseError::Datastore(format!(
                "cannot filter '{}' on undeclared field '{}'",
                collection, field
            ))),
            None => Ok(()),
        }
    }
}

pub fn matches(entity: &Entity, filter: &Filter) -> bool {
    filter.iter().all(|(k, v)| entity.get(k) == Some(v))
}

/// Apply ordering and limit to entities that already passed the filter.
pub fn apply_query(mut entities: Vec<Entity>, query: &Query) -> Vec<Entity> {
    if let Some(field) = &query.order_by {
        entities.sort_by(|a, b| {
            let ord = compare(a.get(field), b.get(field));
            if query.descending {
                ord.reverse()
            } else {
                ord
            }
        });
    }
    if let Some(limit) = query.limit {
        entities.truncate(limit);
    }
    entities
}

fn compare(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        _ => Ordering::Equal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schemas() -> Schemas {
        let mut s = Schemas::new();
        s.insert(
            "books",
            vec![
                Property::string("title"),
                Property::integer("year").with_default(json!(0)),
            ],
        );
        s
    }

    fn entity(v: Value) -> Entity {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn test_validate_fills_defaults() {
        let e = schemas().validate("books", entity(json!({"title": "Dune"}))).unwrap();
        assert_eq!(e["year"], json!(0));
    }

    #[test]
    fn test_validate_rejects_undeclared_field() {
        let err = schemas()
            .validate("books", entity(json!({"title": "Dune", "isbn": "x"})))
            .unwrap_err();
        assert_eq!(err.kind(), "Validation");
    }

    #[test]
    fn test_unknown_collection() {
        let err = schemas().validate("films", Entity::new()).unwrap_err();
        assert!(matches!(err, StepwiseError::Datastore(_)));
    }

    #[test]
    fn test_apply_query_orders_and_limits() {
        let books = vec![
            entity(json!({"title": "B", "year": 1965})),
            entity(json!({"title": "A", "year": 1951})),
            entity(json!({"title": "C", "year": 1969})),
        ];
        let out = apply_query(books, &Query::default().order_by("year", true).limit(2));
        let titles: Vec<&str> = out.iter().map(|e| e["title"].as_str().unwrap()).collect();
        assert_eq!(titles, vec!["C", "B"]);
    }
}
