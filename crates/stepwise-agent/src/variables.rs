//! Conversation-scoped variables.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use stepwise_core::error::{Result, StepwiseError};
use stepwise_core::property::Property;
use stepwise_core::types::ValueMap;

/// How a write combines with the current value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteOperation {
    /// Replace the value.
    Overwrite,
    /// Extend a list, or merge keys into a dict.
    Merge,
    /// Append one item to a list.
    Insert,
}

impl WriteOperation {
    /// Check the operation applies to the variable's type.
    pub fn check(self, variable: &Property) -> Result<()> {
        let ok = match self {
            Self::Overwrite => true,
            Self::Merge => variable.is_list() || variable.is_dict(),
            Self::Insert => variable.is_list(),
        };
        if ok {
            Ok(())
        } else {
            Err(StepwiseError::Config(format!(
                "{:?} is not valid for variable '{}' of type {}",
                self,
                variable.name,
                variable.type_name()
            )))
        }
    }

    /// Descriptor of the value a write with this operation accepts.
    pub fn value_descriptor(self, variable: &Property) -> Property {
        match (self, variable.item()) {
            (Self::Insert, Some(item)) => item.renamed(variable.name.clone()),
            _ => variable.clone(),
        }
    }
}

/// Record of a mutation made on a forked store, replayed on merge.
#[derive(Debug, Clone, PartialEq)]
pub enum JournalEntry {
    Declare(Property),
    Write {
        name: String,
        op: WriteOperation,
        value: Value,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VariableStore {
    declared: BTreeMap<String, Property>,
    values: ValueMap,
    #[serde(skip)]
    journal: Option<Vec<JournalEntry>>,
}

impl VariableStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a variable. Redeclaring with the same type is a no-op.
    pub fn declare(&mut self, variable: Property) -> Result<()> {
        if let Some(existing) = self.declared.get(&variable.name) {
            if existing.kind != variable.kind {
                return Err(StepwiseError::Config(format!(
                    "variable '{}' already declared as {}, not {}",
                    variable.name,
                    existing.type_name(),
                    variable.type_name()
                )));
            }
            return Ok(());
        }
        if let Some(journal) = &mut self.journal {
            journal.push(JournalEntry::Declare(variable.clone()));
        }
        if let Some(default) = &variable.default {
            self.values.insert(variable.name.clone(), default.clone());
        }
        self.declared.insert(variable.name.clone(), variable);
        Ok(())
    }

    pub fn ensure(&mut self, variables: &[Property]) -> Result<()> {
        variables.iter().try_for_each(|v| self.declare(v.clone()))
    }

    pub fn is_declared(&self, name: &str) -> bool {
        self.declared.contains_key(name)
    }

    /// Declared variable names, sorted.
    pub fn names(&self) -> Vec<&str> {
        self.declared.keys().map(String::as_str).collect()
    }

    pub fn descriptor(&self, name: &str) -> Option<&Property> {
        self.declared.get(name)
    }

    /// Current value, `null` when declared but never written.
    pub fn read(&self, name: &str) -> Result<Value> {
        if !self.is_declared(name) {
            return Err(StepwiseError::Config(format!("undeclared variable '{}'", name)));
        }
        Ok(self.values.get(name).cloned().unwrap_or(Value::Null))
    }

    pub fn write(&mut self, name: &str, op: WriteOperation, value: Value) -> Result<()> {
        let variable = self
            .declared
            .get(name)
            .ok_or_else(|| StepwiseError::Config(format!("undeclared variable '{}'", name)))?;
        op.check(variable)?;
        let value = op.value_descriptor(variable).coerce(value)?;

        let updated = match op {
            WriteOperation::Overwrite => value.clone(),
            WriteOperation::Insert => {
                let mut items = match self.values.get(name) {
                    Some(Value::Array(items)) => items.clone(),
                    _ => Vec::new(),
                };
                items.push(value.clone());
                Value::Array(items)
            }
            WriteOperation::Merge => match (self.values.get(name), &value) {
                (Some(Value::Array(current)), Value::Array(more)) => {
                    Value::Array(current.iter().chain(more).cloned().collect())
                }
                (Some(Value::Object(current)), Value::Object(more)) => {
                    let mut merged = current.clone();
                    merged.extend(more.clone());
                    Value::Object(merged)
                }
                _ => value.clone(),
            },
        };

        if let Some(journal) = &mut self.journal {
            journal.push(JournalEntry::Write {
                name: name.to_string(),
                op,
                value,
            });
        }
        self.values.insert(name.to_string(), updated);
        Ok(())
    }

    /// A copy that records every mutation, for running a parallel branch
    /// in isolation.
    pub fn fork(&self) -> Self {
        Self {
            declared: self.declared.clone(),
            values: self.values.clone(),
            journal: Some(Vec::new()),
        }
    }

    pub fn take_journal(&mut self) -> Vec<JournalEntry> {
        self.journal.as_mut().map(std::mem::take).unwrap_or_default()
    }

    /// Apply mutations recorded on a fork.
    pub fn replay(&mut self, journal: Vec<JournalEntry>) -> Result<()> {
        for entry in journal {
            match entry {
                JournalEntry::Declare(variable) => self.declare(variable)?,
                JournalEntry::Write { name, op, value } => self.write(&name, op, value)?,
            }
        }
        Ok(())
    }

    pub fn values(&self) -> &ValueMap {
        &self.values
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> VariableStore {
        let mut vars = VariableStore::new();
        vars.ensure(&[
            Property::integer("count").with_default(json!(0)),
            Property::list("log", Property::string("entry")).with_default(json!([])),
            Property::dict("tags", Property::string("tag")),
        ])
        .unwrap();
        vars
    }

    #[test]
    fn test_names_are_sorted() {
        assert_eq!(store().names(), vec!["count", "log", "tags"]);
    }

    #[test]
    fn test_defaults_and_overwrite() {
        let mut vars = store();
        assert_eq!(vars.read("count").unwrap(), json!(0));
        vars.write("count", WriteOperation::Overwrite, json!("5")).unwrap();
        assert_eq!(vars.read("count").unwrap(), json!(5));
        assert_eq!(vars.read("tags").unwrap(), Value::Null);
    }

    #[test]
    fn test_insert_and_merge() {
        let mut vars = store();
        vars.write("log", WriteOperation::Insert, json!("a")).unwrap();
        vars.write("log", WriteOperation::Merge, json!(["b", "c"])).unwrap();
        assert_eq!(vars.read("log").unwrap(), json!(["a", "b", "c"]));

        vars.write("tags", WriteOperation::Merge, json!({"x": "1"})).unwrap();
        vars.write("tags", WriteOperation::Merge, json!({"y": "2"})).unwrap();
        assert_eq!(vars.read("tags").unwrap(), json!({"x": "1", "y": "2"}));
    }

    #[test]
    fn test_type_violations() {
        let mut vars = store();
        let err = vars.write("count", WriteOperation::Overwrite, json!("many")).unwrap_err();
        assert_eq!(err.kind(), "Validation");
        let err = vars.write("count", WriteOperation::Insert, json!(1)).unwrap_err();
        assert_eq!(err.kind(), "Config");
        assert!(vars.write("missing", WriteOperation::Overwrite, json!(1)).is_err());
    }

    #[test]
    fn test_redeclare_with_other_type_fails() {
        let mut vars = store();
        assert!(vars.declare(Property::integer("count")).is_ok());
        assert!(vars.declare(Property::string("count")).is_err());
    }

    #[test]
    fn test_fork_and_replay() {
        let mut vars = store();
        let mut branch = vars.fork();
        branch.write("log", WriteOperation::Insert, json!("from branch")).unwrap();
        branch.declare(Property::boolean("done")).unwrap();
        branch.write("done", WriteOperation::Overwrite, json!(true)).unwrap();
        assert_eq!(vars.read("log").unwrap(), json!([]));

        vars.replay(branch.take_journal()).unwrap();
        assert_eq!(vars.read("log").unwrap(), json!(["from branch"]));
        assert_eq!(vars.read("done").unwrap(), json!(true));
    }

    #[test]
    fn test_serde_skips_journal() {
        let vars = store().fork();
        let json = serde_json::to_value(&vars).unwrap();
        let back: VariableStore = serde_json::from_value(json).unwrap();
        assert_eq!(back.values(), vars.values());
        assert!(back.journal.is_none());
    }
}
