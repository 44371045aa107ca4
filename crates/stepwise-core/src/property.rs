//! Typed value descriptors.
//!
//! A [`Property`] describes the shape of a value flowing into or out of a
//! step, tool, agent or variable. The same descriptor validates values at run
//! time, checks data-edge compatibility at construction time, and renders to
//! JSON schema for LLM tool definitions.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{Result, StepwiseError};
use crate::types::ValueMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Property {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(flatten)]
    pub kind: PropertyKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default = "default_required")]
    pub required: bool,
}

fn default_required() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PropertyKind {
    String,
    Integer,
    Float,
    Boolean,
    List { item: Box<Property> },
    Dict { value: Box<Property> },
    Object { fields: BTreeMap<String, Property> },
    Union { variants: Vec<Property> },
    Any,
    Null,
}

impl Property {
    pub fn new(name: impl Into<String>, kind: PropertyKind) -> Self {
        Self {
            name: name.into(),
            description: None,
            kind,
            default: None,
            required: true,
        }
    }

    pub fn string(name: impl Into<String>) -> Self {
        Self::new(name, PropertyKind::String)
    }

    pub fn integer(name: impl Into<String>) -> Self {
        Self::new(name, PropertyKind::Integer)
    }

    pub fn float(name: impl Into<String>) -> Self {
        Self::new(name, PropertyKind::Float)
    }

    pub fn boolean(name: impl Into<String>) -> Self {
        Self::new(name, PropertyKind::Boolean)
    }

    pub fn any(name: impl Into<String>) -> Self {
        Self::new(name, PropertyKind::Any)
    }

    pub fn null(name: impl Into<String>) -> Self {
        Self::new(name, PropertyKind::Null)
    }

    pub fn list(name: impl Into<String>, item: Property) -> Self {
        Self::new(
            name,
            PropertyKind::List {
                item: Box::new(item),
            },
        )
    }

    pub fn dict(name: impl Into<String>, value: Property) -> Self {
        Self::new(
            name,
            PropertyKind::Dict {
                value: Box::new(value),
            },
        )
    }

    pub fn object(name: impl Into<String>, fields: Vec<Property>) -> Self {
        let fields = fields.into_iter().map(|f| (f.name.clone(), f)).collect();
        Self::new(name, PropertyKind::Object { fields })
    }

    pub fn union(name: impl Into<String>, variants: Vec<Property>) -> Self {
        Self::new(name, PropertyKind::Union { variants })
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    /// Copy of this descriptor under another name.
    pub fn renamed(&self, name: impl Into<String>) -> Self {
        let mut p = self.clone();
        p.name = name.into();
        p
    }

    /// A value must be supplied: the property is required and has no default.
    pub fn is_required(&self) -> bool {
        self.required && self.default.is_none()
    }

    pub fn is_list(&self) -> bool {
        matches!(self.kind, PropertyKind::List { .. })
    }

    pub fn is_dict(&self) -> bool {
        matches!(
            self.kind,
            PropertyKind::Dict { .. } | PropertyKind::Object { .. }
        )
    }

    /// Item descriptor of a list property.
    pub fn item(&self) -> Option<&Property> {
        match &self.kind {
            PropertyKind::List { item } => Some(item),
            _ => None,
        }
    }

    /// Short human-readable type, e.g. `list<string>`.
    pub fn type_name(&self) -> String {
        match &self.kind {
            PropertyKind::String => "string".into(),
            PropertyKind::Integer => "integer".into(),
            PropertyKind::Float => "float".into(),
            PropertyKind::Boolean => "boolean".into(),
            PropertyKind::Any => "any".into(),
            PropertyKind::Null => "null".into(),
            PropertyKind::List { item } => format!("list<{}>", item.type_name()),
            PropertyKind::Dict { value } => format!("dict<{}>", value.type_name()),
            PropertyKind::Object { fields } => {
                let inner: Vec<String> = fields
                    .iter()
                    .map(|(k, f)| format!("{}: {}", k, f.type_name()))
                    .collect();
                format!("object{{{}}}", inner.join(", "))
            }
            PropertyKind::Union { variants } => {
                let inner: Vec<String> = variants.iter().map(|v| v.type_name()).collect();
                inner.join(" | ")
            }
        }
    }

    /// Check that `value` conforms to this descriptor.
    pub fn validate(&self, value: &Value) -> Result<()> {
        let root = if self.name.is_empty() { "$" } else { &self.name };
        self.check(value, root)
            .map_err(|message| StepwiseError::validation(root, message))
    }

    fn check(&self, value: &Value, path: &str) -> std::result::Result<(), String> {
        let ok = match (&self.kind, value) {
            (PropertyKind::Any, _) => true,
            (PropertyKind::Null, Value::Null) => true,
            (PropertyKind::String, Value::String(_)) => true,
            (PropertyKind::Boolean, Value::Bool(_)) => true,
            (PropertyKind::Integer, Value::Number(n)) => n.is_i64() || n.is_u64(),
            (PropertyKind::Float, Value::Number(_)) => true,
            (PropertyKind::List { item }, Value::Array(items)) => {
                for (i, v) in items.iter().enumerate() {
                    item.check(v, &format!("{}[{}]", path, i))?;
                }
                true
            }
            (PropertyKind::Dict { value: inner }, Value::Object(map)) => {
                for (k, v) in map {
                    inner.check(v, &format!("{}.{}", path, k))?;
                }
                true
            }
            (PropertyKind::Object { fields }, Value::Object(map)) => {
                for (k, field) in fields {
                    match map.get(k) {
                        Some(v) => field.check(v, &format!("{}.{}", path, k))?,
                        None if field.is_required() => {
                            return Err(format!("{}.{}: missing required field", path, k));
                        }
                        None => {}
                    }
                }
                true
            }
            (PropertyKind::Union { variants }, v) => {
                variants.iter().any(|p| p.check(v, path).is_ok())
            }
            _ => false,
        };

        if ok {
            Ok(())
        } else {
            Err(format!(
                "{}: expected {}, got {}",
                path,
                self.type_name(),
                json_type_name(value)
            ))
        }
    }

    /// Convert loosely-typed values (numeric strings, JSON-encoded lists,
    /// missing object fields with defaults) into this shape, then validate.
    pub fn coerce(&self, value: Value) -> Result<Value> {
        let coerced = self.coerce_inner(value);
        self.validate(&coerced)?;
        Ok(coerced)
    }

    fn coerce_inner(&self, value: Value) -> Value {
        if value.is_null() {
            if let Some(default) = &self.default {
                return default.clone();
            }
        }

        match (&self.kind, value) {
            (PropertyKind::String, Value::Number(n)) => Value::String(n.to_string()),
            (PropertyKind::String, Value::Bool(b)) => Value::String(b.to_string()),
            (PropertyKind::Integer, Value::String(s)) => match s.trim().parse::<i64>() {
                Ok(i) => Value::from(i),
                Err(_) => Value::String(s),
            },
            (PropertyKind::Integer, Value::Number(n)) => match n.as_f64() {
                Some(f) if !(n.is_i64() || n.is_u64()) && f.fract() == 0.0 => {
                    Value::from(f as i64)
                }
                _ => Value::Number(n),
            },
            (PropertyKind::Float, Value::String(s)) => {
                match s.trim().parse::<f64>().ok().and_then(serde_json::Number::from_f64) {
                    Some(n) => Value::Number(n),
                    None => Value::String(s),
                }
            }
            (PropertyKind::Boolean, Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
                "true" => Value::Bool(true),
                "false" => Value::Bool(false),
                _ => Value::String(s),
            },
            (
                PropertyKind::List { .. } | PropertyKind::Dict { .. } | PropertyKind::Object { .. },
                Value::String(s),
            ) => match serde_json::from_str::<Value>(&s) {
                Ok(parsed) if parsed.is_array() || parsed.is_object() => self.coerce_inner(parsed),
                _ => Value::String(s),
            },
            (PropertyKind::List { item }, Value::Array(items)) => {
                Value::Array(items.into_iter().map(|v| item.coerce_inner(v)).collect())
            }
            (PropertyKind::Dict { value: inner }, Value::Object(map)) => Value::Object(
                map.into_iter()
                    .map(|(k, v)| (k, inner.coerce_inner(v)))
                    .collect(),
            ),
            (PropertyKind::Object { fields }, Value::Object(mut map)) => {
                for (k, field) in fields {
                    match map.remove(k) {
                        Some(v) => {
                            map.insert(k.clone(), field.coerce_inner(v));
                        }
                        None => {
                            if let Some(default) = &field.default {
                                map.insert(k.clone(), default.clone());
                            }
                        }
                    }
                }
                Value::Object(map)
            }
            (PropertyKind::Union { variants }, v) => {
                if variants.iter().any(|p| p.validate(&v).is_ok()) {
                    return v;
                }
                variants
                    .iter()
                    .map(|p| p.coerce_inner(v.clone()))
                    .find(|c| self.validate(c).is_ok())
                    .unwrap_or(v)
            }
            (_, v) => v,
        }
    }

    /// Infer a descriptor from an example value.
    pub fn infer(name: impl Into<String>, value: &Value) -> Self {
        let kind = match value {
            Value::Null => PropertyKind::Null,
            Value::Bool(_) => PropertyKind::Boolean,
            Value::Number(n) if n.is_i64() || n.is_u64() => PropertyKind::Integer,
            Value::Number(_) => PropertyKind::Float,
            Value::String(_) => PropertyKind::String,
            Value::Array(items) => {
                let mut inferred = items.iter().map(|v| Property::infer("", v));
                let item = match inferred.next() {
                    Some(first) if inferred.all(|p| p.kind == first.kind) => first,
                    _ => Property::any(""),
                };
                PropertyKind::List {
                    item: Box::new(item),
                }
            }
            Value::Object(map) => PropertyKind::Object {
                fields: map
                    .iter()
                    .map(|(k, v)| (k.clone(), Property::infer(k.clone(), v)))
                    .collect(),
            },
        };
        Self::new(name, kind)
    }

    /// Whether a value described by `self` may flow into `dest`.
    pub fn is_compatible_with(&self, dest: &Property) -> bool {
        match (&self.kind, &dest.kind) {
            (_, PropertyKind::Any) | (PropertyKind::Any, _) => true,
            (PropertyKind::Union { variants }, _) => {
                variants.iter().all(|v| v.is_compatible_with(dest))
            }
            (_, PropertyKind::Union { variants }) => {
                variants.iter().any(|v| self.is_compatible_with(v))
            }
            (PropertyKind::Integer, PropertyKind::Float) => true,
            (PropertyKind::List { item: a }, PropertyKind::List { item: b }) => {
                a.is_compatible_with(b)
            }
            (PropertyKind::Dict { value: a }, PropertyKind::Dict { value: b }) => {
                a.is_compatible_with(b)
            }
            (PropertyKind::Object { fields }, PropertyKind::Dict { value }) => {
                fields.values().all(|f| f.is_compatible_with(value))
            }
            (PropertyKind::Object { fields: a }, PropertyKind::Object { fields: b }) => {
                b.iter().all(|(k, bf)| match a.get(k) {
                    Some(af) => af.is_compatible_with(bf),
                    None => !bf.is_required(),
                })
            }
            (x, y) => std::mem::discriminant(x) == std::mem::discriminant(y),
        }
    }

    /// Render as a JSON schema fragment.
    pub fn to_json_schema(&self) -> Value {
        let mut schema = match &self.kind {
            PropertyKind::String => json!({ "type": "string" }),
            PropertyKind::Integer => json!({ "type": "integer" }),
            PropertyKind::Float => json!({ "type": "number" }),
            PropertyKind::Boolean => json!({ "type": "boolean" }),
            PropertyKind::Null => json!({ "type": "null" }),
            PropertyKind::Any => json!({}),
            PropertyKind::List { item } => {
                json!({ "type": "array", "items": item.to_json_schema() })
            }
            PropertyKind::Dict { value } => {
                json!({ "type": "object", "additionalProperties": value.to_json_schema() })
            }
            PropertyKind::Object { fields } => {
                let fields: Vec<Property> = fields.values().cloned().collect();
                object_schema(&fields)
            }
            PropertyKind::Union { variants } => {
                let any_of: Vec<Value> = variants.iter().map(|v| v.to_json_schema()).collect();
                json!({ "anyOf": any_of })
            }
        };

        if let Value::Object(map) = &mut schema {
            if !self.name.is_empty() {
                map.insert("title".into(), Value::String(self.name.clone()));
            }
            if let Some(description) = &self.description {
                map.insert("description".into(), Value::String(description.clone()));
            }
            if let Some(default) = &self.default {
                map.insert("default".into(), default.clone());
            }
        }
        schema
    }

    /// Build a descriptor from a JSON schema fragment.
    pub fn from_json_schema(name: impl Into<String>, schema: &Value) -> Result<Self> {
        let name = name.into();
        let obj = schema.as_object().ok_or_else(|| {
            StepwiseError::Deserialization(format!("schema for '{}' is not an object", name))
        })?;

        let kind = if let Some(variants) = obj.get("anyOf").or_else(|| obj.get("oneOf")) {
            let variants = variants
                .as_array()
                .ok_or_else(|| {
                    StepwiseError::Deserialization(format!("anyOf of '{}' is not a list", name))
                })?
                .iter()
                .map(|v| Property::from_json_schema("", v))
                .collect::<Result<Vec<_>>>()?;
            PropertyKind::Union { variants }
        } else {
            match obj.get("type") {
                None => PropertyKind::Any,
                Some(Value::String(t)) => kind_from_schema_type(&name, t, obj)?,
                Some(Value::Array(types)) => {
                    let variants = types
                        .iter()
                        .filter_map(Value::as_str)
                        .map(|t| kind_from_schema_type("", t, obj).map(|k| Property::new("", k)))
                        .collect::<Result<Vec<_>>>()?;
                    PropertyKind::Union { variants }
                }
                Some(other) => {
                    return Err(StepwiseError::Deserialization(format!(
                        "unsupported schema type for '{}': {}",
                        name, other
                    )))
                }
            }
        };

        let mut property = Property::new(name, kind);
        property.description = obj
            .get("description")
            .and_then(Value::as_str)
            .map(str::to_string);
        property.default = obj.get("default").cloned();
        Ok(property)
    }
}

fn kind_from_schema_type(
    name: &str,
    t: &str,
    obj: &serde_json::Map<String, Value>,
) -> Result<PropertyKind> {
    let kind = match t {
        "string" => PropertyKind::String,
        "integer" => PropertyKind::Integer,
        "number" => PropertyKind::Float,
        "boolean" => PropertyKind::Boolean,
        "null" => PropertyKind::Null,
        "array" => {
            let item = match obj.get("items") {
                Some(items) => Property::from_json_schema("", items)?,
                None => Property::any(""),
            };
            PropertyKind::List {
                item: Box::new(item),
            }
        }
        "object" => match obj.get("properties").and_then(Value::as_object) {
            Some(props) => {
                let required: Vec<&str> = obj
                    .get("required")
                    .and_then(Value::as_array)
                    .map(|r| r.iter().filter_map(Value::as_str).collect())
                    .unwrap_or_default();
                let mut fields = BTreeMap::new();
                for (k, v) in props {
                    let mut field = Property::from_json_schema(k.clone(), v)?;
                    field.required = required.contains(&k.as_str());
                    fields.insert(k.clone(), field);
                }
                PropertyKind::Object { fields }
            }
            None => {
                let value = match obj.get("additionalProperties") {
                    Some(v @ Value::Object(_)) => Property::from_json_schema("", v)?,
                    _ => Property::any(""),
                };
                PropertyKind::Dict {
                    value: Box::new(value),
                }
            }
        },
        other => {
            return Err(StepwiseError::Deserialization(format!(
                "unsupported schema type for '{}': {}",
                name, other
            )))
        }
    };
    Ok(kind)
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
        Value::Number(_) => "float",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}

/// JSON schema of an object whose fields are the given properties.
pub fn object_schema(properties: &[Property]) -> Value {
    let mut props = serde_json::Map::new();
    let mut required = Vec::new();
    for p in properties {
        let mut schema = p.to_json_schema();
        if let Value::Object(map) = &mut schema {
            map.remove("title");
        }
        props.insert(p.name.clone(), schema);
        if p.is_required() {
            required.push(Value::String(p.name.clone()));
        }
    }
    json!({
        "type": "object",
        "properties": props,
        "required": required,
    })
}

/// Coerce a named set of values against descriptors, filling defaults.
/// `owner` names the step, tool or agent for error messages.
pub fn coerce_values(properties: &[Property], mut values: ValueMap, owner: &str) -> Result<ValueMap> {
    for p in properties {
        match values.remove(&p.name) {
            Some(v) => {
                let coerced = p.coerce(v).map_err(|e| match e {
                    StepwiseError::Validation { message, .. } => {
                        StepwiseError::validation(format!("{}.{}", owner, p.name), message)
                    }
                    other => other,
                })?;
                values.insert(p.name.clone(), coerced);
            }
            None => {
                if let Some(default) = &p.default {
                    values.insert(p.name.clone(), default.clone());
                } else if p.required {
                    return Err(StepwiseError::validation(
                        format!("{}.{}", owner, p.name),
                        "missing required value",
                    ));
                }
            }
        }
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn person() -> Property {
        Property::object(
            "person",
            vec![
                Property::string("name"),
                Property::integer("age").with_default(json!(0)),
                Property::list("tags", Property::string("")).optional(),
            ],
        )
    }

    #[test]
    fn test_validate_nested_object() {
        let p = person();
        assert!(p.validate(&json!({"name": "Ada", "age": 36})).is_ok());
        assert!(p.validate(&json!({"name": "Ada", "tags": ["x", "y"]})).is_ok());

        let err = p.validate(&json!({"name": "Ada", "tags": ["x", 3]})).unwrap_err();
        assert!(err.to_string().contains("person.tags[1]"));

        let err = p.validate(&json!({"age": 3})).unwrap_err();
        assert!(err.to_string().contains("missing required field"));
    }

    #[test]
    fn test_any_accepts_everything() {
        let p = Property::any("x");
        for v in [json!(null), json!(1), json!("s"), json!([1, "a"]), json!({"k": {}})] {
            assert!(p.validate(&v).is_ok());
        }
    }

    #[test]
    fn test_union() {
        let p = Property::union("id", vec![Property::string(""), Property::integer("")]);
        assert!(p.validate(&json!("abc")).is_ok());
        assert!(p.validate(&json!(7)).is_ok());
        assert!(p.validate(&json!(true)).is_err());
    }

    #[test]
    fn test_coerce_scalars() {
        assert_eq!(Property::integer("n").coerce(json!("42")).unwrap(), json!(42));
        assert_eq!(Property::integer("n").coerce(json!(3.0)).unwrap(), json!(3));
        assert_eq!(Property::float("f").coerce(json!("2.5")).unwrap(), json!(2.5));
        assert_eq!(Property::string("s").coerce(json!(12)).unwrap(), json!("12"));
        assert_eq!(Property::boolean("b").coerce(json!("TRUE")).unwrap(), json!(true));
        assert!(Property::integer("n").coerce(json!("abc")).is_err());
    }

    #[test]
    fn test_coerce_fills_object_defaults() {
        let v = person().coerce(json!({"name": "Ada"})).unwrap();
        assert_eq!(v, json!({"name": "Ada", "age": 0}));
    }

    #[test]
    fn test_coerce_json_encoded_list() {
        let p = Property::list("xs", Property::integer(""));
        assert_eq!(p.coerce(json!("[1, \"2\"]")).unwrap(), json!([1, 2]));
    }

    #[test]
    fn test_infer() {
        let p = Property::infer("out", &json!({"a": 1, "b": ["x"], "c": 1.5}));
        assert!(p.validate(&json!({"a": 2, "b": [], "c": 0.5})).is_ok());
        assert_eq!(p.type_name(), "object{a: integer, b: list<string>, c: float}");

        let mixed = Property::infer("m", &json!([1, "a"]));
        assert_eq!(mixed.type_name(), "list<any>");
    }

    #[test]
    fn test_compatibility() {
        let s = Property::string("s");
        let i = Property::integer("i");
        let f = Property::float("f");
        assert!(s.is_compatible_with(&Property::any("a")));
        assert!(i.is_compatible_with(&f));
        assert!(!f.is_compatible_with(&i));
        assert!(!s.is_compatible_with(&i));

        let list_i = Property::list("l", i.clone());
        let list_f = Property::list("l", f.clone());
        assert!(list_i.is_compatible_with(&list_f));

        let u = Property::union("u", vec![s.clone(), i.clone()]);
        assert!(s.is_compatible_with(&u));
        assert!(!u.is_compatible_with(&s));

        let needs_name = Property::object("o", vec![Property::string("name")]);
        assert!(person().is_compatible_with(&needs_name));
        assert!(needs_name.is_compatible_with(&person()));
        let needs_email = Property::object("o", vec![Property::string("email")]);
        assert!(!person().is_compatible_with(&needs_email));
    }

    #[test]
    fn test_json_schema_roundtrip() {
        let p = person().with_description("A person");
        let schema = p.to_json_schema();
        assert_eq!(schema["type"], "object");
        assert_eq!(schema["required"], json!(["name"]));
        assert_eq!(schema["properties"]["tags"]["type"], "array");

        let back = Property::from_json_schema("person", &schema).unwrap();
        assert_eq!(back.description.as_deref(), Some("A person"));
        assert!(back.validate(&json!({"name": "Ada"})).is_ok());
        assert!(back.validate(&json!({"name": 1})).is_err());
    }

    #[test]
    fn test_from_json_schema_nullable() {
        let p = Property::from_json_schema("x", &json!({"type": ["string", "null"]})).unwrap();
        assert!(p.validate(&json!(null)).is_ok());
        assert!(p.validate(&json!("a")).is_ok());
        assert!(p.validate(&json!(1)).is_err());
    }

    #[test]
    fn test_serde_shape() {
        let p = Property::list("names", Property::string("name"));
        let v = serde_json::to_value(&p).unwrap();
        assert_eq!(v["type"], "list");
        assert_eq!(v["item"]["type"], "string");
        let back: Property = serde_json::from_value(v).unwrap();
        assert_eq!(back, p);
    }

    #[test]
    fn test_coerce_values_missing_required() {
        let props = vec![Property::string("query"), Property::integer("limit").with_default(json!(5))];
        let mut values = ValueMap::new();
        values.insert("query".into(), json!("rust"));
        let out = coerce_values(&props, values, "search").unwrap();
        assert_eq!(out["limit"], json!(5));

        let err = coerce_values(&props, ValueMap::new(), "search").unwrap_err();
        assert!(err.to_string().contains("search.query"));
    }
}
