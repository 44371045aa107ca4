use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use crate::error::{Result, StepwiseError};
use crate::traits::Renderer;
use crate::types::ValueMap;

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*(?:\.[A-Za-z0-9_]+)*)\s*\}\}")
            .expect("placeholder regex is valid")
    })
}

/// `{{ name }}` substitution with dotted lookups into objects and lists
/// (`{{ user.name }}`, `{{ items.0 }}`). Strings render verbatim, other
/// values as compact JSON. An unbound placeholder is a validation error.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimpleRenderer;

impl SimpleRenderer {
    fn lookup<'v>(bindings: &'v ValueMap, path: &str) -> Option<&'v Value> {
        let mut parts = path.split('.');
        let mut current = bindings.get(parts.next()?)?;
        for part in parts {
            current = match current {
                Value::Object(map) => map.get(part)?,
                Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }
}

impl Renderer for SimpleRenderer {
    fn render(&self, template: &str, bindings: &ValueMap) -> Result<String> {
        let mut out = String::with_capacity(template.len());
        let mut last = 0;
        for caps in placeholder_re().captures_iter(template) {
            let (Some(whole), Some(path)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            out.push_str(&template[last..whole.start()]);
            let value = Self::lookup(bindings, path.as_str()).ok_or_else(|| {
                StepwiseError::validation(path.as_str(), "no value bound for template placeholder")
            })?;
            match value {
                Value::String(s) => out.push_str(s),
                other => out.push_str(&other.to_string()),
            }
            last = whole.end();
        }
        out.push_str(&template[last..]);
        Ok(out)
    }

    fn placeholders(&self, template: &str) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for caps in placeholder_re().captures_iter(template) {
            if let Some(path) = caps.get(1) {
                let root = path.as_str().split('.').next().unwrap_or_default().to_string();
                if !names.contains(&root) {
                    names.push(root);
                }
            }
        }
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bindings(v: Value) -> ValueMap {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn test_render_simple() {
        let out = SimpleRenderer
            .render("Hello {{name}}, you are {{ age }}.", &bindings(json!({"name": "Ada", "age": 36})))
            .unwrap();
        assert_eq!(out, "Hello Ada, you are 36.");
    }

    #[test]
    fn test_render_dotted_paths() {
        let b = bindings(json!({"user": {"name": "Ada", "langs": ["en", "fr"]}}));
        let out = SimpleRenderer
            .render("{{user.name}} speaks {{ user.langs.1 }}", &b)
            .unwrap();
        assert_eq!(out, "Ada speaks fr");
    }

    #[test]
    fn test_render_missing_binding() {
        let err = SimpleRenderer.render("Hi {{ who }}", &ValueMap::new()).unwrap_err();
        assert_eq!(err.kind(), "Validation");
    }

    #[test]
    fn test_placeholders_dedup_roots() {
        let names = SimpleRenderer.placeholders("{{a}} {{ b.c }} {{a}} {{b.d}}");
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn test_no_placeholders() {
        assert_eq!(SimpleRenderer.render("plain", &ValueMap::new()).unwrap(), "plain");
        assert!(SimpleRenderer.placeholders("plain").is_empty());
    }
}
