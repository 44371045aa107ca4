use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use reqwest::{Method, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use stepwise_core::error::{Result, StepwiseError};
use stepwise_core::property::Property;
use stepwise_core::template::SimpleRenderer;
use stepwise_core::traits::{AuthProvider, Renderer, Tool};
use stepwise_core::types::{ToolContext, ToolOutput, ValueMap};

/// Declarative description of an HTTP-backed tool. Every string is a
/// `{{ placeholder }}` template over the call arguments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteToolConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub inputs: Vec<Property>,
    #[serde(default)]
    pub output: Option<Property>,
    #[serde(default = "default_method")]
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
    /// Hosts the rendered URL may point at. `*.example.com` matches
    /// subdomains, `*` matches anything.
    pub allowed_hosts: Vec<String>,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub requires_confirmation: bool,
}

fn default_method() -> String { "GET".to_string() }
fn default_timeout() -> u64 { 30 }

/// The request a remote tool would send for a given set of arguments.
#[derive(Debug, Clone)]
pub struct PreparedRequest {
    pub method: Method,
    pub url: Url,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

pub struct RemoteTool {
    config: RemoteToolConfig,
    method: Method,
    client: reqwest::Client,
    auth: Option<Arc<dyn AuthProvider>>,
}

impl RemoteTool {
    pub fn new(config: RemoteToolConfig) -> Result<Self> {
        if config.allowed_hosts.is_empty() {
            return Err(StepwiseError::Config(format!(
                "remote tool '{}' needs at least one allowed host",
                config.name
            )));
        }
        let method = Method::from_bytes(config.method.to_ascii_uppercase().as_bytes())
            .map_err(|e| StepwiseError::Config(format!("remote tool '{}': {}", config.name, e)))?;
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .user_agent("Stepwise/0.3")
            .build()
            .map_err(|e| StepwiseError::Config(format!("failed to create HTTP client: {}", e)))?;
        Ok(Self {
            config,
            method,
            client,
            auth: None,
        })
    }

    pub fn from_config(config: &Value) -> Result<Self> {
        let config: RemoteToolConfig = serde_json::from_value(config.clone())
            .map_err(|e| StepwiseError::Deserialization(format!("remote tool: {}", e)))?;
        Self::new(config)
    }

    pub fn with_auth(mut self, provider: Arc<dyn AuthProvider>) -> Self {
        self.auth = Some(provider);
        self
    }

    fn host_allowed(&self, host: &str) -> bool {
        self.config.allowed_hosts.iter().any(|pattern| {
            if pattern == "*" {
                true
            } else if let Some(suffix) = pattern.strip_prefix("*.") {
                host.ends_with(&format!(".{}", suffix))
            } else {
                pattern.eq_ignore_ascii_case(host)
            }
        })
    }

    /// Render and check the request without sending it. The host allow-list
    /// is enforced here, before any network traffic.
    pub fn prepare(&self, args: &Value) -> Result<PreparedRequest> {
        let bindings: ValueMap = args.as_object().cloned().unwrap_or_default();
        let encoded: ValueMap = bindings
            .iter()
            .map(|(k, v)| {
                let raw = match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (k.clone(), Value::String(urlencoding::encode(&raw).into_owned()))
            })
            .collect();

        let renderer = SimpleRenderer;
        let url_text = renderer.render(&self.config.url, &encoded)?;
        let url = Url::parse(&url_text).map_err(|e| self.error(format!("invalid URL '{}': {}", url_text, e)))?;

        if !matches!(url.scheme(), "http" | "https") {
            return Err(self.error(format!("unsupported scheme '{}'", url.scheme())));
        }
        let host = url.host_str().unwrap_or_default();
        if !self.host_allowed(host) {
            return Err(self.error(format!("host '{}' is not in the allow-list", host)));
        }

        let headers = self
            .config
            .headers
            .iter()
            .map(|(k, v)| Ok((k.clone(), renderer.render(v, &bindings)?)))
            .collect::<Result<Vec<_>>>()?;

        let body = match &self.config.body {
            Some(template) => Some(renderer.render(template, &bindings)?),
            None if self.method != Method::GET => Some(args.to_string()),
            None => None,
        };

        Ok(PreparedRequest {
            method: self.method.clone(),
            url,
            headers,
            body,
        })
    }

    fn error(&self, message: String) -> StepwiseError {
        StepwiseError::ToolExecution {
            tool: self.config.name.clone(),
            message,
        }
    }
}

impl Tool for RemoteTool {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn description(&self) -> &str {
        &self.config.description
    }

    fn inputs(&self) -> Vec<Property> {
        self.config.inputs.clone()
    }

    fn output(&self) -> Option<Property> {
        self.config.output.clone()
    }

    fn timeout_secs(&self) -> u64 {
        self.config.timeout_secs
    }

    fn requires_confirmation(&self) -> bool {
        self.config.requires_confirmation
    }

    fn auth(&self) -> Option<Arc<dyn AuthProvider>> {
        self.auth.clone()
    }

    fn execute(&self, args: Value, ctx: ToolContext) -> BoxFuture<'_, Result<ToolOutput>> {
        Box::pin(async move {
            let prepared = self.prepare(&args)?;
            debug!(tool = %self.config.name, url = %prepared.url, "Calling remote tool");

            let mut request = self.client.request(prepared.method, prepared.url);
            for (k, v) in prepared.headers {
                request = request.header(k, v);
            }
            if let Some(body) = prepared.body {
                request = request
                    .header(reqwest::header::CONTENT_TYPE, "application/json")
                    .body(body);
            }
            if let Some(token) = ctx.auth_token {
                request = request.bearer_auth(token);
            }

            let resp = request
                .send()
                .await
                .map_err(|e| self.error(format!("Request failed: {}", e)))?;

            let status = resp.status();
            if !status.is_success() {
                return Err(self.error(format!(
                    "HTTP {} {}",
                    status.as_u16(),
                    status.canonical_reason().unwrap_or("Unknown")
                )));
            }

            let text = resp
                .text()
                .await
                .map_err(|e| self.error(format!("Failed to read response body: {}", e)))?;
            let value = serde_json::from_str(&text).unwrap_or(Value::String(text));
            Ok(ToolOutput::Value(value))
        })
    }

    fn to_config(&self) -> Value {
        let mut config = serde_json::to_value(&self.config).unwrap_or_default();
        if let Value::Object(map) = &mut config {
            map.insert("tool_type".into(), Value::String("remote".into()));
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn weather() -> RemoteTool {
        RemoteTool::new(RemoteToolConfig {
            name: "weather".into(),
            description: "Current weather".into(),
            inputs: vec![Property::string("city")],
            output: None,
            method: "get".into(),
            url: "https://api.example.com/weather?q={{ city }}".into(),
            headers: BTreeMap::from([("X-City".to_string(), "{{city}}".to_string())]),
            body: None,
            allowed_hosts: vec!["api.example.com".into()],
            timeout_secs: 5,
            requires_confirmation: false,
        })
        .unwrap()
    }

    #[test]
    fn test_prepare_encodes_url_arguments() {
        let req = weather().prepare(&json!({"city": "São Paulo & co"})).unwrap();
        assert_eq!(req.method, Method::GET);
        assert_eq!(
            req.url.as_str(),
            "https://api.example.com/weather?q=S%C3%A3o%20Paulo%20%26%20co"
        );
        assert_eq!(req.headers, vec![("X-City".to_string(), "São Paulo & co".to_string())]);
        assert!(req.body.is_none());
    }

    #[test]
    fn test_host_outside_allow_list_is_rejected() {
        let mut config = weather().config.clone();
        config.url = "https://{{ host }}/steal".into();
        let tool = RemoteTool::new(config).unwrap();
        let err = tool.prepare(&json!({"host": "evil.test"})).unwrap_err();
        assert!(err.to_string().contains("allow-list"));
    }

    #[test]
    fn test_wildcard_hosts() {
        let mut config = weather().config.clone();
        config.allowed_hosts = vec!["*.example.com".into()];
        let tool = RemoteTool::new(config).unwrap();
        assert!(tool.host_allowed("api.example.com"));
        assert!(!tool.host_allowed("example.com.evil.test"));
    }

    #[test]
    fn test_empty_allow_list_is_config_error() {
        let mut config = weather().config.clone();
        config.allowed_hosts.clear();
        assert!(matches!(RemoteTool::new(config), Err(StepwiseError::Config(_))));
    }

    #[test]
    fn test_post_defaults_to_json_body() {
        let mut config = weather().config.clone();
        config.method = "POST".into();
        let tool = RemoteTool::new(config).unwrap();
        let req = tool.prepare(&json!({"city": "Oslo"})).unwrap();
        assert_eq!(req.body.as_deref(), Some("{\"city\":\"Oslo\"}"));
    }

    #[test]
    fn test_config_roundtrip() {
        let config = weather().to_config();
        assert_eq!(config["tool_type"], "remote");
        let back = RemoteTool::from_config(&config).unwrap();
        assert_eq!(back.name(), "weather");
    }
}
