//! Plain HTTP transport.
//!
//! Registers the project's tools with the HTTP server on start, checks
//! liveness by listing tools, and posts commands to `/command`. In `Http`
//! mode the manager pairs it with the websocket hub, which carries pushes.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{TransportClient, TransportError, TransportState};

/// A parameter of a registered tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolParameter {
    /// Parameter name.
    pub name: String,
    /// Human-readable description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON type name (`string`, `integer`, `number`, `boolean`, `array`, `object`).
    #[serde(rename = "type", default = "default_param_type")]
    pub param_type: String,
    /// Whether callers must supply it.
    #[serde(default = "default_true")]
    pub required: bool,
    /// Default value, as text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<String>,
}

fn default_param_type() -> String {
    "string".to_string()
}

fn default_true() -> bool {
    true
}

/// A tool announced to the HTTP server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Tool name, unique across projects.
    pub name: String,
    /// Human-readable description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Whether the tool returns structured output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured_output: Option<bool>,
    /// Declared parameters.
    #[serde(default)]
    pub parameters: Vec<ToolParameter>,
}

/// Settings for [`HttpTransport`].
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Server base URL, e.g. `http://localhost:8080`.
    pub base_url: String,
    /// Key the server files our tools under.
    pub project_id: String,
    /// Tools registered on start.
    pub tools: Vec<ToolDefinition>,
    /// Per-request timeout.
    pub request_timeout: Duration,
}

#[derive(Serialize)]
struct RegisterToolsRequest<'a> {
    project_id: &'a str,
    tools: &'a [ToolDefinition],
}

/// [`TransportClient`] speaking plain HTTP.
#[derive(Debug)]
pub struct HttpTransport {
    config: HttpConfig,
    base_url: String,
    client: reqwest::Client,
    session_id: Mutex<Option<String>>,
    last_error: Mutex<Option<String>>,
}

impl HttpTransport {
    /// Create a stopped transport.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Configuration` if the base URL is not an
    /// absolute `http`/`https` URL or the client cannot be built.
    pub fn new(config: HttpConfig) -> Result<Self, TransportError> {
        let parsed = reqwest::Url::parse(&config.base_url).map_err(|e| {
            TransportError::Configuration(format!("invalid HTTP base URL '{}': {e}", config.base_url))
        })?;
        if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
            return Err(TransportError::Configuration(format!(
                "HTTP base URL must be http(s)://host: {}",
                config.base_url
            )));
        }

        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| TransportError::Configuration(format!("Failed to build HTTP client: {e:#}")))?;

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            config,
            client,
            session_id: Mutex::new(None),
            last_error: Mutex::new(None),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn session(&self) -> Option<String> {
        self.session_id.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn set_session(&self, session: Option<String>) {
        *self.session_id.lock().unwrap_or_else(PoisonError::into_inner) = session;
    }

    fn set_error(&self, error: Option<String>) {
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = error;
    }
}

#[async_trait]
impl TransportClient for HttpTransport {
    fn name(&self) -> &str {
        "http"
    }

    async fn start(&self) -> bool {
        if self.session().is_some() {
            return true;
        }

        let body = RegisterToolsRequest {
            project_id: &self.config.project_id,
            tools: &self.config.tools,
        };
        let result = self.client.post(self.url("/register-tools")).json(&body).send().await;

        match result {
            Ok(response) if response.status().is_success() => {
                log::info!(
                    "[Http] Registered {} tool(s) for project {} at {}",
                    self.config.tools.len(),
                    self.config.project_id,
                    self.base_url
                );
                self.set_session(Some(uuid::Uuid::new_v4().to_string()));
                self.set_error(None);
                true
            }
            Ok(response) => {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                log::warn!("[Http] Tool registration failed ({}): {}", status, body);
                self.set_error(Some(format!("register-tools returned {status}")));
                false
            }
            Err(e) => {
                log::warn!("[Http] Cannot reach {}: {e:#}", self.base_url);
                self.set_error(Some(format!("{e:#}")));
                false
            }
        }
    }

    async fn stop(&self) {
        if self.session().is_none() {
            return;
        }

        let url = self.url(&format!("/tools/{}", self.config.project_id));
        match self.client.delete(url).send().await {
            Ok(response) if !response.status().is_success() => {
                log::debug!("[Http] Unregister returned {}", response.status());
            }
            Ok(_) => {}
            Err(e) => log::debug!("[Http] Unregister failed: {e:#}"),
        }
        self.set_session(None);
    }

    async fn verify(&self) -> bool {
        if self.session().is_none() {
            return false;
        }
        match self.client.get(self.url("/tools")).send().await {
            Ok(response) if response.status().is_success() => true,
            Ok(response) => {
                log::warn!("[Http] Verify returned {}", response.status());
                false
            }
            Err(e) => {
                log::warn!("[Http] Verify failed: {e:#}");
                false
            }
        }
    }

    async fn send_command(&self, command_json: &str) -> Result<String, TransportError> {
        if self.session().is_none() {
            return Err(TransportError::InvalidOperation("http transport is not started".into()));
        }

        let response = self
            .client
            .post(self.url("/command"))
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(command_json.to_string())
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TransportError::Timeout
                } else {
                    TransportError::SendFailed(format!("{e:#}"))
                }
            })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| TransportError::SendFailed(format!("Failed to read response: {e:#}")))?;

        if !status.is_success() {
            return Err(TransportError::SendFailed(format!("command returned {status}: {body}")));
        }
        Ok(body)
    }

    fn state(&self) -> TransportState {
        match self.session() {
            Some(session) => TransportState::connected(self.name())
                .with_session_id(Some(session))
                .with_details(Some(self.base_url.clone())),
            None => {
                let error = self.last_error.lock().unwrap_or_else(PoisonError::into_inner).clone();
                TransportState::disconnected(self.name(), error).with_details(Some(self.base_url.clone()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(base_url: &str) -> HttpConfig {
        HttpConfig {
            base_url: base_url.to_string(),
            project_id: "abc123".to_string(),
            tools: Vec::new(),
            request_timeout: Duration::from_secs(2),
        }
    }

    #[test]
    fn test_invalid_base_url_rejected_at_construction() {
        assert!(matches!(
            HttpTransport::new(config("not a url")),
            Err(TransportError::Configuration(_))
        ));
        assert!(matches!(
            HttpTransport::new(config("ftp://localhost")),
            Err(TransportError::Configuration(_))
        ));
    }

    #[test]
    fn test_trailing_slash_trimmed() {
        let transport = HttpTransport::new(config("http://localhost:8080/")).unwrap();
        assert_eq!(transport.url("/tools"), "http://localhost:8080/tools");
    }

    #[test]
    fn test_tool_definition_defaults() {
        let tool: ToolDefinition = serde_json::from_str(
            r#"{"name":"bake","parameters":[{"name":"scene"}]}"#,
        )
        .unwrap();
        assert_eq!(tool.parameters[0].param_type, "string");
        assert!(tool.parameters[0].required);

        let json = serde_json::to_value(&tool).unwrap();
        assert_eq!(json["parameters"][0]["type"], "string");
    }

    #[tokio::test]
    async fn test_send_before_start_is_invalid_operation() {
        let transport = HttpTransport::new(config("http://localhost:8080")).unwrap();
        assert!(matches!(
            transport.send_command("{}").await,
            Err(TransportError::InvalidOperation(_))
        ));
        assert!(!transport.verify().await);
        assert!(!transport.state().is_connected());
    }
}
