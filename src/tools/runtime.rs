use async_trait::async_trait;
use base64::Engine as _;
use serde::Deserialize;

use crate::errors::{DeskPilotError, DeskPilotResult};

/// Result of one remote tool invocation.
#[derive(Debug, Clone)]
pub enum ToolOutput {
    Text(String),
    /// Inline image payload; only screenshots produce this.
    InlinePng(Vec<u8>),
}

/// Seam to the OS-automation service that owns the actual mouse, keyboard
/// and screen. A global, single-user resource: at most one active session
/// per controlled machine.
#[async_trait]
pub trait ToolRuntime: Send + Sync {
    async fn execute(&self, name: &str, args: &serde_json::Value) -> DeskPilotResult<ToolOutput>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ToolCallResponse {
    #[serde(default)]
    output: Option<String>,
    #[serde(default)]
    inline_data: Option<InlineData>,
    #[serde(default)]
    error: Option<String>,
}

/// HTTP client for the remote tool endpoint.
pub struct HttpToolRuntime {
    client: reqwest::Client,
    endpoint: String,
    token: Option<String>,
}

impl HttpToolRuntime {
    pub fn new(endpoint: impl Into<String>, token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            token,
        }
    }
}

#[async_trait]
impl ToolRuntime for HttpToolRuntime {
    async fn execute(&self, name: &str, args: &serde_json::Value) -> DeskPilotResult<ToolOutput> {
        let body = serde_json::json!({ "name": name, "arguments": args });
        tracing::debug!(tool = %name, "dispatching tool call");

        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let err_body = response.text().await.unwrap_or_default();
            return Err(DeskPilotError::ToolRuntime(format!("{status}: {err_body}")));
        }

        let parsed: ToolCallResponse = response.json().await?;
        if let Some(error) = parsed.error {
            return Err(DeskPilotError::ToolRuntime(error));
        }
        if let Some(inline) = parsed.inline_data {
            if inline.mime_type != "image/png" {
                return Err(DeskPilotError::ToolRuntime(format!(
                    "unsupported inline mimeType '{}'",
                    inline.mime_type
                )));
            }
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(inline.data.as_bytes())
                .map_err(|e| {
                    DeskPilotError::ToolRuntime(format!("invalid inline image payload: {e}"))
                })?;
            return Ok(ToolOutput::InlinePng(bytes));
        }
        Ok(ToolOutput::Text(parsed.output.unwrap_or_default()))
    }
}
