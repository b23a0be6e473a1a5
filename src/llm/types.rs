use base64::Engine as _;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenRole {
    User,
    Model,
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// One part of a generator-facing content turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum GenPart {
    Text {
        text: String,
        #[serde(default, skip_serializing_if = "is_false")]
        thought: bool,
    },
    InlineData {
        mime_type: String,
        /// Base64-encoded payload.
        data: String,
    },
    FunctionCall {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        name: String,
        args: serde_json::Value,
    },
    FunctionResponse {
        id: String,
        name: String,
        response: serde_json::Value,
    },
}

impl GenPart {
    pub fn text(text: impl Into<String>) -> Self {
        GenPart::Text {
            text: text.into(),
            thought: false,
        }
    }

    pub fn thought(text: impl Into<String>) -> Self {
        GenPart::Text {
            text: text.into(),
            thought: true,
        }
    }

    pub fn png(bytes: &[u8]) -> Self {
        GenPart::InlineData {
            mime_type: "image/png".to_string(),
            data: base64::engine::general_purpose::STANDARD.encode(bytes),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Content {
    pub role: GenRole,
    pub parts: Vec<GenPart>,
}

impl Content {
    pub fn user(parts: Vec<GenPart>) -> Self {
        Self {
            role: GenRole::User,
            parts,
        }
    }

    pub fn model(parts: Vec<GenPart>) -> Self {
        Self {
            role: GenRole::Model,
            parts,
        }
    }
}

/// Declaration of a callable tool, as presented to the planner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDecl {
    pub name: String,
    pub description: String,
    /// JSON schema for the arguments object.
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThinkingConfig {
    pub include_thoughts: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking_budget: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<ThinkingConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<FunctionDecl>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_schema: Option<serde_json::Value>,
}

/// One streamed slice of a completion. A chunk may carry thought-flagged
/// text, plain text, and/or any number of function calls.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponseChunk {
    pub parts: Vec<GenPart>,
}
