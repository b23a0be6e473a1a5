use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Scheme used by image parts to reference blobs stored under a session.
pub const INTERNAL_SCHEME: &str = "internal://";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Model,
    Tool,
    /// System-generated narration: screenshots, tile sets, review prompts.
    Workflow,
    GroundingModel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
    pub id: String,
    pub name: String,
    pub args: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Part {
    Text { text: String },
    /// Model chain-of-thought. Shown to the user, never sent back to the LLM.
    Thought { text: String },
    FunctionCall { id: String, name: String, args: serde_json::Value },
    /// `response` is either `{"output": ...}` or `{"error": ...}`.
    FunctionResponse { id: String, name: String, response: serde_json::Value },
    /// Reference of the form `internal://<session>/<file>`.
    Image { reference: String },
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Part::Text { text: text.into() }
    }

    pub fn image_ref(session_id: &str, file_name: &str) -> Self {
        Part::Image {
            reference: format!("{INTERNAL_SCHEME}{session_id}/{file_name}"),
        }
    }

    /// Splits an `internal://<session>/<file>` reference into its components.
    pub fn parse_internal_ref(reference: &str) -> Option<(&str, &str)> {
        let rest = reference.strip_prefix(INTERNAL_SCHEME)?;
        let (session, file) = rest.split_once('/')?;
        if session.is_empty() || file.is_empty() {
            return None;
        }
        Some((session, file))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewChoice {
    AcceptOnce,
    AcceptSession,
    RejectOnce,
}

/// Review attachment pairing a grounded tool call with the user's verdict.
/// Request and response are linked by `review_id`, never by reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ToolReview {
    Request {
        review_id: String,
        grounded_call: FunctionCall,
        original_call: FunctionCall,
    },
    Response {
        review_id: String,
        choice: ReviewChoice,
    },
}

/// One entry in a session's append-only log. Immutable once appended.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub parts: Vec<Part>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review: Option<ToolReview>,
    /// `Some(true)` = user-visible only, `Some(false)` = LLM-only, `None` = both.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub for_display: Option<bool>,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn new(role: Role, parts: Vec<Part>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role,
            parts,
            review: None,
            for_display: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_review(mut self, review: ToolReview) -> Self {
        self.review = Some(review);
        self
    }

    /// Marks the message user-visible only (excluded from LLM history).
    pub fn display_only(mut self) -> Self {
        self.for_display = Some(true);
        self
    }

    /// Marks the message LLM-only (excluded from client views).
    pub fn hidden(mut self) -> Self {
        self.for_display = Some(false);
        self
    }

    pub fn is_hidden(&self) -> bool {
        self.for_display == Some(false)
    }
}
