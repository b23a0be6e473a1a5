use std::collections::BTreeSet;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    /// Suspended at the review gate awaiting the user.
    Pending,
    /// Normal stop: the model produced no further tool calls.
    Stagnant,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMeta {
    pub id: String,
    pub name: String,
    pub model: String,
    pub status: SessionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
    /// Tool names the user accepted for the remainder of the session.
    #[serde(default)]
    pub auto_accept: BTreeSet<String>,
}

impl SessionMeta {
    pub fn new(id: String, name: String, model: String) -> Self {
        Self {
            id,
            name,
            model,
            status: SessionStatus::Running,
            status_message: None,
            auto_accept: BTreeSet::new(),
        }
    }
}

/// Partial metadata update. `None` fields are left untouched; the id is
/// immutable and therefore absent.
#[derive(Debug, Clone, Default)]
pub struct SessionPatch {
    pub name: Option<String>,
    pub model: Option<String>,
    pub status: Option<SessionStatus>,
    pub status_message: Option<Option<String>>,
    pub auto_accept: Option<BTreeSet<String>>,
}

impl SessionPatch {
    pub fn status(status: SessionStatus, message: Option<String>) -> Self {
        Self {
            status: Some(status),
            status_message: Some(message),
            ..Self::default()
        }
    }

    pub fn auto_accept(set: BTreeSet<String>) -> Self {
        Self {
            auto_accept: Some(set),
            ..Self::default()
        }
    }

    pub fn apply(self, meta: &mut SessionMeta) {
        if let Some(name) = self.name {
            meta.name = name;
        }
        if let Some(model) = self.model {
            meta.model = model;
        }
        if let Some(status) = self.status {
            meta.status = status;
        }
        if let Some(message) = self.status_message {
            meta.status_message = message;
        }
        if let Some(accept) = self.auto_accept {
            meta.auto_accept = accept;
        }
    }
}

/// Lexicographically sortable session identifier: the ISO-8601 UTC timestamp
/// with `:` and `.` replaced so it is usable as a directory name.
pub fn new_session_id(now: DateTime<Utc>) -> String {
    now.to_rfc3339_opts(SecondsFormat::Millis, true)
        .replace([':', '.'], "-")
}

/// Strips anything that could escape the session's image directory.
/// Callers must run every externally supplied filename through this.
pub fn sanitize_file_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    cleaned.trim_matches('.').to_string()
}
