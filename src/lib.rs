//! DeskPilot agent execution core.
//!
//! Drives a screen-observing LLM agent through a plan-ground-review-act
//! loop: screenshots are tiled for a grounding model that turns element
//! descriptions into screen coordinates, grounded tool calls pass a per-turn
//! review gate, and every message lands in an append-only, replayable
//! session log. The HTTP transport, the LLM provider and the OS-automation
//! service stay outside this crate, behind [`llm::ContentGenerator`] and
//! [`tools::ToolRuntime`].

pub mod agent;
pub mod config;
pub mod context;
pub mod errors;
pub mod grounding;
pub mod llm;
pub mod perception;
pub mod store;
pub mod tools;

pub use agent::{AgentEvent, SessionManager};
pub use errors::{DeskPilotError, DeskPilotResult};

/// Initializes tracing from `RUST_LOG` (falling back to `info`) and loads a
/// `.env` file when present. Call once from the embedding application.
pub fn init() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let _ = dotenvy::dotenv();
}
