use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::errors::{DeskPilotError, DeskPilotResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Root directory for session metadata, message logs and image blobs.
    #[serde(default = "default_storage_root")]
    pub storage_root: PathBuf,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub automation: AutomationConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            storage_root: default_storage_root(),
            llm: LlmConfig::default(),
            automation: AutomationConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Planner model used when the client does not select one.
    #[serde(default = "default_planner_model")]
    pub default_model: String,
    /// Model used for bounding-box detection on tiles.
    #[serde(default = "default_grounding_model")]
    pub grounding_model: String,
    #[serde(default = "default_planner_temperature")]
    pub planner_temperature: f32,
    /// Thinking-token allowance for the grounding model.
    #[serde(default = "default_thinking_budget")]
    pub grounding_thinking_budget: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            default_model: default_planner_model(),
            grounding_model: default_grounding_model(),
            planner_temperature: default_planner_temperature(),
            grounding_thinking_budget: default_thinking_budget(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AutomationConfig {
    /// Base URL of the OS-automation service that owns mouse/keyboard/screen.
    #[serde(default)]
    pub endpoint: String,
    /// Bearer token. Falls back to the DESKPILOT_AUTOMATION_TOKEN env var.
    #[serde(default)]
    pub token: Option<String>,
}

impl AutomationConfig {
    pub fn resolved_token(&self) -> Option<String> {
        self.token
            .clone()
            .or_else(|| std::env::var("DESKPILOT_AUTOMATION_TOKEN").ok())
    }
}

fn default_storage_root() -> PathBuf {
    PathBuf::from("sessions")
}

fn default_planner_model() -> String {
    "gemini-2.5-pro".to_string()
}

fn default_grounding_model() -> String {
    "gemini-2.5-flash".to_string()
}

fn default_planner_temperature() -> f32 {
    0.2
}

fn default_thinking_budget() -> u32 {
    256
}

/// Returns the path to an *existing* config.toml for reading.
fn find_config_path() -> DeskPilotResult<PathBuf> {
    if let Ok(exe) = std::env::current_exe() {
        if let Some(parent) = exe.parent() {
            let candidate = parent.join("config.toml");
            if candidate.exists() {
                tracing::debug!(path = %candidate.display(), "config found next to executable");
                return Ok(candidate);
            }
        }
    }
    let cwd = std::env::current_dir()?;
    let candidate = cwd.join("config.toml");
    if candidate.exists() {
        tracing::debug!(path = %candidate.display(), "config found in working directory");
        return Ok(candidate);
    }
    Err(DeskPilotError::Config(
        "config.toml not found next to executable or in working directory".into(),
    ))
}

/// Returns the canonical path where config should be **written**.
/// Does NOT require the file to already exist.
fn write_config_path() -> DeskPilotResult<PathBuf> {
    if let Ok(exe) = std::env::current_exe() {
        if let Some(parent) = exe.parent() {
            return Ok(parent.join("config.toml"));
        }
    }
    Ok(std::env::current_dir()?.join("config.toml"))
}

pub fn load_config() -> DeskPilotResult<AppConfig> {
    let path = find_config_path()?;
    let content = std::fs::read_to_string(&path)?;
    let config: AppConfig = toml::from_str(&content)?;
    tracing::info!(
        path = %path.display(),
        storage = %config.storage_root.display(),
        "config loaded"
    );
    Ok(config)
}

pub fn save_config(config: &AppConfig) -> DeskPilotResult<()> {
    let path = write_config_path()?;
    let content = toml::to_string_pretty(config)?;
    std::fs::write(&path, content)?;
    tracing::info!(path = %path.display(), "config saved");
    Ok(())
}
