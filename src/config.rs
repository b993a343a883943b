//! TOML configuration parsing and validation.
//!
//! Every section carries defaults, so an empty file (or a file with only
//! the sections you want to change) is a valid configuration.
//!
//! ```toml
//! [backend]
//! url = "http://127.0.0.1:9000/mcp"
//! tool_timeout_secs = 8.0
//!
//! [model]
//! protocol = "openai"
//! url = "127.0.0.1:11434/v1"
//! name = "qwen3:0.6b"
//!
//! [sql]
//! backend = "tool"
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub sql: SqlConfig,
    #[serde(default)]
    pub artifacts: ArtifactsConfig,
    #[serde(default)]
    pub report: ReportConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BackendConfig {
    /// MCP streamable-HTTP endpoint of the retrieval backend.
    #[serde(default = "default_backend_url")]
    pub url: String,
    #[serde(default = "default_tool_timeout")]
    pub tool_timeout_secs: f64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: default_backend_url(),
            tool_timeout_secs: default_tool_timeout(),
        }
    }
}

impl BackendConfig {
    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.tool_timeout_secs)
    }
}

fn default_backend_url() -> String {
    "http://127.0.0.1:9000/mcp".to_string()
}
fn default_tool_timeout() -> f64 {
    8.0
}

#[derive(Debug, Deserialize, Clone)]
pub struct ModelConfig {
    #[serde(default = "default_protocol")]
    pub protocol: String,
    #[serde(default = "default_model_url")]
    pub url: String,
    #[serde(default = "default_model_name")]
    pub name: String,
    /// Environment variable holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_model_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            protocol: default_protocol(),
            url: default_model_url(),
            name: default_model_name(),
            api_key_env: default_api_key_env(),
            timeout_secs: default_model_timeout(),
            max_retries: default_max_retries(),
            max_tokens: default_max_tokens(),
        }
    }
}

impl ModelConfig {
    pub fn is_enabled(&self) -> bool {
        self.protocol != "disabled"
    }

    /// API key from the configured environment variable, if set and non-empty.
    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty())
    }
}

fn default_protocol() -> String {
    "openai".to_string()
}
fn default_model_url() -> String {
    "127.0.0.1:11434/v1".to_string()
}
fn default_model_name() -> String {
    "qwen3:0.6b".to_string()
}
fn default_api_key_env() -> String {
    "MODEL_KEY".to_string()
}
fn default_model_timeout() -> u64 {
    120
}
fn default_max_retries() -> u32 {
    2
}
fn default_max_tokens() -> u32 {
    2048
}

#[derive(Debug, Deserialize, Clone)]
pub struct SqlConfig {
    /// `tool` (backend `sql_tool`), `sqlite` (local file), or `disabled`.
    #[serde(default = "default_sql_backend")]
    pub backend: String,
    #[serde(default)]
    pub sqlite_path: Option<PathBuf>,
}

impl Default for SqlConfig {
    fn default() -> Self {
        Self {
            backend: default_sql_backend(),
            sqlite_path: None,
        }
    }
}

fn default_sql_backend() -> String {
    "tool".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ArtifactsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_board_path")]
    pub board_path: PathBuf,
    #[serde(default = "default_report_path")]
    pub report_path: PathBuf,
}

impl Default for ArtifactsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            board_path: default_board_path(),
            report_path: default_report_path(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_board_path() -> PathBuf {
    PathBuf::from("ask.md")
}
fn default_report_path() -> PathBuf {
    PathBuf::from("report.md")
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReportConfig {
    #[serde(default = "default_max_sub_questions")]
    pub max_sub_questions: usize,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            max_sub_questions: default_max_sub_questions(),
            concurrency: default_concurrency(),
        }
    }
}

fn default_max_sub_questions() -> usize {
    crate::report::DEFAULT_MAX_SUB_QUESTIONS
}
fn default_concurrency() -> usize {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// When set, logs are also written to `<dir>/quiknow.log`.
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            dir: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    parse_config(&content)
}

/// Parse and validate configuration text.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;

    // Validate backend
    if !(config.backend.tool_timeout_secs > 0.0 && config.backend.tool_timeout_secs.is_finite()) {
        anyhow::bail!("backend.tool_timeout_secs must be > 0");
    }

    // Validate model
    match config.model.protocol.as_str() {
        "openai" | "anthropic" | "google" | "disabled" => {}
        other => anyhow::bail!(
            "Unknown model protocol: '{}'. Must be openai, anthropic, google, or disabled.",
            other
        ),
    }
    if config.model.is_enabled() && config.model.name.trim().is_empty() {
        anyhow::bail!("model.name must not be empty");
    }

    // Validate sql
    match config.sql.backend.as_str() {
        "tool" | "disabled" => {}
        "sqlite" => {
            if config.sql.sqlite_path.is_none() {
                anyhow::bail!("sql.sqlite_path must be set when sql.backend is 'sqlite'");
            }
        }
        other => anyhow::bail!(
            "Unknown sql backend: '{}'. Must be tool, sqlite, or disabled.",
            other
        ),
    }

    // Validate report
    if config.report.max_sub_questions == 0 {
        anyhow::bail!("report.max_sub_questions must be >= 1");
    }
    if config.report.concurrency == 0 {
        anyhow::bail!("report.concurrency must be >= 1");
    }

    Ok(config)
}
