//! TOML configuration parsing and validation.
//!
//! All settings are read from a single file (default `./config/nlq.toml`).
//! Sections with sensible defaults (`[llm]`, `[graph]`, `[pipeline]`,
//! `[server]`) may be omitted entirely; `[schema]` and `[tabular]` are
//! required.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub schema: SchemaConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    pub tabular: TabularConfig,
    #[serde(default)]
    pub graph: Option<GraphConfig>,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SchemaConfig {
    /// Path to the schema descriptor file (TOML).
    pub path: PathBuf,
}

/// Structured inference provider settings.
#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
    /// Retries for HTTP 429 / 5xx responses only.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub temperature: f32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            base_url: default_base_url(),
            api_key_env: default_api_key_env(),
            timeout_secs: default_llm_timeout_secs(),
            max_retries: default_max_retries(),
            temperature: 0.0,
        }
    }
}

impl LlmConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}
fn default_llm_timeout_secs() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    2
}

#[derive(Debug, Deserialize, Clone)]
pub struct TabularConfig {
    /// `"sqlite"` or `"postgres"`.
    pub kind: String,
    /// sqlx connection URL, e.g. `sqlite:./data/shop.db`.
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_query_timeout_secs")]
    pub query_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GraphConfig {
    /// Base URL of the Neo4j HTTP API, e.g. `http://localhost:7474`.
    pub url: String,
    #[serde(default = "default_graph_database")]
    pub database: String,
    #[serde(default = "default_graph_user")]
    pub user: String,
    #[serde(default = "default_graph_password_env")]
    pub password_env: String,
    #[serde(default = "default_query_timeout_secs")]
    pub query_timeout_secs: u64,
}

fn default_max_connections() -> u32 {
    5
}
fn default_query_timeout_secs() -> u64 {
    15
}
fn default_graph_database() -> String {
    "neo4j".to_string()
}
fn default_graph_user() -> String {
    "neo4j".to_string()
}
fn default_graph_password_env() -> String {
    "NEO4J_PASSWORD".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    /// Upper bound on repair → re-execute cycles per request.
    #[serde(default = "default_max_repairs")]
    pub max_repairs: u32,
    /// Rows shown in the rendered result preview.
    #[serde(default = "default_preview_rows")]
    pub preview_rows: usize,
    #[serde(default)]
    pub summarize: bool,
    /// Rows handed to the summarizer when `summarize` is on.
    #[serde(default = "default_summary_rows")]
    pub summary_rows: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_repairs: default_max_repairs(),
            preview_rows: default_preview_rows(),
            summarize: false,
            summary_rows: default_summary_rows(),
        }
    }
}

fn default_max_repairs() -> u32 {
    3
}
fn default_preview_rows() -> usize {
    10
}
fn default_summary_rows() -> usize {
    20
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7341".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let mut config: Config =
        toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    // Relative schema paths are resolved against the config file's directory
    if config.schema.path.is_relative() {
        if let Some(dir) = path.parent() {
            config.schema.path = dir.join(&config.schema.path);
        }
    }

    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    match config.llm.provider.as_str() {
        "disabled" | "openai" => {}
        other => anyhow::bail!(
            "Unknown llm provider: '{}'. Must be disabled or openai.",
            other
        ),
    }

    if config.llm.is_enabled() && config.llm.model.is_none() {
        anyhow::bail!(
            "llm.model must be specified when provider is '{}'",
            config.llm.provider
        );
    }

    if config.llm.timeout_secs == 0 {
        anyhow::bail!("llm.timeout_secs must be >= 1");
    }

    match config.tabular.kind.as_str() {
        "sqlite" | "postgres" => {}
        other => anyhow::bail!(
            "Unknown tabular kind: '{}'. Must be sqlite or postgres.",
            other
        ),
    }

    if config.tabular.max_connections == 0 {
        anyhow::bail!("tabular.max_connections must be >= 1");
    }

    if config.pipeline.preview_rows == 0 {
        anyhow::bail!("pipeline.preview_rows must be >= 1");
    }

    if config.pipeline.summary_rows == 0 {
        anyhow::bail!("pipeline.summary_rows must be >= 1");
    }

    Ok(())
}
