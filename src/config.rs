use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub vault: VaultConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub llm: LlmConfig,
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
    "127.0.0.1:8742".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct VaultConfig {
    /// Root of the note tree. Insights live under `<path>/Insights`.
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Quiet period after the last file event before a note is re-indexed.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            path: None,
            debounce_ms: default_debounce_ms(),
        }
    }
}

fn default_debounce_ms() -> u64 {
    300
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    /// Base URL of the Chroma server.
    #[serde(default = "default_index_url")]
    pub url: String,
    #[serde(default = "default_collection")]
    pub collection: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            url: default_index_url(),
            collection: default_collection(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_index_url() -> String {
    "http://localhost:8000".to_string()
}
fn default_collection() -> String {
    "personal_ontology_insights".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_model")]
    pub model: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model: default_embedding_model(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: default_llm_model(),
            timeout_secs: default_llm_timeout_secs(),
        }
    }
}

fn default_llm_model() -> String {
    "gpt-4-turbo-preview".to_string()
}
fn default_llm_timeout_secs() -> u64 {
    60
}

impl Config {
    /// The OpenAI API key comes from the environment, never the config file.
    pub fn openai_api_key() -> Result<String> {
        std::env::var("OPENAI_API_KEY").context("OPENAI_API_KEY environment variable not set")
    }

    pub fn vault_path_resolved(&self) -> Option<PathBuf> {
        self.vault
            .path
            .as_ref()
            .map(|p| p.canonicalize().unwrap_or_else(|_| p.clone()))
    }
}

/// Load configuration from a TOML file.
///
/// A missing file is not an error: every setting has a default, so the
/// server can start from nothing but `OPENAI_API_KEY`.
pub fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.vault.debounce_ms == 0 {
        anyhow::bail!("vault.debounce_ms must be > 0");
    }

    if config.server.bind.is_empty() {
        anyhow::bail!("server.bind must not be empty");
    }

    if config.index.collection.is_empty() {
        anyhow::bail!("index.collection must not be empty");
    }

    Ok(config)
}
