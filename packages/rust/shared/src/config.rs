//! Application configuration for Cellforge.
//!
//! User config lives at `~/.cellforge/cellforge.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{CellforgeError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "cellforge.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".cellforge";

/// Upper bound for concurrent model calls regardless of configuration.
pub const MAX_INFERENCE_CONCURRENCY: usize = 10;

// ---------------------------------------------------------------------------
// Config structs (matching cellforge.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub inference: InferenceConfig,

    #[serde(default)]
    pub embedding: EmbeddingConfig,

    #[serde(default)]
    pub search: SearchConfig,

    #[serde(default)]
    pub scrape: ScrapeConfig,
}

/// `[storage]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding `cellforge.db`.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

impl StorageConfig {
    /// Path of the libSQL database file.
    pub fn database_path(&self) -> PathBuf {
        Path::new(&self.data_dir).join("cellforge.db")
    }
}

fn default_data_dir() -> String {
    "./data".into()
}

/// `[inference]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceConfig {
    /// OpenAI-compatible base URL (`/chat/completions` is appended).
    #[serde(default = "default_inference_endpoint")]
    pub endpoint: String,

    /// Name of the env var holding the access token (never store the token itself).
    #[serde(default = "default_hf_token_env")]
    pub api_key_env: String,

    #[serde(default = "default_model")]
    pub default_model: String,

    #[serde(default = "default_provider")]
    pub default_provider: String,

    /// Per-call timeout; a timed-out call is recorded as a cell error.
    #[serde(default = "default_inference_timeout")]
    pub timeout_ms: u64,

    /// Concurrent model calls for dependent columns (clamped to 10).
    #[serde(default = "default_inference_concurrency")]
    pub max_concurrency: usize,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            endpoint: default_inference_endpoint(),
            api_key_env: default_hf_token_env(),
            default_model: default_model(),
            default_provider: default_provider(),
            timeout_ms: default_inference_timeout(),
            max_concurrency: default_inference_concurrency(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
        }
    }
}

impl InferenceConfig {
    /// Configured concurrency, bounded to `1..=MAX_INFERENCE_CONCURRENCY`.
    pub fn effective_concurrency(&self) -> usize {
        self.max_concurrency.clamp(1, MAX_INFERENCE_CONCURRENCY)
    }
}

fn default_inference_endpoint() -> String {
    "https://router.huggingface.co/v1".into()
}
fn default_hf_token_env() -> String {
    "HF_TOKEN".into()
}
fn default_model() -> String {
    "meta-llama/Llama-3.3-70B-Instruct".into()
}
fn default_provider() -> String {
    "nebius".into()
}
fn default_inference_timeout() -> u64 {
    90_000
}
fn default_inference_concurrency() -> usize {
    5
}
fn default_max_tokens() -> u32 {
    512
}
fn default_temperature() -> f32 {
    0.1
}

/// `[embedding]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// OpenAI-compatible base URL (`/embeddings` is appended).
    #[serde(default = "default_embedding_endpoint")]
    pub endpoint: String,

    #[serde(default = "default_hf_token_env")]
    pub api_key_env: String,

    #[serde(default = "default_embedding_model")]
    pub model: String,

    #[serde(default = "default_dimensions")]
    pub dimensions: usize,

    /// Documents per embedding request.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Embedding requests in flight.
    #[serde(default = "default_embedding_concurrency")]
    pub concurrency: usize,

    /// Hard cap on documents embedded per indexing call.
    #[serde(default = "default_max_chunks")]
    pub max_chunks: usize,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            endpoint: default_embedding_endpoint(),
            api_key_env: default_hf_token_env(),
            model: default_embedding_model(),
            dimensions: default_dimensions(),
            batch_size: default_batch_size(),
            concurrency: default_embedding_concurrency(),
            max_chunks: default_max_chunks(),
            max_retries: default_max_retries(),
        }
    }
}

fn default_embedding_endpoint() -> String {
    "https://router.huggingface.co/hf-inference/v1".into()
}
fn default_embedding_model() -> String {
    "mixedbread-ai/mxbai-embed-large-v1".into()
}
fn default_dimensions() -> usize {
    1024
}
fn default_batch_size() -> usize {
    2
}
fn default_embedding_concurrency() -> usize {
    12
}
fn default_max_chunks() -> usize {
    1000
}
fn default_max_retries() -> u32 {
    3
}

/// `[search]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    #[serde(default = "default_search_endpoint")]
    pub endpoint: String,

    #[serde(default = "default_search_key_env")]
    pub api_key_env: String,

    #[serde(default = "default_results_per_query")]
    pub results_per_query: usize,

    /// Queries derived from an instruction.
    #[serde(default = "default_max_queries")]
    pub max_queries: usize,

    /// Sources kept after deduplication across queries.
    #[serde(default = "default_max_sources")]
    pub max_sources: usize,

    /// Domains excluded from both the query string and the results.
    #[serde(default = "default_blocklist")]
    pub blocklist: Vec<String>,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            endpoint: default_search_endpoint(),
            api_key_env: default_search_key_env(),
            results_per_query: default_results_per_query(),
            max_queries: default_max_queries(),
            max_sources: default_max_sources(),
            blocklist: default_blocklist(),
        }
    }
}

fn default_search_endpoint() -> String {
    "https://google.serper.dev/search".into()
}
fn default_search_key_env() -> String {
    "SERPER_API_KEY".into()
}
fn default_results_per_query() -> usize {
    5
}
fn default_max_queries() -> usize {
    1
}
fn default_max_sources() -> usize {
    5
}
fn default_blocklist() -> Vec<String> {
    ["youtube.com", "facebook.com", "instagram.com", "tiktok.com", "x.com", "twitter.com"]
        .into_iter()
        .map(String::from)
        .collect()
}

/// `[scrape]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapeConfig {
    #[serde(default = "default_scrape_timeout")]
    pub timeout_ms: u64,

    #[serde(default = "default_max_chars_per_element")]
    pub max_chars_per_element: i64,

    #[serde(default = "default_max_total_content_length")]
    pub max_total_content_length: usize,

    /// Pages fetched in parallel.
    #[serde(default = "default_scrape_concurrency")]
    pub concurrency: usize,
}

impl Default for ScrapeConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_scrape_timeout(),
            max_chars_per_element: default_max_chars_per_element(),
            max_total_content_length: default_max_total_content_length(),
            concurrency: default_scrape_concurrency(),
        }
    }
}

fn default_scrape_timeout() -> u64 {
    15_000
}
fn default_max_chars_per_element() -> i64 {
    1000
}
fn default_max_total_content_length() -> usize {
    25_000
}
fn default_scrape_concurrency() -> usize {
    5
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.cellforge/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| CellforgeError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.cellforge/cellforge.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| CellforgeError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| CellforgeError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| CellforgeError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let content = toml::to_string_pretty(&AppConfig::default())
        .map_err(|e| CellforgeError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| CellforgeError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Read a credential from the env var named `var_name`.
///
/// Missing credentials are configuration errors and surface to the caller.
pub fn resolve_key(var_name: &str) -> Result<String> {
    match std::env::var(var_name) {
        Ok(val) if !val.is_empty() => Ok(val),
        _ => Err(CellforgeError::config(format!(
            "credential not found. Set the {var_name} environment variable."
        ))),
    }
}
