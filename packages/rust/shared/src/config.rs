//! Application configuration for Dossier.
//!
//! User config lives at `~/.dossier/dossier.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DossierError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "dossier.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".dossier";

// ---------------------------------------------------------------------------
// Config structs (matching dossier.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Run defaults.
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// LLM provider settings.
    #[serde(default)]
    pub llm: LlmConfig,

    /// Web search and page fetch settings.
    #[serde(default)]
    pub search: SearchConfig,

    /// Search/content cache.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Retry and backoff parameters.
    #[serde(default)]
    pub retry: RetryConfig,
}

/// `[defaults]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Directory holding `<slug>_session.json` files.
    #[serde(default = "default_session_dir")]
    pub session_dir: String,

    /// Research mode: "standard" (search + fetch + synthesis) or "integrated".
    #[serde(default = "default_mode")]
    pub mode: String,

    /// Abort the run on the first domain that fails validation.
    #[serde(default)]
    pub strict_mode: bool,

    /// Minimum rows for a table to count as populated.
    #[serde(default = "default_min_rows")]
    pub min_rows_per_table: usize,

    /// Gap-filling retries after the first synthesis attempt.
    #[serde(default = "default_synthesis_retries")]
    pub max_synthesis_retries: u32,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            session_dir: default_session_dir(),
            mode: default_mode(),
            strict_mode: false,
            min_rows_per_table: default_min_rows(),
            max_synthesis_retries: default_synthesis_retries(),
        }
    }
}

fn default_session_dir() -> String {
    "data/sessions".into()
}
fn default_mode() -> String {
    "standard".into()
}
fn default_min_rows() -> usize {
    2
}
fn default_synthesis_retries() -> u32 {
    2
}

/// `[llm]` section (OpenRouter chat-completions API).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_llm_key_env")]
    pub api_key_env: String,

    /// Model used for synthesis and integrated research.
    #[serde(default = "default_model")]
    pub model: String,

    /// API base URL.
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,

    /// Maximum tokens per completion.
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,

    /// Web search result budget for integrated research.
    #[serde(default = "default_search_iterations")]
    pub max_search_iterations: u32,

    /// Request timeout in seconds.
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,

    /// USD per million input tokens.
    #[serde(default = "default_input_cost")]
    pub input_cost_per_mtok: f64,

    /// USD per million output tokens.
    #[serde(default = "default_output_cost")]
    pub output_cost_per_mtok: f64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key_env: default_llm_key_env(),
            model: default_model(),
            base_url: default_llm_base_url(),
            max_output_tokens: default_max_output_tokens(),
            max_search_iterations: default_search_iterations(),
            timeout_secs: default_llm_timeout(),
            input_cost_per_mtok: default_input_cost(),
            output_cost_per_mtok: default_output_cost(),
        }
    }
}

fn default_llm_key_env() -> String {
    "OPENROUTER_API_KEY".into()
}
fn default_model() -> String {
    "anthropic/claude-sonnet-4".into()
}
fn default_llm_base_url() -> String {
    "https://openrouter.ai/api/v1".into()
}
fn default_max_output_tokens() -> u32 {
    8000
}
fn default_search_iterations() -> u32 {
    15
}
fn default_llm_timeout() -> u64 {
    300
}
fn default_input_cost() -> f64 {
    3.0
}
fn default_output_cost() -> f64 {
    15.0
}

/// `[search]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Name of the env var holding the Brave Search API key.
    #[serde(default = "default_search_key_env")]
    pub api_key_env: String,

    /// Search API base URL.
    #[serde(default = "default_search_base_url")]
    pub base_url: String,

    /// Results requested per query.
    #[serde(default = "default_max_results")]
    pub max_results: u32,

    /// How many top results per query get their page fetched.
    #[serde(default = "default_top_fetch")]
    pub top_results_to_fetch: usize,

    /// Delay between non-cached search requests.
    #[serde(default = "default_search_delay")]
    pub search_delay_ms: u64,

    /// Per-page character cap for fetched content.
    #[serde(default = "default_max_content_chars")]
    pub max_content_chars: usize,

    /// Page fetch timeout in seconds.
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_secs: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            api_key_env: default_search_key_env(),
            base_url: default_search_base_url(),
            max_results: default_max_results(),
            top_results_to_fetch: default_top_fetch(),
            search_delay_ms: default_search_delay(),
            max_content_chars: default_max_content_chars(),
            fetch_timeout_secs: default_fetch_timeout(),
        }
    }
}

fn default_search_key_env() -> String {
    "BRAVE_API_KEY".into()
}
fn default_search_base_url() -> String {
    "https://api.search.brave.com/res/v1".into()
}
fn default_max_results() -> u32 {
    10
}
fn default_top_fetch() -> usize {
    3
}
fn default_search_delay() -> u64 {
    1000
}
fn default_max_content_chars() -> usize {
    15_000
}
fn default_fetch_timeout() -> u64 {
    30
}

/// `[cache]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Whether search/fetch results are cached at all.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// libSQL database path.
    #[serde(default = "default_cache_path")]
    pub path: String,

    /// Entry lifetime in hours.
    #[serde(default = "default_ttl_hours")]
    pub ttl_hours: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: default_cache_path(),
            ttl_hours: default_ttl_hours(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_cache_path() -> String {
    "data/cache/cache.db".into()
}
fn default_ttl_hours() -> u64 {
    24 * 7
}

/// `[retry]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Attempts per HTTP call (first try included).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Lower bound on the backoff wait.
    #[serde(default = "default_min_wait")]
    pub min_wait_ms: u64,

    /// Upper bound on the backoff wait.
    #[serde(default = "default_max_wait")]
    pub max_wait_ms: u64,

    /// Base of the `base * 2^attempt` wait after a failed synthesis call.
    #[serde(default = "default_synthesis_backoff")]
    pub synthesis_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            min_wait_ms: default_min_wait(),
            max_wait_ms: default_max_wait(),
            synthesis_backoff_ms: default_synthesis_backoff(),
        }
    }
}

fn default_max_attempts() -> u32 {
    4
}
fn default_min_wait() -> u64 {
    2_000
}
fn default_max_wait() -> u64 {
    60_000
}
fn default_synthesis_backoff() -> u64 {
    1_000
}

// ---------------------------------------------------------------------------
// Runtime configs (merged from config + CLI flags)
// ---------------------------------------------------------------------------

/// How a domain gathers its evidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResearchMode {
    /// Web search + page fetch, then synthesis with gap-filling retries.
    Standard,
    /// A single LLM call with built-in web search.
    Integrated,
}

impl ResearchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::Integrated => "integrated",
        }
    }
}

impl FromStr for ResearchMode {
    type Err = DossierError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "standard" => Ok(Self::Standard),
            "integrated" => Ok(Self::Integrated),
            other => Err(DossierError::config(format!(
                "unknown research mode '{other}': expected 'standard' or 'integrated'"
            ))),
        }
    }
}

/// Runtime research configuration for one pipeline run.
#[derive(Debug, Clone)]
pub struct ResearchConfig {
    pub mode: ResearchMode,
    pub strict_mode: bool,
    pub min_rows_per_table: usize,
    pub max_synthesis_retries: u32,
    /// Base wait for exception backoff inside the synthesis loop.
    pub synthesis_backoff: Duration,
    pub session_dir: PathBuf,
}

impl TryFrom<&AppConfig> for ResearchConfig {
    type Error = DossierError;

    fn try_from(config: &AppConfig) -> Result<Self> {
        Ok(Self {
            mode: config.defaults.mode.parse()?,
            strict_mode: config.defaults.strict_mode,
            min_rows_per_table: config.defaults.min_rows_per_table,
            max_synthesis_retries: config.defaults.max_synthesis_retries,
            synthesis_backoff: Duration::from_millis(config.retry.synthesis_backoff_ms),
            session_dir: expand_home(&config.defaults.session_dir),
        })
    }
}

/// Runtime settings for the search-and-fetch evidence phase.
#[derive(Debug, Clone)]
pub struct SearchSettings {
    pub max_results: u32,
    pub top_results_to_fetch: usize,
    pub search_delay: Duration,
    pub max_content_chars: usize,
}

impl From<&AppConfig> for SearchSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            max_results: config.search.max_results,
            top_results_to_fetch: config.search.top_results_to_fetch,
            search_delay: Duration::from_millis(config.search.search_delay_ms),
            max_content_chars: config.search.max_content_chars,
        }
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.dossier/`).
pub fn config_dir() -> Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| DossierError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.dossier/dossier.toml`).
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
    let content = std::fs::read_to_string(path).map_err(|e| DossierError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| DossierError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| DossierError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| DossierError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| DossierError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Read an API key from the named env var, rejecting empty and placeholder values.
pub fn resolve_api_key(var_name: &str) -> Result<String> {
    match std::env::var(var_name) {
        Ok(val) if is_placeholder_key(&val) => Err(DossierError::config(format!(
            "the {var_name} environment variable holds a placeholder value"
        ))),
        Ok(val) => Ok(val),
        _ => Err(DossierError::config(format!(
            "API key not found. Set the {var_name} environment variable."
        ))),
    }
}

/// Check the LLM key, and the search key when the run needs it.
pub fn validate_api_keys(config: &AppConfig, mode: ResearchMode) -> Result<()> {
    resolve_api_key(&config.llm.api_key_env)?;
    if mode == ResearchMode::Standard {
        resolve_api_key(&config.search.api_key_env)?;
    }
    Ok(())
}

fn is_placeholder_key(val: &str) -> bool {
    let val = val.trim();
    val.is_empty() || val.starts_with("your-") || val == "xxx"
}

/// Expand a leading `~/` to the user's home directory.
pub fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| PathBuf::from(path)),
        None => PathBuf::from(path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize default config");
        assert!(toml_str.contains("session_dir"));
        assert!(toml_str.contains("OPENROUTER_API_KEY"));
        assert!(toml_str.contains("BRAVE_API_KEY"));
    }

    #[test]
    fn config_roundtrip() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize");
        let parsed: AppConfig = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(parsed.defaults.min_rows_per_table, 2);
        assert_eq!(parsed.defaults.max_synthesis_retries, 2);
        assert_eq!(parsed.llm.api_key_env, "OPENROUTER_API_KEY");
        assert_eq!(parsed.retry.max_attempts, 4);
    }

    #[test]
    fn partial_config_fills_defaults() {
        let toml_str = r#"
[defaults]
mode = "integrated"
strict_mode = true

[search]
top_results_to_fetch = 5
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        assert!(config.defaults.strict_mode);
        assert_eq!(config.search.top_results_to_fetch, 5);
        assert_eq!(config.search.max_results, 10);
        assert_eq!(config.cache.ttl_hours, 168);

        let research = ResearchConfig::try_from(&config).expect("research config");
        assert_eq!(research.mode, ResearchMode::Integrated);
        assert!(research.strict_mode);
    }

    #[test]
    fn unknown_mode_is_rejected() {
        let mut config = AppConfig::default();
        config.defaults.mode = "turbo".into();
        let err = ResearchConfig::try_from(&config).unwrap_err();
        assert!(err.to_string().contains("unknown research mode"));
    }

    #[test]
    fn search_settings_from_app_config() {
        let app = AppConfig::default();
        let settings = SearchSettings::from(&app);
        assert_eq!(settings.max_results, 10);
        assert_eq!(settings.top_results_to_fetch, 3);
        assert_eq!(settings.search_delay, Duration::from_millis(1000));
    }

    #[test]
    fn api_key_validation() {
        // Use a unique env var name to avoid interfering with other tests
        let result = resolve_api_key("DOSSIER_TEST_NONEXISTENT_KEY_12345");
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("API key not found"));
    }

    #[test]
    fn placeholder_keys_are_detected() {
        assert!(is_placeholder_key(""));
        assert!(is_placeholder_key("your-key-here"));
        assert!(is_placeholder_key("xxx"));
        assert!(!is_placeholder_key("sk-or-v1-abc"));
    }

    #[test]
    fn expand_home_leaves_relative_paths() {
        assert_eq!(expand_home("data/sessions"), PathBuf::from("data/sessions"));
    }
}
