//! Application configuration for articleforge.
//!
//! User config lives at `~/.articleforge/articleforge.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{ArticleForgeError, Result};
use crate::standards::{StandardsOverride, StandardsProfile};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "articleforge.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".articleforge";

// ---------------------------------------------------------------------------
// Config structs (matching articleforge.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub defaults: DefaultsConfig,

    #[serde(default)]
    pub openrouter: OpenRouterConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub verification: VerificationConfig,

    #[serde(default)]
    pub linking: LinkingConfig,

    #[serde(default)]
    pub freshness: FreshnessConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    /// Default standards profile.
    #[serde(default)]
    pub standards: StandardsProfile,

    /// Per-market standards profiles.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub standards_overrides: Vec<StandardsOverride>,
}

impl AppConfig {
    /// The standards profile for `market`, falling back to the default one.
    pub fn standards_for(&self, market: &str) -> &StandardsProfile {
        self.standards_overrides
            .iter()
            .find(|o| o.market.eq_ignore_ascii_case(market))
            .map(|o| &o.profile)
            .unwrap_or(&self.standards)
    }

    pub fn validate(&self) -> Result<()> {
        self.standards.validate()?;
        for o in &self.standards_overrides {
            o.profile.validate()?;
        }
        if self.defaults.concurrency == 0 {
            return Err(ArticleForgeError::config("defaults.concurrency must be at least 1"));
        }
        if self.retry.max_attempts == 0 {
            return Err(ArticleForgeError::config("retry.max_attempts must be at least 1"));
        }
        if self.linking.min_links > self.linking.max_links {
            return Err(ArticleForgeError::config(
                "linking.min_links must not exceed linking.max_links",
            ));
        }
        Ok(())
    }
}

/// `[defaults]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Default directory for run output.
    #[serde(default = "default_output_dir")]
    pub output_dir: String,

    #[serde(default = "default_language")]
    pub language: String,

    #[serde(default = "default_market")]
    pub market: String,

    /// Batch default word count.
    #[serde(default = "default_word_count")]
    pub word_count: u32,

    /// Canonical path prefix for article slugs.
    #[serde(default = "default_path_prefix")]
    pub path_prefix: String,

    /// Maximum keyword runs in flight.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            language: default_language(),
            market: default_market(),
            word_count: default_word_count(),
            path_prefix: default_path_prefix(),
            concurrency: default_concurrency(),
        }
    }
}

fn default_output_dir() -> String {
    "~/articleforge-output".into()
}
fn default_language() -> String {
    "en".into()
}
fn default_market() -> String {
    "US".into()
}
fn default_word_count() -> u32 {
    2000
}
fn default_path_prefix() -> String {
    "/blog".into()
}
fn default_concurrency() -> usize {
    3
}

/// `[openrouter]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenRouterConfig {
    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Model for structured text calls.
    #[serde(default = "default_model")]
    pub default_model: String,

    /// Model for image calls.
    #[serde(default = "default_image_model")]
    pub image_model: String,

    /// Timeout applied to every external call.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Results per grounded call.
    #[serde(default = "default_search_results")]
    pub search_results: u32,
}

impl Default for OpenRouterConfig {
    fn default() -> Self {
        Self {
            api_key_env: default_api_key_env(),
            base_url: default_base_url(),
            default_model: default_model(),
            image_model: default_image_model(),
            request_timeout_secs: default_request_timeout(),
            search_results: default_search_results(),
        }
    }
}

fn default_api_key_env() -> String {
    "OPENROUTER_API_KEY".into()
}
fn default_base_url() -> String {
    "https://openrouter.ai/api/v1".into()
}
fn default_model() -> String {
    "google/gemini-2.5-flash".into()
}
fn default_image_model() -> String {
    "google/gemini-2.5-flash-image".into()
}
fn default_request_timeout() -> u64 {
    120
}
fn default_search_results() -> u32 {
    5
}

/// `[retry]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts for transient failures, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Extra attempts after a malformed response, each with a stricter prompt.
    #[serde(default = "default_malformed_retries")]
    pub malformed_retries: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
            malformed_retries: default_malformed_retries(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}
fn default_base_delay() -> u64 {
    500
}
fn default_max_delay() -> u64 {
    8000
}
fn default_malformed_retries() -> u32 {
    1
}

/// `[verification]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationConfig {
    /// Sources checked per run; later ones are left unverified.
    #[serde(default = "default_max_urls")]
    pub max_urls: usize,

    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,

    #[serde(default = "default_probe_concurrency")]
    pub probe_concurrency: usize,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            max_urls: default_max_urls(),
            probe_timeout_secs: default_probe_timeout(),
            probe_concurrency: default_probe_concurrency(),
        }
    }
}

fn default_max_urls() -> usize {
    20
}
fn default_probe_timeout() -> u64 {
    10
}
fn default_probe_concurrency() -> usize {
    8
}

/// `[linking]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkingConfig {
    #[serde(default = "default_max_links")]
    pub max_links: usize,

    #[serde(default = "default_min_links")]
    pub min_links: usize,

    #[serde(default = "default_max_pool")]
    pub max_pool: usize,
}

impl Default for LinkingConfig {
    fn default() -> Self {
        Self {
            max_links: default_max_links(),
            min_links: default_min_links(),
            max_pool: default_max_pool(),
        }
    }
}

fn default_max_links() -> usize {
    5
}
fn default_min_links() -> usize {
    3
}
fn default_max_pool() -> usize {
    40
}

/// `[freshness]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FreshnessConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for FreshnessConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

fn default_true() -> bool {
    true
}

/// `[cache]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Database path; defaults to `~/.articleforge/articleforge.db`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.articleforge/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| ArticleForgeError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.articleforge/articleforge.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Path of the local database used for the call cache and run history.
pub fn database_path(config: &AppConfig) -> Result<PathBuf> {
    match &config.cache.path {
        Some(path) => Ok(expand_home(path)),
        None => Ok(config_dir()?.join("articleforge.db")),
    }
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

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load and validate the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| ArticleForgeError::io(path, e))?;

    let config: AppConfig = toml::from_str(&content).map_err(|e| {
        ArticleForgeError::config(format!("failed to parse {}: {e}", path.display()))
    })?;
    config.validate()?;
    Ok(config)
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| ArticleForgeError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| ArticleForgeError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| ArticleForgeError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Check that the OpenRouter API key env var is set and non-empty.
pub fn validate_api_key(config: &AppConfig) -> Result<String> {
    let var_name = &config.openrouter.api_key_env;
    match std::env::var(var_name) {
        Ok(val) if !val.is_empty() => Ok(val),
        _ => Err(ArticleForgeError::config(format!(
            "OpenRouter API key not found. Set the {var_name} environment variable.\n\
             Get a key at https://openrouter.ai/keys"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize default config");
        assert!(toml_str.contains("output_dir"));
        assert!(toml_str.contains("OPENROUTER_API_KEY"));
        assert!(toml_str.contains("banned_phrases"));
    }

    #[test]
    fn config_roundtrip() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize");
        let parsed: AppConfig = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(parsed.defaults.word_count, 2000);
        assert_eq!(parsed.retry.max_attempts, 3);
        assert_eq!(parsed.linking.max_links, 5);
        assert_eq!(parsed.verification.max_urls, 20);
        assert!(parsed.freshness.enabled);
    }

    #[test]
    fn market_override_selects_profile() {
        let toml_str = r#"
[defaults]
market = "DE"

[[standards_overrides]]
market = "de"

[standards_overrides.profile]
name = "germany"
min_statistics = 10
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        assert_eq!(config.standards_for("DE").name, "germany");
        assert_eq!(config.standards_for("DE").min_statistics, 10);
        assert_eq!(config.standards_for("US").name, "default");
    }

    #[test]
    fn validation_rejects_zero_concurrency() {
        let mut config = AppConfig::default();
        config.defaults.concurrency = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn expand_home_leaves_absolute_paths() {
        assert_eq!(expand_home("/tmp/x.db"), PathBuf::from("/tmp/x.db"));
    }

    #[test]
    fn api_key_validation() {
        let mut config = AppConfig::default();
        // Use a unique env var name to avoid interfering with other tests
        config.openrouter.api_key_env = "AF_TEST_NONEXISTENT_KEY_12345".into();
        let result = validate_api_key(&config);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("API key not found"));
    }
}
