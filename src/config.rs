use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

/// Top-level configuration loaded from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub matching: MatchingConfig,
    pub session: SessionConfig,
    pub cache: CacheConfig,
    pub services: ServicesConfig,
    pub commands: CommandsConfig,
    pub processing: ProcessingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MatchingConfig {
    /// Maximum nesting of recursive re-matches.
    #[serde(default = "default_max_recursion_depth")]
    pub max_recursion_depth: usize,
    /// Maximum recursive re-matches, nested or not, in one evaluation.
    #[serde(default = "default_max_rematches")]
    pub max_rematches: usize,
    /// Response used when nothing matches. Empty echoes the input back.
    #[serde(default)]
    pub default_response: String,
    #[serde(default = "default_split_sentences")]
    pub split_sentences: bool,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            max_recursion_depth: default_max_recursion_depth(),
            max_rematches: default_max_rematches(),
            default_response: String::new(),
            split_sentences: default_split_sentences(),
        }
    }
}

fn default_max_recursion_depth() -> usize {
    32
}
fn default_max_rematches() -> usize {
    1024
}
fn default_split_sentences() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Entries kept per history kind (input, that, request, response).
    #[serde(default = "default_history_depth")]
    pub history_depth: usize,
    #[serde(default = "default_max_variables")]
    pub max_variables: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            history_depth: default_history_depth(),
            max_variables: default_max_variables(),
        }
    }
}

fn default_history_depth() -> usize {
    10
}
fn default_max_variables() -> usize {
    1024
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_enabled")]
    pub enabled: bool,
    /// Capacity of each cache instance.
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,
    /// Capacity of the compiled-pattern cache, which holds one entry per rule.
    #[serde(default = "default_pattern_capacity")]
    pub pattern_capacity: usize,
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: default_cache_enabled(),
            capacity: default_cache_capacity(),
            pattern_capacity: default_pattern_capacity(),
            ttl_secs: default_cache_ttl_secs(),
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

fn default_cache_enabled() -> bool {
    true
}
fn default_cache_capacity() -> usize {
    1024
}
fn default_pattern_capacity() -> usize {
    16_384
}
fn default_cache_ttl_secs() -> u64 {
    300
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServicesConfig {
    #[serde(default = "default_service_timeout_ms")]
    pub timeout_ms: u64,
    /// Returned when a service call fails and the tag has no `default`.
    #[serde(default = "default_service_fallback")]
    pub fallback: String,
    /// Service name to URL template. `{query}` is replaced by the encoded query.
    #[serde(default)]
    pub endpoints: HashMap<String, String>,
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_service_timeout_ms(),
            fallback: default_service_fallback(),
            endpoints: HashMap::new(),
        }
    }
}

impl ServicesConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_service_timeout_ms() -> u64 {
    5000
}
fn default_service_fallback() -> String {
    "I could not reach that service.".into()
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommandsConfig {
    /// Inputs starting with this prefix bypass matching.
    #[serde(default = "default_command_prefix")]
    pub prefix: String,
}

impl Default for CommandsConfig {
    fn default() -> Self {
        Self {
            prefix: default_command_prefix(),
        }
    }
}

fn default_command_prefix() -> String {
    "/".into()
}

/// Processing deadline. Exposed for callers wrapping `Engine::process`;
/// the engine itself never enforces it.
#[derive(Debug, Clone, Deserialize)]
pub struct ProcessingConfig {
    #[serde(default = "default_processing_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_processing_timeout_ms(),
        }
    }
}

impl ProcessingConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_processing_timeout_ms() -> u64 {
    10_000
}

/// Load configuration from file or use defaults.
///
/// Search order:
/// 1. `RULEWEAVE_CONFIG` env var
/// 2. `~/.ruleweave/config.toml`
/// 3. Zero-config defaults (no file needed)
pub fn load() -> anyhow::Result<EngineConfig> {
    let path = config_path();

    if path.exists() {
        let content = std::fs::read_to_string(&path)
            .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
        let config = from_toml_str(&content)
            .map_err(|e| anyhow::anyhow!("invalid config at {}: {e}", path.display()))?;

        info!("loaded config from {}", path.display());
        Ok(config)
    } else {
        info!("no config file found, using zero-config defaults");
        Ok(EngineConfig::default())
    }
}

/// Parse and validate a TOML config document.
pub fn from_toml_str(content: &str) -> anyhow::Result<EngineConfig> {
    let config: EngineConfig = toml::from_str(content)?;
    validate(&config)?;
    Ok(config)
}

fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var("RULEWEAVE_CONFIG") {
        return PathBuf::from(path);
    }
    crate::fs_util::state_dir().join("config.toml")
}

/// Validate the config and return clear error messages.
pub fn validate(config: &EngineConfig) -> anyhow::Result<()> {
    if config.matching.max_recursion_depth == 0 {
        anyhow::bail!("matching.max_recursion_depth must be > 0");
    }

    if config.matching.max_rematches < config.matching.max_recursion_depth {
        anyhow::bail!("matching.max_rematches must be >= matching.max_recursion_depth");
    }

    if config.session.history_depth == 0 {
        anyhow::bail!("session.history_depth must be > 0");
    }

    if config.cache.enabled && (config.cache.capacity == 0 || config.cache.pattern_capacity == 0)
    {
        anyhow::bail!("cache capacities must be > 0 when caching is enabled");
    }

    for (name, endpoint) in &config.services.endpoints {
        if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
            anyhow::bail!("services.endpoints.{name} must be an http(s) URL, got '{endpoint}'");
        }
    }

    if config.commands.prefix.trim().is_empty() {
        anyhow::bail!("commands.prefix must not be empty");
    }

    Ok(())
}
