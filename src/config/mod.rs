//! Configuration management for leadline
//!
//! Handles loading, saving, and validating configuration from TOML files.

mod defaults;

pub use defaults::*;

use crate::client::RetryPolicy;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Webhook server settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Database settings
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Durable audio storage
    #[serde(default)]
    pub storage: StorageConfig,

    /// Call-provider API
    #[serde(default)]
    pub provider: ProviderConfig,

    /// Transcription backend
    #[serde(default)]
    pub transcription: TranscriptionConfig,

    /// Content-analysis backend
    #[serde(default)]
    pub analysis: AnalysisConfig,

    /// Outbound rate limits and retry policy
    #[serde(default)]
    pub outbound: OutboundConfig,

    /// Pipeline behaviour
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// CRM sync
    #[serde(default)]
    pub crm: CrmConfig,

    /// Paths configuration (internal, not user-editable)
    #[serde(skip)]
    pub paths: PathsConfig,
}

/// Webhook server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Socket address to listen on
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Accepted skew of the optional timestamp header, in seconds
    #[serde(default = "default_timestamp_tolerance_secs")]
    pub timestamp_tolerance_secs: i64,

    /// Largest accepted webhook body
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Override for the SQLite file (defaults to `<base>/leadline.db`)
    #[serde(default)]
    pub path: Option<PathBuf>,

    #[serde(default = "default_db_max_connections")]
    pub max_connections: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Override for the audio directory (defaults to `<base>/audio`)
    #[serde(default)]
    pub audio_dir: Option<PathBuf>,
}

/// Call-provider API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default = "default_provider_base_url")]
    pub base_url: String,

    #[serde(default = "default_http_timeout")]
    pub timeout_secs: u64,

    /// Credential reference -> token, for setups without environment secrets.
    /// References missing here are read from the environment variable of the same name.
    #[serde(default)]
    pub credentials: HashMap<String, String>,
}

/// Transcription backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptionConfig {
    #[serde(default = "default_transcription_url")]
    pub base_url: String,

    /// Environment variable name for the API key (empty = no auth)
    #[serde(default = "default_transcription_api_key_env")]
    pub api_key_env: String,

    #[serde(default = "default_language_code")]
    pub language_code: String,

    #[serde(default = "default_sample_rate_hertz")]
    pub sample_rate_hertz: u32,

    #[serde(default = "default_audio_encoding")]
    pub encoding: String,

    #[serde(default = "default_min_speakers")]
    pub min_speakers: u32,

    #[serde(default = "default_max_speakers")]
    pub max_speakers: u32,

    #[serde(default = "default_http_timeout")]
    pub timeout_secs: u64,
}

/// Content-analysis backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    #[serde(default = "default_analysis_url")]
    pub base_url: String,

    /// Environment variable name for the API key (empty = no auth)
    #[serde(default = "default_analysis_api_key_env")]
    pub api_key_env: String,

    #[serde(default = "default_analysis_model")]
    pub model: String,

    #[serde(default = "default_analysis_temperature")]
    pub temperature: f32,

    #[serde(default = "default_analysis_max_tokens")]
    pub max_tokens: u32,

    #[serde(default = "default_spam_max_tokens")]
    pub spam_max_tokens: u32,

    /// Extra invocations after a response that fails to parse
    #[serde(default = "default_parse_retries")]
    pub parse_retries: u32,

    #[serde(default = "default_http_timeout")]
    pub timeout_secs: u64,
}

/// Outbound request budget
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundConfig {
    /// Tokens per window for the call-provider API
    #[serde(default = "default_provider_requests_per_window")]
    pub provider_requests_per_window: u32,

    /// Tokens per window shared by transcription, analysis and CRM calls
    #[serde(default = "default_services_requests_per_window")]
    pub services_requests_per_window: u32,

    /// Refill interval in seconds
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    /// Concurrent outbound calls per client
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,

    #[serde(default)]
    pub retry: RetryConfig,
}

/// Backoff policy for outbound calls
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_retry_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_retry_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_retry_max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "default_unavailable_delay_secs")]
    pub unavailable_delay_secs: u64,

    #[serde(default = "default_unavailable_max_attempts")]
    pub unavailable_max_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Wall-clock ceiling, from the start of the request's retry window, before it is failed for review
    #[serde(default = "default_max_retry_window_secs")]
    pub max_retry_window_secs: u64,

    /// Age after which a worker's claim on a request is considered abandoned
    #[serde(default = "default_claim_timeout_secs")]
    pub claim_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrmConfig {
    /// Consecutive failures before an integration is marked degraded
    #[serde(default = "default_crm_degraded_threshold")]
    pub degraded_threshold: u32,

    #[serde(default = "default_http_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_hubspot_base_url")]
    pub hubspot_base_url: String,
}

/// Internal paths configuration
#[derive(Debug, Clone, Default)]
pub struct PathsConfig {
    /// Base directory for leadline data
    pub base_dir: PathBuf,

    /// Path to config file
    pub config_file: PathBuf,

    /// Path to SQLite database
    pub db_file: PathBuf,

    /// Directory for stored recordings
    pub audio_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            timestamp_tolerance_secs: default_timestamp_tolerance_secs(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: None,
            max_connections: default_db_max_connections(),
        }
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: default_provider_base_url(),
            timeout_secs: default_http_timeout(),
            credentials: HashMap::new(),
        }
    }
}

impl Default for TranscriptionConfig {
    fn default() -> Self {
        Self {
            base_url: default_transcription_url(),
            api_key_env: default_transcription_api_key_env(),
            language_code: default_language_code(),
            sample_rate_hertz: default_sample_rate_hertz(),
            encoding: default_audio_encoding(),
            min_speakers: default_min_speakers(),
            max_speakers: default_max_speakers(),
            timeout_secs: default_http_timeout(),
        }
    }
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            base_url: default_analysis_url(),
            api_key_env: default_analysis_api_key_env(),
            model: default_analysis_model(),
            temperature: default_analysis_temperature(),
            max_tokens: default_analysis_max_tokens(),
            spam_max_tokens: default_spam_max_tokens(),
            parse_retries: default_parse_retries(),
            timeout_secs: default_http_timeout(),
        }
    }
}

impl Default for OutboundConfig {
    fn default() -> Self {
        Self {
            provider_requests_per_window: default_provider_requests_per_window(),
            services_requests_per_window: default_services_requests_per_window(),
            window_secs: default_window_secs(),
            max_in_flight: default_max_in_flight(),
            retry: RetryConfig::default(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_retry_max_attempts(),
            base_delay_ms: default_retry_base_delay_ms(),
            max_delay_ms: default_retry_max_delay_ms(),
            unavailable_delay_secs: default_unavailable_delay_secs(),
            unavailable_max_attempts: default_unavailable_max_attempts(),
        }
    }
}

impl RetryConfig {
    /// Build the runtime retry policy
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            unavailable_delay: Duration::from_secs(self.unavailable_delay_secs),
            unavailable_max_attempts: self.unavailable_max_attempts,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_retry_window_secs: default_max_retry_window_secs(),
            claim_timeout_secs: default_claim_timeout_secs(),
        }
    }
}

impl Default for CrmConfig {
    fn default() -> Self {
        Self {
            degraded_threshold: default_crm_degraded_threshold(),
            timeout_secs: default_http_timeout(),
            hubspot_base_url: default_hubspot_base_url(),
        }
    }
}

impl Config {
    /// Get the default base directory for leadline (~/.leadline)
    pub fn default_base_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".leadline")
    }

    /// Get the default config file path
    pub fn default_config_path() -> PathBuf {
        Self::default_base_dir().join("config.toml")
    }

    /// Derive paths from the base directory, honouring explicit overrides
    pub fn init_paths(&mut self, base_dir: Option<PathBuf>) {
        let base = base_dir.unwrap_or_else(Self::default_base_dir);
        self.paths = PathsConfig {
            config_file: base.join("config.toml"),
            db_file: self
                .database
                .path
                .clone()
                .unwrap_or_else(|| base.join("leadline.db")),
            audio_dir: self
                .storage
                .audio_dir
                .clone()
                .unwrap_or_else(|| base.join("audio")),
            base_dir: base,
        };
    }

    /// Load configuration from a specific file path
    pub fn load(config_path: &Path) -> Result<Self> {
        debug!("Loading config from {:?}", config_path);

        if !config_path.exists() {
            return Err(Error::Config(format!(
                "Config file not found: {}",
                config_path.display()
            )));
        }

        let content = std::fs::read_to_string(config_path)?;
        let mut config: Config = toml::from_str(&content)?;

        let base = config_path.parent().unwrap_or(Path::new(".")).to_path_buf();
        config.init_paths(Some(base));
        config.paths.config_file = config_path.to_path_buf();

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a base directory, falling back to defaults
    pub fn load_from(base_dir: Option<PathBuf>) -> Result<Self> {
        let mut config = Config::default();
        config.init_paths(base_dir.clone());

        if config.paths.config_file.exists() {
            debug!("Loading config from {:?}", config.paths.config_file);
            let content = std::fs::read_to_string(&config.paths.config_file)?;
            let mut loaded: Config = toml::from_str(&content)?;
            loaded.init_paths(base_dir);
            config = loaded;
        } else {
            debug!("No config file found, using defaults");
        }

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.paths.config_file.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(&self.paths.config_file, content)?;
        info!("Saved config to {:?}", self.paths.config_file);
        Ok(())
    }

    /// Resolve a call-provider credential reference to its token
    pub fn resolve_credential(&self, reference: &str) -> Result<String> {
        if let Some(token) = self.provider.credentials.get(reference) {
            return Ok(token.clone());
        }
        std::env::var(reference).map_err(|_| {
            Error::Config(format!("Credential reference '{}' is not set", reference))
        })
    }

    /// API key for the transcription backend, if configured
    pub fn transcription_api_key(&self) -> Option<String> {
        env_secret(&self.transcription.api_key_env)
    }

    /// API key for the analysis backend, if configured
    pub fn analysis_api_key(&self) -> Option<String> {
        env_secret(&self.analysis.api_key_env)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.outbound.provider_requests_per_window == 0
            || self.outbound.services_requests_per_window == 0
        {
            return Err(Error::Config(
                "outbound request budgets must be positive".to_string(),
            ));
        }

        if self.outbound.window_secs == 0 {
            return Err(Error::Config(
                "outbound.window_secs must be positive".to_string(),
            ));
        }

        if self.outbound.max_in_flight == 0 {
            return Err(Error::Config(
                "outbound.max_in_flight must be positive".to_string(),
            ));
        }

        if self.outbound.retry.max_attempts == 0 || self.outbound.retry.unavailable_max_attempts == 0
        {
            return Err(Error::Config(
                "outbound.retry attempt ceilings must be at least 1".to_string(),
            ));
        }

        if self.pipeline.claim_timeout_secs == 0 {
            return Err(Error::Config(
                "pipeline.claim_timeout_secs must be positive".to_string(),
            ));
        }

        if self.outbound.retry.base_delay_ms > self.outbound.retry.max_delay_ms {
            return Err(Error::Config(
                "outbound.retry.base_delay_ms must be <= max_delay_ms".to_string(),
            ));
        }

        if self.transcription.min_speakers == 0
            || self.transcription.min_speakers > self.transcription.max_speakers
        {
            return Err(Error::Config(
                "transcription speaker bounds must satisfy 1 <= min <= max".to_string(),
            ));
        }

        if !(0.0..=2.0).contains(&self.analysis.temperature) {
            return Err(Error::Config(
                "analysis.temperature must be between 0.0 and 2.0".to_string(),
            ));
        }

        if self.pipeline.max_retry_window_secs == 0 {
            return Err(Error::Config(
                "pipeline.max_retry_window_secs must be positive".to_string(),
            ));
        }

        if self.crm.degraded_threshold == 0 {
            return Err(Error::Config(
                "crm.degraded_threshold must be at least 1".to_string(),
            ));
        }

        if self.server.timestamp_tolerance_secs <= 0 {
            return Err(Error::Config(
                "server.timestamp_tolerance_secs must be positive".to_string(),
            ));
        }

        Ok(())
    }
}

fn env_secret(name: &str) -> Option<String> {
    if name.is_empty() {
        return None;
    }
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.outbound.window_secs, 60);
        assert_eq!(config.pipeline.max_retry_window_secs, 3600);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_save_load() {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::default();
        config.init_paths(Some(tmp.path().to_path_buf()));
        config.analysis.model = "test-model".to_string();
        config
            .provider
            .credentials
            .insert("ACME_TOKEN".to_string(), "secret".to_string());

        config.save().unwrap();
        assert!(config.paths.config_file.exists());

        let loaded = Config::load_from(Some(tmp.path().to_path_buf())).unwrap();
        assert_eq!(loaded.analysis.model, "test-model");
        assert_eq!(loaded.paths.db_file, tmp.path().join("leadline.db"));
        assert_eq!(loaded.resolve_credential("ACME_TOKEN").unwrap(), "secret");
    }

    #[test]
    fn test_path_overrides() {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::default();
        config.database.path = Some(tmp.path().join("custom.db"));
        config.init_paths(Some(tmp.path().to_path_buf()));
        assert_eq!(config.paths.db_file, tmp.path().join("custom.db"));
        assert_eq!(config.paths.audio_dir, tmp.path().join("audio"));
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();

        config.outbound.retry.max_attempts = 0;
        assert!(config.validate().is_err());
        config.outbound.retry.max_attempts = 3;
        assert!(config.validate().is_ok());

        config.transcription.min_speakers = 5;
        assert!(config.validate().is_err());
        config.transcription.min_speakers = 2;

        config.crm.degraded_threshold = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_credential_is_config_error() {
        let config = Config::default();
        let err = config
            .resolve_credential("LEADLINE_TEST_SURELY_UNSET_REF")
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
