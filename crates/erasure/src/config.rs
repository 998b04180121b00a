use erasure_core::{EndpointConfiguration, DEFAULT_RETENTION_DAYS};
use erasure_notify::{PipelineSecret, RetryPolicy, WorkerConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ErasureError, ErasureResult};
use crate::handler::{HandlerOptions, MalformedPolicy, UrlSource};

pub const ENV_VERIFICATION_TOKEN: &str = "EBAY_VERIFICATION_TOKEN";
pub const ENV_ENDPOINT_URL: &str = "EBAY_ENDPOINT_URL";
pub const ENV_DATABASE_PATH: &str = "ERASURE_DATABASE_PATH";
pub const ENV_PIPELINE_URL: &str = "ERASURE_PIPELINE_URL";
pub const ENV_PIPELINE_SECRET: &str = "ERASURE_PIPELINE_SECRET";

const TOKEN_MIN_LEN: usize = 32;
const TOKEN_MAX_LEN: usize = 80;

/// Verification token and registered URL, as given to the platform.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct EndpointConfig {
    #[serde(default)]
    pub verification_token: Option<String>,

    #[serde(default)]
    pub endpoint_url: Option<String>,
}

impl std::fmt::Debug for EndpointConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointConfig")
            .field(
                "verification_token",
                &self.verification_token.as_ref().map(|_| "<redacted>"),
            )
            .field("endpoint_url", &self.endpoint_url)
            .finish()
    }
}

/// HTTP server settings for `erasure serve`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Take the request host from `X-Forwarded-Host`.
    #[serde(default)]
    pub trust_forwarded_host: bool,
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            trust_forwarded_host: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// SQLite file, shareable between instances on the same volume.
    #[default]
    Sqlite,
    /// Process-local map; duplicates across instances are not caught.
    Memory,
}

/// Deduplication store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    #[serde(default = "default_database_path")]
    pub path: PathBuf,

    /// Records older than this are pruned.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    #[serde(default = "default_prune_interval")]
    pub prune_interval_secs: u64,
}

fn default_database_path() -> PathBuf {
    dirs_or_default(".erasure/dedup.db")
}

fn default_retention_days() -> u32 {
    DEFAULT_RETENTION_DAYS
}

fn default_prune_interval() -> u64 {
    3600
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            path: default_database_path(),
            retention_days: default_retention_days(),
            prune_interval_secs: default_prune_interval(),
        }
    }
}

/// External deletion pipeline and the worker that feeds it.
#[derive(Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Webhook URL. Without one, deletions are only logged.
    #[serde(default)]
    pub url: Option<String>,

    /// HMAC key for signing webhook deliveries.
    #[serde(default)]
    pub secret: Option<String>,

    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    #[serde(default = "default_breaker_threshold")]
    pub breaker_threshold: u32,

    #[serde(default = "default_breaker_recovery")]
    pub breaker_recovery_secs: u64,

    /// Grace period for queued jobs on shutdown.
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,
}

fn default_timeout_ms() -> u64 {
    10_000
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_max_concurrency() -> usize {
    8
}

fn default_breaker_threshold() -> u32 {
    5
}

fn default_breaker_recovery() -> u64 {
    30
}

fn default_drain_timeout() -> u64 {
    10
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            url: None,
            secret: None,
            timeout_ms: default_timeout_ms(),
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            queue_capacity: default_queue_capacity(),
            max_concurrency: default_max_concurrency(),
            breaker_threshold: default_breaker_threshold(),
            breaker_recovery_secs: default_breaker_recovery(),
            drain_timeout_secs: default_drain_timeout(),
        }
    }
}

impl std::fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("url", &self.url)
            .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
            .field("timeout_ms", &self.timeout_ms)
            .field("max_attempts", &self.max_attempts)
            .field("queue_capacity", &self.queue_capacity)
            .field("max_concurrency", &self.max_concurrency)
            .finish_non_exhaustive()
    }
}

/// Request-path behavior of the compliance handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandlerConfig {
    #[serde(default)]
    pub url_source: UrlSource,

    #[serde(default)]
    pub malformed_policy: MalformedPolicy,

    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,
}

fn default_store_timeout_ms() -> u64 {
    1500
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            url_source: UrlSource::default(),
            malformed_policy: MalformedPolicy::default(),
            store_timeout_ms: default_store_timeout_ms(),
        }
    }
}

/// Top-level configuration for the erasure binary.
///
/// Loaded from a TOML file (typically `~/.erasure/config.toml`), then
/// overridden from the environment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RootConfig {
    #[serde(default)]
    pub endpoint: EndpointConfig,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub handler: HandlerConfig,
}

/// Returns `$HOME/<suffix>` if HOME is available, otherwise `./<suffix>`.
fn dirs_or_default(suffix: &str) -> PathBuf {
    std::env::var("HOME")
        .map(|h| PathBuf::from(h).join(suffix))
        .unwrap_or_else(|_| PathBuf::from(suffix))
}

impl RootConfig {
    /// Load configuration from a TOML file. If the file does not exist,
    /// returns a default configuration. Environment overrides are not
    /// applied here.
    pub fn load(path: &Path) -> ErasureResult<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)?;
        let config: RootConfig = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Write the current configuration to a TOML file.
    pub fn save(&self, path: &Path) -> ErasureResult<()> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| ErasureError::Config(format!("TOML serialize error: {}", e)))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from `lookup`; empty values are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(token) = get(ENV_VERIFICATION_TOKEN) {
            self.endpoint.verification_token = Some(token.trim().to_string());
        }
        if let Some(url) = get(ENV_ENDPOINT_URL) {
            self.endpoint.endpoint_url = Some(url.trim().to_string());
        }
        if let Some(path) = get(ENV_DATABASE_PATH) {
            self.store.path = PathBuf::from(path);
        }
        if let Some(url) = get(ENV_PIPELINE_URL) {
            self.pipeline.url = Some(url.trim().to_string());
        }
        if let Some(secret) = get(ENV_PIPELINE_SECRET) {
            self.pipeline.secret = Some(secret);
        }
    }

    /// Validate everything but the `[endpoint]` section, which
    /// `endpoint_configuration` checks.
    pub fn validate(&self) -> ErasureResult<()> {
        if self.handler.store_timeout_ms == 0 {
            return Err(ErasureError::Config("store_timeout_ms must be > 0".into()));
        }
        if self.pipeline.timeout_ms == 0 {
            return Err(ErasureError::Config("pipeline timeout_ms must be > 0".into()));
        }
        if self.pipeline.max_attempts == 0 {
            return Err(ErasureError::Config("max_attempts must be >= 1".into()));
        }
        if self.pipeline.queue_capacity == 0 {
            return Err(ErasureError::Config("queue_capacity must be > 0".into()));
        }
        if self.pipeline.max_concurrency == 0 {
            return Err(ErasureError::Config("max_concurrency must be > 0".into()));
        }
        if self.store.retention_days == 0 {
            return Err(ErasureError::Config("retention_days must be >= 1".into()));
        }
        if self.store.prune_interval_secs == 0 {
            return Err(ErasureError::Config("prune_interval_secs must be > 0".into()));
        }
        if let Some(url) = &self.pipeline.url {
            if !(url.starts_with("https://") || url.starts_with("http://")) {
                return Err(ErasureError::Config(
                    "pipeline url must be http or https".into(),
                ));
            }
        }
        if let Some(secret) = &self.pipeline.secret {
            PipelineSecret::new(secret.as_bytes().to_vec())?;
        }
        self.worker_config().retry.validate()?;
        Ok(())
    }

    /// The endpoint configuration, or a configuration error naming what is
    /// missing or malformed.
    pub fn endpoint_configuration(&self) -> ErasureResult<EndpointConfiguration> {
        let token = self.endpoint.verification_token.as_deref().ok_or_else(|| {
            ErasureError::Config(format!(
                "verification token not set ([endpoint] verification_token or {})",
                ENV_VERIFICATION_TOKEN
            ))
        })?;
        let url = self.endpoint.endpoint_url.as_deref().ok_or_else(|| {
            ErasureError::Config(format!(
                "endpoint URL not set ([endpoint] endpoint_url or {})",
                ENV_ENDPOINT_URL
            ))
        })?;
        validate_verification_token(token)?;
        Ok(EndpointConfiguration::new(token, url)?)
    }

    pub fn pipeline_secret(&self) -> ErasureResult<Option<PipelineSecret>> {
        match &self.pipeline.secret {
            Some(secret) => Ok(Some(PipelineSecret::new(secret.as_bytes().to_vec())?)),
            None => Ok(None),
        }
    }

    pub fn worker_config(&self) -> WorkerConfig {
        let p = &self.pipeline;
        WorkerConfig {
            queue_capacity: p.queue_capacity,
            max_concurrency: p.max_concurrency,
            retry: RetryPolicy {
                max_attempts: p.max_attempts,
                initial_backoff: Duration::from_millis(p.initial_backoff_ms),
                max_backoff: Duration::from_millis(p.max_backoff_ms),
                attempt_timeout: Duration::from_millis(p.timeout_ms),
            },
            breaker_threshold: p.breaker_threshold,
            breaker_recovery: Duration::from_secs(p.breaker_recovery_secs),
            retention_days: self.store.retention_days,
            prune_interval: Duration::from_secs(self.store.prune_interval_secs),
            drain_timeout: Duration::from_secs(p.drain_timeout_secs),
        }
    }

    pub fn handler_options(&self) -> HandlerOptions {
        HandlerOptions {
            url_source: self.handler.url_source,
            malformed_policy: self.handler.malformed_policy,
            store_timeout: Duration::from_millis(self.handler.store_timeout_ms),
        }
    }

    /// Return the path to the default config file location.
    pub fn default_config_path() -> PathBuf {
        dirs_or_default(".erasure/config.toml")
    }
}

/// Platform rule: 32 to 80 characters of letters, digits, `_` and `-`.
pub fn validate_verification_token(token: &str) -> ErasureResult<()> {
    let len = token.chars().count();
    if !(TOKEN_MIN_LEN..=TOKEN_MAX_LEN).contains(&len) {
        return Err(ErasureError::Config(format!(
            "verification token must be {}-{} characters, got {}",
            TOKEN_MIN_LEN, TOKEN_MAX_LEN, len
        )));
    }
    if !token
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(ErasureError::Config(
            "verification token may only contain letters, digits, '_' and '-'".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const TOKEN: &str = "colecciones-app-production-token-2025-secure-key-12345";
    const URL: &str = "https://example.com/api/ebay-endpoint";

    fn configured() -> RootConfig {
        let mut config = RootConfig::default();
        config.endpoint.verification_token = Some(TOKEN.into());
        config.endpoint.endpoint_url = Some(URL.into());
        config
    }

    #[test]
    fn test_default_config() {
        let config = RootConfig::default();
        assert!(config.store.path.to_str().unwrap().contains(".erasure/dedup.db"));
        assert_eq!(config.store.backend, StoreBackend::Sqlite);
        assert_eq!(config.store.retention_days, 30);
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.handler.url_source, UrlSource::Registered);
        assert_eq!(config.handler.malformed_policy, MalformedPolicy::Acknowledge);
        assert!(config.endpoint.verification_token.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
[endpoint]
verification_token = "colecciones-app-production-token-2025-secure-key-12345"
endpoint_url = "https://example.com/api/ebay-endpoint"

[server]
bind = "127.0.0.1"
port = 9090

[store]
backend = "memory"
retention_days = 45

[pipeline]
url = "https://deletions.internal/jobs"
max_attempts = 3

[handler]
url_source = "request"
malformed_policy = "reject"
"#;
        let config: RootConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.bind, "127.0.0.1");
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.store.retention_days, 45);
        assert_eq!(config.pipeline.max_attempts, 3);
        assert_eq!(config.pipeline.timeout_ms, 10_000);
        assert_eq!(config.handler.url_source, UrlSource::Request);
        assert_eq!(config.handler.malformed_policy, MalformedPolicy::Reject);
        assert!(config.validate().is_ok());

        let endpoint = config.endpoint_configuration().unwrap();
        assert_eq!(endpoint.canonical_endpoint_url(), URL);
    }

    #[test]
    fn test_token_rules() {
        assert!(validate_verification_token(TOKEN).is_ok());
        assert!(validate_verification_token(&"a".repeat(32)).is_ok());
        assert!(validate_verification_token(&"a".repeat(80)).is_ok());
        assert!(validate_verification_token(&"a".repeat(31)).is_err());
        assert!(validate_verification_token(&"a".repeat(81)).is_err());
        assert!(validate_verification_token(&format!("{}!", "a".repeat(40))).is_err());
        assert!(validate_verification_token("").is_err());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = configured();
        config.store.retention_days = 0;
        assert!(config.validate().is_err());

        let mut config = configured();
        config.pipeline.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = configured();
        config.handler.store_timeout_ms = 0;
        assert!(config.validate().is_err());

        let mut config = configured();
        config.pipeline.secret = Some("short".into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_malformed_endpoint_is_left_to_endpoint_configuration() {
        for (token, url) in [
            ("too-short-token-of-20", URL),
            (TOKEN, "http://example.com/x"),
            (TOKEN, "https://example.com/x?y=1"),
        ] {
            let mut config = configured();
            config.endpoint.verification_token = Some(token.into());
            config.endpoint.endpoint_url = Some(url.into());
            assert!(config.validate().is_ok());
            assert!(config.endpoint_configuration().is_err());
        }
    }

    #[test]
    fn test_endpoint_configuration_missing() {
        let config = RootConfig::default();
        let err = config.endpoint_configuration().unwrap_err();
        assert!(err.to_string().contains(ENV_VERIFICATION_TOKEN));

        let mut config = RootConfig::default();
        config.endpoint.verification_token = Some(TOKEN.into());
        let err = config.endpoint_configuration().unwrap_err();
        assert!(err.to_string().contains(ENV_ENDPOINT_URL));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            (ENV_VERIFICATION_TOKEN, TOKEN),
            (ENV_ENDPOINT_URL, " https://example.com/api/ebay-endpoint "),
            (ENV_DATABASE_PATH, "/tmp/dedup.db"),
            (ENV_PIPELINE_URL, ""),
        ]
        .into_iter()
        .collect();

        let mut config = RootConfig::default();
        config.pipeline.url = Some("https://keep.me/jobs".into());
        config.apply_overrides(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.endpoint.verification_token.as_deref(), Some(TOKEN));
        assert_eq!(config.endpoint.endpoint_url.as_deref(), Some(URL));
        assert_eq!(config.store.path, PathBuf::from("/tmp/dedup.db"));
        assert_eq!(config.pipeline.url.as_deref(), Some("https://keep.me/jobs"));
    }

    #[test]
    fn test_worker_and_handler_settings() {
        let mut config = configured();
        config.pipeline.initial_backoff_ms = 100;
        config.handler.store_timeout_ms = 250;

        let worker = config.worker_config();
        assert_eq!(worker.retry.initial_backoff, Duration::from_millis(100));
        assert_eq!(worker.retention_days, 30);

        let options = config.handler_options();
        assert_eq!(options.store_timeout, Duration::from_millis(250));
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let mut config = configured();
        config.pipeline.secret = Some("s".repeat(40));
        let debug = format!("{:?}", config);
        assert!(!debug.contains(TOKEN));
        assert!(!debug.contains(&"s".repeat(40)));
    }

    #[test]
    fn test_config_load_missing_file() {
        let config = RootConfig::load(Path::new("/nonexistent/config.toml")).unwrap();
        assert_eq!(config.server.port, 8080);
    }

    #[test]
    fn test_config_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = configured();
        config.store.backend = StoreBackend::Memory;
        config.handler.malformed_policy = MalformedPolicy::Reject;
        config.save(&path).unwrap();

        let loaded = RootConfig::load(&path).unwrap();
        assert_eq!(loaded.endpoint.endpoint_url.as_deref(), Some(URL));
        assert_eq!(loaded.store.backend, StoreBackend::Memory);
        assert_eq!(loaded.handler.malformed_policy, MalformedPolicy::Reject);
    }
}
