//! Gateway configuration.
//!
//! Loaded from a TOML file with serde defaults for every option, so an
//! empty file (or no file at all) yields a runnable single-node setup. Key
//! material may live inline (base64), in a referenced file, or in the
//! `AUTH_PUBLIC_KEY_DATA` / `AUTH_PRIVATE_KEY_DATA` environment variables
//! for container deployments; the environment wins.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::approval::ApprovalConfig;
use crate::audit::AuditSinkConfig;
use crate::reliability::{BreakerConfig, ReliabilityConfig};

/// Environment variable carrying the verification key directly.
pub const ENV_PUBLIC_KEY: &str = "AUTH_PUBLIC_KEY_DATA";

/// Environment variable carrying the signing key directly.
pub const ENV_PRIVATE_KEY: &str = "AUTH_PRIVATE_KEY_DATA";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// The file is not valid TOML for this shape.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// A required key is missing from every source.
    #[error("missing key material: {0}")]
    MissingKey(&'static str),
}

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UagConfig {
    /// HTTP server options.
    pub server: ServerConfig,
    /// RPC server options.
    pub rpc: RpcConfig,
    /// Durable store options.
    pub datastore: DatastoreConfig,
    /// Signal plane options.
    pub signal: SignalConfig,
    /// Token verification options.
    pub auth: AuthConfig,
    /// Downstream connector options.
    pub connector: ConnectorSettings,
    /// Audit sink options.
    pub audit: AuditConfig,
    /// Rate limit / breaker / retry options.
    pub reliability: ReliabilitySettings,
    /// HITL options.
    pub approval: ApprovalSettings,
    /// Logging options.
    pub log: LogSettings,
}

/// HTTP server options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind host.
    pub host: String,
    /// Bind port.
    pub port: u16,
    /// Read timeout.
    #[serde(with = "humantime_serde")]
    pub read_timeout: Duration,
    /// Write timeout.
    #[serde(with = "humantime_serde")]
    pub write_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            read_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(30),
        }
    }
}

/// RPC server options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// Bind address, e.g. `0.0.0.0:50052`.
    pub listen: String,
    /// Disable the RPC listener entirely.
    pub disabled: bool,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:50052".to_string(),
            disabled: false,
        }
    }
}

/// Durable store options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatastoreConfig {
    /// SQLite database path.
    pub path: PathBuf,
}

impl Default for DatastoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("uag.db"),
        }
    }
}

/// Signal plane options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalConfig {
    /// Namespace prefix for every channel, set and lock.
    pub namespace: String,
    /// External broker address; empty selects the in-process bus.
    pub addr: String,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            namespace: crate::signal::ChannelMap::default().namespace().to_string(),
            addr: String::new(),
        }
    }
}

/// Token verification options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Base64 verification key, inline.
    pub public_key: String,
    /// Path to a file holding the base64 verification key.
    pub public_key_path: Option<PathBuf>,
    /// Base64 signing key, inline (console side only).
    pub private_key: String,
    /// Path to a file holding the base64 signing key.
    pub private_key_path: Option<PathBuf>,
    /// Lifetime of issued tokens.
    #[serde(with = "humantime_serde")]
    pub token_ttl: Duration,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            public_key: String::new(),
            public_key_path: None,
            private_key: String::new(),
            private_key_path: None,
            token_ttl: Duration::from_secs(3600),
        }
    }
}

/// Downstream connector options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectorSettings {
    /// RPC address of the downstream connector service; empty selects the
    /// built-in mock connector.
    pub addr: String,
    /// Guard timeout for one connector round trip.
    #[serde(with = "humantime_serde")]
    pub call_timeout: Duration,
}

impl Default for ConnectorSettings {
    fn default() -> Self {
        Self {
            addr: String::new(),
            call_timeout: Duration::from_secs(15),
        }
    }
}

/// Audit sink options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// In-memory buffer capacity.
    pub buffer_size: usize,
    /// Flush tick for partial batches.
    #[serde(with = "humantime_serde")]
    pub flush_interval: Duration,
}

impl Default for AuditConfig {
    fn default() -> Self {
        let defaults = AuditSinkConfig::default();
        Self {
            buffer_size: defaults.buffer_capacity,
            flush_interval: defaults.flush_interval,
        }
    }
}

/// Rate limit / breaker / retry options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReliabilitySettings {
    /// Sustained downstream request rate.
    pub rate_limit_per_sec: f64,
    /// Token bucket burst.
    pub rate_limit_burst: u32,
    /// Maximum wait for a token.
    #[serde(with = "humantime_serde")]
    pub rate_limit_max_wait: Duration,
    /// Consecutive failures tolerated before the breaker opens.
    pub breaker_failure_threshold: u32,
    /// How long the breaker stays open.
    #[serde(with = "humantime_serde")]
    pub breaker_open_timeout: Duration,
    /// Probes admitted while half-open.
    pub breaker_half_open_probes: u32,
    /// Attempts per call.
    pub retry_attempts: u32,
    /// Base backoff delay.
    #[serde(with = "humantime_serde")]
    pub retry_base_delay: Duration,
    /// Per-attempt timeout.
    #[serde(with = "humantime_serde")]
    pub attempt_timeout: Duration,
}

impl Default for ReliabilitySettings {
    fn default() -> Self {
        let defaults = ReliabilityConfig::default();
        Self {
            rate_limit_per_sec: defaults.rate_limit_per_sec,
            rate_limit_burst: defaults.rate_limit_burst,
            rate_limit_max_wait: defaults.rate_limit_max_wait,
            breaker_failure_threshold: defaults.breaker.failure_threshold,
            breaker_open_timeout: defaults.breaker.open_timeout,
            breaker_half_open_probes: defaults.breaker.half_open_probes,
            retry_attempts: defaults.retry_attempts,
            retry_base_delay: defaults.retry_base_delay,
            attempt_timeout: defaults.attempt_timeout,
        }
    }
}

/// HITL options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalSettings {
    /// Reviewer wait window.
    #[serde(with = "humantime_serde")]
    pub wait_timeout: Duration,
    /// Concurrent suspension cap.
    pub max_suspended: usize,
}

impl Default for ApprovalSettings {
    fn default() -> Self {
        let defaults = ApprovalConfig::default();
        Self {
            wait_timeout: defaults.wait_timeout,
            max_suspended: defaults.max_suspended,
        }
    }
}

/// Logging options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    /// Minimum level: `trace`, `debug`, `info`, `warn`, `error`.
    pub level: String,
    /// Output format: `json` or `pretty`.
    pub format: String,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "json".to_string(),
        }
    }
}

impl UagConfig {
    /// Loads configuration from `path`.
    ///
    /// # Errors
    ///
    /// [`ConfigError`] when the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }

    /// Loads from `path` when it exists, otherwise returns the defaults.
    ///
    /// # Errors
    ///
    /// [`ConfigError`] when an existing file cannot be read or parsed.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if path.exists() {
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Resolves the verification key: environment, then inline value, then
    /// the referenced file.
    ///
    /// # Errors
    ///
    /// [`ConfigError::MissingKey`] when no source provides a key.
    pub fn resolve_public_key(&self) -> Result<String, ConfigError> {
        resolve_key(
            ENV_PUBLIC_KEY,
            &self.auth.public_key,
            self.auth.public_key_path.as_deref(),
        )
        .ok_or(ConfigError::MissingKey("auth.public_key"))
    }

    /// Resolves the signing key the same way as the verification key.
    ///
    /// # Errors
    ///
    /// [`ConfigError::MissingKey`] when no source provides a key.
    pub fn resolve_private_key(&self) -> Result<String, ConfigError> {
        resolve_key(
            ENV_PRIVATE_KEY,
            &self.auth.private_key,
            self.auth.private_key_path.as_deref(),
        )
        .ok_or(ConfigError::MissingKey("auth.private_key"))
    }

    /// Reliability wrapper tuning from these settings.
    #[must_use]
    pub fn reliability(&self) -> ReliabilityConfig {
        ReliabilityConfig {
            rate_limit_per_sec: self.reliability.rate_limit_per_sec,
            rate_limit_burst: self.reliability.rate_limit_burst,
            rate_limit_max_wait: self.reliability.rate_limit_max_wait,
            breaker: BreakerConfig {
                failure_threshold: self.reliability.breaker_failure_threshold,
                open_timeout: self.reliability.breaker_open_timeout,
                half_open_probes: self.reliability.breaker_half_open_probes,
            },
            retry_attempts: self.reliability.retry_attempts,
            retry_base_delay: self.reliability.retry_base_delay,
            attempt_timeout: self.reliability.attempt_timeout,
        }
    }

    /// Audit sink tuning from these settings.
    #[must_use]
    pub fn audit_sink(&self) -> AuditSinkConfig {
        AuditSinkConfig {
            buffer_capacity: self.audit.buffer_size,
            flush_interval: self.audit.flush_interval,
        }
    }

    /// Approval coordinator tuning from these settings.
    #[must_use]
    pub fn approval(&self) -> ApprovalConfig {
        ApprovalConfig {
            wait_timeout: self.approval.wait_timeout,
            max_suspended: self.approval.max_suspended,
        }
    }
}

fn resolve_key(env_name: &str, inline: &str, path: Option<&Path>) -> Option<String> {
    if let Ok(data) = std::env::var(env_name) {
        if !data.trim().is_empty() {
            return Some(data.trim().to_string());
        }
    }
    if !inline.trim().is_empty() {
        return Some(inline.trim().to_string());
    }
    if let Some(path) = path {
        if let Ok(data) = std::fs::read_to_string(path) {
            if !data.trim().is_empty() {
                return Some(data.trim().to_string());
            }
        }
    }
    None
}

mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_runnable() {
        let config = UagConfig::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.signal.namespace, "devit");
        assert_eq!(config.audit.buffer_size, 10_000);
        assert_eq!(config.reliability.breaker_failure_threshold, 5);
        assert_eq!(config.approval.wait_timeout, Duration::from_secs(300));
    }

    #[test]
    fn partial_toml_overrides_defaults() {
        let parsed: UagConfig = toml::from_str(
            r#"
            [server]
            port = 9999

            [audit]
            buffer_size = 128
            flush_interval = "250ms"

            [approval]
            wait_timeout = "30s"
            "#,
        )
        .unwrap();

        assert_eq!(parsed.server.port, 9999);
        assert_eq!(parsed.server.host, "0.0.0.0");
        assert_eq!(parsed.audit.buffer_size, 128);
        assert_eq!(parsed.audit.flush_interval, Duration::from_millis(250));
        assert_eq!(parsed.approval.wait_timeout, Duration::from_secs(30));
        // Untouched sections keep defaults.
        assert_eq!(parsed.reliability.retry_attempts, 3);
    }

    #[test]
    fn key_resolution_prefers_inline_then_file() {
        let dir = tempfile::tempdir().unwrap();
        let key_path = dir.path().join("key.b64");
        std::fs::write(&key_path, "from-file\n").unwrap();

        let mut config = UagConfig::default();
        config.auth.public_key_path = Some(key_path);
        assert_eq!(config.resolve_public_key().unwrap(), "from-file");

        config.auth.public_key = "inline".to_string();
        assert_eq!(config.resolve_public_key().unwrap(), "inline");
    }

    #[test]
    fn missing_key_is_an_error() {
        let config = UagConfig::default();
        assert!(matches!(
            config.resolve_private_key(),
            Err(ConfigError::MissingKey(_))
        ));
    }

    #[test]
    fn load_or_default_without_a_file() {
        let config = UagConfig::load_or_default("definitely-not-here.toml").unwrap();
        assert_eq!(config.server.port, 8080);
    }
}
