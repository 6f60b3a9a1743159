// src/config.rs

//! Manages client configuration: loading, resolving and validation.
//!
//! [`Config`] is the file-level view (TOML). It resolves into the immutable
//! [`ConnectionConfig`] that every connection of a pool shares.

use crate::core::pubsub::{PushExecutor, TokioExecutor};
use crate::core::{ClientError, Result as ClientResult};
use anyhow::{Context, Result, anyhow};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::sync::Arc;
use std::time::Duration;
use strum_macros::{Display, EnumString};
use tracing::warn;

/// The URL scheme of plain connections.
pub const PLAIN_SCHEME: &str = "redis";
/// The URL scheme of TLS connections.
pub const SECURE_SCHEME: &str = "rediss";
/// The port used when the URL does not name one.
pub const DEFAULT_PORT: u16 = 6379;

/// Whether a connection is wrapped in TLS.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    Plain,
    Secure,
}

/// The target of a connection: scheme, host and port.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
}

impl Address {
    /// Parses `redis://host[:port]` or `rediss://host[:port]`.
    pub fn parse(input: &str) -> ClientResult<Self> {
        let url = url::Url::parse(input)
            .map_err(|e| ClientError::Config(format!("invalid address '{input}': {e}")))?;
        let scheme = match url.scheme() {
            PLAIN_SCHEME => Scheme::Plain,
            SECURE_SCHEME => Scheme::Secure,
            other => {
                return Err(ClientError::Config(format!(
                    "unsupported scheme '{other}', expected '{PLAIN_SCHEME}' or '{SECURE_SCHEME}'"
                )));
            }
        };
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| ClientError::Config(format!("address '{input}' has no host")))?;
        // IPv6 literals come back bracketed.
        let host = host.trim_start_matches('[').trim_end_matches(']').to_string();
        Ok(Self {
            scheme,
            host,
            port: url.port().unwrap_or(DEFAULT_PORT),
        })
    }

    pub fn plain(host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme: Scheme::Plain,
            host: host.into(),
            port,
        }
    }

    pub fn secure(host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme: Scheme::Secure,
            host: host.into(),
            port,
        }
    }

    pub fn is_secure(&self) -> bool {
        self.scheme == Scheme::Secure
    }

    /// The `host:port` string handed to `TcpStream::connect`.
    pub fn socket_target(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = match self.scheme {
            Scheme::Plain => PLAIN_SCHEME,
            Scheme::Secure => SECURE_SCHEME,
        };
        write!(f, "{scheme}://{}", self.socket_target())
    }
}

/// Selects the cryptography backend used by rustls.
#[derive(
    Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum TlsProvider {
    /// aws-lc-rs, the rustls default.
    #[default]
    Default,
    /// ring.
    Alternate,
}

/// TLS settings. Only consulted for `rediss://` addresses.
///
/// Stores are PEM files: the trust store holds CA certificates, the identity
/// store holds the client certificate chain followed by its private key. An
/// identity key stored as `ENCRYPTED PRIVATE KEY` (PKCS#8, PBES2) is
/// decrypted with `keystore_password`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TlsConfig {
    #[serde(default)]
    pub truststore_path: Option<String>,
    #[serde(default)]
    pub truststore_password: Option<String>,
    #[serde(default)]
    pub keystore_path: Option<String>,
    #[serde(default)]
    pub keystore_password: Option<String>,
    #[serde(default)]
    pub provider: TlsProvider,
    /// Verify that the server certificate was issued for the target host.
    #[serde(default = "default_endpoint_identification")]
    pub endpoint_identification: bool,
}

fn default_endpoint_identification() -> bool {
    true
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            truststore_path: None,
            truststore_password: None,
            keystore_path: None,
            keystore_password: None,
            provider: TlsProvider::default(),
            endpoint_identification: default_endpoint_identification(),
        }
    }
}

impl TlsConfig {
    fn validate(&self) -> Result<()> {
        if self.keystore_password.is_some() && self.keystore_path.is_none() {
            return Err(anyhow!("tls.keystore_password is set without tls.keystore_path"));
        }
        if self.truststore_password.is_some() && self.truststore_path.is_none() {
            return Err(anyhow!("tls.truststore_password is set without tls.truststore_path"));
        }
        for (name, path) in [
            ("tls.truststore_path", &self.truststore_path),
            ("tls.keystore_path", &self.keystore_path),
        ] {
            if path.as_deref().is_some_and(|p| p.trim().is_empty()) {
                return Err(anyhow!("{name} cannot be empty"));
            }
        }
        if !self.endpoint_identification && self.truststore_path.is_none() {
            warn!(
                "tls.endpoint_identification is disabled and no trust store is configured: server certificates will NOT be verified."
            );
        }
        Ok(())
    }
}

/// How long the watchdog waits between reconnection attempts.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
#[serde(tag = "strategy", rename_all = "kebab-case")]
pub enum ReconnectStrategy {
    /// The same delay before every attempt.
    Fixed {
        #[serde(with = "humantime_serde")]
        delay: Duration,
    },
    /// `initial * multiplier^attempt`, capped at `max`.
    Exponential {
        #[serde(with = "humantime_serde")]
        initial: Duration,
        #[serde(with = "humantime_serde")]
        max: Duration,
        multiplier: f64,
    },
}

impl Default for ReconnectStrategy {
    fn default() -> Self {
        ReconnectStrategy::Exponential {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(60),
            multiplier: 2.0,
        }
    }
}

/// The reconnect policy consulted by the connection watchdog.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Default)]
pub struct ReconnectPolicy {
    #[serde(flatten)]
    pub strategy: ReconnectStrategy,
    /// Stop after this many failed attempts. `None` retries until shutdown.
    #[serde(default)]
    pub max_attempts: Option<u32>,
    /// Upper bound of a random delay added to every wait.
    #[serde(default, with = "humantime_serde")]
    pub jitter: Duration,
}

impl ReconnectPolicy {
    pub fn fixed(delay: Duration) -> Self {
        Self {
            strategy: ReconnectStrategy::Fixed { delay },
            max_attempts: None,
            jitter: Duration::ZERO,
        }
    }

    pub fn exponential(initial: Duration, max: Duration, multiplier: f64) -> Self {
        Self {
            strategy: ReconnectStrategy::Exponential {
                initial,
                max,
                multiplier,
            },
            max_attempts: None,
            jitter: Duration::ZERO,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// The wait before attempt number `attempt` (0-based), jitter excluded.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        match self.strategy {
            ReconnectStrategy::Fixed { delay } => delay,
            ReconnectStrategy::Exponential {
                initial,
                max,
                multiplier,
            } => {
                let factor = multiplier.powi(attempt.min(i32::MAX as u32) as i32);
                let secs = initial.as_secs_f64() * factor;
                if !secs.is_finite() || secs >= max.as_secs_f64() {
                    max
                } else {
                    Duration::from_secs_f64(secs)
                }
            }
        }
    }

    /// The wait before attempt number `attempt`, jitter included.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter.is_zero() {
            return base;
        }
        let jitter_ms = self.jitter.as_millis().min(u64::MAX as u128) as u64;
        base + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }

    /// Whether another attempt may follow `failed_attempts` failures.
    pub fn allows(&self, failed_attempts: u32) -> bool {
        self.max_attempts.is_none_or(|max| failed_attempts < max)
    }

    fn validate(&self) -> Result<()> {
        match self.strategy {
            ReconnectStrategy::Fixed { delay } => {
                if delay.is_zero() {
                    return Err(anyhow!("reconnect.delay cannot be 0"));
                }
            }
            ReconnectStrategy::Exponential {
                initial,
                max,
                multiplier,
            } => {
                if initial.is_zero() {
                    return Err(anyhow!("reconnect.initial cannot be 0"));
                }
                if max < initial {
                    return Err(anyhow!("reconnect.max cannot be lower than reconnect.initial"));
                }
                if !(multiplier >= 1.0 && multiplier.is_finite()) {
                    return Err(anyhow!("reconnect.multiplier must be a finite number >= 1.0"));
                }
            }
        }
        if self.max_attempts == Some(0) {
            return Err(anyhow!("reconnect.max_attempts cannot be 0, omit it to retry forever"));
        }
        Ok(())
    }
}

/// The file-level client configuration.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Config {
    #[serde(default = "default_url")]
    pub url: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Number of connections a pool keeps open.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// How long a caller waits for a reply. `"off"` in TOML (`None`) waits
    /// until the connection closes.
    #[serde(default = "default_response_timeout", with = "optional_timeout")]
    pub response_timeout: Option<Duration>,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default)]
    pub reconnect: ReconnectPolicy,
}

fn default_url() -> String {
    format!("{PLAIN_SCHEME}://127.0.0.1:{DEFAULT_PORT}")
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_pool_size() -> usize {
    4
}
fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}
fn default_response_timeout() -> Option<Duration> {
    Some(Duration::from_secs(3))
}

/// A humantime duration, or `"off"` for no timeout at all.
mod optional_timeout {
    use humantime_serde::re::humantime;
    use serde::{Deserialize, Deserializer, Serializer, de::Error};
    use std::time::Duration;

    const OFF: &str = "off";

    pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => serializer.collect_str(&humantime::format_duration(*duration)),
            None => serializer.serialize_str(OFF),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        let text = String::deserialize(deserializer)?;
        if text.trim().eq_ignore_ascii_case(OFF) {
            return Ok(None);
        }
        humantime::parse_duration(text.trim())
            .map(Some)
            .map_err(|e| D::Error::custom(format!("invalid duration '{text}': {e}")))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            url: default_url(),
            log_level: default_log_level(),
            pool_size: default_pool_size(),
            connect_timeout: default_connect_timeout(),
            response_timeout: default_response_timeout(),
            tls: TlsConfig::default(),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl Config {
    /// Creates a new `Config` instance by reading and parsing a TOML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at '{path}'"))?;
        Self::from_toml(&contents).with_context(|| format!("Invalid config file '{path}'"))
    }

    /// Parses and validates a TOML document.
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents).context("Failed to parse TOML")?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration to ensure logical consistency.
    pub fn validate(&self) -> Result<()> {
        let address = Address::parse(&self.url).map_err(|e| anyhow!("url: {e}"))?;
        if self.pool_size == 0 {
            return Err(anyhow!("pool_size cannot be 0"));
        }
        if self.connect_timeout.is_zero() {
            return Err(anyhow!("connect_timeout cannot be 0"));
        }
        if self.response_timeout.is_some_and(|t| t.is_zero()) {
            return Err(anyhow!(
                "response_timeout cannot be 0, set it to \"off\" to wait forever"
            ));
        }
        if address.is_secure() {
            self.tls.validate()?;
        }
        self.reconnect.validate()?;
        Ok(())
    }

    /// Resolves this configuration into the immutable per-connection config.
    pub fn connection_config(&self) -> Result<ConnectionConfig> {
        let address = Address::parse(&self.url)?;
        Ok(ConnectionConfig {
            address,
            tls: self.tls.clone(),
            connect_timeout: self.connect_timeout,
            response_timeout: self.response_timeout,
            reconnect: self.reconnect,
            executor: Arc::new(TokioExecutor::current()),
        })
    }
}

/// Everything needed to open and run one connection. Shared by every
/// connection of a pool and never mutated once built.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub address: Address,
    pub tls: TlsConfig,
    pub connect_timeout: Duration,
    pub response_timeout: Option<Duration>,
    pub reconnect: ReconnectPolicy,
    /// Runs subscriber callbacks for push messages.
    pub executor: Arc<dyn PushExecutor>,
}

impl ConnectionConfig {
    /// A config with default timeouts, TLS settings and reconnect policy.
    pub fn new(address: Address) -> Self {
        Self {
            address,
            tls: TlsConfig::default(),
            connect_timeout: default_connect_timeout(),
            response_timeout: default_response_timeout(),
            reconnect: ReconnectPolicy::default(),
            executor: Arc::new(TokioExecutor::current()),
        }
    }

    pub fn with_tls(mut self, tls: TlsConfig) -> Self {
        self.tls = tls;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_response_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.response_timeout = timeout;
        self
    }

    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    pub fn with_executor(mut self, executor: Arc<dyn PushExecutor>) -> Self {
        self.executor = executor;
        self
    }
}
