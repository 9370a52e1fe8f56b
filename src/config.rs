//! # Configuration Management
//!
//! Centralized configuration for the client.
//!
//! Every option lives in an explicit struct whose defaults are resolved once
//! at construction; there is no deep optional-field merging at call sites.
//! Defaults are documented per field as `default, override source`.
//!
//! ## Configuration Sources
//! - Direct instantiation with defaults
//! - A target URI via [`SessionConfig::from_uri`], which fills host, port,
//!   scheme security and query parameters

use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::{ProtocolError, Result};
use crate::transport::TransportKind;
use crate::utils::uri::ParsedUri;

/// Default request path for both protocol layers.
pub const DEFAULT_PATH: &str = "/realtime";

/// Default connect-attempt timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(20);

/// Default reconnection backoff floor and ceiling.
pub const DEFAULT_RECONNECTION_DELAY: Duration = Duration::from_millis(1000);
pub const DEFAULT_RECONNECTION_DELAY_MAX: Duration = Duration::from_millis(5000);

/// Connection-layer configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Target host. `localhost`, overridden by the URI.
    pub hostname: String,

    /// Target port. `80`/`443` by scheme, overridden by the URI.
    pub port: u16,

    /// Whether to use TLS schemes. `false`, overridden by the URI.
    pub secure: bool,

    /// Request path. [`DEFAULT_PATH`], overridden by the caller.
    pub path: String,

    /// Extra query parameters sent on every request. Empty, merged with the
    /// URI query.
    pub query: BTreeMap<String, String>,

    /// Transports to try, in preference order. Both, polling first.
    pub transports: Vec<TransportKind>,

    /// Whether to probe upgrade candidates after the handshake. `true`.
    pub upgrade: bool,

    /// Start directly on the persistent socket when it succeeded before.
    /// `false`.
    pub remember_upgrade: bool,

    /// Abort probes that would regress binary support. `false`.
    pub only_binary_upgrades: bool,

    /// Force the base64 text fallback for binary payloads. `false`.
    pub force_base64: bool,

    /// Cache-busting query parameter name. `"t"`.
    pub timestamp_param: String,

    /// Whether to append the cache-busting parameter. `false`.
    pub timestamp_requests: bool,

    /// Per-request timeout handed to the I/O collaborators.
    /// 3 seconds.
    pub request_timeout: Option<Duration>,

    /// Extra headers handed to the I/O collaborators. Empty.
    pub extra_headers: BTreeMap<String, String>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            hostname: "localhost".to_string(),
            port: 80,
            secure: false,
            path: DEFAULT_PATH.to_string(),
            query: BTreeMap::new(),
            transports: vec![TransportKind::Polling, TransportKind::PersistentSocket],
            upgrade: true,
            remember_upgrade: false,
            only_binary_upgrades: false,
            force_base64: false,
            timestamp_param: "t".to_string(),
            timestamp_requests: false,
            request_timeout: Some(Duration::from_secs(3)),
            extra_headers: BTreeMap::new(),
        }
    }
}

impl ConnectionConfig {
    /// Request path with exactly one trailing slash.
    pub fn normalized_path(&self) -> String {
        format!("{}/", self.path.trim_end_matches('/'))
    }

    /// Validate the configuration. An empty list means it is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.hostname.is_empty() {
            errors.push("hostname cannot be empty".to_string());
        }

        if self.path.is_empty() || !self.path.starts_with('/') {
            errors.push(format!(
                "request path must start with '/': '{}'",
                self.path
            ));
        }

        if self.transports.is_empty() {
            errors.push("at least one transport must be configured".to_string());
        }

        if let Some(timeout) = self.request_timeout {
            if timeout.as_millis() < 100 {
                errors.push("request timeout too short (minimum: 100ms)".to_string());
            }
        }

        errors
    }
}

/// Session-layer configuration, wrapping the connection options.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub connection: ConnectionConfig,

    /// Whether to reconnect after an unexpected close. `true`.
    pub reconnection: bool,

    /// Attempt ceiling before `reconnect_failed`. Unlimited.
    pub reconnection_attempts: u32,

    /// Backoff floor. 1000 ms.
    pub reconnection_delay: Duration,

    /// Backoff ceiling. 5000 ms.
    pub reconnection_delay_max: Duration,

    /// Backoff jitter in `[0, 1]`. `0.5`.
    pub randomization_factor: f64,

    /// Connect-attempt timeout; `None` disables it. 20 s.
    pub connect_timeout: Option<Duration>,

    /// Open the manager as soon as the first channel is created. `true`.
    pub auto_connect: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            reconnection: true,
            reconnection_attempts: u32::MAX,
            reconnection_delay: DEFAULT_RECONNECTION_DELAY,
            reconnection_delay_max: DEFAULT_RECONNECTION_DELAY_MAX,
            randomization_factor: 0.5,
            connect_timeout: Some(DEFAULT_CONNECT_TIMEOUT),
            auto_connect: true,
        }
    }
}

impl SessionConfig {
    /// Resolve a configuration from a target URI, filling host, port,
    /// security and query from the parsed components.
    pub fn from_uri(uri: &str) -> Result<Self> {
        let parsed = ParsedUri::parse(uri)?;
        let mut config = Self::default();
        config.connection.hostname = parsed.hostname;
        config.connection.port = parsed.port;
        config.connection.secure = parsed.secure;
        config.connection.query.extend(parsed.query);
        Ok(config)
    }

    /// Apply overrides to the default configuration.
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// Validate the configuration. An empty list means it is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = self.connection.validate();

        if !(0.0..=1.0).contains(&self.randomization_factor) {
            errors.push(format!(
                "randomization factor out of range [0, 1]: {}",
                self.randomization_factor
            ));
        }

        if self.reconnection_delay > self.reconnection_delay_max {
            errors.push("reconnection delay exceeds its maximum".to_string());
        }

        if self.reconnection && self.reconnection_attempts == 0 {
            errors.push(
                "reconnection attempts must be greater than 0 when reconnection is enabled"
                    .to_string(),
            );
        }

        if let Some(timeout) = self.connect_timeout {
            if timeout.as_millis() < 100 {
                errors.push("connect timeout too short (minimum: 100ms)".to_string());
            }
        }

        errors
    }

    /// Validate and return a `Result` - convenience method.
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::Config(format!(
                "configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}
