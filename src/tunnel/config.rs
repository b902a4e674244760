//! Tunnel settings, validated configuration, and runtime option resolution.
//!
//! [`TunnelSettings`] is the raw record handed over by the configuration
//! layer (MCP tool arguments or a presets file). [`TunnelConfig::from_settings`]
//! validates it and resolves credentials and the host key policy, so every
//! configuration problem is reported before any network action is taken.
//!
//! Runtime knobs live in [`TunnelOptions`] and follow a three-tier priority
//! system:
//!
//! 1. **Parameter** - Explicitly provided value (highest priority)
//! 2. **Environment Variable** - Value from environment variable
//! 3. **Default** - Built-in default value (lowest priority)
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `SSH_TUNNEL_CONNECT_TIMEOUT` | 30s | Bastion connect timeout per attempt, in seconds |
//! | `SSH_TUNNEL_MAX_RETRIES` | 3 | Maximum retry attempts for transient errors |
//! | `SSH_TUNNEL_RETRY_DELAY_MS` | 1000ms | Initial retry delay in milliseconds |
//! | `SSH_TUNNEL_KEEPALIVE_SECS` | 30s | Keepalive interval on the bastion connection |
//! | `SSH_TUNNEL_COMPRESSION` | false | Enable zlib compression |
//! | `SSH_TUNNEL_STRICT` | false | Fail the whole tunnel when one remote dial fails |
//! | `SSH_TUNNEL_PRESETS` | unset | JSON file with tunnels to open at startup |

use std::env;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::auth::AuthMethod;
use super::error::TunnelError;
use super::forward::ForwardMode;
use super::host_key::HostKeyPolicy;

/// Default bastion SSH port
pub const DEFAULT_BASTION_PORT: u16 = 22;

/// Default bastion connect timeout in seconds
pub(crate) const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default maximum retry attempts for the bastion connection
pub(crate) const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default retry delay in milliseconds
pub(crate) const DEFAULT_RETRY_DELAY_MS: u64 = 1000;

/// Default keepalive interval in seconds
pub(crate) const DEFAULT_KEEPALIVE_SECS: u64 = 30;

/// Maximum delay between two connection attempts
pub(crate) const MAX_RETRY_DELAY: Duration = Duration::from_secs(10);

pub(crate) const CONNECT_TIMEOUT_ENV_VAR: &str = "SSH_TUNNEL_CONNECT_TIMEOUT";
pub(crate) const MAX_RETRIES_ENV_VAR: &str = "SSH_TUNNEL_MAX_RETRIES";
pub(crate) const RETRY_DELAY_MS_ENV_VAR: &str = "SSH_TUNNEL_RETRY_DELAY_MS";
pub(crate) const KEEPALIVE_ENV_VAR: &str = "SSH_TUNNEL_KEEPALIVE_SECS";
pub(crate) const COMPRESSION_ENV_VAR: &str = "SSH_TUNNEL_COMPRESSION";
pub(crate) const STRICT_ENV_VAR: &str = "SSH_TUNNEL_STRICT";

/// Environment variable naming the presets file read by the HTTP server.
pub const PRESETS_ENV_VAR: &str = "SSH_TUNNEL_PRESETS";

/// A `host:port` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Bracket IPv6 literals so the port stays unambiguous
        if self.host.contains(':') && !self.host.starts_with('[') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

fn default_bastion_port() -> u16 {
    DEFAULT_BASTION_PORT
}

/// Raw tunnel settings as supplied by the configuration layer.
///
/// Optional string fields treat `None` and `""` the same way.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct TunnelSettings {
    pub bastion_host: String,
    #[serde(default = "default_bastion_port")]
    pub bastion_port: u16,
    pub bastion_user: String,
    /// Public key of the bastion. Absent means the host key is not verified.
    #[serde(default)]
    pub bastion_host_key: Option<String>,
    #[serde(default)]
    pub bastion_password: Option<String>,
    /// Private key text; takes precedence over the password.
    #[serde(default)]
    pub bastion_private_key: Option<String>,
    pub remote_host: String,
    pub remote_port: u16,
}

impl fmt::Debug for TunnelSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelSettings")
            .field("bastion_host", &self.bastion_host)
            .field("bastion_port", &self.bastion_port)
            .field("bastion_user", &self.bastion_user)
            .field("bastion_host_key", &self.bastion_host_key)
            .field("bastion_password", &redacted(&self.bastion_password))
            .field("bastion_private_key", &redacted(&self.bastion_private_key))
            .field("remote_host", &self.remote_host)
            .field("remote_port", &self.remote_port)
            .finish()
    }
}

fn redacted(value: &Option<String>) -> Option<&'static str> {
    non_empty(value.as_deref()).map(|_| "<redacted>")
}

/// Treats `Some("")` like `None`. Whitespace counts as content.
pub(crate) fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}

impl TunnelSettings {
    pub fn bastion(&self) -> Endpoint {
        Endpoint::new(self.bastion_host.trim(), self.bastion_port)
    }

    pub fn remote(&self) -> Endpoint {
        Endpoint::new(self.remote_host.trim(), self.remote_port)
    }

    /// Check the required fields without touching credentials.
    pub fn validate(&self) -> Result<(), TunnelError> {
        if self.bastion_host.trim().is_empty() {
            return Err(TunnelError::Configuration(
                "bastion_host is required".to_string(),
            ));
        }
        if self.bastion_port == 0 {
            return Err(TunnelError::Configuration(
                "bastion_port must be between 1 and 65535".to_string(),
            ));
        }
        if self.bastion_user.is_empty() {
            return Err(TunnelError::Configuration(
                "bastion_user is required".to_string(),
            ));
        }
        if self.remote_host.trim().is_empty() {
            return Err(TunnelError::Configuration(
                "remote_host is required".to_string(),
            ));
        }
        if self.remote_port == 0 {
            return Err(TunnelError::Configuration(
                "remote_port must be between 1 and 65535".to_string(),
            ));
        }
        Ok(())
    }
}

/// Immutable, validated description of one tunnel.
#[derive(Debug)]
pub struct TunnelConfig {
    pub bastion: Endpoint,
    pub user: String,
    pub auth: AuthMethod,
    pub host_key: HostKeyPolicy,
    pub remote: Endpoint,
}

impl TunnelConfig {
    /// Validate settings and resolve the credential and host key policy.
    ///
    /// Never performs network I/O.
    pub fn from_settings(settings: &TunnelSettings) -> Result<Self, TunnelError> {
        settings.validate()?;

        let host_key = HostKeyPolicy::from_config(settings.bastion_host_key.as_deref())?;
        let auth = AuthMethod::resolve(
            settings.bastion_password.as_deref(),
            settings.bastion_private_key.as_deref(),
        )?;

        Ok(Self {
            bastion: settings.bastion(),
            user: settings.bastion_user.clone(),
            auth,
            host_key,
            remote: settings.remote(),
        })
    }

    /// Stable identity of the tunnel this configuration describes.
    pub fn tunnel_id(&self) -> String {
        super::identity::tunnel_id(&self.bastion, &self.remote, &self.user)
    }
}

/// Read a JSON array of [`TunnelSettings`] from `path`.
pub fn load_presets(path: &Path) -> Result<Vec<TunnelSettings>, TunnelError> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        TunnelError::Configuration(format!("cannot read presets {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&raw).map_err(|e| {
        TunnelError::Configuration(format!("invalid presets {}: {}", path.display(), e))
    })
}

/// Runtime options for establishing and running a tunnel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelOptions {
    pub connect_timeout: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub keepalive_interval: Duration,
    pub compress: bool,
    pub forward_mode: ForwardMode,
}

impl Default for TunnelOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
            keepalive_interval: Duration::from_secs(DEFAULT_KEEPALIVE_SECS),
            compress: false,
            forward_mode: ForwardMode::Isolated,
        }
    }
}

impl TunnelOptions {
    /// Resolve every option with priority: parameter -> env var -> default.
    pub fn resolve(
        connect_timeout_secs: Option<u64>,
        max_retries: Option<u32>,
        retry_delay_ms: Option<u64>,
        strict: Option<bool>,
    ) -> Self {
        let strict = resolve_flag(strict, STRICT_ENV_VAR, false);
        Self {
            connect_timeout: Duration::from_secs(resolve_value(
                connect_timeout_secs,
                CONNECT_TIMEOUT_ENV_VAR,
                DEFAULT_CONNECT_TIMEOUT_SECS,
            )),
            max_retries: resolve_value(max_retries, MAX_RETRIES_ENV_VAR, DEFAULT_MAX_RETRIES),
            retry_delay: Duration::from_millis(resolve_value(
                retry_delay_ms,
                RETRY_DELAY_MS_ENV_VAR,
                DEFAULT_RETRY_DELAY_MS,
            )),
            keepalive_interval: Duration::from_secs(resolve_value(
                None,
                KEEPALIVE_ENV_VAR,
                DEFAULT_KEEPALIVE_SECS,
            )),
            compress: resolve_flag(None, COMPRESSION_ENV_VAR, false),
            forward_mode: if strict {
                ForwardMode::Strict
            } else {
                ForwardMode::Isolated
            },
        }
    }
}

/// Resolve a parsed value with priority: parameter -> env var -> default.
///
/// Environment values that fail to parse are ignored.
pub(crate) fn resolve_value<T: FromStr>(param: Option<T>, env_var: &str, default: T) -> T {
    if let Some(value) = param {
        return value;
    }

    if let Ok(raw) = env::var(env_var)
        && let Ok(value) = raw.trim().parse::<T>()
    {
        return value;
    }

    default
}

/// Resolve a boolean flag; the environment accepts `true` (any case) or `1`.
pub(crate) fn resolve_flag(param: Option<bool>, env_var: &str, default: bool) -> bool {
    if let Some(flag) = param {
        return flag;
    }

    if let Ok(raw) = env::var(env_var) {
        let raw = raw.trim();
        return raw.eq_ignore_ascii_case("true") || raw == "1";
    }

    default
}
