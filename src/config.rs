// src/config.rs

//! Connection descriptor: the immutable key-value parameters a pool is built
//! from. Produced once per pool and consumed opaquely by the transport;
//! unknown keys are passed through verbatim.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::core::PoolError;

/// TLS negotiation mode requested from the transport.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum TlsMode {
    Disabled,
    #[default]
    Prefer,
    Require,
}

/// TCP keep-alive tuning handed to the transport.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct KeepaliveConfig {
    #[serde(default = "default_keepalive_enabled")]
    pub enabled: bool,
    #[serde(default = "default_keepalive_idle", with = "humantime_serde")]
    pub idle: Duration,
    #[serde(default = "default_keepalive_interval", with = "humantime_serde")]
    pub interval: Duration,
    #[serde(default = "default_keepalive_retries")]
    pub retries: u32,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            enabled: default_keepalive_enabled(),
            idle: default_keepalive_idle(),
            interval: default_keepalive_interval(),
            retries: default_keepalive_retries(),
        }
    }
}

/// The connection descriptor. Typed accessors for the parameters the engine
/// itself reads; everything else rides along in `extra`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ConnectOptions {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub database: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: Option<String>,
    /// Bound on each handshake attempt, for initial connect and reconnect
    /// alike.
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,
    #[serde(default)]
    pub tls: TlsMode,
    #[serde(default)]
    pub application_name: Option<String>,
    #[serde(default)]
    pub keepalive: KeepaliveConfig,
    /// First delay of the exponential reconnect backoff.
    #[serde(default = "default_reconnect_initial", with = "humantime_serde")]
    pub reconnect_initial: Duration,
    /// Cap of the exponential reconnect backoff.
    #[serde(default = "default_reconnect_max", with = "humantime_serde")]
    pub reconnect_max: Duration,
    /// Validity window of `short`-classified cached results.
    #[serde(default = "default_ttl_short", with = "humantime_serde")]
    pub ttl_short: Duration,
    /// Validity window of `mid`-classified cached results.
    #[serde(default = "default_ttl_mid", with = "humantime_serde")]
    pub ttl_mid: Duration,
    /// Validity window of `long`-classified cached results.
    #[serde(default = "default_ttl_long", with = "humantime_serde")]
    pub ttl_long: Duration,
    /// Unrecognized parameters, passed through to the transport verbatim.
    #[serde(flatten, default)]
    pub extra: BTreeMap<String, String>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            database: String::new(),
            user: String::new(),
            password: None,
            connect_timeout: default_connect_timeout(),
            tls: TlsMode::default(),
            application_name: None,
            keepalive: KeepaliveConfig::default(),
            reconnect_initial: default_reconnect_initial(),
            reconnect_max: default_reconnect_max(),
            ttl_short: default_ttl_short(),
            ttl_mid: default_ttl_mid(),
            ttl_long: default_ttl_long(),
            extra: BTreeMap::new(),
        }
    }
}

impl ConnectOptions {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = database.into();
        self
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn application_name(mut self, name: impl Into<String>) -> Self {
        self.application_name = Some(name.into());
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn tls(mut self, mode: TlsMode) -> Self {
        self.tls = mode;
        self
    }

    /// Adds a passthrough parameter the engine does not interpret.
    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    /// Passthrough parameter lookup for transports.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.extra.get(key).map(String::as_str)
    }

    /// Validity window for a caching classification; `None` bypasses the
    /// cache.
    pub fn ttl_for(&self, class: crate::core::TtlClass) -> Option<Duration> {
        match class {
            crate::core::TtlClass::None => None,
            crate::core::TtlClass::Short => Some(self.ttl_short),
            crate::core::TtlClass::Mid => Some(self.ttl_mid),
            crate::core::TtlClass::Long => Some(self.ttl_long),
        }
    }

    pub fn validate(&self) -> Result<(), PoolError> {
        if self.host.is_empty() {
            return Err(PoolError::InvalidRequest("host must not be empty".into()));
        }
        if self.port == 0 {
            return Err(PoolError::InvalidRequest("port must not be zero".into()));
        }
        if self.connect_timeout.is_zero() {
            return Err(PoolError::InvalidRequest(
                "connect-timeout must be positive".into(),
            ));
        }
        Ok(())
    }
}

fn default_host() -> String {
    "localhost".to_string()
}
fn default_port() -> u16 {
    5432
}
fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}
fn default_keepalive_enabled() -> bool {
    true
}
fn default_keepalive_idle() -> Duration {
    Duration::from_secs(60)
}
fn default_keepalive_interval() -> Duration {
    Duration::from_secs(10)
}
fn default_keepalive_retries() -> u32 {
    3
}
fn default_reconnect_initial() -> Duration {
    Duration::from_secs(1)
}
fn default_reconnect_max() -> Duration {
    Duration::from_secs(60)
}
fn default_ttl_short() -> Duration {
    Duration::from_secs(30)
}
fn default_ttl_mid() -> Duration {
    Duration::from_secs(5 * 60)
}
fn default_ttl_long() -> Duration {
    Duration::from_secs(30 * 60)
}
