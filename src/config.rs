//! Engine Configuration
//!
//! Plain structs with defaults, optionally overridden from the environment.

use std::net::SocketAddr;
use std::time::Duration;

use crate::network::NetworkConfig;
use crate::sync::SynchronizerConfig;

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Variable set but unparseable.
    #[error("Invalid value for {var}: {value:?} ({reason})")]
    InvalidValue {
        /// Environment variable.
        var: &'static str,
        /// Raw value.
        value: String,
        /// Parse error.
        reason: String,
    },

    /// Tick period of zero.
    #[error("Tick period must be positive")]
    ZeroTickPeriod,
}

/// Complete engine configuration.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    /// Tick synchronizer.
    pub sync: SynchronizerConfig,
    /// Network layer.
    pub network: NetworkConfig,
}

impl EngineConfig {
    /// Load from environment variables, falling back to defaults.
    ///
    /// - `ENGINE_TICK_MS`: tick period in milliseconds
    /// - `ENGINE_SHUTDOWN_MS`: bounded wait on `finish()`
    /// - `ENGINE_BIND_ADDR`: UDP bind address
    /// - `ENGINE_PROTOCOL_VERSION`: handshake protocol version
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Load using `lookup` in place of the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&'static str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(ms) = parse::<u64, _>(&lookup, "ENGINE_TICK_MS")? {
            if ms == 0 {
                return Err(ConfigError::ZeroTickPeriod);
            }
            config.sync.period = Duration::from_millis(ms);
        }
        if let Some(ms) = parse::<u64, _>(&lookup, "ENGINE_SHUTDOWN_MS")? {
            config.sync.shutdown_timeout = Duration::from_millis(ms);
        }
        if let Some(addr) = parse::<SocketAddr, _>(&lookup, "ENGINE_BIND_ADDR")? {
            config.network.bind_addr = addr;
        }
        if let Some(version) = parse::<u16, _>(&lookup, "ENGINE_PROTOCOL_VERSION")? {
            config.network.protocol_version = version;
        }

        Ok(config)
    }
}

fn parse<T, F>(lookup: &F, var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&'static str) -> Option<String>,
{
    match lookup(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::InvalidValue {
                var,
                reason: e.to_string(),
                value,
            }),
    }
}
