use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Top-level configuration loaded from `~/.config/cluster/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub staleness: StalenessConfig,
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default)]
    pub auth: AuthConfig,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            network: NetworkConfig::default(),
            staleness: StalenessConfig::default(),
            control: ControlConfig::default(),
            auth: AuthConfig::default(),
        }
    }
}

impl ClusterConfig {
    /// Load from `~/.config/cluster/config.toml`, falling back to defaults
    /// when the file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let cfg: ClusterConfig = toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Assert the three-band staleness ordering holds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.staleness.fresh_threshold_secs >= self.staleness.stale_threshold_secs {
            return Err(ConfigError::Invalid(
                "staleness.fresh_threshold_secs must be less than staleness.stale_threshold_secs".to_string(),
            ));
        }
        Ok(())
    }

    fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("cluster")
            .join("config.toml")
    }
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { db_path: default_db_path() }
    }
}

fn default_db_path() -> String {
    "~/.local/share/cluster/cluster.db".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Externally reachable base URL used to build `pty_ws_url` values.
    /// Never hardcode a host in a per-call string -- always join against this.
    #[serde(default = "default_public_ws_base")]
    pub public_ws_base: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self { public_ws_base: default_public_ws_base() }
    }
}

fn default_public_ws_base() -> String {
    "ws://127.0.0.1:8000".to_string()
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StalenessConfig {
    #[serde(default = "default_fresh_threshold")]
    pub fresh_threshold_secs: u64,
    #[serde(default = "default_stale_threshold")]
    pub stale_threshold_secs: u64,
}

impl Default for StalenessConfig {
    fn default() -> Self {
        Self {
            fresh_threshold_secs: default_fresh_threshold(),
            stale_threshold_secs: default_stale_threshold(),
        }
    }
}

fn default_fresh_threshold() -> u64 {
    15
}
fn default_stale_threshold() -> u64 {
    90
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ControlConfig {
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
    #[serde(default = "default_max_agents_per_pty")]
    pub max_agents_per_pty_connection: u32,
    #[serde(default = "default_intent_queue_depth")]
    pub intent_queue_depth: usize,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: default_heartbeat_interval(),
            handshake_timeout_secs: default_handshake_timeout(),
            max_agents_per_pty_connection: default_max_agents_per_pty(),
            intent_queue_depth: default_intent_queue_depth(),
        }
    }
}

fn default_heartbeat_interval() -> u64 {
    30
}
fn default_handshake_timeout() -> u64 {
    30
}
fn default_max_agents_per_pty() -> u32 {
    10
}
fn default_intent_queue_depth() -> usize {
    64
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "default_require_bootstrap_token")]
    pub require_bootstrap_token: bool,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self { require_bootstrap_token: default_require_bootstrap_token() }
    }
}

fn default_require_bootstrap_token() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_round_trip_through_toml() {
        let cfg = ClusterConfig::default();
        let text = cfg.to_toml().unwrap();
        let parsed: ClusterConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.staleness.fresh_threshold_secs, 15);
        assert_eq!(parsed.control.max_agents_per_pty_connection, 10);
    }

    #[test]
    fn validate_rejects_inverted_thresholds() {
        let mut cfg = ClusterConfig::default();
        cfg.staleness.fresh_threshold_secs = 100;
        cfg.staleness.stale_threshold_secs = 50;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let text = "[control]\nheartbeat_interval_secs = 15\n";
        let cfg: ClusterConfig = toml::from_str(text).unwrap();
        assert_eq!(cfg.control.heartbeat_interval_secs, 15);
        assert_eq!(cfg.control.handshake_timeout_secs, 30);
        assert_eq!(cfg.network.public_ws_base, "ws://127.0.0.1:8000");
    }
}
