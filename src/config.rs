use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;

/// Runtime configuration, loaded from a JSON file (`config.json` next to the
/// binary, or the path in `LB_CONFIG`). Every field has a default so a
/// partial file works.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    /// The gateway's own BBB-compatible shared secret, used to validate
    /// incoming checksums and to sign self-referential rejoin URLs.
    pub secret: String,
    pub player: PlayerConfig,
    pub monitoring: MonitoringConfig,
    /// Account used by the shell probes when sshing into fleet members.
    pub ssh_user: String,
    /// The gateway's externally visible host (cookie domain, rejoin URLs).
    pub hostname: String,
    /// Default redirect target when rejoin has nowhere better to send you.
    pub logout_url: String,
    /// Seconds between poll cycles. 0 disables the poller entirely.
    pub poll_interval: u64,
    /// Directory holding the shell probe scripts.
    pub plugin_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
    pub api_url: String,
    pub rcp_secret: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub secret: String,
    /// Accepted clock skew (seconds) for Authorization checksums.
    pub time_delta: i64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            database: DatabaseConfig::default(),
            secret: "change_me".to_string(),
            player: PlayerConfig::default(),
            monitoring: MonitoringConfig::default(),
            ssh_user: "root".to_string(),
            hostname: "localhost".to_string(),
            logout_url: "/".to_string(),
            poll_interval: 30,
            plugin_path: "plugins".to_string(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            path: "data/loadbalancer.db".to_string(),
        }
    }
}

impl Default for PlayerConfig {
    fn default() -> Self {
        PlayerConfig {
            api_url: "https://change_me/api/v1/".to_string(),
            rcp_secret: "change_me".to_string(),
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        MonitoringConfig {
            secret: "change_me".to_string(),
            time_delta: 5,
        }
    }
}

impl Config {
    /// Load from `LB_CONFIG` or `./config.json`; missing file means defaults.
    pub fn load() -> Config {
        let path = env::var("LB_CONFIG").unwrap_or_else(|_| "config.json".to_string());
        Config::from_file(&path)
    }

    pub fn from_file(path: &str) -> Config {
        if !Path::new(path).exists() {
            eprintln!("⚠️  Config file {path} not found, using defaults");
            return Config::default();
        }
        match std::fs::read_to_string(path) {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("⚠️  Could not parse {path}: {e}, using defaults");
                    Config::default()
                }
            },
            Err(e) => {
                eprintln!("⚠️  Could not read {path}: {e}, using defaults");
                Config::default()
            }
        }
    }
}
