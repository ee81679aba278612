//! Relay configuration.
//!
//! Loading flow:
//! 1. Start with compiled [`RelayConfig::default()`]
//! 2. If the config file exists (`$RELAY_CONFIG`, else `~/.chat-relay/config.json`),
//!    deep-merge its values over the defaults
//! 3. Apply `RELAY_*` environment overrides (highest priority)

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn, Level};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RelayConfig {
    pub server: ServerSettings,
    pub database: DatabaseSettings,
    pub telemetry: TelemetrySettings,
    pub notify: NotifySettings,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    pub host: String,
    /// `0` picks a free port.
    pub port: u16,
    /// Pending outbound frames per connection before it is evicted.
    pub outbound_capacity: usize,
    /// Largest inbound frame accepted, in bytes.
    pub max_frame_size: usize,
    /// Read deadline; extended by every pong.
    pub pong_wait_secs: u64,
    pub write_wait_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8080,
            outbound_capacity: 256,
            max_frame_size: 512,
            pong_wait_secs: 60,
            write_wait_secs: 10,
        }
    }
}

impl ServerSettings {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn pong_wait(&self) -> Duration {
        Duration::from_secs(self.pong_wait_secs)
    }

    /// Pings go out at 9/10 of the pong window so a healthy peer always
    /// answers before the deadline.
    pub fn ping_period(&self) -> Duration {
        self.pong_wait() * 9 / 10
    }

    pub fn write_wait(&self) -> Duration {
        Duration::from_secs(self.write_wait_secs)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DatabaseSettings {
    pub path: PathBuf,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            path: relay_home().join("chat.db"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TelemetrySettings {
    pub log_level: String,
    /// Per-target levels, e.g. `{"relay_server::pump": "debug"}`.
    pub module_levels: BTreeMap<String, String>,
    pub log_to_sqlite: bool,
    pub log_db_path: PathBuf,
    /// Persisted log records older than this are pruned hourly.
    pub log_retention_days: u32,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
            module_levels: BTreeMap::new(),
            log_to_sqlite: true,
            log_db_path: relay_home().join("logs.db"),
            log_retention_days: 7,
        }
    }
}

impl TelemetrySettings {
    pub fn to_telemetry_config(&self) -> relay_telemetry::TelemetryConfig {
        relay_telemetry::TelemetryConfig {
            log_level: Level::from_str(&self.log_level).unwrap_or(Level::INFO),
            module_levels: self
                .module_levels
                .iter()
                .filter_map(|(module, level)| match Level::from_str(level) {
                    Ok(level) => Some((module.clone(), level)),
                    Err(_) => {
                        warn!(module = %module, level = %level, "invalid module log level, ignoring");
                        None
                    }
                })
                .collect(),
            log_to_sqlite: self.log_to_sqlite,
            log_db_path: self.log_db_path.clone(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NotifySettings {
    /// Mail-relay webhook. Without one, notices are only logged.
    pub webhook_url: Option<String>,
    pub recipient: String,
    pub dashboard_url: String,
    pub timeout_secs: u64,
}

impl Default for NotifySettings {
    fn default() -> Self {
        Self {
            webhook_url: None,
            recipient: "support@localhost".into(),
            dashboard_url: "http://localhost:3000/dashboard".into(),
            timeout_secs: 10,
        }
    }
}

/// `$RELAY_CONFIG`, else `~/.chat-relay/config.json`.
pub fn config_path() -> PathBuf {
    read_env_string("RELAY_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|| relay_home().join("config.json"))
}

pub fn load_config() -> Result<RelayConfig, ConfigError> {
    load_config_from_path(&config_path())
}

/// Missing file means defaults; unreadable or invalid JSON is an error.
pub fn load_config_from_path(path: &Path) -> Result<RelayConfig, ConfigError> {
    let defaults = serde_json::to_value(RelayConfig::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading config file");
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_owned(),
            source,
        })?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "config file not found, using defaults");
        defaults
    };

    let mut config: RelayConfig = serde_json::from_value(merged)?;
    apply_overrides(&mut config, read_env_string);
    Ok(config)
}

/// Objects merge per key; arrays and scalars are replaced; nulls are skipped.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `RELAY_*` overrides read through `lookup`. Invalid values are ignored.
pub fn apply_overrides(config: &mut RelayConfig, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("RELAY_HOST") {
        config.server.host = v;
    }
    if let Some(v) = parsed(&lookup, "RELAY_PORT", |v| v.parse::<u16>().ok()) {
        config.server.port = v;
    }
    if let Some(v) = lookup("RELAY_DB_PATH") {
        config.database.path = PathBuf::from(v);
    }
    if let Some(v) = parsed(&lookup, "RELAY_LOG_LEVEL", |v| {
        Level::from_str(v).ok().map(|_| v.to_lowercase())
    }) {
        config.telemetry.log_level = v;
    }
    if let Some(v) = lookup("RELAY_NOTIFY_URL") {
        config.notify.webhook_url = Some(v);
    }
    if let Some(v) = parsed(&lookup, "RELAY_MAX_FRAME_SIZE", |v| parse_usize_range(v, 64, 1 << 20)) {
        config.server.max_frame_size = v;
    }
    if let Some(v) = parsed(&lookup, "RELAY_OUTBOUND_CAPACITY", |v| {
        parse_usize_range(v, 1, 65_536)
    }) {
        config.server.outbound_capacity = v;
    }
}

fn parsed<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    parse: impl Fn(&str) -> Option<T>,
) -> Option<T> {
    let raw = lookup(name)?;
    let value = parse(&raw);
    if value.is_none() {
        warn!(key = name, value = %raw, "invalid env override, ignoring");
    }
    value
}

pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

pub(crate) fn relay_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join(".chat-relay")
}
