use std::{
    env, fmt,
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use dashmap::DashMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::logger::LogConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error on {path}: {reason}")]
    Io { path: String, reason: String },
    #[error("cannot parse {key}={value}: {reason}")]
    Parse { key: String, value: String, reason: String },
    #[error("config file error: {0}")]
    Format(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[async_trait]
pub trait ConfigManagerType: Send + Sync {
    async fn as_vec(&self) -> Vec<(String, String)> {
        let mut config = vec![];
        for key in self.keys().await {
            if let Some(value) = self.get(&key).await {
                config.push((key, value));
            }
        }
        config
    }
    async fn keys(&self) -> Vec<String>;
    async fn get(&self, key: &str) -> Option<String>;
    async fn del(&self, key: &str);
    async fn set(&self, key: &str, value: &str) -> Result<(), String>;
    fn clone_box(&self) -> Box<dyn ConfigManagerType>;
    fn debug_box(&self) -> String;
}

pub struct ConfigManager(pub Box<dyn ConfigManagerType>);

impl ConfigManager {
    pub fn into_inner(self) -> Box<dyn ConfigManagerType> {
        self.0
    }
}

impl Clone for ConfigManager {
    fn clone(&self) -> Self {
        ConfigManager(self.0.clone_box())
    }
}

impl fmt::Debug for ConfigManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.debug_box())
    }
}

/// Process environment layered over an optional `.env` file.
///
/// Lookup order: values set through this manager, then the process
/// environment, then the `.env` file. `set`/`del` never touch the process
/// environment or the file.
#[derive(Clone, Debug)]
pub struct EnvConfigManager {
    env_file: PathBuf,
    file_values: Arc<DashMap<String, String>>,
    /// `None` marks a key deleted through this manager
    overlay: Arc<DashMap<String, Option<String>>>,
}

impl EnvConfigManager {
    pub fn new(env_file: PathBuf) -> Box<Self> {
        let file_values = DashMap::new();
        match dotenvy::from_path_iter(&env_file) {
            Ok(iter) => {
                for item in iter {
                    match item {
                        Ok((k, v)) => {
                            file_values.insert(k, v);
                        }
                        Err(e) => warn!(file = %env_file.display(), error = %e, "skipping bad .env line"),
                    }
                }
                info!("Loaded .env from {}", env_file.display());
            }
            Err(_) => debug!("no .env at {}", env_file.display()),
        }

        Box::new(Self {
            env_file,
            file_values: Arc::new(file_values),
            overlay: Arc::new(DashMap::new()),
        })
    }
}

#[async_trait]
impl ConfigManagerType for EnvConfigManager {
    async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = env::vars().map(|(k, _)| k).collect();
        keys.extend(self.file_values.iter().map(|e| e.key().clone()));
        keys.extend(self.overlay.iter().map(|e| e.key().clone()));
        keys.sort();
        keys.dedup();
        keys.retain(|k| !matches!(self.overlay.get(k).as_deref(), Some(None)));
        keys
    }

    async fn get(&self, key: &str) -> Option<String> {
        if let Some(entry) = self.overlay.get(key) {
            return entry.value().clone();
        }
        env::var(key)
            .ok()
            .or_else(|| self.file_values.get(key).map(|v| v.value().clone()))
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), String> {
        if key.is_empty() || key.contains('=') {
            return Err(format!("invalid key `{}`", key));
        }
        self.overlay.insert(key.to_string(), Some(value.to_string()));
        Ok(())
    }

    async fn del(&self, key: &str) {
        self.overlay.insert(key.to_string(), None);
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        format!("EnvConfigManager({})", self.env_file.display())
    }
}

#[derive(Debug, Clone, Default)]
pub struct MapConfigManager {
    map: DashMap<String, String>,
}

impl MapConfigManager {
    pub fn new() -> Box<Self> {
        Box::new(Self { map: DashMap::new() })
    }

    pub fn with_values<I, K, V>(values: I) -> Box<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Box::new(Self {
            map: values.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        })
    }
}

#[async_trait]
impl ConfigManagerType for MapConfigManager {
    async fn keys(&self) -> Vec<String> {
        self.map.iter().map(|entry| entry.key().clone()).collect()
    }

    async fn get(&self, key: &str) -> Option<String> {
        self.map.get(key).map(|v| v.clone())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), String> {
        self.map.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn del(&self, key: &str) {
        self.map.remove(key);
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        format!("MapConfigManager({} entries)", self.map.len())
    }
}

/// Tunables of the orchestration core. Every field has a default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct CoreConfig {
    /// Events kept in the bus history.
    pub history_capacity: usize,
    /// Nested emits beyond this depth are queued instead of run inline.
    pub max_emit_depth: usize,
    /// Modules at or below this priority abort the boot when they fail.
    pub critical_priority: i32,
    pub probe_timeout_ms: u64,
    pub consistency_interval_secs: u64,
    pub consistency_debounce_ms: u64,
    /// Pause between disable and enable in `reinitialize_module`.
    pub reinit_pause_ms: u64,
    pub max_insights_per_entry: usize,
    /// Flow targets that need connectivity; their edges go down offline.
    pub network_targets: Vec<String>,
    pub log: LogConfig,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            history_capacity: 100,
            max_emit_depth: 16,
            critical_priority: 1,
            probe_timeout_ms: 2000,
            consistency_interval_secs: 30,
            consistency_debounce_ms: 1000,
            reinit_pause_ms: 100,
            max_insights_per_entry: 10,
            network_targets: vec!["ai".into(), "calendar".into(), "sync".into()],
            log: LogConfig::default(),
        }
    }
}

async fn read_parsed<T>(mgr: &ConfigManager, key: &str, target: &mut T) -> Result<(), ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    if let Some(value) = mgr.0.get(key).await {
        *target = value.trim().parse().map_err(|e: T::Err| ConfigError::Parse {
            key: key.to_string(),
            value: value.clone(),
            reason: e.to_string(),
        })?;
    }
    Ok(())
}

impl CoreConfig {
    /// Defaults overridden by any `BATTERY_*` key the manager knows.
    pub async fn from_manager(mgr: &ConfigManager) -> Result<Self, ConfigError> {
        let mut cfg = CoreConfig::default();
        read_parsed(mgr, "BATTERY_HISTORY_CAPACITY", &mut cfg.history_capacity).await?;
        read_parsed(mgr, "BATTERY_MAX_EMIT_DEPTH", &mut cfg.max_emit_depth).await?;
        read_parsed(mgr, "BATTERY_CRITICAL_PRIORITY", &mut cfg.critical_priority).await?;
        read_parsed(mgr, "BATTERY_PROBE_TIMEOUT_MS", &mut cfg.probe_timeout_ms).await?;
        read_parsed(mgr, "BATTERY_CONSISTENCY_INTERVAL_SECS", &mut cfg.consistency_interval_secs).await?;
        read_parsed(mgr, "BATTERY_CONSISTENCY_DEBOUNCE_MS", &mut cfg.consistency_debounce_ms).await?;
        read_parsed(mgr, "BATTERY_REINIT_PAUSE_MS", &mut cfg.reinit_pause_ms).await?;
        read_parsed(mgr, "BATTERY_MAX_INSIGHTS_PER_ENTRY", &mut cfg.max_insights_per_entry).await?;

        if let Some(targets) = mgr.0.get("BATTERY_NETWORK_TARGETS").await {
            cfg.network_targets = targets
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(level) = mgr.0.get("BATTERY_LOG_LEVEL").await {
            cfg.log.log_level = level;
        }
        if let Some(dir) = mgr.0.get("BATTERY_LOG_DIR").await {
            cfg.log.log_dir = Some(PathBuf::from(dir));
        }

        cfg.validate()?;
        Ok(cfg)
    }

    /// Load from a `.json`, `.yaml` or `.yml` file; missing fields keep their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let ext = path
            .extension()
            .and_then(|os| os.to_str())
            .unwrap_or_default()
            .to_lowercase();
        let cfg: CoreConfig = match ext.as_str() {
            "json" => serde_json::from_str(&contents).map_err(|e| ConfigError::Format(format!("JSON parse error: {}", e)))?,
            "yaml" | "yml" => {
                serde_yaml_bw::from_str(&contents).map_err(|e| ConfigError::Format(format!("YAML parse error: {}", e)))?
            }
            other => {
                return Err(ConfigError::Format(format!(
                    "unsupported extension “{}” (expected .json, .yaml or .yml)",
                    other
                )));
            }
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_emit_depth == 0 {
            return Err(ConfigError::Invalid("max_emit_depth must be at least 1".into()));
        }
        if self.consistency_interval_secs == 0 {
            return Err(ConfigError::Invalid("consistency_interval_secs must be positive".into()));
        }
        Ok(())
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn consistency_interval(&self) -> Duration {
        Duration::from_secs(self.consistency_interval_secs)
    }

    pub fn consistency_debounce(&self) -> Duration {
        Duration::from_millis(self.consistency_debounce_ms)
    }

    pub fn reinit_pause(&self) -> Duration {
        Duration::from_millis(self.reinit_pause_ms)
    }
}
