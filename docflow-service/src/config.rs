use arc_swap::ArcSwap;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::db::Database;
use crate::error::{ServiceError, ServiceResult};

// ==================== Static Configuration (startup-only) ====================

/// Static configuration that cannot be changed at runtime
/// These settings affect server binding or require restart to change
#[derive(Debug, Clone, Deserialize)]
pub struct StaticConfig {
    #[serde(default = "default_server")]
    pub server: ServerConfig,

    #[serde(default = "default_storage")]
    pub storage: StorageConfig,

    #[serde(default)]
    pub auth: AuthConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

/// Storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl StorageConfig {
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("docflow.db")
    }

    pub fn documents_dir(&self) -> PathBuf {
        self.data_dir.join("documents")
    }
}

/// API credentials
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthConfig {
    /// SHA-256 hex digest of a bearer token -> owner id
    #[serde(default)]
    pub tokens: HashMap<String, String>,
}

impl Default for StaticConfig {
    fn default() -> Self {
        Self {
            server: default_server(),
            storage: default_storage(),
            auth: AuthConfig::default(),
        }
    }
}

// ==================== Dynamic Configuration (hot-reloadable) ====================

/// Dynamic configuration that can be updated at runtime via API
/// DB values override config file/env defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DynamicConfig {
    #[serde(default = "default_ollama")]
    pub ollama: OllamaConfig,

    #[serde(default = "default_embeddings")]
    pub embeddings: EmbeddingsConfig,

    #[serde(default = "default_queue")]
    pub queue: QueueConfig,

    #[serde(default = "default_limits")]
    pub limits: LimitsConfig,
}

/// Ollama configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OllamaConfig {
    #[serde(default = "default_ollama_url")]
    pub base_url: String,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

/// Embeddings configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingsConfig {
    #[serde(default = "default_embedding_model")]
    pub model: String,

    /// Words per chunk
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Words shared between consecutive chunks
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
}

/// Job queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Added to a job's priority on explicit retry
    #[serde(default = "default_retry_priority_boost")]
    pub retry_priority_boost: i64,

    /// A processing job older than this is considered orphaned
    #[serde(default = "default_stuck_timeout_secs")]
    pub stuck_timeout_secs: u64,

    /// Interval of the bundled dispatch trigger (0 = disabled)
    #[serde(default = "default_dispatch_interval_secs")]
    pub dispatch_interval_secs: u64,

    /// Interval of the bundled reaper trigger (0 = disabled)
    #[serde(default = "default_reaper_interval_secs")]
    pub reaper_interval_secs: u64,
}

impl QueueConfig {
    pub fn stuck_timeout(&self) -> Duration {
        Duration::from_secs(self.stuck_timeout_secs)
    }

    pub fn dispatch_interval(&self) -> Option<Duration> {
        (self.dispatch_interval_secs > 0).then(|| Duration::from_secs(self.dispatch_interval_secs))
    }

    pub fn reaper_interval(&self) -> Option<Duration> {
        (self.reaper_interval_secs > 0).then(|| Duration::from_secs(self.reaper_interval_secs))
    }
}

/// Size limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_max_document_size")]
    pub max_document_size_bytes: u64,
}

impl Default for DynamicConfig {
    fn default() -> Self {
        Self {
            ollama: default_ollama(),
            embeddings: default_embeddings(),
            queue: default_queue(),
            limits: default_limits(),
        }
    }
}

// ==================== DynamicConfig Settings Keys ====================

/// All valid setting keys for DynamicConfig
pub const VALID_SETTING_KEYS: &[&str] = &[
    "ollama.base_url",
    "ollama.request_timeout_secs",
    "embeddings.model",
    "embeddings.chunk_size",
    "embeddings.chunk_overlap",
    "queue.retry_priority_boost",
    "queue.stuck_timeout_secs",
    "queue.dispatch_interval_secs",
    "queue.reaper_interval_secs",
    "limits.max_document_size_bytes",
];

impl DynamicConfig {
    /// Get all valid setting keys
    pub fn valid_keys() -> HashSet<&'static str> {
        VALID_SETTING_KEYS.iter().copied().collect()
    }

    /// Convert config to key-value map for API response
    pub fn to_key_value_map(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();

        // Ollama settings
        map.insert(
            "ollama.base_url".to_string(),
            serde_json::Value::String(self.ollama.base_url.clone()),
        );
        map.insert(
            "ollama.request_timeout_secs".to_string(),
            serde_json::json!(self.ollama.request_timeout_secs),
        );

        // Embeddings settings
        map.insert(
            "embeddings.model".to_string(),
            serde_json::Value::String(self.embeddings.model.clone()),
        );
        map.insert(
            "embeddings.chunk_size".to_string(),
            serde_json::json!(self.embeddings.chunk_size),
        );
        map.insert(
            "embeddings.chunk_overlap".to_string(),
            serde_json::json!(self.embeddings.chunk_overlap),
        );

        // Queue settings
        map.insert(
            "queue.retry_priority_boost".to_string(),
            serde_json::json!(self.queue.retry_priority_boost),
        );
        map.insert(
            "queue.stuck_timeout_secs".to_string(),
            serde_json::json!(self.queue.stuck_timeout_secs),
        );
        map.insert(
            "queue.dispatch_interval_secs".to_string(),
            serde_json::json!(self.queue.dispatch_interval_secs),
        );
        map.insert(
            "queue.reaper_interval_secs".to_string(),
            serde_json::json!(self.queue.reaper_interval_secs),
        );

        // Limits settings
        map.insert(
            "limits.max_document_size_bytes".to_string(),
            serde_json::json!(self.limits.max_document_size_bytes),
        );

        map
    }

    /// Apply DB settings as overrides to this config
    pub fn merge_from_db(&mut self, db_settings: &HashMap<String, serde_json::Value>) {
        for (key, value) in db_settings {
            self.apply_setting(key, value);
        }
    }

    /// Apply a single setting value
    fn apply_setting(&mut self, key: &str, value: &serde_json::Value) {
        match key {
            // Ollama settings
            "ollama.base_url" => {
                if let Some(v) = value.as_str() {
                    self.ollama.base_url = v.to_string();
                }
            }
            "ollama.request_timeout_secs" => {
                if let Some(v) = value.as_u64() {
                    self.ollama.request_timeout_secs = v;
                }
            }

            // Embeddings settings
            "embeddings.model" => {
                if let Some(v) = value.as_str() {
                    self.embeddings.model = v.to_string();
                }
            }
            "embeddings.chunk_size" => {
                if let Some(v) = value.as_u64() {
                    self.embeddings.chunk_size = v as usize;
                }
            }
            "embeddings.chunk_overlap" => {
                if let Some(v) = value.as_u64() {
                    self.embeddings.chunk_overlap = v as usize;
                }
            }

            // Queue settings
            "queue.retry_priority_boost" => {
                if let Some(v) = value.as_i64() {
                    self.queue.retry_priority_boost = v;
                }
            }
            "queue.stuck_timeout_secs" => {
                if let Some(v) = value.as_u64() {
                    self.queue.stuck_timeout_secs = v;
                }
            }
            "queue.dispatch_interval_secs" => {
                if let Some(v) = value.as_u64() {
                    self.queue.dispatch_interval_secs = v;
                }
            }
            "queue.reaper_interval_secs" => {
                if let Some(v) = value.as_u64() {
                    self.queue.reaper_interval_secs = v;
                }
            }

            // Limits settings
            "limits.max_document_size_bytes" => {
                if let Some(v) = value.as_u64() {
                    self.limits.max_document_size_bytes = v;
                }
            }

            _ => {
                tracing::warn!(key = %key, "Unknown setting key in merge_from_db");
            }
        }
    }
}

// ==================== RuntimeConfig (combines static + dynamic) ====================

/// Runtime configuration manager
/// Combines static config (startup-only) with dynamic config (hot-reloadable via ArcSwap)
pub struct RuntimeConfig {
    /// Static configuration (never changes after startup)
    pub static_config: StaticConfig,
    /// Dynamic configuration (can be hot-reloaded)
    dynamic: ArcSwap<DynamicConfig>,
}

impl RuntimeConfig {
    /// Build from already-resolved parts
    pub fn new(static_config: StaticConfig, dynamic: DynamicConfig) -> Self {
        Self {
            static_config,
            dynamic: ArcSwap::from_pointee(dynamic),
        }
    }

    /// Get current dynamic config snapshot (lock-free read)
    pub fn dynamic(&self) -> arc_swap::Guard<Arc<DynamicConfig>> {
        self.dynamic.load()
    }

    /// Update dynamic config (atomic swap)
    pub fn update_dynamic(&self, new_config: DynamicConfig) {
        self.dynamic.store(Arc::new(new_config));
    }

    /// Load dynamic config from all sources with DB overrides
    pub fn load(static_config: StaticConfig, db: &Database) -> ServiceResult<Self> {
        // Load dynamic config defaults from env/file, then apply DB overrides
        let mut dynamic = load_dynamic_config()?;
        let db_settings = db.get_all_settings()?;
        dynamic.merge_from_db(&db_settings);

        Ok(Self::new(static_config, dynamic))
    }

    /// Rebuild dynamic config from file/env defaults + DB and swap atomically
    pub fn reload_from_db(&self, db: &Database) -> ServiceResult<()> {
        let mut dynamic = load_dynamic_config()?;
        let db_settings = db.get_all_settings()?;
        dynamic.merge_from_db(&db_settings);
        self.update_dynamic(dynamic);
        Ok(())
    }
}

// ==================== Config Loading Functions ====================

fn config_sources() -> ServiceResult<Config> {
    Config::builder()
        .add_source(File::with_name("config").required(false))
        .add_source(
            Environment::with_prefix("DOCFLOW")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .map_err(|e| ServiceError::Config {
            message: format!("Failed to build config: {}", e),
        })
}

/// Load static configuration from file and env vars
pub fn load_static_config() -> ServiceResult<StaticConfig> {
    config_sources()?
        .try_deserialize()
        .map_err(|e| ServiceError::Config {
            message: format!("Failed to deserialize static config: {}", e),
        })
}

/// Load dynamic configuration from file and env vars (without DB overrides)
fn load_dynamic_config() -> ServiceResult<DynamicConfig> {
    config_sources()?
        .try_deserialize()
        .map_err(|e| ServiceError::Config {
            message: format!("Failed to deserialize dynamic config: {}", e),
        })
}

// ==================== Default Value Functions ====================

fn default_server() -> ServerConfig {
    ServerConfig {
        host: default_host(),
        port: default_port(),
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_storage() -> StorageConfig {
    StorageConfig {
        data_dir: default_data_dir(),
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_ollama() -> OllamaConfig {
    OllamaConfig {
        base_url: default_ollama_url(),
        request_timeout_secs: default_request_timeout_secs(),
    }
}

fn default_ollama_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_request_timeout_secs() -> u64 {
    120
}

fn default_embeddings() -> EmbeddingsConfig {
    EmbeddingsConfig {
        model: default_embedding_model(),
        chunk_size: default_chunk_size(),
        chunk_overlap: default_chunk_overlap(),
    }
}

fn default_embedding_model() -> String {
    "nomic-embed-text".to_string()
}

fn default_chunk_size() -> usize {
    512
}

fn default_chunk_overlap() -> usize {
    64
}

fn default_queue() -> QueueConfig {
    QueueConfig {
        retry_priority_boost: default_retry_priority_boost(),
        stuck_timeout_secs: default_stuck_timeout_secs(),
        dispatch_interval_secs: default_dispatch_interval_secs(),
        reaper_interval_secs: default_reaper_interval_secs(),
    }
}

fn default_retry_priority_boost() -> i64 {
    10
}

fn default_stuck_timeout_secs() -> u64 {
    15 * 60
}

fn default_dispatch_interval_secs() -> u64 {
    2
}

fn default_reaper_interval_secs() -> u64 {
    60
}

fn default_limits() -> LimitsConfig {
    LimitsConfig {
        max_document_size_bytes: default_max_document_size(),
    }
}

fn default_max_document_size() -> u64 {
    104_857_600 // 100MB
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DynamicConfig::default();
        assert_eq!(config.queue.retry_priority_boost, 10);
        assert_eq!(config.queue.stuck_timeout(), Duration::from_secs(900));
        assert_eq!(config.queue.dispatch_interval(), Some(Duration::from_secs(2)));
        assert_eq!(config.embeddings.model, "nomic-embed-text");
    }

    #[test]
    fn test_key_map_covers_valid_keys() {
        let map = DynamicConfig::default().to_key_value_map();
        let keys: HashSet<&str> = map.keys().map(String::as_str).collect();
        assert_eq!(keys, DynamicConfig::valid_keys());
    }

    #[test]
    fn test_merge_from_db_overrides() {
        let mut config = DynamicConfig::default();
        let mut settings = HashMap::new();
        settings.insert("queue.reaper_interval_secs".to_string(), serde_json::json!(0));
        settings.insert("queue.retry_priority_boost".to_string(), serde_json::json!(-5));
        settings.insert("embeddings.chunk_size".to_string(), serde_json::json!("wrong type"));
        config.merge_from_db(&settings);

        assert_eq!(config.queue.reaper_interval(), None);
        assert_eq!(config.queue.retry_priority_boost, -5);
        assert_eq!(config.embeddings.chunk_size, 512);
    }

    #[test]
    fn test_runtime_config_swaps_dynamic() {
        let runtime = RuntimeConfig::new(StaticConfig::default(), DynamicConfig::default());
        let mut updated = DynamicConfig::default();
        updated.queue.retry_priority_boost = 25;
        runtime.update_dynamic(updated);
        assert_eq!(runtime.dynamic().queue.retry_priority_boost, 25);
        assert_eq!(runtime.static_config.storage.database_path(), PathBuf::from("./data/docflow.db"));
    }
}
