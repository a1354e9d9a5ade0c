use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{ZkvError, ZkvResult};
use crate::types::{KdfParams, DEFAULT_KEY_SIZE_WORDS};

/// Top-level engine configuration (loaded from zkvault.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ZkvConfig {
    pub crypto: CryptoConfig,
    pub executor: ExecutorConfig,
    pub cache: CacheConfig,
    pub sync: SyncConfig,
    pub session: SessionConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

/// PBKDF2 cost parameters and key cache bounds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    /// Iterations for record envelopes (default: 100000)
    pub record_iterations: u32,
    /// Iterations for the registration verification envelope only (default: 1000)
    pub bootstrap_iterations: u32,
    /// Iterations for the slow verification hash (default: 100000)
    pub slow_hash_iterations: u32,
    /// Iterations for the fast verification hash (default: 10000)
    pub fast_hash_iterations: u32,
    /// Key size in 32-bit words (default: 8 = 256-bit)
    pub key_size: u32,
    /// How long a derived key stays memoized (default: 900s)
    pub key_cache_ttl_secs: u64,
    /// Maximum memoized keys (default: 64)
    pub key_cache_capacity: usize,
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            record_iterations: 100_000,
            bootstrap_iterations: 1_000,
            slow_hash_iterations: 100_000,
            fast_hash_iterations: 10_000,
            key_size: DEFAULT_KEY_SIZE_WORDS,
            key_cache_ttl_secs: 15 * 60,
            key_cache_capacity: 64,
        }
    }
}

impl CryptoConfig {
    pub fn record_params(&self) -> KdfParams {
        KdfParams {
            iterations: self.record_iterations,
            key_size: self.key_size,
        }
    }

    pub fn bootstrap_params(&self) -> KdfParams {
        KdfParams {
            iterations: self.bootstrap_iterations,
            key_size: self.key_size,
        }
    }

    pub fn key_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.key_cache_ttl_secs)
    }
}

/// Background crypto worker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Run cipher work on a dedicated worker thread (default: true)
    pub use_worker: bool,
    /// Per-task deadline in milliseconds (default: 10000)
    pub task_timeout_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            use_worker: true,
            task_timeout_ms: 10_000,
        }
    }
}

impl ExecutorConfig {
    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }
}

/// Decrypted record cache bounds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Entry lifetime in seconds (default: 30)
    pub ttl_secs: u64,
    /// Maximum number of owners cached (default: 50)
    pub max_owners: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 30,
            max_owners: 50,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// Remote change subscription tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Snapshot coalescing window in milliseconds (default: 200)
    pub debounce_ms: u64,
    /// Records decrypted between cooperative yields (default: 6)
    pub batch_size: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 200,
            batch_size: 6,
        }
    }
}

impl SyncConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

/// Session secret handling
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Refuse to restore a session idle for longer than this (default: unset)
    pub auto_lock_after_secs: Option<u64>,
}

impl SessionConfig {
    pub fn auto_lock_after(&self) -> Option<Duration> {
        self.auto_lock_after_secs.map(Duration::from_secs)
    }
}

/// Remote document store backend
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// "memory" or "s3" (default: memory)
    pub backend: String,
    /// S3 endpoint
    pub endpoint: String,
    /// S3 region (default: us-east-1)
    pub region: String,
    /// Bucket name
    pub bucket: String,
    /// Key prefix for every document (default: zkvault)
    pub prefix: String,
    /// Refuse plaintext HTTP endpoints
    pub enforce_tls: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: "memory".into(),
            endpoint: "http://localhost:8333".into(),
            region: "us-east-1".into(),
            bucket: "zkvault".into(),
            prefix: "zkvault".into(),
            enforce_tls: false,
        }
    }
}

/// Log output settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level or EnvFilter directive (default: info)
    pub level: String,
    /// "json" or "text" (default: text)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

impl ZkvConfig {
    /// Load configuration from a TOML file, falling back to defaults when the
    /// file does not exist.
    pub fn load(path: &Path) -> ZkvResult<Self> {
        if !path.exists() {
            tracing::warn!("config file not found: {}  (using defaults)", path.display());
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
            .map_err(|e| ZkvError::Config(format!("parsing {}: {e}", path.display())))
    }

    pub fn from_toml_str(content: &str) -> ZkvResult<Self> {
        let config: ZkvConfig =
            toml::from_str(content).map_err(|e| ZkvError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would disable a safety bound.
    pub fn validate(&self) -> ZkvResult<()> {
        let c = &self.crypto;
        for (name, value) in [
            ("crypto.record_iterations", c.record_iterations),
            ("crypto.bootstrap_iterations", c.bootstrap_iterations),
            ("crypto.slow_hash_iterations", c.slow_hash_iterations),
            ("crypto.fast_hash_iterations", c.fast_hash_iterations),
        ] {
            if value == 0 {
                return Err(ZkvError::Config(format!("{name} must be greater than 0")));
            }
        }
        if c.key_size != DEFAULT_KEY_SIZE_WORDS {
            return Err(ZkvError::Config(format!(
                "crypto.key_size must be {DEFAULT_KEY_SIZE_WORDS} (256-bit), got {}",
                c.key_size
            )));
        }
        if self.executor.task_timeout_ms == 0 {
            return Err(ZkvError::Config(
                "executor.task_timeout_ms must be greater than 0".into(),
            ));
        }
        if self.cache.max_owners == 0 {
            return Err(ZkvError::Config("cache.max_owners must be greater than 0".into()));
        }
        if self.sync.batch_size == 0 {
            return Err(ZkvError::Config("sync.batch_size must be greater than 0".into()));
        }
        match self.storage.backend.as_str() {
            "memory" | "s3" => Ok(()),
            other => Err(ZkvError::Config(format!(
                "storage.backend must be \"memory\" or \"s3\", got {other:?}"
            ))),
        }
    }
}
