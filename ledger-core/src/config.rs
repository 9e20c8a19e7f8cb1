//! Configuration for the voucher ledger

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Ledger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Data directory for RocksDB
    pub data_dir: PathBuf,

    /// Service name
    pub service_name: String,

    /// Service version
    pub service_version: String,

    /// Metrics listen address
    pub metrics_listen_addr: String,

    /// RocksDB configuration
    pub rocksdb: RocksDBConfig,

    /// Entity lock configuration
    pub concurrency: ConcurrencyConfig,

    /// Conflict retry configuration
    pub retry: RetryConfig,

    /// Audit chain configuration
    pub audit: AuditConfig,

    /// Settlement notifier configuration
    pub notifier: NotifierConfig,

    /// Payment policy configuration
    pub payments: PaymentConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/ledger"),
            service_name: "voucher-ledger".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            metrics_listen_addr: "0.0.0.0:9090".to_string(),
            rocksdb: RocksDBConfig::default(),
            concurrency: ConcurrencyConfig::default(),
            retry: RetryConfig::default(),
            audit: AuditConfig::default(),
            notifier: NotifierConfig::default(),
            payments: PaymentConfig::default(),
        }
    }
}

/// RocksDB configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RocksDBConfig {
    /// Write buffer size (MB)
    pub write_buffer_size_mb: usize,

    /// Max write buffers
    pub max_write_buffer_number: i32,

    /// Target file size (MB)
    pub target_file_size_mb: u64,

    /// Max background jobs (compaction + flush)
    pub max_background_jobs: i32,

    /// Enable statistics
    pub enable_statistics: bool,

    /// fsync every commit batch
    pub sync_writes: bool,
}

impl Default for RocksDBConfig {
    fn default() -> Self {
        Self {
            write_buffer_size_mb: 64,
            max_write_buffer_number: 4,
            target_file_size_mb: 64,
            max_background_jobs: 4,
            enable_statistics: false,
            sync_writes: true,
        }
    }
}

/// Entity lock configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    /// Maximum wait for a wallet or subsidy lock (milliseconds)
    pub lock_timeout_ms: u64,

    /// Maximum wait to enter the durable audit write (milliseconds)
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
}

fn default_write_timeout_ms() -> u64 {
    300
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: 300,
            write_timeout_ms: default_write_timeout_ms(),
        }
    }
}

/// Retry configuration for persistence conflicts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt
    pub max_retries: u32,

    /// First backoff delay (milliseconds)
    pub initial_delay_ms: u64,

    /// Backoff cap (milliseconds)
    pub max_delay_ms: u64,

    /// Exponential multiplier
    pub backoff_multiplier: f64,

    /// Jitter as a fraction of the delay
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 5,
            max_delay_ms: 50,
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

/// Audit chain configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Audit log file (JSON lines)
    pub log_path: PathBuf,

    /// Per-deployment seed for the genesis hash
    pub genesis_seed: String,

    /// Replay the chain when the engine opens
    pub verify_on_open: bool,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            log_path: PathBuf::from("./data/audit/audit.log"),
            genesis_seed: "voucher-ledger-dev".to_string(),
            verify_on_open: true,
        }
    }
}

/// Settlement notifier configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifierConfig {
    /// Outbox poll interval when idle (milliseconds)
    pub poll_interval_ms: u64,

    /// Max outbox entries per dispatch round
    pub max_batch: usize,

    /// Per-sink delivery deadline (milliseconds)
    pub delivery_timeout_ms: u64,

    /// Dispatcher mailbox capacity
    pub mailbox_capacity: usize,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
            max_batch: 100,
            delivery_timeout_ms: 2_000,
            mailbox_capacity: 1_000,
        }
    }
}

/// What happens to a voucher when a payment uses less than its full amount
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartialUsePolicy {
    /// Voucher stays active with its amount untouched
    RetainVoucher,
    /// Voucher amount is reduced by the payment
    DeductRemaining,
}

/// Payment policy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentConfig {
    /// Partial-use policy
    pub partial_use: PartialUsePolicy,
}

impl Default for PaymentConfig {
    fn default() -> Self {
        Self {
            partial_use: PartialUsePolicy::RetainVoucher,
        }
    }
}

impl Config {
    /// Config rooted at a single directory (ledger + audit log)
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let mut config = Config::default();
        config.data_dir = root.join("ledger");
        config.audit.log_path = root.join("audit").join("audit.log");
        config
    }

    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Config::default();

        if let Ok(data_dir) = std::env::var("VOUCHER_LEDGER_DATA_DIR") {
            config.data_dir = PathBuf::from(data_dir);
        }

        if let Ok(path) = std::env::var("VOUCHER_LEDGER_AUDIT_LOG") {
            config.audit.log_path = PathBuf::from(path);
        }

        if let Ok(seed) = std::env::var("VOUCHER_LEDGER_GENESIS_SEED") {
            config.audit.genesis_seed = seed;
        }

        if let Ok(addr) = std::env::var("VOUCHER_LEDGER_METRICS_ADDR") {
            config.metrics_listen_addr = addr;
        }

        if let Ok(ms) = std::env::var("VOUCHER_LEDGER_LOCK_TIMEOUT_MS") {
            config.concurrency.lock_timeout_ms = ms
                .parse()
                .map_err(|e| crate::Error::Config(format!("Invalid lock timeout: {}", e)))?;
        }

        if let Ok(ms) = std::env::var("VOUCHER_LEDGER_WRITE_TIMEOUT_MS") {
            config.concurrency.write_timeout_ms = ms
                .parse()
                .map_err(|e| crate::Error::Config(format!("Invalid write timeout: {}", e)))?;
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.service_name, "voucher-ledger");
        assert_eq!(config.concurrency.lock_timeout_ms, 300);
        assert_eq!(config.concurrency.write_timeout_ms, 300);
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.payments.partial_use, PartialUsePolicy::RetainVoucher);
        assert!(config.audit.verify_on_open);
    }

    #[test]
    fn test_from_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.toml");

        let mut config = Config::with_root(dir.path());
        config.payments.partial_use = PartialUsePolicy::DeductRemaining;
        config.audit.genesis_seed = "district-7".to_string();
        std::fs::write(&path, toml::to_string(&config).unwrap()).unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.payments.partial_use, PartialUsePolicy::DeductRemaining);
        assert_eq!(loaded.audit.genesis_seed, "district-7");
        assert_eq!(loaded.data_dir, dir.path().join("ledger"));
    }

    #[test]
    fn test_write_timeout_defaults_when_absent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.toml");

        let mut value = toml::Value::try_from(Config::with_root(dir.path())).unwrap();
        value["concurrency"]
            .as_table_mut()
            .unwrap()
            .remove("write_timeout_ms");
        std::fs::write(&path, toml::to_string(&value).unwrap()).unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.concurrency.write_timeout_ms, 300);
    }

    #[test]
    fn test_from_file_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.toml");
        std::fs::write(&path, "data_dir = [").unwrap();

        let err = Config::from_file(&path).unwrap_err();
        assert!(matches!(err, crate::Error::Config(_)));
    }
}
