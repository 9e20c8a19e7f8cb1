//! Configuration for vendor settlement

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Settlement configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Service name
    pub service_name: String,

    /// Service version
    pub service_version: String,

    /// Directory for open windows and payout history
    pub data_dir: PathBuf,

    /// Sync every window write to disk before acknowledging delivery
    pub sync_writes: bool,

    /// Settlement window configuration
    pub window: WindowConfig,

    /// Realtime push configuration
    pub push: PushConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service_name: "voucher-settlement".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            data_dir: PathBuf::from("./data/settlement"),
            sync_writes: true,
            window: WindowConfig::default(),
            push: PushConfig::default(),
        }
    }
}

/// Settlement window configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowConfig {
    /// Window duration in seconds (default: 24 hours)
    pub duration_seconds: u64,

    /// Minimum transactions before an expired window is paid out;
    /// smaller windows are carried into the next period
    pub min_transactions: usize,

    /// A window holding this many transactions is due immediately
    pub max_transactions: usize,

    /// Scheduler check interval in seconds
    pub check_interval_seconds: u64,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            duration_seconds: 86_400,
            min_transactions: 1,
            max_transactions: 10_000,
            check_interval_seconds: 60,
        }
    }
}

/// Realtime push configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushConfig {
    /// Broadcast buffer per subscriber; slower subscribers skip ahead
    pub capacity: usize,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self { capacity: 1_024 }
    }
}

impl Config {
    /// Default configuration with data under `root`
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        let mut config = Self::default();
        config.data_dir = root.into().join("settlement");
        config
    }

    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Config::default();

        if let Ok(data_dir) = std::env::var("VOUCHER_SETTLEMENT_DATA_DIR") {
            config.data_dir = PathBuf::from(data_dir);
        }

        if let Ok(secs) = std::env::var("VOUCHER_SETTLEMENT_WINDOW_SECS") {
            config.window.duration_seconds = secs
                .parse()
                .map_err(|e| crate::Error::Config(format!("Invalid window duration: {}", e)))?;
        }

        if let Ok(min) = std::env::var("VOUCHER_SETTLEMENT_MIN_TRANSACTIONS") {
            config.window.min_transactions = min
                .parse()
                .map_err(|e| crate::Error::Config(format!("Invalid min transactions: {}", e)))?;
        }

        if let Ok(capacity) = std::env::var("VOUCHER_SETTLEMENT_PUSH_CAPACITY") {
            config.push.capacity = capacity
                .parse()
                .map_err(|e| crate::Error::Config(format!("Invalid push capacity: {}", e)))?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the window manager cannot run with
    pub fn validate(&self) -> crate::Result<()> {
        if self.window.duration_seconds == 0 {
            return Err(crate::Error::Config("Window duration must be positive".to_string()));
        }
        if self.window.max_transactions == 0 {
            return Err(crate::Error::Config("max_transactions must be positive".to_string()));
        }
        if self.window.min_transactions > self.window.max_transactions {
            return Err(crate::Error::Config(format!(
                "min_transactions {} exceeds max_transactions {}",
                self.window.min_transactions, self.window.max_transactions
            )));
        }
        if self.push.capacity == 0 {
            return Err(crate::Error::Config("Push capacity must be positive".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.window.duration_seconds, 86_400);
    }

    #[test]
    fn test_validate_rejects_inverted_bounds() {
        let mut config = Config::default();
        config.window.min_transactions = 20;
        config.window.max_transactions = 10;
        assert!(matches!(config.validate(), Err(crate::Error::Config(_))));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settlement.toml");
        let mut config = Config::with_root(dir.path());
        config.window.duration_seconds = 3_600;
        std::fs::write(&path, toml::to_string(&config).unwrap()).unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.window.duration_seconds, 3_600);
        assert_eq!(loaded.push.capacity, 1_024);
        assert_eq!(loaded.data_dir, dir.path().join("settlement"));
    }
}
