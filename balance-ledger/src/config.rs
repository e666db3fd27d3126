//! Configuration for the ledger

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Ledger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// SQLite database URL
    pub database_url: String,

    /// Service name
    pub service_name: String,

    /// Service version
    pub service_version: String,

    /// Storage configuration
    pub storage: StorageConfig,

    /// Per-subject locking
    pub locking: LockingConfig,

    /// Balance read cache
    pub cache: CacheConfig,

    /// Reconciliation configuration
    pub reconciliation: ReconciliationConfig,

    /// Reservation sweeping
    pub reservations: ReservationConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: "sqlite://./data/ledger.db".to_string(),
            service_name: "balance-ledger".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            storage: StorageConfig::default(),
            locking: LockingConfig::default(),
            cache: CacheConfig::default(),
            reconciliation: ReconciliationConfig::default(),
            reservations: ReservationConfig::default(),
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Connection pool size
    pub max_connections: u32,

    /// How long a connection waits on SQLite's write lock (milliseconds)
    pub busy_timeout_ms: u64,

    /// Pool acquire timeout (milliseconds)
    pub acquire_timeout_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            max_connections: 8,
            busy_timeout_ms: 5_000,
            acquire_timeout_ms: 5_000,
        }
    }
}

/// Per-subject locking
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockingConfig {
    /// Bounded wait for a subject lock before failing with a retryable error (milliseconds)
    pub lock_timeout_ms: u64,
}

impl Default for LockingConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: 2_000,
        }
    }
}

/// Balance read cache
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// How long a cached balance is served before it is read again (seconds)
    pub ttl_secs: u64,

    /// Upper bound on cached subjects
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 30,
            max_entries: 100_000,
        }
    }
}

/// Reconciliation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconciliationConfig {
    /// Absolute drift at or below which a subject is considered clean
    pub tolerance: Decimal,

    /// Rewrite drifted caches during scheduled runs
    pub auto_fix: bool,

    /// Percentage deviation above which drift is Significant
    pub significant_pct: Decimal,

    /// Percentage deviation above which drift is Critical
    pub critical_pct: Decimal,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            tolerance: Decimal::ZERO,
            auto_fix: false,
            significant_pct: Decimal::ONE,      // 1%
            critical_pct: Decimal::from(10),    // 10%
        }
    }
}

/// Reservation sweeping
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReservationConfig {
    /// ACTIVE reservations older than this are considered stale (seconds)
    pub stale_after_secs: u64,
}

impl Default for ReservationConfig {
    fn default() -> Self {
        Self {
            stale_after_secs: 86_400, // 24h
        }
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        Config::default().with_env_overrides()
    }

    /// Apply `LEDGER_*` environment overrides
    pub fn with_env_overrides(mut self) -> crate::Result<Self> {
        if let Ok(url) = std::env::var("LEDGER_DATABASE_URL") {
            self.database_url = url;
        }

        if let Ok(ms) = std::env::var("LEDGER_LOCK_TIMEOUT_MS") {
            self.locking.lock_timeout_ms = ms
                .parse()
                .map_err(|e| crate::Error::Config(format!("LEDGER_LOCK_TIMEOUT_MS: {}", e)))?;
        }

        if let Ok(n) = std::env::var("LEDGER_MAX_CONNECTIONS") {
            self.storage.max_connections = n
                .parse()
                .map_err(|e| crate::Error::Config(format!("LEDGER_MAX_CONNECTIONS: {}", e)))?;
        }

        Ok(self)
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> crate::Result<()> {
        if self.database_url.trim().is_empty() {
            return Err(crate::Error::Config("database_url must be set".to_string()));
        }
        if self.locking.lock_timeout_ms == 0 {
            return Err(crate::Error::Config(
                "locking.lock_timeout_ms must be > 0".to_string(),
            ));
        }
        if self.storage.max_connections == 0 {
            return Err(crate::Error::Config(
                "storage.max_connections must be > 0".to_string(),
            ));
        }
        if self.reconciliation.tolerance < Decimal::ZERO {
            return Err(crate::Error::Config(
                "reconciliation.tolerance must be >= 0".to_string(),
            ));
        }
        if self.reconciliation.significant_pct > self.reconciliation.critical_pct {
            return Err(crate::Error::Config(
                "reconciliation.significant_pct must not exceed critical_pct".to_string(),
            ));
        }
        Ok(())
    }
}
