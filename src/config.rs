use crate::error::{LedgerError, Result};
use clap::Args;
use serde::Deserialize;
use std::time::Duration;

/// Runtime settings for the ledger binary.
///
/// Flattened into the CLI; every field can also come from a `TXLEDGER_*`
/// environment variable, or be deserialized when embedded in a larger
/// service configuration.
#[derive(Debug, Clone, Args, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LedgerConfig {
    /// How long a transaction waits for an account row lock before failing.
    #[arg(long, env = "TXLEDGER_LOCK_WAIT_TIMEOUT_MS", default_value_t = 5000)]
    pub lock_wait_timeout_ms: u64,

    /// Deadline applied to every transfer transaction.
    #[arg(long, env = "TXLEDGER_TX_TIMEOUT_MS")]
    pub tx_timeout_ms: Option<u64>,

    /// Number of transfers in flight at once.
    #[arg(long, env = "TXLEDGER_WORKERS", default_value_t = 4)]
    pub workers: usize,

    /// Default log filter, overridden by `RUST_LOG`.
    #[arg(long, env = "TXLEDGER_LOG_LEVEL", default_value = "warn")]
    pub log_level: String,

    /// Emit logs as JSON lines.
    #[arg(long, env = "TXLEDGER_LOG_JSON")]
    pub log_json: bool,

    /// PostgreSQL connection string. Needs the `storage-postgres` feature.
    #[arg(long, env = "TXLEDGER_DATABASE_URL")]
    pub database_url: Option<String>,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            lock_wait_timeout_ms: 5000,
            tx_timeout_ms: None,
            workers: 4,
            log_level: "warn".to_string(),
            log_json: false,
            database_url: None,
        }
    }
}

impl LedgerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(LedgerError::Validation(
                "workers must be at least 1".to_string(),
            ));
        }
        if self.lock_wait_timeout_ms == 0 {
            return Err(LedgerError::Validation(
                "lock wait timeout must be positive".to_string(),
            ));
        }
        if self.tx_timeout_ms == Some(0) {
            return Err(LedgerError::Validation(
                "transaction timeout must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn lock_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_wait_timeout_ms)
    }

    pub fn tx_timeout(&self) -> Option<Duration> {
        self.tx_timeout_ms.map(Duration::from_millis)
    }
}
