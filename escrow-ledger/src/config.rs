//! Ledger configuration
//!
//! Settings come from an optional file and `ESCROW_`-prefixed environment
//! variables, with `__` separating sections
//! (e.g. `ESCROW_FINALIZATION__POLICY=any_party`). Anything unset falls back
//! to [`LedgerConfig::default`].

use ::config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::{error::EscrowError, roles::FinalizerPolicy, EscrowResult};

/// Environment variable prefix for ledger settings
pub const ENV_PREFIX: &str = "ESCROW";

/// Top-level ledger configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub finalization: FinalizationConfig,
    pub deposits: DepositConfig,
    pub events: EventConfig,
    pub logging: LoggingConfig,
}

/// Who may trigger settlement
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FinalizationConfig {
    pub policy: FinalizerPolicy,
}

/// Deposit rules
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DepositConfig {
    /// Reject earnest deposits smaller than the listing's earnest amount
    pub enforce_earnest_minimum: bool,
    /// Upper bound for a single deposit call
    pub max_deposit: Option<u64>,
}

/// Audit event fan-out; events themselves are kept for the life of the ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventConfig {
    /// Broadcast buffer per subscriber; slow subscribers lag past this
    pub capacity: usize,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self { capacity: 256 }
    }
}

/// Logging settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
        }
    }
}

impl LedgerConfig {
    /// Load from an optional file plus the process environment.
    ///
    /// A missing file is not an error.
    pub fn load(path: Option<&Path>) -> EscrowResult<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(false));
        }

        let settings = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let cfg: LedgerConfig = settings.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject settings the ledger cannot run with
    pub fn validate(&self) -> EscrowResult<()> {
        if self.events.capacity == 0 {
            return Err(EscrowError::config("events.capacity must be greater than 0"));
        }
        if self.deposits.max_deposit == Some(0) {
            return Err(EscrowError::config(
                "deposits.max_deposit must be greater than 0 when set",
            ));
        }
        if self.logging.filter.trim().is_empty() {
            return Err(EscrowError::config("logging.filter cannot be empty"));
        }
        Ok(())
    }
}
