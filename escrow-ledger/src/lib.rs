//! Escrow ledger for asset sales
//!
//! Holds a registered asset and the buyer's funds until the sale conditions
//! are met, then settles in one step:
//! - Per-asset escrow records with deposits, inspection and party approvals
//! - Role checks against the authenticated caller before any mutation
//! - All-or-nothing settlement across the asset registry and the treasury
//! - Audit events with live subscription

pub mod config;
pub mod error;
pub mod events;
pub mod ledger;
pub mod models;
pub mod registry;
pub mod roles;
pub mod telemetry;
pub mod treasury;

use error::EscrowError;

pub use config::LedgerConfig;
pub use events::{EventKind, LedgerEvent};
pub use ledger::{EscrowLedger, ListingRequest};
pub use models::{Amount, AssetId, Condition, EscrowRecord, Identity, LedgerParties, Settlement};
pub use registry::{AssetRegistry, CustodyReceipt, InMemoryAssetRegistry, RegistryError};
pub use roles::{Caller, FinalizerPolicy, Role};
pub use treasury::{InMemoryTreasury, TransferReceipt, Treasury, TreasuryError};

/// Result type alias for escrow operations
pub type EscrowResult<T> = Result<T, EscrowError>;
