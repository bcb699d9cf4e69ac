//! Error types for the escrow ledger
//!
//! Every ledger operation surfaces its failure synchronously to the caller.
//! Nothing is retried or swallowed here; a failed call leaves the record it
//! touched exactly as it was.

use crate::models::{AssetId, Condition, Identity};
use thiserror::Error;

/// Main error type for escrow operations
#[derive(Error, Debug)]
pub enum EscrowError {
    /// Caller is not the registry custodian of the asset at listing time
    #[error("Not owner: {caller} is not the custodian of asset {asset}")]
    NotOwner { asset: AssetId, caller: Identity },

    /// An active (non-finalized) record already exists for the asset
    #[error("Asset {0} is already listed")]
    AlreadyListed(AssetId),

    /// No record exists for the asset
    #[error("Asset {0} is not listed")]
    NotListed(AssetId),

    /// The record is sealed; no further mutation is allowed
    #[error("Escrow for asset {0} is already finalized")]
    AlreadyFinalized(AssetId),

    /// Caller lacks the role required by the operation
    #[error("Unauthorized: {caller} may not {action} on asset {asset}")]
    Unauthorized {
        asset: AssetId,
        caller: Identity,
        action: String,
    },

    /// Finalization attempted while a precondition is false
    #[error("Conditions not met for asset {asset}: {}", format_conditions(.unmet))]
    ConditionsNotMet {
        asset: AssetId,
        unmet: Vec<Condition>,
    },

    /// A deposit conveyed no value, or less than a required minimum
    #[error("Insufficient value: {0}")]
    InsufficientValue(String),

    /// A deposit was rejected before any value moved
    #[error("Invalid deposit: {0}")]
    InvalidDeposit(String),

    /// An identity could not be parsed
    #[error("Invalid identity: {0}")]
    InvalidIdentity(String),

    /// Listing parameters are inconsistent
    #[error("Invalid listing: {0}")]
    InvalidListing(String),

    /// The asset registry or the treasury rejected a transfer
    #[error("Transfer failed: {0}")]
    TransferFailed(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// General internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl EscrowError {
    /// Create an authorization error
    pub fn unauthorized<S: Into<String>>(asset: AssetId, caller: &Identity, action: S) -> Self {
        Self::Unauthorized {
            asset,
            caller: caller.clone(),
            action: action.into(),
        }
    }

    /// Create an insufficient value error
    pub fn insufficient_value<S: Into<String>>(msg: S) -> Self {
        Self::InsufficientValue(msg.into())
    }

    /// Create an invalid deposit error
    pub fn invalid_deposit<S: Into<String>>(msg: S) -> Self {
        Self::InvalidDeposit(msg.into())
    }

    /// Create an invalid listing error
    pub fn invalid_listing<S: Into<String>>(msg: S) -> Self {
        Self::InvalidListing(msg.into())
    }

    /// Create a transfer error
    pub fn transfer_failed<S: Into<String>>(msg: S) -> Self {
        Self::TransferFailed(msg.into())
    }

    /// Create a configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }
}

fn format_conditions(unmet: &[Condition]) -> String {
    unmet
        .iter()
        .map(|c| c.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

impl From<::config::ConfigError> for EscrowError {
    fn from(err: ::config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}
