//! Caller identity and role checks
//!
//! Every mutating ledger operation names the role it requires and runs
//! [`Role::authorize`] before touching the record. Authorization is derived
//! from the authenticated [`Caller`] only.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{
    error::EscrowError,
    models::{EscrowRecord, Identity},
    EscrowResult,
};

/// Authenticated identity of whoever invoked an operation.
///
/// Built by the authentication layer in front of the ledger; request payloads
/// never carry a "who am I" field.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Caller(Identity);

impl Caller {
    /// Wrap an identity that the authentication layer has already verified
    pub fn authenticated(identity: Identity) -> Self {
        Self(identity)
    }

    pub fn identity(&self) -> &Identity {
        &self.0
    }
}

impl fmt::Display for Caller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Who may finalize a sale once the unlock predicate holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalizerPolicy {
    /// Only the seller of the record
    #[default]
    SellerOnly,
    /// Buyer, seller or lender
    AnyParty,
}

/// Role required by a record-level operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Seller,
    Buyer,
    Inspector,
    Lender,
    /// Buyer, seller or lender
    Party,
    /// Resolved through the configured [`FinalizerPolicy`]
    Finalizer(FinalizerPolicy),
}

impl Role {
    /// Whether `identity` holds this role on `record`
    pub fn admits(&self, record: &EscrowRecord, identity: &Identity) -> bool {
        match self {
            Self::Seller => *identity == record.seller,
            Self::Buyer => *identity == record.buyer,
            Self::Inspector => *identity == record.inspector,
            Self::Lender => *identity == record.lender,
            Self::Party => {
                Self::Buyer.admits(record, identity)
                    || Self::Seller.admits(record, identity)
                    || Self::Lender.admits(record, identity)
            }
            Self::Finalizer(FinalizerPolicy::SellerOnly) => Self::Seller.admits(record, identity),
            Self::Finalizer(FinalizerPolicy::AnyParty) => Self::Party.admits(record, identity),
        }
    }

    /// Check the caller against this role, failing with `Unauthorized`
    pub fn authorize(
        &self,
        record: &EscrowRecord,
        caller: &Caller,
        action: &str,
    ) -> EscrowResult<()> {
        if self.admits(record, caller.identity()) {
            Ok(())
        } else {
            Err(EscrowError::unauthorized(
                record.asset_id,
                caller.identity(),
                action,
            ))
        }
    }
}
