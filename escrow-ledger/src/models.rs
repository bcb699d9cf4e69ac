//! Core data models for the escrow ledger
//!
//! This module contains the escrow record, the identities and amounts it is
//! built from, and the unlock predicate that gates finalization.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::EscrowError;
use crate::EscrowResult;

/// Smallest indivisible unit of the settlement currency
pub type Amount = u128;

/// Unique identifier of an asset tracked by the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AssetId(pub u64);

impl fmt::Display for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for AssetId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Address or principal of a party
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Identity(String);

impl Identity {
    /// Create an identity, rejecting blank principals
    pub fn new<S: Into<String>>(principal: S) -> EscrowResult<Self> {
        let principal = principal.into();
        let trimmed = principal.trim();
        if trimmed.is_empty() {
            return Err(EscrowError::InvalidIdentity(
                "identity cannot be empty".to_string(),
            ));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Identity {
    type Error = EscrowError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Identity> for String {
    fn from(identity: Identity) -> Self {
        identity.0
    }
}

/// One conjunct of the unlock predicate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    /// Record is listed and not yet finalized
    Open,
    /// Inspector reported a pass
    InspectionPassed,
    /// Buyer signed off
    BuyerApproval,
    /// Seller signed off
    SellerApproval,
    /// Lender signed off
    LenderApproval,
    /// Custodial balance covers the purchase price
    FullyFunded,
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Open => "record open",
            Self::InspectionPassed => "inspection passed",
            Self::BuyerApproval => "buyer approval",
            Self::SellerApproval => "seller approval",
            Self::LenderApproval => "lender approval",
            Self::FullyFunded => "fully funded",
        };
        f.write_str(s)
    }
}

/// Deployment-level parties shared by every listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerParties {
    pub inspector: Identity,
    pub lender: Identity,
}

/// Escrow record, one per listed asset
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscrowRecord {
    pub asset_id: AssetId,

    // Parties
    pub seller: Identity,
    pub buyer: Identity,
    pub inspector: Identity,
    pub lender: Identity,

    // Terms
    pub purchase_price: Amount,
    pub earnest_amount: Amount,

    // Conditions
    pub custodial_balance: Amount,
    pub inspection_passed: bool,
    pub approvals: BTreeMap<Identity, bool>,

    // Lifecycle
    pub listed: bool,
    pub finalized: bool,

    // Timestamps
    pub listed_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finalized_at: Option<DateTime<Utc>>,
}

impl EscrowRecord {
    /// Create a freshly listed record with every condition unset
    pub fn new(
        asset_id: AssetId,
        seller: Identity,
        buyer: Identity,
        parties: &LedgerParties,
        purchase_price: Amount,
        earnest_amount: Amount,
    ) -> Self {
        let now = Utc::now();
        Self {
            asset_id,
            seller,
            buyer,
            inspector: parties.inspector.clone(),
            lender: parties.lender.clone(),
            purchase_price,
            earnest_amount,
            custodial_balance: 0,
            inspection_passed: false,
            approvals: BTreeMap::new(),
            listed: true,
            finalized: false,
            listed_at: now,
            updated_at: now,
            finalized_at: None,
        }
    }

    /// Whether the record still accepts mutations
    pub fn is_open(&self) -> bool {
        self.listed && !self.finalized
    }

    /// Approval flag for an identity; absent means not approved
    pub fn approval(&self, identity: &Identity) -> bool {
        self.approvals.get(identity).copied().unwrap_or(false)
    }

    /// Every conjunct of the unlock predicate that is currently false.
    ///
    /// Computed from the underlying flags on each call.
    pub fn unmet_conditions(&self) -> Vec<Condition> {
        let checks = [
            (Condition::Open, self.is_open()),
            (Condition::InspectionPassed, self.inspection_passed),
            (Condition::BuyerApproval, self.approval(&self.buyer)),
            (Condition::SellerApproval, self.approval(&self.seller)),
            (Condition::LenderApproval, self.approval(&self.lender)),
            (
                Condition::FullyFunded,
                self.custodial_balance >= self.purchase_price,
            ),
        ];

        checks
            .into_iter()
            .filter(|(_, met)| !met)
            .map(|(condition, _)| condition)
            .collect()
    }

    /// The unlock predicate
    pub fn can_finalize(&self) -> bool {
        self.unmet_conditions().is_empty()
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Outcome of a successful finalization
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settlement {
    pub asset_id: AssetId,
    pub seller: Identity,
    pub buyer: Identity,
    pub amount_paid: Amount,
    pub payout_reference: String,
    pub settled_at: DateTime<Utc>,
}
