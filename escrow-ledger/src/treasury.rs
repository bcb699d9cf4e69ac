//! Treasury - moves value into and out of ledger custody
//!
//! Deposits pull value from the paying party into custody as part of the
//! deposit call; finalization pays the custodial balance out to the seller in
//! a single transfer. The currency rail behind it is opaque to the ledger.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, sync::Arc};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use crate::models::{Amount, Identity};

/// Errors reported by a treasury
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TreasuryError {
    #[error("{account} holds {available}, cannot move {requested}")]
    InsufficientFunds {
        account: Identity,
        available: Amount,
        requested: Amount,
    },

    #[error("custody holds {available}, cannot pay out {requested}")]
    CustodyShortfall { available: Amount, requested: Amount },

    #[error("balance overflow for {0}")]
    Overflow(Identity),

    #[error("payment rail rejected transfer: {0}")]
    Rejected(String),
}

/// Direction of a treasury movement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferDirection {
    /// Party -> custody
    Inbound,
    /// Custody -> party
    Outbound,
}

/// Record of a completed value movement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferReceipt {
    pub id: Uuid,
    pub direction: TransferDirection,
    pub counterparty: Identity,
    pub amount: Amount,
    pub memo: String,
    pub completed_at: DateTime<Utc>,
}

/// Value-transfer interface consumed by the ledger
#[async_trait]
pub trait Treasury: Send + Sync {
    /// Pull `amount` from `from` into custody; all-or-nothing
    async fn collect(
        &self,
        from: &Identity,
        amount: Amount,
        memo: &str,
    ) -> Result<TransferReceipt, TreasuryError>;

    /// Pay `amount` out of custody to `to`; all-or-nothing
    async fn pay(
        &self,
        to: &Identity,
        amount: Amount,
        memo: &str,
    ) -> Result<TransferReceipt, TreasuryError>;
}

#[derive(Debug, Default)]
struct Books {
    accounts: HashMap<Identity, Amount>,
    custody: Amount,
    receipts: Vec<TransferReceipt>,
}

/// In-memory treasury with per-party accounts and a single custody pool
#[derive(Default)]
pub struct InMemoryTreasury {
    books: Arc<RwLock<Books>>,
}

impl InMemoryTreasury {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add spendable funds to an account
    pub async fn credit(&self, account: &Identity, amount: Amount) -> Result<Amount, TreasuryError> {
        let mut books = self.books.write().await;
        let balance = books.accounts.entry(account.clone()).or_insert(0);
        *balance = balance
            .checked_add(amount)
            .ok_or_else(|| TreasuryError::Overflow(account.clone()))?;
        Ok(*balance)
    }

    /// Spendable balance of an account
    pub async fn balance_of(&self, account: &Identity) -> Amount {
        self.books
            .read()
            .await
            .accounts
            .get(account)
            .copied()
            .unwrap_or(0)
    }

    /// Total value currently held in custody
    pub async fn custody_balance(&self) -> Amount {
        self.books.read().await.custody
    }

    /// Every completed movement, oldest first
    pub async fn receipts(&self) -> Vec<TransferReceipt> {
        self.books.read().await.receipts.clone()
    }
}

#[async_trait]
impl Treasury for InMemoryTreasury {
    async fn collect(
        &self,
        from: &Identity,
        amount: Amount,
        memo: &str,
    ) -> Result<TransferReceipt, TreasuryError> {
        let mut books = self.books.write().await;

        let available = books.accounts.get(from).copied().unwrap_or(0);
        if available < amount {
            return Err(TreasuryError::InsufficientFunds {
                account: from.clone(),
                available,
                requested: amount,
            });
        }
        let custody = books
            .custody
            .checked_add(amount)
            .ok_or_else(|| TreasuryError::Overflow(from.clone()))?;

        books.accounts.insert(from.clone(), available - amount);
        books.custody = custody;

        let receipt = TransferReceipt {
            id: Uuid::new_v4(),
            direction: TransferDirection::Inbound,
            counterparty: from.clone(),
            amount,
            memo: memo.to_string(),
            completed_at: Utc::now(),
        };
        books.receipts.push(receipt.clone());

        info!("Collected {} from {} ({})", amount, from, memo);
        Ok(receipt)
    }

    async fn pay(
        &self,
        to: &Identity,
        amount: Amount,
        memo: &str,
    ) -> Result<TransferReceipt, TreasuryError> {
        let mut books = self.books.write().await;

        if books.custody < amount {
            return Err(TreasuryError::CustodyShortfall {
                available: books.custody,
                requested: amount,
            });
        }
        let current = books.accounts.get(to).copied().unwrap_or(0);
        let credited = current
            .checked_add(amount)
            .ok_or_else(|| TreasuryError::Overflow(to.clone()))?;

        books.custody -= amount;
        books.accounts.insert(to.clone(), credited);

        let receipt = TransferReceipt {
            id: Uuid::new_v4(),
            direction: TransferDirection::Outbound,
            counterparty: to.clone(),
            amount,
            memo: memo.to_string(),
            completed_at: Utc::now(),
        };
        books.receipts.push(receipt.clone());

        info!("Paid {} to {} ({})", amount, to, memo);
        Ok(receipt)
    }
}
