//! Escrow events - audit trail of every successful mutation
//!
//! Events are appended to an in-memory log that can be read per asset, and
//! broadcast to live subscribers (monitoring, UI). Failed operations never
//! produce an event.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::{broadcast, RwLock};
use tracing::debug;
use uuid::Uuid;

use crate::{
    models::{Amount, AssetId, Identity},
    EscrowResult,
};

/// Kind of ledger event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Listed,
    EarnestDeposited,
    FundsDeposited,
    InspectionUpdated,
    SaleApproved,
    SaleFinalized,
}

impl EventKind {
    /// Dotted name used in logs and exports
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Listed => "escrow.listed",
            Self::EarnestDeposited => "deposit.earnest",
            Self::FundsDeposited => "deposit.funds",
            Self::InspectionUpdated => "inspection.updated",
            Self::SaleApproved => "sale.approved",
            Self::SaleFinalized => "sale.finalized",
        }
    }
}

/// Ledger event for the audit trail
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEvent {
    pub id: Uuid,
    pub kind: EventKind,
    pub asset_id: AssetId,
    pub actor: Identity,
    pub amount: Option<Amount>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl LedgerEvent {
    pub fn new(
        kind: EventKind,
        asset_id: AssetId,
        actor: &Identity,
        amount: Option<Amount>,
        metadata: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            asset_id,
            actor: actor.clone(),
            amount,
            metadata,
            created_at: Utc::now(),
        }
    }

    /// Serialize for export
    pub fn to_json(&self) -> EscrowResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Append-only event log with live fan-out.
///
/// Events are retained for the life of the log, bucketed per asset.
pub struct EventLog {
    events: Arc<RwLock<HashMap<AssetId, Vec<LedgerEvent>>>>,
    sender: broadcast::Sender<LedgerEvent>,
}

impl EventLog {
    /// Create a log whose subscribers buffer up to `capacity` events.
    ///
    /// `capacity` bounds the broadcast buffer only, not retention.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            events: Arc::new(RwLock::new(HashMap::new())),
            sender,
        }
    }

    /// Append an event and notify subscribers
    pub async fn record(&self, event: LedgerEvent) {
        debug!(
            "Recording {} for asset {} by {}",
            event.kind.as_str(),
            event.asset_id,
            event.actor
        );

        self.events
            .write()
            .await
            .entry(event.asset_id)
            .or_default()
            .push(event.clone());

        // No subscribers is fine
        let _ = self.sender.send(event);
    }

    /// Subscribe to events recorded from now on
    pub fn subscribe(&self) -> broadcast::Receiver<LedgerEvent> {
        self.sender.subscribe()
    }

    /// Events for one asset, oldest first
    pub async fn for_asset(&self, asset_id: AssetId) -> Vec<LedgerEvent> {
        self.events
            .read()
            .await
            .get(&asset_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn len(&self) -> usize {
        self.events.read().await.values().map(Vec::len).sum()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
