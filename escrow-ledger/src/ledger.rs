//! Escrow Ledger - owns escrow records and enforces the unlock predicate
//!
//! The ledger holds one record per listed asset, tracks deposits, the
//! inspection result and party approvals, and settles a sale by moving custody
//! of the asset to the buyer and paying the full custodial balance to the
//! seller. It is the only transfer agent it ever presents to the registry.
//!
//! Records live in an arena keyed by asset id. Each record sits behind its own
//! mutex, so calls on one asset are serialized while calls on different assets
//! run concurrently. The arena lock is held only to look up or insert a record.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{error, info, warn};

use crate::{
    config::LedgerConfig,
    error::EscrowError,
    events::{EventKind, EventLog, LedgerEvent},
    models::{Amount, AssetId, Condition, EscrowRecord, Identity, LedgerParties, Settlement},
    registry::{AssetRegistry, RegistryError},
    roles::{Caller, Role},
    treasury::Treasury,
    EscrowResult,
};

type RecordHandle = Arc<Mutex<EscrowRecord>>;

/// Listing request, submitted by the asset's current custodian
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingRequest {
    pub asset_id: AssetId,
    pub buyer: Identity,
    pub purchase_price: Amount,
    pub earnest_amount: Amount,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DepositKind {
    Earnest,
    Funds,
}

impl DepositKind {
    fn event_kind(self) -> EventKind {
        match self {
            Self::Earnest => EventKind::EarnestDeposited,
            Self::Funds => EventKind::FundsDeposited,
        }
    }
}

/// Main escrow ledger
pub struct EscrowLedger {
    /// Configuration
    config: LedgerConfig,
    /// Identity the ledger acts under when commanding the registry
    agent: Identity,
    /// Inspector and lender snapshotted into every new listing
    parties: LedgerParties,
    /// Active or most recent record per asset
    records: Arc<RwLock<HashMap<AssetId, RecordHandle>>>,
    /// Finalized records replaced by a relisting, oldest first
    history: Arc<RwLock<HashMap<AssetId, Vec<EscrowRecord>>>>,
    /// Custody registry for the listed assets
    registry: Arc<dyn AssetRegistry>,
    /// Value rail for deposits and payouts
    treasury: Arc<dyn Treasury>,
    /// Audit trail
    events: EventLog,
}

impl EscrowLedger {
    /// Create a new escrow ledger
    pub fn new(
        config: LedgerConfig,
        agent: Identity,
        parties: LedgerParties,
        registry: Arc<dyn AssetRegistry>,
        treasury: Arc<dyn Treasury>,
    ) -> EscrowResult<Self> {
        config.validate()?;

        info!(
            "Initializing escrow ledger as agent {} on registry {}",
            agent,
            registry.registry_id()
        );

        Ok(Self {
            events: EventLog::new(config.events.capacity),
            config,
            agent,
            parties,
            records: Arc::new(RwLock::new(HashMap::new())),
            history: Arc::new(RwLock::new(HashMap::new())),
            registry,
            treasury,
        })
    }

    /// List an asset for sale to `request.buyer`
    pub async fn list(&self, caller: &Caller, request: ListingRequest) -> EscrowResult<EscrowRecord> {
        let asset = request.asset_id;
        info!("Listing asset {} by {}", asset, caller);

        self.validate_listing(caller, &request)?;

        let record = EscrowRecord::new(
            asset,
            caller.identity().clone(),
            request.buyer,
            &self.parties,
            request.purchase_price,
            request.earnest_amount,
        );

        // The arena lock is never held while waiting on a record mutex
        loop {
            let seen = self.records.read().await.get(&asset).cloned();

            let archived = match &seen {
                Some(handle) => {
                    let existing = handle.lock().await;
                    if !existing.finalized {
                        warn!("Rejected listing of asset {}: already listed", asset);
                        return Err(EscrowError::AlreadyListed(asset));
                    }
                    Some(existing.clone())
                }
                None => None,
            };

            // Settlement moves custody before sealing the record
            self.ensure_custodian(caller, asset).await?;

            let mut records = self.records.write().await;
            let unchanged = match (&seen, records.get(&asset)) {
                (Some(seen), Some(current)) => Arc::ptr_eq(seen, current),
                (None, None) => true,
                _ => false,
            };
            if !unchanged {
                continue;
            }

            if let Some(previous) = archived {
                self.history
                    .write()
                    .await
                    .entry(asset)
                    .or_default()
                    .push(previous);
            }
            records.insert(asset, Arc::new(Mutex::new(record.clone())));
            break;
        }

        self.events
            .record(LedgerEvent::new(
                EventKind::Listed,
                asset,
                caller.identity(),
                None,
                serde_json::json!({
                    "buyer": record.buyer,
                    "purchase_price": record.purchase_price.to_string(),
                    "earnest_amount": record.earnest_amount.to_string(),
                }),
            ))
            .await;

        info!("Listed asset {} for {}", asset, record.purchase_price);

        Ok(record)
    }

    /// Deposit earnest money for an asset
    pub async fn deposit_earnest(
        &self,
        caller: &Caller,
        asset: AssetId,
        amount: Amount,
    ) -> EscrowResult<Amount> {
        self.deposit_into(caller, asset, amount, DepositKind::Earnest)
            .await
    }

    /// Send funds directly into custody for an asset (e.g. the loan amount)
    pub async fn deposit(&self, caller: &Caller, asset: AssetId, amount: Amount) -> EscrowResult<Amount> {
        self.deposit_into(caller, asset, amount, DepositKind::Funds)
            .await
    }

    /// Record the inspector's pass/fail result; last write wins
    pub async fn update_inspection_status(
        &self,
        caller: &Caller,
        asset: AssetId,
        passed: bool,
    ) -> EscrowResult<()> {
        info!("Updating inspection for asset {} to {}", asset, passed);

        let handle = self.handle(asset).await?;
        let mut record = handle.lock().await;

        Role::Inspector.authorize(&record, caller, "update inspection status")?;
        Self::ensure_open(&record)?;

        let previous = record.inspection_passed;
        record.inspection_passed = passed;
        record.touch();

        self.events
            .record(LedgerEvent::new(
                EventKind::InspectionUpdated,
                asset,
                caller.identity(),
                None,
                serde_json::json!({ "passed": passed, "previous": previous }),
            ))
            .await;

        Ok(())
    }

    /// Approve the sale as the calling party
    pub async fn approve_sale(&self, caller: &Caller, asset: AssetId) -> EscrowResult<()> {
        info!("Approval for asset {} from {}", asset, caller);

        let handle = self.handle(asset).await?;
        let mut record = handle.lock().await;

        Role::Party.authorize(&record, caller, "approve sale")?;
        Self::ensure_open(&record)?;

        // Keyed by the authenticated caller only
        let first = record
            .approvals
            .insert(caller.identity().clone(), true)
            .is_none();
        record.touch();

        self.events
            .record(LedgerEvent::new(
                EventKind::SaleApproved,
                asset,
                caller.identity(),
                None,
                serde_json::json!({ "first_approval": first }),
            ))
            .await;

        Ok(())
    }

    /// Settle the sale: custody to the buyer, full balance to the seller.
    ///
    /// Either both transfers happen and the record is sealed, or the call
    /// fails and the record, custody and balances are left as they were.
    pub async fn finalize_sale(&self, caller: &Caller, asset: AssetId) -> EscrowResult<Settlement> {
        info!("Finalizing sale of asset {} by {}", asset, caller);

        let handle = self
            .handle(asset)
            .await
            .map_err(|_| EscrowError::ConditionsNotMet {
                asset,
                unmet: vec![Condition::Open],
            })?;
        let mut record = handle.lock().await;

        Role::Finalizer(self.config.finalization.policy).authorize(
            &record,
            caller,
            "finalize sale",
        )?;

        let unmet = record.unmet_conditions();
        if !unmet.is_empty() {
            warn!("Finalization of asset {} blocked: {:?}", asset, unmet);
            return Err(EscrowError::ConditionsNotMet { asset, unmet });
        }

        let amount = record.custodial_balance;
        let memo = format!("settlement of asset {}", asset);

        let custody = self
            .registry
            .transfer_custody(&self.agent, asset, &record.seller, &record.buyer)
            .await
            .map_err(|e| {
                warn!("Custody transfer for asset {} failed: {}", asset, e);
                EscrowError::transfer_failed(format!("custody transfer: {}", e))
            })?;

        let payout = match self.treasury.pay(&record.seller, amount, &memo).await {
            Ok(receipt) => receipt,
            Err(pay_err) => {
                warn!("Payout for asset {} failed: {}", asset, pay_err);
                if let Err(revert_err) = self.registry.revert_transfer(&custody).await {
                    error!(
                        "Could not restore custody of asset {} to {}: {}",
                        asset, record.seller, revert_err
                    );
                    return Err(EscrowError::transfer_failed(format!(
                        "payout: {}; custody restore: {}",
                        pay_err, revert_err
                    )));
                }
                return Err(EscrowError::transfer_failed(format!("payout: {}", pay_err)));
            }
        };

        let now = Utc::now();
        record.finalized = true;
        record.listed = false;
        record.custodial_balance = 0;
        record.finalized_at = Some(now);
        record.updated_at = now;

        let settlement = Settlement {
            asset_id: asset,
            seller: record.seller.clone(),
            buyer: record.buyer.clone(),
            amount_paid: amount,
            payout_reference: payout.id.to_string(),
            settled_at: now,
        };

        self.events
            .record(LedgerEvent::new(
                EventKind::SaleFinalized,
                asset,
                caller.identity(),
                Some(amount),
                serde_json::json!({
                    "buyer": settlement.buyer,
                    "seller": settlement.seller,
                    "custody_receipt": custody.id,
                    "payout_receipt": payout.id,
                }),
            ))
            .await;

        info!(
            "Finalized sale of asset {}: {} paid to {}",
            asset, amount, settlement.seller
        );

        Ok(settlement)
    }

    /// Current custodial balance of an asset's record
    pub async fn get_balance(&self, asset: AssetId) -> EscrowResult<Amount> {
        Ok(self.snapshot(asset).await?.custodial_balance)
    }

    /// Whether the asset has an open listing
    pub async fn is_listed(&self, asset: AssetId) -> bool {
        match self.snapshot(asset).await {
            Ok(record) => record.listed,
            Err(_) => false,
        }
    }

    pub async fn is_finalized(&self, asset: AssetId) -> EscrowResult<bool> {
        Ok(self.snapshot(asset).await?.finalized)
    }

    pub async fn seller(&self, asset: AssetId) -> EscrowResult<Identity> {
        Ok(self.snapshot(asset).await?.seller)
    }

    pub async fn buyer(&self, asset: AssetId) -> EscrowResult<Identity> {
        Ok(self.snapshot(asset).await?.buyer)
    }

    pub async fn purchase_price(&self, asset: AssetId) -> EscrowResult<Amount> {
        Ok(self.snapshot(asset).await?.purchase_price)
    }

    /// Earnest amount set at listing
    pub async fn escrow_amount(&self, asset: AssetId) -> EscrowResult<Amount> {
        Ok(self.snapshot(asset).await?.earnest_amount)
    }

    pub async fn inspection_passed(&self, asset: AssetId) -> EscrowResult<bool> {
        Ok(self.snapshot(asset).await?.inspection_passed)
    }

    pub async fn approval(&self, asset: AssetId, identity: &Identity) -> EscrowResult<bool> {
        Ok(self.snapshot(asset).await?.approval(identity))
    }

    /// Full copy of the current record
    pub async fn record(&self, asset: AssetId) -> EscrowResult<EscrowRecord> {
        self.snapshot(asset).await
    }

    /// Finalized records superseded by relistings, oldest first
    pub async fn history(&self, asset: AssetId) -> Vec<EscrowRecord> {
        self.history
            .read()
            .await
            .get(&asset)
            .cloned()
            .unwrap_or_default()
    }

    /// Current records in which `identity` is seller, buyer or lender
    pub async fn records_for(&self, identity: &Identity) -> Vec<EscrowRecord> {
        let handles: Vec<RecordHandle> = self.records.read().await.values().cloned().collect();

        let mut matching = Vec::new();
        for handle in handles {
            let record = handle.lock().await;
            if Role::Party.admits(&record, identity) {
                matching.push(record.clone());
            }
        }
        matching.sort_by_key(|r| r.asset_id);
        matching
    }

    /// Sum of custodial balances across all records
    pub async fn total_custody(&self) -> Amount {
        let handles: Vec<RecordHandle> = self.records.read().await.values().cloned().collect();

        let mut total: Amount = 0;
        for handle in handles {
            total = total.saturating_add(handle.lock().await.custodial_balance);
        }
        total
    }

    /// Audit events for an asset, oldest first
    pub async fn events(&self, asset: AssetId) -> Vec<LedgerEvent> {
        self.events.for_asset(asset).await
    }

    /// Subscribe to events recorded from now on
    pub fn subscribe(&self) -> broadcast::Receiver<LedgerEvent> {
        self.events.subscribe()
    }

    /// Identity the ledger uses as transfer agent
    pub fn agent(&self) -> &Identity {
        &self.agent
    }

    pub fn inspector(&self) -> &Identity {
        &self.parties.inspector
    }

    pub fn lender(&self) -> &Identity {
        &self.parties.lender
    }

    /// Identifier of the asset registry this ledger settles against
    pub fn registry_id(&self) -> &str {
        self.registry.registry_id()
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    async fn deposit_into(
        &self,
        caller: &Caller,
        asset: AssetId,
        amount: Amount,
        kind: DepositKind,
    ) -> EscrowResult<Amount> {
        info!("Deposit of {} for asset {} from {}", amount, asset, caller);

        if amount == 0 {
            return Err(EscrowError::insufficient_value("deposit must carry value"));
        }
        if let Some(max) = self.config.deposits.max_deposit {
            if amount > Amount::from(max) {
                return Err(EscrowError::invalid_deposit(format!(
                    "{} exceeds maximum deposit {}",
                    amount, max
                )));
            }
        }

        let handle = self.handle(asset).await?;
        let mut record = handle.lock().await;
        Self::ensure_open(&record)?;

        if kind == DepositKind::Earnest
            && self.config.deposits.enforce_earnest_minimum
            && amount < record.earnest_amount
        {
            return Err(EscrowError::insufficient_value(format!(
                "earnest deposit {} is below required {}",
                amount, record.earnest_amount
            )));
        }

        let new_balance = record
            .custodial_balance
            .checked_add(amount)
            .ok_or_else(|| EscrowError::invalid_deposit("custodial balance overflow"))?;

        let memo = format!("{} for asset {}", kind.event_kind().as_str(), asset);
        let receipt = self
            .treasury
            .collect(caller.identity(), amount, &memo)
            .await
            .map_err(|e| {
                warn!("Deposit for asset {} failed: {}", asset, e);
                EscrowError::transfer_failed(format!("deposit: {}", e))
            })?;

        record.custodial_balance = new_balance;
        record.touch();

        self.events
            .record(LedgerEvent::new(
                kind.event_kind(),
                asset,
                caller.identity(),
                Some(amount),
                serde_json::json!({
                    "receipt": receipt.id,
                    "balance": new_balance.to_string(),
                }),
            ))
            .await;

        info!("Asset {} custodial balance now {}", asset, new_balance);

        Ok(new_balance)
    }

    async fn ensure_custodian(&self, caller: &Caller, asset: AssetId) -> EscrowResult<()> {
        let custodian = self
            .registry
            .current_custodian(asset)
            .await
            .map_err(|e| match e {
                RegistryError::UnknownAsset(_) => EscrowError::NotOwner {
                    asset,
                    caller: caller.identity().clone(),
                },
                other => EscrowError::internal(format!("registry lookup failed: {}", other)),
            })?;

        if custodian != *caller.identity() {
            warn!("Rejected listing of asset {}: {} is not custodian", asset, caller);
            return Err(EscrowError::NotOwner {
                asset,
                caller: caller.identity().clone(),
            });
        }
        Ok(())
    }

    async fn handle(&self, asset: AssetId) -> EscrowResult<RecordHandle> {
        self.records
            .read()
            .await
            .get(&asset)
            .cloned()
            .ok_or(EscrowError::NotListed(asset))
    }

    async fn snapshot(&self, asset: AssetId) -> EscrowResult<EscrowRecord> {
        let handle = self.handle(asset).await?;
        let record = handle.lock().await;
        Ok(record.clone())
    }

    fn ensure_open(record: &EscrowRecord) -> EscrowResult<()> {
        if record.finalized {
            return Err(EscrowError::AlreadyFinalized(record.asset_id));
        }
        Ok(())
    }

    fn validate_listing(&self, caller: &Caller, request: &ListingRequest) -> EscrowResult<()> {
        if request.earnest_amount > request.purchase_price {
            return Err(EscrowError::invalid_listing(format!(
                "earnest amount {} exceeds purchase price {}",
                request.earnest_amount, request.purchase_price
            )));
        }

        if request.buyer == *caller.identity() {
            return Err(EscrowError::invalid_listing("buyer cannot be the seller"));
        }

        if request.buyer == self.parties.inspector {
            return Err(EscrowError::invalid_listing("buyer cannot be the inspector"));
        }

        Ok(())
    }
}
