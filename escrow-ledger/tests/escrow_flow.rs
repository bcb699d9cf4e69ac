//! End-to-end sale flows against the in-memory registry and treasury

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use escrow_ledger::{
    error::EscrowError, AssetId, AssetRegistry, Caller, Condition, CustodyReceipt, EscrowLedger,
    EventKind, FinalizerPolicy, Identity, InMemoryAssetRegistry, InMemoryTreasury, LedgerConfig,
    LedgerParties, ListingRequest, RegistryError, TransferReceipt, Treasury, TreasuryError,
};
use tokio::sync::Notify;

fn id(s: &str) -> Identity {
    Identity::new(s).unwrap()
}

fn caller(s: &str) -> Caller {
    Caller::authenticated(id(s))
}

fn parties() -> LedgerParties {
    LedgerParties {
        inspector: id("inspector"),
        lender: id("lender"),
    }
}

struct Harness {
    ledger: Arc<EscrowLedger>,
    registry: Arc<InMemoryAssetRegistry>,
    treasury: Arc<InMemoryTreasury>,
}

async fn harness_with(config: LedgerConfig) -> Harness {
    let registry = Arc::new(InMemoryAssetRegistry::new("real-estate"));
    let treasury = Arc::new(InMemoryTreasury::new());
    let ledger = EscrowLedger::new(
        config,
        id("escrow"),
        parties(),
        registry.clone(),
        treasury.clone(),
    )
    .unwrap();

    treasury.credit(&id("buyer"), 50).await.unwrap();
    treasury.credit(&id("lender"), 50).await.unwrap();

    Harness {
        ledger: Arc::new(ledger),
        registry,
        treasury,
    }
}

async fn harness() -> Harness {
    harness_with(LedgerConfig::default()).await
}

impl Harness {
    /// Mint an asset to the seller, approve the ledger as agent and list it
    async fn listed(&self, asset: u64) {
        let asset = AssetId(asset);
        self.registry.mint(asset, id("seller")).await.unwrap();
        self.registry
            .authorize_agent(&id("seller"), asset, self.ledger.agent())
            .await
            .unwrap();
        self.ledger
            .list(
                &caller("seller"),
                ListingRequest {
                    asset_id: asset,
                    buyer: id("buyer"),
                    purchase_price: 10,
                    earnest_amount: 5,
                },
            )
            .await
            .unwrap();
    }

    /// Drive a listed asset up to the point where finalization is allowed
    async fn ready(&self, asset: u64) {
        let asset = AssetId(asset);
        self.ledger
            .deposit_earnest(&caller("buyer"), asset, 5)
            .await
            .unwrap();
        self.ledger
            .update_inspection_status(&caller("inspector"), asset, true)
            .await
            .unwrap();
        for party in ["buyer", "seller", "lender"] {
            self.ledger.approve_sale(&caller(party), asset).await.unwrap();
        }
        self.ledger.deposit(&caller("lender"), asset, 5).await.unwrap();
    }
}

#[tokio::test]
async fn test_full_sale_settles_asset_and_funds() {
    let h = harness().await;
    h.listed(1).await;

    assert_eq!(h.ledger.buyer(AssetId(1)).await.unwrap(), id("buyer"));
    assert_eq!(h.ledger.purchase_price(AssetId(1)).await.unwrap(), 10);
    assert_eq!(h.ledger.escrow_amount(AssetId(1)).await.unwrap(), 5);

    h.ledger
        .deposit_earnest(&caller("buyer"), AssetId(1), 5)
        .await
        .unwrap();
    assert_eq!(h.ledger.get_balance(AssetId(1)).await.unwrap(), 5);

    h.ledger
        .update_inspection_status(&caller("inspector"), AssetId(1), true)
        .await
        .unwrap();
    assert!(h.ledger.inspection_passed(AssetId(1)).await.unwrap());

    for party in ["buyer", "seller", "lender"] {
        h.ledger.approve_sale(&caller(party), AssetId(1)).await.unwrap();
        assert!(h.ledger.approval(AssetId(1), &id(party)).await.unwrap());
    }

    h.ledger.deposit(&caller("lender"), AssetId(1), 5).await.unwrap();
    assert_eq!(h.ledger.get_balance(AssetId(1)).await.unwrap(), 10);

    let settlement = h
        .ledger
        .finalize_sale(&caller("seller"), AssetId(1))
        .await
        .unwrap();

    assert_eq!(settlement.amount_paid, 10);
    assert_eq!(settlement.buyer, id("buyer"));
    assert_eq!(h.ledger.get_balance(AssetId(1)).await.unwrap(), 0);
    assert!(h.ledger.is_finalized(AssetId(1)).await.unwrap());
    assert!(!h.ledger.is_listed(AssetId(1)).await);
    assert_eq!(
        h.registry.current_custodian(AssetId(1)).await.unwrap(),
        id("buyer")
    );
    assert_eq!(h.treasury.balance_of(&id("seller")).await, 10);
    assert_eq!(h.treasury.custody_balance().await, 0);

    let kinds: Vec<EventKind> = h
        .ledger
        .events(AssetId(1))
        .await
        .into_iter()
        .map(|e| e.kind)
        .collect();
    assert_eq!(kinds.first(), Some(&EventKind::Listed));
    assert_eq!(kinds.last(), Some(&EventKind::SaleFinalized));
    assert_eq!(kinds.len(), 8);
}

#[tokio::test]
async fn test_second_listing_rejected_while_open() {
    let h = harness().await;
    h.listed(1).await;

    let result = h
        .ledger
        .list(
            &caller("seller"),
            ListingRequest {
                asset_id: AssetId(1),
                buyer: id("other-buyer"),
                purchase_price: 20,
                earnest_amount: 1,
            },
        )
        .await;

    assert!(matches!(result, Err(EscrowError::AlreadyListed(_))));
    assert_eq!(h.ledger.buyer(AssetId(1)).await.unwrap(), id("buyer"));
}

#[tokio::test]
async fn test_non_custodian_cannot_list() {
    let h = harness().await;
    h.registry.mint(AssetId(2), id("seller")).await.unwrap();

    let result = h
        .ledger
        .list(
            &caller("mallory"),
            ListingRequest {
                asset_id: AssetId(2),
                buyer: id("buyer"),
                purchase_price: 10,
                earnest_amount: 5,
            },
        )
        .await;

    assert!(matches!(result, Err(EscrowError::NotOwner { .. })));
    assert!(!h.ledger.is_listed(AssetId(2)).await);
}

#[tokio::test]
async fn test_finalize_reports_every_unmet_condition() {
    let h = harness().await;
    h.listed(1).await;
    h.ledger
        .deposit_earnest(&caller("buyer"), AssetId(1), 5)
        .await
        .unwrap();
    h.ledger.approve_sale(&caller("buyer"), AssetId(1)).await.unwrap();

    match h.ledger.finalize_sale(&caller("seller"), AssetId(1)).await {
        Err(EscrowError::ConditionsNotMet { unmet, .. }) => {
            assert_eq!(
                unmet,
                vec![
                    Condition::InspectionPassed,
                    Condition::SellerApproval,
                    Condition::LenderApproval,
                    Condition::FullyFunded,
                ]
            );
        }
        other => panic!("Expected ConditionsNotMet, got {other:?}"),
    }

    assert_eq!(h.ledger.get_balance(AssetId(1)).await.unwrap(), 5);
    assert_eq!(
        h.registry.current_custodian(AssetId(1)).await.unwrap(),
        id("seller")
    );
}

#[tokio::test]
async fn test_failed_inspection_blocks_settlement() {
    let h = harness().await;
    h.listed(1).await;
    h.ready(1).await;
    h.ledger
        .update_inspection_status(&caller("inspector"), AssetId(1), false)
        .await
        .unwrap();

    let result = h.ledger.finalize_sale(&caller("seller"), AssetId(1)).await;
    assert!(matches!(
        result,
        Err(EscrowError::ConditionsNotMet { ref unmet, .. }) if unmet == &vec![Condition::InspectionPassed]
    ));
}

#[tokio::test]
async fn test_only_inspector_updates_inspection() {
    let h = harness().await;
    h.listed(1).await;

    for who in ["buyer", "seller", "lender", "mallory"] {
        let result = h
            .ledger
            .update_inspection_status(&caller(who), AssetId(1), true)
            .await;
        assert!(matches!(result, Err(EscrowError::Unauthorized { .. })));
    }
    assert!(!h.ledger.inspection_passed(AssetId(1)).await.unwrap());
}

#[tokio::test]
async fn test_finalized_record_is_sealed() {
    let h = harness().await;
    h.listed(1).await;
    h.ready(1).await;
    h.ledger
        .finalize_sale(&caller("seller"), AssetId(1))
        .await
        .unwrap();

    assert!(matches!(
        h.ledger.deposit(&caller("buyer"), AssetId(1), 1).await,
        Err(EscrowError::AlreadyFinalized(_))
    ));
    assert!(matches!(
        h.ledger
            .update_inspection_status(&caller("inspector"), AssetId(1), false)
            .await,
        Err(EscrowError::AlreadyFinalized(_))
    ));
    assert!(matches!(
        h.ledger.approve_sale(&caller("buyer"), AssetId(1)).await,
        Err(EscrowError::AlreadyFinalized(_))
    ));
    assert!(matches!(
        h.ledger.finalize_sale(&caller("seller"), AssetId(1)).await,
        Err(EscrowError::ConditionsNotMet { .. })
    ));
    assert_eq!(h.treasury.balance_of(&id("seller")).await, 10);
}

#[tokio::test]
async fn test_relist_after_settlement_archives_previous_record() {
    let h = harness().await;
    h.listed(1).await;
    h.ready(1).await;
    h.ledger
        .finalize_sale(&caller("seller"), AssetId(1))
        .await
        .unwrap();

    // The buyer now holds the asset and sells it on
    h.ledger
        .list(
            &caller("buyer"),
            ListingRequest {
                asset_id: AssetId(1),
                buyer: id("next-buyer"),
                purchase_price: 12,
                earnest_amount: 2,
            },
        )
        .await
        .unwrap();

    let record = h.ledger.record(AssetId(1)).await.unwrap();
    assert_eq!(record.seller, id("buyer"));
    assert_eq!(record.custodial_balance, 0);
    assert!(record.approvals.is_empty());

    let history = h.ledger.history(AssetId(1)).await;
    assert_eq!(history.len(), 1);
    assert!(history[0].finalized);
    assert_eq!(history[0].seller, id("seller"));
}

struct RejectingPayouts(InMemoryTreasury);

#[async_trait]
impl Treasury for RejectingPayouts {
    async fn collect(
        &self,
        from: &Identity,
        amount: u128,
        memo: &str,
    ) -> Result<TransferReceipt, TreasuryError> {
        self.0.collect(from, amount, memo).await
    }

    async fn pay(
        &self,
        _to: &Identity,
        _amount: u128,
        _memo: &str,
    ) -> Result<TransferReceipt, TreasuryError> {
        Err(TreasuryError::Rejected("payout rail offline".to_string()))
    }
}

/// Registry that can hold custody transfers at a gate or refuse to revert them
struct ScriptedRegistry {
    inner: Arc<InMemoryAssetRegistry>,
    gate: Option<(Arc<Notify>, Arc<Notify>)>,
    refuse_revert: bool,
}

#[async_trait]
impl AssetRegistry for ScriptedRegistry {
    fn registry_id(&self) -> &str {
        self.inner.registry_id()
    }

    async fn current_custodian(&self, asset: AssetId) -> Result<Identity, RegistryError> {
        self.inner.current_custodian(asset).await
    }

    async fn authorize_agent(
        &self,
        caller: &Identity,
        asset: AssetId,
        agent: &Identity,
    ) -> Result<(), RegistryError> {
        self.inner.authorize_agent(caller, asset, agent).await
    }

    async fn transfer_custody(
        &self,
        agent: &Identity,
        asset: AssetId,
        from: &Identity,
        to: &Identity,
    ) -> Result<CustodyReceipt, RegistryError> {
        if let Some((entered, release)) = &self.gate {
            entered.notify_one();
            release.notified().await;
        }
        self.inner.transfer_custody(agent, asset, from, to).await
    }

    async fn revert_transfer(&self, receipt: &CustodyReceipt) -> Result<(), RegistryError> {
        if self.refuse_revert {
            return Err(RegistryError::Unavailable("registry offline".to_string()));
        }
        self.inner.revert_transfer(receipt).await
    }
}

async fn scripted_harness(registry: ScriptedRegistry, treasury: Arc<dyn Treasury>) -> Harness {
    let inner = registry.inner.clone();
    let ledger = EscrowLedger::new(
        LedgerConfig::default(),
        id("escrow"),
        parties(),
        Arc::new(registry),
        treasury,
    )
    .unwrap();

    Harness {
        ledger: Arc::new(ledger),
        registry: inner,
        treasury: Arc::new(InMemoryTreasury::new()),
    }
}

#[tokio::test]
async fn test_relist_during_settlement_does_not_block_other_assets() {
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let treasury = Arc::new(InMemoryTreasury::new());
    treasury.credit(&id("buyer"), 50).await.unwrap();
    treasury.credit(&id("lender"), 50).await.unwrap();

    let h = scripted_harness(
        ScriptedRegistry {
            inner: Arc::new(InMemoryAssetRegistry::new("real-estate")),
            gate: Some((entered.clone(), release.clone())),
            refuse_revert: false,
        },
        treasury.clone(),
    )
    .await;
    h.listed(1).await;
    h.listed(2).await;
    h.ready(1).await;

    let settling = {
        let ledger = h.ledger.clone();
        tokio::spawn(async move { ledger.finalize_sale(&caller("seller"), AssetId(1)).await })
    };
    entered.notified().await;

    let relisting = {
        let ledger = h.ledger.clone();
        tokio::spawn(async move {
            ledger
                .list(
                    &caller("seller"),
                    ListingRequest {
                        asset_id: AssetId(1),
                        buyer: id("other-buyer"),
                        purchase_price: 10,
                        earnest_amount: 1,
                    },
                )
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let balance = tokio::time::timeout(
        Duration::from_millis(500),
        h.ledger.get_balance(AssetId(2)),
    )
    .await;
    assert!(matches!(balance, Ok(Ok(0))));

    release.notify_one();
    settling.await.unwrap().unwrap();

    // Custody has moved to the buyer by the time the relist sees the sealed record
    assert!(matches!(
        relisting.await.unwrap(),
        Err(EscrowError::NotOwner { .. })
    ));
    assert_eq!(treasury.balance_of(&id("seller")).await, 10);
    assert!(h.ledger.history(AssetId(1)).await.is_empty());
}

#[tokio::test]
async fn test_failed_custody_restore_reports_both_causes() {
    let inner = InMemoryTreasury::new();
    inner.credit(&id("buyer"), 50).await.unwrap();
    inner.credit(&id("lender"), 50).await.unwrap();

    let h = scripted_harness(
        ScriptedRegistry {
            inner: Arc::new(InMemoryAssetRegistry::new("real-estate")),
            gate: None,
            refuse_revert: true,
        },
        Arc::new(RejectingPayouts(inner)),
    )
    .await;
    h.listed(1).await;
    h.ready(1).await;

    let err = h
        .ledger
        .finalize_sale(&caller("seller"), AssetId(1))
        .await
        .unwrap_err();

    match &err {
        EscrowError::TransferFailed(msg) => {
            assert!(msg.contains("payout rail offline"), "{msg}");
            assert!(msg.contains("registry offline"), "{msg}");
        }
        other => panic!("Expected TransferFailed, got {other:?}"),
    }
    assert!(!h.ledger.is_finalized(AssetId(1)).await.unwrap());
    assert_eq!(h.ledger.get_balance(AssetId(1)).await.unwrap(), 10);
    assert!(h
        .ledger
        .events(AssetId(1))
        .await
        .iter()
        .all(|e| e.kind != EventKind::SaleFinalized));
}

#[tokio::test]
async fn test_payout_failure_restores_custody() {
    let registry = Arc::new(InMemoryAssetRegistry::new("real-estate"));
    let inner = InMemoryTreasury::new();
    inner.credit(&id("buyer"), 50).await.unwrap();
    inner.credit(&id("lender"), 50).await.unwrap();
    let ledger = Arc::new(
        EscrowLedger::new(
            LedgerConfig::default(),
            id("escrow"),
            parties(),
            registry.clone(),
            Arc::new(RejectingPayouts(inner)),
        )
        .unwrap(),
    );
    let h = Harness {
        ledger,
        registry,
        treasury: Arc::new(InMemoryTreasury::new()),
    };
    h.listed(1).await;
    h.ready(1).await;

    let result = h.ledger.finalize_sale(&caller("seller"), AssetId(1)).await;
    assert!(matches!(result, Err(EscrowError::TransferFailed(_))));

    assert!(!h.ledger.is_finalized(AssetId(1)).await.unwrap());
    assert_eq!(h.ledger.get_balance(AssetId(1)).await.unwrap(), 10);
    assert_eq!(
        h.registry.current_custodian(AssetId(1)).await.unwrap(),
        id("seller")
    );
    assert_eq!(
        h.registry.authorized_agent(AssetId(1)).await,
        Some(id("escrow"))
    );
}

#[tokio::test]
async fn test_missing_agent_approval_fails_without_payout() {
    let h = harness().await;
    h.registry.mint(AssetId(3), id("seller")).await.unwrap();
    h.ledger
        .list(
            &caller("seller"),
            ListingRequest {
                asset_id: AssetId(3),
                buyer: id("buyer"),
                purchase_price: 10,
                earnest_amount: 5,
            },
        )
        .await
        .unwrap();
    h.ready(3).await;

    let result = h.ledger.finalize_sale(&caller("seller"), AssetId(3)).await;
    assert!(matches!(result, Err(EscrowError::TransferFailed(_))));
    assert_eq!(h.ledger.get_balance(AssetId(3)).await.unwrap(), 10);
    assert_eq!(h.treasury.balance_of(&id("seller")).await, 0);
}

#[tokio::test]
async fn test_any_party_policy_lets_buyer_finalize() {
    let mut config = LedgerConfig::default();
    config.finalization.policy = FinalizerPolicy::AnyParty;
    let h = harness_with(config).await;
    h.listed(1).await;
    h.ready(1).await;

    assert!(matches!(
        h.ledger.finalize_sale(&caller("inspector"), AssetId(1)).await,
        Err(EscrowError::Unauthorized { .. })
    ));
    h.ledger
        .finalize_sale(&caller("buyer"), AssetId(1))
        .await
        .unwrap();
    assert_eq!(
        h.registry.current_custodian(AssetId(1)).await.unwrap(),
        id("buyer")
    );
}

#[tokio::test]
async fn test_earnest_minimum_when_enforced() {
    let mut config = LedgerConfig::default();
    config.deposits.enforce_earnest_minimum = true;
    config.deposits.max_deposit = Some(20);
    let h = harness_with(config).await;
    h.listed(1).await;

    assert!(matches!(
        h.ledger.deposit_earnest(&caller("buyer"), AssetId(1), 4).await,
        Err(EscrowError::InsufficientValue(_))
    ));
    assert!(matches!(
        h.ledger.deposit(&caller("buyer"), AssetId(1), 21).await,
        Err(EscrowError::InvalidDeposit(_))
    ));
    assert_eq!(h.ledger.get_balance(AssetId(1)).await.unwrap(), 0);

    // Plain deposits are not subject to the earnest minimum
    h.ledger.deposit(&caller("buyer"), AssetId(1), 4).await.unwrap();
    assert_eq!(h.ledger.get_balance(AssetId(1)).await.unwrap(), 4);
}

#[tokio::test]
async fn test_concurrent_deposits_across_assets() {
    let h = harness().await;
    for asset in 1..=4 {
        h.listed(asset).await;
    }

    let mut handles = Vec::new();
    for asset in 1..=4u64 {
        for _ in 0..3 {
            let ledger = h.ledger.clone();
            handles.push(tokio::spawn(async move {
                ledger.deposit(&caller("buyer"), AssetId(asset), 2).await
            }));
        }
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    for asset in 1..=4 {
        assert_eq!(h.ledger.get_balance(AssetId(asset)).await.unwrap(), 6);
    }
    assert_eq!(h.ledger.total_custody().await, 24);
    assert_eq!(h.treasury.custody_balance().await, 24);
    assert_eq!(h.treasury.balance_of(&id("buyer")).await, 26);
}

#[tokio::test]
async fn test_concurrent_listing_admits_one() {
    let h = harness().await;
    h.registry.mint(AssetId(9), id("seller")).await.unwrap();

    let mut handles = Vec::new();
    for n in 0..5 {
        let ledger = h.ledger.clone();
        handles.push(tokio::spawn(async move {
            ledger
                .list(
                    &caller("seller"),
                    ListingRequest {
                        asset_id: AssetId(9),
                        buyer: Identity::new(format!("buyer-{n}")).unwrap(),
                        purchase_price: 10,
                        earnest_amount: 1,
                    },
                )
                .await
        }));
    }

    let mut listed = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => listed += 1,
            Err(EscrowError::AlreadyListed(_)) => {}
            Err(other) => panic!("Unexpected error: {other:?}"),
        }
    }
    assert_eq!(listed, 1);
}

#[tokio::test]
async fn test_subscribers_see_finalization() {
    let h = harness().await;
    h.listed(1).await;
    h.ready(1).await;

    let mut rx = h.ledger.subscribe();
    h.ledger
        .finalize_sale(&caller("seller"), AssetId(1))
        .await
        .unwrap();

    let event = rx.recv().await.unwrap();
    assert_eq!(event.kind, EventKind::SaleFinalized);
    assert_eq!(event.amount, Some(10));

    let parties = h.ledger.records_for(&id("lender")).await;
    assert_eq!(parties.len(), 1);
}
