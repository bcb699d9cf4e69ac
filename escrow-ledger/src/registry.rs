//! Asset registry collaborator
//!
//! The registry owns the mapping from asset id to current custodian. The
//! ledger only needs three things from it: who holds an asset, whether the
//! ledger is the asset's authorized transfer agent, and the ability to move
//! custody (and undo a move it just made when a later settlement step fails).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::{collections::HashMap, sync::Arc};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::models::{AssetId, Identity};

/// Errors reported by an asset registry
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("asset {0} is not registered")]
    UnknownAsset(AssetId),

    #[error("{caller} is not the custodian of asset {asset}")]
    NotCustodian { asset: AssetId, caller: Identity },

    #[error("{agent} is not authorized to transfer asset {asset}")]
    NotAuthorized { asset: AssetId, agent: Identity },

    #[error("asset {asset} is held by {actual}, not {expected}")]
    CustodianMismatch {
        asset: AssetId,
        expected: Identity,
        actual: Identity,
    },

    #[error("asset {0} is already registered")]
    AlreadyRegistered(AssetId),

    #[error("custody receipt {0} cannot be reverted")]
    StaleReceipt(Uuid),

    #[error("registry unavailable: {0}")]
    Unavailable(String),
}

/// Proof of a custody transfer, used to compensate it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustodyReceipt {
    pub id: Uuid,
    pub asset_id: AssetId,
    pub from: Identity,
    pub to: Identity,
    pub agent: Identity,
    pub transferred_at: DateTime<Utc>,
}

/// Interface the ledger consumes from the asset registry
#[async_trait]
pub trait AssetRegistry: Send + Sync {
    /// Stable identifier of the registry deployment
    fn registry_id(&self) -> &str;

    /// Current custodian of an asset
    async fn current_custodian(&self, asset: AssetId) -> Result<Identity, RegistryError>;

    /// Grant `agent` the right to move `asset`; callable by the custodian only
    async fn authorize_agent(
        &self,
        caller: &Identity,
        asset: AssetId,
        agent: &Identity,
    ) -> Result<(), RegistryError>;

    /// Move custody from `from` to `to`; callable by the authorized agent only
    async fn transfer_custody(
        &self,
        agent: &Identity,
        asset: AssetId,
        from: &Identity,
        to: &Identity,
    ) -> Result<CustodyReceipt, RegistryError>;

    /// Undo a transfer made by `receipt.agent`, restoring custodian and agent
    async fn revert_transfer(&self, receipt: &CustodyReceipt) -> Result<(), RegistryError>;
}

#[derive(Debug, Clone)]
struct Holding {
    custodian: Identity,
    agent: Option<Identity>,
    last_receipt: Option<Uuid>,
}

/// In-memory registry for tests and local runs
pub struct InMemoryAssetRegistry {
    id: String,
    holdings: Arc<RwLock<HashMap<AssetId, Holding>>>,
}

impl InMemoryAssetRegistry {
    pub fn new<S: Into<String>>(id: S) -> Self {
        Self {
            id: id.into(),
            holdings: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register a new asset under its first custodian
    pub async fn mint(&self, asset: AssetId, custodian: Identity) -> Result<(), RegistryError> {
        let mut holdings = self.holdings.write().await;
        if holdings.contains_key(&asset) {
            return Err(RegistryError::AlreadyRegistered(asset));
        }

        info!("Registered asset {} to {}", asset, custodian);
        holdings.insert(
            asset,
            Holding {
                custodian,
                agent: None,
                last_receipt: None,
            },
        );
        Ok(())
    }

    /// Currently authorized transfer agent, if any
    pub async fn authorized_agent(&self, asset: AssetId) -> Option<Identity> {
        self.holdings
            .read()
            .await
            .get(&asset)
            .and_then(|h| h.agent.clone())
    }
}

#[async_trait]
impl AssetRegistry for InMemoryAssetRegistry {
    fn registry_id(&self) -> &str {
        &self.id
    }

    async fn current_custodian(&self, asset: AssetId) -> Result<Identity, RegistryError> {
        self.holdings
            .read()
            .await
            .get(&asset)
            .map(|h| h.custodian.clone())
            .ok_or(RegistryError::UnknownAsset(asset))
    }

    async fn authorize_agent(
        &self,
        caller: &Identity,
        asset: AssetId,
        agent: &Identity,
    ) -> Result<(), RegistryError> {
        let mut holdings = self.holdings.write().await;
        let holding = holdings
            .get_mut(&asset)
            .ok_or(RegistryError::UnknownAsset(asset))?;

        if holding.custodian != *caller {
            return Err(RegistryError::NotCustodian {
                asset,
                caller: caller.clone(),
            });
        }

        debug!("Asset {} agent set to {}", asset, agent);
        holding.agent = Some(agent.clone());
        Ok(())
    }

    async fn transfer_custody(
        &self,
        agent: &Identity,
        asset: AssetId,
        from: &Identity,
        to: &Identity,
    ) -> Result<CustodyReceipt, RegistryError> {
        let mut holdings = self.holdings.write().await;
        let holding = holdings
            .get_mut(&asset)
            .ok_or(RegistryError::UnknownAsset(asset))?;

        if holding.agent.as_ref() != Some(agent) {
            return Err(RegistryError::NotAuthorized {
                asset,
                agent: agent.clone(),
            });
        }
        if holding.custodian != *from {
            return Err(RegistryError::CustodianMismatch {
                asset,
                expected: from.clone(),
                actual: holding.custodian.clone(),
            });
        }

        let receipt = CustodyReceipt {
            id: Uuid::new_v4(),
            asset_id: asset,
            from: from.clone(),
            to: to.clone(),
            agent: agent.clone(),
            transferred_at: Utc::now(),
        };

        // Agent approval is consumed by the transfer
        holding.custodian = to.clone();
        holding.agent = None;
        holding.last_receipt = Some(receipt.id);

        info!("Asset {} custody moved {} -> {}", asset, from, to);
        Ok(receipt)
    }

    async fn revert_transfer(&self, receipt: &CustodyReceipt) -> Result<(), RegistryError> {
        let mut holdings = self.holdings.write().await;
        let holding = holdings
            .get_mut(&receipt.asset_id)
            .ok_or(RegistryError::UnknownAsset(receipt.asset_id))?;

        if holding.last_receipt != Some(receipt.id) || holding.custodian != receipt.to {
            return Err(RegistryError::StaleReceipt(receipt.id));
        }

        holding.custodian = receipt.from.clone();
        holding.agent = Some(receipt.agent.clone());
        holding.last_receipt = None;

        info!(
            "Asset {} custody restored to {}",
            receipt.asset_id, receipt.from
        );
        Ok(())
    }
}
