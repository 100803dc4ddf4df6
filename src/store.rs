//! Remote inventory store: the snapshot read and the mutation collaborator.

use crate::automation::AutomationError;
use crate::models::{
    CatalogId, Operation, OperationKind, ProductListing, RemoteSnapshot, SnapshotEntry,
};
use crate::portal::{ManagePage, Portal};
use async_trait::async_trait;
use std::collections::BTreeSet;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Worth another attempt: timeouts, navigation hiccups, stale pages.
    #[error("transient store failure: {0}")]
    Transient(String),
    /// The product page has no row for the target variant.
    #[error("product {identifier} has no `{variant}` row")]
    MissingVariant { identifier: String, variant: String },
    #[error("portal session lost: {0}")]
    SessionLost(String),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

impl From<AutomationError> for StoreError {
    fn from(err: AutomationError) -> Self {
        match err {
            AutomationError::SessionLost(message) => StoreError::SessionLost(message),
            other => StoreError::Transient(other.to_string()),
        }
    }
}

#[async_trait]
pub trait InventoryStore: Send + Sync {
    /// Reads each product once. Products that cannot be read land in
    /// `RemoteSnapshot::unavailable`; only a lost session fails the call.
    async fn snapshot(&self, ids: &[CatalogId]) -> Result<RemoteSnapshot, StoreError>;

    /// Writes the operation's final quantity and price as absolute values.
    async fn apply(&self, op: &Operation) -> Result<(), StoreError>;
}

pub struct PortalStore {
    portal: Portal,
}

impl PortalStore {
    pub fn new(portal: Portal) -> Self {
        Self { portal }
    }
}

fn listing_from_page(page: ManagePage) -> ProductListing {
    let mut listing = ProductListing {
        name: page.name,
        ..ProductListing::default()
    };
    for row in page.rows {
        listing
            .offered
            .entry(row.variant)
            .or_insert(row.market_price);
        if row.quantity > 0 {
            listing.entries.entry(row.variant).or_insert(SnapshotEntry {
                quantity: row.quantity,
                price: row.price,
                market_price: row.market_price,
            });
        }
    }
    listing
}

#[async_trait]
impl InventoryStore for PortalStore {
    async fn snapshot(&self, ids: &[CatalogId]) -> Result<RemoteSnapshot, StoreError> {
        let mut snapshot = RemoteSnapshot::default();
        let unique: BTreeSet<&CatalogId> = ids.iter().collect();
        for id in unique {
            match self.portal.read_manage_page(id).await {
                Ok(page) => {
                    snapshot.products.insert(id.clone(), listing_from_page(page));
                }
                Err(AutomationError::SessionLost(message)) => {
                    return Err(StoreError::SessionLost(message));
                }
                Err(err) => {
                    warn!(target = "tcgsync.store", product_id = %id, error = %err, "snapshot_read_failed");
                    snapshot.unavailable.insert(id.clone());
                }
            }
        }
        debug!(
            target = "tcgsync.store",
            products = snapshot.products.len(),
            unavailable = snapshot.unavailable.len(),
            "snapshot read"
        );
        Ok(snapshot)
    }

    async fn apply(&self, op: &Operation) -> Result<(), StoreError> {
        if let OperationKind::NoOp { .. } = op.kind {
            return Ok(());
        }
        let page = self.portal.read_manage_page(&op.identifier).await?;
        let row = page
            .row_for(&op.variant)
            .ok_or_else(|| StoreError::MissingVariant {
                identifier: op.identifier.to_string(),
                variant: op.variant.label(),
            })?;
        let price = match &op.kind {
            OperationKind::Create { price, .. } => *price,
            OperationKind::UpdateQuantity { price, .. } => price.map(|p| p.new),
            OperationKind::UpdatePrice { change, .. } => Some(change.new),
            OperationKind::NoOp { .. } => None,
        };
        self.portal
            .write_row(row.row, Some(op.kind.final_quantity()), price)
            .await?;
        info!(
            target = "tcgsync.store",
            product_id = %op.identifier,
            variant = %op.variant,
            op = op.kind.name(),
            quantity = op.kind.final_quantity(),
            "listing saved"
        );
        Ok(())
    }
}
