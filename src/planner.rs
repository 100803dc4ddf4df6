//! Diffs resolved rows against the remote snapshot.

use crate::models::{
    CatalogId, Money, Operation, OperationKind, PriceChange, RemoteSnapshot, ResolvedRow,
    VariantKey,
};
use std::collections::HashMap;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlanOptions {
    /// Rows without a price target the snapshot's market price.
    pub match_market: bool,
}

struct Desired {
    identifier: CatalogId,
    variant: VariantKey,
    name: String,
    lines: Vec<usize>,
    quantity: u32,
    price: Option<Money>,
}

/// One operation per `(identifier, variant)`, in order of first appearance.
/// Repeated rows for a key add their quantities; the last explicit price
/// wins. Unresolved rows produce nothing.
pub fn plan(
    resolutions: &[ResolvedRow],
    snapshot: &RemoteSnapshot,
    options: PlanOptions,
) -> Vec<Operation> {
    let mut desired: Vec<Desired> = Vec::new();
    let mut index: HashMap<(CatalogId, VariantKey), usize> = HashMap::new();
    for resolved in resolutions {
        let Some(identifier) = resolved.identifier() else {
            continue;
        };
        let key = (identifier.clone(), resolved.variant);
        let row = &resolved.row;
        match index.get(&key) {
            Some(&at) => {
                let slot = &mut desired[at];
                slot.quantity = slot.quantity.saturating_add(row.quantity);
                slot.lines.push(row.line);
                if row.price.is_some() {
                    slot.price = row.price;
                }
            }
            None => {
                index.insert(key, desired.len());
                desired.push(Desired {
                    identifier: identifier.clone(),
                    variant: resolved.variant,
                    name: row.name.clone(),
                    lines: vec![row.line],
                    quantity: row.quantity,
                    price: row.price,
                });
            }
        }
    }

    let operations: Vec<Operation> = desired
        .into_iter()
        .map(|d| {
            let target_price = d.price.or_else(|| {
                options
                    .match_market
                    .then(|| snapshot.market_price(&d.identifier, &d.variant))
                    .flatten()
            });
            let kind = diff(snapshot, &d.identifier, &d.variant, d.quantity, target_price);
            debug!(target = "tcgsync.plan", product_id = %d.identifier, variant = %d.variant, op = kind.name(), "operation planned");
            Operation {
                identifier: d.identifier,
                variant: d.variant,
                name: d.name,
                lines: d.lines,
                kind,
            }
        })
        .collect();

    let changes = operations.iter().filter(|op| !op.kind.is_noop()).count();
    info!(
        target = "tcgsync.plan",
        operations = operations.len(),
        changes,
        "plan ready"
    );
    operations
}

fn diff(
    snapshot: &RemoteSnapshot,
    identifier: &CatalogId,
    variant: &VariantKey,
    quantity: u32,
    price: Option<Money>,
) -> OperationKind {
    let Some(current) = snapshot.entry(identifier, variant) else {
        return if quantity == 0 {
            OperationKind::NoOp { quantity, price: None }
        } else {
            OperationKind::Create { quantity, price }
        };
    };
    let price_change = price
        .filter(|new| current.price != Some(*new))
        .map(|new| PriceChange {
            old: current.price,
            new,
        });
    if current.quantity != quantity {
        OperationKind::UpdateQuantity {
            old: current.quantity,
            new: quantity,
            price: price_change,
        }
    } else if let Some(change) = price_change {
        OperationKind::UpdatePrice { quantity, change }
    } else {
        OperationKind::NoOp {
            quantity,
            price: current.price,
        }
    }
}
