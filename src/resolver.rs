//! Maps operator rows to exactly one catalog identifier, or a reason why not.
//!
//! Sources are consulted in priority order and a later source is only asked
//! when every earlier one produced nothing acceptable. A candidate is
//! acceptable when its name is close enough to the row's name and its
//! variant equals the row's variant exactly. Condition and finish are never
//! substituted. A row carrying a primary-catalog printing id is first looked
//! up by that id and only falls back to its name when the id finds nothing.

use crate::catalog::{CandidateSource, SourceError, name_similarity};
use crate::models::{
    CatalogCandidate, CatalogId, Confidence, InventoryRow, Provenance, RemoteSnapshot,
    ResolutionOutcome, ResolvedRow, UnresolvedReason, VariantKey,
};
use crate::store::{InventoryStore, StoreError};
use crate::variant;
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("line {line}: {source}")]
    Source { line: usize, source: SourceError },
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ResolveError {
    pub fn is_session_lost(&self) -> bool {
        matches!(
            self,
            ResolveError::Source {
                source: SourceError::SessionLost(_),
                ..
            } | ResolveError::Store(StoreError::SessionLost(_))
        )
    }
}

pub struct Resolver {
    sources: Vec<Box<dyn CandidateSource>>,
    threshold: f64,
}

/// Resolution results plus the snapshot covering every resolved identifier.
#[derive(Debug)]
pub struct ResolutionPass {
    pub rows: Vec<ResolvedRow>,
    pub snapshot: RemoteSnapshot,
}

#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
struct Score {
    confidence: Confidence,
    similarity: f64,
}

impl Resolver {
    pub fn new(sources: Vec<Box<dyn CandidateSource>>, threshold: f64) -> Self {
        Self { sources, threshold }
    }

    /// Resolves one row. `snapshot` must already cover the row's
    /// pre-supplied identifier, if it has one. Fails only when a source
    /// reports a lost portal session.
    pub async fn resolve(
        &self,
        row: &InventoryRow,
        snapshot: &RemoteSnapshot,
    ) -> Result<ResolvedRow, ResolveError> {
        let variant = variant::normalize(&row.variant_text);
        let outcome = match &row.identifier {
            Some(identifier) => check_supplied(identifier, &variant, snapshot),
            None => {
                let by_printing = match row.scryfall_id.as_deref() {
                    Some(printing) => self.match_by_printing(row, printing, &variant).await?,
                    None => None,
                };
                match by_printing {
                    Some(outcome) => outcome,
                    None => self.match_by_name(row, &variant).await?,
                }
            }
        };
        log_outcome(row, &variant, &outcome);
        Ok(ResolvedRow {
            row: row.clone(),
            variant,
            outcome,
        })
    }

    /// Resolves every row in order, reading the snapshot once for supplied
    /// identifiers and once more for identifiers found by name.
    pub async fn resolve_all(
        &self,
        rows: &[InventoryRow],
        store: &dyn InventoryStore,
    ) -> Result<ResolutionPass, ResolveError> {
        let supplied: Vec<CatalogId> = rows
            .iter()
            .filter_map(|r| r.identifier.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let mut snapshot = store.snapshot(&supplied).await?;

        let mut resolved = Vec::with_capacity(rows.len());
        for row in rows {
            resolved.push(self.resolve(row, &snapshot).await?);
        }

        let discovered: Vec<CatalogId> = resolved
            .iter()
            .filter_map(ResolvedRow::identifier)
            .filter(|id| !snapshot.contains(id))
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if !discovered.is_empty() {
            snapshot.merge(store.snapshot(&discovered).await?);
        }

        for row in &mut resolved {
            let Some(identifier) = row.identifier() else {
                continue;
            };
            if snapshot.unavailable.contains(identifier) {
                let identifier = identifier.clone();
                warn!(target = "tcgsync.resolve", row = row.row.line, product_id = %identifier, "product page unreadable; row left unresolved");
                row.outcome = ResolutionOutcome::Unresolved {
                    reason: UnresolvedReason::SnapshotUnavailable { identifier },
                };
            }
        }
        Ok(ResolutionPass {
            rows: resolved,
            snapshot,
        })
    }

    /// Candidates addressed by printing id skip name scoring; the variant
    /// must still match exactly. `None` means no source knew the printing.
    async fn match_by_printing(
        &self,
        row: &InventoryRow,
        printing: &str,
        variant: &VariantKey,
    ) -> Result<Option<ResolutionOutcome>, ResolveError> {
        for source in &self.sources {
            let candidates = source
                .find_printing(printing)
                .await
                .map_err(|source| ResolveError::Source {
                    line: row.line,
                    source,
                })?;
            if candidates.is_empty() {
                continue;
            }
            let acceptable: Vec<(Score, CatalogCandidate)> = candidates
                .into_iter()
                .filter(|c| &c.variant == variant)
                .map(|c| {
                    (
                        Score {
                            confidence: Confidence::Exact,
                            similarity: 1.0,
                        },
                        c,
                    )
                })
                .collect();
            debug!(
                target = "tcgsync.resolve",
                row = row.line,
                source = source.kind().as_str(),
                printing,
                acceptable = acceptable.len(),
                "printing looked up"
            );
            if acceptable.is_empty() {
                return Ok(None);
            }
            return Ok(Some(select(acceptable)));
        }
        Ok(None)
    }

    async fn match_by_name(
        &self,
        row: &InventoryRow,
        variant: &VariantKey,
    ) -> Result<ResolutionOutcome, ResolveError> {
        for source in &self.sources {
            let candidates = source
                .find(&row.name)
                .await
                .map_err(|source| ResolveError::Source {
                    line: row.line,
                    source,
                })?;
            let acceptable: Vec<(Score, CatalogCandidate)> = candidates
                .into_iter()
                .filter(|c| &c.variant == variant && set_matches(row, c))
                .filter_map(|c| {
                    let similarity = name_similarity(&row.name, &c.canonical_name);
                    (similarity >= self.threshold).then_some((
                        Score {
                            confidence: c.confidence,
                            similarity,
                        },
                        c,
                    ))
                })
                .collect();
            debug!(
                target = "tcgsync.resolve",
                row = row.line,
                source = source.kind().as_str(),
                acceptable = acceptable.len(),
                "source consulted"
            );
            if acceptable.is_empty() {
                continue;
            }
            return Ok(select(acceptable));
        }
        Ok(ResolutionOutcome::Unresolved {
            reason: UnresolvedReason::NotFound,
        })
    }
}

fn check_supplied(
    identifier: &CatalogId,
    variant: &VariantKey,
    snapshot: &RemoteSnapshot,
) -> ResolutionOutcome {
    if snapshot.unavailable.contains(identifier) {
        return ResolutionOutcome::Unresolved {
            reason: UnresolvedReason::SnapshotUnavailable {
                identifier: identifier.clone(),
            },
        };
    }
    // A product with no observed variant rows cannot contradict the request.
    if let Some(listing) = snapshot.listing(identifier)
        && !listing.offered.is_empty()
        && !listing.offered.contains_key(variant)
    {
        return ResolutionOutcome::Unresolved {
            reason: UnresolvedReason::VariantMismatch {
                identifier: identifier.clone(),
                offered: listing.offered.keys().map(VariantKey::label).collect(),
            },
        };
    }
    ResolutionOutcome::Resolved {
        identifier: identifier.clone(),
        provenance: Provenance::PreSupplied,
    }
}

fn set_matches(row: &InventoryRow, candidate: &CatalogCandidate) -> bool {
    match (row.set_name.as_deref(), candidate.set_name.as_deref()) {
        (Some(wanted), Some(offered)) => wanted.trim().eq_ignore_ascii_case(offered.trim()),
        _ => true,
    }
}

/// Best candidate per identifier, then the single best identifier. Several
/// identifiers sharing the top score are ambiguous.
fn select(acceptable: Vec<(Score, CatalogCandidate)>) -> ResolutionOutcome {
    let mut best: BTreeMap<CatalogId, (Score, CatalogCandidate)> = BTreeMap::new();
    for (score, candidate) in acceptable {
        match best.get(&candidate.identifier) {
            Some((existing, _)) if *existing >= score => {}
            _ => {
                best.insert(candidate.identifier.clone(), (score, candidate));
            }
        }
    }
    let Some(top) = best
        .values()
        .map(|(score, _)| *score)
        .reduce(|a, b| if b > a { b } else { a })
    else {
        return ResolutionOutcome::Unresolved {
            reason: UnresolvedReason::NotFound,
        };
    };
    let mut leaders: Vec<(CatalogId, CatalogCandidate)> = best
        .into_iter()
        .filter(|(_, (score, _))| *score == top)
        .map(|(id, (_, candidate))| (id, candidate))
        .collect();
    if leaders.len() > 1 {
        return ResolutionOutcome::Unresolved {
            reason: UnresolvedReason::Ambiguous {
                candidates: leaders.into_iter().map(|(id, _)| id).collect(),
            },
        };
    }
    match leaders.pop() {
        Some((identifier, candidate)) => ResolutionOutcome::Resolved {
            identifier,
            provenance: Provenance::Matched {
                source: candidate.source,
                canonical_name: candidate.canonical_name,
                confidence: candidate.confidence,
            },
        },
        None => ResolutionOutcome::Unresolved {
            reason: UnresolvedReason::NotFound,
        },
    }
}

fn log_outcome(row: &InventoryRow, variant: &VariantKey, outcome: &ResolutionOutcome) {
    match outcome {
        ResolutionOutcome::Resolved {
            identifier,
            provenance,
        } => {
            let via = match provenance {
                Provenance::PreSupplied => "pre_supplied",
                Provenance::Matched { source, .. } => source.as_str(),
            };
            info!(target = "tcgsync.resolve", row = row.line, name = %row.name, variant = %variant, product_id = %identifier, via, "row resolved");
            crate::metrics::inc_outcome("resolution", "resolved");
        }
        ResolutionOutcome::Unresolved { reason } => {
            warn!(target = "tcgsync.resolve", row = row.line, name = %row.name, variant = %variant, reason = reason.code(), "row unresolved");
            crate::metrics::inc_outcome("resolution", reason.code());
        }
    }
}
