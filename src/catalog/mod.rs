//! Candidate sources: uniform `find(name)` over heterogeneous catalogs.

pub mod cache;
pub mod pokemon;
pub mod portal;
pub mod scryfall;

use crate::models::{CatalogCandidate, Confidence, SourceKind};
use async_trait::async_trait;
use std::cmp::Ordering;
use thiserror::Error;
use tracing::{error, warn};

pub use cache::{CachedSource, LookupCache};
pub use pokemon::PokemonTcgSource;
pub use portal::PortalSearchSource;
pub use scryfall::ScryfallSource;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("source unavailable: {0}")]
    Unavailable(String),
    #[error("invalid response: {0}")]
    Decode(String),
    #[error("portal session lost: {0}")]
    SessionLost(String),
}

#[async_trait]
pub trait CandidateSource: Send + Sync {
    fn kind(&self) -> SourceKind;

    /// Raw lookup against the backing catalog.
    async fn lookup(&self, name: &str) -> Result<Vec<CatalogCandidate>, SourceError>;

    /// Candidates for one printing, addressed by the catalog's own printing
    /// id. Sources without printing ids have none.
    async fn lookup_printing(&self, _printing: &str) -> Result<Vec<CatalogCandidate>, SourceError> {
        Ok(Vec::new())
    }

    /// Ranked candidates for `name`. A source that is down yields an empty
    /// sequence so the caller can move on to the next one; only a lost
    /// portal session is returned as an error.
    async fn find(&self, name: &str) -> Result<Vec<CatalogCandidate>, SourceError> {
        let found = degrade(self.kind(), name, self.lookup(name).await)?;
        Ok(rank_candidates(name, found))
    }

    /// Same contract as [`CandidateSource::find`], by printing id.
    async fn find_printing(&self, printing: &str) -> Result<Vec<CatalogCandidate>, SourceError> {
        degrade(self.kind(), printing, self.lookup_printing(printing).await)
    }
}

fn degrade(
    kind: SourceKind,
    query: &str,
    result: Result<Vec<CatalogCandidate>, SourceError>,
) -> Result<Vec<CatalogCandidate>, SourceError> {
    let source = kind.as_str();
    match result {
        Ok(candidates) => {
            crate::metrics::inc_source_lookup(source, candidates.len(), false);
            Ok(candidates)
        }
        Err(err @ SourceError::SessionLost(_)) => {
            error!(target = "tcgsync.catalog", source, query = %query, error = %err, "source_lookup_failed");
            crate::metrics::inc_source_lookup(source, 0, true);
            Err(err)
        }
        Err(err) => {
            warn!(target = "tcgsync.catalog", source, query = %query, error = %err, "source_unavailable_degraded");
            crate::metrics::inc_source_lookup(source, 0, true);
            Ok(Vec::new())
        }
    }
}

/// Lowercased alphanumeric words separated by single spaces. Apostrophes
/// are dropped so "Urza's" and "Urzas" compare equal.
pub fn normalize_name(name: &str) -> String {
    name.to_lowercase()
        .chars()
        .filter(|c| !matches!(c, '\'' | '’'))
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Similarity in `[0, 1]` between a query and a catalog name. Multi-face
/// names ("Front // Back") also score against each face.
pub fn name_similarity(query: &str, canonical: &str) -> f64 {
    let query = normalize_name(query);
    std::iter::once(canonical)
        .chain(canonical.split("//"))
        .map(normalize_name)
        .map(|face| {
            if face == query {
                1.0
            } else {
                strsim::jaro_winkler(&query, &face)
            }
        })
        .fold(0.0, f64::max)
}

pub fn score_name(query: &str, canonical: &str) -> (f64, Confidence) {
    let similarity = name_similarity(query, canonical);
    let confidence = if similarity >= 1.0 {
        Confidence::Exact
    } else if similarity >= 0.95 {
        Confidence::High
    } else if similarity >= 0.85 {
        Confidence::Medium
    } else {
        Confidence::Low
    };
    (similarity, confidence)
}

/// Orders candidates by similarity to `query`, descending; on equal scores
/// a case-insensitive exact name comes first. The sort is stable, so the
/// source's own order decides any remaining ties.
pub fn rank_candidates(query: &str, candidates: Vec<CatalogCandidate>) -> Vec<CatalogCandidate> {
    let query_trimmed = query.trim();
    let mut scored: Vec<(f64, bool, CatalogCandidate)> = candidates
        .into_iter()
        .map(|c| {
            let similarity = name_similarity(query, &c.canonical_name);
            let exact = c.canonical_name.trim().eq_ignore_ascii_case(query_trimmed);
            (similarity, exact, c)
        })
        .collect();
    scored.sort_by(|a, b| {
        b.0.partial_cmp(&a.0)
            .unwrap_or(Ordering::Equal)
            .then_with(|| b.1.cmp(&a.1))
    });
    scored.into_iter().map(|(_, _, c)| c).collect()
}
