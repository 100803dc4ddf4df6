use crate::automation::AutomationError;
use crate::catalog::{CandidateSource, SourceError, score_name};
use crate::models::{CatalogCandidate, SourceKind};
use crate::portal::Portal;
use async_trait::async_trait;
use tracing::{debug, warn};

const MAX_HITS_PER_LOOKUP: usize = 5;

/// Last resort: the seller portal's own admin catalog search.
pub struct PortalSearchSource {
    portal: Portal,
}

impl PortalSearchSource {
    pub fn new(portal: Portal) -> Self {
        Self { portal }
    }
}

fn source_error(err: AutomationError) -> SourceError {
    match err {
        AutomationError::SessionLost(message) => SourceError::SessionLost(message),
        other => SourceError::Unavailable(other.to_string()),
    }
}

#[async_trait]
impl CandidateSource for PortalSearchSource {
    fn kind(&self) -> SourceKind {
        SourceKind::PortalSearch
    }

    async fn lookup(&self, name: &str) -> Result<Vec<CatalogCandidate>, SourceError> {
        let hits = self.portal.search(name).await.map_err(source_error)?;
        debug!(target = "tcgsync.catalog", source = "portal", query = %name, hits = hits.len(), "search complete");
        let mut candidates = Vec::new();
        for hit in hits.into_iter().take(MAX_HITS_PER_LOOKUP) {
            let page = match self.portal.read_manage_page(&hit.id).await {
                Ok(page) => page,
                Err(err @ AutomationError::SessionLost(_)) => return Err(source_error(err)),
                Err(err) => {
                    warn!(target = "tcgsync.catalog", source = "portal", product_id = %hit.id, error = %err, "search hit unreadable; skipped");
                    continue;
                }
            };
            let canonical_name = page
                .name
                .clone()
                .filter(|n| !n.is_empty())
                .unwrap_or(hit.name);
            let (_, confidence) = score_name(name, &canonical_name);
            for row in page.rows {
                candidates.push(CatalogCandidate {
                    identifier: hit.id.clone(),
                    canonical_name: canonical_name.clone(),
                    variant: row.variant,
                    source: SourceKind::PortalSearch,
                    confidence,
                    set_name: None,
                    reference_price: row.market_price,
                });
            }
        }
        Ok(candidates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Condition, Money, VariantKey};
    use crate::portal::PortalSelectors;
    use crate::testing::FakeAutomation;
    use std::sync::Arc;

    const BASE: &str = "https://portal.test";

    #[tokio::test]
    async fn hits_expand_into_variant_rows() {
        let ui = Arc::new(FakeAutomation::default());
        ui.search_results(&[("/admin/product/manage/777", "Sol Ring")]);
        ui.manage_page(
            BASE,
            "777",
            "Sol Ring",
            &[
                ("Near Mint", "0", "", "$1.50"),
                ("Near Mint Foil", "1", "$4.00", "$3.75"),
            ],
        );
        let source = PortalSearchSource::new(Portal::new(ui, BASE, PortalSelectors::default()));
        let found = source.find("Sol Ring").await.unwrap();
        assert_eq!(found.len(), 2);
        let foil = found
            .iter()
            .find(|c| c.variant == VariantKey::new(Condition::NearMint, true))
            .expect("foil candidate");
        assert_eq!(foil.identifier.as_str(), "777");
        assert_eq!(foil.reference_price, Some(Money::from_cents(375)));
        assert_eq!(foil.source, SourceKind::PortalSearch);
    }

    #[tokio::test]
    async fn unreadable_hit_is_skipped_and_the_rest_kept() {
        let ui = Arc::new(FakeAutomation::default());
        ui.search_results(&[
            ("/admin/product/manage/111", "Sol Ring (Oversized)"),
            ("/admin/product/manage/777", "Sol Ring"),
        ]);
        ui.fail_navigation(
            "/manage/111",
            AutomationError::Navigation("page crashed".into()),
        );
        ui.manage_page(BASE, "777", "Sol Ring", &[("Near Mint", "0", "", "$1.50")]);
        let source = PortalSearchSource::new(Portal::new(ui, BASE, PortalSelectors::default()));
        let found = source.find("Sol Ring").await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].identifier.as_str(), "777");
    }

    #[tokio::test]
    async fn lost_session_is_returned_not_swallowed() {
        let ui = Arc::new(FakeAutomation::default());
        ui.search_results(&[("/admin/product/manage/777", "Sol Ring")]);
        ui.lose_session();
        let source = PortalSearchSource::new(Portal::new(ui, BASE, PortalSelectors::default()));
        let err = source.find("Sol Ring").await.unwrap_err();
        assert!(matches!(err, SourceError::SessionLost(_)));
    }

    #[tokio::test]
    async fn session_lost_while_reading_a_hit_is_returned() {
        let ui = Arc::new(FakeAutomation::default());
        ui.search_results(&[("/admin/product/manage/777", "Sol Ring")]);
        ui.fail_navigation(
            "/manage/777",
            AutomationError::SessionLost("redirected to /login".into()),
        );
        let source = PortalSearchSource::new(Portal::new(ui, BASE, PortalSelectors::default()));
        let err = source.lookup("Sol Ring").await.unwrap_err();
        assert!(matches!(err, SourceError::SessionLost(_)));
    }
}
