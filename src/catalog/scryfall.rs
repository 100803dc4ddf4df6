use crate::catalog::{CandidateSource, SourceError, score_name};
use crate::config::SCRYFALL_API_URL;
use crate::http::build_client;
use crate::models::{CatalogCandidate, CatalogId, Condition, Money, SourceKind, VariantKey};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::debug;

const MAX_PAGES: usize = 4;

/// Primary catalog API: exact-name search across every printing, plus
/// direct lookup of one printing by its Scryfall id.
pub struct ScryfallSource {
    http: Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct SearchPage {
    #[serde(default)]
    data: Vec<ScryfallCard>,
    #[serde(default)]
    has_more: bool,
    #[serde(default)]
    next_page: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct ScryfallCard {
    name: String,
    #[serde(default)]
    set_name: Option<String>,
    #[serde(default)]
    finishes: Vec<String>,
    #[serde(default)]
    tcgplayer_id: Option<u64>,
    #[serde(default)]
    tcgplayer_etched_id: Option<u64>,
    #[serde(default)]
    prices: ScryfallPrices,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ScryfallPrices {
    #[serde(default)]
    usd: Option<String>,
    #[serde(default)]
    usd_foil: Option<String>,
    #[serde(default)]
    usd_etched: Option<String>,
}

impl ScryfallSource {
    pub fn new(base_url: &str) -> Self {
        Self {
            http: build_client(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn from_env() -> Self {
        Self::new(SCRYFALL_API_URL.as_str())
    }

    async fn fetch_page(&self, url: &str, query: Option<&str>) -> Result<SearchPage, SourceError> {
        let mut request = self.http.get(url);
        if let Some(q) = query {
            request = request.query(&[("q", q), ("unique", "prints"), ("order", "released")]);
        }
        let response = request
            .send()
            .await
            .map_err(|err| SourceError::Unavailable(err.to_string()))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(SearchPage {
                data: Vec::new(),
                has_more: false,
                next_page: None,
            });
        }
        if !response.status().is_success() {
            return Err(SourceError::Unavailable(format!(
                "HTTP {}",
                response.status()
            )));
        }
        response
            .json::<SearchPage>()
            .await
            .map_err(|err| SourceError::Decode(err.to_string()))
    }

    async fn fetch_card(&self, printing: &str) -> Result<Option<ScryfallCard>, SourceError> {
        let url = format!(
            "{}/cards/{}",
            self.base_url,
            urlencoding::encode(printing.trim())
        );
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|err| SourceError::Unavailable(err.to_string()))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(SourceError::Unavailable(format!(
                "HTTP {}",
                response.status()
            )));
        }
        response
            .json::<ScryfallCard>()
            .await
            .map(Some)
            .map_err(|err| SourceError::Decode(err.to_string()))
    }
}

#[async_trait]
impl CandidateSource for ScryfallSource {
    fn kind(&self) -> SourceKind {
        SourceKind::ApiPrimary
    }

    async fn lookup(&self, name: &str) -> Result<Vec<CatalogCandidate>, SourceError> {
        let query = format!("!\"{}\"", name.trim().replace('"', ""));
        let first_url = format!("{}/cards/search", self.base_url);
        let mut page = self.fetch_page(&first_url, Some(&query)).await?;
        let mut cards = std::mem::take(&mut page.data);
        let mut pages = 1;
        while page.has_more && pages < MAX_PAGES {
            let Some(next) = page.next_page.take() else {
                break;
            };
            page = self.fetch_page(&next, None).await?;
            cards.append(&mut page.data);
            pages += 1;
        }
        debug!(target = "tcgsync.catalog", source = "scryfall", query = %name, printings = cards.len(), "search complete");
        Ok(cards
            .iter()
            .flat_map(|card| candidates_from_card(name, card))
            .collect())
    }

    async fn lookup_printing(&self, printing: &str) -> Result<Vec<CatalogCandidate>, SourceError> {
        let Some(card) = self.fetch_card(printing).await? else {
            debug!(target = "tcgsync.catalog", source = "scryfall", printing, "printing not found");
            return Ok(Vec::new());
        };
        Ok(candidates_from_card(&card.name, &card))
    }
}

/// Catalog products list every condition; each finish the printing is
/// sold in becomes its own set of candidates.
fn candidates_from_card(query: &str, card: &ScryfallCard) -> Vec<CatalogCandidate> {
    let (_, confidence) = score_name(query, &card.name);
    let mut finishes: Vec<(CatalogId, bool, Option<Money>)> = Vec::new();
    for finish in &card.finishes {
        let entry = match finish.as_str() {
            "nonfoil" => card
                .tcgplayer_id
                .map(|id| (id, false, card.prices.usd.as_deref())),
            "foil" => card
                .tcgplayer_id
                .map(|id| (id, true, card.prices.usd_foil.as_deref())),
            "etched" => card
                .tcgplayer_etched_id
                .map(|id| (id, true, card.prices.usd_etched.as_deref())),
            _ => None,
        };
        if let Some((id, foil, price)) = entry
            && let Some(id) = CatalogId::parse(&id.to_string())
        {
            finishes.push((id, foil, price.and_then(Money::parse)));
        }
    }
    finishes
        .into_iter()
        .flat_map(|(id, foil, price)| {
            Condition::GRADED.iter().map(move |condition| (id.clone(), foil, price, *condition))
        })
        .map(|(identifier, foil, reference_price, condition)| CatalogCandidate {
            identifier,
            canonical_name: card.name.clone(),
            variant: VariantKey::new(condition, foil),
            source: SourceKind::ApiPrimary,
            confidence,
            set_name: card.set_name.clone(),
            reference_price,
        })
        .collect()
}
