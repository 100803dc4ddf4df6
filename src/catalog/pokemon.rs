use crate::catalog::{CandidateSource, SourceError, score_name};
use crate::config::{POKEMON_TCG_API_KEY, POKEMON_TCG_API_URL};
use crate::http::build_client;
use crate::models::{CatalogCandidate, CatalogId, Condition, Money, SourceKind, VariantKey};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Client;
use serde::Deserialize;
use std::collections::BTreeMap;
use tracing::debug;

static TCGPLAYER_ID: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"tcgplayer/(\d+)").ok());

const PAGE_SIZE: &str = "50";

/// Secondary catalog API, used for cards the primary API does not carry.
pub struct PokemonTcgSource {
    http: Client,
    base_url: String,
    api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CardsResponse {
    #[serde(default)]
    data: Vec<PokemonCard>,
}

#[derive(Debug, Deserialize)]
struct PokemonCard {
    name: String,
    #[serde(default)]
    set: Option<PokemonSet>,
    #[serde(default)]
    tcgplayer: Option<TcgplayerBlock>,
}

#[derive(Debug, Deserialize)]
struct PokemonSet {
    name: String,
}

#[derive(Debug, Deserialize)]
struct TcgplayerBlock {
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    prices: BTreeMap<String, PriceBand>,
}

#[derive(Debug, Deserialize)]
struct PriceBand {
    #[serde(default)]
    market: Option<f64>,
}

impl PokemonTcgSource {
    pub fn new(base_url: &str, api_key: Option<String>) -> Self {
        Self {
            http: build_client(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.filter(|k| !k.trim().is_empty()),
        }
    }

    pub fn from_env() -> Self {
        Self::new(POKEMON_TCG_API_URL.as_str(), Some(POKEMON_TCG_API_KEY.clone()))
    }
}

#[async_trait]
impl CandidateSource for PokemonTcgSource {
    fn kind(&self) -> SourceKind {
        SourceKind::ApiSecondary
    }

    async fn lookup(&self, name: &str) -> Result<Vec<CatalogCandidate>, SourceError> {
        let query = format!("name:\"{}\"", name.trim().replace('"', ""));
        let mut request = self
            .http
            .get(format!("{}/v2/cards", self.base_url))
            .query(&[("q", query.as_str()), ("pageSize", PAGE_SIZE)]);
        if let Some(key) = &self.api_key {
            request = request.header("X-Api-Key", key);
        }
        let response = request
            .send()
            .await
            .map_err(|err| SourceError::Unavailable(err.to_string()))?;
        if !response.status().is_success() {
            return Err(SourceError::Unavailable(format!(
                "HTTP {}",
                response.status()
            )));
        }
        let body: CardsResponse = response
            .json()
            .await
            .map_err(|err| SourceError::Decode(err.to_string()))?;
        debug!(target = "tcgsync.catalog", source = "pokemontcg", query = %name, cards = body.data.len(), "search complete");
        Ok(body
            .data
            .iter()
            .flat_map(|card| candidates_from_card(name, card))
            .collect())
    }
}

fn catalog_id_from_url(url: &str) -> Option<CatalogId> {
    let pattern = TCGPLAYER_ID.as_ref()?;
    pattern
        .captures(url)
        .and_then(|c| c.get(1))
        .and_then(|m| CatalogId::parse(m.as_str()))
}

fn candidates_from_card(query: &str, card: &PokemonCard) -> Vec<CatalogCandidate> {
    let Some(tcgplayer) = &card.tcgplayer else {
        return Vec::new();
    };
    let Some(identifier) = tcgplayer.url.as_deref().and_then(catalog_id_from_url) else {
        return Vec::new();
    };
    let (_, confidence) = score_name(query, &card.name);

    // Price keys name the finishes the product is sold in.
    let mut finishes: BTreeMap<bool, Option<Money>> = BTreeMap::new();
    for (key, band) in &tcgplayer.prices {
        let foil = key.to_ascii_lowercase().contains("holofoil");
        if !foil && key != "normal" {
            continue;
        }
        let market = band.market.and_then(Money::from_decimal);
        let slot = finishes.entry(foil).or_insert(None);
        // The plain "holofoil" band is the reference for the foil product.
        if slot.is_none() || key == "holofoil" {
            *slot = market.or(*slot);
        }
    }

    finishes
        .into_iter()
        .flat_map(|(foil, price)| {
            Condition::GRADED
                .iter()
                .map(move |condition| (VariantKey::new(*condition, foil), price))
        })
        .map(|(variant, reference_price)| CatalogCandidate {
            identifier: identifier.clone(),
            canonical_name: card.name.clone(),
            variant,
            source: SourceKind::ApiSecondary,
            confidence,
            set_name: card.set.as_ref().map(|s| s.name.clone()),
            reference_price,
        })
        .collect()
}
