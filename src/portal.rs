//! Seller-portal page model shared by the portal search source and the
//! portal-backed inventory store.

use crate::automation::{Automation, AutomationError};
use crate::models::{CatalogId, Money, VariantKey};
use crate::variant;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

static MANAGE_LINK: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"manage/(\d+)").ok());

/// CSS selectors for the portal pages. `{row}` is replaced with a 1-based
/// table row index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortalSelectors {
    pub manage_path: String,
    pub catalog_path: String,
    pub product_name: String,
    pub variant_label: String,
    pub quantity_input: String,
    pub price_input: String,
    pub market_price: String,
    pub save_button: String,
    pub search_input: String,
    pub search_button: String,
    pub search_result_link: String,
    pub max_rows: usize,
    pub max_search_results: usize,
}

impl Default for PortalSelectors {
    fn default() -> Self {
        Self {
            manage_path: "/admin/product/manage/{id}".into(),
            catalog_path: "/admin/product/catalog".into(),
            product_name: "span[data-bind='text: productName']".into(),
            variant_label: "table tbody tr:nth-child({row}) td:first-child".into(),
            quantity_input: "table tbody tr:nth-child({row}) td:last-child input[type='text']"
                .into(),
            price_input: "table tbody tr:nth-child({row}) input[data-bind*='textInput: newPrice']"
                .into(),
            market_price: "table tbody tr:nth-child({row}) td:nth-child(4)".into(),
            save_button: "input[value='Save'], button[type='submit']".into(),
            search_input: "input#ProductName".into(),
            search_button: "input#searchButton".into(),
            search_result_link: "table.sTable tbody tr:nth-child({row}) td a".into(),
            max_rows: 32,
            max_search_results: 10,
        }
    }
}

pub(crate) fn at_row(template: &str, row: usize) -> String {
    template.replace("{row}", &row.to_string())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariantRow {
    pub row: usize,
    pub label: String,
    pub variant: VariantKey,
    pub quantity: u32,
    pub price: Option<Money>,
    pub market_price: Option<Money>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagePage {
    pub id: CatalogId,
    pub name: Option<String>,
    pub rows: Vec<VariantRow>,
}

impl ManagePage {
    pub fn row_for(&self, variant: &VariantKey) -> Option<&VariantRow> {
        self.rows.iter().find(|r| &r.variant == variant)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchHit {
    pub id: CatalogId,
    pub name: String,
}

/// Handle on the single portal session.
#[derive(Clone)]
pub struct Portal {
    automation: Arc<dyn Automation>,
    base_url: String,
    selectors: PortalSelectors,
}

impl Portal {
    pub fn new(
        automation: Arc<dyn Automation>,
        base_url: &str,
        selectors: PortalSelectors,
    ) -> Self {
        Self {
            automation,
            base_url: base_url.trim_end_matches('/').to_string(),
            selectors,
        }
    }

    pub fn automation(&self) -> &dyn Automation {
        self.automation.as_ref()
    }

    pub fn manage_url(&self, id: &CatalogId) -> String {
        let path = self
            .selectors
            .manage_path
            .replace("{id}", &urlencoding::encode(id.as_str()));
        format!("{}{}", self.base_url, path)
    }

    pub fn catalog_url(&self) -> String {
        format!("{}{}", self.base_url, self.selectors.catalog_path)
    }

    pub async fn read_manage_page(&self, id: &CatalogId) -> Result<ManagePage, AutomationError> {
        let ui = self.automation();
        let s = &self.selectors;
        ui.navigate(&self.manage_url(id)).await?;
        let name = ui
            .read_field(&s.product_name)
            .await?
            .filter(|n| !n.is_empty());
        let mut rows = Vec::new();
        for row in 1..=s.max_rows {
            let Some(label) = ui.read_field(&at_row(&s.variant_label, row)).await? else {
                break;
            };
            if label.is_empty() {
                continue;
            }
            let quantity = ui
                .read_field(&at_row(&s.quantity_input, row))
                .await?
                .and_then(|q| q.trim().parse::<u32>().ok())
                .unwrap_or(0);
            let price = ui
                .read_field(&at_row(&s.price_input, row))
                .await?
                .and_then(|p| Money::parse(&p));
            let market_price = ui
                .read_field(&at_row(&s.market_price, row))
                .await?
                .and_then(|p| Money::parse(&p));
            rows.push(VariantRow {
                row,
                variant: variant::normalize(&label),
                label,
                quantity,
                price,
                market_price,
            });
        }
        debug!(target = "tcgsync.portal", product_id = %id, rows = rows.len(), "manage page read");
        Ok(ManagePage {
            id: id.clone(),
            name,
            rows,
        })
    }

    pub async fn search(&self, name: &str) -> Result<Vec<SearchHit>, AutomationError> {
        let ui = self.automation();
        let s = &self.selectors;
        ui.navigate(&self.catalog_url()).await?;
        ui.set_field(&s.search_input, name).await?;
        ui.submit(&s.search_button).await?;
        let mut hits = Vec::new();
        for row in 1..=s.max_search_results {
            let link = at_row(&s.search_result_link, row);
            let Some(href) = ui.read_attribute(&link, "href").await? else {
                break;
            };
            let Some(id) = product_id_from_href(&href) else {
                continue;
            };
            let title = ui.read_field(&link).await?.unwrap_or_default();
            if hits.iter().any(|h: &SearchHit| h.id == id) {
                continue;
            }
            hits.push(SearchHit { id, name: title });
        }
        Ok(hits)
    }

    /// Writes quantity and, when given, price into a variant row and saves.
    pub async fn write_row(
        &self,
        row: usize,
        quantity: Option<u32>,
        price: Option<Money>,
    ) -> Result<(), AutomationError> {
        let ui = self.automation();
        let s = &self.selectors;
        if let Some(quantity) = quantity {
            ui.set_field(&at_row(&s.quantity_input, row), &quantity.to_string())
                .await?;
        }
        if let Some(price) = price {
            ui.set_field(&at_row(&s.price_input, row), &price.to_string())
                .await?;
        }
        ui.submit(&s.save_button).await
    }
}

pub fn product_id_from_href(href: &str) -> Option<CatalogId> {
    let pattern = MANAGE_LINK.as_ref()?;
    pattern
        .captures(href)
        .and_then(|c| c.get(1))
        .and_then(|m| CatalogId::parse(m.as_str()))
}
