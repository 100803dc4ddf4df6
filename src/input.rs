use crate::models::{CatalogId, InventoryRow, Money};
use serde::Deserialize;
use std::path::Path;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum InputError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("malformed CSV: {0}")]
    Csv(#[from] csv::Error),
    #[error("line {line}: name is required when no product id or Scryfall ID is given")]
    MissingName { line: usize },
    #[error("line {line}: invalid quantity `{value}`")]
    Quantity { line: usize, value: String },
    #[error("line {line}: invalid price `{value}`")]
    Price { line: usize, value: String },
}

#[derive(Debug, Deserialize)]
struct RawRow {
    #[serde(rename = "Product ID", alias = "TCGPlayer ID", default)]
    product_id: Option<String>,
    #[serde(rename = "Name", default)]
    name: Option<String>,
    #[serde(rename = "Variant", alias = "Condition", default)]
    variant: Option<String>,
    #[serde(rename = "Qty", alias = "Quantity", default)]
    quantity: Option<String>,
    #[serde(rename = "Price", default)]
    price: Option<String>,
    #[serde(rename = "Set", default)]
    set: Option<String>,
    #[serde(rename = "Scryfall ID", default)]
    scryfall_id: Option<String>,
}

pub async fn read_rows(path: &Path) -> Result<Vec<InventoryRow>, InputError> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| InputError::Read {
            path: path.display().to_string(),
            source,
        })?;
    let rows = parse_rows(&raw)?;
    debug!(target = "tcgsync.cli", path = %path.display(), rows = rows.len(), "input read");
    Ok(rows)
}

pub fn parse_rows(raw: &str) -> Result<Vec<InventoryRow>, InputError> {
    let raw = raw.trim_start_matches('\u{feff}');
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(raw.as_bytes());
    let headers = reader.headers()?.clone();
    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        let line = record
            .position()
            .map(|p| p.line() as usize)
            .unwrap_or(rows.len() + 2);
        if record.iter().all(str::is_empty) {
            continue;
        }
        let raw: RawRow = record.deserialize(Some(&headers))?;
        rows.push(into_row(line, raw)?);
    }
    Ok(rows)
}

fn into_row(line: usize, raw: RawRow) -> Result<InventoryRow, InputError> {
    let identifier = raw.product_id.as_deref().and_then(CatalogId::parse);
    let name = raw.name.unwrap_or_default().trim().to_string();
    let scryfall_id = raw
        .scryfall_id
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());
    if name.is_empty() && identifier.is_none() && scryfall_id.is_none() {
        return Err(InputError::MissingName { line });
    }
    let quantity = match raw.quantity.as_deref().map(str::trim) {
        None | Some("") => 0,
        Some(value) => value.parse::<u32>().map_err(|_| InputError::Quantity {
            line,
            value: value.to_string(),
        })?,
    };
    let price = match raw.price.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(value) => Some(Money::parse(value).ok_or_else(|| InputError::Price {
            line,
            value: value.to_string(),
        })?),
    };
    Ok(InventoryRow {
        line,
        identifier,
        name,
        variant_text: raw.variant.unwrap_or_default(),
        set_name: raw.set.filter(|s| !s.trim().is_empty()),
        scryfall_id,
        quantity,
        price,
    })
}
