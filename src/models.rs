use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    cmp::Ordering,
    collections::{BTreeMap, BTreeSet},
    fmt,
};

/// Stable key of one product listing in the remote catalog.
///
/// Ordering is numeric when both sides are all digits (the seller portal's
/// product ids), lexicographic otherwise. Resume boundaries rely on it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CatalogId(String);

impl CatalogId {
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self(trimmed.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn numeric(&self) -> Option<&str> {
        if self.0.bytes().all(|b| b.is_ascii_digit()) {
            Some(self.0.trim_start_matches('0'))
        } else {
            None
        }
    }
}

impl Ord for CatalogId {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.numeric(), other.numeric()) {
            (Some(a), Some(b)) => a.len().cmp(&b.len()).then_with(|| a.cmp(b)),
            _ => self.0.cmp(&other.0),
        }
        .then_with(|| self.0.cmp(&other.0))
    }
}

impl PartialOrd for CatalogId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for CatalogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Amount in cents. Seller prices never need sub-cent precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Money(i64);

impl Money {
    pub fn from_cents(cents: i64) -> Self {
        Self(cents)
    }

    pub fn cents(&self) -> i64 {
        self.0
    }

    /// Accepts `12`, `12.5`, `$1,234.56` and surrounding whitespace.
    pub fn parse(raw: &str) -> Option<Self> {
        let cleaned: String = raw
            .trim()
            .chars()
            .filter(|c| !matches!(c, '$' | ',' | ' '))
            .collect();
        if cleaned.is_empty() {
            return None;
        }
        let (negative, digits) = match cleaned.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, cleaned.as_str()),
        };
        let (whole, frac) = match digits.split_once('.') {
            Some((w, f)) => (w, f),
            None => (digits, ""),
        };
        if whole.is_empty() && frac.is_empty() {
            return None;
        }
        if !whole.bytes().all(|b| b.is_ascii_digit()) || !frac.bytes().all(|b| b.is_ascii_digit())
        {
            return None;
        }
        if frac.len() > 2 {
            return None;
        }
        let whole_cents = if whole.is_empty() {
            0
        } else {
            whole.parse::<i64>().ok()?.checked_mul(100)?
        };
        let frac_cents = match frac.len() {
            0 => 0,
            1 => frac.parse::<i64>().ok()? * 10,
            _ => frac.parse::<i64>().ok()?,
        };
        let total = whole_cents.checked_add(frac_cents)?;
        Some(Self(if negative { -total } else { total }))
    }

    /// Converts a decimal price reported by a catalog API.
    pub fn from_decimal(value: f64) -> Option<Self> {
        if value.is_finite() {
            Some(Self((value * 100.0).round() as i64))
        } else {
            None
        }
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{sign}{}.{:02}", abs / 100, abs % 100)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    NearMint,
    LightlyPlayed,
    ModeratelyPlayed,
    HeavilyPlayed,
    Damaged,
    Unknown,
}

impl Condition {
    pub const GRADED: [Condition; 5] = [
        Condition::NearMint,
        Condition::LightlyPlayed,
        Condition::ModeratelyPlayed,
        Condition::HeavilyPlayed,
        Condition::Damaged,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            Condition::NearMint => "Near Mint",
            Condition::LightlyPlayed => "Lightly Played",
            Condition::ModeratelyPlayed => "Moderately Played",
            Condition::HeavilyPlayed => "Heavily Played",
            Condition::Damaged => "Damaged",
            Condition::Unknown => "Unknown",
        }
    }
}

/// Condition plus finish; the unit the remote store lists quantities under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VariantKey {
    pub condition: Condition,
    pub foil: bool,
}

impl VariantKey {
    pub fn new(condition: Condition, foil: bool) -> Self {
        Self { condition, foil }
    }

    /// Canonical label, identical to the portal's variant row text.
    pub fn label(&self) -> String {
        if self.foil {
            format!("{} Foil", self.condition.label())
        } else {
            self.condition.label().to_string()
        }
    }
}

impl fmt::Display for VariantKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

/// One desired-state line as entered by the operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InventoryRow {
    /// Line in the source file; the header is line 1.
    pub line: usize,
    pub identifier: Option<CatalogId>,
    pub name: String,
    pub variant_text: String,
    pub set_name: Option<String>,
    /// Printing id in the primary catalog, when the export carries one.
    pub scryfall_id: Option<String>,
    pub quantity: u32,
    pub price: Option<Money>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    ApiPrimary,
    ApiSecondary,
    PortalSearch,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::ApiPrimary => "api_primary",
            SourceKind::ApiSecondary => "api_secondary",
            SourceKind::PortalSearch => "portal_search",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    Low,
    Medium,
    High,
    Exact,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogCandidate {
    pub identifier: CatalogId,
    pub canonical_name: String,
    pub variant: VariantKey,
    pub source: SourceKind,
    pub confidence: Confidence,
    pub set_name: Option<String>,
    pub reference_price: Option<Money>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Provenance {
    PreSupplied,
    Matched {
        source: SourceKind,
        canonical_name: String,
        confidence: Confidence,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum UnresolvedReason {
    NotFound,
    Ambiguous {
        candidates: Vec<CatalogId>,
    },
    VariantMismatch {
        identifier: CatalogId,
        offered: Vec<String>,
    },
    SnapshotUnavailable {
        identifier: CatalogId,
    },
}

impl UnresolvedReason {
    pub fn code(&self) -> &'static str {
        match self {
            UnresolvedReason::NotFound => "not_found",
            UnresolvedReason::Ambiguous { .. } => "ambiguous",
            UnresolvedReason::VariantMismatch { .. } => "variant_mismatch",
            UnresolvedReason::SnapshotUnavailable { .. } => "snapshot_unavailable",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ResolutionOutcome {
    Resolved {
        identifier: CatalogId,
        provenance: Provenance,
    },
    Unresolved {
        #[serde(flatten)]
        reason: UnresolvedReason,
    },
}

/// A row after resolution: exactly one identifier, or a terminal reason.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedRow {
    pub row: InventoryRow,
    pub variant: VariantKey,
    pub outcome: ResolutionOutcome,
}

impl ResolvedRow {
    pub fn identifier(&self) -> Option<&CatalogId> {
        match &self.outcome {
            ResolutionOutcome::Resolved { identifier, .. } => Some(identifier),
            ResolutionOutcome::Unresolved { .. } => None,
        }
    }

    pub fn unresolved(&self) -> Option<&UnresolvedReason> {
        match &self.outcome {
            ResolutionOutcome::Unresolved { reason } => Some(reason),
            ResolutionOutcome::Resolved { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SnapshotEntry {
    pub quantity: u32,
    pub price: Option<Money>,
    pub market_price: Option<Money>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProductListing {
    pub name: Option<String>,
    /// Every variant row the product page shows, listed or not.
    pub offered: BTreeMap<VariantKey, Option<Money>>,
    /// Variants currently carrying stock.
    pub entries: BTreeMap<VariantKey, SnapshotEntry>,
}

/// Point-in-time read of remote inventory, keyed by product then variant.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RemoteSnapshot {
    pub products: BTreeMap<CatalogId, ProductListing>,
    pub unavailable: BTreeSet<CatalogId>,
}

impl RemoteSnapshot {
    pub fn entry(&self, id: &CatalogId, variant: &VariantKey) -> Option<&SnapshotEntry> {
        self.products.get(id).and_then(|p| p.entries.get(variant))
    }

    pub fn listing(&self, id: &CatalogId) -> Option<&ProductListing> {
        self.products.get(id)
    }

    pub fn contains(&self, id: &CatalogId) -> bool {
        self.products.contains_key(id) || self.unavailable.contains(id)
    }

    /// Market price for a variant, whether or not it is currently stocked.
    pub fn market_price(&self, id: &CatalogId, variant: &VariantKey) -> Option<Money> {
        let listing = self.products.get(id)?;
        listing
            .entries
            .get(variant)
            .and_then(|e| e.market_price)
            .or_else(|| listing.offered.get(variant).copied().flatten())
    }

    pub fn merge(&mut self, other: RemoteSnapshot) {
        for (id, listing) in other.products {
            self.unavailable.remove(&id);
            self.products.insert(id, listing);
        }
        for id in other.unavailable {
            if !self.products.contains_key(&id) {
                self.unavailable.insert(id);
            }
        }
    }

    #[cfg(test)]
    pub fn with_entry(mut self, id: &str, variant: VariantKey, entry: SnapshotEntry) -> Self {
        let Some(id) = CatalogId::parse(id) else {
            return self;
        };
        let listing = self.products.entry(id).or_default();
        listing.offered.insert(variant, entry.market_price);
        listing.entries.insert(variant, entry);
        self
    }

    #[cfg(test)]
    pub fn with_offered(mut self, id: &str, variant: VariantKey) -> Self {
        let Some(id) = CatalogId::parse(id) else {
            return self;
        };
        self.products
            .entry(id)
            .or_default()
            .offered
            .entry(variant)
            .or_insert(None);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PriceChange {
    pub old: Option<Money>,
    pub new: Money,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum OperationKind {
    Create {
        quantity: u32,
        price: Option<Money>,
    },
    UpdateQuantity {
        old: u32,
        new: u32,
        price: Option<PriceChange>,
    },
    UpdatePrice {
        quantity: u32,
        change: PriceChange,
    },
    NoOp {
        quantity: u32,
        price: Option<Money>,
    },
}

impl OperationKind {
    pub fn name(&self) -> &'static str {
        match self {
            OperationKind::Create { .. } => "create",
            OperationKind::UpdateQuantity { .. } => "update_quantity",
            OperationKind::UpdatePrice { .. } => "update_price",
            OperationKind::NoOp { .. } => "no_op",
        }
    }

    pub fn is_noop(&self) -> bool {
        matches!(self, OperationKind::NoOp { .. })
    }

    /// Quantity the listing holds once this operation has been applied.
    pub fn final_quantity(&self) -> u32 {
        match self {
            OperationKind::Create { quantity, .. }
            | OperationKind::UpdatePrice { quantity, .. }
            | OperationKind::NoOp { quantity, .. } => *quantity,
            OperationKind::UpdateQuantity { new, .. } => *new,
        }
    }

    /// Price the listing holds once applied, when one is known.
    pub fn final_price(&self) -> Option<Money> {
        match self {
            OperationKind::Create { price, .. } | OperationKind::NoOp { price, .. } => *price,
            OperationKind::UpdateQuantity { price, .. } => price.map(|p| p.new),
            OperationKind::UpdatePrice { change, .. } => Some(change.new),
        }
    }
}

/// One planned change against a single `(identifier, variant)` key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Operation {
    pub identifier: CatalogId,
    pub variant: VariantKey,
    pub name: String,
    /// Input lines merged into this operation.
    pub lines: Vec<usize>,
    #[serde(flatten)]
    pub kind: OperationKind,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    #[default]
    DryRun,
    Live,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::DryRun => "dry_run",
            Mode::Live => "live",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StageReport {
    pub name: String,
    pub elapsed_ms: u128,
    pub timestamp: DateTime<Utc>,
    pub output: Value,
}

impl StageReport {
    pub fn new(name: &str, elapsed_ms: u128, output: Value) -> Self {
        Self {
            name: name.to_string(),
            elapsed_ms,
            timestamp: Utc::now(),
            output,
        }
    }
}
