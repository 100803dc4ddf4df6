//! Deterministic collaborators for unit tests.

use crate::automation::{Automation, AutomationError};
use crate::catalog::{CandidateSource, SourceError};
use crate::models::{
    CatalogCandidate, CatalogId, Condition, Confidence, InventoryRow, Money, Operation,
    RemoteSnapshot, SnapshotEntry, SourceKind, VariantKey,
};
use crate::portal::{PortalSelectors, at_row};
use crate::store::{InventoryStore, StoreError};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{
    Arc, Mutex,
    atomic::{AtomicUsize, Ordering},
};

pub fn id(raw: &str) -> CatalogId {
    CatalogId::parse(raw).expect("non-empty id")
}

pub fn nm() -> VariantKey {
    VariantKey::new(Condition::NearMint, false)
}

pub fn nm_foil() -> VariantKey {
    VariantKey::new(Condition::NearMint, true)
}

pub fn row(line: usize, identifier: &str, name: &str, variant: &str, quantity: u32) -> InventoryRow {
    InventoryRow {
        line,
        identifier: CatalogId::parse(identifier),
        name: name.to_string(),
        variant_text: variant.to_string(),
        set_name: None,
        scryfall_id: None,
        quantity,
        price: None,
    }
}

pub fn priced(mut row: InventoryRow, price: &str) -> InventoryRow {
    row.price = Money::parse(price);
    row
}

pub fn candidate(identifier: &str, name: &str, variant: VariantKey) -> CatalogCandidate {
    CatalogCandidate {
        identifier: id(identifier),
        canonical_name: name.to_string(),
        variant,
        source: SourceKind::ApiPrimary,
        confidence: Confidence::Exact,
        set_name: None,
        reference_price: None,
    }
}

pub fn stocked(quantity: u32, price: Option<&str>) -> SnapshotEntry {
    SnapshotEntry {
        quantity,
        price: price.and_then(Money::parse),
        market_price: None,
    }
}

/// Candidate source returning a fixed answer and counting calls.
pub struct ScriptedSource {
    kind: SourceKind,
    answer: Result<Vec<CatalogCandidate>, String>,
    printings: HashMap<String, Vec<CatalogCandidate>>,
    calls: Arc<AtomicUsize>,
}

impl ScriptedSource {
    pub fn new(kind: SourceKind, candidates: Vec<CatalogCandidate>) -> Self {
        let candidates = candidates
            .into_iter()
            .map(|c| CatalogCandidate { source: kind, ..c })
            .collect();
        Self {
            kind,
            answer: Ok(candidates),
            printings: HashMap::new(),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn failing(kind: SourceKind) -> Self {
        Self {
            kind,
            answer: Err("connection refused".into()),
            printings: HashMap::new(),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Serve `candidates` for a printing id lookup.
    pub fn with_printing(mut self, printing: &str, candidates: Vec<CatalogCandidate>) -> Self {
        let kind = self.kind;
        let candidates = candidates
            .into_iter()
            .map(|c| CatalogCandidate { source: kind, ..c })
            .collect();
        self.printings.insert(printing.to_string(), candidates);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Shared call counter that outlives the boxed source.
    pub fn counter(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }
}

#[async_trait]
impl CandidateSource for ScriptedSource {
    fn kind(&self) -> SourceKind {
        self.kind
    }

    async fn lookup(&self, _name: &str) -> Result<Vec<CatalogCandidate>, SourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.answer.clone().map_err(SourceError::Unavailable)
    }

    async fn lookup_printing(&self, printing: &str) -> Result<Vec<CatalogCandidate>, SourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.answer.as_ref().map_err(|e| SourceError::Unavailable(e.clone()))?;
        Ok(self.printings.get(printing).cloned().unwrap_or_default())
    }
}

#[derive(Debug, Clone, Default)]
struct Element {
    text: String,
    attributes: HashMap<String, String>,
}

#[derive(Default)]
struct Dom {
    current_url: String,
    pages: HashMap<String, HashMap<String, Element>>,
    global: HashMap<String, Element>,
    fields: HashMap<String, String>,
    clicks: Vec<String>,
    navigations: Vec<String>,
    failing_urls: Vec<(String, AutomationError)>,
    click_failures: VecDeque<AutomationError>,
    session_lost: bool,
}

impl Dom {
    fn element_mut(&mut self, selector: &str) -> Option<&mut Element> {
        let url = self.current_url.clone();
        if self
            .pages
            .get(&url)
            .is_some_and(|page| page.contains_key(selector))
        {
            return self.pages.get_mut(&url).and_then(|p| p.get_mut(selector));
        }
        self.global.get_mut(selector)
    }

    fn guard(&self) -> Result<(), AutomationError> {
        if self.session_lost {
            Err(AutomationError::SessionLost("redirected to /login".into()))
        } else {
            Ok(())
        }
    }
}

/// In-memory portal: per-URL element tables plus page-independent elements.
#[derive(Default)]
pub struct FakeAutomation {
    dom: Mutex<Dom>,
}

impl FakeAutomation {
    fn dom(&self) -> std::sync::MutexGuard<'_, Dom> {
        self.dom.lock().expect("dom lock")
    }

    /// Registers a product manage page laid out with the default selectors.
    /// Rows are `(label, quantity, price, market price)`.
    pub fn manage_page(&self, base: &str, id: &str, name: &str, rows: &[(&str, &str, &str, &str)]) {
        let s = PortalSelectors::default();
        let url = format!(
            "{}{}",
            base.trim_end_matches('/'),
            s.manage_path.replace("{id}", id)
        );
        let mut page = HashMap::new();
        let text = |t: &str| Element {
            text: t.to_string(),
            ..Element::default()
        };
        page.insert(s.product_name.clone(), text(name));
        page.insert(s.save_button.clone(), text("Save"));
        for (index, (label, quantity, price, market)) in rows.iter().enumerate() {
            let n = index + 1;
            page.insert(at_row(&s.variant_label, n), text(label));
            page.insert(at_row(&s.quantity_input, n), text(quantity));
            page.insert(at_row(&s.price_input, n), text(price));
            page.insert(at_row(&s.market_price, n), text(market));
        }
        self.dom().pages.insert(url, page);
    }

    /// Registers the catalog search form and its result links.
    pub fn search_results(&self, rows: &[(&str, &str)]) {
        let s = PortalSelectors::default();
        let mut dom = self.dom();
        dom.global.insert(s.search_input.clone(), Element::default());
        dom.global.insert(s.search_button.clone(), Element::default());
        for (index, (href, name)) in rows.iter().enumerate() {
            let mut link = Element {
                text: name.to_string(),
                ..Element::default()
            };
            link.attributes.insert("href".into(), href.to_string());
            dom.global.insert(at_row(&s.search_result_link, index + 1), link);
        }
    }

    /// Every navigation to a URL containing `fragment` fails with `error`.
    pub fn fail_navigation(&self, fragment: &str, error: AutomationError) {
        self.dom().failing_urls.push((fragment.to_string(), error));
    }

    /// The next clicks fail with the queued errors, in order.
    pub fn fail_clicks(&self, errors: impl IntoIterator<Item = AutomationError>) {
        self.dom().click_failures.extend(errors);
    }

    pub fn lose_session(&self) {
        self.dom().session_lost = true;
    }

    pub fn fields(&self) -> HashMap<String, String> {
        self.dom().fields.clone()
    }

    pub fn clicks(&self) -> Vec<String> {
        self.dom().clicks.clone()
    }

    pub fn navigations(&self) -> Vec<String> {
        self.dom().navigations.clone()
    }

    pub fn element_text(&self, url: &str, selector: &str) -> Option<String> {
        self.dom()
            .pages
            .get(url)
            .and_then(|p| p.get(selector))
            .map(|e| e.text.clone())
    }
}

#[async_trait]
impl Automation for FakeAutomation {
    async fn navigate(&self, url: &str) -> Result<(), AutomationError> {
        let mut dom = self.dom();
        dom.guard()?;
        dom.navigations.push(url.to_string());
        if let Some((_, err)) = dom.failing_urls.iter().find(|(f, _)| url.contains(f.as_str())) {
            return Err(err.clone());
        }
        dom.current_url = url.to_string();
        Ok(())
    }

    async fn read_field(&self, selector: &str) -> Result<Option<String>, AutomationError> {
        let mut dom = self.dom();
        dom.guard()?;
        Ok(dom.element_mut(selector).map(|e| e.text.trim().to_string()))
    }

    async fn read_attribute(
        &self,
        selector: &str,
        attribute: &str,
    ) -> Result<Option<String>, AutomationError> {
        let mut dom = self.dom();
        dom.guard()?;
        Ok(dom
            .element_mut(selector)
            .and_then(|e| e.attributes.get(attribute).cloned()))
    }

    async fn set_field(&self, selector: &str, value: &str) -> Result<(), AutomationError> {
        let mut dom = self.dom();
        dom.guard()?;
        let element = dom
            .element_mut(selector)
            .ok_or_else(|| AutomationError::MissingElement(selector.to_string()))?;
        element.text = value.to_string();
        dom.fields.insert(selector.to_string(), value.to_string());
        Ok(())
    }

    async fn click(&self, selector: &str) -> Result<(), AutomationError> {
        let mut dom = self.dom();
        dom.guard()?;
        if dom.element_mut(selector).is_none() {
            return Err(AutomationError::MissingElement(selector.to_string()));
        }
        if let Some(err) = dom.click_failures.pop_front() {
            return Err(err);
        }
        dom.clicks.push(selector.to_string());
        Ok(())
    }

    async fn current_url(&self) -> Result<String, AutomationError> {
        let dom = self.dom();
        dom.guard()?;
        Ok(dom.current_url.clone())
    }
}

#[derive(Default)]
struct StoreState {
    snapshot: RemoteSnapshot,
    unreadable: BTreeSet<CatalogId>,
    failures: HashMap<CatalogId, VecDeque<StoreError>>,
    applied: Vec<Operation>,
    attempts: usize,
    snapshot_reads: Vec<Vec<CatalogId>>,
}

/// Inventory store backed by a snapshot it keeps up to date as operations
/// succeed.
#[derive(Default)]
pub struct RecordingStore {
    state: Mutex<StoreState>,
}

impl RecordingStore {
    pub fn new(snapshot: RemoteSnapshot) -> Self {
        Self {
            state: Mutex::new(StoreState {
                snapshot,
                ..StoreState::default()
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, StoreState> {
        self.state.lock().expect("store lock")
    }

    pub fn unreadable(&self, raw: &str) {
        self.state().unreadable.insert(id(raw));
    }

    /// Queues failures returned by the next applies against `raw`.
    pub fn fail(&self, raw: &str, errors: impl IntoIterator<Item = StoreError>) {
        self.state()
            .failures
            .entry(id(raw))
            .or_default()
            .extend(errors);
    }

    pub fn applied(&self) -> Vec<Operation> {
        self.state().applied.clone()
    }

    pub fn attempts(&self) -> usize {
        self.state().attempts
    }

    pub fn snapshot_reads(&self) -> Vec<Vec<CatalogId>> {
        self.state().snapshot_reads.clone()
    }

    pub fn current(&self) -> RemoteSnapshot {
        self.state().snapshot.clone()
    }
}

#[async_trait]
impl InventoryStore for RecordingStore {
    async fn snapshot(&self, ids: &[CatalogId]) -> Result<RemoteSnapshot, StoreError> {
        let mut state = self.state();
        state.snapshot_reads.push(ids.to_vec());
        let mut out = RemoteSnapshot::default();
        for id in ids {
            if state.unreadable.contains(id) {
                out.unavailable.insert(id.clone());
            } else if let Some(listing) = state.snapshot.products.get(id) {
                out.products.insert(id.clone(), listing.clone());
            }
        }
        Ok(out)
    }

    async fn apply(&self, op: &Operation) -> Result<(), StoreError> {
        let mut state = self.state();
        state.attempts += 1;
        if let Some(err) = state
            .failures
            .get_mut(&op.identifier)
            .and_then(VecDeque::pop_front)
        {
            return Err(err);
        }
        let quantity = op.kind.final_quantity();
        let listing = state
            .snapshot
            .products
            .entry(op.identifier.clone())
            .or_default();
        let previous = listing.entries.get(&op.variant).copied();
        let price = op
            .kind
            .final_price()
            .or_else(|| previous.and_then(|e| e.price));
        listing.offered.entry(op.variant).or_insert(None);
        if quantity > 0 {
            listing.entries.insert(
                op.variant,
                SnapshotEntry {
                    quantity,
                    price,
                    market_price: previous.and_then(|e| e.market_price),
                },
            );
        } else {
            listing.entries.remove(&op.variant);
        }
        state.applied.push(op.clone());
        Ok(())
    }
}
