use tracing::trace;

// Counters and timings are emitted as trace events; a subscriber can
// aggregate them without the engine depending on an exporter.

pub fn stage_elapsed(stage: &'static str, elapsed_ms: u128) {
    trace!(
        target = "tcgsync.metrics",
        stage = stage,
        elapsed_ms = elapsed_ms as u64,
        "stage_elapsed"
    );
}

pub fn inc_source_lookup(source: &'static str, candidates: usize, degraded: bool) {
    trace!(
        target = "tcgsync.metrics",
        source = source,
        candidates = candidates as u64,
        degraded = degraded,
        "source_lookups_total_inc"
    );
}

pub fn inc_outcome(kind: &'static str, outcome: &'static str) {
    trace!(
        target = "tcgsync.metrics",
        kind = kind,
        outcome = outcome,
        "outcomes_total_inc"
    );
}
