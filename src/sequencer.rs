//! Applies planned operations one at a time with checkpointing, bounded
//! retries and resume support.

use crate::checkpoint::Checkpoint;
use crate::config::RetryPolicy;
use crate::models::{CatalogId, Mode, Operation};
use crate::store::{InventoryStore, StoreError};
use serde::Serialize;
use serde_with::skip_serializing_none;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    pub mode: Mode,
    pub resume_from: Option<CatalogId>,
    pub retry: RetryPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum OperationOutcome {
    Applied { attempts: u32 },
    /// Dry run: the change that would have been applied.
    Planned,
    Unchanged,
    /// Before the resume boundary.
    Skipped,
    Failed { attempts: u32, error: String },
    /// The run halted before reaching this operation.
    NotAttempted,
}

impl OperationOutcome {
    pub fn name(&self) -> &'static str {
        match self {
            OperationOutcome::Applied { .. } => "applied",
            OperationOutcome::Planned => "planned",
            OperationOutcome::Unchanged => "unchanged",
            OperationOutcome::Skipped => "skipped",
            OperationOutcome::Failed { .. } => "failed",
            OperationOutcome::NotAttempted => "not_attempted",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperationRecord {
    pub operation: Operation,
    pub outcome: OperationOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum HaltReason {
    SessionLost { identifier: CatalogId, message: String },
    Cancelled { before: CatalogId },
    CheckpointFailed { identifier: CatalogId, message: String },
}

#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionReport {
    pub mode: Mode,
    pub resume_from: Option<CatalogId>,
    pub records: Vec<OperationRecord>,
    pub halted: Option<HaltReason>,
}

/// Execution order: planned order, stably grouped by ascending identifier so
/// that everything before a resume boundary is a prefix.
pub fn execution_order(mut operations: Vec<Operation>) -> Vec<Operation> {
    operations.sort_by(|a, b| a.identifier.cmp(&b.identifier));
    operations
}

pub async fn execute(
    operations: Vec<Operation>,
    options: &ExecuteOptions,
    store: &dyn InventoryStore,
    checkpoint: &dyn Checkpoint,
    stop: &watch::Receiver<bool>,
) -> ExecutionReport {
    let mut records = Vec::with_capacity(operations.len());
    let mut halted: Option<HaltReason> = None;

    for operation in execution_order(operations) {
        let outcome = if halted.is_some() {
            OperationOutcome::NotAttempted
        } else if options
            .resume_from
            .as_ref()
            .is_some_and(|from| &operation.identifier < from)
        {
            OperationOutcome::Skipped
        } else if *stop.borrow() {
            warn!(target = "tcgsync.execute", product_id = %operation.identifier, "stop requested; halting before next operation");
            halted = Some(HaltReason::Cancelled {
                before: operation.identifier.clone(),
            });
            OperationOutcome::NotAttempted
        } else {
            match options.mode {
                Mode::DryRun if operation.kind.is_noop() => OperationOutcome::Unchanged,
                Mode::DryRun => OperationOutcome::Planned,
                Mode::Live => {
                    let outcome = if operation.kind.is_noop() {
                        OperationOutcome::Unchanged
                    } else {
                        apply_with_retry(&operation, store, &options.retry, &mut halted).await
                    };
                    let completed = matches!(
                        outcome,
                        OperationOutcome::Applied { .. } | OperationOutcome::Unchanged
                    );
                    if completed && let Err(err) = checkpoint.record(&operation.identifier).await
                    {
                        error!(target = "tcgsync.execute", product_id = %operation.identifier, error = %err, "checkpoint_write_failed");
                        halted = Some(HaltReason::CheckpointFailed {
                            identifier: operation.identifier.clone(),
                            message: err.to_string(),
                        });
                    }
                    outcome
                }
            }
        };

        crate::metrics::inc_outcome("operation", outcome.name());
        info!(
            target = "tcgsync.execute",
            product_id = %operation.identifier,
            variant = %operation.variant,
            op = operation.kind.name(),
            outcome = outcome.name(),
            "operation processed"
        );
        records.push(OperationRecord { operation, outcome });
    }

    ExecutionReport {
        mode: options.mode,
        resume_from: options.resume_from.clone(),
        records,
        halted,
    }
}

async fn apply_with_retry(
    operation: &Operation,
    store: &dyn InventoryStore,
    retry: &RetryPolicy,
    halted: &mut Option<HaltReason>,
) -> OperationOutcome {
    let max_attempts = retry.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match store.apply(operation).await {
            Ok(()) => return OperationOutcome::Applied { attempts: attempt },
            Err(StoreError::SessionLost(message)) => {
                error!(target = "tcgsync.execute", product_id = %operation.identifier, attempt, error = %message, "session lost; aborting run");
                *halted = Some(HaltReason::SessionLost {
                    identifier: operation.identifier.clone(),
                    message: message.clone(),
                });
                return OperationOutcome::Failed {
                    attempts: attempt,
                    error: format!("session lost: {message}"),
                };
            }
            Err(err) if err.is_retryable() && attempt < max_attempts => {
                let delay = retry.delay_after(attempt);
                warn!(target = "tcgsync.execute", product_id = %operation.identifier, attempt, delay_ms = delay.as_millis() as u64, error = %err, "apply failed; retrying");
                sleep(delay).await;
            }
            Err(err) => {
                warn!(target = "tcgsync.execute", product_id = %operation.identifier, attempt, error = %err, "apply failed; giving up");
                return OperationOutcome::Failed {
                    attempts: attempt,
                    error: err.to_string(),
                };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::MemoryCheckpoint;
    use crate::models::{OperationKind, RemoteSnapshot};
    use crate::testing::{RecordingStore, id, nm, nm_foil};
    use async_trait::async_trait;

    fn op(identifier: &str, quantity: u32) -> Operation {
        Operation {
            identifier: id(identifier),
            variant: nm(),
            name: format!("Card {identifier}"),
            lines: vec![1],
            kind: OperationKind::Create {
                quantity,
                price: None,
            },
        }
    }

    fn noop(identifier: &str) -> Operation {
        Operation {
            kind: OperationKind::NoOp {
                quantity: 1,
                price: None,
            },
            ..op(identifier, 1)
        }
    }

    fn live() -> ExecuteOptions {
        ExecuteOptions {
            mode: Mode::Live,
            resume_from: None,
            retry: RetryPolicy::immediate(3),
        }
    }

    fn running() -> watch::Receiver<bool> {
        watch::channel(false).1
    }

    fn outcomes(report: &ExecutionReport) -> Vec<(&str, &str)> {
        report
            .records
            .iter()
            .map(|r| (r.operation.identifier.as_str(), r.outcome.name()))
            .collect()
    }

    #[tokio::test]
    async fn dry_run_never_touches_the_store() {
        let store = RecordingStore::default();
        let checkpoint = MemoryCheckpoint::default();
        let ops = vec![op("3", 1), noop("1"), op("2", 4)];
        let report = execute(
            ops,
            &ExecuteOptions::default(),
            &store,
            &checkpoint,
            &running(),
        )
        .await;
        assert_eq!(store.attempts(), 0);
        assert!(checkpoint.recorded().await.is_empty());
        assert_eq!(
            outcomes(&report),
            vec![("1", "unchanged"), ("2", "planned"), ("3", "planned")]
        );
        assert_eq!(report.mode, Mode::DryRun);
        assert!(report.halted.is_none());
    }

    #[tokio::test]
    async fn live_run_applies_in_identifier_order_and_checkpoints_each() {
        let store = RecordingStore::default();
        let checkpoint = MemoryCheckpoint::default();
        let mut foil = op("10", 1);
        foil.variant = nm_foil();
        let ops = vec![op("100", 1), op("10", 2), noop("20"), foil];
        let report = execute(ops, &live(), &store, &checkpoint, &running()).await;
        assert_eq!(
            outcomes(&report),
            vec![
                ("10", "applied"),
                ("10", "applied"),
                ("20", "unchanged"),
                ("100", "applied")
            ]
        );
        // Planned order is kept within one identifier.
        assert_eq!(report.records[0].operation.variant, nm());
        assert_eq!(
            checkpoint.recorded().await,
            vec![id("10"), id("10"), id("20"), id("100")]
        );
        assert_eq!(store.applied().len(), 3);
    }

    #[tokio::test]
    async fn resume_runs_the_tail_starting_at_the_boundary() {
        let ops = vec![op("5", 1), op("1", 1), op("3", 1), op("7", 1), op("3", 2)];
        let full = execution_order(ops.clone());
        let store = RecordingStore::default();
        let checkpoint = MemoryCheckpoint::default();
        let options = ExecuteOptions {
            resume_from: Some(id("3")),
            ..live()
        };
        let report = execute(ops, &options, &store, &checkpoint, &running()).await;

        let start = full
            .iter()
            .position(|o| o.identifier >= id("3"))
            .unwrap();
        let expected_tail: Vec<Operation> = full[start..].to_vec();
        assert_eq!(store.applied(), expected_tail);
        assert_eq!(
            outcomes(&report),
            vec![
                ("1", "skipped"),
                ("3", "applied"),
                ("3", "applied"),
                ("5", "applied"),
                ("7", "applied")
            ]
        );
    }

    #[tokio::test]
    async fn transient_failures_retry_then_give_up_without_aborting() {
        let store = RecordingStore::default();
        store.fail("1", [StoreError::Transient("timeout".into()), StoreError::Transient("timeout".into())]);
        store.fail("2", (0..3).map(|_| StoreError::Transient("timeout".into())));
        let checkpoint = MemoryCheckpoint::default();
        let report = execute(
            vec![op("1", 1), op("2", 1), op("3", 1)],
            &live(),
            &store,
            &checkpoint,
            &running(),
        )
        .await;
        assert_eq!(report.records[0].outcome, OperationOutcome::Applied { attempts: 3 });
        assert!(matches!(
            report.records[1].outcome,
            OperationOutcome::Failed { attempts: 3, .. }
        ));
        assert_eq!(report.records[2].outcome, OperationOutcome::Applied { attempts: 1 });
        assert_eq!(checkpoint.recorded().await, vec![id("1"), id("3")]);
        assert!(report.halted.is_none());
    }

    #[tokio::test]
    async fn permanent_failures_are_not_retried() {
        let store = RecordingStore::default();
        store.fail(
            "1",
            [StoreError::MissingVariant {
                identifier: "1".into(),
                variant: "Near Mint".into(),
            }],
        );
        let checkpoint = MemoryCheckpoint::default();
        let report = execute(vec![op("1", 1)], &live(), &store, &checkpoint, &running()).await;
        assert!(matches!(
            report.records[0].outcome,
            OperationOutcome::Failed { attempts: 1, .. }
        ));
        assert_eq!(store.attempts(), 1);
    }

    #[tokio::test]
    async fn lost_session_halts_the_run() {
        let store = RecordingStore::default();
        store.fail("2", [StoreError::SessionLost("redirected to /login".into())]);
        let checkpoint = MemoryCheckpoint::default();
        let report = execute(
            vec![op("1", 1), op("2", 1), op("3", 1)],
            &live(),
            &store,
            &checkpoint,
            &running(),
        )
        .await;
        assert_eq!(
            outcomes(&report),
            vec![("1", "applied"), ("2", "failed"), ("3", "not_attempted")]
        );
        assert!(matches!(report.halted, Some(HaltReason::SessionLost { .. })));
        assert_eq!(checkpoint.recorded().await, vec![id("1")]);
        assert_eq!(store.attempts(), 2);
    }

    struct StopAfterFirst {
        inner: RecordingStore,
        stop: watch::Sender<bool>,
    }

    #[async_trait]
    impl InventoryStore for StopAfterFirst {
        async fn snapshot(&self, ids: &[CatalogId]) -> Result<RemoteSnapshot, StoreError> {
            self.inner.snapshot(ids).await
        }

        async fn apply(&self, op: &Operation) -> Result<(), StoreError> {
            let result = self.inner.apply(op).await;
            let _ = self.stop.send(true);
            result
        }
    }

    #[tokio::test]
    async fn stop_signal_is_honoured_between_operations() {
        let (tx, rx) = watch::channel(false);
        let store = StopAfterFirst {
            inner: RecordingStore::default(),
            stop: tx,
        };
        let checkpoint = MemoryCheckpoint::default();
        let report = execute(
            vec![op("1", 1), op("2", 1), op("3", 1)],
            &live(),
            &store,
            &checkpoint,
            &rx,
        )
        .await;
        assert_eq!(
            outcomes(&report),
            vec![("1", "applied"), ("2", "not_attempted"), ("3", "not_attempted")]
        );
        assert_eq!(
            report.halted,
            Some(HaltReason::Cancelled { before: id("2") })
        );
        assert_eq!(checkpoint.recorded().await, vec![id("1")]);
    }
}
