//! One reconciliation run: read the input, resolve rows, plan against the
//! remote snapshot, then execute.

use crate::checkpoint::Checkpoint;
use crate::config::RetryPolicy;
use crate::input;
use crate::models::{CatalogId, Mode, Operation, StageReport};
use crate::planner::{self, PlanOptions};
use crate::report::{RunReport, Summary};
use crate::resolver::{ResolutionPass, ResolveError, Resolver};
use crate::sequencer::{self, ExecuteOptions, ExecutionReport};
use crate::store::InventoryStore;
use chrono::Utc;
use serde_json::{Value, json};
use std::{collections::BTreeMap, future::Future, path::Path, sync::Arc, time::Instant};
use thiserror::Error;
use tokio::sync::watch;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub run_id: Uuid,
    pub mode: Mode,
    pub resume_from: Option<CatalogId>,
    pub retry: RetryPolicy,
    pub plan: PlanOptions,
}

pub struct SyncRun {
    resolver: Resolver,
    store: Arc<dyn InventoryStore>,
    checkpoint: Arc<dyn Checkpoint>,
    options: RunOptions,
}

impl SyncRun {
    pub fn new(
        resolver: Resolver,
        store: Arc<dyn InventoryStore>,
        checkpoint: Arc<dyn Checkpoint>,
        options: RunOptions,
    ) -> Self {
        Self {
            resolver,
            store,
            checkpoint,
            options,
        }
    }

    /// Runs every stage against the CSV at `input`. A halted execution is
    /// still a report; only failures before execution are errors.
    pub async fn run(
        &self,
        input: &Path,
        stop: &watch::Receiver<bool>,
    ) -> Result<RunReport, SyncError> {
        let started_at = Utc::now();
        let mut stages = Vec::new();
        info!(
            target = "tcgsync.sync",
            run_id = %self.options.run_id,
            mode = self.options.mode.as_str(),
            input = %input.display(),
            "run started"
        );

        let rows = capture_stage("read_input", &mut stages, async {
            let rows = input::read_rows(input)
                .await
                .map_err(|err| SyncError::invalid_input("read_input", err.to_string()))?;
            let output = json!({ "path": input.display().to_string(), "rows": rows.len() });
            Ok(StageOutcome::new(rows, output))
        })
        .await?;

        let pass = capture_stage("resolve", &mut stages, async {
            let pass = self
                .resolver
                .resolve_all(&rows, self.store.as_ref())
                .await
                .map_err(|err| SyncError::from_resolve("resolve", err))?;
            let output = resolution_output(&pass);
            Ok(StageOutcome::new(pass, output))
        })
        .await?;

        let operations = capture_stage("plan", &mut stages, async {
            let operations = planner::plan(&pass.rows, &pass.snapshot, self.options.plan);
            let output = plan_output(&operations);
            Ok(StageOutcome::new(operations, output))
        })
        .await?;

        let execute_options = ExecuteOptions {
            mode: self.options.mode,
            resume_from: self.options.resume_from.clone(),
            retry: self.options.retry,
        };
        let execution = capture_stage("execute", &mut stages, async {
            let execution = sequencer::execute(
                operations,
                &execute_options,
                self.store.as_ref(),
                self.checkpoint.as_ref(),
                stop,
            )
            .await;
            let output = execution_output(&execution);
            Ok(StageOutcome::new(execution, output))
        })
        .await?;

        let summary = Summary::new(&pass.rows, &execution, &pass.snapshot);
        Ok(RunReport {
            run_id: self.options.run_id,
            mode: self.options.mode,
            input: input.display().to_string(),
            started_at,
            finished_at: Utc::now(),
            resume_from: execution.resume_from,
            stages,
            resolutions: pass.rows,
            operations: execution.records,
            halted: execution.halted,
            summary,
        })
    }
}

fn resolution_output(pass: &ResolutionPass) -> Value {
    let mut unresolved: BTreeMap<&str, usize> = BTreeMap::new();
    for reason in pass.rows.iter().filter_map(|r| r.unresolved()) {
        *unresolved.entry(reason.code()).or_default() += 1;
    }
    json!({
        "rows": pass.rows.len(),
        "resolved": pass.rows.iter().filter(|r| r.identifier().is_some()).count(),
        "unresolved": unresolved,
        "products_read": pass.snapshot.products.len(),
        "products_unavailable": pass.snapshot.unavailable.len(),
    })
}

fn plan_output(operations: &[Operation]) -> Value {
    let mut by_kind: BTreeMap<&str, usize> = BTreeMap::new();
    for op in operations {
        *by_kind.entry(op.kind.name()).or_default() += 1;
    }
    json!({ "operations": operations.len(), "by_kind": by_kind })
}

fn execution_output(execution: &ExecutionReport) -> Value {
    let mut by_outcome: BTreeMap<&str, usize> = BTreeMap::new();
    for record in &execution.records {
        *by_outcome.entry(record.outcome.name()).or_default() += 1;
    }
    json!({
        "mode": execution.mode.as_str(),
        "outcomes": by_outcome,
        "halted": execution.halted,
    })
}

async fn capture_stage<T, Fut>(
    name: &'static str,
    stages: &mut Vec<StageReport>,
    fut: Fut,
) -> Result<T, SyncError>
where
    Fut: Future<Output = Result<StageOutcome<T>, SyncError>>,
{
    let started = Instant::now();
    let outcome = fut.await?;
    let elapsed_ms = started.elapsed().as_millis();
    crate::metrics::stage_elapsed(name, elapsed_ms);
    stages.push(StageReport::new(name, elapsed_ms, outcome.output));
    Ok(outcome.value)
}

#[derive(Debug, Error)]
#[error("stage `{stage}` failed: {message}")]
pub struct SyncError {
    stage: &'static str,
    message: String,
    kind: SyncErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncErrorKind {
    InvalidInput,
    SessionLost,
    Internal,
}

impl SyncError {
    pub fn invalid_input(stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            kind: SyncErrorKind::InvalidInput,
        }
    }

    pub fn internal(stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            kind: SyncErrorKind::Internal,
        }
    }

    fn from_resolve(stage: &'static str, err: ResolveError) -> Self {
        let kind = if err.is_session_lost() {
            SyncErrorKind::SessionLost
        } else {
            SyncErrorKind::Internal
        };
        Self {
            stage,
            message: err.to_string(),
            kind,
        }
    }

    pub fn stage(&self) -> &'static str {
        self.stage
    }

    pub fn kind(&self) -> SyncErrorKind {
        self.kind
    }

    pub fn detail(&self) -> &str {
        &self.message
    }
}

#[derive(Debug)]
pub struct StageOutcome<T> {
    pub value: T,
    pub output: Value,
}

impl<T> StageOutcome<T> {
    fn new(value: T, output: Value) -> Self {
        Self { value, output }
    }
}
