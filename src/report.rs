//! Run artifacts: the resolved inventory CSV and the JSON run log.

use crate::models::{CatalogId, Mode, RemoteSnapshot, ResolvedRow, StageReport};
use crate::sequencer::{ExecutionReport, HaltReason, OperationOutcome, OperationRecord};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_with::skip_serializing_none;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("report I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("report CSV failed: {0}")]
    Csv(#[from] csv::Error),
    #[error("report JSON failed: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub rows: usize,
    pub resolved: usize,
    pub unresolved: BTreeMap<String, usize>,
    pub operations: usize,
    pub applied: usize,
    pub planned: usize,
    pub unchanged: usize,
    pub skipped: usize,
    pub failed: usize,
    pub not_attempted: usize,
    /// Change in listed value (quantity times price) across applied or
    /// planned operations, saturating at the bounds of `i64`.
    pub value_delta_cents: i64,
}

impl Summary {
    pub fn new(
        resolutions: &[ResolvedRow],
        execution: &ExecutionReport,
        snapshot: &RemoteSnapshot,
    ) -> Self {
        let mut summary = Summary {
            rows: resolutions.len(),
            operations: execution.records.len(),
            ..Summary::default()
        };
        let mut value_delta_cents: i128 = 0;
        for row in resolutions {
            match row.unresolved() {
                Some(reason) => *summary.unresolved.entry(reason.code().to_string()).or_default() += 1,
                None => summary.resolved += 1,
            }
        }
        for record in &execution.records {
            match &record.outcome {
                OperationOutcome::Applied { .. } => summary.applied += 1,
                OperationOutcome::Planned => summary.planned += 1,
                OperationOutcome::Unchanged => summary.unchanged += 1,
                OperationOutcome::Skipped => summary.skipped += 1,
                OperationOutcome::Failed { .. } => summary.failed += 1,
                OperationOutcome::NotAttempted => summary.not_attempted += 1,
            }
            if matches!(
                record.outcome,
                OperationOutcome::Applied { .. } | OperationOutcome::Planned
            ) {
                value_delta_cents = value_delta_cents.saturating_add(value_delta(record, snapshot));
            }
        }
        summary.value_delta_cents =
            i64::try_from(value_delta_cents).unwrap_or(if value_delta_cents < 0 {
                i64::MIN
            } else {
                i64::MAX
            });
        summary
    }
}

/// A `u32` quantity times an `i64` price always fits in `i128`.
fn value_delta(record: &OperationRecord, snapshot: &RemoteSnapshot) -> i128 {
    let op = &record.operation;
    let current = snapshot.entry(&op.identifier, &op.variant);
    let before = current
        .map(|e| i128::from(e.quantity) * i128::from(e.price.map(|p| p.cents()).unwrap_or(0)))
        .unwrap_or(0);
    let price = op
        .kind
        .final_price()
        .or_else(|| current.and_then(|e| e.price))
        .map(|p| p.cents())
        .unwrap_or(0);
    i128::from(op.kind.final_quantity()) * i128::from(price) - before
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub mode: Mode,
    pub input: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub resume_from: Option<CatalogId>,
    pub stages: Vec<StageReport>,
    pub resolutions: Vec<ResolvedRow>,
    pub operations: Vec<OperationRecord>,
    pub halted: Option<HaltReason>,
    pub summary: Summary,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportPaths {
    pub inventory: PathBuf,
    pub run_log: PathBuf,
}

impl ReportPaths {
    pub fn new(dir: &Path, stamp: &str) -> Self {
        Self {
            inventory: dir.join(format!("inventory_{stamp}.csv")),
            run_log: dir.join(format!("run_{stamp}.json")),
        }
    }
}

#[derive(Serialize)]
struct InventoryLine<'a> {
    #[serde(rename = "Product ID")]
    product_id: &'a str,
    #[serde(rename = "Name")]
    name: &'a str,
    #[serde(rename = "Variant")]
    variant: String,
    #[serde(rename = "Qty")]
    quantity: u32,
    #[serde(rename = "Price")]
    price: String,
}

/// Final desired state of every planned listing.
pub async fn write_inventory_csv(
    path: &Path,
    records: &[OperationRecord],
) -> Result<(), ReportError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    for record in records {
        let op = &record.operation;
        writer.serialize(InventoryLine {
            product_id: op.identifier.as_str(),
            name: &op.name,
            variant: op.variant.label(),
            quantity: op.kind.final_quantity(),
            price: op.kind.final_price().map(|p| p.to_string()).unwrap_or_default(),
        })?;
    }
    let bytes = writer
        .into_inner()
        .map_err(|err| ReportError::Io(err.into_error()))?;
    tokio::fs::write(path, bytes).await?;
    Ok(())
}

pub async fn write_run_log(path: &Path, report: &RunReport) -> Result<(), ReportError> {
    let mut body = serde_json::to_vec_pretty(report)?;
    body.push(b'\n');
    tokio::fs::write(path, body).await?;
    Ok(())
}

pub async fn write_reports(report: &RunReport, paths: &ReportPaths) -> Result<(), ReportError> {
    for parent in [paths.inventory.parent(), paths.run_log.parent()]
        .into_iter()
        .flatten()
    {
        tokio::fs::create_dir_all(parent).await?;
    }
    write_inventory_csv(&paths.inventory, &report.operations).await?;
    write_run_log(&paths.run_log, report).await?;
    info!(
        target = "tcgsync.cli",
        inventory = %paths.inventory.display(),
        run_log = %paths.run_log.display(),
        "reports written"
    );
    Ok(())
}

pub fn log_summary(report: &RunReport) {
    let s = &report.summary;
    info!(
        target = "tcgsync.cli",
        run_id = %report.run_id,
        mode = report.mode.as_str(),
        rows = s.rows,
        resolved = s.resolved,
        unresolved = s.unresolved.values().sum::<usize>(),
        applied = s.applied,
        planned = s.planned,
        unchanged = s.unchanged,
        skipped = s.skipped,
        failed = s.failed,
        not_attempted = s.not_attempted,
        value_delta_cents = s.value_delta_cents,
        "sync finished"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        Money, Operation, OperationKind, Provenance, ResolutionOutcome, UnresolvedReason,
    };
    use crate::testing::{id, nm, priced, row, stocked};

    fn record(identifier: &str, kind: OperationKind, outcome: OperationOutcome) -> OperationRecord {
        OperationRecord {
            operation: Operation {
                identifier: id(identifier),
                variant: nm(),
                name: "Black Lotus".into(),
                lines: vec![2],
                kind,
            },
            outcome,
        }
    }

    fn sample() -> (Vec<ResolvedRow>, ExecutionReport, RemoteSnapshot) {
        let resolutions = vec![
            ResolvedRow {
                row: priced(row(2, "", "Black Lotus", "NM", 2), "10.00"),
                variant: nm(),
                outcome: ResolutionOutcome::Resolved {
                    identifier: id("1"),
                    provenance: Provenance::PreSupplied,
                },
            },
            ResolvedRow {
                row: row(3, "", "Nope", "NM", 1),
                variant: nm(),
                outcome: ResolutionOutcome::Unresolved {
                    reason: UnresolvedReason::NotFound,
                },
            },
        ];
        let snapshot = RemoteSnapshot::default().with_entry("2", nm(), stocked(1, Some("4.00")));
        let execution = ExecutionReport {
            mode: Mode::Live,
            resume_from: None,
            records: vec![
                record(
                    "1",
                    OperationKind::Create {
                        quantity: 2,
                        price: Some(Money::from_cents(1000)),
                    },
                    OperationOutcome::Applied { attempts: 1 },
                ),
                record(
                    "2",
                    OperationKind::UpdateQuantity {
                        old: 1,
                        new: 3,
                        price: None,
                    },
                    OperationOutcome::Failed {
                        attempts: 3,
                        error: "timeout".into(),
                    },
                ),
            ],
            halted: None,
        };
        (resolutions, execution, snapshot)
    }

    #[test]
    fn summary_counts_outcomes_and_value_change() {
        let (resolutions, execution, snapshot) = sample();
        let summary = Summary::new(&resolutions, &execution, &snapshot);
        assert_eq!(summary.rows, 2);
        assert_eq!(summary.resolved, 1);
        assert_eq!(summary.unresolved.get("not_found"), Some(&1));
        assert_eq!(summary.applied, 1);
        assert_eq!(summary.failed, 1);
        // Only the applied create counts: 2 x 10.00.
        assert_eq!(summary.value_delta_cents, 2_000);
    }

    #[test]
    fn value_change_saturates_instead_of_overflowing() {
        let resolutions = vec![ResolvedRow {
            row: priced(row(2, "", "Black Lotus", "NM", 4_000_000_000), "$30,000,000,000.00"),
            variant: nm(),
            outcome: ResolutionOutcome::Resolved {
                identifier: id("1"),
                provenance: Provenance::PreSupplied,
            },
        }];
        let execution = ExecutionReport {
            mode: Mode::DryRun,
            resume_from: None,
            records: vec![record(
                "1",
                OperationKind::Create {
                    quantity: 4_000_000_000,
                    price: Some(Money::from_cents(3_000_000_000_000)),
                },
                OperationOutcome::Planned,
            )],
            halted: None,
        };
        let summary = Summary::new(&resolutions, &execution, &RemoteSnapshot::default());
        assert_eq!(summary.planned, 1);
        assert_eq!(summary.value_delta_cents, i64::MAX);
    }

    #[tokio::test]
    async fn writes_inventory_csv_and_run_log() {
        let dir = tempfile::tempdir().unwrap();
        let (resolutions, execution, snapshot) = sample();
        let summary = Summary::new(&resolutions, &execution, &snapshot);
        let report = RunReport {
            run_id: Uuid::new_v4(),
            mode: Mode::Live,
            input: "inventory.csv".into(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            resume_from: None,
            stages: vec![StageReport::new("plan", 1, serde_json::json!({"operations": 2}))],
            resolutions,
            operations: execution.records,
            halted: None,
            summary,
        };
        let paths = ReportPaths::new(&dir.path().join("out"), "20240101_000000");
        write_reports(&report, &paths).await.unwrap();

        let csv = std::fs::read_to_string(&paths.inventory).unwrap();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines[0], "Product ID,Name,Variant,Qty,Price");
        assert_eq!(lines[1], "1,Black Lotus,Near Mint,2,10.00");
        assert_eq!(lines[2], "2,Black Lotus,Near Mint,3,");

        let log: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&paths.run_log).unwrap()).unwrap();
        assert_eq!(log["mode"], "live");
        assert_eq!(log["summary"]["failed"], 1);
        assert_eq!(log["operations"][0]["outcome"]["status"], "applied");
        assert_eq!(log["operations"][0]["operation"]["op"], "create");
        assert_eq!(log["resolutions"][1]["outcome"]["reason"], "not_found");
        assert!(log.get("halted").is_none());
    }
}
