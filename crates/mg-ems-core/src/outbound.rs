//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Outbound plan and report delivery seams."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Outbound interfaces of the control loop.
//!
//! The engine publishes exactly one plan and one report per cycle through
//! these seams; the excluded API/persistence layers provide their own
//! implementations. Delivery is at-least-once and idempotent on cycle id.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::report::CycleReport;
use mg_ems_dispatch::DispatchPlan;

pub type Result<T> = std::result::Result<T, OutboundError>;

/// Error type for outbound delivery implementations.
#[derive(Debug, thiserror::Error)]
pub enum OutboundError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Consumer of the per-cycle dispatch plan (actuation/reporting side).
pub trait PlanSink: Send + Sync {
    fn publish(&self, plan: &DispatchPlan) -> Result<()>;
}

/// Consumer of the per-cycle structured report (persistence side).
pub trait ReportSink: Send + Sync {
    fn store(&self, report: &CycleReport) -> Result<()>;
}

/// In-memory sink for tests and embedded use. Deduplicates on cycle id.
#[derive(Debug, Default)]
pub struct MemorySink {
    plans: Mutex<Vec<DispatchPlan>>,
    reports: Mutex<Vec<CycleReport>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn plans(&self) -> Vec<DispatchPlan> {
        self.plans.lock().clone()
    }

    pub fn reports(&self) -> Vec<CycleReport> {
        self.reports.lock().clone()
    }
}

impl PlanSink for MemorySink {
    fn publish(&self, plan: &DispatchPlan) -> Result<()> {
        let mut plans = self.plans.lock();
        if plans.iter().all(|existing| existing.cycle_id != plan.cycle_id) {
            plans.push(plan.clone());
        }
        Ok(())
    }
}

impl ReportSink for MemorySink {
    fn store(&self, report: &CycleReport) -> Result<()> {
        let mut reports = self.reports.lock();
        if reports
            .iter()
            .all(|existing| existing.cycle_id != report.cycle_id)
        {
            reports.push(report.clone());
        }
        Ok(())
    }
}

/// Plan sink that surfaces the head step through structured logs only.
#[derive(Debug, Default)]
pub struct TracingPlanSink;

impl PlanSink for TracingPlanSink {
    fn publish(&self, plan: &DispatchPlan) -> Result<()> {
        let head = plan.first_step();
        info!(
            cycle_id = plan.cycle_id,
            fallback = ?plan.fallback,
            shortfall_buckets = plan.shortfall_buckets(),
            expected_cost = plan.total_cost(),
            head_allocation = ?head.map(|step| step.allocation_kw.clone()),
            "dispatch plan published"
        );
        Ok(())
    }
}

/// Log file header stored as the first line of a report log.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ReportLogHeader {
    version: u16,
    created_at: DateTime<Utc>,
}

const REPORT_LOG_VERSION: u16 = 1;

/// One persisted line of the report log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportLogEntry {
    pub sequence: u64,
    pub stored_at: DateTime<Utc>,
    pub report: CycleReport,
}

/// Append-only JSONL store for cycle reports.
///
/// One JSON document per line after a header line; duplicate cycle ids are
/// skipped so at-least-once delivery stays idempotent.
pub struct JsonlReportWriter {
    path: PathBuf,
    writer: Mutex<WriterState>,
}

struct WriterState {
    writer: BufWriter<File>,
    next_sequence: u64,
    last_cycle_id: Option<u64>,
}

impl JsonlReportWriter {
    /// Open a report log for appending, writing a header if the file is new.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let exists = path.exists() && fs::metadata(path)?.len() > 0;
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let mut writer = BufWriter::new(file);

        let (next_sequence, last_cycle_id) = if exists {
            scan_log_tail(path)?
        } else {
            let header = ReportLogHeader {
                version: REPORT_LOG_VERSION,
                created_at: Utc::now(),
            };
            let line = serde_json::to_string(&header)?;
            writer.write_all(line.as_bytes())?;
            writer.write_all(b"\n")?;
            writer.flush()?;
            (0, None)
        };

        Ok(Self {
            path: path.to_path_buf(),
            writer: Mutex::new(WriterState {
                writer,
                next_sequence,
                last_cycle_id,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ReportSink for JsonlReportWriter {
    fn store(&self, report: &CycleReport) -> Result<()> {
        let mut state = self.writer.lock();
        if state.last_cycle_id == Some(report.cycle_id) {
            return Ok(());
        }
        state.next_sequence += 1;
        let entry = ReportLogEntry {
            sequence: state.next_sequence,
            stored_at: Utc::now(),
            report: report.clone(),
        };
        let line = serde_json::to_string(&entry)?;
        state.writer.write_all(line.as_bytes())?;
        state.writer.write_all(b"\n")?;
        state.writer.flush()?;
        state.last_cycle_id = Some(report.cycle_id);
        Ok(())
    }
}

fn scan_log_tail(path: &Path) -> Result<(u64, Option<u64>)> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let mut last_sequence = 0u64;
    let mut last_cycle_id = None;
    for line in reader.lines().skip(1) {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        if let Ok(entry) = serde_json::from_str::<ReportLogEntry>(&line) {
            last_sequence = entry.sequence;
            last_cycle_id = Some(entry.report.cycle_id);
        }
    }
    Ok((last_sequence, last_cycle_id))
}

/// Read back every report entry in the log, in order.
pub fn read_report_log(path: &Path) -> Result<Vec<ReportLogEntry>> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let mut entries = Vec::new();
    for line in reader.lines().skip(1) {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        entries.push(serde_json::from_str::<ReportLogEntry>(&line)?);
    }
    Ok(entries)
}
