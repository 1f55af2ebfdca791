//! Domain layer for the finding store
//!
//! Persistence is normalized, one row per fact: a `runs` row per analysis
//! run, a `findings` row per classified path, and a `finding_steps` row
//! per hop keyed by `(finding_id, step_index)`. Paths are never serialized
//! into blobs — every column is directly queryable, so "all SQL injection
//! findings touching auth.py" is one SQL statement, not a deserialization
//! loop.
//!
//! # Domain Models
//!
//! - `RunRecord`: one analysis run with its diagnostics counters
//! - `StoredFinding`: one classified source-to-sink flow
//! - `StoredStep`: one hop of a finding's path, ordered by `step_index`
//!
//! # Port Trait
//!
//! - `FindingStore`: the storage abstraction the engine's callers use

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use taintflow_engine::{AnalysisReport, Finding};

use crate::Result;

/// One persisted analysis run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    /// Assigned by the store; zero until saved.
    pub id: i64,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub functions_analyzed: usize,
    pub sources_found: usize,
    pub finding_count: usize,
    pub low_confidence_count: usize,
    pub cancelled: bool,
}

impl RunRecord {
    /// Build the run row from a finished report.
    pub fn from_report(report: &AnalysisReport) -> Self {
        Self {
            id: 0,
            started_at: Utc::now(),
            duration_ms: report.diagnostics.duration_ms,
            functions_analyzed: report.diagnostics.functions_analyzed,
            sources_found: report.diagnostics.sources_found,
            finding_count: report.findings.len(),
            low_confidence_count: report.low_confidence.len(),
            cancelled: report.diagnostics.cancelled,
        }
    }
}

/// One hop of a stored path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredStep {
    pub step_index: usize,
    pub kind: String,
    pub description: String,
    pub symbol: String,
    pub file: String,
    pub line: u32,
    pub column: u32,
}

/// A finding as persisted: flat columns for everything filterable, plus
/// the ordered step rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredFinding {
    /// Assigned by the store; zero until saved.
    pub id: i64,
    pub run_id: i64,
    pub vulnerability: String,
    pub category: String,
    pub severity: String,
    pub confidence: f32,
    pub source_name: String,
    pub source_file: String,
    pub source_line: u32,
    pub sink_name: String,
    pub sink_file: String,
    pub sink_line: u32,
    /// Number of hops in the stored path.
    pub depth: usize,
    pub sanitizer_bypassed: bool,
    pub crosses_unresolved: bool,
    pub truncated: bool,
    /// True for findings under the confidence threshold.
    pub low_confidence: bool,
    pub steps: Vec<StoredStep>,
}

impl StoredFinding {
    pub fn from_finding(finding: &Finding, low_confidence: bool) -> Self {
        let path = &finding.path;
        Self {
            id: 0,
            run_id: 0,
            vulnerability: finding.vulnerability.clone(),
            category: finding.category.as_str().to_string(),
            severity: finding.severity.as_str().to_string(),
            confidence: finding.confidence,
            source_name: path.source.name.clone(),
            source_file: path.source.file.clone(),
            source_line: path.source.line,
            sink_name: path.sink.name.clone(),
            sink_file: path.sink.file.clone(),
            sink_line: path.sink.line,
            depth: path.steps.len(),
            sanitizer_bypassed: path.sanitizer_bypassed,
            crosses_unresolved: path.crosses_unresolved,
            truncated: path.truncated,
            low_confidence,
            steps: path
                .steps
                .iter()
                .enumerate()
                .map(|(step_index, step)| StoredStep {
                    step_index,
                    kind: step.kind.as_str().to_string(),
                    description: step.description.clone(),
                    symbol: step.symbol.clone(),
                    file: step.file.clone(),
                    line: step.line,
                    column: step.column,
                })
                .collect(),
        }
    }
}

/// Primary storage abstraction for analysis results.
pub trait FindingStore {
    /// Persist a whole report atomically. Returns the run id.
    fn save_report(&self, report: &AnalysisReport) -> Result<i64>;

    fn get_run(&self, run_id: i64) -> Result<RunRecord>;

    fn get_finding(&self, finding_id: i64) -> Result<StoredFinding>;

    /// All findings of one run, ordered by id. Excludes low-confidence
    /// rows unless asked for.
    fn findings_for_run(&self, run_id: i64, include_low_confidence: bool)
        -> Result<Vec<StoredFinding>>;

    /// Findings whose sink lands in the given file, newest run first.
    fn findings_by_sink_file(&self, file: &str) -> Result<Vec<StoredFinding>>;

    /// Findings of one category (`"sql"`, `"command"`, ...), newest run first.
    fn findings_by_category(&self, category: &str) -> Result<Vec<StoredFinding>>;

    /// Drop a run and everything hanging off it.
    fn delete_run(&self, run_id: i64) -> Result<()>;
}
