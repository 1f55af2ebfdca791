//! SQLite adapter for the finding store
//!
//! Single-connection store behind a mutex; every write happens inside one
//! transaction so a report is either fully persisted or not at all. The
//! schema keeps one row per finding and one row per path step, with
//! indexes on the columns the query methods filter by.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use tracing::debug;

use taintflow_engine::AnalysisReport;

use crate::domain::{FindingStore, RunRecord, StoredFinding, StoredStep};
use crate::error::{Result, StorageError};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS runs (
    id                   INTEGER PRIMARY KEY AUTOINCREMENT,
    started_at           TEXT    NOT NULL,
    duration_ms          INTEGER NOT NULL,
    functions_analyzed   INTEGER NOT NULL,
    sources_found        INTEGER NOT NULL,
    finding_count        INTEGER NOT NULL,
    low_confidence_count INTEGER NOT NULL,
    cancelled            INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS findings (
    id                 INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id             INTEGER NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
    vulnerability      TEXT    NOT NULL,
    category           TEXT    NOT NULL,
    severity           TEXT    NOT NULL,
    confidence         REAL    NOT NULL,
    source_name        TEXT    NOT NULL,
    source_file        TEXT    NOT NULL,
    source_line        INTEGER NOT NULL,
    sink_name          TEXT    NOT NULL,
    sink_file          TEXT    NOT NULL,
    sink_line          INTEGER NOT NULL,
    depth              INTEGER NOT NULL,
    sanitizer_bypassed INTEGER NOT NULL,
    crosses_unresolved INTEGER NOT NULL,
    truncated          INTEGER NOT NULL,
    low_confidence     INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS finding_steps (
    finding_id  INTEGER NOT NULL REFERENCES findings(id) ON DELETE CASCADE,
    step_index  INTEGER NOT NULL,
    kind        TEXT    NOT NULL,
    description TEXT    NOT NULL,
    symbol      TEXT    NOT NULL,
    file        TEXT    NOT NULL,
    line        INTEGER NOT NULL,
    col         INTEGER NOT NULL,
    PRIMARY KEY (finding_id, step_index)
);

CREATE INDEX IF NOT EXISTS idx_findings_run      ON findings(run_id);
CREATE INDEX IF NOT EXISTS idx_findings_category ON findings(category);
CREATE INDEX IF NOT EXISTS idx_findings_sink     ON findings(sink_file);
";

pub struct SqliteFindingStore {
    conn: Mutex<Connection>,
}

impl SqliteFindingStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_connection(Connection::open(path)?)
    }

    pub fn in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StorageError::transaction("connection mutex poisoned"))
    }

    fn steps_for(conn: &Connection, finding_id: i64) -> Result<Vec<StoredStep>> {
        let mut stmt = conn.prepare(
            "SELECT step_index, kind, description, symbol, file, line, col
             FROM finding_steps WHERE finding_id = ?1 ORDER BY step_index",
        )?;
        let steps = stmt
            .query_map(params![finding_id], |row| {
                Ok(StoredStep {
                    step_index: row.get::<_, i64>(0)? as usize,
                    kind: row.get(1)?,
                    description: row.get(2)?,
                    symbol: row.get(3)?,
                    file: row.get(4)?,
                    line: row.get::<_, i64>(5)? as u32,
                    column: row.get::<_, i64>(6)? as u32,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(steps)
    }

    fn finding_from_row(row: &Row<'_>) -> rusqlite::Result<StoredFinding> {
        Ok(StoredFinding {
            id: row.get(0)?,
            run_id: row.get(1)?,
            vulnerability: row.get(2)?,
            category: row.get(3)?,
            severity: row.get(4)?,
            confidence: row.get::<_, f64>(5)? as f32,
            source_name: row.get(6)?,
            source_file: row.get(7)?,
            source_line: row.get::<_, i64>(8)? as u32,
            sink_name: row.get(9)?,
            sink_file: row.get(10)?,
            sink_line: row.get::<_, i64>(11)? as u32,
            depth: row.get::<_, i64>(12)? as usize,
            sanitizer_bypassed: row.get(13)?,
            crosses_unresolved: row.get(14)?,
            truncated: row.get(15)?,
            low_confidence: row.get(16)?,
            steps: Vec::new(),
        })
    }

    fn query_findings(&self, where_clause: &str, param: &str) -> Result<Vec<StoredFinding>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT id, run_id, vulnerability, category, severity, confidence,
                    source_name, source_file, source_line,
                    sink_name, sink_file, sink_line, depth,
                    sanitizer_bypassed, crosses_unresolved, truncated, low_confidence
             FROM findings WHERE {where_clause} ORDER BY run_id DESC, id"
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut findings = stmt
            .query_map(params![param], Self::finding_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        for finding in &mut findings {
            finding.steps = Self::steps_for(&conn, finding.id)?;
        }
        Ok(findings)
    }
}

impl FindingStore for SqliteFindingStore {
    fn save_report(&self, report: &AnalysisReport) -> Result<i64> {
        let record = RunRecord::from_report(report);
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO runs (started_at, duration_ms, functions_analyzed, sources_found,
                               finding_count, low_confidence_count, cancelled)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.started_at.to_rfc3339(),
                record.duration_ms as i64,
                record.functions_analyzed as i64,
                record.sources_found as i64,
                record.finding_count as i64,
                record.low_confidence_count as i64,
                record.cancelled,
            ],
        )?;
        let run_id = tx.last_insert_rowid();

        let groups = [(&report.findings, false), (&report.low_confidence, true)];
        for (findings, low_confidence) in groups {
            for finding in findings.iter() {
                let stored = StoredFinding::from_finding(finding, low_confidence);
                tx.execute(
                    "INSERT INTO findings (run_id, vulnerability, category, severity, confidence,
                                           source_name, source_file, source_line,
                                           sink_name, sink_file, sink_line, depth,
                                           sanitizer_bypassed, crosses_unresolved, truncated,
                                           low_confidence)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
                    params![
                        run_id,
                        stored.vulnerability,
                        stored.category,
                        stored.severity,
                        stored.confidence as f64,
                        stored.source_name,
                        stored.source_file,
                        stored.source_line as i64,
                        stored.sink_name,
                        stored.sink_file,
                        stored.sink_line as i64,
                        stored.depth as i64,
                        stored.sanitizer_bypassed,
                        stored.crosses_unresolved,
                        stored.truncated,
                        stored.low_confidence,
                    ],
                )?;
                let finding_id = tx.last_insert_rowid();
                for step in &stored.steps {
                    tx.execute(
                        "INSERT INTO finding_steps (finding_id, step_index, kind, description,
                                                    symbol, file, line, col)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                        params![
                            finding_id,
                            step.step_index as i64,
                            step.kind,
                            step.description,
                            step.symbol,
                            step.file,
                            step.line as i64,
                            step.column as i64,
                        ],
                    )?;
                }
            }
        }

        tx.commit()?;
        debug!(run_id, findings = record.finding_count, "report persisted");
        Ok(run_id)
    }

    fn get_run(&self, run_id: i64) -> Result<RunRecord> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, started_at, duration_ms, functions_analyzed, sources_found,
                    finding_count, low_confidence_count, cancelled
             FROM runs WHERE id = ?1",
        )?;
        let record = stmt
            .query_row(params![run_id], |row| {
                let started_at: String = row.get(1)?;
                Ok(RunRecord {
                    id: row.get(0)?,
                    started_at: DateTime::parse_from_rfc3339(&started_at)
                        .map(|t| t.with_timezone(&Utc))
                        .unwrap_or_else(|_| Utc::now()),
                    duration_ms: row.get::<_, i64>(2)? as u64,
                    functions_analyzed: row.get::<_, i64>(3)? as usize,
                    sources_found: row.get::<_, i64>(4)? as usize,
                    finding_count: row.get::<_, i64>(5)? as usize,
                    low_confidence_count: row.get::<_, i64>(6)? as usize,
                    cancelled: row.get(7)?,
                })
            })
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StorageError::run_not_found(run_id),
                other => other.into(),
            })?;
        Ok(record)
    }

    fn get_finding(&self, finding_id: i64) -> Result<StoredFinding> {
        let mut findings = self.query_findings("id = ?1", &finding_id.to_string())?;
        findings
            .pop()
            .ok_or_else(|| StorageError::finding_not_found(finding_id))
    }

    fn findings_for_run(
        &self,
        run_id: i64,
        include_low_confidence: bool,
    ) -> Result<Vec<StoredFinding>> {
        let mut findings = self.query_findings("run_id = ?1", &run_id.to_string())?;
        if !include_low_confidence {
            findings.retain(|f| !f.low_confidence);
        }
        Ok(findings)
    }

    fn findings_by_sink_file(&self, file: &str) -> Result<Vec<StoredFinding>> {
        self.query_findings("sink_file = ?1", file)
    }

    fn findings_by_category(&self, category: &str) -> Result<Vec<StoredFinding>> {
        self.query_findings("category = ?1", category)
    }

    fn delete_run(&self, run_id: i64) -> Result<()> {
        let conn = self.lock()?;
        let deleted = conn.execute("DELETE FROM runs WHERE id = ?1", params![run_id])?;
        if deleted == 0 {
            return Err(StorageError::run_not_found(run_id));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taintflow_engine::classify::Finding;
    use taintflow_engine::paths::{PathStep, SinkRef, SourceRef, TaintPath};
    use taintflow_engine::model::CallSiteId;
    use taintflow_engine::{Severity, StepKind, VulnCategory};

    fn finding(sink_file: &str, category: VulnCategory, confidence: f32) -> Finding {
        Finding {
            vulnerability: category.vulnerability_name().to_string(),
            category,
            severity: Severity::High,
            confidence,
            path: TaintPath {
                source: SourceRef {
                    call_site: CallSiteId(0),
                    name: "request.get".to_string(),
                    file: "handler.py".to_string(),
                    line: 10,
                },
                sink: SinkRef {
                    call_site: CallSiteId(1),
                    name: "cursor.execute".to_string(),
                    category,
                    file: sink_file.to_string(),
                    line: 20,
                },
                steps: vec![PathStep {
                    kind: StepKind::SinkReached,
                    description: "data -> cursor.execute".to_string(),
                    symbol: "run_query".to_string(),
                    file: sink_file.to_string(),
                    line: 20,
                    column: 5,
                }],
                sanitizer_bypassed: false,
                crosses_unresolved: false,
                crosses_files: false,
                truncated: false,
            },
        }
    }

    fn report() -> AnalysisReport {
        let mut report = AnalysisReport::default();
        report.findings.push(finding("db.py", VulnCategory::Sql, 0.9));
        report.findings.push(finding("shell.py", VulnCategory::Command, 0.8));
        report
            .low_confidence
            .push(finding("db.py", VulnCategory::Sql, 0.3));
        report.diagnostics.functions_analyzed = 2;
        report
    }

    #[test]
    fn test_save_and_read_back_run() {
        let store = SqliteFindingStore::in_memory().unwrap();
        let run_id = store.save_report(&report()).unwrap();

        let record = store.get_run(run_id).unwrap();
        assert_eq!(record.finding_count, 2);
        assert_eq!(record.low_confidence_count, 1);
        assert_eq!(record.functions_analyzed, 2);
    }

    #[test]
    fn test_steps_round_trip_in_order() {
        let store = SqliteFindingStore::in_memory().unwrap();
        let mut rpt = AnalysisReport::default();
        let mut f = finding("db.py", VulnCategory::Sql, 0.9);
        f.path.steps.insert(
            0,
            PathStep {
                kind: StepKind::IntraPropagation,
                description: "request.get -> data".to_string(),
                symbol: "handler".to_string(),
                file: "handler.py".to_string(),
                line: 10,
                column: 1,
            },
        );
        rpt.findings.push(f);
        let run_id = store.save_report(&rpt).unwrap();

        let findings = store.findings_for_run(run_id, false).unwrap();
        assert_eq!(findings.len(), 1);
        let steps = &findings[0].steps;
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].step_index, 0);
        assert_eq!(steps[0].kind, "intra_propagation");
        assert_eq!(steps[0].symbol, "handler");
        assert_eq!(steps[1].kind, "sink_reached");
        assert_eq!(steps[1].column, 5);
        assert_eq!(findings[0].depth, 2);
    }

    #[test]
    fn test_query_by_sink_file_and_category() {
        let store = SqliteFindingStore::in_memory().unwrap();
        store.save_report(&report()).unwrap();

        let db = store.findings_by_sink_file("db.py").unwrap();
        // Primary and low-confidence finding both land in db.py
        assert_eq!(db.len(), 2);

        let command = store.findings_by_category("command").unwrap();
        assert_eq!(command.len(), 1);
        assert_eq!(command[0].sink_file, "shell.py");
    }

    #[test]
    fn test_low_confidence_excluded_by_default() {
        let store = SqliteFindingStore::in_memory().unwrap();
        let run_id = store.save_report(&report()).unwrap();

        assert_eq!(store.findings_for_run(run_id, false).unwrap().len(), 2);
        assert_eq!(store.findings_for_run(run_id, true).unwrap().len(), 3);
    }

    #[test]
    fn test_delete_run_cascades() {
        let store = SqliteFindingStore::in_memory().unwrap();
        let run_id = store.save_report(&report()).unwrap();

        store.delete_run(run_id).unwrap();
        assert!(store.get_run(run_id).is_err());
        assert!(store.findings_by_sink_file("db.py").unwrap().is_empty());
        assert!(matches!(
            store.delete_run(run_id),
            Err(StorageError { kind: crate::error::ErrorKind::RunNotFound, .. })
        ));
    }

    #[test]
    fn test_persists_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("findings.db");

        let run_id = {
            let store = SqliteFindingStore::open(&path).unwrap();
            store.save_report(&report()).unwrap()
        };

        let reopened = SqliteFindingStore::open(&path).unwrap();
        assert_eq!(reopened.get_run(run_id).unwrap().finding_count, 2);
    }
}
