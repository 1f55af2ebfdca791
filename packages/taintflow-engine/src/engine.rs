//! Analysis orchestration
//!
//! Two phases with a barrier between them. Phase one computes function
//! summaries bottom-up over the call graph; phase two runs a source-seeded
//! propagation per function, in parallel over immutable data, then
//! enumerates and classifies paths. Cancellation is cooperative: the token
//! is checked at function granularity and at every BFS frontier node
//! during path enumeration, so a cancelled run stops quickly but never
//! tears a function mid-analysis. Paths materialized before the trip are
//! kept, each marked truncated.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::catalog::{PatternCatalog, VulnCategory};
use crate::classify::{deduplicate, Classifier, Finding};
use crate::config::EngineConfig;
use crate::error::Result;
use crate::interprocedural::InterproceduralAnalyzer;
use crate::model::{ProgramSnapshot, SymbolId};
use crate::paths::PathEnumerator;
use crate::propagation::{PropagationOutcome, Propagator, TaintSeed};
use crate::summary::SummaryStore;

/// Cooperative cancellation: an explicit flag plus an optional deadline.
#[derive(Debug, Clone)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancelToken {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            deadline: timeout.map(|t| Instant::now() + t),
        }
    }

    pub fn unbounded() -> Self {
        Self::new(None)
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
            || self.deadline.map_or(false, |d| Instant::now() >= d)
    }
}

/// Counters describing how complete a run was.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunDiagnostics {
    pub functions_analyzed: usize,
    pub summaries_computed: usize,
    pub sources_found: usize,
    /// Calls to unresolved targets crossed with tainted data.
    pub unresolved_boundaries: usize,
    /// Functions whose propagation hit an iteration or depth cap.
    pub truncated_functions: usize,
    /// Recursion clusters that did not converge within the round cap.
    pub nonconverged_clusters: usize,
    /// The global path cap cut reporting short.
    pub paths_capped: bool,
    pub cancelled: bool,
    pub duration_ms: u64,
}

/// Full result of one analysis run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisReport {
    /// Findings at or above the confidence threshold.
    pub findings: Vec<Finding>,
    /// Findings below the threshold, kept for review rather than dropped.
    pub low_confidence: Vec<Finding>,
    pub diagnostics: RunDiagnostics,
}

impl AnalysisReport {
    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }

    /// Finding counts per category, primary findings only.
    pub fn by_category(&self) -> BTreeMap<VulnCategory, usize> {
        let mut counts = BTreeMap::new();
        for finding in &self.findings {
            *counts.entry(finding.category).or_insert(0) += 1;
        }
        counts
    }
}

pub struct TaintEngine {
    snapshot: ProgramSnapshot,
    catalog: PatternCatalog,
    config: EngineConfig,
}

impl TaintEngine {
    /// Rejects an out-of-range configuration before any work starts.
    pub fn new(
        snapshot: ProgramSnapshot,
        catalog: PatternCatalog,
        config: EngineConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            snapshot,
            catalog,
            config,
        })
    }

    pub fn snapshot(&self) -> &ProgramSnapshot {
        &self.snapshot
    }

    /// Run with a deadline taken from the configuration.
    pub fn run(&self) -> AnalysisReport {
        let token = CancelToken::new(self.config.timeout_secs.map(Duration::from_secs));
        self.run_cancellable(&token)
    }

    pub fn run_cancellable(&self, cancel: &CancelToken) -> AnalysisReport {
        let start = Instant::now();
        info!(
            functions = self.snapshot.symbol_count(),
            "taint analysis starting"
        );

        // Phase one: summaries, callees before callers.
        let store = SummaryStore::new();
        let phase1 = InterproceduralAnalyzer::new(&self.snapshot, &self.catalog, &self.config)
            .compute_summaries(&store, cancel);

        // Phase two: source-seeded propagation per function. Summaries are
        // complete and frozen, so every function is independent.
        let propagator = Propagator::new(&self.snapshot, &self.catalog, &self.config);
        let functions: Vec<SymbolId> = self.snapshot.symbols().map(|s| s.id).collect();
        let outcomes: Vec<(SymbolId, PropagationOutcome)> = functions
            .par_iter()
            .filter_map(|function| {
                if cancel.is_cancelled() {
                    return None;
                }
                Some((
                    *function,
                    propagator.run(*function, TaintSeed::Sources, &store),
                ))
            })
            .collect();

        let enumerator = PathEnumerator::new(&self.snapshot, &self.config);
        let classifier = Classifier::new(&self.config);
        let all: Vec<Finding> = outcomes
            .par_iter()
            .flat_map_iter(|(_, outcome)| {
                enumerator
                    .enumerate(outcome, cancel)
                    .into_iter()
                    .map(|path| classifier.classify(path))
            })
            .collect();

        let mut all = deduplicate(all);
        let paths_capped = all.len() > self.config.max_paths;
        all.truncate(self.config.max_paths);

        let (findings, low_confidence): (Vec<_>, Vec<_>) =
            all.into_iter().partition(|f| classifier.is_primary(f));

        let diagnostics = RunDiagnostics {
            functions_analyzed: outcomes.len(),
            summaries_computed: phase1.summaries_computed,
            sources_found: outcomes.iter().map(|(_, o)| o.source_seeds.len()).sum(),
            unresolved_boundaries: outcomes
                .iter()
                .map(|(_, o)| o.unresolved_boundaries.len())
                .sum(),
            truncated_functions: outcomes.iter().filter(|(_, o)| o.truncated).count(),
            nonconverged_clusters: phase1.nonconverged_clusters,
            paths_capped,
            cancelled: phase1.cancelled || cancel.is_cancelled(),
            duration_ms: start.elapsed().as_millis() as u64,
        };
        debug!(?diagnostics, "taint analysis finished");
        info!(
            findings = findings.len(),
            low_confidence = low_confidence.len(),
            "taint analysis complete"
        );

        AnalysisReport {
            findings,
            low_confidence,
            diagnostics,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        ArgBinding, Argument, BasicBlock, BlockId, CallSite, CallSiteId, Callee, ProgramInput,
        Statement, Symbol,
    };
    use pretty_assertions::assert_eq;

    fn engine(input: ProgramInput, config: EngineConfig) -> TaintEngine {
        TaintEngine::new(
            ProgramSnapshot::build(input).unwrap(),
            PatternCatalog::default(),
            config,
        )
        .unwrap()
    }

    fn symbol(id: u32, name: &str, file: &str, block: u32) -> Symbol {
        Symbol {
            id: SymbolId(id),
            name: name.to_string(),
            file: file.to_string(),
            line: 1,
            parameters: vec![],
            entry_block: BlockId(block),
            exit_block: BlockId(block),
        }
    }

    fn call(
        id: u32,
        block: u32,
        target: &str,
        receiver: Option<&str>,
        args: &[&str],
        line: u32,
    ) -> CallSite {
        CallSite {
            id: CallSiteId(id),
            block: BlockId(block),
            target: target.to_string(),
            callee: Callee::Unresolved { reason: None },
            receiver: receiver.map(str::to_string),
            args: args
                .iter()
                .enumerate()
                .map(|(index, var)| Argument {
                    var: Some(var.to_string()),
                    binding: ArgBinding::Positional { index },
                })
                .collect(),
            line,
            column: 1,
        }
    }

    fn direct_flow_program() -> ProgramInput {
        ProgramInput {
            symbols: vec![symbol(0, "handler", "handler.py", 0)],
            blocks: vec![BasicBlock {
                id: BlockId(0),
                function: SymbolId(0),
                statements: vec![
                    Statement::Call { call_site: CallSiteId(0) },
                    Statement::Call { call_site: CallSiteId(1) },
                ],
            }],
            edges: vec![],
            call_sites: vec![
                call(0, 0, "request.get", Some("data"), &[], 10),
                call(1, 0, "cursor.execute", None, &["data"], 11),
            ],
        }
    }

    #[test]
    fn test_end_to_end_direct_flow() {
        let report = engine(direct_flow_program(), EngineConfig::default()).run();

        assert_eq!(report.findings.len(), 1);
        assert!(report.low_confidence.is_empty());
        let finding = &report.findings[0];
        assert_eq!(finding.vulnerability, "SQL Injection");
        assert_eq!(finding.confidence, 1.0);
        assert_eq!(report.diagnostics.sources_found, 1);
        assert!(!report.diagnostics.cancelled);
        assert_eq!(report.by_category()[&VulnCategory::Sql], 1);
    }

    #[test]
    fn test_invalid_config_rejected_up_front() {
        let snapshot = ProgramSnapshot::build(direct_flow_program()).unwrap();
        let result = TaintEngine::new(
            snapshot,
            PatternCatalog::default(),
            EngineConfig::default().max_depth(99),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_cancelled_token_stops_the_run() {
        let engine = engine(direct_flow_program(), EngineConfig::default());
        let token = CancelToken::unbounded();
        token.cancel();

        let report = engine.run_cancellable(&token);
        assert!(report.diagnostics.cancelled);
        assert!(report.findings.is_empty());
    }

    #[test]
    fn test_cross_function_flow_is_reported() {
        // handler: data = request.get(); run_query(data)
        // run_query(q): cursor.execute(q)
        let input = ProgramInput {
            symbols: vec![
                symbol(0, "handler", "handler.py", 0),
                Symbol {
                    id: SymbolId(1),
                    name: "run_query".to_string(),
                    file: "db.py".to_string(),
                    line: 1,
                    parameters: vec![crate::model::Parameter {
                        name: "q".to_string(),
                        position: 0,
                        default_value: None,
                    }],
                    entry_block: BlockId(1),
                    exit_block: BlockId(1),
                },
            ],
            blocks: vec![
                BasicBlock {
                    id: BlockId(0),
                    function: SymbolId(0),
                    statements: vec![
                        Statement::Call { call_site: CallSiteId(0) },
                        Statement::Call { call_site: CallSiteId(1) },
                    ],
                },
                BasicBlock {
                    id: BlockId(1),
                    function: SymbolId(1),
                    statements: vec![Statement::Call { call_site: CallSiteId(2) }],
                },
            ],
            edges: vec![],
            call_sites: vec![
                call(0, 0, "request.get", Some("data"), &[], 10),
                CallSite {
                    id: CallSiteId(1),
                    block: BlockId(0),
                    target: "run_query".to_string(),
                    callee: Callee::Resolved { symbol: SymbolId(1) },
                    receiver: None,
                    args: vec![Argument {
                        var: Some("data".to_string()),
                        binding: ArgBinding::Positional { index: 0 },
                    }],
                    line: 11,
                    column: 1,
                },
                call(2, 1, "cursor.execute", None, &["q"], 20),
            ],
        };
        let report = engine(input, EngineConfig::default()).run();

        assert_eq!(report.findings.len(), 1);
        let finding = &report.findings[0];
        // Source in handler.py, sink in db.py
        assert_eq!(finding.path.source.file, "handler.py");
        assert_eq!(finding.path.sink.file, "db.py");
        assert!(finding.path.crosses_files);
        assert!((finding.confidence - 0.85).abs() < 1e-6);
        // call_entry into run_query, then the flattened sink step
        assert!(finding
            .path
            .steps
            .iter()
            .any(|s| s.kind == crate::propagation::StepKind::CallEntry));
        assert_eq!(
            finding.path.steps.last().unwrap().kind,
            crate::propagation::StepKind::SinkReached
        );
    }

    #[test]
    fn test_threshold_partitions_findings() {
        // An unresolved hop drops confidence to 0.7; with a threshold
        // above that the finding moves to the low-confidence bucket.
        let input = ProgramInput {
            symbols: vec![symbol(0, "handler", "handler.py", 0)],
            blocks: vec![BasicBlock {
                id: BlockId(0),
                function: SymbolId(0),
                statements: vec![
                    Statement::Call { call_site: CallSiteId(0) },
                    Statement::Call { call_site: CallSiteId(1) },
                    Statement::Call { call_site: CallSiteId(2) },
                ],
            }],
            edges: vec![],
            call_sites: vec![
                call(0, 0, "request.get", Some("data"), &[], 10),
                call(1, 0, "plugin.transform", Some("out"), &["data"], 11),
                call(2, 0, "cursor.execute", None, &["out"], 12),
            ],
        };

        let report = engine(input.clone(), EngineConfig::default()).run();
        assert_eq!(report.findings.len(), 1);
        assert!((report.findings[0].confidence - 0.7).abs() < 1e-6);
        assert_eq!(report.diagnostics.unresolved_boundaries, 1);

        let strict = engine(input, EngineConfig::default().confidence_threshold(0.8)).run();
        assert!(strict.findings.is_empty());
        assert_eq!(strict.low_confidence.len(), 1);
    }

    #[test]
    fn test_path_cap_sets_diagnostic() {
        let report = engine(direct_flow_program(), EngineConfig::default().max_paths(1)).run();
        assert!(!report.diagnostics.paths_capped);

        // Two sources, two sinks, cap of one.
        let input = ProgramInput {
            symbols: vec![symbol(0, "handler", "handler.py", 0)],
            blocks: vec![BasicBlock {
                id: BlockId(0),
                function: SymbolId(0),
                statements: (0..4)
                    .map(|i| Statement::Call { call_site: CallSiteId(i) })
                    .collect(),
            }],
            edges: vec![],
            call_sites: vec![
                call(0, 0, "request.get", Some("a"), &[], 10),
                call(1, 0, "request.post", Some("b"), &[], 11),
                call(2, 0, "cursor.execute", None, &["a"], 12),
                call(3, 0, "os.system", None, &["b"], 13),
            ],
        };
        let report = engine(input, EngineConfig::default().max_paths(1)).run();
        assert!(report.diagnostics.paths_capped);
        assert_eq!(report.findings.len() + report.low_confidence.len(), 1);
    }
}
