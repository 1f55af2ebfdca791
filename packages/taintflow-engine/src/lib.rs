//! Interprocedural taint analysis engine
//!
//! Tracks untrusted data from source calls (HTTP parameters, environment,
//! stdin) through assignments and function calls to dangerous sinks (SQL
//! execution, shell commands, markup writes), and materializes each flow
//! as a scored, step-by-step finding.
//!
//! The analysis runs in two phases over an immutable [`model::ProgramSnapshot`]:
//!
//! 1. **Summaries** — [`interprocedural::InterproceduralAnalyzer`] walks the
//!    call graph bottom-up (Tarjan components, parallel per level) and
//!    memoizes one [`summary::FunctionSummary`] per function and tainted
//!    parameter, iterating recursion clusters to a fixed point.
//! 2. **Flows** — [`propagation::Propagator`] runs a worklist dataflow per
//!    function seeded by catalog sources, [`paths::PathEnumerator`] turns
//!    the resulting flow graphs into shortest source-to-sink paths, and
//!    [`classify::Classifier`] scores them.
//!
//! ```no_run
//! use taintflow_engine::{EngineConfig, PatternCatalog, Preset, ProgramSnapshot, TaintEngine};
//!
//! # fn main() -> taintflow_engine::Result<()> {
//! let snapshot = ProgramSnapshot::from_json_str(r#"{"symbols":[],"blocks":[],"edges":[],"call_sites":[]}"#)?;
//! let engine = TaintEngine::new(
//!     snapshot,
//!     PatternCatalog::default(),
//!     EngineConfig::from_preset(Preset::Balanced),
//! )?;
//! let report = engine.run();
//! for finding in &report.findings {
//!     println!("{} ({:.2})", finding.vulnerability, finding.confidence);
//! }
//! # Ok(())
//! # }
//! ```

pub mod catalog;
pub mod classify;
pub mod config;
pub mod engine;
pub mod error;
pub mod interprocedural;
pub mod model;
pub mod paths;
pub mod propagation;
pub mod summary;

pub use catalog::{PatternCatalog, VulnCategory};
pub use classify::{Finding, Severity};
pub use config::{ConfigError, EngineConfig, Preset};
pub use engine::{AnalysisReport, CancelToken, RunDiagnostics, TaintEngine};
pub use error::{EngineError, Result, SetupError};
pub use model::{ProgramInput, ProgramSnapshot};
pub use paths::TaintPath;
pub use propagation::StepKind;
