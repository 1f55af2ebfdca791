//! Persistent storage for taint analysis results
//!
//! Analysis reports from `taintflow-engine` are persisted row-per-fact:
//! one row per run, per finding, per path step. Nothing is serialized
//! into opaque blobs, so every question a reviewer asks ("which runs
//! touched this file", "all command injections ever found") stays a
//! plain SQL query.
//!
//! ```rust,ignore
//! use taintflow_storage::{FindingStore, SqliteFindingStore};
//!
//! let store = SqliteFindingStore::open(".taintflow/findings.db")?;
//! let run_id = store.save_report(&report)?;
//!
//! for finding in store.findings_by_category("sql")? {
//!     println!("{}: {}:{}", finding.vulnerability, finding.sink_file, finding.sink_line);
//! }
//! ```

pub mod domain;
pub mod error;

#[cfg(feature = "sqlite")]
pub mod infrastructure;

pub use domain::{FindingStore, RunRecord, StoredFinding, StoredStep};
pub use error::{Result, StorageError};

#[cfg(feature = "sqlite")]
pub use infrastructure::SqliteFindingStore;
