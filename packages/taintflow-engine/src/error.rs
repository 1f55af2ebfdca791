//! Engine error types
//!
//! Two fatal families per the error taxonomy: setup errors (referential
//! integrity violations in consumed tables — the engine refuses to run) and
//! configuration errors (rejected at load time with a precise description).
//! Expected analysis boundaries (unresolved callees, iteration-cap
//! exhaustion, cancellation) are never errors; they surface as diagnostics
//! on summaries and paths.

use thiserror::Error;

use crate::model::{BlockId, CallSiteId, SymbolId};

/// Referential integrity violation in the consumed symbol/block/call tables.
///
/// These indicate an upstream indexer defect. There is no partial-trust
/// fallback: `ProgramSnapshot::build` returns the first violation found and
/// the engine never runs on the inconsistent input.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SetupError {
    #[error("duplicate symbol id {0:?}")]
    DuplicateSymbol(SymbolId),

    #[error("duplicate block id {0:?}")]
    DuplicateBlock(BlockId),

    #[error("duplicate call site id {0:?}")]
    DuplicateCallSite(CallSiteId),

    #[error("block {block:?} belongs to unknown function {function:?}")]
    BlockWithoutFunction { block: BlockId, function: SymbolId },

    #[error("control-flow edge {from:?} -> {to:?} references a nonexistent block")]
    DanglingEdge { from: BlockId, to: BlockId },

    #[error("control-flow edge {from:?} -> {to:?} crosses a function boundary")]
    CrossFunctionEdge { from: BlockId, to: BlockId },

    #[error("symbol {symbol:?} declares boundary block {block:?} which does not exist or belongs to another function")]
    MissingBoundaryBlock { symbol: SymbolId, block: BlockId },

    #[error("call site {call_site:?} references unknown block {block:?}")]
    CallSiteWithoutBlock { call_site: CallSiteId, block: BlockId },

    #[error("call site {call_site:?} resolves to unknown symbol {symbol:?}")]
    CallSiteUnknownSymbol { call_site: CallSiteId, symbol: SymbolId },

    #[error("statement in block {block:?} references unknown call site {call_site:?}")]
    StatementUnknownCallSite { block: BlockId, call_site: CallSiteId },

    #[error("call site {call_site:?} binds positional argument {index} but callee '{callee}' declares only {arity} parameters")]
    ArityExceeded {
        call_site: CallSiteId,
        index: usize,
        callee: String,
        arity: usize,
    },

    #[error("call site {call_site:?} binds keyword '{keyword}' not declared by callee '{callee}'")]
    UnknownKeyword {
        call_site: CallSiteId,
        keyword: String,
        callee: String,
    },
}

/// Top-level engine error.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Setup(#[from] SetupError),

    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),

    #[error(transparent)]
    Catalog(#[from] crate::catalog::CatalogError),

    #[error("snapshot parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;
