//! Function taint summaries
//!
//! A summary answers "given these tainted parameters, what does this
//! function do" without re-walking its body: which parameters flow to the
//! return value, and which sinks become reachable. Summaries are memoized
//! per `(function, tainted-parameter-set)` in a concurrent store so a
//! function called from fifty sites is analyzed once per distinct taint
//! pattern, not fifty times.

use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::catalog::{SinkId, VulnCategory};
use crate::model::{CallSiteId, SymbolId};

/// Bitset of tainted parameter positions.
///
/// Positions 64 and above are not tracked; `insert` saturates silently.
/// Real-world functions do not get close to that arity, and an untracked
/// position only loses precision, never soundness of the positions kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct ParamSet(pub u64);

impl ParamSet {
    pub const EMPTY: ParamSet = ParamSet(0);

    pub fn single(position: u8) -> Self {
        let mut set = Self::EMPTY;
        set.insert(position);
        set
    }

    pub fn insert(&mut self, position: u8) {
        if position < 64 {
            self.0 |= 1 << position;
        }
    }

    pub fn contains(&self, position: u8) -> bool {
        position < 64 && self.0 & (1 << position) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn len(&self) -> u32 {
        self.0.count_ones()
    }

    pub fn union(&self, other: ParamSet) -> ParamSet {
        ParamSet(self.0 | other.0)
    }

    /// Set positions, ascending.
    pub fn iter(&self) -> impl Iterator<Item = u8> + '_ {
        (0..64).filter(move |p| self.contains(*p))
    }
}

/// Memoization key: one summary per distinct taint pattern of a function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SummaryKey {
    pub function: SymbolId,
    pub tainted_params: ParamSet,
}

/// A sink reachable from a tainted parameter, possibly through further
/// calls. `depth` counts call hops from the parameter to the sink; a sink
/// in the function body itself is depth 1.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummarySink {
    pub param: u8,
    pub call_site: CallSiteId,
    pub sink: SinkId,
    pub category: VulnCategory,
    pub sanitizer_bypassed: bool,
    pub depth: u8,
}

/// Immutable taint effect of one function under one taint pattern.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FunctionSummary {
    /// Parameters whose taint reaches the return value.
    pub returns_taint: ParamSet,
    /// Sinks reachable from tainted parameters.
    pub sink_reaches: Vec<SummarySink>,
    /// Propagation hit an iteration cap; the summary is a lower bound.
    pub truncated: bool,
    /// Calls to unresolved targets seen while computing this summary.
    pub unresolved_calls: u32,
}

impl FunctionSummary {
    /// True when the summary carries no taint effect at all.
    pub fn is_identity(&self) -> bool {
        self.returns_taint.is_empty()
            && self.sink_reaches.is_empty()
            && !self.truncated
            && self.unresolved_calls == 0
    }
}

/// Read access to computed summaries during propagation.
///
/// `None` means the summary is not available yet (a recursion-cluster
/// member mid-iteration); the caller proceeds with no effect and the
/// driver iterates to a fixed point.
pub trait SummaryOracle: Sync {
    fn summary(&self, key: SummaryKey) -> Option<Arc<FunctionSummary>>;
}

/// Concurrent summary store shared by all workers.
///
/// Summaries are computed outside the map and published whole; a racing
/// second writer loses and the first value stays, which is safe because
/// both computed the same immutable result from the same inputs.
#[derive(Debug, Default)]
pub struct SummaryStore {
    entries: DashMap<SummaryKey, Arc<FunctionSummary>>,
}

impl SummaryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a summary. The first writer wins.
    pub fn publish(&self, key: SummaryKey, summary: FunctionSummary) -> Arc<FunctionSummary> {
        self.entries
            .entry(key)
            .or_insert_with(|| Arc::new(summary))
            .clone()
    }

    /// Replace a summary unconditionally. Used by the recursion-cluster
    /// fixed point, which overwrites per round until convergence.
    pub fn replace(&self, key: SummaryKey, summary: FunctionSummary) {
        self.entries.insert(key, Arc::new(summary));
    }

    pub fn get(&self, key: SummaryKey) -> Option<Arc<FunctionSummary>> {
        self.entries.get(&key).map(|e| e.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl SummaryOracle for SummaryStore {
    /// Multi-parameter queries are answered by combining single-parameter
    /// summaries: taint effects are unions over independent seeds, so the
    /// combination is exact. Nothing is cached, which keeps mid-iteration
    /// reads of recursion clusters from going stale.
    fn summary(&self, key: SummaryKey) -> Option<Arc<FunctionSummary>> {
        if let Some(summary) = self.get(key) {
            return Some(summary);
        }
        if key.tainted_params.len() < 2 {
            return None;
        }
        let mut combined = FunctionSummary::default();
        for position in key.tainted_params.iter() {
            let single = self.get(SummaryKey {
                function: key.function,
                tainted_params: ParamSet::single(position),
            })?;
            combined.returns_taint = combined.returns_taint.union(single.returns_taint);
            combined
                .sink_reaches
                .extend(single.sink_reaches.iter().cloned());
            combined.truncated |= single.truncated;
            combined.unresolved_calls += single.unresolved_calls;
        }
        combined
            .sink_reaches
            .sort_by_key(|s| (s.param, s.call_site, s.sink, s.depth));
        Some(Arc::new(combined))
    }
}
