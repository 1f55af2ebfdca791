//! Interprocedural summary computation
//!
//! Builds the call graph over resolved call sites, collapses it into
//! strongly connected components, and computes per-parameter taint
//! summaries bottom-up: callees before callers, so every summary a caller
//! needs is already published when its turn comes. Components at the same
//! condensation level have no dependencies between them and are analyzed
//! in parallel. Mutually recursive clusters iterate to a fixed point
//! within a bounded number of rounds; summaries still changing at the cap
//! are published as truncated lower bounds.

use ahash::AHashMap;
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use rayon::prelude::*;
use tracing::{debug, warn};

use crate::catalog::PatternCatalog;
use crate::config::EngineConfig;
use crate::engine::CancelToken;
use crate::model::{ProgramSnapshot, SymbolId};
use crate::propagation::{Origin, PropagationOutcome, Propagator, TaintSeed};
use crate::summary::{FunctionSummary, ParamSet, SummaryKey, SummaryStore, SummarySink};

/// What phase one produced, for run diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SummaryPhaseReport {
    pub functions_analyzed: usize,
    pub summaries_computed: usize,
    /// Recursion clusters that did not converge within the round cap.
    pub nonconverged_clusters: usize,
    pub cancelled: bool,
}

pub struct InterproceduralAnalyzer<'a> {
    snapshot: &'a ProgramSnapshot,
    catalog: &'a PatternCatalog,
    config: &'a EngineConfig,
}

impl<'a> InterproceduralAnalyzer<'a> {
    pub fn new(
        snapshot: &'a ProgramSnapshot,
        catalog: &'a PatternCatalog,
        config: &'a EngineConfig,
    ) -> Self {
        Self {
            snapshot,
            catalog,
            config,
        }
    }

    /// Compute one summary per `(function, single tainted parameter)` and
    /// publish them into `store`. Multi-parameter queries are answered by
    /// the store combining single-parameter summaries on the fly.
    pub fn compute_summaries(
        &self,
        store: &SummaryStore,
        cancel: &CancelToken,
    ) -> SummaryPhaseReport {
        let (graph, index_of) = self.build_call_graph();
        let sccs = tarjan_scc(&graph);
        let levels = condensation_levels(&graph, &sccs);

        let mut report = SummaryPhaseReport {
            functions_analyzed: self.snapshot.symbol_count(),
            ..Default::default()
        };

        for level in &levels {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            let nonconverged: usize = level
                .par_iter()
                .map(|scc_index| {
                    let members: Vec<SymbolId> =
                        sccs[*scc_index].iter().map(|n| graph[*n]).collect();
                    self.analyze_component(&members, &graph, &index_of, store, cancel)
                })
                .map(usize::from)
                .sum();
            report.nonconverged_clusters += nonconverged;
        }

        report.summaries_computed = store.len();
        debug!(
            functions = report.functions_analyzed,
            summaries = report.summaries_computed,
            nonconverged = report.nonconverged_clusters,
            "summary phase complete"
        );
        report
    }

    fn build_call_graph(&self) -> (DiGraph<SymbolId, ()>, AHashMap<SymbolId, NodeIndex>) {
        let mut graph = DiGraph::new();
        let mut index_of = AHashMap::with_capacity(self.snapshot.symbol_count());
        for symbol in self.snapshot.symbols() {
            index_of.insert(symbol.id, graph.add_node(symbol.id));
        }
        for symbol in self.snapshot.symbols() {
            for callee in self.snapshot.callees_of(symbol.id) {
                graph.add_edge(index_of[&symbol.id], index_of[&callee], ());
            }
        }
        (graph, index_of)
    }

    /// Analyze one strongly connected component. Returns true when the
    /// component is recursive and did not converge within the round cap.
    fn analyze_component(
        &self,
        members: &[SymbolId],
        graph: &DiGraph<SymbolId, ()>,
        index_of: &AHashMap<SymbolId, NodeIndex>,
        store: &SummaryStore,
        cancel: &CancelToken,
    ) -> bool {
        let recursive = members.len() > 1
            || graph.contains_edge(index_of[&members[0]], index_of[&members[0]]);
        let propagator = Propagator::new(self.snapshot, self.catalog, self.config);

        if !recursive {
            let function = members[0];
            if cancel.is_cancelled() {
                return false;
            }
            for key in self.param_keys(function) {
                let outcome = propagator.run(function, TaintSeed::Params(key.tainted_params), store);
                store.publish(key, summarize(key, &outcome));
            }
            return false;
        }

        // Kleene iteration from bottom: seed every key with the identity
        // summary, then recompute rounds until nothing changes.
        let keys: Vec<SummaryKey> = members
            .iter()
            .flat_map(|f| self.param_keys(*f))
            .collect();
        for key in &keys {
            store.replace(*key, FunctionSummary::default());
        }

        for _round in 0..self.config.scc_max_rounds {
            if cancel.is_cancelled() {
                return false;
            }
            let mut changed = false;
            for key in &keys {
                let outcome =
                    propagator.run(key.function, TaintSeed::Params(key.tainted_params), store);
                let next = summarize(*key, &outcome);
                if store.get(*key).map(|cur| *cur != next).unwrap_or(true) {
                    store.replace(*key, next);
                    changed = true;
                }
            }
            if !changed {
                return false;
            }
        }

        // Round cap hit: publish what we have as lower bounds.
        warn!(
            members = members.len(),
            rounds = self.config.scc_max_rounds,
            "recursion cluster did not converge, summaries truncated"
        );
        for key in &keys {
            let mut summary = store
                .get(*key)
                .map(|s| (*s).clone())
                .unwrap_or_default();
            summary.truncated = true;
            store.replace(*key, summary);
        }
        true
    }

    fn param_keys(&self, function: SymbolId) -> Vec<SummaryKey> {
        let arity = self.snapshot.symbol(function).parameters.len().min(64);
        (0..arity as u8)
            .map(|p| SummaryKey {
                function,
                tainted_params: ParamSet::single(p),
            })
            .collect()
    }
}

/// Build a summary from a single-parameter seed run.
fn summarize(key: SummaryKey, outcome: &PropagationOutcome) -> FunctionSummary {
    debug_assert_eq!(key.tainted_params.len(), 1);
    let param = key
        .tainted_params
        .iter()
        .next()
        .unwrap_or_default();
    let param_origin = Origin::Param(param);

    let returns_taint = if outcome.return_origins.contains(&param_origin) {
        key.tainted_params
    } else {
        ParamSet::EMPTY
    };

    let mut sink_reaches: Vec<SummarySink> = Vec::new();
    for hit in &outcome.sink_hits {
        if !hit.origins.contains(&param_origin) {
            continue;
        }
        let candidate = SummarySink {
            param,
            call_site: hit.call_site,
            sink: hit.sink,
            category: hit.category,
            sanitizer_bypassed: hit.sanitizer_bypassed,
            depth: hit.depth,
        };
        match sink_reaches
            .iter_mut()
            .find(|s| s.call_site == candidate.call_site && s.sink == candidate.sink)
        {
            Some(existing) => {
                if candidate.depth < existing.depth {
                    *existing = candidate;
                }
            }
            None => sink_reaches.push(candidate),
        }
    }
    sink_reaches.sort_by_key(|s| (s.call_site, s.sink, s.depth));

    FunctionSummary {
        returns_taint,
        sink_reaches,
        truncated: outcome.truncated,
        unresolved_calls: outcome.unresolved_boundaries.len() as u32,
    }
}

/// Group components into dependency levels: a component's level is one
/// more than the deepest component it calls into, so level N only needs
/// levels below N. `tarjan_scc` returns callees before callers, which is
/// exactly the order needed to assign levels in one pass.
fn condensation_levels(
    graph: &DiGraph<SymbolId, ()>,
    sccs: &[Vec<NodeIndex>],
) -> Vec<Vec<usize>> {
    let mut scc_of: AHashMap<NodeIndex, usize> = AHashMap::new();
    for (i, scc) in sccs.iter().enumerate() {
        for node in scc {
            scc_of.insert(*node, i);
        }
    }

    let mut level_of = vec![0usize; sccs.len()];
    for (i, scc) in sccs.iter().enumerate() {
        let mut level = 0;
        for node in scc {
            for callee in graph.neighbors(*node) {
                let callee_scc = scc_of[&callee];
                if callee_scc != i {
                    level = level.max(level_of[callee_scc] + 1);
                }
            }
        }
        level_of[i] = level;
    }

    let max_level = level_of.iter().copied().max().unwrap_or(0);
    let mut levels = vec![Vec::new(); max_level + 1];
    for (i, level) in level_of.iter().enumerate() {
        levels[*level].push(i);
    }
    levels
}
