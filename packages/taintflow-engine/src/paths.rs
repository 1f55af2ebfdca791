//! Taint path enumeration
//!
//! Propagation leaves behind a flow graph per function: nodes are
//! variables, calls and sinks, edges are observed taint flows. This module
//! walks that graph breadth-first from every source occurrence and
//! materializes one shortest path per `(source, sink, category)`. BFS over
//! a sorted adjacency list with a first-visit parent map is fully
//! deterministic: same input, same paths, same order.

use std::collections::VecDeque;

use ahash::{AHashMap, AHashSet};
use serde::{Deserialize, Serialize};

use crate::catalog::VulnCategory;
use crate::config::EngineConfig;
use crate::engine::CancelToken;
use crate::model::{CallSiteId, ProgramSnapshot};
use crate::propagation::{FlowNode, Origin, PropagationOutcome, StepKind};

/// Where tainted data enters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRef {
    pub call_site: CallSiteId,
    pub name: String,
    pub file: String,
    pub line: u32,
}

/// Where tainted data lands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SinkRef {
    pub call_site: CallSiteId,
    pub name: String,
    pub category: VulnCategory,
    pub file: String,
    pub line: u32,
}

/// One hop along a materialized path. `symbol` names the function the
/// step lands in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathStep {
    pub kind: StepKind,
    pub description: String,
    pub symbol: String,
    pub file: String,
    pub line: u32,
    pub column: u32,
}

/// A complete source-to-sink flow. A non-truncated path always ends with
/// a `SinkReached` step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaintPath {
    pub source: SourceRef,
    pub sink: SinkRef,
    pub steps: Vec<PathStep>,
    /// Taint passed a sanitizer of a non-matching category.
    pub sanitizer_bypassed: bool,
    /// The flow crosses a call whose target could not be resolved.
    pub crosses_unresolved: bool,
    /// Source and sink (or an intermediate step) live in different files.
    pub crosses_files: bool,
    /// The underlying propagation hit an iteration or depth cap; the path
    /// is real but the surrounding analysis is a lower bound.
    pub truncated: bool,
}

struct Graph {
    nodes: Vec<FlowNode>,
    index: AHashMap<FlowNode, usize>,
    adjacency: Vec<Vec<(usize, StepKind, u32, u32)>>,
}

impl Graph {
    fn build(outcome: &PropagationOutcome) -> Self {
        let mut graph = Graph {
            nodes: Vec::new(),
            index: AHashMap::new(),
            adjacency: Vec::new(),
        };
        for edge in &outcome.flow_edges {
            let from = graph.intern(&edge.from);
            let to = graph.intern(&edge.to);
            graph.adjacency[from].push((to, edge.kind, edge.line, edge.column));
        }
        for edges in &mut graph.adjacency {
            edges.sort_by_key(|(to, kind, line, column)| (*kind, *to, *line, *column));
        }
        graph
    }

    fn intern(&mut self, node: &FlowNode) -> usize {
        if let Some(i) = self.index.get(node) {
            return *i;
        }
        let i = self.nodes.len();
        self.nodes.push(node.clone());
        self.index.insert(node.clone(), i);
        self.adjacency.push(Vec::new());
        i
    }
}

pub struct PathEnumerator<'a> {
    snapshot: &'a ProgramSnapshot,
    config: &'a EngineConfig,
}

impl<'a> PathEnumerator<'a> {
    pub fn new(snapshot: &'a ProgramSnapshot, config: &'a EngineConfig) -> Self {
        Self { snapshot, config }
    }

    /// Enumerate paths for one function's converged flow graph. Sources
    /// are walked in body order; each reachable sink yields one shortest
    /// path per category the sink was actually hit with. The token is
    /// observed at every frontier node; a tripped token stops the walk and
    /// marks whatever was already materialized as truncated.
    pub fn enumerate(&self, outcome: &PropagationOutcome, cancel: &CancelToken) -> Vec<TaintPath> {
        let graph = Graph::build(outcome);
        let mut paths = Vec::new();
        let mut tripped = false;

        for (source_site, source_id) in &outcome.source_seeds {
            let origin = Origin::Source {
                call_site: *source_site,
                source: *source_id,
            };
            let Some(&start) = graph.index.get(&FlowNode::Call(*source_site)) else {
                continue; // source value never flowed anywhere
            };

            // BFS with call-hop budget; first visit fixes the parent.
            let mut visited: AHashSet<usize> = AHashSet::from([start]);
            let mut parent: AHashMap<usize, (usize, StepKind, u32, u32)> = AHashMap::new();
            let mut queue = VecDeque::from([(start, 0usize)]);
            let mut sinks_reached: Vec<usize> = Vec::new();

            while let Some((node, hops)) = queue.pop_front() {
                if cancel.is_cancelled() {
                    tripped = true;
                    break;
                }
                for (next, kind, line, column) in &graph.adjacency[node] {
                    if visited.contains(next) {
                        continue;
                    }
                    let hops = match kind {
                        StepKind::CallEntry => hops + 1,
                        _ => hops,
                    };
                    if hops > self.config.max_depth {
                        continue;
                    }
                    visited.insert(*next);
                    parent.insert(*next, (node, *kind, *line, *column));
                    match &graph.nodes[*next] {
                        FlowNode::Sink(_) => sinks_reached.push(*next),
                        _ => queue.push_back((*next, hops)),
                    }
                }
            }

            for sink_node in sinks_reached {
                let FlowNode::Sink(sink_site) = &graph.nodes[sink_node] else {
                    continue;
                };
                // One path per category this origin actually hit the sink with.
                let mut categories: Vec<(VulnCategory, bool)> = Vec::new();
                for hit in &outcome.sink_hits {
                    if hit.call_site == *sink_site
                        && hit.origins.contains(&origin)
                        && !categories.iter().any(|(c, _)| *c == hit.category)
                    {
                        categories.push((hit.category, hit.sanitizer_bypassed));
                    }
                }
                if categories.is_empty() {
                    continue; // reachable in the graph, but via another origin
                }

                let steps = self.reconstruct(&graph, &parent, start, sink_node);
                let source_ref = self.source_ref(*source_site);
                let crosses_unresolved = self.path_crosses(&graph, &parent, start, sink_node, |n| {
                    matches!(n, FlowNode::Call(cs) if outcome.unresolved_boundaries.contains(cs))
                });
                let crosses_files = steps.iter().any(|s| s.file != source_ref.file);

                for (category, sanitizer_bypassed) in categories {
                    paths.push(TaintPath {
                        source: source_ref.clone(),
                        sink: self.sink_ref(*sink_site, category),
                        steps: steps.clone(),
                        sanitizer_bypassed,
                        crosses_unresolved,
                        crosses_files,
                        truncated: outcome.truncated,
                    });
                }
            }

            if tripped {
                break;
            }
        }

        if tripped {
            // Partial enumeration; every returned path is a lower bound.
            for path in &mut paths {
                path.truncated = true;
            }
        }

        paths.sort_by(|a, b| {
            (a.source.call_site, a.sink.call_site, a.sink.category).cmp(&(
                b.source.call_site,
                b.sink.call_site,
                b.sink.category,
            ))
        });
        paths
    }

    fn reconstruct(
        &self,
        graph: &Graph,
        parent: &AHashMap<usize, (usize, StepKind, u32, u32)>,
        start: usize,
        end: usize,
    ) -> Vec<PathStep> {
        let mut chain = Vec::new();
        let mut node = end;
        while node != start {
            let (prev, kind, line, column) = parent[&node];
            chain.push((prev, node, kind, line, column));
            node = prev;
        }
        chain.reverse();

        chain
            .into_iter()
            .map(|(from, to, kind, line, column)| {
                let landing = self.enclosing_symbol(&graph.nodes[to]);
                PathStep {
                    kind,
                    description: format!(
                        "{} -> {}",
                        self.label(&graph.nodes[from]),
                        self.label(&graph.nodes[to])
                    ),
                    symbol: landing.name.clone(),
                    file: landing.file.clone(),
                    line,
                    column,
                }
            })
            .collect()
    }

    fn path_crosses(
        &self,
        graph: &Graph,
        parent: &AHashMap<usize, (usize, StepKind, u32, u32)>,
        start: usize,
        end: usize,
        pred: impl Fn(&FlowNode) -> bool,
    ) -> bool {
        let mut node = end;
        while node != start {
            if pred(&graph.nodes[node]) {
                return true;
            }
            node = parent[&node].0;
        }
        pred(&graph.nodes[start])
    }

    fn label(&self, node: &FlowNode) -> String {
        match node {
            FlowNode::Var { name, .. } => name.clone(),
            FlowNode::Call(cs) | FlowNode::Sink(cs) => {
                self.snapshot.call_site(*cs).target.clone()
            }
        }
    }

    fn enclosing_symbol(&self, node: &FlowNode) -> &crate::model::Symbol {
        let symbol = match node {
            FlowNode::Var { function, .. } => *function,
            FlowNode::Call(cs) | FlowNode::Sink(cs) => {
                let block = self.snapshot.call_site(*cs).block;
                self.snapshot.block(block).function
            }
        };
        self.snapshot.symbol(symbol)
    }

    fn source_ref(&self, call_site: CallSiteId) -> SourceRef {
        let cs = self.snapshot.call_site(call_site);
        let function = self.snapshot.block(cs.block).function;
        SourceRef {
            call_site,
            name: cs.target.clone(),
            file: self.snapshot.symbol(function).file.clone(),
            line: cs.line,
        }
    }

    fn sink_ref(&self, call_site: CallSiteId, category: VulnCategory) -> SinkRef {
        let cs = self.snapshot.call_site(call_site);
        let function = self.snapshot.block(cs.block).function;
        SinkRef {
            call_site,
            name: cs.target.clone(),
            category,
            file: self.snapshot.symbol(function).file.clone(),
            line: cs.line,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::PatternCatalog;
    use crate::model::{
        ArgBinding, Argument, BasicBlock, BlockId, CallSite, Callee, ProgramInput, Statement,
        Symbol, SymbolId,
    };
    use crate::propagation::{Propagator, TaintSeed};
    use crate::summary::SummaryStore;
    use pretty_assertions::assert_eq;

    fn single_function_program(statements: Vec<Statement>, call_sites: Vec<CallSite>) -> ProgramSnapshot {
        ProgramSnapshot::build(ProgramInput {
            symbols: vec![Symbol {
                id: SymbolId(0),
                name: "handler".to_string(),
                file: "handler.py".to_string(),
                line: 1,
                parameters: vec![],
                entry_block: BlockId(0),
                exit_block: BlockId(0),
            }],
            blocks: vec![BasicBlock {
                id: BlockId(0),
                function: SymbolId(0),
                statements,
            }],
            edges: vec![],
            call_sites,
        })
        .unwrap()
    }

    fn call(
        id: u32,
        target: &str,
        receiver: Option<&str>,
        args: &[&str],
        line: u32,
    ) -> CallSite {
        CallSite {
            id: CallSiteId(id),
            block: BlockId(0),
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

    fn propagate(snapshot: &ProgramSnapshot, config: &EngineConfig) -> PropagationOutcome {
        let catalog = PatternCatalog::default();
        let store = SummaryStore::new();
        Propagator::new(snapshot, &catalog, config).run(SymbolId(0), TaintSeed::Sources, &store)
    }

    fn enumerate(snapshot: &ProgramSnapshot, config: &EngineConfig) -> Vec<TaintPath> {
        let outcome = propagate(snapshot, config);
        PathEnumerator::new(snapshot, config).enumerate(&outcome, &CancelToken::unbounded())
    }

    #[test]
    fn test_direct_path_shape() {
        // data = request.get(); query = data; cursor.execute(query)
        let snapshot = single_function_program(
            vec![
                Statement::Call { call_site: CallSiteId(0) },
                Statement::Assign {
                    target: "query".to_string(),
                    sources: vec!["data".to_string()],
                    augmented: false,
                    line: 11,
                    column: 1,
                },
                Statement::Call { call_site: CallSiteId(1) },
            ],
            vec![
                call(0, "request.get", Some("data"), &[], 10),
                call(1, "cursor.execute", None, &["query"], 12),
            ],
        );
        let paths = enumerate(&snapshot, &EngineConfig::default());

        assert_eq!(paths.len(), 1);
        let path = &paths[0];
        assert_eq!(path.source.name, "request.get");
        assert_eq!(path.sink.name, "cursor.execute");
        assert_eq!(path.sink.category, VulnCategory::Sql);
        assert!(!path.truncated);
        assert!(!path.crosses_files);

        // source -> data, data -> query, query -> sink
        assert_eq!(path.steps.len(), 3);
        assert_eq!(path.steps[0].kind, StepKind::IntraPropagation);
        assert_eq!(path.steps.last().unwrap().kind, StepKind::SinkReached);
        assert_eq!(path.steps.last().unwrap().line, 12);
        assert_eq!(path.steps[0].symbol, "handler");
    }

    #[test]
    fn test_deterministic_across_runs() {
        let build = || {
            let snapshot = single_function_program(
                vec![
                    Statement::Call { call_site: CallSiteId(0) },
                    Statement::Call { call_site: CallSiteId(1) },
                    Statement::Call { call_site: CallSiteId(2) },
                    Statement::Call { call_site: CallSiteId(3) },
                ],
                vec![
                    call(0, "request.get", Some("a"), &[], 10),
                    call(1, "request.post", Some("b"), &[], 11),
                    call(2, "cursor.execute", None, &["a"], 12),
                    call(3, "os.system", None, &["b"], 13),
                ],
            );
            enumerate(&snapshot, &EngineConfig::default())
        };
        let first = build();
        let second = build();
        assert_eq!(first, second);
        assert_eq!(first.len(), 2);
    }

    #[test]
    fn test_one_path_per_sink_even_with_two_routes() {
        // Two assignments both feed the same sink variable; BFS keeps the
        // shortest route only.
        let snapshot = single_function_program(
            vec![
                Statement::Call { call_site: CallSiteId(0) },
                Statement::Assign {
                    target: "mid".to_string(),
                    sources: vec!["data".to_string()],
                    augmented: false,
                    line: 11,
                    column: 1,
                },
                Statement::Assign {
                    target: "query".to_string(),
                    sources: vec!["data".to_string(), "mid".to_string()],
                    augmented: false,
                    line: 12,
                    column: 1,
                },
                Statement::Call { call_site: CallSiteId(1) },
            ],
            vec![
                call(0, "request.get", Some("data"), &[], 10),
                call(1, "cursor.execute", None, &["query"], 13),
            ],
        );
        let paths = enumerate(&snapshot, &EngineConfig::default());

        assert_eq!(paths.len(), 1);
        // Shortest: source -> data -> query -> sink (skips mid)
        assert_eq!(paths[0].steps.len(), 3);
    }

    #[test]
    fn test_unresolved_crossing_is_flagged() {
        let snapshot = single_function_program(
            vec![
                Statement::Call { call_site: CallSiteId(0) },
                Statement::Call { call_site: CallSiteId(1) },
                Statement::Call { call_site: CallSiteId(2) },
            ],
            vec![
                call(0, "request.get", Some("data"), &[], 10),
                call(1, "plugin.transform", Some("out"), &["data"], 11),
                call(2, "cursor.execute", None, &["out"], 12),
            ],
        );
        let paths = enumerate(&snapshot, &EngineConfig::default());

        assert_eq!(paths.len(), 1);
        assert!(paths[0].crosses_unresolved);
        assert!(paths[0]
            .steps
            .iter()
            .any(|s| s.kind == StepKind::CallEntry));
    }

    #[test]
    fn test_tripped_token_halts_enumeration() {
        // Same program as test_direct_path_shape, but the token trips
        // before the first frontier node is expanded: the walk stops and
        // no path is materialized.
        let snapshot = single_function_program(
            vec![
                Statement::Call { call_site: CallSiteId(0) },
                Statement::Call { call_site: CallSiteId(1) },
            ],
            vec![
                call(0, "request.get", Some("data"), &[], 10),
                call(1, "cursor.execute", None, &["data"], 11),
            ],
        );
        let config = EngineConfig::default();
        let outcome = propagate(&snapshot, &config);

        let token = CancelToken::unbounded();
        token.cancel();
        let paths = PathEnumerator::new(&snapshot, &config).enumerate(&outcome, &token);
        assert!(paths.is_empty());

        // The same outcome yields the path once the token is live.
        let paths =
            PathEnumerator::new(&snapshot, &config).enumerate(&outcome, &CancelToken::unbounded());
        assert_eq!(paths.len(), 1);
    }

    #[test]
    fn test_source_with_no_flow_yields_nothing() {
        let snapshot = single_function_program(
            vec![Statement::Call { call_site: CallSiteId(0) }],
            vec![call(0, "request.get", Some("data"), &[], 10)],
        );
        let paths = enumerate(&snapshot, &EngineConfig::default());
        assert!(paths.is_empty());
    }
}
