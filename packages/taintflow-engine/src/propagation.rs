//! Intraprocedural taint propagation
//!
//! A forward worklist dataflow over one function's control-flow graph.
//! Block states map variable names to taint values; join points union the
//! taint of both predecessors and keep only the sanitization every
//! incoming path performed. The worklist runs to a fixed point (or the
//! iteration cap), then a single deterministic collection pass over the
//! converged states records sink hits, flow edges and diagnostics.

use std::collections::{btree_map, BTreeMap, BTreeSet, VecDeque};

use ahash::{AHashMap, AHashSet};
use serde::{Deserialize, Serialize};

use crate::catalog::{PatternCatalog, PatternMatch, SinkId, SourceId, VulnCategory};
use crate::config::EngineConfig;
use crate::model::{
    ArgBinding, BasicBlock, BlockId, CallSite, Callee, CallSiteId, ProgramSnapshot, Statement,
    SymbolId,
};
use crate::summary::{ParamSet, SummaryKey, SummaryOracle};

/// Where a taint value came from.
///
/// Source occurrences are identified by their call site, which is globally
/// unique, so origins need no interning. `Param` origins appear only in
/// summary-seeded runs and are translated back to concrete origins at the
/// call site that consumes the summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Origin {
    Param(u8),
    Source { call_site: CallSiteId, source: SourceId },
}

/// Kind of one step along a taint path, in BFS expansion priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    IntraPropagation,
    SanitizerCheck,
    CallEntry,
    ReturnPropagation,
    SinkReached,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::IntraPropagation => "intra_propagation",
            StepKind::SanitizerCheck => "sanitizer_check",
            StepKind::CallEntry => "call_entry",
            StepKind::ReturnPropagation => "return_propagation",
            StepKind::SinkReached => "sink_reached",
        }
    }
}

/// A location in the taint flow graph.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FlowNode {
    Var { function: SymbolId, name: String },
    Call(CallSiteId),
    Sink(CallSiteId),
}

/// One observed taint flow between two locations.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct FlowEdge {
    pub from: FlowNode,
    pub to: FlowNode,
    pub kind: StepKind,
    pub line: u32,
    pub column: u32,
}

/// A tainted value reaching a sink argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkHit {
    pub call_site: CallSiteId,
    pub sink: SinkId,
    pub category: VulnCategory,
    pub origins: BTreeSet<Origin>,
    pub var: String,
    /// Taint passed a sanitizer of a different category on the way here.
    pub sanitizer_bypassed: bool,
    /// Call hops from the origin to the sink.
    pub depth: u8,
    pub line: u32,
    pub column: u32,
}

/// Taint attached to one variable: who tainted it, and which categories
/// every path to here has sanitized it for.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TaintValue {
    pub origins: BTreeSet<Origin>,
    pub sanitized: BTreeSet<VulnCategory>,
}

impl TaintValue {
    fn from_origin(origin: Origin) -> Self {
        Self {
            origins: BTreeSet::from([origin]),
            sanitized: BTreeSet::new(),
        }
    }

    fn merge_from(&mut self, other: &TaintValue) -> bool {
        let before_origins = self.origins.len();
        self.origins.extend(other.origins.iter().copied());
        let before_sanitized = self.sanitized.len();
        self.sanitized = self.sanitized.intersection(&other.sanitized).copied().collect();
        self.origins.len() != before_origins || self.sanitized.len() != before_sanitized
    }
}

/// Variable taint at a block boundary.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BlockState {
    vars: BTreeMap<String, TaintValue>,
}

impl BlockState {
    fn get(&self, var: &str) -> Option<&TaintValue> {
        self.vars.get(var)
    }

    /// Join with a predecessor's exit state. Origins union; a category
    /// counts as sanitized only when every incoming path sanitized it.
    fn merge_from(&mut self, other: &BlockState) -> bool {
        let mut changed = false;
        for (var, val) in &other.vars {
            match self.vars.entry(var.clone()) {
                btree_map::Entry::Vacant(e) => {
                    e.insert(val.clone());
                    changed = true;
                }
                btree_map::Entry::Occupied(mut e) => {
                    changed |= e.get_mut().merge_from(val);
                }
            }
        }
        changed
    }
}

/// How a propagation run is seeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaintSeed {
    /// Taint enters only through catalog sources found in the body.
    Sources,
    /// Taint enters through these parameter positions (summary computation).
    Params(ParamSet),
}

/// Everything one propagation run learned about one function.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PropagationOutcome {
    pub sink_hits: Vec<SinkHit>,
    pub flow_edges: BTreeSet<FlowEdge>,
    pub return_origins: BTreeSet<Origin>,
    /// Source call sites observed in the body, in block order.
    pub source_seeds: Vec<(CallSiteId, SourceId)>,
    /// Calls to unresolved targets made with tainted arguments.
    pub unresolved_boundaries: BTreeSet<CallSiteId>,
    /// Resolved callees whose summary was not yet available.
    pub missing_summaries: u32,
    /// The worklist cap or depth budget cut the analysis short.
    pub truncated: bool,
}

/// One function's dataflow engine. Borrows the immutable snapshot, catalog
/// and config; holds no state between runs.
pub struct Propagator<'a> {
    snapshot: &'a ProgramSnapshot,
    catalog: &'a PatternCatalog,
    config: &'a EngineConfig,
}

struct TaintedArg<'s> {
    var: &'s str,
    position: Option<usize>,
    value: TaintValue,
}

impl<'a> Propagator<'a> {
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

    /// Run to a fixed point, then collect results from the converged states.
    pub fn run(
        &self,
        function: SymbolId,
        seed: TaintSeed,
        oracle: &dyn SummaryOracle,
    ) -> PropagationOutcome {
        let symbol = self.snapshot.symbol(function);
        let mut outcome = PropagationOutcome::default();

        let mut entry = BlockState::default();
        if let TaintSeed::Params(params) = seed {
            for position in params.iter() {
                if let Some(param) = symbol.parameters.get(position as usize) {
                    entry
                        .vars
                        .insert(param.name.clone(), TaintValue::from_origin(Origin::Param(position)));
                }
            }
        }

        let mut in_states: AHashMap<BlockId, BlockState> = AHashMap::new();
        in_states.insert(symbol.entry_block, entry);

        let mut queue = VecDeque::from([symbol.entry_block]);
        let mut queued: AHashSet<BlockId> = AHashSet::from([symbol.entry_block]);
        let mut visits = 0usize;

        while let Some(block_id) = queue.pop_front() {
            queued.remove(&block_id);
            visits += 1;
            if visits > self.config.worklist_max_iterations {
                outcome.truncated = true;
                break;
            }

            let mut state = in_states.get(&block_id).cloned().unwrap_or_default();
            let block = self.snapshot.block(block_id);
            self.transfer(block, &mut state, oracle, None);

            for (succ, _) in self.snapshot.successors(block_id) {
                let changed = match in_states.entry(*succ) {
                    std::collections::hash_map::Entry::Occupied(mut e) => {
                        e.get_mut().merge_from(&state)
                    }
                    std::collections::hash_map::Entry::Vacant(e) => {
                        e.insert(state.clone());
                        true
                    }
                };
                if changed && queued.insert(*succ) {
                    queue.push_back(*succ);
                }
            }
        }

        // Deterministic collection pass over converged states, block order.
        for block_id in self.snapshot.blocks_of(function) {
            let Some(in_state) = in_states.get(block_id) else {
                continue; // unreachable block
            };
            let mut state = in_state.clone();
            let block = self.snapshot.block(*block_id);
            self.transfer(block, &mut state, oracle, Some(&mut outcome));
        }

        outcome
    }

    fn transfer(
        &self,
        block: &BasicBlock,
        state: &mut BlockState,
        oracle: &dyn SummaryOracle,
        mut collect: Option<&mut PropagationOutcome>,
    ) {
        for stmt in &block.statements {
            match stmt {
                Statement::Assign {
                    target,
                    sources,
                    augmented,
                    line,
                    column,
                } => {
                    self.apply_assign(
                        block.function,
                        target,
                        sources,
                        *augmented,
                        (*line, *column),
                        state,
                        collect.as_deref_mut(),
                    );
                }
                Statement::Return { value, .. } => {
                    if let (Some(out), Some(var)) = (collect.as_deref_mut(), value.as_deref()) {
                        if let Some(val) = state.get(var) {
                            out.return_origins.extend(val.origins.iter().copied());
                        }
                    }
                }
                Statement::Call { call_site } => {
                    let cs = self.snapshot.call_site(*call_site);
                    self.apply_call(block.function, cs, state, oracle, collect.as_deref_mut());
                }
            }
        }
    }

    fn apply_assign(
        &self,
        function: SymbolId,
        target: &str,
        sources: &[String],
        augmented: bool,
        (line, column): (u32, u32),
        state: &mut BlockState,
        collect: Option<&mut PropagationOutcome>,
    ) {
        let mut gathered: Option<TaintValue> = None;
        let mut tainted_sources: Vec<&str> = Vec::new();
        for source in sources {
            if let Some(val) = state.get(source) {
                tainted_sources.push(source);
                gathered = Some(merge_values(gathered, val));
            }
        }

        let Some(mut value) = gathered else {
            // Untainted right-hand side: a plain assignment kills prior
            // taint, an augmented one keeps it.
            if !augmented {
                state.vars.remove(target);
            }
            return;
        };

        if augmented {
            if let Some(prev) = state.get(target) {
                value = merge_values(Some(value), prev);
            }
        }

        if let Some(out) = collect {
            for source in &tainted_sources {
                out.flow_edges.insert(FlowEdge {
                    from: var_node(function, source),
                    to: var_node(function, target),
                    kind: StepKind::IntraPropagation,
                    line,
                    column,
                });
            }
        }
        state.vars.insert(target.to_string(), value);
    }

    fn apply_call(
        &self,
        function: SymbolId,
        cs: &CallSite,
        state: &mut BlockState,
        oracle: &dyn SummaryOracle,
        mut collect: Option<&mut PropagationOutcome>,
    ) {
        let tainted_args = self.tainted_args(cs, state);

        match self.catalog.classify(&cs.target, None) {
            Some(PatternMatch::Source { id }) => {
                if let Some(out) = collect {
                    out.source_seeds.push((cs.id, id));
                    if cs.receiver.is_some() {
                        out.flow_edges.insert(FlowEdge {
                            from: FlowNode::Call(cs.id),
                            to: var_node(function, cs.receiver.as_deref().unwrap_or_default()),
                            kind: StepKind::IntraPropagation,
                            line: cs.line,
                            column: cs.column,
                        });
                    }
                }
                if let Some(receiver) = &cs.receiver {
                    state.vars.insert(
                        receiver.clone(),
                        TaintValue::from_origin(Origin::Source {
                            call_site: cs.id,
                            source: id,
                        }),
                    );
                }
                return;
            }
            Some(PatternMatch::Sanitizer { category, .. }) => {
                self.apply_sanitizer(function, cs, category, &tainted_args, state, collect);
                return;
            }
            _ => {}
        }

        // Sink check is per argument so position-gated patterns see the
        // position the tainted value actually occupies.
        for arg in &tainted_args {
            if let Some(PatternMatch::Sink { id, category }) =
                self.catalog.classify(&cs.target, arg.position)
            {
                if arg.value.sanitized.contains(&category) {
                    continue; // neutralized for this category on every path
                }
                if let Some(out) = collect.as_deref_mut() {
                    out.sink_hits.push(SinkHit {
                        call_site: cs.id,
                        sink: id,
                        category,
                        origins: arg.value.origins.clone(),
                        var: arg.var.to_string(),
                        sanitizer_bypassed: !arg.value.sanitized.is_empty(),
                        depth: 1,
                        line: cs.line,
                        column: cs.column,
                    });
                    out.flow_edges.insert(FlowEdge {
                        from: var_node(function, arg.var),
                        to: FlowNode::Sink(cs.id),
                        kind: StepKind::SinkReached,
                        line: cs.line,
                        column: cs.column,
                    });
                }
            }
        }

        match cs.callee {
            Callee::Resolved { symbol } => {
                self.apply_resolved_call(function, cs, symbol, &tainted_args, state, oracle, collect)
            }
            Callee::Unresolved { .. } => {
                self.apply_unresolved_call(function, cs, &tainted_args, state, collect)
            }
        }
    }

    fn apply_sanitizer(
        &self,
        function: SymbolId,
        cs: &CallSite,
        category: VulnCategory,
        tainted_args: &[TaintedArg<'_>],
        state: &mut BlockState,
        collect: Option<&mut PropagationOutcome>,
    ) {
        let Some(receiver) = &cs.receiver else {
            return; // result discarded, nothing to sanitize
        };
        if tainted_args.is_empty() {
            state.vars.remove(receiver);
            return;
        }

        let mut value: Option<TaintValue> = None;
        for arg in tainted_args {
            value = Some(merge_values(value, &arg.value));
        }
        let mut value = value.unwrap_or_default();
        value.sanitized.insert(category);

        if let Some(out) = collect {
            for arg in tainted_args {
                out.flow_edges.insert(FlowEdge {
                    from: var_node(function, arg.var),
                    to: FlowNode::Call(cs.id),
                    kind: StepKind::SanitizerCheck,
                    line: cs.line,
                    column: cs.column,
                });
            }
            out.flow_edges.insert(FlowEdge {
                from: FlowNode::Call(cs.id),
                to: var_node(function, receiver),
                kind: StepKind::IntraPropagation,
                line: cs.line,
                column: cs.column,
            });
        }
        state.vars.insert(receiver.clone(), value);
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_resolved_call(
        &self,
        function: SymbolId,
        cs: &CallSite,
        callee: SymbolId,
        tainted_args: &[TaintedArg<'_>],
        state: &mut BlockState,
        oracle: &dyn SummaryOracle,
        mut collect: Option<&mut PropagationOutcome>,
    ) {
        let mut params = ParamSet::EMPTY;
        for arg in tainted_args {
            if let Some(position) = arg.position {
                params.insert(position as u8);
            }
        }
        if params.is_empty() {
            // Untainted call result overwrites the receiver.
            if let Some(receiver) = &cs.receiver {
                state.vars.remove(receiver);
            }
            return;
        }

        let key = SummaryKey {
            function: callee,
            tainted_params: params,
        };
        let Some(summary) = oracle.summary(key) else {
            if let Some(out) = collect {
                out.missing_summaries += 1;
            }
            if let Some(receiver) = &cs.receiver {
                state.vars.remove(receiver);
            }
            return;
        };

        if let Some(out) = collect.as_deref_mut() {
            for arg in tainted_args {
                if arg.position.is_some() {
                    out.flow_edges.insert(FlowEdge {
                        from: var_node(function, arg.var),
                        to: FlowNode::Call(cs.id),
                        kind: StepKind::CallEntry,
                        line: cs.line,
                        column: cs.column,
                    });
                }
            }
            if summary.truncated {
                out.truncated = true;
            }
        }

        // Return value taint, translated from parameter positions back to
        // the caller's concrete origins.
        if let Some(receiver) = &cs.receiver {
            let mut value: Option<TaintValue> = None;
            for arg in tainted_args {
                if let Some(position) = arg.position {
                    if summary.returns_taint.contains(position as u8) {
                        value = Some(merge_values(value, &arg.value));
                    }
                }
            }
            match value {
                Some(value) => {
                    if let Some(out) = collect.as_deref_mut() {
                        out.flow_edges.insert(FlowEdge {
                            from: FlowNode::Call(cs.id),
                            to: var_node(function, receiver),
                            kind: StepKind::ReturnPropagation,
                            line: cs.line,
                            column: cs.column,
                        });
                    }
                    state.vars.insert(receiver.clone(), value);
                }
                None => {
                    state.vars.remove(receiver);
                }
            }
        }

        // Sinks the callee (transitively) reaches from our tainted arguments.
        if let Some(out) = collect {
            for reach in &summary.sink_reaches {
                if !params.contains(reach.param) {
                    continue;
                }
                let depth = reach.depth.saturating_add(1);
                if depth as usize > self.config.max_depth {
                    out.truncated = true;
                    continue;
                }
                let Some(arg) = tainted_args
                    .iter()
                    .find(|a| a.position == Some(reach.param as usize))
                else {
                    continue;
                };
                if arg.value.sanitized.contains(&reach.category) {
                    continue;
                }
                let sink_site = self.snapshot.call_site(reach.call_site);
                out.sink_hits.push(SinkHit {
                    call_site: reach.call_site,
                    sink: reach.sink,
                    category: reach.category,
                    origins: arg.value.origins.clone(),
                    var: arg.var.to_string(),
                    sanitizer_bypassed: reach.sanitizer_bypassed
                        || !arg.value.sanitized.is_empty(),
                    depth,
                    line: sink_site.line,
                    column: sink_site.column,
                });
                out.flow_edges.insert(FlowEdge {
                    from: FlowNode::Call(cs.id),
                    to: FlowNode::Sink(reach.call_site),
                    kind: StepKind::SinkReached,
                    line: sink_site.line,
                    column: sink_site.column,
                });
            }
        }
    }

    fn apply_unresolved_call(
        &self,
        function: SymbolId,
        cs: &CallSite,
        tainted_args: &[TaintedArg<'_>],
        state: &mut BlockState,
        collect: Option<&mut PropagationOutcome>,
    ) {
        if tainted_args.is_empty() {
            if let Some(receiver) = &cs.receiver {
                state.vars.remove(receiver);
            }
            return;
        }

        // Conservative: assume an unknown callee passes taint through to
        // its return value. The boundary is recorded and penalizes the
        // confidence of every path that crosses it.
        if let Some(out) = collect {
            out.unresolved_boundaries.insert(cs.id);
            for arg in tainted_args {
                out.flow_edges.insert(FlowEdge {
                    from: var_node(function, arg.var),
                    to: FlowNode::Call(cs.id),
                    kind: StepKind::CallEntry,
                    line: cs.line,
                    column: cs.column,
                });
            }
            if let Some(receiver) = &cs.receiver {
                out.flow_edges.insert(FlowEdge {
                    from: FlowNode::Call(cs.id),
                    to: var_node(function, receiver),
                    kind: StepKind::ReturnPropagation,
                    line: cs.line,
                    column: cs.column,
                });
            }
        }
        if let Some(receiver) = &cs.receiver {
            let mut value: Option<TaintValue> = None;
            for arg in tainted_args {
                value = Some(merge_values(value, &arg.value));
            }
            state
                .vars
                .insert(receiver.clone(), value.unwrap_or_default());
        }
    }

    fn tainted_args<'s>(&self, cs: &'s CallSite, state: &BlockState) -> Vec<TaintedArg<'s>> {
        let mut out = Vec::new();
        for arg in &cs.args {
            let Some(var) = arg.var.as_deref() else {
                continue;
            };
            let Some(value) = state.get(var) else {
                continue;
            };
            let position = match &arg.binding {
                ArgBinding::Positional { index } => Some(*index),
                ArgBinding::Keyword { name } => match cs.callee {
                    Callee::Resolved { symbol } => self
                        .snapshot
                        .symbol(symbol)
                        .parameters
                        .iter()
                        .find(|p| &p.name == name)
                        .map(|p| p.position),
                    Callee::Unresolved { .. } => None,
                },
            };
            out.push(TaintedArg {
                var,
                position,
                value: value.clone(),
            });
        }
        out
    }
}

fn var_node(function: SymbolId, name: &str) -> FlowNode {
    FlowNode::Var {
        function,
        name: name.to_string(),
    }
}

fn merge_values(acc: Option<TaintValue>, next: &TaintValue) -> TaintValue {
    match acc {
        None => next.clone(),
        Some(mut acc) => {
            acc.origins.extend(next.origins.iter().copied());
            acc.sanitized = acc.sanitized.intersection(&next.sanitized).copied().collect();
            acc
        }
    }
}
