//! End-to-end analysis scenarios through the public API: snapshot in,
//! classified findings out.

use pretty_assertions::assert_eq;

use taintflow_engine::model::{
    ArgBinding, Argument, BasicBlock, BlockId, CallSite, CallSiteId, Callee, CfgEdge, EdgeKind,
    Parameter, ProgramInput, Statement, Symbol, SymbolId,
};
use taintflow_engine::{
    EngineConfig, PatternCatalog, ProgramSnapshot, SetupError, StepKind, TaintEngine, VulnCategory,
};

/// Small program assembler for readable test bodies.
struct Program {
    input: ProgramInput,
    next_call_site: u32,
}

impl Program {
    fn new() -> Self {
        Self {
            input: ProgramInput::default(),
            next_call_site: 0,
        }
    }

    fn function(&mut self, id: u32, name: &str, file: &str, params: &[&str], blocks: &[u32]) {
        self.input.symbols.push(Symbol {
            id: SymbolId(id),
            name: name.to_string(),
            file: file.to_string(),
            line: 1,
            parameters: params
                .iter()
                .enumerate()
                .map(|(position, name)| Parameter {
                    name: name.to_string(),
                    position,
                    default_value: None,
                })
                .collect(),
            entry_block: BlockId(blocks[0]),
            exit_block: BlockId(*blocks.last().unwrap()),
        });
        for block in blocks {
            self.input.blocks.push(BasicBlock {
                id: BlockId(*block),
                function: SymbolId(id),
                statements: vec![],
            });
        }
    }

    fn edge(&mut self, from: u32, to: u32, kind: EdgeKind) {
        self.input.edges.push(CfgEdge {
            from: BlockId(from),
            to: BlockId(to),
            kind,
        });
    }

    fn block_mut(&mut self, id: u32) -> &mut BasicBlock {
        self.input
            .blocks
            .iter_mut()
            .find(|b| b.id == BlockId(id))
            .unwrap()
    }

    fn assign(&mut self, block: u32, target: &str, sources: &[&str], line: u32) {
        self.block_mut(block).statements.push(Statement::Assign {
            target: target.to_string(),
            sources: sources.iter().map(|s| s.to_string()).collect(),
            augmented: false,
            line,
            column: 1,
        });
    }

    fn call(
        &mut self,
        block: u32,
        target: &str,
        callee: Callee,
        receiver: Option<&str>,
        args: &[&str],
        line: u32,
    ) -> CallSiteId {
        let id = CallSiteId(self.next_call_site);
        self.next_call_site += 1;
        self.input.call_sites.push(CallSite {
            id,
            block: BlockId(block),
            target: target.to_string(),
            callee,
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
        });
        self.block_mut(block)
            .statements
            .push(Statement::Call { call_site: id });
        id
    }

    fn engine(self, config: EngineConfig) -> TaintEngine {
        TaintEngine::new(
            ProgramSnapshot::build(self.input).unwrap(),
            PatternCatalog::default(),
            config,
        )
        .unwrap()
    }
}

fn external() -> Callee {
    Callee::Unresolved { reason: None }
}

fn resolved(id: u32) -> Callee {
    Callee::Resolved { symbol: SymbolId(id) }
}

#[test]
fn test_direct_sql_injection_from_json_snapshot() {
    let json = r#"{
        "symbols": [{
            "id": 0, "name": "handler", "file": "app.py", "line": 1,
            "parameters": [], "entry_block": 0, "exit_block": 0
        }],
        "blocks": [{
            "id": 0, "function": 0,
            "statements": [
                {"op": "call", "call_site": 0},
                {"op": "assign", "target": "query", "sources": ["data"], "line": 11, "column": 5},
                {"op": "call", "call_site": 1}
            ]
        }],
        "edges": [],
        "call_sites": [
            {"id": 0, "block": 0, "target": "request.get",
             "callee": {"kind": "unresolved"}, "receiver": "data",
             "line": 10, "column": 5},
            {"id": 1, "block": 0, "target": "cursor.execute",
             "callee": {"kind": "unresolved"},
             "args": [{"var": "query", "binding": {"positional": {"index": 0}}}],
             "line": 12, "column": 5}
        ]
    }"#;

    let snapshot = ProgramSnapshot::from_json_str(json).unwrap();
    let engine =
        TaintEngine::new(snapshot, PatternCatalog::default(), EngineConfig::default()).unwrap();
    let report = engine.run();

    assert_eq!(report.findings.len(), 1);
    let finding = &report.findings[0];
    assert_eq!(finding.vulnerability, "SQL Injection");
    assert_eq!(finding.category, VulnCategory::Sql);
    assert_eq!(finding.confidence, 1.0);
    assert_eq!(finding.path.source.name, "request.get");
    assert_eq!(finding.path.sink.name, "cursor.execute");
    assert_eq!(finding.path.sink.line, 12);
    assert_eq!(finding.path.steps.last().unwrap().kind, StepKind::SinkReached);
    assert!(!finding.path.truncated);
}

#[test]
fn test_cross_function_command_injection() {
    let mut p = Program::new();
    p.function(0, "handler", "web.py", &[], &[0]);
    p.function(1, "run_cmd", "shell.py", &["c"], &[1]);
    p.call(0, "request.get", external(), Some("data"), &[], 10);
    p.call(0, "run_cmd", resolved(1), None, &["data"], 11);
    p.call(1, "os.system", external(), None, &["c"], 20);

    let report = p.engine(EngineConfig::default()).run();

    assert_eq!(report.findings.len(), 1);
    let finding = &report.findings[0];
    assert_eq!(finding.vulnerability, "Command Injection");
    assert_eq!(finding.path.source.file, "web.py");
    assert_eq!(finding.path.sink.file, "shell.py");
    assert!(finding.path.crosses_files);

    // The binding of the source result to its receiver variable is a step
    // of its own, ahead of the call and sink hops.
    let kinds: Vec<StepKind> = finding.path.steps.iter().map(|s| s.kind).collect();
    assert_eq!(
        kinds,
        vec![
            StepKind::IntraPropagation,
            StepKind::CallEntry,
            StepKind::SinkReached
        ]
    );
}

#[test]
fn test_sanitizer_in_callee_suppresses_finding() {
    // run_cmd shell-quotes its argument before reaching the sink, so the
    // whole flow is neutralized even though handler never sanitizes.
    let mut p = Program::new();
    p.function(0, "handler", "web.py", &[], &[0]);
    p.function(1, "run_cmd", "shell.py", &["c"], &[1]);
    p.call(0, "request.get", external(), Some("data"), &[], 10);
    p.call(0, "run_cmd", resolved(1), None, &["data"], 11);
    p.call(1, "shlex.quote", external(), Some("safe"), &["c"], 20);
    p.call(1, "os.system", external(), None, &["safe"], 21);

    let report = p.engine(EngineConfig::default()).run();

    assert!(report.findings.is_empty());
    assert!(report.low_confidence.is_empty());
    assert_eq!(report.diagnostics.sources_found, 1);
}

#[test]
fn test_mutual_recursion_terminates() {
    // ping and pong call each other; pong also feeds the sink. The cycle
    // must converge, not spin.
    let mut p = Program::new();
    p.function(0, "handler", "web.py", &[], &[0]);
    p.function(1, "ping", "a.py", &["x"], &[1]);
    p.function(2, "pong", "b.py", &["y"], &[2]);
    p.call(0, "request.get", external(), Some("data"), &[], 10);
    p.call(0, "ping", resolved(1), None, &["data"], 11);
    p.call(1, "pong", resolved(2), None, &["x"], 20);
    p.call(2, "ping", resolved(1), None, &["y"], 30);
    p.call(2, "cursor.execute", external(), None, &["y"], 31);

    let config = EngineConfig::default().max_depth(4);
    let report = p.engine(config).run();

    assert_eq!(report.diagnostics.nonconverged_clusters, 0);
    assert_eq!(report.findings.len(), 1);
    assert_eq!(report.findings[0].category, VulnCategory::Sql);
    assert_eq!(
        report.findings[0].path.steps.last().unwrap().kind,
        StepKind::SinkReached
    );
}

#[test]
fn test_self_recursion_converges_to_direct_path() {
    // worker re-feeds its own parameter; summarization keeps the
    // minimum-depth sink reach, so the cycle converges and the reported
    // path is the direct one, not a truncated unrolling.
    let mut p = Program::new();
    p.function(0, "handler", "web.py", &[], &[0]);
    p.function(1, "worker", "w.py", &["x"], &[1]);
    p.call(0, "request.get", external(), Some("data"), &[], 10);
    p.call(0, "worker", resolved(1), None, &["data"], 11);
    p.call(1, "cursor.execute", external(), None, &["x"], 20);
    p.call(1, "worker", resolved(1), None, &["x"], 21);

    let report = p.engine(EngineConfig::default()).run();

    assert_eq!(report.diagnostics.nonconverged_clusters, 0);
    assert_eq!(report.findings.len(), 1);
    let path = &report.findings[0].path;
    assert!(!path.truncated);
    assert_eq!(
        path.steps
            .iter()
            .filter(|s| s.kind == StepKind::CallEntry)
            .count(),
        1
    );
    assert_eq!(path.steps.last().unwrap().kind, StepKind::SinkReached);
}

#[test]
fn test_recursion_round_cap_surfaces_truncation() {
    let mut p = Program::new();
    p.function(0, "handler", "web.py", &[], &[0]);
    p.function(1, "ping", "a.py", &["x"], &[1]);
    p.function(2, "pong", "b.py", &["y"], &[2]);
    p.call(0, "request.get", external(), Some("data"), &[], 10);
    p.call(0, "ping", resolved(1), None, &["data"], 11);
    p.call(1, "pong", resolved(2), None, &["x"], 20);
    p.call(2, "ping", resolved(1), None, &["y"], 30);
    p.call(2, "cursor.execute", external(), None, &["y"], 31);

    let config = EngineConfig::default().scc_max_rounds(1);
    let report = p.engine(config).run();

    assert_eq!(report.diagnostics.nonconverged_clusters, 1);
    assert!(report.diagnostics.truncated_functions >= 1);
}

#[test]
fn test_depth_bound_drops_flows_beyond_budget() {
    // Sink sits three call hops away from the source.
    let build = || {
        let mut p = Program::new();
        p.function(0, "handler", "web.py", &[], &[0]);
        p.function(1, "f1", "f1.py", &["a"], &[1]);
        p.function(2, "f2", "f2.py", &["b"], &[2]);
        p.function(3, "f3", "f3.py", &["c"], &[3]);
        p.call(0, "request.get", external(), Some("data"), &[], 10);
        p.call(0, "f1", resolved(1), None, &["data"], 11);
        p.call(1, "f2", resolved(2), None, &["a"], 20);
        p.call(2, "f3", resolved(3), None, &["b"], 30);
        p.call(3, "cursor.execute", external(), None, &["c"], 40);
        p
    };

    let shallow = build().engine(EngineConfig::default().max_depth(2)).run();
    assert!(shallow.findings.is_empty());
    assert!(shallow.diagnostics.truncated_functions >= 1);

    let deep = build().engine(EngineConfig::default().max_depth(5)).run();
    assert_eq!(deep.findings.len(), 1);
    let hops = deep.findings[0]
        .path
        .steps
        .iter()
        .filter(|s| s.kind == StepKind::CallEntry)
        .count();
    assert!(hops <= 5);
    assert!(!deep.findings[0].path.truncated);
}

#[test]
fn test_output_is_deterministic() {
    let build = || {
        let mut p = Program::new();
        p.function(0, "handler", "web.py", &[], &[0, 1, 2]);
        p.edge(0, 1, EdgeKind::TrueBranch);
        p.edge(0, 2, EdgeKind::FalseBranch);
        p.call(0, "request.get", external(), Some("a"), &[], 10);
        p.call(0, "request.post", external(), Some("b"), &[], 11);
        p.assign(1, "q", &["a", "b"], 20);
        p.call(1, "cursor.execute", external(), None, &["q"], 21);
        p.call(2, "os.system", external(), None, &["b"], 30);
        p.engine(EngineConfig::default()).run()
    };

    let first = build();
    let second = build();
    assert_eq!(first.findings, second.findings);
    assert_eq!(first.low_confidence, second.low_confidence);
    assert!(!first.findings.is_empty());
}

#[test]
fn test_arity_violation_rejected_at_build() {
    let mut p = Program::new();
    p.function(0, "handler", "web.py", &[], &[0]);
    p.function(1, "f", "f.py", &["only"], &[1]);
    // Positional argument 1 against a one-parameter callee.
    p.input.call_sites.push(CallSite {
        id: CallSiteId(0),
        block: BlockId(0),
        target: "f".to_string(),
        callee: resolved(1),
        receiver: None,
        args: vec![Argument {
            var: Some("x".to_string()),
            binding: ArgBinding::Positional { index: 1 },
        }],
        line: 10,
        column: 1,
    });

    let err = ProgramSnapshot::build(p.input).unwrap_err();
    assert!(matches!(
        err,
        SetupError::ArityExceeded { index: 1, arity: 1, .. }
    ));
}

#[test]
fn test_unresolved_external_call_yields_diagnostic_not_finding() {
    // The tainted value disappears into an external call with no visible
    // sink; the other branch through resolved code still reports.
    let mut p = Program::new();
    p.function(0, "handler", "web.py", &[], &[0]);
    p.function(1, "run_query", "db.py", &["q"], &[1]);
    p.call(0, "request.get", external(), Some("data"), &[], 10);
    p.call(0, "telemetry.send", external(), None, &["data"], 11);
    p.call(0, "run_query", resolved(1), None, &["data"], 12);
    p.call(1, "cursor.execute", external(), None, &["q"], 20);

    let report = p.engine(EngineConfig::default()).run();

    assert_eq!(report.diagnostics.unresolved_boundaries, 1);
    assert_eq!(report.findings.len(), 1);
    assert_eq!(report.findings[0].category, VulnCategory::Sql);
    assert_eq!(report.findings[0].path.sink.file, "db.py");
    // The reported path never routes through the opaque call.
    assert!(!report.findings[0].path.crosses_unresolved);
}
