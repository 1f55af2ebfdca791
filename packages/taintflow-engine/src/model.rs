//! Program model consumed from the indexing pipeline
//!
//! Symbols, basic blocks, control-flow edges and call sites are read-only
//! inputs for the duration of a run. `ProgramSnapshot::build` validates
//! referential integrity once, then the snapshot is shared by immutable
//! reference with every worker; it is never mutated or rebuilt mid-run.

use ahash::AHashMap;
use serde::{Deserialize, Serialize};

use crate::error::SetupError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SymbolId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CallSiteId(pub u32);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub position: usize,
    #[serde(default)]
    pub default_value: Option<String>,
}

/// A function or method with an ordered parameter list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Symbol {
    pub id: SymbolId,
    pub name: String,
    pub file: String,
    pub line: u32,
    pub parameters: Vec<Parameter>,
    pub entry_block: BlockId,
    pub exit_block: BlockId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    Sequential,
    TrueBranch,
    FalseBranch,
    LoopBack,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CfgEdge {
    pub from: BlockId,
    pub to: BlockId,
    pub kind: EdgeKind,
}

/// One statement inside a basic block, in execution order.
///
/// An `Assign` with no `sources` is a pure literal assignment and clears
/// prior taint on the target; `augmented` marks partial reassignment
/// (string concatenation and friends) which unions with prior taint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Statement {
    Assign {
        target: String,
        #[serde(default)]
        sources: Vec<String>,
        #[serde(default)]
        augmented: bool,
        line: u32,
        column: u32,
    },
    Call { call_site: CallSiteId },
    Return {
        #[serde(default)]
        value: Option<String>,
        line: u32,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BasicBlock {
    pub id: BlockId,
    pub function: SymbolId,
    #[serde(default)]
    pub statements: Vec<Statement>,
}

/// Callee reference; unresolved targets (dynamic dispatch, external code)
/// are a valid, expected state — never a setup error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Callee {
    Resolved { symbol: SymbolId },
    Unresolved {
        #[serde(default)]
        reason: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArgBinding {
    Positional { index: usize },
    Keyword { name: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Argument {
    /// Variable expression carrying the argument; None for literals.
    #[serde(default)]
    pub var: Option<String>,
    pub binding: ArgBinding,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallSite {
    pub id: CallSiteId,
    pub block: BlockId,
    /// Textual call target, matched against the pattern catalog.
    pub target: String,
    pub callee: Callee,
    /// Variable receiving the call's return value, if any.
    #[serde(default)]
    pub receiver: Option<String>,
    #[serde(default)]
    pub args: Vec<Argument>,
    pub line: u32,
    pub column: u32,
}

/// Raw indexer output, before integrity validation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProgramInput {
    pub symbols: Vec<Symbol>,
    pub blocks: Vec<BasicBlock>,
    pub edges: Vec<CfgEdge>,
    pub call_sites: Vec<CallSite>,
}

/// Validated, immutable view of the program under analysis.
#[derive(Debug)]
pub struct ProgramSnapshot {
    symbols: AHashMap<SymbolId, Symbol>,
    blocks: AHashMap<BlockId, BasicBlock>,
    call_sites: AHashMap<CallSiteId, CallSite>,
    successors: AHashMap<BlockId, Vec<(BlockId, EdgeKind)>>,
    predecessors: AHashMap<BlockId, Vec<BlockId>>,
    blocks_of: AHashMap<SymbolId, Vec<BlockId>>,
    symbol_order: Vec<SymbolId>,
}

impl ProgramSnapshot {
    /// Validate and index the raw input. Any referential integrity violation
    /// aborts with the first `SetupError` found.
    pub fn build(input: ProgramInput) -> Result<Self, SetupError> {
        let mut symbols = AHashMap::with_capacity(input.symbols.len());
        for symbol in input.symbols {
            if symbols.insert(symbol.id, symbol.clone()).is_some() {
                return Err(SetupError::DuplicateSymbol(symbol.id));
            }
        }

        let mut blocks = AHashMap::with_capacity(input.blocks.len());
        let mut blocks_of: AHashMap<SymbolId, Vec<BlockId>> = AHashMap::new();
        for block in input.blocks {
            if !symbols.contains_key(&block.function) {
                return Err(SetupError::BlockWithoutFunction {
                    block: block.id,
                    function: block.function,
                });
            }
            blocks_of.entry(block.function).or_default().push(block.id);
            if blocks.insert(block.id, block.clone()).is_some() {
                return Err(SetupError::DuplicateBlock(block.id));
            }
        }
        for ids in blocks_of.values_mut() {
            ids.sort();
        }

        for symbol in symbols.values() {
            for boundary in [symbol.entry_block, symbol.exit_block] {
                match blocks.get(&boundary) {
                    Some(b) if b.function == symbol.id => {}
                    _ => {
                        return Err(SetupError::MissingBoundaryBlock {
                            symbol: symbol.id,
                            block: boundary,
                        })
                    }
                }
            }
        }

        let mut successors: AHashMap<BlockId, Vec<(BlockId, EdgeKind)>> = AHashMap::new();
        let mut predecessors: AHashMap<BlockId, Vec<BlockId>> = AHashMap::new();
        for edge in &input.edges {
            let (from, to) = match (blocks.get(&edge.from), blocks.get(&edge.to)) {
                (Some(f), Some(t)) => (f, t),
                _ => {
                    return Err(SetupError::DanglingEdge {
                        from: edge.from,
                        to: edge.to,
                    })
                }
            };
            if from.function != to.function {
                return Err(SetupError::CrossFunctionEdge {
                    from: edge.from,
                    to: edge.to,
                });
            }
            successors.entry(edge.from).or_default().push((edge.to, edge.kind));
            predecessors.entry(edge.to).or_default().push(edge.from);
        }
        for succs in successors.values_mut() {
            succs.sort_by_key(|(id, _)| *id);
        }
        for preds in predecessors.values_mut() {
            preds.sort();
            preds.dedup();
        }

        let mut call_sites = AHashMap::with_capacity(input.call_sites.len());
        for cs in input.call_sites {
            if !blocks.contains_key(&cs.block) {
                return Err(SetupError::CallSiteWithoutBlock {
                    call_site: cs.id,
                    block: cs.block,
                });
            }
            if let Callee::Resolved { symbol } = cs.callee {
                let callee = symbols.get(&symbol).ok_or(SetupError::CallSiteUnknownSymbol {
                    call_site: cs.id,
                    symbol,
                })?;
                for arg in &cs.args {
                    match &arg.binding {
                        ArgBinding::Positional { index } => {
                            if *index >= callee.parameters.len() {
                                return Err(SetupError::ArityExceeded {
                                    call_site: cs.id,
                                    index: *index,
                                    callee: callee.name.clone(),
                                    arity: callee.parameters.len(),
                                });
                            }
                        }
                        ArgBinding::Keyword { name } => {
                            if !callee.parameters.iter().any(|p| &p.name == name) {
                                return Err(SetupError::UnknownKeyword {
                                    call_site: cs.id,
                                    keyword: name.clone(),
                                    callee: callee.name.clone(),
                                });
                            }
                        }
                    }
                }
            }
            if call_sites.insert(cs.id, cs.clone()).is_some() {
                return Err(SetupError::DuplicateCallSite(cs.id));
            }
        }

        for block in blocks.values() {
            for stmt in &block.statements {
                if let Statement::Call { call_site } = stmt {
                    if !call_sites.contains_key(call_site) {
                        return Err(SetupError::StatementUnknownCallSite {
                            block: block.id,
                            call_site: *call_site,
                        });
                    }
                }
            }
        }

        let mut symbol_order: Vec<SymbolId> = symbols.keys().copied().collect();
        symbol_order.sort();

        Ok(Self {
            symbols,
            blocks,
            call_sites,
            successors,
            predecessors,
            blocks_of,
            symbol_order,
        })
    }

    pub fn from_json_str(json: &str) -> crate::error::Result<Self> {
        let input: ProgramInput = serde_json::from_str(json)?;
        Ok(Self::build(input)?)
    }

    pub fn symbol(&self, id: SymbolId) -> &Symbol {
        &self.symbols[&id]
    }

    pub fn block(&self, id: BlockId) -> &BasicBlock {
        &self.blocks[&id]
    }

    pub fn call_site(&self, id: CallSiteId) -> &CallSite {
        &self.call_sites[&id]
    }

    /// Symbols in a stable, sorted order.
    pub fn symbols(&self) -> impl Iterator<Item = &Symbol> + '_ {
        self.symbol_order.iter().map(move |id| &self.symbols[id])
    }

    pub fn symbol_count(&self) -> usize {
        self.symbols.len()
    }

    /// Successor blocks in a stable order.
    pub fn successors(&self, block: BlockId) -> &[(BlockId, EdgeKind)] {
        self.successors.get(&block).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn predecessors(&self, block: BlockId) -> &[BlockId] {
        self.predecessors.get(&block).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Blocks of one function, sorted by id.
    pub fn blocks_of(&self, symbol: SymbolId) -> &[BlockId] {
        self.blocks_of.get(&symbol).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn call_sites(&self) -> impl Iterator<Item = &CallSite> + '_ {
        self.call_sites.values()
    }

    /// Resolved callees of a function, deduplicated, sorted.
    pub fn callees_of(&self, symbol: SymbolId) -> Vec<SymbolId> {
        let mut out = Vec::new();
        for block_id in self.blocks_of(symbol) {
            for stmt in &self.block(*block_id).statements {
                if let Statement::Call { call_site } = stmt {
                    if let Callee::Resolved { symbol: callee } = self.call_site(*call_site).callee {
                        out.push(callee);
                    }
                }
            }
        }
        out.sort();
        out.dedup();
        out
    }
}
