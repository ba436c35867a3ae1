//! Kernel control-flow graph.
//!
//! A [`Function`] is a list of labeled basic blocks. Each block holds
//! already-lowered instructions and ends in a [`Terminator`].

use crate::isa::{self, Instruction, Op, Operand};
use crate::register::NUM_RESERVED_SREGS;
use indexmap::IndexMap;
use petgraph::prelude::*;
use serde::{Deserialize, Serialize};

pub type BlockId = usize;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("duplicate basic block label {0:?}")]
    DuplicateLabel(String),
    #[error("block {block:?} jumps to undefined label {label:?}")]
    UndefinedLabel { block: String, label: String },
    #[error("duplicate symbol {0:?}")]
    DuplicateSymbol(String),
    #[error("cannot allocate {requested} scalar registers (next free s{next}, have {available})")]
    OutOfScalarRegisters {
        requested: u16,
        next: u16,
        available: u16,
    },
    #[error("function has no basic blocks")]
    Empty,
    #[error(transparent)]
    Decode(#[from] isa::DecodeError),
}

/// How a basic block transfers control to its successors.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Terminator {
    Jump {
        target: String,
    },
    /// Two-way branch on the per-lane boolean bound to `cond`.
    Branch {
        cond: String,
        if_true: String,
        if_false: String,
    },
    Return,
}

impl Terminator {
    #[must_use]
    pub fn targets(&self) -> Vec<&str> {
        match self {
            Self::Jump { target } => vec![target],
            Self::Branch {
                if_true, if_false, ..
            } => vec![if_true, if_false],
            Self::Return => vec![],
        }
    }

    /// Replace every reference to `from` with `to`.
    pub fn retarget(&mut self, from: &str, to: &str) {
        let replace = |label: &mut String| {
            if label == from {
                *label = to.to_string();
            }
        };
        match self {
            Self::Jump { target } => replace(target),
            Self::Branch {
                if_true, if_false, ..
            } => {
                replace(if_true);
                replace(if_false);
            }
            Self::Return => {}
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasicBlock {
    pub label: String,
    #[serde(default)]
    pub instructions: Vec<Instruction>,
    pub terminator: Terminator,
}

impl BasicBlock {
    #[must_use]
    pub fn new(label: impl Into<String>, terminator: Terminator) -> Self {
        Self {
            label: label.into(),
            instructions: Vec::new(),
            terminator,
        }
    }
}

/// What a front-end symbol is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Symbol {
    /// `count` consecutive scalar registers starting at `reg`.
    ScalarRegister { reg: u16, count: u16 },
    VectorRegister { reg: u16 },
}

/// Kind of a control-flow edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Edge {
    Always,
    True,
    False,
}

pub type Graph = petgraph::Graph<BlockId, Edge>;

/// A kernel function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Function {
    pub name: String,
    blocks: Vec<BasicBlock>,
    labels: IndexMap<String, BlockId>,
    entry: BlockId,
    symbols: IndexMap<String, Symbol>,
    next_sreg: u16,
    num_sregs: u16,
    /// Pairs of (end of block, start of block) that must stay ordered.
    ordering: Vec<(BlockId, BlockId)>,
}

impl Function {
    #[must_use]
    pub fn new(name: impl Into<String>, num_sregs: u16) -> Self {
        Self {
            name: name.into(),
            blocks: Vec::new(),
            labels: IndexMap::new(),
            entry: 0,
            symbols: IndexMap::new(),
            next_sreg: NUM_RESERVED_SREGS,
            num_sregs,
            ordering: Vec::new(),
        }
    }

    /// Add a basic block.
    ///
    /// The first block added is the entry block.
    pub fn add_block(&mut self, block: BasicBlock) -> Result<BlockId, Error> {
        if self.labels.contains_key(&block.label) {
            return Err(Error::DuplicateLabel(block.label));
        }
        let id = self.blocks.len();
        self.labels.insert(block.label.clone(), id);
        self.blocks.push(block);
        Ok(id)
    }

    /// Return a label derived from `base` that is not used yet.
    #[must_use]
    pub fn fresh_label(&self, base: &str) -> String {
        if !self.labels.contains_key(base) {
            return base.to_string();
        }
        (1..)
            .map(|i| format!("{base}_{i}"))
            .find(|label| !self.labels.contains_key(label))
            .unwrap_or_else(|| base.to_string())
    }

    #[must_use]
    pub fn block(&self, id: BlockId) -> Option<&BasicBlock> {
        self.blocks.get(id)
    }

    #[must_use]
    pub fn block_mut(&mut self, id: BlockId) -> Option<&mut BasicBlock> {
        self.blocks.get_mut(id)
    }

    #[must_use]
    pub fn block_id(&self, label: &str) -> Option<BlockId> {
        self.labels.get(label).copied()
    }

    #[must_use]
    pub fn label(&self, id: BlockId) -> &str {
        self.blocks.get(id).map_or("<invalid>", |block| &block.label)
    }

    pub fn blocks(&self) -> impl Iterator<Item = (BlockId, &BasicBlock)> {
        self.blocks.iter().enumerate()
    }

    #[must_use]
    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    #[must_use]
    pub fn entry(&self) -> BlockId {
        self.entry
    }

    pub fn set_entry(&mut self, entry: BlockId) {
        self.entry = entry;
    }

    #[must_use]
    pub fn symbol(&self, name: &str) -> Option<Symbol> {
        self.symbols.get(name).copied()
    }

    #[must_use]
    pub fn symbols(&self) -> &IndexMap<String, Symbol> {
        &self.symbols
    }

    /// Return a symbol name derived from `base` that is not bound yet.
    #[must_use]
    pub fn fresh_symbol(&self, base: &str) -> String {
        if !self.symbols.contains_key(base) {
            return base.to_string();
        }
        (1..)
            .map(|i| format!("{base}_{i}"))
            .find(|name| !self.symbols.contains_key(name))
            .unwrap_or_else(|| base.to_string())
    }

    /// Bind a front-end symbol.
    ///
    /// Scalar registers claimed by the symbol are never handed out by
    /// [`Function::alloc_sreg`].
    pub fn bind_symbol(&mut self, name: impl Into<String>, symbol: Symbol) -> Result<(), Error> {
        let name = name.into();
        if self.symbols.contains_key(&name) {
            return Err(Error::DuplicateSymbol(name));
        }
        if let Symbol::ScalarRegister { reg, count } = symbol {
            self.next_sreg = self.next_sreg.max(reg.saturating_add(count));
        }
        self.symbols.insert(name, symbol);
        Ok(())
    }

    /// One past the highest scalar register named by a block instruction.
    fn sregs_in_blocks(&self) -> u16 {
        self.blocks
            .iter()
            .flat_map(|block| &block.instructions)
            .filter_map(Instruction::sreg_end)
            .max()
            .unwrap_or(0)
    }

    /// Allocate `count` consecutive scalar registers aligned to `align`.
    ///
    /// Registers bound to symbols or named by block instructions are
    /// never handed out.
    pub fn alloc_sreg(&mut self, count: u16, align: u16) -> Result<u16, Error> {
        self.next_sreg = self.next_sreg.max(self.sregs_in_blocks());
        let align = align.max(1);
        let reg = self.next_sreg.div_ceil(align) * align;
        let end = reg.saturating_add(count);
        if end > self.num_sregs {
            return Err(Error::OutOfScalarRegisters {
                requested: count,
                next: self.next_sreg,
                available: self.num_sregs,
            });
        }
        self.next_sreg = end;
        log::trace!("{}: allocated s[{}:{}]", self.name, reg, end - 1);
        Ok(reg)
    }

    /// Number of scalar registers in use.
    #[must_use]
    pub fn num_sregs_used(&self) -> u16 {
        self.next_sreg.max(self.sregs_in_blocks())
    }

    /// Materialize a per-lane boolean `a <cmp> b` into a fresh scalar pair.
    ///
    /// Emits a vector compare into `vcc` followed by a copy of `vcc` into the
    /// pair, and binds the pair to `symbol`.
    pub fn emit_compare(
        &mut self,
        block: BlockId,
        cmp: Op,
        a: Operand,
        b: Operand,
        symbol: impl Into<String>,
    ) -> Result<u16, Error> {
        let symbol = symbol.into();
        if self.symbols.contains_key(&symbol) {
            return Err(Error::DuplicateSymbol(symbol));
        }
        let compare = Instruction::new(cmp, [Operand::Vcc, a, b])?;
        compare.decode()?;
        let reg = self.alloc_sreg(2, 2)?;
        let copy = Instruction::new(Op::S_MOV_B64, [Operand::SregPair(reg), Operand::Vcc])?;
        if let Some(bb) = self.blocks.get_mut(block) {
            bb.instructions.push(compare);
            bb.instructions.push(copy);
        }
        self.bind_symbol(symbol, Symbol::ScalarRegister { reg, count: 2 })?;
        Ok(reg)
    }

    pub fn add_ordering(&mut self, from: BlockId, to: BlockId) {
        self.ordering.push((from, to));
    }

    #[must_use]
    pub fn ordering(&self) -> &[(BlockId, BlockId)] {
        &self.ordering
    }

    /// Build the control-flow graph.
    ///
    /// Node `i` holds block `i`. A branch whose targets coincide becomes a
    /// single unconditional edge.
    pub fn graph(&self) -> Result<Graph, Error> {
        let mut graph = Graph::with_capacity(self.blocks.len(), 2 * self.blocks.len());
        for id in 0..self.blocks.len() {
            graph.add_node(id);
        }
        let resolve = |block: &BasicBlock, label: &str| {
            self.block_id(label)
                .map(NodeIndex::new)
                .ok_or_else(|| Error::UndefinedLabel {
                    block: block.label.clone(),
                    label: label.to_string(),
                })
        };
        for (id, block) in self.blocks() {
            let node = NodeIndex::new(id);
            match &block.terminator {
                Terminator::Jump { target } => {
                    graph.add_edge(node, resolve(block, target)?, Edge::Always);
                }
                Terminator::Branch {
                    if_true, if_false, ..
                } if if_true == if_false => {
                    graph.add_edge(node, resolve(block, if_true)?, Edge::Always);
                }
                Terminator::Branch {
                    if_true, if_false, ..
                } => {
                    graph.add_edge(node, resolve(block, if_true)?, Edge::True);
                    graph.add_edge(node, resolve(block, if_false)?, Edge::False);
                }
                Terminator::Return => {}
            }
        }
        Ok(graph)
    }
}
