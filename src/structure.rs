//! Structural analysis.
//!
//! Reduces a reducible control-flow graph to a [`Region`] tree by repeatedly
//! collapsing sequences, conditionals and while loops into single nodes.
//!
//! Before the reduction every loop is brought into canonical form: a fresh
//! `pre` block becomes the only entry into the loop head and a fresh `exit`
//! block becomes the only target of the head's exiting edge.

use crate::cfg::{self, BasicBlock, BlockId, Edge, Function, Symbol, Terminator};
use crate::isa::{self, Instruction, Op, Operand};
use crate::region::{ExitPolarity, Region};
use indexmap::IndexMap;
use petgraph::prelude::*;
use petgraph::stable_graph::StableDiGraph;
use petgraph::visit::{depth_first_search, DfsEvent};
use std::collections::{HashMap, HashSet};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("unstructured control flow in {function:?} involving {regions:?}")]
    Unstructured {
        function: String,
        regions: Vec<String>,
    },
    #[error("loop at {head:?} has more than one back edge")]
    MultipleLatches { head: String },
    #[error("loop head {head:?} must end in a two-way branch with exactly one exiting target")]
    InvalidLoopHead { head: String },
    #[error("branch in {block:?} uses undefined condition {cond:?}")]
    UndefinedCondition { block: String, cond: String },
    #[error("condition {cond:?} in {block:?} is not bound to an aligned scalar register pair")]
    InvalidCondition { block: String, cond: String },
    #[error(transparent)]
    Cfg(#[from] cfg::Error),
    #[error(transparent)]
    Decode(#[from] isa::DecodeError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Loop {
    pre: BlockId,
    head: BlockId,
    exit: BlockId,
    exit_on: ExitPolarity,
}

/// Compute the region tree of `function`.
///
/// Inserts the blocks needed to canonicalize loops, and may rewrite a branch
/// whose then-side is its false successor to branch on the negated condition.
pub fn analyze(function: &mut Function) -> Result<Region, Error> {
    if function.num_blocks() == 0 {
        return Err(cfg::Error::Empty.into());
    }
    let loops = canonicalize_loops(function)?;
    log::debug!(
        "{}: {} loop(s), {} basic blocks",
        function.name,
        loops.len(),
        function.num_blocks()
    );
    Reducer::new(function, &loops)?.reduce()
}

fn canonicalize_loops(function: &mut Function) -> Result<Vec<Loop>, Error> {
    let mut loops: Vec<Loop> = Vec::new();
    loop {
        let graph = function.graph()?;
        let mut back_edges: IndexMap<NodeIndex, Vec<NodeIndex>> = IndexMap::new();
        depth_first_search(&graph, Some(NodeIndex::new(function.entry())), |event| {
            if let DfsEvent::BackEdge(latch, head) = event {
                back_edges.entry(head).or_default().push(latch);
            }
        });

        let Some((head, latches)) = back_edges
            .into_iter()
            .find(|(head, _)| !loops.iter().any(|l| l.head == head.index()))
        else {
            return Ok(loops);
        };
        let head_label = function.label(head.index()).to_string();
        let [latch] = latches[..] else {
            return Err(Error::MultipleLatches { head: head_label });
        };

        if latch == head {
            // give the self loop a tail of its own
            let tail_label = function.fresh_label(&format!("{head_label}_tail"));
            let tail = BasicBlock::new(
                tail_label.clone(),
                Terminator::Jump {
                    target: head_label.clone(),
                },
            );
            function.add_block(tail)?;
            if let Some(block) = function.block_mut(head.index()) {
                block.terminator.retarget(&head_label, &tail_label);
            }
            continue;
        }

        // blocks reaching the latch without passing through the head
        let mut body = HashSet::from([latch]);
        let mut stack = vec![latch];
        while let Some(node) = stack.pop() {
            for pred in graph.neighbors_directed(node, Incoming) {
                if pred != head && body.insert(pred) {
                    stack.push(pred);
                }
            }
        }

        let in_body = |label: &str| {
            function
                .block_id(label)
                .is_some_and(|id| body.contains(&NodeIndex::new(id)))
        };
        let (exit_on, exit_target) = match function.block(head.index()).map(|b| &b.terminator) {
            Some(Terminator::Branch {
                if_true, if_false, ..
            }) if in_body(if_true) && !in_body(if_false) && if_false != &head_label => {
                (ExitPolarity::IfFalse, if_false.clone())
            }
            Some(Terminator::Branch {
                if_true, if_false, ..
            }) if in_body(if_false) && !in_body(if_true) && if_true != &head_label => {
                (ExitPolarity::IfTrue, if_true.clone())
            }
            _ => return Err(Error::InvalidLoopHead { head: head_label }),
        };

        let exit_label = function.fresh_label(&format!("{head_label}_exit"));
        let exit = function.add_block(BasicBlock::new(
            exit_label.clone(),
            Terminator::Jump {
                target: exit_target.clone(),
            },
        ))?;
        if let Some(block) = function.block_mut(head.index()) {
            block.terminator.retarget(&exit_target, &exit_label);
        }

        let pre_label = function.fresh_label(&format!("{head_label}_pre"));
        let pre = function.add_block(BasicBlock::new(
            pre_label.clone(),
            Terminator::Jump {
                target: head_label.clone(),
            },
        ))?;
        let entries: Vec<_> = graph
            .neighbors_directed(head, Incoming)
            .filter(|pred| *pred != latch)
            .collect();
        for pred in entries {
            if let Some(block) = function.block_mut(pred.index()) {
                block.terminator.retarget(&head_label, &pre_label);
            }
        }
        if function.entry() == head.index() {
            function.set_entry(pre);
        }

        log::trace!(
            "{}: canonical loop {} -> [{}] -> {} ({:?})",
            function.name,
            pre_label,
            head_label,
            exit_label,
            exit_on
        );
        loops.push(Loop {
            pre,
            head: head.index(),
            exit,
            exit_on,
        });
    }
}

struct Reducer<'a> {
    function: &'a mut Function,
    graph: StableDiGraph<Region, Edge>,
    loops: HashMap<NodeIndex, Loop>,
    /// Loop `pre` and `exit` blocks, kept as leaves until their loop collapses.
    pinned: HashSet<NodeIndex>,
    counter: usize,
}

impl<'a> Reducer<'a> {
    fn new(function: &'a mut Function, loops: &[Loop]) -> Result<Self, Error> {
        let cfg = function.graph()?;
        let mut graph = StableDiGraph::with_capacity(cfg.node_count(), cfg.edge_count());
        for node in cfg.node_indices() {
            let added = graph.add_node(Region::Leaf(cfg[node]));
            debug_assert_eq!(added.index(), node.index());
        }
        for edge in cfg.edge_references() {
            graph.add_edge(edge.source(), edge.target(), *edge.weight());
        }
        let reachable = {
            let mut reachable = HashSet::new();
            depth_first_search(&cfg, Some(NodeIndex::new(function.entry())), |event| {
                if let DfsEvent::Discover(node, _) = event {
                    reachable.insert(node);
                }
            });
            reachable
        };
        // unreachable blocks cannot be placed anywhere
        let unreachable: Vec<_> = cfg
            .node_indices()
            .filter(|node| !reachable.contains(node))
            .map(|node| function.label(node.index()).to_string())
            .collect();
        if !unreachable.is_empty() {
            return Err(Error::Unstructured {
                function: function.name.clone(),
                regions: unreachable,
            });
        }
        Ok(Self {
            pinned: loops
                .iter()
                .flat_map(|l| [NodeIndex::new(l.pre), NodeIndex::new(l.exit)])
                .collect(),
            loops: loops
                .iter()
                .map(|l| (NodeIndex::new(l.head), *l))
                .collect(),
            function,
            graph,
            counter: 0,
        })
    }

    fn reduce(mut self) -> Result<Region, Error> {
        loop {
            if self.graph.node_count() == 1 && self.graph.edge_count() == 0 {
                let Some(root) = self.graph.node_indices().next() else {
                    break;
                };
                return self.take(root);
            }
            let mut changed = false;
            let nodes: Vec<_> = self.graph.node_indices().collect();
            for node in nodes {
                if !self.graph.contains_node(node) {
                    continue;
                }
                if self.try_while_loop(node)?
                    || self.try_if_then_else(node)?
                    || self.try_if_then(node)?
                    || self.try_block(node)?
                {
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
        Err(self.unstructured())
    }

    fn unstructured(&self) -> Error {
        Error::Unstructured {
            function: self.function.name.clone(),
            regions: self
                .graph
                .node_weights()
                .map(|region| region.name(self.function).to_string())
                .collect(),
        }
    }

    fn name(&mut self, kind: &str) -> String {
        let name = format!("{kind}_{}", self.counter);
        self.counter += 1;
        name
    }

    fn outgoing(&self, node: NodeIndex) -> Vec<(NodeIndex, Edge)> {
        let mut edges: Vec<_> = self
            .graph
            .edges_directed(node, Outgoing)
            .map(|e| (e.target(), *e.weight()))
            .collect();
        edges.sort_by_key(|(target, _)| *target);
        edges
    }

    fn incoming(&self, node: NodeIndex) -> Vec<(NodeIndex, Edge)> {
        let mut edges: Vec<_> = self
            .graph
            .edges_directed(node, Incoming)
            .map(|e| (e.source(), *e.weight()))
            .collect();
        edges.sort_by_key(|(source, _)| *source);
        edges
    }

    /// Only predecessor of `node`, if it has exactly one incoming edge.
    fn single_pred(&self, node: NodeIndex) -> Option<NodeIndex> {
        match self.incoming(node)[..] {
            [(pred, _)] => Some(pred),
            _ => None,
        }
    }

    /// Only successor of `node`, if it has exactly one outgoing edge.
    fn single_succ(&self, node: NodeIndex) -> Option<NodeIndex> {
        match self.outgoing(node)[..] {
            [(succ, _)] => Some(succ),
            _ => None,
        }
    }

    /// True and false successor of a two-way branch.
    fn branch(&self, node: NodeIndex) -> Option<(NodeIndex, NodeIndex)> {
        match self.outgoing(node)[..] {
            [(a, Edge::True), (b, Edge::False)] => Some((a, b)),
            [(a, Edge::False), (b, Edge::True)] => Some((b, a)),
            _ => None,
        }
    }

    /// Node can be absorbed into a larger region.
    fn is_free(&self, node: NodeIndex) -> bool {
        !self.pinned.contains(&node) && !self.loops.contains_key(&node)
    }

    fn take(&mut self, node: NodeIndex) -> Result<Region, Error> {
        match self.graph.remove_node(node) {
            Some(region) => Ok(region),
            None => Err(self.unstructured()),
        }
    }

    fn replace(
        &mut self,
        region: Region,
        preds: Vec<(NodeIndex, Edge)>,
        succs: Vec<(NodeIndex, Edge)>,
    ) -> NodeIndex {
        log::trace!(
            "{}: reduced {}",
            self.function.name,
            region.name(self.function)
        );
        let node = self.graph.add_node(region);
        for (pred, weight) in preds {
            self.graph.add_edge(pred, node, weight);
        }
        for (succ, weight) in succs {
            self.graph.add_edge(node, succ, weight);
        }
        node
    }

    fn try_block(&mut self, node: NodeIndex) -> Result<bool, Error> {
        if !self.is_free(node) {
            return Ok(false);
        }
        let Some(next) = self.single_succ(node) else {
            return Ok(false);
        };
        if next == node || !self.is_free(next) || self.single_pred(next) != Some(node) {
            return Ok(false);
        }
        let preds = self.incoming(node);
        let succs = self.outgoing(next);
        if succs.iter().any(|(succ, _)| *succ == node) {
            return Ok(false);
        }
        let flatten = |region: Region| match region {
            Region::Block { children, .. } => children,
            other => vec![other],
        };
        let mut children = flatten(self.take(node)?);
        children.extend(flatten(self.take(next)?));
        let name = self.name("block");
        self.replace(Region::Block { name, children }, preds, succs);
        Ok(true)
    }

    fn try_if_then(&mut self, node: NodeIndex) -> Result<bool, Error> {
        if !self.is_free(node) {
            return Ok(false);
        }
        let Some((on_true, on_false)) = self.branch(node) else {
            return Ok(false);
        };
        let is_then = |then: NodeIndex, merge: NodeIndex| {
            then != node
                && merge != node
                && self.is_free(then)
                && self.single_pred(then) == Some(node)
                && self.single_succ(then) == Some(merge)
        };
        let (then, merge, inverted) = if is_then(on_true, on_false) {
            (on_true, on_false, false)
        } else if is_then(on_false, on_true) {
            (on_false, on_true, true)
        } else {
            return Ok(false);
        };

        let preds = self.incoming(node);
        let cond = self.take(node)?;
        let then = self.take(then)?;
        if inverted {
            let Some(block) = cond.last_leaf() else {
                return Err(self.unstructured());
            };
            self.invert_condition(block)?;
        }
        let name = self.name("if_then");
        self.replace(
            Region::IfThen {
                name,
                cond: Box::new(cond),
                then: Box::new(then),
            },
            preds,
            vec![(merge, Edge::Always)],
        );
        Ok(true)
    }

    fn try_if_then_else(&mut self, node: NodeIndex) -> Result<bool, Error> {
        if !self.is_free(node) {
            return Ok(false);
        }
        let Some((then, otherwise)) = self.branch(node) else {
            return Ok(false);
        };
        let arm = |arm: NodeIndex| {
            if arm == node || !self.is_free(arm) || self.single_pred(arm) != Some(node) {
                return None;
            }
            self.single_succ(arm)
        };
        let (Some(merge), Some(other_merge)) = (arm(then), arm(otherwise)) else {
            return Ok(false);
        };
        if merge != other_merge || [node, then, otherwise].contains(&merge) {
            return Ok(false);
        }

        let preds = self.incoming(node);
        let cond = self.take(node)?;
        let then = self.take(then)?;
        let otherwise = self.take(otherwise)?;
        let name = self.name("if_then_else");
        self.replace(
            Region::IfThenElse {
                name,
                cond: Box::new(cond),
                then: Box::new(then),
                otherwise: Box::new(otherwise),
            },
            preds,
            vec![(merge, Edge::Always)],
        );
        Ok(true)
    }

    fn try_while_loop(&mut self, head: NodeIndex) -> Result<bool, Error> {
        let Some(info) = self.loops.get(&head).copied() else {
            return Ok(false);
        };
        let (pre, exit) = (NodeIndex::new(info.pre), NodeIndex::new(info.exit));
        let targets: Vec<_> = self.outgoing(head).into_iter().map(|(t, _)| t).collect();
        let tail = match targets[..] {
            [a, b] if a == exit && b != exit => b,
            [a, b] if b == exit && a != exit => a,
            _ => return Ok(false),
        };
        if tail == head || self.loops.contains_key(&tail) || self.pinned.contains(&tail) {
            return Ok(false);
        }
        let mut head_preds: Vec<_> = self.incoming(head).into_iter().map(|(p, _)| p).collect();
        head_preds.sort();
        let mut expected = vec![pre, tail];
        expected.sort();
        if head_preds != expected
            || self.single_succ(tail) != Some(head)
            || self.single_pred(tail) != Some(head)
            || self.single_pred(exit) != Some(head)
            || self.single_succ(pre) != Some(head)
        {
            return Ok(false);
        }

        let preds = self.incoming(pre);
        let succs = self.outgoing(exit);
        self.take(pre)?;
        self.take(exit)?;
        let head_region = self.take(head)?;
        let tail_region = self.take(tail)?;
        self.loops.remove(&head);
        self.pinned.remove(&pre);
        self.pinned.remove(&exit);
        let name = self.name("while_loop");
        self.replace(
            Region::WhileLoop {
                name,
                pre: info.pre,
                head: Box::new(head_region),
                tail: Box::new(tail_region),
                exit: info.exit,
                exit_on: info.exit_on,
            },
            preds,
            succs,
        );
        Ok(true)
    }

    /// Branch on the negated condition with swapped targets.
    fn invert_condition(&mut self, block: BlockId) -> Result<(), Error> {
        let label = self.function.label(block).to_string();
        let Some(Terminator::Branch {
            cond,
            if_true,
            if_false,
        }) = self.function.block(block).map(|b| b.terminator.clone())
        else {
            return Err(self.unstructured());
        };
        let reg = match self.function.symbol(&cond) {
            Some(Symbol::ScalarRegister { reg, count: 2 }) if reg % 2 == 0 => reg,
            Some(_) => return Err(Error::InvalidCondition { block: label, cond }),
            None => return Err(Error::UndefinedCondition { block: label, cond }),
        };
        let negated = self.function.alloc_sreg(2, 2)?;
        let symbol = self.function.fresh_symbol(&format!("{cond}_not"));
        self.function.bind_symbol(
            symbol.clone(),
            Symbol::ScalarRegister {
                reg: negated,
                count: 2,
            },
        )?;
        let not = Instruction::new(
            Op::S_NOT_B64,
            [Operand::SregPair(negated), Operand::SregPair(reg)],
        )?
        .with_control_flow();
        log::debug!("{}: {label}: negating {cond} into {symbol}", self.function.name);
        if let Some(bb) = self.function.block_mut(block) {
            bb.instructions.push(not);
            bb.terminator = Terminator::Branch {
                cond: symbol,
                if_true: if_false,
                if_false: if_true,
            };
        }
        Ok(())
    }
}
