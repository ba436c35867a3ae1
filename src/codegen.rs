//! Region code generator.
//!
//! Lowers divergent control flow onto the active-lane mask. Each conditional
//! and loop region saves the mask it was entered with into a scalar register
//! pair, narrows `exec` for its body and restores the saved mask on the way
//! out. Instructions already present in the basic blocks are left untouched.

use crate::cfg::{self, BlockId, Function, Symbol, Terminator};
use crate::isa::{self, Instruction, Op, Operand};
use crate::region::{self, ExitPolarity, Region, RegionNode};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("region {region:?}: condition {cond:?} is not a known symbol")]
    UnresolvedSymbol { region: String, cond: String },
    #[error("region {region:?}: condition {cond:?} is not bound to an aligned scalar register pair")]
    InvalidSymbol { region: String, cond: String },
    #[error("region {region:?}: block {block:?} does not end in a conditional branch")]
    NotABranch { region: String, block: String },
    #[error("region {region:?} is empty")]
    EmptyRegion { region: String },
    #[error(transparent)]
    Region(#[from] region::Error),
    #[error(transparent)]
    Cfg(#[from] cfg::Error),
    #[error(transparent)]
    Decode(#[from] isa::DecodeError),
}

/// Saved-mask slots indexed by region nesting depth.
///
/// Regions at the same depth never have overlapping live ranges and share a
/// register pair. A nested region always gets a deeper slot.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MaskStack {
    slots: Vec<u16>,
}

impl MaskStack {
    /// Register pair holding the saved mask at `depth`.
    pub fn slot(&mut self, depth: usize, function: &mut Function) -> Result<u16, cfg::Error> {
        while self.slots.len() <= depth {
            let reg = function.alloc_sreg(2, 2)?;
            self.slots.push(reg);
        }
        Ok(self.slots[depth])
    }

    #[must_use]
    pub fn slots(&self) -> &[u16] {
        &self.slots
    }
}

/// Emit the mask manipulation for every region of `region`.
///
/// Regions are visited in post-order, inner regions first.
pub fn emit(function: &mut Function, region: &Region) -> Result<MaskStack, Error> {
    let mut generator = CodeGenerator {
        function,
        stack: MaskStack::default(),
    };
    generator.visit(region, 0)?;
    log::debug!(
        "{}: {} saved-mask slot(s) {:?}",
        generator.function.name,
        generator.stack.slots.len(),
        generator.stack.slots
    );
    Ok(generator.stack)
}

/// Validate a region node and emit its mask manipulation.
pub fn emit_node(function: &mut Function, node: &RegionNode) -> Result<Region, Error> {
    let region = region::resolve(node, function)?;
    emit(function, &region)?;
    Ok(region)
}

struct CodeGenerator<'a> {
    function: &'a mut Function,
    stack: MaskStack,
}

impl<'a> CodeGenerator<'a> {
    fn visit(&mut self, region: &Region, depth: usize) -> Result<(), Error> {
        match region {
            Region::Leaf(_) => Ok(()),
            Region::Block { children, .. } => {
                for child in children {
                    self.visit(child, depth)?;
                }
                Ok(())
            }
            Region::IfThen { cond, then, .. } => {
                self.visit(cond, depth + 1)?;
                self.visit(then, depth + 1)?;
                self.emit_if_then(region, cond, then, depth)
            }
            Region::IfThenElse {
                cond,
                then,
                otherwise,
                ..
            } => {
                self.visit(cond, depth + 1)?;
                self.visit(then, depth + 1)?;
                self.visit(otherwise, depth + 1)?;
                self.emit_if_then_else(region, cond, then, otherwise, depth)
            }
            Region::WhileLoop {
                pre,
                head,
                tail,
                exit,
                exit_on,
                ..
            } => {
                self.visit(head, depth + 1)?;
                self.visit(tail, depth + 1)?;
                self.emit_while_loop(region, *pre, head, tail, *exit, *exit_on, depth)
            }
        }
    }

    fn region_name(&self, region: &Region) -> String {
        region.name(self.function).to_string()
    }

    fn last_leaf(&self, parent: &Region, region: &Region) -> Result<BlockId, Error> {
        region.last_leaf().ok_or_else(|| Error::EmptyRegion {
            region: self.region_name(parent),
        })
    }

    fn first_leaf(&self, parent: &Region, region: &Region) -> Result<BlockId, Error> {
        region.first_leaf().ok_or_else(|| Error::EmptyRegion {
            region: self.region_name(parent),
        })
    }

    /// Scalar pair holding the condition `block` branches on.
    fn condition(&self, region: &Region, block: BlockId) -> Result<u16, Error> {
        let terminator = self.function.block(block).map(|b| &b.terminator);
        let Some(Terminator::Branch { cond, .. }) = terminator else {
            return Err(Error::NotABranch {
                region: self.region_name(region),
                block: self.function.label(block).to_string(),
            });
        };
        match self.function.symbol(cond) {
            Some(Symbol::ScalarRegister { reg, count: 2 }) if reg % 2 == 0 => Ok(reg),
            Some(_) => Err(Error::InvalidSymbol {
                region: self.region_name(region),
                cond: cond.clone(),
            }),
            None => Err(Error::UnresolvedSymbol {
                region: self.region_name(region),
                cond: cond.clone(),
            }),
        }
    }

    fn append(
        &mut self,
        block: BlockId,
        op: Op,
        operands: impl IntoIterator<Item = Operand>,
    ) -> Result<(), Error> {
        let instruction = Instruction::new(op, operands)?.with_control_flow();
        log::trace!("{}: append {}", self.function.label(block), instruction);
        if let Some(bb) = self.function.block_mut(block) {
            bb.instructions.push(instruction);
        }
        Ok(())
    }

    fn prepend(
        &mut self,
        block: BlockId,
        op: Op,
        operands: impl IntoIterator<Item = Operand>,
    ) -> Result<(), Error> {
        let instruction = Instruction::new(op, operands)?.with_control_flow();
        log::trace!("{}: prepend {}", self.function.label(block), instruction);
        if let Some(bb) = self.function.block_mut(block) {
            bb.instructions.insert(0, instruction);
        }
        Ok(())
    }

    fn emit_if_then(
        &mut self,
        region: &Region,
        cond: &Region,
        then: &Region,
        depth: usize,
    ) -> Result<(), Error> {
        let if_block = self.last_leaf(region, cond)?;
        let then_block = self.last_leaf(region, then)?;
        let cond = self.condition(region, if_block)?;
        let slot = self.stack.slot(depth, self.function)?;
        log::debug!(
            "{}: if-then {} with slot s[{}:{}]",
            self.function.name,
            self.region_name(region),
            slot,
            slot + 1
        );

        // push: save exec into the slot and keep lanes that take the branch
        self.append(
            if_block,
            Op::S_AND_SAVEEXEC_B64,
            [Operand::SregPair(slot), Operand::SregPair(cond)],
        )?;
        // pop
        self.append(
            then_block,
            Op::S_MOV_B64,
            [Operand::Exec, Operand::SregPair(slot)],
        )
    }

    fn emit_if_then_else(
        &mut self,
        region: &Region,
        cond: &Region,
        then: &Region,
        otherwise: &Region,
        depth: usize,
    ) -> Result<(), Error> {
        let if_block = self.last_leaf(region, cond)?;
        let then_block = self.last_leaf(region, then)?;
        let else_entry = self.first_leaf(region, otherwise)?;
        let else_block = self.last_leaf(region, otherwise)?;
        let cond = self.condition(region, if_block)?;
        let slot = self.stack.slot(depth, self.function)?;
        log::debug!(
            "{}: if-then-else {} with slot s[{}:{}]",
            self.function.name,
            self.region_name(region),
            slot,
            slot + 1
        );

        self.append(
            if_block,
            Op::S_AND_SAVEEXEC_B64,
            [Operand::SregPair(slot), Operand::SregPair(cond)],
        )?;
        self.function.add_ordering(then_block, else_entry);
        // switch to the lanes that did not take the then side
        self.append(
            then_block,
            Op::S_ANDN2_B64,
            [Operand::Exec, Operand::SregPair(slot), Operand::Exec],
        )?;
        self.append(
            else_block,
            Op::S_MOV_B64,
            [Operand::Exec, Operand::SregPair(slot)],
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn emit_while_loop(
        &mut self,
        region: &Region,
        pre: BlockId,
        head: &Region,
        tail: &Region,
        exit: BlockId,
        exit_on: ExitPolarity,
        depth: usize,
    ) -> Result<(), Error> {
        let head_entry = self.first_leaf(region, head)?;
        let head_block = self.last_leaf(region, head)?;
        let tail_block = self.last_leaf(region, tail)?;
        let cond = self.condition(region, head_block)?;
        let slot = self.stack.slot(depth, self.function)?;
        log::debug!(
            "{}: while loop {} with slot s[{}:{}], exit {:?}",
            self.function.name,
            self.region_name(region),
            slot,
            slot + 1,
            exit_on,
        );

        // push without narrowing
        self.append(
            pre,
            Op::S_MOV_B64,
            [Operand::SregPair(slot), Operand::Exec],
        )?;

        let head_label = self.function.label(head_entry).to_string();
        self.append(tail_block, Op::S_BRANCH, [Operand::Label(head_label)])?;

        // retire the lanes that leave the loop this iteration
        let narrow = match exit_on {
            ExitPolarity::IfFalse => Op::S_AND_B64,
            ExitPolarity::IfTrue => Op::S_ANDN2_B64,
        };
        self.append(
            head_block,
            narrow,
            [Operand::Exec, Operand::Exec, Operand::SregPair(cond)],
        )?;
        let exit_label = self.function.label(exit).to_string();
        self.append(
            head_block,
            Op::S_CBRANCH_EXECZ,
            [Operand::Label(exit_label)],
        )?;

        // pop
        self.prepend(
            exit,
            Op::S_MOV_B64,
            [Operand::Exec, Operand::SregPair(slot)],
        )
    }
}
