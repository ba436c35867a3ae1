use crate::cfg::{BlockId, Function, Terminator};
use crate::isa::{self, Decoded, Instruction, Op, Operand, Unit};
use crate::region::Region;
use indexmap::IndexMap;
use std::ops::Range;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("basic block {0:?} is not part of the region tree")]
    UncoveredBlock(String),
    #[error("basic block {0:?} appears more than once in the region tree")]
    DuplicateBlock(String),
    #[error("{pc}: {instruction}: undefined label {label:?}")]
    UndefinedLabel {
        pc: usize,
        instruction: String,
        label: String,
    },
    #[error("basic block {0:?} returns before the end of the program")]
    MisplacedReturn(String),
    #[error("last basic block {0:?} does not return")]
    MissingReturn(String),
    #[error("{pc}: {instruction}: {source}")]
    Decode {
        pc: usize,
        instruction: String,
        source: isa::DecodeError,
    },
}

/// Linear instruction buffer executed by every wavefront of a dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Program {
    pub name: String,
    instructions: Vec<Instruction>,
    decoded: Vec<Decoded>,
    labels: IndexMap<String, usize>,
    blocks: IndexMap<String, Range<usize>>,
    barriers: Vec<usize>,
    ordering: Vec<(String, String)>,
}

impl Program {
    /// Lay out the basic blocks of `function` in region order.
    ///
    /// Branches and jumps between blocks are implicit in the layout and the
    /// mask instructions emitted for the regions. A `return` becomes
    /// `s_endpgm` and must end the last block.
    pub fn link(function: &Function, region: &Region) -> Result<Self, Error> {
        let layout = region.leaves();
        let mut seen = vec![false; function.num_blocks()];
        for &block in &layout {
            match seen.get_mut(block) {
                Some(seen) if *seen => {
                    return Err(Error::DuplicateBlock(function.label(block).to_string()))
                }
                Some(seen) => *seen = true,
                None => return Err(Error::UncoveredBlock(format!("#{block}"))),
            }
        }
        if let Some(block) = seen.iter().position(|seen| !seen) {
            return Err(Error::UncoveredBlock(function.label(block).to_string()));
        }

        let mut instructions = Vec::new();
        let mut labels = IndexMap::new();
        let mut blocks = IndexMap::new();
        for (i, &id) in layout.iter().enumerate() {
            let Some(block) = function.block(id) else {
                continue;
            };
            let start = instructions.len();
            labels.insert(block.label.clone(), start);
            instructions.extend(block.instructions.iter().cloned());
            let is_last = i + 1 == layout.len();
            match (&block.terminator, is_last) {
                (Terminator::Return, true) => {
                    let pc = instructions.len();
                    let end = Instruction::new(Op::S_ENDPGM, []).map_err(|source| Error::Decode {
                        pc,
                        instruction: Op::S_ENDPGM.to_string(),
                        source,
                    })?;
                    instructions.push(end);
                }
                (Terminator::Return, false) => {
                    return Err(Error::MisplacedReturn(block.label.clone()))
                }
                (_, true) => return Err(Error::MissingReturn(block.label.clone())),
                (_, false) => {}
            }
            blocks.insert(block.label.clone(), start..instructions.len());
        }

        for (pc, instruction) in instructions.iter_mut().enumerate() {
            let undefined = instruction
                .labels()
                .find(|label| !labels.contains_key(*label))
                .map(str::to_string);
            if let Some(label) = undefined {
                return Err(Error::UndefinedLabel {
                    pc,
                    instruction: instruction.to_string(),
                    label,
                });
            }
            for operand in &mut instruction.operands {
                let target = match operand {
                    Operand::Label(label) => labels.get(label.as_str()).copied(),
                    _ => None,
                };
                if let Some(target) = target {
                    *operand = Operand::Target(target);
                }
            }
        }

        let decoded = instructions
            .iter()
            .enumerate()
            .map(|(pc, instruction)| {
                instruction.decode().map_err(|source| Error::Decode {
                    pc,
                    instruction: instruction.to_string(),
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let barriers = instructions
            .iter()
            .enumerate()
            .filter(|(_, instruction)| instruction.unit() == Unit::Barrier)
            .map(|(pc, _)| pc)
            .collect();
        let label = |id: BlockId| function.label(id).to_string();
        let ordering = function
            .ordering()
            .iter()
            .map(|(from, to)| (label(*from), label(*to)))
            .collect();

        log::debug!(
            "linked {}: {} instructions, {} blocks, barriers at {:?}",
            function.name,
            instructions.len(),
            blocks.len(),
            barriers
        );
        Ok(Self {
            name: function.name.clone(),
            instructions,
            decoded,
            labels,
            blocks,
            barriers,
            ordering,
        })
    }

    #[must_use]
    pub fn fetch(&self, pc: usize) -> Option<(&Instruction, Decoded)> {
        let instruction = self.instructions.get(pc)?;
        let decoded = self.decoded.get(pc)?;
        Some((instruction, *decoded))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    #[must_use]
    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    /// Instruction index of the first instruction of each basic block.
    #[must_use]
    pub fn labels(&self) -> &IndexMap<String, usize> {
        &self.labels
    }

    #[must_use]
    pub fn block(&self, label: &str) -> Option<Range<usize>> {
        self.blocks.get(label).cloned()
    }

    #[must_use]
    pub fn barriers(&self) -> &[usize] {
        &self.barriers
    }

    /// Block pairs whose order must be kept by later passes.
    #[must_use]
    pub fn ordering(&self) -> &[(String, String)] {
        &self.ordering
    }
}

impl std::fmt::Display for Program {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{}:", self.name)?;
        for (label, range) in &self.blocks {
            writeln!(f, "{label}:")?;
            for pc in range.clone() {
                let instruction = &self.instructions[pc];
                let marker = if instruction.control_flow { "*" } else { " " };
                writeln!(f, "  {pc:>4}{marker} {instruction}")?;
            }
        }
        Ok(())
    }
}
