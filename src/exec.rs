//! Wavefront executor.
//!
//! Executes one instruction of a wavefront at a time. Scalar instructions run
//! once per wavefront, vector instructions once per active lane.

use crate::isa::{BranchCond, Decoded, Dst64, Scalar32, Scalar64, ScalarAlu, Vector32};
use crate::mask::LaneMask;
use crate::memory::{self, Memory, Space};
use crate::program::Program;
use crate::register::{self, ScalarRegisters};
use crate::wavefront::{Lane, LaneId, State, Wavefront};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("wavefront {wavefront} of work-group {work_group}: pc {pc} outside of program ({len} instructions)")]
    InvalidCursor {
        work_group: usize,
        wavefront: usize,
        pc: usize,
        len: usize,
    },
    #[error("wavefront {wavefront} of work-group {work_group}: {pc}: {instruction}: {source}")]
    Register {
        work_group: usize,
        wavefront: usize,
        pc: usize,
        instruction: String,
        source: register::Error,
    },
    #[error("lane {lane}: {pc}: {instruction}: {space} memory fault: {source}")]
    Memory {
        lane: LaneId,
        pc: usize,
        instruction: String,
        space: Space,
        source: memory::Error,
    },
}

/// What the scheduler has to do after an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Effect {
    Continue,
    /// Wavefront arrived at a barrier and waits for its siblings.
    Barrier,
    /// Wavefront executed `s_endpgm` and retired.
    EndProgram,
}

/// Memory visible to a wavefront.
#[derive(Debug)]
pub struct Memories<'a> {
    pub local: &'a mut Memory,
    pub global: &'a mut Memory,
}

enum Fault {
    Register(register::Error),
    Memory {
        lane: usize,
        space: Space,
        source: memory::Error,
    },
}

impl From<register::Error> for Fault {
    fn from(err: register::Error) -> Self {
        Self::Register(err)
    }
}

/// Execute the instruction at the cursor of `wavefront`.
pub fn step(
    wavefront: &mut Wavefront,
    program: &Program,
    memory: &mut Memories<'_>,
) -> Result<Effect, Error> {
    debug_assert_eq!(wavefront.state, State::Running);
    let pc = wavefront.pc;
    let Some((instruction, decoded)) = program.fetch(pc) else {
        return Err(Error::InvalidCursor {
            work_group: wavefront.work_group,
            wavefront: wavefront.id,
            pc,
            len: program.len(),
        });
    };
    log::trace!(
        "wg={} wf={} pc={:<4} exec={} {:<10} {}",
        wavefront.work_group,
        wavefront.id,
        pc,
        wavefront.sregs.exec.to_lane_string(wavefront.lanes.len()),
        format!("{:?}", instruction.unit()),
        instruction
    );

    let result = execute(wavefront, decoded, memory);
    let (next_pc, effect) = result.map_err(|fault| match fault {
        Fault::Register(source) => Error::Register {
            work_group: wavefront.work_group,
            wavefront: wavefront.id,
            pc,
            instruction: instruction.to_string(),
            source,
        },
        Fault::Memory {
            lane,
            space,
            source,
        } => Error::Memory {
            lane: wavefront.lane_id(lane),
            pc,
            instruction: instruction.to_string(),
            space,
            source,
        },
    })?;

    wavefront.pc = next_pc.unwrap_or(pc + 1);
    wavefront.num_instructions += 1;
    match effect {
        Effect::Continue => {}
        Effect::Barrier => wavefront.state = State::WaitingAtBarrier,
        Effect::EndProgram => wavefront.state = State::Finished,
    }
    Ok(effect)
}

fn read32(sregs: &ScalarRegisters, src: Scalar32) -> Result<u32, register::Error> {
    match src {
        Scalar32::Reg(idx) => sregs.read(idx),
        Scalar32::Literal(value) => Ok(value),
    }
}

fn read64(sregs: &ScalarRegisters, src: Scalar64) -> Result<u64, register::Error> {
    match src {
        Scalar64::Pair(idx) => sregs.read_pair(idx),
        Scalar64::Exec => Ok(sregs.exec.as_u64()),
        Scalar64::Vcc => Ok(sregs.vcc.as_u64()),
        Scalar64::Literal(value) => Ok(value),
    }
}

/// Write a 64-bit scalar destination.
///
/// Bits of lanes that do not exist are cleared when writing `exec` or `vcc`.
fn write64(
    sregs: &mut ScalarRegisters,
    existing: LaneMask,
    dst: Dst64,
    value: u64,
) -> Result<(), register::Error> {
    match dst {
        Dst64::Pair(idx) => sregs.write_pair(idx, value)?,
        Dst64::Exec => sregs.exec = LaneMask::from(value) & existing,
        Dst64::Vcc => sregs.vcc = LaneMask::from(value) & existing,
    }
    Ok(())
}

fn vector32(sregs: &ScalarRegisters, lane: &Lane, src: Vector32) -> Result<u32, register::Error> {
    match src {
        Vector32::Vreg(idx) => lane.vregs.read(idx),
        Vector32::Sreg(idx) => sregs.read(idx),
        Vector32::Literal(value) => Ok(value),
    }
}

/// Returns the branch target, if any, and the scheduling effect.
#[allow(clippy::too_many_lines)]
fn execute(
    wavefront: &mut Wavefront,
    decoded: Decoded,
    memory: &mut Memories<'_>,
) -> Result<(Option<usize>, Effect), Fault> {
    let existing = wavefront.existing();
    let active = wavefront.active();
    let Wavefront { sregs, lanes, .. } = wavefront;

    match decoded {
        Decoded::SMov { dst, src } => {
            let value = read32(sregs, src)?;
            sregs.write(dst, value)?;
        }
        Decoded::SMov64 { dst, src } => {
            let value = read64(sregs, src)?;
            write64(sregs, existing, dst, value)?;
        }
        Decoded::SAlu { op, dst, a, b } => {
            let (a, b) = (read32(sregs, a)? as i32, read32(sregs, b)? as i32);
            let (value, overflow) = match op {
                ScalarAlu::Add => a.overflowing_add(b),
                ScalarAlu::Sub => a.overflowing_sub(b),
            };
            sregs.write(dst, value as u32)?;
            sregs.scc = overflow;
        }
        Decoded::SBitOp64 { op, dst, a, b } => {
            let value = op.eval(read64(sregs, a)?, read64(sregs, b)?);
            write64(sregs, existing, dst, value)?;
            sregs.scc = value != 0;
        }
        Decoded::SNot64 { dst, src } => {
            let value = !read64(sregs, src)?;
            write64(sregs, existing, dst, value)?;
            sregs.scc = value != 0;
        }
        Decoded::SAndSaveExec { dst, src } => {
            let cond = read64(sregs, src)?;
            let saved = sregs.exec.as_u64();
            write64(sregs, existing, dst, saved)?;
            sregs.exec = LaneMask::from(cond & saved) & existing;
            sregs.scc = !sregs.exec.is_empty();
        }
        Decoded::SCmp { cmp, a, b } => {
            let (a, b) = (read32(sregs, a)? as i32, read32(sregs, b)? as i32);
            sregs.scc = cmp.eval(a, b);
        }
        Decoded::Branch { target } => return Ok((Some(target), Effect::Continue)),
        Decoded::CBranch { cond, target } => {
            let taken = match cond {
                BranchCond::ExecZ => sregs.execz(),
                BranchCond::ExecNz => !sregs.execz(),
                BranchCond::VccZ => sregs.vccz(),
                BranchCond::VccNz => !sregs.vccz(),
                BranchCond::Scc0 => !sregs.scc,
                BranchCond::Scc1 => sregs.scc,
            };
            if taken {
                return Ok((Some(target), Effect::Continue));
            }
        }
        Decoded::Barrier => return Ok((None, Effect::Barrier)),
        Decoded::WaitCnt => {}
        Decoded::EndPgm => return Ok((None, Effect::EndProgram)),
        Decoded::VMov { dst, src } => {
            for idx in active.active_lanes() {
                let lane = &mut lanes[idx];
                let value = vector32(sregs, lane, src)?;
                lane.vregs.write(dst, value)?;
            }
        }
        Decoded::VAlu { op, dst, a, b } => {
            for idx in active.active_lanes() {
                let lane = &mut lanes[idx];
                let value = op.eval(vector32(sregs, lane, a)?, vector32(sregs, lane, b)?);
                lane.vregs.write(dst, value)?;
            }
        }
        Decoded::VCndMask { dst, a, b, mask } => {
            let mask = LaneMask::from(read64(sregs, mask)?);
            for idx in active.active_lanes() {
                let lane = &mut lanes[idx];
                let src = if mask[idx] { b } else { a };
                let value = vector32(sregs, lane, src)?;
                lane.vregs.write(dst, value)?;
            }
        }
        Decoded::VCmp { cmp, dst, a, b } => {
            // inactive lanes report false
            let mut result = LaneMask::ZERO;
            for idx in active.active_lanes() {
                let lane = &lanes[idx];
                let (a, b) = (vector32(sregs, lane, a)?, vector32(sregs, lane, b)?);
                result.set(idx, cmp.eval(a as i32, b as i32));
            }
            write64(sregs, existing, dst, result.as_u64())?;
        }
        Decoded::VReadFirstLane { dst, src } => {
            let idx = active.first_active().unwrap_or(0);
            let value = match lanes.get(idx) {
                Some(lane) => lane.vregs.read(src)?,
                None => 0,
            };
            sregs.write(dst, value)?;
        }
        Decoded::DsRead { dst, addr } | Decoded::GlobalLoad { dst, addr } => {
            let (space, mem) = match decoded {
                Decoded::DsRead { .. } => (Space::Local, &*memory.local),
                _ => (Space::Global, &*memory.global),
            };
            for idx in active.active_lanes() {
                let lane = &mut lanes[idx];
                let address = lane.vregs.read(addr)?;
                let value = mem.read(address).map_err(|source| Fault::Memory {
                    lane: idx,
                    space,
                    source,
                })?;
                lane.vregs.write(dst, value)?;
            }
        }
        Decoded::DsWrite { addr, data } | Decoded::GlobalStore { addr, data } => {
            let (space, mem) = match decoded {
                Decoded::DsWrite { .. } => (Space::Local, &mut *memory.local),
                _ => (Space::Global, &mut *memory.global),
            };
            // ascending lane order, the highest active lane wins
            for idx in active.active_lanes() {
                let lane = &lanes[idx];
                let address = lane.vregs.read(addr)?;
                let value = lane.vregs.read(data)?;
                mem.write(address, value).map_err(|source| Fault::Memory {
                    lane: idx,
                    space,
                    source,
                })?;
            }
        }
    }
    Ok((None, Effect::Continue))
}
