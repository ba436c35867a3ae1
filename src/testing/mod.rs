pub mod barrier;
pub mod divergence;
pub mod properties;

use crate::cfg::{BasicBlock, Function, Symbol, Terminator};
use crate::exec::{self, Effect, Memories};
use crate::mask::LaneMask;
use crate::memory::Memory;
use crate::program::Program;
use crate::region::{Kind, Region, RegionNode, Role};
use crate::wavefront::{State, Wavefront};
use crate::Compiled;
use color_eyre::eyre;

static LOGGER: std::sync::Once = std::sync::Once::new();

pub fn init_logging() {
    LOGGER.call_once(|| {
        env_logger::builder().is_test(true).init();
    });
}

pub fn jump(target: &str) -> Terminator {
    Terminator::Jump {
        target: target.to_string(),
    }
}

pub fn branch(cond: &str, if_true: &str, if_false: &str) -> Terminator {
    Terminator::Branch {
        cond: cond.to_string(),
        if_true: if_true.to_string(),
        if_false: if_false.to_string(),
    }
}

/// Build a function from `(label, instructions, terminator)` triples.
///
/// Every symbol is bound to the scalar pair starting at the given register.
pub fn function(
    blocks: &[(&str, &[&str], Terminator)],
    symbols: &[(&str, u16)],
) -> eyre::Result<Function> {
    let mut func = Function::new("kernel", 104);
    for (label, instructions, terminator) in blocks {
        let mut block = BasicBlock::new(*label, terminator.clone());
        for instruction in *instructions {
            block.instructions.push(instruction.parse()?);
        }
        func.add_block(block)?;
    }
    for (name, reg) in symbols {
        func.bind_symbol(*name, Symbol::ScalarRegister { reg: *reg, count: 2 })?;
    }
    Ok(func)
}

/// Straight-line program from consecutive basic blocks.
///
/// Blocks fall through to the next one, the last one returns.
pub fn assemble(blocks: &[(&str, &[&str])]) -> eyre::Result<Program> {
    let triples: Vec<(&str, &[&str], Terminator)> = blocks
        .iter()
        .enumerate()
        .map(|(i, (label, instructions))| {
            let terminator = match blocks.get(i + 1) {
                Some((next, _)) => jump(next),
                None => Terminator::Return,
            };
            (*label, *instructions, terminator)
        })
        .collect();
    let func = function(&triples, &[])?;
    let region = Region::Block {
        name: "block_0".to_string(),
        children: (0..blocks.len()).map(Region::Leaf).collect(),
    };
    Ok(Program::link(&func, &region)?)
}

/// `if (c) { v3 = 1 }` with `c` held in `s[2:3]`.
///
/// `entry` runs before the branch.
pub fn if_then(entry: &[&str]) -> eyre::Result<Compiled> {
    let func = function(
        &[
            ("entry", entry, branch("c", "then", "exit")),
            ("then", &["v_mov_b32 v3, 1"], jump("exit")),
            ("exit", &["v_mov_b32 v4, 1"], Terminator::Return),
        ],
        &[("c", 2)],
    )?;
    let regions = RegionNode::composite(
        "block_0",
        Kind::Block,
        vec![
            RegionNode::composite(
                "if_then_0",
                Kind::IfThen,
                vec![
                    RegionNode::leaf("entry").with_role(Role::If),
                    RegionNode::leaf("then").with_role(Role::Then),
                ],
            ),
            RegionNode::leaf("exit"),
        ],
    );
    Ok(crate::compile(func, Some(&regions))?)
}

/// `if (c) { v3 = 1 } else { v3 = 2 }` with `c` held in `s[2:3]`.
///
/// The region tree is derived by structural analysis.
pub fn if_then_else() -> eyre::Result<Compiled> {
    let func = function(
        &[
            ("entry", &[], branch("c", "then", "else")),
            ("then", &["v_mov_b32 v3, 1"], jump("exit")),
            ("else", &["v_mov_b32 v3, 2"], jump("exit")),
            ("exit", &["v_mov_b32 v4, 1"], Terminator::Return),
        ],
        &[("c", 2)],
    )?;
    Ok(crate::compile(func, None)?)
}

/// `v2 = 0; while (v2 < v5) { v2 += 1 }` with the loop condition in `s[2:3]`.
///
/// With `exit_if_true` the head branches to the exit when the condition
/// holds, so the loop runs while `v2 >= v5`.
pub fn counted_loop(exit_if_true: bool) -> eyre::Result<Compiled> {
    counted_loop_with(exit_if_true, "v_cmp_lt_i32 vcc, v2, v5")
}

/// `v2 = 0; while (..) { v2 += 1 }` with the head condition computed by
/// `compare` into `vcc`.
pub fn counted_loop_with(exit_if_true: bool, compare: &str) -> eyre::Result<Compiled> {
    let head = if exit_if_true {
        branch("c", "exit", "tail")
    } else {
        branch("c", "tail", "exit")
    };
    let func = function(
        &[
            ("pre", &["v_mov_b32 v2, 0"], jump("head")),
            (
                "head",
                &[compare, "s_mov_b64 s[2:3], vcc"],
                head,
            ),
            ("tail", &["v_add_i32 v2, v2, 1"], jump("head")),
            ("exit", &[], Terminator::Return),
        ],
        &[("c", 2)],
    )?;
    let regions = RegionNode::composite(
        "loop_0",
        Kind::WhileLoop,
        vec![
            RegionNode::leaf("pre").with_role(Role::Pre),
            RegionNode::leaf("head")
                .exit_if(exit_if_true)
                .with_role(Role::Head),
            RegionNode::leaf("tail").with_role(Role::Tail),
            RegionNode::leaf("exit").with_role(Role::Exit),
        ],
    );
    Ok(crate::compile(func, Some(&regions))?)
}

/// Wavefront 0 of work-group 0 with `num_lanes` lanes and the given mask.
pub fn wavefront(num_lanes: usize, exec: u64) -> Wavefront {
    let mut wf = Wavefront::new(0, 0, 0, 0, num_lanes, 104, 16).unwrap();
    wf.sregs.exec = LaneMask::from(exec) & wf.existing();
    wf
}

/// Values of vector register `reg` across all lanes.
pub fn lane_values(wf: &Wavefront, reg: u16) -> Vec<u32> {
    wf.lanes.iter().map(|lane| lane.vregs.read(reg).unwrap()).collect()
}

/// `exec` before every executed instruction.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ExecTrace {
    pub steps: Vec<(usize, LaneMask)>,
}

impl ExecTrace {
    /// Masks seen at `pc`, one per visit.
    pub fn at(&self, pc: usize) -> Vec<LaneMask> {
        self.steps
            .iter()
            .filter(|(step_pc, _)| *step_pc == pc)
            .map(|(_, exec)| *exec)
            .collect()
    }

    /// Masks seen at the first instruction of block `label`.
    pub fn at_block(&self, program: &Program, label: &str) -> Vec<LaneMask> {
        let range = program.block(label).unwrap();
        self.at(range.start)
    }

    pub fn visits(&self, program: &Program, label: &str) -> usize {
        self.at_block(program, label).len()
    }
}

/// Run a single wavefront to completion and record its masks.
///
/// The wavefront is alone in its work-group, so every barrier releases it
/// immediately.
pub fn run_traced(wf: &mut Wavefront, program: &Program) -> eyre::Result<ExecTrace> {
    let (mut local, mut global) = (Memory::new(4096), Memory::new(4096));
    let mut memories = Memories {
        local: &mut local,
        global: &mut global,
    };
    let mut trace = ExecTrace::default();
    while !wf.is_finished() {
        if trace.steps.len() > 100_000 {
            eyre::bail!("wavefront did not finish within {} steps", trace.steps.len());
        }
        trace.steps.push((wf.pc, wf.sregs.exec));
        if exec::step(wf, program, &mut memories)? == Effect::Barrier {
            wf.state = State::Running;
        }
    }
    Ok(trace)
}
