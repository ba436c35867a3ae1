#![allow(
    clippy::upper_case_acronyms,
    non_camel_case_types,
    clippy::too_many_arguments,
    clippy::missing_panics_doc,
    clippy::missing_errors_doc,
    clippy::too_many_lines,
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_sign_loss
)]

pub mod barrier;
pub mod cfg;
pub mod codegen;
pub mod config;
pub mod dispatch;
pub mod exec;
pub mod isa;
pub mod kernel;
pub mod mask;
pub mod memory;
pub mod program;
pub mod region;
pub mod register;
pub mod structure;
pub mod wavefront;
pub mod workgroup;

#[cfg(test)]
pub mod testing;

use cfg::Function;
use codegen::MaskStack;
use program::Program;
use region::{Region, RegionNode};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Cfg(#[from] cfg::Error),
    #[error(transparent)]
    Region(#[from] region::Error),
    #[error(transparent)]
    Structure(#[from] structure::Error),
    #[error(transparent)]
    Codegen(#[from] codegen::Error),
    #[error(transparent)]
    Program(#[from] program::Error),
    #[error(transparent)]
    Dispatch(#[from] dispatch::Error),
    #[error(transparent)]
    Config(#[from] config::Error),
    #[error(transparent)]
    Kernel(#[from] kernel::Error),
}

/// A kernel lowered to a linear program.
#[derive(Debug, Clone)]
pub struct Compiled {
    /// Function with the emitted mask instructions.
    pub function: Function,
    pub region: Region,
    pub mask_stack: MaskStack,
    pub program: Program,
}

/// Lower `function` to a program executable by wavefronts.
///
/// Uses the given region tree, or derives one by structural analysis.
pub fn compile(mut function: Function, regions: Option<&RegionNode>) -> Result<Compiled, Error> {
    let region = match regions {
        Some(node) => region::resolve(node, &function)?,
        None => structure::analyze(&mut function)?,
    };
    let mask_stack = codegen::emit(&mut function, &region)?;
    let program = Program::link(&function, &region)?;
    log::debug!(
        "compiled {}: {} blocks, {} instructions",
        function.name,
        function.num_blocks(),
        program.len()
    );
    Ok(Compiled {
        function,
        region,
        mask_stack,
        program,
    })
}
