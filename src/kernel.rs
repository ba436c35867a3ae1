//! Kernel files.
//!
//! A kernel file describes a function as labeled basic blocks in assembly
//! syntax, the symbols bound by the front-end, an optional region tree and
//! the launch dimensions:
//!
//! ```yaml
//! name: saxpy
//! launch: { grid: 64, work_group_size: 64 }
//! blocks:
//!   - label: entry
//!     instructions: ["v_cmp_lt_i32 vcc, v0, 8", "s_mov_b64 s[2:3], vcc"]
//!     terminator: { branch: { cond: c, if_true: then, if_false: exit } }
//! symbols:
//!   c: { scalar_register: { reg: 2, count: 2 } }
//! ```

use crate::cfg::{self, BasicBlock, Function, Symbol};
use crate::config::Config;
use crate::dispatch::{self, Launch, Outcome};
use crate::memory::Memory;
use crate::region::RegionNode;
use crate::Compiled;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to read kernel file {path:?}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse kernel file")]
    Parse(#[from] serde_yaml::Error),
    #[error("kernel {kernel:?}")]
    Cfg { kernel: String, source: cfg::Error },
    #[error("kernel {kernel:?} needs {required} scalar registers, the device has {available}")]
    TooManyRegisters {
        kernel: String,
        required: usize,
        available: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KernelFile {
    pub name: String,
    pub launch: Launch,
    pub blocks: Vec<BasicBlock>,
    #[serde(default)]
    pub symbols: IndexMap<String, Symbol>,
    /// Region tree. Structural analysis runs when omitted.
    #[serde(default)]
    pub regions: Option<RegionNode>,
    /// Initial contents of global memory, starting at address 0.
    #[serde(default)]
    pub global_memory: Vec<u32>,
}

impl KernelFile {
    pub fn from_yaml(yaml: &str) -> Result<Self, Error> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|source| Error::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&yaml)
    }

    /// Build the kernel function. The first block is the entry.
    pub fn function(&self, config: &Config) -> Result<Function, Error> {
        let num_sregs = u16::try_from(config.num_scalar_registers).unwrap_or(u16::MAX);
        let mut function = Function::new(&self.name, num_sregs);
        let with_kernel = |source| Error::Cfg {
            kernel: self.name.clone(),
            source,
        };
        for block in &self.blocks {
            function.add_block(block.clone()).map_err(with_kernel)?;
        }
        for (name, symbol) in &self.symbols {
            function
                .bind_symbol(name.clone(), *symbol)
                .map_err(with_kernel)?;
        }
        let required = usize::from(function.num_sregs_used());
        if required > config.num_scalar_registers {
            return Err(Error::TooManyRegisters {
                kernel: self.name.clone(),
                required,
                available: config.num_scalar_registers,
            });
        }
        Ok(function)
    }

    pub fn compile(&self, config: &Config) -> Result<Compiled, crate::Error> {
        let function = self.function(config)?;
        crate::compile(function, self.regions.as_ref())
    }

    /// Compile and dispatch the kernel.
    pub fn run(&self, config: &Config) -> Result<(Compiled, Outcome), crate::Error> {
        let compiled = self.compile(config)?;
        let global_memory = Memory::with_contents(config.global_memory_size, &self.global_memory)
            .map_err(dispatch::Error::from)?;
        let outcome = dispatch::run(&compiled.program, config, self.launch, global_memory)?;
        Ok((compiled, outcome))
    }
}

#[cfg(test)]
mod tests {
    use super::{Error, KernelFile};
    use crate::cfg::{Symbol, Terminator};
    use crate::config::Config;
    use color_eyre::eyre;

    const KERNEL: &str = r#"
name: clamp
launch: { grid: 4, work_group_size: 4 }
blocks:
  - label: entry
    instructions:
      - v_cmp_gt_i32 vcc, v0, 1
      - s_mov_b64 s[2:3], vcc
    terminator: { branch: { cond: big, if_true: clamp, if_false: exit } }
  - label: clamp
    instructions: ["v_mov_b32 v0, 1"]
    terminator: { jump: { target: exit } }
  - label: exit
    instructions:
      - v_lshlrev_b32 v2, 2, v1
      - global_store_dword v2, v0
    terminator: return
symbols:
  big: { scalar_register: { reg: 2, count: 2 } }
global_memory: [7, 7, 7, 7]
"#;

    #[test]
    fn test_parse() -> eyre::Result<()> {
        let kernel = KernelFile::from_yaml(KERNEL)?;
        assert_eq!(kernel.name, "clamp");
        assert_eq!(kernel.blocks.len(), 3);
        assert_eq!(kernel.blocks[2].terminator, Terminator::Return);
        assert_eq!(
            kernel.symbols.get("big"),
            Some(&Symbol::ScalarRegister { reg: 2, count: 2 })
        );
        assert_eq!(kernel.launch.grid, 4);
        assert!(kernel.regions.is_none());
        Ok(())
    }

    #[test]
    fn test_run_with_structural_analysis() -> eyre::Result<()> {
        crate::testing::init_logging();
        let kernel = KernelFile::from_yaml(KERNEL)?;
        let config = Config {
            wavefront_size: 4,
            ..Config::default()
        };
        let (compiled, outcome) = kernel.run(&config)?;
        assert!(compiled.program.to_string().contains("s_and_saveexec_b64"));
        assert_eq!(&outcome.global_memory.words()[..5], &[0, 1, 1, 1, 0]);
        Ok(())
    }

    #[test]
    fn test_unknown_field() {
        let yaml = format!("{KERNEL}\nwarps: 2\n");
        assert!(matches!(KernelFile::from_yaml(&yaml), Err(Error::Parse(_))));
    }

    #[test]
    fn test_demos() -> eyre::Result<()> {
        crate::testing::init_logging();
        let demos = std::path::PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("demos");
        let config = Config::default();
        let run = |name: &str| -> eyre::Result<Vec<u32>> {
            let kernel = KernelFile::from_path(demos.join(format!("{name}.yaml")))?;
            let (_, outcome) = kernel.run(&config)?;
            Ok(outcome.global_memory.words()[..kernel.launch.grid].to_vec())
        };

        let clamp = run("clamp")?;
        assert!(clamp
            .iter()
            .enumerate()
            .all(|(gid, out)| *out == (gid as u32 % 64).min(1)));

        assert_eq!(run("countdown")?, (0..16).collect::<Vec<u32>>());

        let reverse = run("reverse")?;
        assert_eq!(&reverse[120..128], &[8, 7, 6, 5, 4, 3, 2, 1]);
        assert!(reverse[..120].iter().all(|out| *out == 0));
        assert!(reverse[128..].iter().all(|out| *out == 0));
        Ok(())
    }

    #[test]
    fn test_register_limit() -> eyre::Result<()> {
        let kernel = KernelFile::from_yaml(KERNEL)?;
        let config = Config {
            num_scalar_registers: 3,
            ..Config::default()
        };
        assert!(matches!(
            kernel.function(&config),
            Err(Error::TooManyRegisters { required: 4, .. })
        ));
        Ok(())
    }

    #[test]
    fn test_register_limit_counts_instruction_operands() -> eyre::Result<()> {
        let mut kernel = KernelFile::from_yaml(KERNEL)?;
        kernel.blocks[1]
            .instructions
            .push("s_mov_b64 s[10:11], exec".parse()?);
        let config = Config {
            num_scalar_registers: 8,
            ..Config::default()
        };
        assert!(matches!(
            kernel.function(&config),
            Err(Error::TooManyRegisters { required: 12, .. })
        ));
        Ok(())
    }
}
