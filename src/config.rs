use crate::mask::MAX_WAVEFRONT_SIZE;
use crate::memory::WORD_SIZE;
use crate::register::{NUM_RESERVED_SREGS, VREG_GLOBAL_ID};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to read config {path:?}")]
    Io {
        path: std::path::PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Simulator configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Number of lanes per wavefront (at most 64).
    pub wavefront_size: usize,
    /// Work-groups that execute concurrently.
    pub max_work_groups_in_flight: usize,
    /// Local memory per work-group in bytes.
    pub local_memory_size: usize,
    /// Global memory in bytes.
    pub global_memory_size: usize,
    pub num_scalar_registers: usize,
    pub num_vector_registers: usize,
    /// Abort after this many executed instructions.
    pub max_steps: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            wavefront_size: 64,
            max_work_groups_in_flight: 4,
            local_memory_size: 32 * 1024,
            global_memory_size: 1024 * 1024,
            num_scalar_registers: 104,
            num_vector_registers: 256,
            max_steps: None,
        }
    }
}

impl Config {
    pub fn from_yaml(yaml: &str) -> Result<Self, Error> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|source| Error::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&yaml)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if !(1..=MAX_WAVEFRONT_SIZE).contains(&self.wavefront_size) {
            return Err(Error::Invalid(format!(
                "wavefront size must be between 1 and {MAX_WAVEFRONT_SIZE}, got {}",
                self.wavefront_size
            )));
        }
        if self.max_work_groups_in_flight == 0 {
            return Err(Error::Invalid(
                "at least one work-group must be in flight".to_string(),
            ));
        }
        if self.num_scalar_registers < NUM_RESERVED_SREGS as usize {
            return Err(Error::Invalid(format!(
                "need at least {NUM_RESERVED_SREGS} scalar registers, got {}",
                self.num_scalar_registers
            )));
        }
        if self.num_vector_registers <= VREG_GLOBAL_ID as usize {
            return Err(Error::Invalid(format!(
                "need at least {} vector registers, got {}",
                VREG_GLOBAL_ID + 1,
                self.num_vector_registers
            )));
        }
        for (name, size) in [
            ("local", self.local_memory_size),
            ("global", self.global_memory_size),
        ] {
            if size % WORD_SIZE as usize != 0 || u32::try_from(size).is_err() {
                return Err(Error::Invalid(format!(
                    "{name} memory size {size} must be a multiple of {WORD_SIZE} addressable with 32 bits"
                )));
            }
        }
        Ok(())
    }
}
