use crate::barrier::{self, Barrier, Message};
use crate::config::Config;
use crate::exec::{self, Effect, Memories};
use crate::memory::Memory;
use crate::program::Program;
use crate::register;
use crate::wavefront::{self, Wavefront};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error(transparent)]
    Exec(#[from] exec::Error),
    #[error(transparent)]
    Barrier(#[from] barrier::Error),
    #[error("failed to create wavefront {wavefront} of work-group {work_group}")]
    Create {
        work_group: usize,
        wavefront: usize,
        source: register::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum State {
    Pending,
    Running,
    Finished,
}

/// Arena of the wavefronts of one work-group.
///
/// Wavefronts are addressed by their index in the group.
#[derive(Debug)]
pub struct WorkGroup {
    pub id: usize,
    pub state: State,
    pub wavefronts: Vec<Wavefront>,
    pub local_memory: Memory,
    barrier: Barrier,
}

impl WorkGroup {
    /// Create the wavefronts of work-group `id` with `size` work-items.
    pub fn new(id: usize, size: usize, config: &Config) -> Result<Self, Error> {
        let num_wavefronts = size.div_ceil(config.wavefront_size);
        let base_global_id = (id * size) as u32;
        let wavefronts = (0..num_wavefronts)
            .map(|wf| {
                let first = wf * config.wavefront_size;
                let num_lanes = config.wavefront_size.min(size - first);
                Wavefront::new(
                    id,
                    wf,
                    first as u32,
                    base_global_id,
                    num_lanes,
                    config.num_scalar_registers,
                    config.num_vector_registers,
                )
                .map_err(|source| Error::Create {
                    work_group: id,
                    wavefront: wf,
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            id,
            state: State::Pending,
            barrier: Barrier::new(id, wavefronts.len()),
            wavefronts,
            local_memory: Memory::new(config.local_memory_size),
        })
    }

    #[must_use]
    pub fn barrier(&self) -> &Barrier {
        &self.barrier
    }

    /// Indices of wavefronts that can execute.
    pub fn runnable(&self) -> impl Iterator<Item = usize> + '_ {
        self.wavefronts
            .iter()
            .enumerate()
            .filter(|(_, wf)| wf.is_running())
            .map(|(idx, _)| idx)
    }

    #[must_use]
    pub fn is_runnable(&self, wavefront: usize) -> bool {
        self.wavefronts
            .get(wavefront)
            .is_some_and(Wavefront::is_running)
    }

    /// Execute one instruction of `wavefront`.
    pub fn step(
        &mut self,
        wavefront: usize,
        program: &Program,
        global: &mut Memory,
    ) -> Result<Effect, Error> {
        let Some(wf) = self.wavefronts.get_mut(wavefront) else {
            return Err(barrier::Error::UnknownWavefront {
                work_group: self.id,
                wavefront,
            }
            .into());
        };
        let mut memories = Memories {
            local: &mut self.local_memory,
            global,
        };
        let effect = exec::step(wf, program, &mut memories)?;
        match effect {
            Effect::Continue => return Ok(effect),
            Effect::Barrier => self.barrier.post(Message::Arrived { wavefront })?,
            Effect::EndProgram => {
                log::debug!(
                    "work-group {}: wavefront {} retired after {} instructions",
                    self.id,
                    wavefront,
                    wf.num_instructions
                );
                self.barrier.post(Message::Retired { wavefront })?;
            }
        }

        for idx in self.barrier.synchronize()? {
            self.wavefronts[idx].state = wavefront::State::Running;
        }
        if self.wavefronts.iter().all(Wavefront::is_finished) {
            self.state = State::Finished;
        }
        Ok(effect)
    }
}
