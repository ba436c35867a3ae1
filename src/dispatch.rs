//! NDRange dispatch.
//!
//! Work-groups are activated in id order, at most
//! `max_work_groups_in_flight` at a time. Every round steps each runnable
//! wavefront of each active work-group by one instruction.

use crate::config::Config;
use crate::memory::{self, Memory};
use crate::program::Program;
use crate::workgroup::{self, State, WorkGroup};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("invalid launch: {0}")]
    InvalidLaunch(String),
    #[error("{0}")]
    InvalidConfig(String),
    #[error("global memory does not fit initial contents")]
    Memory(#[from] memory::Error),
    #[error(transparent)]
    WorkGroup(#[from] workgroup::Error),
    #[error("deadlock: no wavefront can run, waiting (work-group, wavefront): {waiting:?}")]
    Deadlock { waiting: Vec<(usize, usize)> },
    #[error("exceeded step limit of {0} instructions")]
    StepLimit(u64),
}

/// Launch dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Launch {
    /// Total number of work-items.
    pub grid: usize,
    pub work_group_size: usize,
}

impl Launch {
    #[must_use]
    pub fn num_work_groups(&self) -> usize {
        self.grid.checked_div(self.work_group_size).unwrap_or(0)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.grid == 0 || self.work_group_size == 0 {
            return Err(Error::InvalidLaunch(format!(
                "empty launch {} / {}",
                self.grid, self.work_group_size
            )));
        }
        if self.grid % self.work_group_size != 0 {
            return Err(Error::InvalidLaunch(format!(
                "grid size {} is not a multiple of the work-group size {}",
                self.grid, self.work_group_size
            )));
        }
        if u32::try_from(self.grid).is_err() {
            return Err(Error::InvalidLaunch(format!(
                "grid size {} exceeds 32-bit work-item ids",
                self.grid
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    pub num_work_groups: usize,
    pub num_wavefronts: usize,
    /// Executed instructions over all wavefronts.
    pub num_steps: u64,
    pub num_rounds: u64,
    pub num_barrier_releases: u64,
    pub max_work_groups_active: usize,
}

#[derive(Debug)]
pub struct Outcome {
    pub global_memory: Memory,
    pub stats: Stats,
    /// Finished work-groups ordered by id.
    pub work_groups: Vec<WorkGroup>,
}

#[derive(Debug)]
pub struct Dispatcher<'a> {
    program: &'a Program,
    config: &'a Config,
    launch: Launch,
    pending: VecDeque<usize>,
    active: Vec<WorkGroup>,
    finished: Vec<WorkGroup>,
    global_memory: Memory,
    stats: Stats,
}

impl<'a> Dispatcher<'a> {
    pub fn new(
        program: &'a Program,
        config: &'a Config,
        launch: Launch,
        global_memory: Memory,
    ) -> Result<Self, Error> {
        config
            .validate()
            .map_err(|err| Error::InvalidConfig(err.to_string()))?;
        launch.validate()?;
        let num_work_groups = launch.num_work_groups();
        Ok(Self {
            program,
            config,
            launch,
            pending: (0..num_work_groups).collect(),
            active: Vec::new(),
            finished: Vec::new(),
            global_memory,
            stats: Stats {
                num_work_groups,
                ..Stats::default()
            },
        })
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.pending.is_empty() && self.active.is_empty()
    }

    #[must_use]
    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Move finished work-groups out and fill free slots with pending ones.
    fn activate(&mut self) -> Result<(), Error> {
        let (finished, active): (Vec<_>, Vec<_>) = std::mem::take(&mut self.active)
            .into_iter()
            .partition(|wg| wg.state == State::Finished);
        for wg in finished {
            self.stats.num_barrier_releases += wg.barrier().num_releases();
            log::debug!("work-group {} finished", wg.id);
            self.finished.push(wg);
        }
        self.active = active;

        while self.active.len() < self.config.max_work_groups_in_flight {
            let Some(id) = self.pending.pop_front() else {
                break;
            };
            let mut wg = WorkGroup::new(id, self.launch.work_group_size, self.config)?;
            wg.state = State::Running;
            self.stats.num_wavefronts += wg.wavefronts.len();
            log::debug!(
                "work-group {} dispatched with {} wavefronts",
                id,
                wg.wavefronts.len()
            );
            self.active.push(wg);
        }
        self.stats.max_work_groups_active = self.stats.max_work_groups_active.max(self.active.len());
        Ok(())
    }

    /// Step every runnable wavefront of every active work-group once.
    ///
    /// Returns the number of executed instructions.
    pub fn round(&mut self) -> Result<u64, Error> {
        self.activate()?;
        let mut executed = 0;
        for wg in &mut self.active {
            for wf in 0..wg.wavefronts.len() {
                if !wg.is_runnable(wf) {
                    continue;
                }
                if let Some(max_steps) = self.config.max_steps {
                    if self.stats.num_steps >= max_steps {
                        return Err(Error::StepLimit(max_steps));
                    }
                }
                wg.step(wf, self.program, &mut self.global_memory)?;
                self.stats.num_steps += 1;
                executed += 1;
            }
        }
        self.stats.num_rounds += 1;

        let unfinished = self.active.iter().any(|wg| wg.state != State::Finished);
        if executed == 0 && unfinished {
            let waiting = self
                .active
                .iter()
                .flat_map(|wg| {
                    wg.wavefronts
                        .iter()
                        .filter(|wf| wf.state == crate::wavefront::State::WaitingAtBarrier)
                        .map(move |wf| (wg.id, wf.id))
                })
                .collect();
            return Err(Error::Deadlock { waiting });
        }
        Ok(executed)
    }

    pub fn run(mut self) -> Result<Outcome, Error> {
        log::debug!(
            "dispatching {} ({} work-groups of {} work-items)",
            self.program.name,
            self.stats.num_work_groups,
            self.launch.work_group_size
        );
        while !self.is_done() {
            self.round()?;
            // retire groups that finished in this round
            self.activate()?;
        }
        self.finished.sort_by_key(|wg| wg.id);
        Ok(Outcome {
            global_memory: self.global_memory,
            stats: self.stats,
            work_groups: self.finished,
        })
    }
}

/// Run `program` over the NDRange `launch`.
pub fn run(
    program: &Program,
    config: &Config,
    launch: Launch,
    global_memory: Memory,
) -> Result<Outcome, Error> {
    Dispatcher::new(program, config, launch, global_memory)?.run()
}

#[cfg(test)]
mod tests {
    use super::{run, Error, Launch};
    use crate::config::Config;
    use crate::memory::Memory;
    use crate::testing;
    use color_eyre::eyre;

    fn config(wavefront_size: usize, in_flight: usize) -> Config {
        Config {
            wavefront_size,
            max_work_groups_in_flight: in_flight,
            local_memory_size: 256,
            global_memory_size: 1024,
            ..Config::default()
        }
    }

    #[test]
    fn test_launch_validation() {
        let bad = Launch {
            grid: 10,
            work_group_size: 4,
        };
        assert!(matches!(bad.validate(), Err(Error::InvalidLaunch(_))));
        let empty = Launch {
            grid: 0,
            work_group_size: 4,
        };
        assert!(matches!(empty.validate(), Err(Error::InvalidLaunch(_))));
        let ok = Launch {
            grid: 12,
            work_group_size: 4,
        };
        assert!(ok.validate().is_ok());
        assert_eq!(ok.num_work_groups(), 3);
    }

    #[test]
    fn test_invalid_config_is_rejected() -> eyre::Result<()> {
        let program = testing::assemble(&[("entry", &["v_mov_b32 v2, 1"])])?;
        let launch = Launch {
            grid: 4,
            work_group_size: 4,
        };
        let err = run(&program, &config(0, 1), launch, Memory::new(64)).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(msg) if msg.contains("wavefront size")));
        let err = run(&program, &config(4, 0), launch, Memory::new(64)).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
        Ok(())
    }

    #[test]
    fn test_every_work_item_runs_once() -> eyre::Result<()> {
        testing::init_logging();
        // out[gid] = gid + 100
        let program = testing::assemble(&[(
            "entry",
            &[
                "v_lshlrev_b32 v2, 2, v1",
                "v_add_i32 v3, v1, 100",
                "global_store_dword v2, v3",
            ],
        )])?;
        let config = config(4, 2);
        let launch = Launch {
            grid: 24,
            work_group_size: 8,
        };
        let outcome = run(&program, &config, launch, Memory::new(config.global_memory_size))?;
        let expected: Vec<u32> = (100..124).collect();
        assert_eq!(&outcome.global_memory.words()[..24], expected.as_slice());
        assert_eq!(outcome.global_memory.words()[24], 0);
        assert_eq!(outcome.stats.num_work_groups, 3);
        assert_eq!(outcome.stats.num_wavefronts, 6);
        assert_eq!(outcome.stats.num_steps, 6 * 4);
        assert_eq!(outcome.stats.max_work_groups_active, 2);
        let ids: Vec<_> = outcome.work_groups.iter().map(|wg| wg.id).collect();
        assert_eq!(ids, vec![0, 1, 2]);
        Ok(())
    }

    #[test]
    fn test_step_limit() -> eyre::Result<()> {
        let program = testing::assemble(&[
            ("entry", &[]),
            ("spin", &["s_branch spin"]),
            ("exit", &[]),
        ])?;
        let config = Config {
            max_steps: Some(50),
            ..config(4, 1)
        };
        let launch = Launch {
            grid: 4,
            work_group_size: 4,
        };
        let err = run(&program, &config, launch, Memory::new(64)).unwrap_err();
        assert_eq!(err, Error::StepLimit(50));
        Ok(())
    }
}
