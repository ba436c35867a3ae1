use crate::mask::LaneMask;
use crate::register::{
    self, ScalarRegisters, VectorRegisters, SREG_WAVEFRONT_ID, SREG_WORK_GROUP_ID, VREG_GLOBAL_ID,
    VREG_LOCAL_ID,
};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum State {
    Running,
    WaitingAtBarrier,
    Finished,
}

/// Position of a lane in the dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct LaneId {
    pub work_group: usize,
    pub wavefront: usize,
    pub lane: usize,
}

impl std::fmt::Display for LaneId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {}, {})", self.work_group, self.wavefront, self.lane)
    }
}

/// A single work-item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lane {
    /// Work-item id within the work-group.
    pub local_id: u32,
    pub global_id: u32,
    pub vregs: VectorRegisters,
}

/// A group of lanes sharing one instruction stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Wavefront {
    pub work_group: usize,
    pub id: usize,
    pub pc: usize,
    pub state: State,
    pub sregs: ScalarRegisters,
    pub lanes: Vec<Lane>,
    pub num_instructions: u64,
}

impl Wavefront {
    /// Create a wavefront with all of its lanes active.
    ///
    /// `first_local_id` is the work-item id of lane 0 within the work-group,
    /// `base_global_id` the global id of work-item 0 of the work-group.
    pub fn new(
        work_group: usize,
        id: usize,
        first_local_id: u32,
        base_global_id: u32,
        num_lanes: usize,
        num_sregs: usize,
        num_vregs: usize,
    ) -> Result<Self, register::Error> {
        let mut sregs = ScalarRegisters::new(num_sregs);
        sregs.write(SREG_WORK_GROUP_ID, work_group as u32)?;
        sregs.write(SREG_WAVEFRONT_ID, id as u32)?;
        sregs.exec = LaneMask::first(num_lanes);

        let lanes = (0..num_lanes)
            .map(|lane| {
                let local_id = first_local_id + lane as u32;
                let global_id = base_global_id + local_id;
                let mut vregs = VectorRegisters::new(num_vregs);
                vregs.write(VREG_LOCAL_ID, local_id)?;
                vregs.write(VREG_GLOBAL_ID, global_id)?;
                Ok(Lane {
                    local_id,
                    global_id,
                    vregs,
                })
            })
            .collect::<Result<_, register::Error>>()?;

        Ok(Self {
            work_group,
            id,
            pc: 0,
            state: State::Running,
            sregs,
            lanes,
            num_instructions: 0,
        })
    }

    /// Lanes that exist in this wavefront.
    #[must_use]
    pub fn existing(&self) -> LaneMask {
        LaneMask::first(self.lanes.len())
    }

    /// Lanes that execute the next vector instruction.
    #[must_use]
    pub fn active(&self) -> LaneMask {
        self.sregs.exec & self.existing()
    }

    #[must_use]
    pub fn lane_id(&self, lane: usize) -> LaneId {
        LaneId {
            work_group: self.work_group,
            wavefront: self.id,
            lane,
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state == State::Running
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.state == State::Finished
    }
}
