use crate::mask::LaneMask;

/// Scalar registers reserved by the dispatcher.
///
/// `s0` holds the work-group id, `s1` the wavefront id within the work-group.
pub const NUM_RESERVED_SREGS: u16 = 2;
pub const SREG_WORK_GROUP_ID: u16 = 0;
pub const SREG_WAVEFRONT_ID: u16 = 1;

/// Vector registers initialized by the dispatcher.
///
/// `v0` holds the work-item id within the work-group, `v1` the global work-item id.
pub const VREG_LOCAL_ID: u16 = 0;
pub const VREG_GLOBAL_ID: u16 = 1;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("scalar register s{index} out of range (have {count})")]
    Scalar { index: u16, count: usize },
    #[error("vector register v{index} out of range (have {count})")]
    Vector { index: u16, count: usize },
    #[error("scalar pair s[{index}:{}] is not aligned", .index + 1)]
    Unaligned { index: u16 },
}

/// Scalar register file of a wavefront.
///
/// Shared by all lanes and unaffected by the active-lane mask.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScalarRegisters {
    sregs: Box<[u32]>,
    /// Active-lane mask.
    pub exec: LaneMask,
    /// Comparison mask.
    pub vcc: LaneMask,
    pub scc: bool,
}

impl ScalarRegisters {
    #[must_use]
    pub fn new(count: usize) -> Self {
        Self {
            sregs: vec![0; count].into_boxed_slice(),
            exec: LaneMask::ZERO,
            vcc: LaneMask::ZERO,
            scc: false,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sregs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sregs.is_empty()
    }

    pub fn read(&self, index: u16) -> Result<u32, Error> {
        self.sregs
            .get(usize::from(index))
            .copied()
            .ok_or(Error::Scalar {
                index,
                count: self.sregs.len(),
            })
    }

    pub fn write(&mut self, index: u16, value: u32) -> Result<(), Error> {
        let count = self.sregs.len();
        let reg = self
            .sregs
            .get_mut(usize::from(index))
            .ok_or(Error::Scalar { index, count })?;
        *reg = value;
        Ok(())
    }

    /// Read the 64-bit value of pair `s[index:index+1]`, low word first.
    pub fn read_pair(&self, index: u16) -> Result<u64, Error> {
        if index % 2 != 0 {
            return Err(Error::Unaligned { index });
        }
        let lo = self.read(index)?;
        let hi = self.read(index + 1)?;
        Ok(u64::from(lo) | (u64::from(hi) << 32))
    }

    pub fn write_pair(&mut self, index: u16, value: u64) -> Result<(), Error> {
        if index % 2 != 0 {
            return Err(Error::Unaligned { index });
        }
        // check the high register first so a failing write leaves both untouched
        self.read(index + 1)?;
        self.write(index, value as u32)?;
        self.write(index + 1, (value >> 32) as u32)?;
        Ok(())
    }

    #[must_use]
    pub fn execz(&self) -> bool {
        self.exec.is_empty()
    }

    #[must_use]
    pub fn vccz(&self) -> bool {
        self.vcc.is_empty()
    }
}

/// Private vector registers of a single lane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VectorRegisters(Box<[u32]>);

impl VectorRegisters {
    #[must_use]
    pub fn new(count: usize) -> Self {
        Self(vec![0; count].into_boxed_slice())
    }

    pub fn read(&self, index: u16) -> Result<u32, Error> {
        self.0.get(usize::from(index)).copied().ok_or(Error::Vector {
            index,
            count: self.0.len(),
        })
    }

    pub fn write(&mut self, index: u16, value: u32) -> Result<(), Error> {
        let count = self.0.len();
        let reg = self
            .0
            .get_mut(usize::from(index))
            .ok_or(Error::Vector { index, count })?;
        *reg = value;
        Ok(())
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u32] {
        &self.0
    }
}
