use bitvec::field::BitField;
use bitvec::BitArr;
use serde::{Deserialize, Serialize};

/// Maximum number of lanes in a wavefront.
///
/// Masks are always this wide, lanes that do not exist keep their bit cleared.
pub const MAX_WAVEFRONT_SIZE: usize = 64;

pub type Inner = BitArr!(for MAX_WAVEFRONT_SIZE, in u64);

/// Lane mask.
///
/// Bitmask where a 1 at position i means that lane i participates.
/// Used for both the active-lane mask (`exec`) and the comparison mask (`vcc`).
#[derive(Default, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord)]
#[repr(transparent)]
pub struct LaneMask(Inner);

impl LaneMask {
    /// Mask with all lanes inactive
    pub const ZERO: Self = LaneMask(Inner::ZERO);

    #[must_use]
    pub fn all_ones() -> Self {
        Self::ZERO.inverted()
    }

    /// Mask with the lowest `num_lanes` lanes set.
    #[must_use]
    pub fn first(num_lanes: usize) -> Self {
        let mut mask = Self::ZERO;
        mask.0[..num_lanes.min(MAX_WAVEFRONT_SIZE)].fill(true);
        mask
    }

    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.0.load()
    }

    #[must_use]
    pub fn inverted(mut self) -> Self {
        self.0 = !self.0;
        self
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.not_any()
    }

    #[must_use]
    pub fn num_active(&self) -> usize {
        self.0.count_ones()
    }

    /// Every lane set in `self` is also set in `other`.
    #[must_use]
    pub fn is_subset_of(&self, other: &Self) -> bool {
        (*self & !*other).is_empty()
    }

    #[must_use]
    pub fn is_disjoint(&self, other: &Self) -> bool {
        (*self & *other).is_empty()
    }

    pub fn active_lanes(&self) -> impl Iterator<Item = usize> + '_ {
        self.0.iter_ones()
    }

    #[must_use]
    pub fn first_active(&self) -> Option<usize> {
        self.0.first_one()
    }
}

impl From<u64> for LaneMask {
    fn from(value: u64) -> Self {
        let mut mask = Inner::ZERO;
        mask.store(value);
        Self(mask)
    }
}

impl From<LaneMask> for u64 {
    fn from(mask: LaneMask) -> Self {
        mask.as_u64()
    }
}

impl std::ops::Deref for LaneMask {
    type Target = Inner;
    fn deref(&self) -> &Inner {
        &self.0
    }
}

impl std::ops::DerefMut for LaneMask {
    fn deref_mut(&mut self) -> &mut Inner {
        &mut self.0
    }
}

impl std::ops::BitAnd for LaneMask {
    type Output = Self;
    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl std::ops::BitOr for LaneMask {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl std::ops::Not for LaneMask {
    type Output = Self;
    fn not(self) -> Self {
        self.inverted()
    }
}

impl Serialize for LaneMask {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_u64(self.as_u64())
    }
}

impl<'de> Deserialize<'de> for LaneMask {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Self::from)
    }
}

impl std::fmt::Debug for LaneMask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "LaneMask({:#x})", self.as_u64())
    }
}

impl std::fmt::Display for LaneMask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#018x}", self.as_u64())
    }
}

/// Format as a binary string.
pub trait ToBitString {
    fn to_bit_string(&self) -> String;
}

impl<A, O> ToBitString for bitvec::slice::BitSlice<A, O>
where
    A: bitvec::store::BitStore,
    O: bitvec::order::BitOrder,
{
    fn to_bit_string(&self) -> String {
        self.iter()
            .rev()
            .map(|b| if *b { "1" } else { "0" })
            .collect::<Vec<_>>()
            .join("")
    }
}

impl LaneMask {
    /// Bit string of the lowest `num_lanes` lanes, lane 0 rightmost.
    #[must_use]
    pub fn to_lane_string(&self, num_lanes: usize) -> String {
        self.0[..num_lanes.min(MAX_WAVEFRONT_SIZE)].to_bit_string()
    }
}
