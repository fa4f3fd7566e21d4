//! Round-mask planning for batches whose lanes carry different amounts of
//! data.
//!
//! A batch hands every lane a block of `k * 64` bytes, where `k` may differ
//! per lane. Rather than running every lane for the longest block, the planner
//! produces a short list of `(mask, rounds)` steps. Each step advances the
//! lanes in `mask` by `rounds` blocks; lanes drop out of the mask as soon as
//! their data is exhausted.

use std::fmt;

use crate::BLOCK_SIZE;

/// Set of lanes participating in a kernel invocation.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct LaneMask(u32);

impl LaneMask {
    /// Mask without any lane.
    pub const EMPTY: Self = Self(0);

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, lane: usize) -> bool {
        lane < 32 && self.0 & (1 << lane) != 0
    }

    pub fn insert(&mut self, lane: usize) {
        debug_assert!(lane < 32);
        self.0 |= 1 << lane;
    }

    pub fn remove(&mut self, lane: usize) {
        debug_assert!(lane < 32);
        self.0 &= !(1 << lane);
    }

    pub const fn count(self) -> usize {
        self.0.count_ones() as usize
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Iterate the set lanes in ascending order.
    pub fn lanes(self) -> impl Iterator<Item = usize> {
        (0..32).filter(move |&lane| self.contains(lane))
    }
}

impl fmt::Debug for LaneMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LaneMask({:#010b})", self.0)
    }
}

/// A single kernel invocation: advance the lanes in `mask` by `rounds` blocks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaskRounds {
    pub mask: LaneMask,
    pub rounds: usize,
}

/// Ordered kernel invocations covering one batch of `N` lanes.
///
/// A plan never holds more than `N` steps, one per distinct non-zero block
/// length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Plan<const N: usize> {
    steps: [MaskRounds; N],
    len: usize,
}

impl<const N: usize> Plan<N> {
    pub fn steps(&self) -> &[MaskRounds] {
        &self.steps[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of blocks processed by the longest lane.
    pub fn total_rounds(&self) -> usize {
        self.steps().iter().map(|step| step.rounds).sum()
    }

    /// Expand the plan into single-round steps.
    ///
    /// The expansion drives the kernel one block at a time with the same lane
    /// participation as the grouped plan.
    pub fn per_round(&self) -> impl Iterator<Item = MaskRounds> + '_ {
        self.steps().iter().flat_map(|step| {
            (0..step.rounds).map(move |_| MaskRounds {
                mask: step.mask,
                rounds: 1,
            })
        })
    }
}

/// Plan the kernel invocations for `N` lanes holding blocks of `lengths`
/// bytes.
///
/// Every length must be a multiple of [`BLOCK_SIZE`]; a zero length means the
/// lane has no work in this batch and never appears in any mask.
///
/// # Example
/// ```
/// # use md5_lanes::plan::{plan, LaneMask};
/// let plan = plan(&[64, 192, 0, 64]);
/// let steps: Vec<_> = plan.steps().iter().map(|s| (s.mask, s.rounds)).collect();
/// assert_eq!(
///     steps,
///     [(LaneMask::from_bits(0b1011), 1), (LaneMask::from_bits(0b0010), 2)]
/// );
/// ```
pub fn plan<const N: usize>(lengths: &[usize; N]) -> Plan<N> {
    debug_assert!(N <= 32, "lane masks hold at most 32 lanes");
    debug_assert!(
        lengths.iter().all(|len| len % BLOCK_SIZE == 0),
        "block lengths must be multiples of {BLOCK_SIZE}: {lengths:?}"
    );

    let rounds = lengths.map(|len| len / BLOCK_SIZE);

    // Stable, so lanes with equal round counts stay in lane order
    let mut order: [usize; N] = std::array::from_fn(|lane| lane);
    order.sort_by_key(|&lane| rounds[lane]);

    let mut remaining = LaneMask::EMPTY;
    for (lane, &r) in rounds.iter().enumerate() {
        if r > 0 {
            remaining.insert(lane);
        }
    }

    let mut plan = Plan {
        steps: [MaskRounds::default(); N],
        len: 0,
    };
    let mut consumed = 0;
    for lane in order {
        if rounds[lane] > consumed {
            plan.steps[plan.len] = MaskRounds {
                mask: remaining,
                rounds: rounds[lane] - consumed,
            };
            plan.len += 1;
            consumed = rounds[lane];
        }
        remaining.remove(lane);
    }

    plan
}
