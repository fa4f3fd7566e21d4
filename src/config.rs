use std::time::Duration;

use crate::{SessionId, LANES};

const _: () = assert!(LANES.is_power_of_two() && LANES <= 32);

/// Number of bits needed to address a lane.
const LANE_BITS: u32 = LANES.trailing_zeros();

/// Reduction from a session id to the lane slot its blocks occupy.
///
/// The mapping is fixed for the lifetime of a session, so at most [`LANES`]
/// sessions can hold an unflushed block at the same time. Two live sessions
/// sharing a lane are still correct, but every collision forces an early,
/// partially filled batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LaneAssignment {
    /// Low bits of the id. Ideal for the sequential ids handed out by
    /// [`SessionId::next`].
    #[default]
    Modulo,
    /// Fibonacci (multiplicative) hashing of the id, for id streams with
    /// poorly distributed low bits.
    Fibonacci,
}

impl LaneAssignment {
    /// Lane slot used by `id`.
    pub fn lane(self, id: SessionId) -> usize {
        match self {
            LaneAssignment::Modulo => (id.get() % LANES as u64) as usize,
            LaneAssignment::Fibonacci => {
                (id.get().wrapping_mul(0x9e37_79b9_7f4a_7c15) >> (64 - LANE_BITS)) as usize
            }
        }
    }
}

/// How a batch is split into kernel invocations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PlanMode {
    /// One invocation per distinct block length, with lanes retiring as their
    /// data runs out.
    #[default]
    Grouped,
    /// One invocation per 64-byte round.
    PerRound,
}

/// Settings of a [`Md5Server`](crate::Md5Server).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// How long a partially filled batch may wait for more blocks.
    pub idle_flush: Duration,
    pub assignment: LaneAssignment,
    pub plan: PlanMode,
    /// Name of the scheduler thread.
    pub thread_name: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            idle_flush: Duration::from_micros(50),
            assignment: LaneAssignment::default(),
            plan: PlanMode::default(),
            thread_name: "md5-lanes".to_owned(),
        }
    }
}

impl ServerConfig {
    pub fn with_idle_flush(mut self, idle_flush: Duration) -> Self {
        self.idle_flush = idle_flush;
        self
    }

    pub fn with_assignment(mut self, assignment: LaneAssignment) -> Self {
        self.assignment = assignment;
        self
    }

    pub fn with_plan(mut self, plan: PlanMode) -> Self {
        self.plan = plan;
        self
    }

    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }
}
