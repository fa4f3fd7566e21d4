//! The lane scheduler: a single-threaded actor that gathers blocks from many
//! sessions into batches for a [`Kernel`].
//!
//! All lane slots and interim states live on the scheduler thread. Sessions
//! only talk to it through a rendezvous channel, so a producer blocks while a
//! batch is running and resumes as soon as the scheduler takes its block.

use std::{
    collections::{HashMap, HashSet},
    fmt, thread,
    time::Instant,
};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, error, trace};

use crate::{
    baseline::Baseline,
    kernel::{state_to_digest, Kernel, INITIAL_STATE},
    plan::{plan, LaneMask, MaskRounds},
    Digest, Error, Md5Session, PlanMode, Result, ServerConfig, SessionId, State, BLOCK_SIZE,
    LANES,
};

/// Counters describing the scheduler's activity, as seen by the scheduler
/// thread when the request was served.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    /// Batches executed.
    pub batches: u64,
    /// Batches triggered by all lanes being occupied.
    pub full_flushes: u64,
    /// Batches triggered by a block landing on an occupied lane.
    pub collision_flushes: u64,
    /// Batches triggered by the idle timer.
    pub idle_flushes: u64,
    /// Kernel invocations across all batches.
    pub kernel_calls: u64,
    /// 64-byte rounds driven through the kernel.
    pub rounds: u64,
    /// Sessions holding an interim state.
    pub live_sessions: usize,
    /// Occupied lane slots.
    pub pending: usize,
}

enum Request {
    Block {
        id: SessionId,
        block: Vec<u8>,
        reply: Option<Sender<Result<Digest>>>,
    },
    Reset(SessionId),
    Stats(Sender<Stats>),
}

/// Handle to a running lane scheduler.
///
/// Handles are cheap to clone. The scheduler thread exits once every handle,
/// including those held by sessions, is dropped.
#[derive(Clone)]
pub struct Md5Server {
    inbox: Sender<Request>,
}

impl Md5Server {
    /// Start a scheduler with the default configuration and the portable
    /// [`Baseline`] kernel.
    pub fn new() -> Result<Self> {
        Self::with_config(ServerConfig::default())
    }

    pub fn with_config(config: ServerConfig) -> Result<Self> {
        Self::with_kernel(config, Baseline)
    }

    /// Start a scheduler driving `kernel`.
    pub fn with_kernel<K: Kernel>(config: ServerConfig, kernel: K) -> Result<Self> {
        let (inbox, requests) = bounded(0);
        let scheduler = Scheduler::new(config.clone(), kernel);
        thread::Builder::new()
            .name(config.thread_name)
            .spawn(move || {
                if let Err(err) = scheduler.run(requests) {
                    error!(%err, "lane scheduler stopped");
                }
            })
            .map_err(Error::Spawn)?;
        Ok(Self { inbox })
    }

    /// Open a new hash session on this scheduler.
    pub fn session(&self) -> Md5Session {
        Md5Session::new(self.clone())
    }

    /// Compute the digest of `input` through a fresh session.
    pub fn digest(&self, input: &[u8]) -> Result<Digest> {
        let mut session = self.session();
        session.update(input)?;
        session.finalize()
    }

    /// Queue `block` as the next input of session `id`.
    ///
    /// Returns once the scheduler has taken the block, not when it has been
    /// hashed. Blocks for an id that was already finalized and not [`reset`]
    /// since are discarded.
    ///
    /// [`reset`]: Self::reset
    pub fn submit(&self, id: SessionId, block: Vec<u8>) -> Result<()> {
        check_block(&block)?;
        self.send(Request::Block {
            id,
            block,
            reply: None,
        })
    }

    /// Queue the final, already padded, `block` of session `id` and wait for
    /// the digest.
    ///
    /// The scheduler remembers `id` as finalized until it is [`reset`], and
    /// fails any further finalize of it with [`Error::AlreadyFinalized`].
    ///
    /// [`reset`]: Self::reset
    pub fn finalize(&self, id: SessionId, block: Vec<u8>) -> Result<Digest> {
        check_block(&block)?;
        let (reply, digest) = bounded(1);
        self.send(Request::Block {
            id,
            block,
            reply: Some(reply),
        })?;
        digest.recv().map_err(|_| Error::EngineStopped)?
    }

    /// Drop any pending block and interim state of session `id`, and make
    /// the id usable again after a finalize.
    ///
    /// Unknown ids are ignored.
    pub fn reset(&self, id: SessionId) {
        if self.send(Request::Reset(id)).is_err() {
            debug!(%id, "reset after lane scheduler stopped");
        }
    }

    pub fn stats(&self) -> Result<Stats> {
        let (reply, stats) = bounded(1);
        self.send(Request::Stats(reply))?;
        stats.recv().map_err(|_| Error::EngineStopped)
    }

    fn send(&self, request: Request) -> Result<()> {
        self.inbox.send(request).map_err(|_| Error::EngineStopped)
    }
}

impl fmt::Debug for Md5Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Md5Server").finish_non_exhaustive()
    }
}

fn check_block(block: &[u8]) -> Result<()> {
    if block.is_empty() || block.len() % BLOCK_SIZE != 0 {
        return Err(Error::MalformedBlock { len: block.len() });
    }
    Ok(())
}

/// Why a batch was executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flush {
    Collision,
    Full,
    Idle,
}

impl fmt::Display for Flush {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Flush::Collision => "collision",
            Flush::Full => "full",
            Flush::Idle => "idle",
        })
    }
}

/// A block waiting in a lane slot.
struct Lane {
    id: SessionId,
    block: Vec<u8>,
    reply: Option<Sender<Result<Digest>>>,
}

struct Scheduler<K> {
    config: ServerConfig,
    kernel: K,
    lanes: [Option<Lane>; LANES],
    pending: usize,
    /// Interim state per session. Absent means the session starts from
    /// [`INITIAL_STATE`].
    states: HashMap<SessionId, State>,
    /// Sessions whose final block was accepted and that were not reset since.
    finished: HashSet<SessionId>,
    /// When the oldest pending block forces an idle flush.
    deadline: Option<Instant>,
    stats: Stats,
}

impl<K: Kernel> Scheduler<K> {
    fn new(config: ServerConfig, kernel: K) -> Self {
        Self {
            config,
            kernel,
            lanes: Default::default(),
            pending: 0,
            states: HashMap::new(),
            finished: HashSet::new(),
            deadline: None,
            stats: Stats::default(),
        }
    }

    fn run(mut self, requests: Receiver<Request>) -> Result<()> {
        debug!(
            idle_flush = ?self.config.idle_flush,
            assignment = ?self.config.assignment,
            plan = ?self.config.plan,
            "lane scheduler started"
        );

        loop {
            let request = match self.deadline {
                None => match requests.recv() {
                    Ok(request) => request,
                    Err(_) => break,
                },
                Some(deadline) => match requests.recv_deadline(deadline) {
                    Ok(request) => request,
                    Err(RecvTimeoutError::Timeout) => {
                        self.flush(Flush::Idle)?;
                        continue;
                    }
                    Err(RecvTimeoutError::Disconnected) => break,
                },
            };
            self.handle(request)?;

            // A steady stream of requests must not hold back an expired batch
            if self.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                self.flush(Flush::Idle)?;
            }
        }

        debug!(
            pending = self.pending,
            live_sessions = self.states.len(),
            "lane scheduler shutting down"
        );
        Ok(())
    }

    fn handle(&mut self, request: Request) -> Result<()> {
        match request {
            Request::Block { id, block, reply } => self.accept(id, block, reply),
            Request::Reset(id) => {
                self.reset(id);
                Ok(())
            }
            Request::Stats(reply) => {
                let stats = Stats {
                    live_sessions: self.states.len(),
                    pending: self.pending,
                    ..self.stats
                };
                // The caller may have given up waiting
                let _ = reply.send(stats);
                Ok(())
            }
        }
    }

    fn accept(
        &mut self,
        id: SessionId,
        block: Vec<u8>,
        reply: Option<Sender<Result<Digest>>>,
    ) -> Result<()> {
        debug_assert!(!block.is_empty() && block.len() % BLOCK_SIZE == 0);

        if self.finished.contains(&id) {
            debug!(%id, "block for finalized session discarded");
            if let Some(reply) = reply {
                let _ = reply.send(Err(Error::AlreadyFinalized(id)));
            }
            return Ok(());
        }
        if reply.is_some() {
            self.finished.insert(id);
        }

        let index = self.config.assignment.lane(id);
        if self.lanes[index].is_some() {
            self.flush(Flush::Collision)?;
        }

        self.lanes[index] = Some(Lane { id, block, reply });
        self.pending += 1;
        if self.pending == 1 {
            self.deadline = Some(Instant::now() + self.config.idle_flush);
        }
        if self.pending == LANES {
            self.flush(Flush::Full)?;
        }
        Ok(())
    }

    fn reset(&mut self, id: SessionId) {
        for slot in self.lanes.iter_mut() {
            if slot.as_ref().is_some_and(|lane| lane.id == id) {
                *slot = None;
                self.pending -= 1;
            }
        }
        if self.pending == 0 {
            self.deadline = None;
        }
        self.finished.remove(&id);
        if self.states.remove(&id).is_some() {
            debug!(%id, "session reset");
        }
    }

    /// Run one batch over every occupied lane and publish the results.
    fn flush(&mut self, reason: Flush) -> Result<()> {
        let mut states = [INITIAL_STATE; LANES];
        let mut lengths = [0; LANES];
        for (index, slot) in self.lanes.iter().enumerate() {
            if let Some(lane) = slot {
                if let Some(state) = self.states.get(&lane.id) {
                    states[index] = *state;
                }
                lengths[index] = lane.block.len();
            }
        }

        let plan = plan(&lengths);
        let steps: Vec<MaskRounds> = match self.config.plan {
            PlanMode::Grouped => plan.steps().to_vec(),
            PlanMode::PerRound => plan.per_round().collect(),
        };

        // Every lane still in a mask has consumed the same number of rounds,
        // so a single cursor covers all of them.
        let empty: &[u8] = &[];
        let mut cursor = 0;
        for step in &steps {
            let end = cursor + step.rounds * BLOCK_SIZE;
            let blocks: [&[u8]; LANES] = std::array::from_fn(|index| {
                match &self.lanes[index] {
                    Some(lane) if step.mask.contains(index) => &lane.block[cursor..end],
                    _ => empty,
                }
            });
            let next = self.kernel.advance(states, blocks, step.mask, step.rounds);
            verify_untouched(&states, &next, step.mask)?;
            states = next;
            cursor = end;
        }

        self.stats.batches += 1;
        self.stats.kernel_calls += steps.len() as u64;
        self.stats.rounds += plan.total_rounds() as u64;
        match reason {
            Flush::Collision => self.stats.collision_flushes += 1,
            Flush::Full => self.stats.full_flushes += 1,
            Flush::Idle => self.stats.idle_flushes += 1,
        }
        trace!(
            %reason,
            lanes = self.pending,
            rounds = plan.total_rounds(),
            kernel_calls = steps.len(),
            "batch"
        );

        for (index, slot) in self.lanes.iter_mut().enumerate() {
            let Some(lane) = slot.take() else {
                continue;
            };
            match lane.reply {
                Some(reply) => {
                    self.states.remove(&lane.id);
                    // A finalizer that stopped waiting only loses its own digest
                    let _ = reply.send(Ok(state_to_digest(states[index])));
                }
                None => {
                    self.states.insert(lane.id, states[index]);
                }
            }
        }
        self.pending = 0;
        self.deadline = None;
        Ok(())
    }
}

/// Check that the kernel left every lane outside `mask` bit-for-bit intact.
fn verify_untouched(
    before: &[State; LANES],
    after: &[State; LANES],
    mask: LaneMask,
) -> Result<()> {
    match (0..LANES).find(|&lane| !mask.contains(lane) && before[lane] != after[lane]) {
        Some(lane) => Err(Error::KernelFault { lane }),
        None => Ok(()),
    }
}
