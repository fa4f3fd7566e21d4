//! End-to-end behaviour of the lane scheduler and its sessions.

use std::{
    io::Write,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Barrier,
    },
    thread,
    time::{Duration, Instant},
};

use md5::{Digest as _, Md5};
use md5_lanes::{
    baseline::Baseline, pad_final, plan::LaneMask, Error, Kernel, LaneAssignment, Md5Server,
    Md5Session, PlanMode, ServerConfig, SessionId, State, BLOCK_SIZE, LANES,
};
use proptest::prelude::*;
use rand::{rngs::SmallRng, Rng, SeedableRng};

fn reference(input: &[u8]) -> [u8; 16] {
    Md5::digest(input).into()
}

/// Sessions occupying pairwise distinct lanes.
fn sessions_on_distinct_lanes(server: &Md5Server, config: &ServerConfig) -> Vec<Md5Session> {
    let mut by_lane: Vec<Option<Md5Session>> = (0..LANES).map(|_| None).collect();
    while by_lane.iter().any(Option::is_none) {
        let session = server.session();
        let lane = config.assignment.lane(session.id());
        if by_lane[lane].is_none() {
            by_lane[lane] = Some(session);
        }
    }
    by_lane.into_iter().flatten().collect()
}

#[test]
fn abc() {
    let server = Md5Server::new().unwrap();
    let mut session = server.session();
    session.write_all(b"abc").unwrap();
    assert_eq!(
        hex::encode(session.finalize().unwrap()),
        "900150983cd24fb0d6963f7d28e17f72"
    );
}

#[test]
fn abc_through_raw_blocks() {
    let server = Md5Server::new().unwrap();
    let digest = server
        .finalize(SessionId::next(), pad_final(b"abc", 3).unwrap())
        .unwrap();
    assert_eq!(hex::encode(digest), "900150983cd24fb0d6963f7d28e17f72");
}

#[test]
fn eight_empty_sessions_share_one_batch() {
    // Only a full batch can flush before the timer fires
    let config = ServerConfig::default().with_idle_flush(Duration::from_secs(3600));
    let server = Md5Server::with_config(config.clone()).unwrap();
    let sessions = sessions_on_distinct_lanes(&server, &config);
    let barrier = Arc::new(Barrier::new(LANES));

    let handles: Vec<_> = sessions
        .into_iter()
        .map(|mut session| {
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                session.finalize().unwrap()
            })
        })
        .collect();

    for handle in handles {
        assert_eq!(
            hex::encode(handle.join().unwrap()),
            "d41d8cd98f00b204e9800998ecf8427e"
        );
    }

    let stats = server.stats().unwrap();
    assert_eq!(stats.batches, 1);
    assert_eq!(stats.full_flushes, 1);
    assert_eq!(stats.kernel_calls, 1);
    assert_eq!(stats.live_sessions, 0);
}

#[test]
fn lone_session_is_flushed_by_the_timer() {
    let idle_flush = Duration::from_millis(5);
    let server =
        Md5Server::with_config(ServerConfig::default().with_idle_flush(idle_flush)).unwrap();

    let started = Instant::now();
    let digest = server.digest(&[0x42; 100]).unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(digest, reference(&[0x42; 100]));

    let stats = server.stats().unwrap();
    assert!(stats.idle_flushes >= 1);
    assert_eq!(stats.full_flushes, 0);
}

#[test]
fn idle_flush_is_not_postponed_by_unrelated_requests() {
    let idle_flush = Duration::from_millis(50);
    let server =
        Md5Server::with_config(ServerConfig::default().with_idle_flush(idle_flush)).unwrap();
    let stop = AtomicBool::new(false);

    let (digest, latency) = thread::scope(|scope| {
        scope.spawn(|| {
            let started = Instant::now();
            while !stop.load(Ordering::Relaxed) && started.elapsed() < Duration::from_secs(2) {
                server.reset(SessionId::next());
                thread::sleep(Duration::from_millis(1));
            }
        });

        let started = Instant::now();
        let digest = server.digest(b"abc");
        let latency = started.elapsed();
        stop.store(true, Ordering::Relaxed);
        (digest, latency)
    });

    assert_eq!(digest.unwrap(), reference(b"abc"));
    assert!(
        latency < 10 * idle_flush,
        "lone finalize took {latency:?} with an idle flush of {idle_flush:?}"
    );
}

#[test]
fn concurrent_and_sequential_digests_agree() {
    let mut rng = SmallRng::seed_from_u64(0xba7c4);
    let inputs: Vec<Vec<u8>> = (0..3 * LANES)
        .map(|i| {
            let mut v = vec![0u8; rng.gen_range(0..2000) + i];
            rng.fill(v.as_mut_slice());
            v
        })
        .collect();

    let server = Md5Server::new().unwrap();
    let sequential: Vec<_> = inputs
        .iter()
        .map(|input| server.digest(input).unwrap())
        .collect();

    let concurrent: Vec<_> = thread::scope(|scope| {
        let handles: Vec<_> = inputs
            .iter()
            .enumerate()
            .map(|(i, input)| {
                let server = &server;
                scope.spawn(move || {
                    let mut session = server.session();
                    for chunk in input.chunks(17 + 13 * i) {
                        session.update(chunk).unwrap();
                    }
                    session.finalize().unwrap()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(concurrent, sequential);
    for (input, digest) in inputs.iter().zip(&sequential) {
        assert_eq!(*digest, reference(input));
    }
}

#[test]
fn plan_modes_and_assignments_agree() {
    let inputs: Vec<Vec<u8>> = (0..LANES)
        .map(|lane| vec![lane as u8; lane * 300 + 5])
        .collect();

    for plan in [PlanMode::Grouped, PlanMode::PerRound] {
        for assignment in [LaneAssignment::Modulo, LaneAssignment::Fibonacci] {
            let server = Md5Server::with_config(
                ServerConfig::default()
                    .with_plan(plan)
                    .with_assignment(assignment),
            )
            .unwrap();
            let digests: Vec<_> = thread::scope(|scope| {
                let handles: Vec<_> = inputs
                    .iter()
                    .map(|input| {
                        let server = &server;
                        scope.spawn(move || server.digest(input).unwrap())
                    })
                    .collect();
                handles.into_iter().map(|h| h.join().unwrap()).collect()
            });
            for (input, digest) in inputs.iter().zip(digests) {
                assert_eq!(digest, reference(input), "{plan:?} {assignment:?}");
            }
        }
    }
}

#[test]
fn reset_is_idempotent_and_isolated() {
    let server = Md5Server::new().unwrap();
    let mut other = server.session();
    other.update(&[7; 3 * BLOCK_SIZE]).unwrap();

    let unknown = SessionId::next();
    server.reset(unknown);
    server.reset(unknown);

    let mut session = server.session();
    session.reset();
    session.reset();
    session.update(b"discarded input").unwrap();
    session.update(&[1; 2 * BLOCK_SIZE]).unwrap();
    session.reset();
    session.update(b"abc").unwrap();
    assert_eq!(
        hex::encode(session.finalize().unwrap()),
        "900150983cd24fb0d6963f7d28e17f72"
    );

    other.update(b"tail").unwrap();
    let mut expected = vec![7; 3 * BLOCK_SIZE];
    expected.extend_from_slice(b"tail");
    assert_eq!(other.finalize().unwrap(), reference(&expected));
}

#[test]
fn reset_evicts_interim_state() {
    let server = Md5Server::new().unwrap();
    let mut session = server.session();
    session.update(&[9; BLOCK_SIZE]).unwrap();

    // Wait for the idle flush to move the block into the state table
    let deadline = Instant::now() + Duration::from_secs(5);
    while server.stats().unwrap().live_sessions == 0 {
        assert!(Instant::now() < deadline, "block was never flushed");
        thread::sleep(Duration::from_millis(1));
    }

    session.reset();
    let stats = server.stats().unwrap();
    assert_eq!(stats.live_sessions, 0);
    assert_eq!(stats.pending, 0);
}

#[test]
fn dropping_a_session_evicts_its_state() {
    let server = Md5Server::new().unwrap();
    {
        let mut session = server.session();
        session.update(&[3; 4 * BLOCK_SIZE]).unwrap();
    }
    let stats = server.stats().unwrap();
    assert_eq!(stats.live_sessions, 0);
    assert_eq!(stats.pending, 0);
}

#[test]
fn finalize_twice_fails() {
    let server = Md5Server::new().unwrap();
    let mut session = server.session();
    session.update(b"once").unwrap();
    let digest = session.finalize().unwrap();
    assert_eq!(digest, reference(b"once"));
    let batches = server.stats().unwrap().batches;

    assert!(matches!(session.finalize(), Err(Error::AlreadyFinalized(id)) if id == session.id()));
    assert!(matches!(
        session.update(b"more"),
        Err(Error::AlreadyFinalized(_))
    ));
    let err = session.write(b"more").unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);
    assert_eq!(server.stats().unwrap().batches, batches);

    // A reset session can be reused
    session.reset();
    session.update(b"twice").unwrap();
    assert_eq!(session.finalize().unwrap(), reference(b"twice"));
}

#[test]
fn raw_finalize_of_a_finished_id_fails_until_reset() {
    let server = Md5Server::new().unwrap();
    let id = SessionId::next();

    let digest = server.finalize(id, pad_final(b"abc", 3).unwrap()).unwrap();
    assert_eq!(digest, reference(b"abc"));
    assert!(matches!(
        server.finalize(id, pad_final(b"abc", 3).unwrap()),
        Err(Error::AlreadyFinalized(rejected)) if rejected == id
    ));
    // Discarded, so it does not leak into the hash after the reset
    server.submit(id, vec![0xff; BLOCK_SIZE]).unwrap();

    server.reset(id);
    let digest = server.finalize(id, pad_final(b"", 0).unwrap()).unwrap();
    assert_eq!(digest, reference(b""));
}

/// Corrupts the first lane outside the mask.
struct Meddling;

impl Kernel for Meddling {
    fn advance(
        &mut self,
        states: [State; LANES],
        blocks: [&[u8]; LANES],
        mask: LaneMask,
        rounds: usize,
    ) -> [State; LANES] {
        let mut next = Baseline.advance(states, blocks, mask, rounds);
        if let Some(lane) = (0..LANES).find(|&lane| !mask.contains(lane)) {
            next[lane][0] ^= 1;
        }
        next
    }
}

#[test]
fn kernel_fault_stops_the_engine() {
    let server = Md5Server::with_kernel(ServerConfig::default(), Meddling).unwrap();
    let id = SessionId::next();

    assert!(matches!(
        server.finalize(id, pad_final(b"abc", 3).unwrap()),
        Err(Error::EngineStopped)
    ));
    assert!(matches!(
        server.submit(SessionId::next(), vec![0; BLOCK_SIZE]),
        Err(Error::EngineStopped)
    ));
    assert!(matches!(server.stats(), Err(Error::EngineStopped)));

    let mut session = server.session();
    assert!(matches!(
        session.update(&[0; BLOCK_SIZE]),
        Err(Error::EngineStopped)
    ));
    // Resetting against a stopped engine is a no-op
    session.reset();
    server.reset(id);
}

#[test]
fn malformed_blocks_are_rejected() {
    let server = Md5Server::new().unwrap();
    let id = SessionId::next();
    assert!(matches!(
        server.submit(id, vec![0; 65]),
        Err(Error::MalformedBlock { len: 65 })
    ));
    assert!(matches!(
        server.submit(id, Vec::new()),
        Err(Error::MalformedBlock { len: 0 })
    ));
    assert!(matches!(
        server.finalize(id, vec![0; 10]),
        Err(Error::MalformedBlock { len: 10 })
    ));
}

#[test]
fn large_writes_are_split() {
    let mut rng = SmallRng::seed_from_u64(5);
    let mut input = vec![0u8; 300_000];
    rng.fill(input.as_mut_slice());

    let server = Md5Server::new().unwrap();
    assert_eq!(server.digest(&input).unwrap(), reference(&input));
}

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
#[test]
fn avx2_engine_matches_reference() {
    let Some(kernel) = md5_lanes::x86::Avx2::new() else {
        eprintln!("AVX2 not available, skipping test");
        return;
    };
    let server = Md5Server::with_kernel(ServerConfig::default(), kernel).unwrap();

    let inputs: Vec<Vec<u8>> = (0..2 * LANES)
        .map(|i| (0..i * 97).map(|j| (j ^ i) as u8).collect())
        .collect();
    let digests: Vec<_> = thread::scope(|scope| {
        let handles: Vec<_> = inputs
            .iter()
            .map(|input| {
                let server = &server;
                scope.spawn(move || server.digest(input).unwrap())
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });
    for (input, digest) in inputs.iter().zip(digests) {
        assert_eq!(digest, reference(input));
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn arbitrary_writes_match_reference(
        input in prop::collection::vec(any::<u8>(), 0..1024),
        cuts in prop::collection::vec(1usize..200, 1..16),
    ) {
        let server = Md5Server::new().unwrap();
        let mut session = server.session();
        let mut rest = input.as_slice();
        for &cut in cuts.iter().cycle() {
            if rest.is_empty() {
                break;
            }
            let (head, tail) = rest.split_at(cut.min(rest.len()));
            session.update(head).unwrap();
            rest = tail;
        }
        prop_assert_eq!(session.finalize().unwrap(), reference(&input));
    }

    #[test]
    fn aligned_submissions_match_reference(
        blocks in prop::collection::vec(1usize..5, 0..8),
        tail_len in 0usize..BLOCK_SIZE,
        seed in any::<u64>(),
    ) {
        let mut rng = SmallRng::seed_from_u64(seed);
        let server = Md5Server::new().unwrap();
        let id = SessionId::next();

        let mut message = Vec::new();
        for rounds in blocks {
            let mut block = vec![0u8; rounds * BLOCK_SIZE];
            rng.fill(block.as_mut_slice());
            server.submit(id, block.clone()).unwrap();
            message.extend(block);
        }
        let mut tail = vec![0u8; tail_len];
        rng.fill(tail.as_mut_slice());
        message.extend_from_slice(&tail);

        let digest = server.finalize(id, pad_final(&tail, message.len() as u64).unwrap()).unwrap();
        prop_assert_eq!(digest, reference(&message));
    }
}
