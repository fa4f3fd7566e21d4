//! The compute-kernel contract shared by every lane-parallel MD5
//! implementation.

use crate::{plan::LaneMask, Digest, State, DIGEST_SIZE, LANES};

/// MD5 initial chaining values.
pub const INITIAL_STATE: State = [0x67452301, 0xefcdab89, 0x98badcfe, 0x10325476];

/// MD5 additive constants, `floor(abs(sin(i + 1)) * 2^32)`.
pub(crate) const K: [u32; 64] = [
    0xd76aa478, 0xe8c7b756, 0x242070db, 0xc1bdceee, 0xf57c0faf, 0x4787c62a, 0xa8304613, 0xfd469501,
    0x698098d8, 0x8b44f7af, 0xffff5bb1, 0x895cd7be, 0x6b901122, 0xfd987193, 0xa679438e, 0x49b40821,
    0xf61e2562, 0xc040b340, 0x265e5a51, 0xe9b6c7aa, 0xd62f105d, 0x02441453, 0xd8a1e681, 0xe7d3fbc8,
    0x21e1cde6, 0xc33707d6, 0xf4d50d87, 0x455a14ed, 0xa9e3e905, 0xfcefa3f8, 0x676f02d9, 0x8d2a4c8a,
    0xfffa3942, 0x8771f681, 0x6d9d6122, 0xfde5380c, 0xa4beea44, 0x4bdecfa9, 0xf6bb4b60, 0xbebfbc70,
    0x289b7ec6, 0xeaa127fa, 0xd4ef3085, 0x04881d05, 0xd9d4d039, 0xe6db99e5, 0x1fa27cf8, 0xc4ac5665,
    0xf4292244, 0x432aff97, 0xab9423a7, 0xfc93a039, 0x655b59c3, 0x8f0ccc92, 0xffeff47d, 0x85845dd1,
    0x6fa87e4f, 0xfe2ce6e0, 0xa3014314, 0x4e0811a1, 0xf7537e82, 0xbd3af235, 0x2ad7d2bb, 0xeb86d391,
];

/// Left-rotation amounts, one row per MD5 round.
pub(crate) const S: [[u32; 4]; 4] = [[7, 12, 17, 22], [5, 9, 14, 20], [4, 11, 16, 23], [6, 10, 15, 21]];

/// Index of the message word consumed by step `i` of the 64 MD5 steps.
pub(crate) const fn message_index(i: usize) -> usize {
    match i / 16 {
        0 => i,
        1 => (5 * i + 1) % 16,
        2 => (3 * i + 5) % 16,
        _ => (7 * i) % 16,
    }
}

/// A compression primitive advancing [`LANES`] independent MD5 states at
/// once.
pub trait Kernel: Send + 'static {
    /// Advance every lane in `mask` by `rounds` 64-byte blocks.
    ///
    /// For a lane in `mask`, `blocks[lane]` holds exactly `rounds * 64` bytes.
    /// Lanes outside `mask` receive an empty slice and their state must be
    /// returned unchanged.
    fn advance(
        &mut self,
        states: [State; LANES],
        blocks: [&[u8]; LANES],
        mask: LaneMask,
        rounds: usize,
    ) -> [State; LANES];
}

impl<K: Kernel + ?Sized> Kernel for Box<K> {
    fn advance(
        &mut self,
        states: [State; LANES],
        blocks: [&[u8]; LANES],
        mask: LaneMask,
        rounds: usize,
    ) -> [State; LANES] {
        (**self).advance(states, blocks, mask, rounds)
    }
}

/// Serialize a state into the canonical digest byte order: every word
/// little-endian, `a` first.
pub fn state_to_digest(state: State) -> Digest {
    let mut digest = [0; DIGEST_SIZE];
    for (bytes, word) in digest.chunks_exact_mut(4).zip(state) {
        bytes.copy_from_slice(&word.to_le_bytes());
    }
    digest
}
