use std::is_x86_feature_detected;

use super::use_intrinsic;
use crate::{kernel::Kernel, plan::LaneMask, State, BLOCK_SIZE, LANES};

/// Kernel advancing all 8 lanes at once in 256-bit AVX2 registers.
///
/// The lanes are transposed so that each register holds one MD5 state word
/// (or one message word) of every lane. Lanes outside the mask run through
/// the rounds on zero input and are blended back to their previous state at
/// the end of every 64-byte round.
#[derive(Debug, Clone, Copy)]
pub struct Avx2 {
    _detected: (),
}

impl Avx2 {
    /// Returns the kernel if the running CPU supports AVX and AVX2.
    pub fn new() -> Option<Self> {
        if is_x86_feature_detected!("avx") && is_x86_feature_detected!("avx2") {
            Some(Self { _detected: () })
        } else {
            None
        }
    }
}

impl Kernel for Avx2 {
    fn advance(
        &mut self,
        states: [State; LANES],
        blocks: [&[u8]; LANES],
        mask: LaneMask,
        rounds: usize,
    ) -> [State; LANES] {
        // SAFETY: `Avx2` can only be constructed after detecting AVX and AVX2
        unsafe { advance_simd(states, blocks, mask, rounds) }
    }
}

/// Read little-endian message word `word` of every lane at byte `offset`.
/// Lanes outside `mask` read zero.
fn gather_word(blocks: &[&[u8]; LANES], mask: LaneMask, offset: usize, word: usize) -> [u32; LANES] {
    std::array::from_fn(|lane| {
        if mask.contains(lane) {
            let p = offset + 4 * word;
            let b = &blocks[lane][p..p + 4];
            u32::from_le_bytes([b[0], b[1], b[2], b[3]])
        } else {
            0
        }
    })
}

/// SIMD implementation of the MD5 compression function over 8 lanes.
#[target_feature(enable = "avx,avx2")]
unsafe fn advance_simd(
    states: [State; LANES],
    blocks: [&[u8]; LANES],
    mask: LaneMask,
    rounds: usize,
) -> [State; LANES] {
    debug_assert!(is_x86_feature_detected!("avx") && is_x86_feature_detected!("avx2"));
    debug_assert!(mask
        .lanes()
        .all(|lane| lane < LANES && blocks[lane].len() >= rounds * BLOCK_SIZE));

    use_intrinsic! {
        __m256i, _mm256_add_epi32, _mm256_and_si256, _mm256_blendv_epi8, _mm256_loadu_si256,
        _mm256_or_si256, _mm256_set1_epi32, _mm256_set1_epi8, _mm256_setzero_si256,
        _mm256_slli_epi32, _mm256_srli_epi32, _mm256_storeu_si256, _mm256_xor_si256,
    }

    // Step helpers over the transposed layout, one 32-bit word per lane.

    /// Rotate every 32-bit lane left by `L`, with `R == 32 - L`.
    unsafe fn rotate_left<const L: i32, const R: i32>(x: __m256i) -> __m256i {
        debug_assert_eq!(L + R, 32);
        let hi = _mm256_slli_epi32(x, L);
        let lo = _mm256_srli_epi32(x, R);
        _mm256_or_si256(hi, lo)
    }

    /// `a = b + ((a + F(b, c, d) + x + t) <<< L)` with `F = (b & c) | (!b & d)`.
    unsafe fn op_f<const L: i32, const R: i32>(
        mut a: __m256i,
        b: __m256i,
        c: __m256i,
        d: __m256i,
        x: __m256i,
        t: u32,
    ) -> __m256i {
        let t = _mm256_set1_epi32(t as i32);
        let mut tmp = _mm256_xor_si256(c, d);
        a = _mm256_add_epi32(a, x);
        tmp = _mm256_and_si256(tmp, b);
        tmp = _mm256_xor_si256(tmp, d);
        a = _mm256_add_epi32(a, t);
        a = _mm256_add_epi32(a, tmp);
        a = rotate_left::<L, R>(a);
        _mm256_add_epi32(a, b)
    }

    /// `a = b + ((a + G(b, c, d) + x + t) <<< L)` with `G = (b & d) | (c & !d)`.
    unsafe fn op_g<const L: i32, const R: i32>(
        mut a: __m256i,
        b: __m256i,
        c: __m256i,
        d: __m256i,
        x: __m256i,
        t: u32,
    ) -> __m256i {
        let t = _mm256_set1_epi32(t as i32);
        let mut tmp1 = _mm256_xor_si256(d, _mm256_set1_epi8(0xFFu8 as i8));
        a = _mm256_add_epi32(a, x);
        let tmp2 = _mm256_and_si256(b, d);
        tmp1 = _mm256_and_si256(tmp1, c);
        tmp1 = _mm256_or_si256(tmp1, tmp2);
        a = _mm256_add_epi32(a, t);
        a = _mm256_add_epi32(a, tmp1);
        a = rotate_left::<L, R>(a);
        _mm256_add_epi32(a, b)
    }

    /// `a = b + ((a + H(b, c, d) + x + t) <<< L)` with `H = b ^ c ^ d`.
    unsafe fn op_h<const L: i32, const R: i32>(
        mut a: __m256i,
        b: __m256i,
        c: __m256i,
        d: __m256i,
        x: __m256i,
        t: u32,
    ) -> __m256i {
        let t = _mm256_set1_epi32(t as i32);
        let mut tmp = _mm256_xor_si256(c, d);
        a = _mm256_add_epi32(a, x);
        tmp = _mm256_xor_si256(tmp, b);
        a = _mm256_add_epi32(a, t);
        a = _mm256_add_epi32(a, tmp);
        a = rotate_left::<L, R>(a);
        _mm256_add_epi32(a, b)
    }

    /// `a = b + ((a + I(b, c, d) + x + t) <<< L)` with `I = c ^ (b | !d)`.
    unsafe fn op_i<const L: i32, const R: i32>(
        mut a: __m256i,
        b: __m256i,
        c: __m256i,
        d: __m256i,
        x: __m256i,
        t: u32,
    ) -> __m256i {
        let t = _mm256_set1_epi32(t as i32);
        let mut tmp = _mm256_xor_si256(d, _mm256_set1_epi8(0xFFu8 as i8));
        a = _mm256_add_epi32(a, x);
        tmp = _mm256_or_si256(tmp, b);
        tmp = _mm256_xor_si256(tmp, c);
        a = _mm256_add_epi32(a, t);
        a = _mm256_add_epi32(a, tmp);
        a = rotate_left::<L, R>(a);
        _mm256_add_epi32(a, b)
    }

    unsafe fn load(words: [u32; 8]) -> __m256i {
        _mm256_loadu_si256(words.as_ptr().cast())
    }

    let mut a = load(states.map(|s| s[0]));
    let mut b = load(states.map(|s| s[1]));
    let mut c = load(states.map(|s| s[2]));
    let mut d = load(states.map(|s| s[3]));

    // All ones in every active lane, selecting the freshly computed state
    let active = load(std::array::from_fn(|lane| {
        if mask.contains(lane) {
            u32::MAX
        } else {
            0
        }
    }));

    for round in 0..rounds {
        let offset = round * BLOCK_SIZE;
        let mut x = [_mm256_setzero_si256(); 16];
        for (word, v) in x.iter_mut().enumerate() {
            *v = load(gather_word(&blocks, mask, offset, word));
        }

        let (a0, b0, c0, d0) = (a, b, c, d);

        // round 1
        a = op_f::<7, 25>(a, b, c, d, x[0], 0xd76aa478);
        d = op_f::<12, 20>(d, a, b, c, x[1], 0xe8c7b756);
        c = op_f::<17, 15>(c, d, a, b, x[2], 0x242070db);
        b = op_f::<22, 10>(b, c, d, a, x[3], 0xc1bdceee);

        a = op_f::<7, 25>(a, b, c, d, x[4], 0xf57c0faf);
        d = op_f::<12, 20>(d, a, b, c, x[5], 0x4787c62a);
        c = op_f::<17, 15>(c, d, a, b, x[6], 0xa8304613);
        b = op_f::<22, 10>(b, c, d, a, x[7], 0xfd469501);

        a = op_f::<7, 25>(a, b, c, d, x[8], 0x698098d8);
        d = op_f::<12, 20>(d, a, b, c, x[9], 0x8b44f7af);
        c = op_f::<17, 15>(c, d, a, b, x[10], 0xffff5bb1);
        b = op_f::<22, 10>(b, c, d, a, x[11], 0x895cd7be);

        a = op_f::<7, 25>(a, b, c, d, x[12], 0x6b901122);
        d = op_f::<12, 20>(d, a, b, c, x[13], 0xfd987193);
        c = op_f::<17, 15>(c, d, a, b, x[14], 0xa679438e);
        b = op_f::<22, 10>(b, c, d, a, x[15], 0x49b40821);

        // round 2
        a = op_g::<5, 27>(a, b, c, d, x[1], 0xf61e2562);
        d = op_g::<9, 23>(d, a, b, c, x[6], 0xc040b340);
        c = op_g::<14, 18>(c, d, a, b, x[11], 0x265e5a51);
        b = op_g::<20, 12>(b, c, d, a, x[0], 0xe9b6c7aa);

        a = op_g::<5, 27>(a, b, c, d, x[5], 0xd62f105d);
        d = op_g::<9, 23>(d, a, b, c, x[10], 0x02441453);
        c = op_g::<14, 18>(c, d, a, b, x[15], 0xd8a1e681);
        b = op_g::<20, 12>(b, c, d, a, x[4], 0xe7d3fbc8);

        a = op_g::<5, 27>(a, b, c, d, x[9], 0x21e1cde6);
        d = op_g::<9, 23>(d, a, b, c, x[14], 0xc33707d6);
        c = op_g::<14, 18>(c, d, a, b, x[3], 0xf4d50d87);
        b = op_g::<20, 12>(b, c, d, a, x[8], 0x455a14ed);

        a = op_g::<5, 27>(a, b, c, d, x[13], 0xa9e3e905);
        d = op_g::<9, 23>(d, a, b, c, x[2], 0xfcefa3f8);
        c = op_g::<14, 18>(c, d, a, b, x[7], 0x676f02d9);
        b = op_g::<20, 12>(b, c, d, a, x[12], 0x8d2a4c8a);

        // round 3
        a = op_h::<4, 28>(a, b, c, d, x[5], 0xfffa3942);
        d = op_h::<11, 21>(d, a, b, c, x[8], 0x8771f681);
        c = op_h::<16, 16>(c, d, a, b, x[11], 0x6d9d6122);
        b = op_h::<23, 9>(b, c, d, a, x[14], 0xfde5380c);

        a = op_h::<4, 28>(a, b, c, d, x[1], 0xa4beea44);
        d = op_h::<11, 21>(d, a, b, c, x[4], 0x4bdecfa9);
        c = op_h::<16, 16>(c, d, a, b, x[7], 0xf6bb4b60);
        b = op_h::<23, 9>(b, c, d, a, x[10], 0xbebfbc70);

        a = op_h::<4, 28>(a, b, c, d, x[13], 0x289b7ec6);
        d = op_h::<11, 21>(d, a, b, c, x[0], 0xeaa127fa);
        c = op_h::<16, 16>(c, d, a, b, x[3], 0xd4ef3085);
        b = op_h::<23, 9>(b, c, d, a, x[6], 0x04881d05);

        a = op_h::<4, 28>(a, b, c, d, x[9], 0xd9d4d039);
        d = op_h::<11, 21>(d, a, b, c, x[12], 0xe6db99e5);
        c = op_h::<16, 16>(c, d, a, b, x[15], 0x1fa27cf8);
        b = op_h::<23, 9>(b, c, d, a, x[2], 0xc4ac5665);

        // round 4
        a = op_i::<6, 26>(a, b, c, d, x[0], 0xf4292244);
        d = op_i::<10, 22>(d, a, b, c, x[7], 0x432aff97);
        c = op_i::<15, 17>(c, d, a, b, x[14], 0xab9423a7);
        b = op_i::<21, 11>(b, c, d, a, x[5], 0xfc93a039);

        a = op_i::<6, 26>(a, b, c, d, x[12], 0x655b59c3);
        d = op_i::<10, 22>(d, a, b, c, x[3], 0x8f0ccc92);
        c = op_i::<15, 17>(c, d, a, b, x[10], 0xffeff47d);
        b = op_i::<21, 11>(b, c, d, a, x[1], 0x85845dd1);

        a = op_i::<6, 26>(a, b, c, d, x[8], 0x6fa87e4f);
        d = op_i::<10, 22>(d, a, b, c, x[15], 0xfe2ce6e0);
        c = op_i::<15, 17>(c, d, a, b, x[6], 0xa3014314);
        b = op_i::<21, 11>(b, c, d, a, x[13], 0x4e0811a1);

        a = op_i::<6, 26>(a, b, c, d, x[4], 0xf7537e82);
        d = op_i::<10, 22>(d, a, b, c, x[11], 0xbd3af235);
        c = op_i::<15, 17>(c, d, a, b, x[2], 0x2ad7d2bb);
        b = op_i::<21, 11>(b, c, d, a, x[9], 0xeb86d391);

        a = _mm256_blendv_epi8(a0, _mm256_add_epi32(a, a0), active);
        b = _mm256_blendv_epi8(b0, _mm256_add_epi32(b, b0), active);
        c = _mm256_blendv_epi8(c0, _mm256_add_epi32(c, c0), active);
        d = _mm256_blendv_epi8(d0, _mm256_add_epi32(d, d0), active);
    }

    let mut state0: [u32; 8] = [0; 8];
    let mut state1: [u32; 8] = [0; 8];
    let mut state2: [u32; 8] = [0; 8];
    let mut state3: [u32; 8] = [0; 8];

    _mm256_storeu_si256(state0.as_mut_ptr().cast(), a);
    _mm256_storeu_si256(state1.as_mut_ptr().cast(), b);
    _mm256_storeu_si256(state2.as_mut_ptr().cast(), c);
    _mm256_storeu_si256(state3.as_mut_ptr().cast(), d);

    std::array::from_fn(|lane| [state0[lane], state1[lane], state2[lane], state3[lane]])
}
