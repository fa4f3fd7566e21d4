use crate::{
    kernel::{message_index, state_to_digest, Kernel, INITIAL_STATE, K, S},
    plan::LaneMask,
    session::pad_tail,
    Digest, State, BLOCK_SIZE, LANES,
};

/// Portable kernel advancing one lane at a time with scalar MD5.
///
/// Always available, and the reference every other kernel is tested
/// against.
#[derive(Debug, Clone, Copy, Default)]
pub struct Baseline;

impl Kernel for Baseline {
    fn advance(
        &mut self,
        mut states: [State; LANES],
        blocks: [&[u8]; LANES],
        mask: LaneMask,
        rounds: usize,
    ) -> [State; LANES] {
        for lane in mask.lanes().take_while(|&lane| lane < LANES) {
            compress(&mut states[lane], &blocks[lane][..rounds * BLOCK_SIZE]);
        }
        states
    }
}

/// Run the MD5 compression function over `blocks`, a whole number of 64-byte
/// blocks.
pub fn compress(state: &mut State, blocks: &[u8]) {
    debug_assert_eq!(blocks.len() % BLOCK_SIZE, 0);

    for block in blocks.chunks_exact(BLOCK_SIZE) {
        let mut x = [0u32; 16];
        for (word, bytes) in x.iter_mut().zip(block.chunks_exact(4)) {
            *word = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        }

        let [mut a, mut b, mut c, mut d] = *state;
        for i in 0..64 {
            let f = match i / 16 {
                0 => (b & c) | (!b & d),
                1 => (b & d) | (c & !d),
                2 => b ^ c ^ d,
                _ => c ^ (b | !d),
            };
            let t = a
                .wrapping_add(f)
                .wrapping_add(K[i])
                .wrapping_add(x[message_index(i)]);
            a = d;
            d = c;
            c = b;
            b = b.wrapping_add(t.rotate_left(S[i / 16][i % 4]));
        }

        state[0] = state[0].wrapping_add(a);
        state[1] = state[1].wrapping_add(b);
        state[2] = state[2].wrapping_add(c);
        state[3] = state[3].wrapping_add(d);
    }
}

/// Compute the MD5 digest of `input` on the calling thread.
pub fn digest(input: &[u8]) -> Digest {
    let aligned = input.len() - input.len() % BLOCK_SIZE;
    let mut state = INITIAL_STATE;
    compress(&mut state, &input[..aligned]);
    compress(&mut state, &pad_tail(&input[aligned..], input.len() as u64));
    state_to_digest(state)
}
