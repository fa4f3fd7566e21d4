use std::{
    fmt, io,
    sync::atomic::{AtomicU64, Ordering},
};

use crate::{Digest, Error, Md5Server, Result, BLOCK_SIZE};

/// Largest aligned chunk forwarded to the scheduler in one submission.
const MAX_SUBMIT_LEN: usize = 1024 * BLOCK_SIZE;

/// Next id to hand out. Zero is reserved for "no session".
static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-wide unique handle of a hash session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(u64);

impl SessionId {
    /// Allocate a fresh id. Ids are never handed out twice within a process.
    pub fn next() -> Self {
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    #[cfg(test)]
    pub(crate) const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Build the final block(s) of a message: the unaligned `tail`, the `0x80`
/// marker, zero fill up to 56 mod 64 and the message length in bits as a
/// little-endian `u64`.
///
/// `total_len` is the length of the whole message in bytes, `tail` its last
/// `total_len % 64` bytes. The result is 64 or 128 bytes long. Any other
/// `tail` length fails with [`Error::MalformedBlock`].
pub fn pad_final(tail: &[u8], total_len: u64) -> Result<Vec<u8>> {
    if tail.len() as u64 != total_len % BLOCK_SIZE as u64 {
        return Err(Error::MalformedBlock { len: tail.len() });
    }
    Ok(pad_tail(tail, total_len))
}

/// [`pad_final`] for a `tail` already known to be shorter than a block.
pub(crate) fn pad_tail(tail: &[u8], total_len: u64) -> Vec<u8> {
    debug_assert!(tail.len() < BLOCK_SIZE);

    let padded_len = if tail.len() < BLOCK_SIZE - 8 {
        BLOCK_SIZE
    } else {
        2 * BLOCK_SIZE
    };
    let mut block = Vec::with_capacity(padded_len);
    block.extend_from_slice(tail);
    block.push(0x80);
    block.resize(padded_len - 8, 0);
    block.extend_from_slice(&total_len.wrapping_mul(8).to_le_bytes());
    block
}

/// A streaming MD5 computation whose compression runs on a shared
/// [`Md5Server`].
///
/// Writes are buffered until a full 64-byte block is available. The session
/// keeps its id for its whole life, including across [`reset`](Self::reset).
pub struct Md5Session {
    id: SessionId,
    server: Md5Server,
    buffer: [u8; BLOCK_SIZE],
    buffered: usize,
    length: u64,
    finalized: bool,
}

impl Md5Session {
    pub(crate) fn new(server: Md5Server) -> Self {
        Self {
            id: SessionId::next(),
            server,
            buffer: [0; BLOCK_SIZE],
            buffered: 0,
            length: 0,
            finalized: false,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Feed `data` into the session.
    pub fn update(&mut self, mut data: &[u8]) -> Result<()> {
        if self.finalized {
            return Err(Error::AlreadyFinalized(self.id));
        }
        self.length = self.length.wrapping_add(data.len() as u64);

        if self.buffered > 0 {
            let n = data.len().min(BLOCK_SIZE - self.buffered);
            self.buffer[self.buffered..self.buffered + n].copy_from_slice(&data[..n]);
            self.buffered += n;
            data = &data[n..];
            if self.buffered == BLOCK_SIZE {
                self.server.submit(self.id, self.buffer.to_vec())?;
                self.buffered = 0;
            }
        }

        let aligned = data.len() - data.len() % BLOCK_SIZE;
        for chunk in data[..aligned].chunks(MAX_SUBMIT_LEN) {
            self.server.submit(self.id, chunk.to_vec())?;
        }

        let tail = &data[aligned..];
        self.buffer[..tail.len()].copy_from_slice(tail);
        self.buffered += tail.len();
        Ok(())
    }

    /// Pad the message and wait for its digest.
    ///
    /// Fails with [`Error::AlreadyFinalized`] on a second call; the session
    /// must be [`reset`](Self::reset) before it can hash again.
    pub fn finalize(&mut self) -> Result<Digest> {
        if self.finalized {
            return Err(Error::AlreadyFinalized(self.id));
        }
        let last = pad_tail(&self.buffer[..self.buffered], self.length);
        self.buffered = 0;
        let digest = self.server.finalize(self.id, last)?;
        self.finalized = true;
        Ok(digest)
    }

    /// Discard all input and any interim state held by the scheduler.
    pub fn reset(&mut self) {
        self.server.reset(self.id);
        self.buffered = 0;
        self.length = 0;
        self.finalized = false;
    }
}

impl fmt::Debug for Md5Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Md5Session")
            .field("id", &self.id)
            .field("length", &self.length)
            .field("finalized", &self.finalized)
            .finish_non_exhaustive()
    }
}

impl io::Write for Md5Session {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.update(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for Md5Session {
    fn drop(&mut self) {
        self.server.reset(self.id);
    }
}
