//! Multiplexes independent streaming MD5 sessions onto a single 8-lane
//! compression kernel.
//!
//! Every [`Md5Session`] talks to one [`Md5Server`], a single-threaded actor
//! that owns [`LANES`] lane slots. Blocks from different sessions are gathered
//! into a batch and advanced together; the batch is flushed when all lanes are
//! occupied, when a new block lands on an occupied lane, or when the engine
//! has been idle for [`ServerConfig::idle_flush`].
//!
//! # Example
//! ```
//! use std::io::Write;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let server = md5_lanes::Md5Server::new()?;
//! let mut session = server.session();
//! session.write_all(b"abc")?;
//! let digest = session.finalize()?;
//! assert_eq!(digest, md5_lanes::baseline::digest(b"abc"));
//! # Ok(())
//! # }
//! ```

pub mod baseline;
mod config;
mod error;
pub mod kernel;
pub mod plan;
mod server;
mod session;
#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
pub mod x86;

pub use config::{LaneAssignment, PlanMode, ServerConfig};
pub use error::Error;
pub use kernel::Kernel;
pub use server::{Md5Server, Stats};
pub use session::{pad_final, Md5Session, SessionId};

/// Number of lanes advanced by a single kernel invocation.
pub const LANES: usize = 8;

/// MD5 compression block size in bytes.
pub const BLOCK_SIZE: usize = 64;

/// MD5 digest size in bytes.
pub const DIGEST_SIZE: usize = 16;

/// Running MD5 state, `[a, b, c, d]`.
pub type State = [u32; 4];

/// MD5 digest in canonical byte order.
pub type Digest = [u8; DIGEST_SIZE];

/// Result of engine operations, failing with [`Error`].
pub type Result<T, E = Error> = std::result::Result<T, E>;
