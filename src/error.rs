use std::io;

use crate::SessionId;

/// Errors reported by the lane scheduler and its sessions.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The session already produced its digest and must be reset before reuse.
    #[error("session {0} already finalized, reset it before writing again")]
    AlreadyFinalized(SessionId),

    /// A submitted block was empty or not a whole number of 64-byte blocks.
    #[error("block of {len} bytes is not a positive multiple of 64")]
    MalformedBlock {
        /// Length of the rejected block.
        len: usize,
    },

    /// The compute kernel modified a lane that was masked off.
    #[error("kernel modified masked-off lane {lane}")]
    KernelFault {
        /// Index of the corrupted lane.
        lane: usize,
    },

    /// The scheduler thread is gone, either after a fault or because it shut down.
    #[error("lane scheduler has stopped")]
    EngineStopped,

    /// The scheduler thread could not be started.
    #[error("failed to spawn lane scheduler: {0}")]
    Spawn(#[source] io::Error),
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        let kind = match err {
            Error::AlreadyFinalized(_) | Error::MalformedBlock { .. } => io::ErrorKind::InvalidInput,
            Error::EngineStopped => io::ErrorKind::BrokenPipe,
            Error::KernelFault { .. } | Error::Spawn(_) => io::ErrorKind::Other,
        };
        io::Error::new(kind, err)
    }
}
