//! Error types for the engine.

use std::io;
use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for all engine operations.
///
/// Corruption variants are terminal: they are only produced during recovery,
/// and a host that receives one must not serve traffic from the partially
/// loaded state. Plain I/O errors during steady-state appends are transient
/// from the engine's point of view; the caller rejects the request and the
/// store is left untouched.
#[derive(Debug, Error)]
pub enum Error {
    /// Underlying file I/O failed (short write, disk full, fd errors).
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// A record in the append-only log failed framing or CRC verification
    /// during replay. The offset is the byte position where the record began.
    #[error("append-only log corrupt at offset {offset:#x}")]
    LogCorruption {
        /// Byte offset of the first unreadable record.
        offset: u64,
    },

    /// The snapshot footer did not match the checksum computed over the body.
    #[error("snapshot checksum mismatch (computed {computed:#010x}, stored {stored:#010x})")]
    SnapshotCorruption {
        /// CRC computed while replaying the snapshot body.
        computed: u32,
        /// CRC stored in the 4-byte footer.
        stored: u32,
    },

    /// A payload exceeded the 32-bit size field of the log framing.
    #[error("payload of {len} bytes exceeds the log framing limit")]
    PayloadTooLarge {
        /// Length of the rejected payload.
        len: usize,
    },

    /// The log was shut down while an append was waiting for ring space.
    #[error("append-only log is shut down")]
    LogClosed,

    /// Configuration could not be loaded or parsed.
    #[error("configuration error: {0}")]
    Config(Box<figment::Error>),
}
