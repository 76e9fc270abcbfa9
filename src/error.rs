//! Error types for shm_rendezvous

use std::io;
use thiserror::Error;

/// Result type for channel operations
pub type Result<T> = std::result::Result<T, ChannelError>;

/// Errors that can occur while setting up, driving or tearing down a channel
#[derive(Debug, Error)]
pub enum ChannelError {
    /// Shared memory name is unusable
    #[error("Invalid shared memory name '{name}': {reason}")]
    InvalidName { name: String, reason: &'static str },

    /// Shared memory name is too long for the OS namespace
    #[error("Shared memory name too long: max {max} chars, got {got}")]
    NameTooLong { max: usize, got: usize },

    /// Failed to create shared memory
    #[error("Failed to create shared memory '{name}': {source}")]
    ShmCreate {
        name: String,
        #[source]
        source: io::Error,
    },

    /// Failed to open shared memory
    #[error("Failed to open shared memory '{name}': {source}")]
    ShmOpen {
        name: String,
        #[source]
        source: io::Error,
    },

    /// Failed to set shared memory size
    #[error("Failed to set shared memory size: {0}")]
    Truncate(#[source] io::Error),

    /// Failed to map memory
    #[error("Failed to map memory: {0}")]
    Mmap(#[source] io::Error),

    /// Failed to unmap memory
    #[error("Failed to unmap memory: {0}")]
    Munmap(#[source] io::Error),

    /// Failed to unlink shared memory
    #[error("Failed to unlink shared memory '{name}': {source}")]
    ShmUnlink {
        name: String,
        #[source]
        source: io::Error,
    },

    /// Existing object is smaller than the channel layout
    #[error("Shared memory too small: expected at least {expected} bytes, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },

    /// Setup has not completed, or the region is not a channel
    #[error("Invalid channel magic number: expected 0x{expected:08X}, got 0x{got:08X}")]
    InvalidMagic { expected: u32, got: u32 },

    /// Peer was built with different payload types
    #[error("Channel layout mismatch: expected hash 0x{expected:08X}, got 0x{got:08X}")]
    LayoutMismatch { expected: u32, got: u32 },

    /// A pthread call on a shared primitive failed
    #[error("{op} failed: {source}")]
    Sync {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    /// The peer process died while holding the channel lock
    #[error("Peer process died while holding the channel lock")]
    PeerDied,

    /// Publisher was handed a handle it did not create
    #[error("Channel '{name}' was attached, not created; only its creator can publish")]
    NotOwner { name: String },

    /// Publish called before the previous round was collected
    #[error("A round is already in flight; call wait_for_result first")]
    RoundInFlight,

    /// wait_for_result called with nothing published
    #[error("Nothing has been published in this round")]
    NothingPublished,

    /// Publisher has already been stopped
    #[error("Publisher has been stopped")]
    Stopped,
}

impl ChannelError {
    pub(crate) fn sync(op: &'static str, code: i32) -> Self {
        ChannelError::Sync {
            op,
            source: io::Error::from_raw_os_error(code),
        }
    }
}
