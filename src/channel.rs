//! Channel handle: one process's mapping of the shared channel structure
//!
//! The publisher side calls [`ChannelHandle::create`], the subscriber side
//! [`ChannelHandle::attach`]. The handle is then passed into
//! [`Publisher::new`](crate::Publisher::new) or
//! [`Subscriber::new`](crate::Subscriber::new).

use crate::error::{ChannelError, Result};
use crate::layout::{ChannelState, Payload, SharedChannel};
use crate::shm::ShmRegion;
use std::marker::PhantomData;
use std::ptr::NonNull;
use tracing::info;

/// Default permission bits for a new channel object
const DEFAULT_MODE: u32 = 0o600;

/// Channel configuration
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Permission bits of the shared memory object
    pub mode: u32,
    /// Unlink a leftover object of the same name before creating
    pub replace_stale: bool,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            mode: DEFAULT_MODE,
            replace_stale: false,
        }
    }
}

/// Mapped reference to a shared channel carrying `D` requests and `R`
/// responses
///
/// Not `Clone`: one handle, one mapping. The structure it points to stays at
/// a fixed address inside the mapping for as long as the handle lives.
pub struct ChannelHandle<D: Payload, R: Payload> {
    region: ShmRegion,
    shared: NonNull<SharedChannel<D, R>>,
    _marker: PhantomData<(D, R)>,
}

// SAFETY: the shared structure is only touched under its process-shared lock.
unsafe impl<D: Payload, R: Payload> Send for ChannelHandle<D, R> {}

impl<D: Payload, R: Payload> ChannelHandle<D, R> {
    /// Create and initialize a new channel as its owner
    pub fn create(name: &str, config: &ChannelConfig) -> Result<Self> {
        let region = ShmRegion::create(
            name,
            SharedChannel::<D, R>::SIZE,
            config.mode,
            config.replace_stale,
        )?;
        let shared = Self::shared_ptr(&region)?;

        // SAFETY: the region is freshly created, zeroed, page aligned and
        // large enough; no one else can have validated it yet.
        if let Err(e) = unsafe { SharedChannel::init(shared.as_ptr()) } {
            let name = region.name().to_string();
            drop(region);
            let _ = ShmRegion::unlink(&name);
            return Err(e);
        }

        info!(name = region.name(), size = region.size(), "channel created");

        Ok(Self {
            region,
            shared,
            _marker: PhantomData,
        })
    }

    /// Attach to a channel some other process created
    ///
    /// Fails with [`ChannelError::InvalidMagic`] if the creator has not
    /// finished setup yet.
    pub fn attach(name: &str) -> Result<Self> {
        let region = ShmRegion::open(name, SharedChannel::<D, R>::SIZE)?;
        let shared = Self::shared_ptr(&region)?;

        // SAFETY: the mapping is at least SIZE bytes; `validate` only reads
        // atomics and plain integers.
        unsafe { shared.as_ref() }.validate()?;

        info!(name = region.name(), "channel attached");

        Ok(Self {
            region,
            shared,
            _marker: PhantomData,
        })
    }

    fn shared_ptr(region: &ShmRegion) -> Result<NonNull<SharedChannel<D, R>>> {
        let ptr = region.as_ptr().cast::<SharedChannel<D, R>>();
        if (ptr as usize) % std::mem::align_of::<SharedChannel<D, R>>() != 0 {
            return Err(ChannelError::Mmap(std::io::Error::new(
                std::io::ErrorKind::Other,
                "mapping is not aligned for the channel layout",
            )));
        }
        NonNull::new(ptr).ok_or_else(|| {
            ChannelError::Mmap(std::io::Error::new(
                std::io::ErrorKind::Other,
                "region is not mapped",
            ))
        })
    }

    /// OS name of the channel, including the leading '/'
    pub fn name(&self) -> &str {
        self.region.name()
    }

    /// Whether this handle created the channel
    pub fn is_owner(&self) -> bool {
        self.region.is_owner()
    }

    /// Current handshake phase, read under the lock
    pub fn state(&self) -> Result<ChannelState> {
        Ok(self.shared().fields.lock()?.state)
    }

    #[inline]
    pub(crate) fn shared(&self) -> &SharedChannel<D, R> {
        // SAFETY: the mapping outlives `self`; fields are reached only
        // through the shared lock.
        unsafe { self.shared.as_ref() }
    }

    /// Give up the mapping, keeping the region for teardown
    pub(crate) fn into_region(self) -> ShmRegion {
        self.region
    }
}
