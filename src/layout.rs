//! Layout of the channel structure stored in shared memory
//!
//! ```text
//! +-------------------+  offset 0
//! | magic             |  written last during setup, cleared first on teardown
//! | layout_hash       |  size/alignment hash of the structure and payloads
//! +-------------------+
//! | SharedMutex<      |
//! |   ChannelFields { |
//! |     state         |
//! |     publisher_active, subscriber_active
//! |     data, result  |
//! |   }>              |
//! +-------------------+
//! | Signals (5 conds) |
//! +-------------------+
//! ```

use crate::error::{ChannelError, Result};
use crate::sync::{SharedCondvar, SharedMutex};
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::warn;

/// Magic number marking a fully initialized channel
pub const CHANNEL_MAGIC: u32 = 0x5244_5653; // "RDVS"

/// Values that may be copied through the channel
///
/// # Safety
/// Implementors must be plain data: no pointers or references, and every
/// value the peer process can write must be a valid value of the type in this
/// process. Both processes must agree on the exact memory layout, so prefer
/// `#[repr(C)]` for user-defined structs.
pub unsafe trait Payload: Copy + Send + 'static {}

macro_rules! impl_payload {
    ($($t:ty),* $(,)?) => {
        $(unsafe impl Payload for $t {})*
    };
}

impl_payload!(
    (), bool, char, u8, u16, u32, u64, u128, usize, i8, i16, i32, i64, i128, isize, f32, f64,
);

unsafe impl<T: Payload, const N: usize> Payload for [T; N] {}

/// Handshake phase of the current round
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Slot free, publisher may write a request
    Init = 0,
    /// Request written, waiting for the subscriber
    Published = 1,
    /// Response written, waiting for the publisher
    Subscribed = 2,
    /// Publisher has taken the response
    GotResult = 3,
}

impl ChannelState {
    /// The only state that may follow `self` within a round
    pub const fn next(self) -> Self {
        match self {
            ChannelState::Init => ChannelState::Published,
            ChannelState::Published => ChannelState::Subscribed,
            ChannelState::Subscribed => ChannelState::GotResult,
            ChannelState::GotResult => ChannelState::Init,
        }
    }
}

/// Fields guarded by the channel lock
#[repr(C)]
pub(crate) struct ChannelFields<D, R> {
    pub state: ChannelState,
    pub publisher_active: bool,
    pub subscriber_active: bool,
    pub data: MaybeUninit<D>,
    pub result: MaybeUninit<R>,
}

impl<D, R> ChannelFields<D, R> {
    /// Move to the next state of the cycle
    #[inline]
    pub fn advance(&mut self) {
        self.state = self.state.next();
    }
}

/// One condition variable per edge a role can block on
#[repr(C)]
pub(crate) struct Signals {
    /// Publisher published a request or announced shutdown; subscriber waits
    pub publisher_ready: SharedCondvar,
    /// Round returned to Init; publisher waits before the next publish
    pub subscriber_ready: SharedCondvar,
    /// Subscriber wrote its response; publisher waits
    pub subscribed: SharedCondvar,
    /// Publisher took the response; subscriber waits
    pub got_result: SharedCondvar,
    /// Subscriber acknowledged shutdown; publisher waits in stop
    pub subscriber_done: SharedCondvar,
}

impl Signals {
    fn all(&self) -> [(&'static str, &SharedCondvar); 5] {
        [
            ("publisher_ready", &self.publisher_ready),
            ("subscriber_ready", &self.subscriber_ready),
            ("subscribed", &self.subscribed),
            ("got_result", &self.got_result),
            ("subscriber_done", &self.subscriber_done),
        ]
    }
}

/// Channel structure as it lives in the mapping
#[repr(C)]
pub(crate) struct SharedChannel<D, R> {
    magic: AtomicU32,
    layout_hash: u32,
    pub fields: SharedMutex<ChannelFields<D, R>>,
    pub signals: Signals,
}

impl<D: Payload, R: Payload> SharedChannel<D, R> {
    /// Bytes needed for the mapping
    pub const SIZE: usize = std::mem::size_of::<Self>();

    /// Initialize the structure in place and mark it ready
    ///
    /// # Safety
    /// `ptr` must point to zeroed, writable memory of at least `SIZE` bytes,
    /// aligned for `Self`, that no other process uses yet.
    pub unsafe fn init(ptr: *mut Self) -> Result<()> {
        std::ptr::addr_of_mut!((*ptr).layout_hash).write(layout_hash::<D, R>());

        SharedMutex::init(
            std::ptr::addr_of_mut!((*ptr).fields),
            ChannelFields {
                state: ChannelState::Init,
                publisher_active: true,
                subscriber_active: true,
                data: MaybeUninit::uninit(),
                result: MaybeUninit::uninit(),
            },
        )?;

        let signals = std::ptr::addr_of_mut!((*ptr).signals);
        let conds = [
            std::ptr::addr_of_mut!((*signals).publisher_ready),
            std::ptr::addr_of_mut!((*signals).subscriber_ready),
            std::ptr::addr_of_mut!((*signals).subscribed),
            std::ptr::addr_of_mut!((*signals).got_result),
            std::ptr::addr_of_mut!((*signals).subscriber_done),
        ];
        let initialized = init_in_order(
            &conds,
            |cond| SharedCondvar::init(cond),
            |cond| {
                let _ = (*cond).destroy();
            },
        );
        if let Err(e) = initialized {
            let _ = (*std::ptr::addr_of!((*ptr).fields)).destroy();
            return Err(e);
        }

        (*ptr).magic.store(CHANNEL_MAGIC, Ordering::Release);
        Ok(())
    }

    /// Check that setup finished and both sides agree on the layout
    pub fn validate(&self) -> Result<()> {
        let magic = self.magic.load(Ordering::Acquire);
        if magic != CHANNEL_MAGIC {
            return Err(ChannelError::InvalidMagic {
                expected: CHANNEL_MAGIC,
                got: magic,
            });
        }

        let expected = layout_hash::<D, R>();
        if self.layout_hash != expected {
            return Err(ChannelError::LayoutMismatch {
                expected,
                got: self.layout_hash,
            });
        }

        Ok(())
    }

    /// Release the lock and all signals, best effort
    ///
    /// Every primitive is destroyed even if an earlier one fails; the first
    /// failure is returned.
    ///
    /// # Safety
    /// No process may use the primitives afterwards.
    pub unsafe fn destroy(&self) -> Result<()> {
        self.magic.store(0, Ordering::Release);

        let mut first = None;
        for (name, cond) in self.signals.all().into_iter().rev() {
            if let Err(e) = cond.destroy() {
                warn!(signal = name, error = %e, "condition variable destroy failed");
                first.get_or_insert(e);
            }
        }
        if let Err(e) = self.fields.destroy() {
            warn!(error = %e, "mutex destroy failed");
            first.get_or_insert(e);
        }

        first.map_or(Ok(()), Err)
    }
}

/// Run `init` on each item in order; if one fails, run `undo` on the items
/// already initialized, newest first, and return that failure
fn init_in_order<P: Copy>(
    items: &[P],
    mut init: impl FnMut(P) -> Result<()>,
    mut undo: impl FnMut(P),
) -> Result<()> {
    for (i, &item) in items.iter().enumerate() {
        if let Err(e) = init(item) {
            items[..i].iter().rev().for_each(|&done| undo(done));
            return Err(e);
        }
    }
    Ok(())
}

/// Layout hash shared by both ends of a channel
///
/// Mixes the size and alignment of the whole structure and of both payload
/// types. Does not detect two different payload types of identical size and
/// alignment.
pub const fn layout_hash<D, R>() -> u32 {
    let whole = struct_hash::<SharedChannel<D, R>>();
    let data = struct_hash::<D>();
    let result = struct_hash::<R>();
    whole ^ data.rotate_left(11) ^ result.rotate_left(22)
}

const fn struct_hash<T>() -> u32 {
    let size = std::mem::size_of::<T>() as u32;
    let align = std::mem::align_of::<T>() as u32;
    size.wrapping_mul(0x9E37_79B9) ^ align.wrapping_mul(0x517C_C1B7)
}
