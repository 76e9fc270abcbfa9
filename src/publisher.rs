//! Publisher side of the channel
//!
//! The publisher owns the channel: it creates the shared object, drives the
//! rounds, announces shutdown and finally removes the object.

use crate::channel::{ChannelConfig, ChannelHandle};
use crate::error::{ChannelError, Result};
use crate::layout::{ChannelState, Payload};
use crate::shm::ShmRegion;
use tracing::{debug, info, warn};

/// Publisher (request writer) side of the channel
pub struct Publisher<D: Payload, R: Payload> {
    handle: Option<ChannelHandle<D, R>>,
    in_flight: bool,
    stopped: bool,
}

impl<D: Payload, R: Payload> Publisher<D, R> {
    /// Create a channel named `name` and become its publisher
    pub fn create(name: &str, config: &ChannelConfig) -> Result<Self> {
        Self::new(ChannelHandle::create(name, config)?)
    }

    /// Wrap a handle obtained from [`ChannelHandle::create`]
    pub fn new(handle: ChannelHandle<D, R>) -> Result<Self> {
        if !handle.is_owner() {
            return Err(ChannelError::NotOwner {
                name: handle.name().to_string(),
            });
        }

        Ok(Self {
            handle: Some(handle),
            in_flight: false,
            stopped: false,
        })
    }

    fn handle(&self) -> &ChannelHandle<D, R> {
        // Only `teardown` takes the handle, and it consumes or drops `self`.
        self.handle
            .as_ref()
            .unwrap_or_else(|| unreachable!("publisher used after teardown"))
    }

    /// Name of the channel
    pub fn name(&self) -> &str {
        self.handle().name()
    }

    /// Current handshake phase
    pub fn state(&self) -> Result<ChannelState> {
        self.handle().state()
    }

    /// Hand `request` to the subscriber
    ///
    /// Blocks until the previous round has returned to `Init`.
    pub fn publish(&mut self, request: D) -> Result<()> {
        if self.stopped {
            return Err(ChannelError::Stopped);
        }
        if self.in_flight {
            return Err(ChannelError::RoundInFlight);
        }

        let shared = self.handle().shared();
        let fields = shared.fields.lock()?;
        let mut fields = shared
            .signals
            .subscriber_ready
            .wait_while(fields, |f| f.state != ChannelState::Init)?;

        fields.data.write(request);
        fields.advance();
        shared.signals.publisher_ready.notify_one()?;
        drop(fields);

        self.in_flight = true;
        debug!(name = self.name(), "request published");
        Ok(())
    }

    /// Block until the subscriber has answered, and return its answer
    pub fn wait_for_result(&mut self) -> Result<R> {
        if !self.in_flight {
            return Err(ChannelError::NothingPublished);
        }

        let result = self.collect()?;
        self.in_flight = false;
        debug!(name = self.name(), "result received");
        Ok(result)
    }

    fn collect(&self) -> Result<R> {
        let shared = self.handle().shared();
        let fields = shared.fields.lock()?;
        let mut fields = shared
            .signals
            .subscribed
            .wait_while(fields, |f| f.state != ChannelState::Subscribed)?;

        // SAFETY: the subscriber wrote `result` before moving to Subscribed.
        let result = unsafe { fields.result.assume_init_read() };
        fields.advance();
        shared.signals.got_result.notify_one()?;
        Ok(result)
    }

    /// Announce that no more rounds follow and wait for the subscriber to
    /// acknowledge
    ///
    /// A round still in flight is completed first and its result discarded,
    /// so the subscriber is never left blocked on its answer. Calling `stop`
    /// again is a no-op.
    pub fn stop(&mut self) -> Result<()> {
        if self.stopped {
            return Ok(());
        }

        if self.in_flight {
            warn!(name = self.name(), "stop called mid-round; draining the pending round");
            self.collect()?;
            self.in_flight = false;
        }

        let shared = self.handle().shared();
        let mut fields = shared.fields.lock()?;
        fields.publisher_active = false;
        shared.signals.publisher_ready.notify_all()?;

        let fields = shared
            .signals
            .subscriber_done
            .wait_while(fields, |f| f.subscriber_active)?;
        drop(fields);

        self.stopped = true;
        info!(name = self.name(), "publisher stopped");
        Ok(())
    }

    /// Release the lock and signals, unmap, and remove the shared object
    ///
    /// Never blocks. Without a completed [`stop`](Self::stop) the subscriber
    /// may still be waiting on the signals, so they are left alone: the
    /// publisher is marked inactive and a subscriber blocked in
    /// [`Subscriber::subscribe`](crate::Subscriber::subscribe) is woken, but
    /// its acknowledgment is not awaited. The mapping is still removed and
    /// the name unlinked.
    pub fn destroy(mut self) -> Result<()> {
        self.teardown()
    }

    fn teardown(&mut self) -> Result<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        let name = handle.name().to_string();
        let mut first = None;

        if self.stopped {
            // SAFETY: the subscriber acknowledged shutdown and touches the
            // channel no more.
            if let Err(e) = unsafe { handle.shared().destroy() } {
                first.get_or_insert(e);
            }
        } else {
            warn!(name = %name, "publisher torn down without stop; announcing shutdown");
            if let Err(e) = Self::announce_shutdown(&handle) {
                warn!(name = %name, error = %e, "shutdown announcement failed");
                first.get_or_insert(e);
            }
        }

        if let Err(e) = handle.into_region().close() {
            warn!(name = %name, error = %e, "unmap failed");
            first.get_or_insert(e);
        }

        match ShmRegion::unlink(&name) {
            Ok(true) => {}
            Ok(false) => debug!(name = %name, "shared memory already removed"),
            Err(e) => {
                warn!(name = %name, error = %e, "unlink failed");
                first.get_or_insert(e);
            }
        }

        info!(name = %name, "publisher destroyed");
        first.map_or(Ok(()), Err)
    }

    /// Mark the publisher inactive and wake a waiting subscriber, without
    /// waiting for its acknowledgment
    fn announce_shutdown(handle: &ChannelHandle<D, R>) -> Result<()> {
        let shared = handle.shared();
        let mut fields = shared.fields.lock()?;
        fields.publisher_active = false;
        shared.signals.publisher_ready.notify_all()
    }

    /// Remove a channel's shared object by name
    ///
    /// Returns `Ok(false)` if it was already absent.
    pub fn remove(name: &str) -> Result<bool> {
        ShmRegion::unlink(name)
    }
}

impl<D: Payload, R: Payload> Drop for Publisher<D, R> {
    fn drop(&mut self) {
        if let Err(e) = self.teardown() {
            warn!(error = %e, "publisher teardown failed");
        }
    }
}
