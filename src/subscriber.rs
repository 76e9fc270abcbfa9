//! Subscriber side of the channel

use crate::channel::ChannelHandle;
use crate::error::Result;
use crate::layout::{ChannelState, Payload};
use tracing::{debug, info, warn};

/// Subscriber (request reader) side of the channel
///
/// Attaches to a channel the publisher already created. Never initializes or
/// removes the shared object.
pub struct Subscriber<D: Payload, R: Payload> {
    handle: Option<ChannelHandle<D, R>>,
}

impl<D: Payload, R: Payload> Subscriber<D, R> {
    /// Attach to the channel named `name`
    pub fn attach(name: &str) -> Result<Self> {
        Ok(Self::new(ChannelHandle::attach(name)?))
    }

    /// Wrap a handle obtained from [`ChannelHandle::attach`]
    pub fn new(handle: ChannelHandle<D, R>) -> Self {
        Self {
            handle: Some(handle),
        }
    }

    fn handle(&self) -> &ChannelHandle<D, R> {
        self.handle
            .as_ref()
            .unwrap_or_else(|| unreachable!("subscriber used after teardown"))
    }

    /// Name of the channel
    pub fn name(&self) -> &str {
        self.handle().name()
    }

    /// Current handshake phase
    pub fn state(&self) -> Result<ChannelState> {
        self.handle().state()
    }

    /// Block until a request is available or the publisher stops
    ///
    /// Returns `Some(request)` when a request is pending; it stays pending
    /// until [`send_result`](Self::send_result). Returns `None` once the
    /// publisher has stopped, after acknowledging the shutdown; the caller's
    /// loop should end.
    pub fn subscribe(&mut self) -> Result<Option<D>> {
        let shared = self.handle().shared();
        let fields = shared.fields.lock()?;
        let mut fields = shared.signals.publisher_ready.wait_while(fields, |f| {
            f.state != ChannelState::Published && f.publisher_active
        })?;

        if fields.state == ChannelState::Published {
            // SAFETY: the publisher wrote `data` before moving to Published.
            let request = unsafe { fields.data.assume_init_read() };
            debug!(name = self.name(), "request received");
            return Ok(Some(request));
        }

        if fields.subscriber_active {
            fields.subscriber_active = false;
            shared.signals.subscriber_done.notify_one()?;
            info!(name = self.name(), "publisher stopped; subscriber done");
        }
        Ok(None)
    }

    /// Hand `response` back and wait for the publisher to take it
    ///
    /// Does nothing unless a request is pending.
    pub fn send_result(&mut self, response: R) -> Result<()> {
        let shared = self.handle().shared();
        let mut fields = shared.fields.lock()?;

        if fields.state != ChannelState::Published {
            debug!(name = self.name(), state = ?fields.state, "no pending request; result dropped");
            return Ok(());
        }

        fields.result.write(response);
        fields.advance();
        shared.signals.subscribed.notify_one()?;

        let mut fields = shared
            .signals
            .got_result
            .wait_while(fields, |f| f.state != ChannelState::GotResult)?;

        fields.advance();
        shared.signals.subscriber_ready.notify_one()?;
        debug!(name = self.name(), "round complete");
        Ok(())
    }

    /// Unmap the channel; the shared object itself is left to the publisher
    pub fn destroy(mut self) -> Result<()> {
        self.teardown()
    }

    fn teardown(&mut self) -> Result<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        let name = handle.name().to_string();
        handle.into_region().close()?;
        info!(name = %name, "subscriber detached");
        Ok(())
    }
}

impl<D: Payload, R: Payload> Drop for Subscriber<D, R> {
    fn drop(&mut self) {
        if let Err(e) = self.teardown() {
            warn!(error = %e, "subscriber teardown failed");
        }
    }
}
