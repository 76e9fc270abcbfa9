//! shm_rendezvous - synchronous request/response channel over shared memory
//!
//! One publisher process and one subscriber process exchange exactly one
//! request and one response per round through a POSIX shared memory object.
//! A process-shared mutex and five condition variables live inside the
//! mapping and sequence every round through
//! `Init -> Published -> Subscribed -> GotResult -> Init`.
//!
//! # Roles
//!
//! - **Publisher**: creates the channel, publishes requests, waits for
//!   results, stops, then removes the shared object
//! - **Subscriber**: attaches to an existing channel, receives requests,
//!   sends results, and exits once the publisher stops
//!
//! ```no_run
//! use shm_rendezvous::{ChannelConfig, Publisher, Subscriber};
//!
//! # fn publisher() -> shm_rendezvous::Result<()> {
//! let mut publisher = Publisher::<i64, i64>::create("demo", &ChannelConfig::default())?;
//! for i in 1..=5 {
//!     publisher.publish(i * 13)?;
//!     let result = publisher.wait_for_result()?;
//!     println!("{result}");
//! }
//! publisher.stop()?;
//! publisher.destroy()
//! # }
//!
//! # fn subscriber() -> shm_rendezvous::Result<()> {
//! let mut subscriber = Subscriber::<i64, i64>::attach("demo")?;
//! while let Some(request) = subscriber.subscribe()? {
//!     subscriber.send_result(request + 1)?;
//! }
//! subscriber.destroy()
//! # }
//! ```

pub mod error;
pub mod shm;
pub mod sync;
pub mod layout;
pub mod channel;
pub mod publisher;
pub mod subscriber;

pub use channel::{ChannelConfig, ChannelHandle};
pub use error::{ChannelError, Result};
pub use layout::{ChannelState, Payload};
pub use publisher::Publisher;
pub use subscriber::Subscriber;

/// Install a `tracing` subscriber driven by `RUST_LOG`
///
/// Meant for binaries; the library itself never installs one.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .with_target(false)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}
