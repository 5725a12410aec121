//! Kernel boundary: the probe host and the sample channel it exposes.
//!
//! The consumer only talks to these two traits. `loader` and `channel` are the
//! aya-backed implementations; tests drive the consumer with in-memory fakes.

#[cfg(target_os = "linux")]
pub mod btf;
#[cfg(target_os = "linux")]
pub mod channel;
#[cfg(target_os = "linux")]
pub mod loader;
#[cfg(target_os = "linux")]
pub mod preflight;

use std::io;

use async_trait::async_trait;
use rqtap_common::Sample;
use tokio_util::sync::CancellationToken;

use crate::Result;

/// Owns the probe program across open, attach, and teardown.
pub trait ProbeHost {
    type Channel: SampleChannel;

    /// Load the program and have the kernel verifier accept it
    fn open(&mut self) -> Result<()>;

    /// Bind the loaded program to its hook point
    fn attach(&mut self) -> Result<()>;

    /// Map the shared ring buffer. Called once, after a successful attach.
    fn channel(&mut self) -> Result<Self::Channel>;

    /// Undo a successful `attach`
    fn detach(&mut self);

    /// Unload everything `open` acquired
    fn destroy(&mut self);

    /// Samples the producer dropped on a full ring, when the host counts them
    fn dropped_samples(&self) -> Option<u64> {
        None
    }
}

/// Consumer side of the ring buffer.
#[async_trait]
pub trait SampleChannel: Send {
    /// Wait until at least one record is available, then pass every available
    /// record to `on_sample` in submission order. Returns the number delivered.
    ///
    /// Fails with [`io::ErrorKind::Interrupted`] when `shutdown` fires during
    /// the wait. That is a request to stop, not a fault.
    async fn poll(
        &mut self,
        shutdown: &CancellationToken,
        on_sample: &mut (dyn FnMut(Sample) + Send),
    ) -> io::Result<usize>;

    /// Give the channel back. Called exactly once.
    fn release(self);
}
