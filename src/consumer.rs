//! Consumer lifecycle: open, attach, poll until shutdown, tear down.
//!
//! ```text
//! Uninitialized -> Opened -> Attached -> Polling -> ShutDown
//! ```
//!
//! A failure at any step short of `Polling` unwinds through the same teardown
//! as a clean stop and leaves the consumer back in `Uninitialized`. Once
//! polling has started, every exit ends in `ShutDown`. Teardown releases the
//! channel, detaches the probe and destroys the program, each only if it was
//! acquired, and each exactly once.

use std::io;

use rqtap_common::Sample;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::ebpf::{ProbeHost, SampleChannel};
use crate::{Result, RqtapError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Uninitialized,
    Opened,
    Attached,
    Polling,
    ShutDown,
}

/// What one run did, reported after teardown
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Records passed to the callback
    pub delivered: u64,
    /// Poll calls made
    pub polls: u64,
    /// Samples the producer dropped on a full ring, if the host counts them
    pub dropped: Option<u64>,
}

pub struct Consumer<H: ProbeHost> {
    host: H,
    state: ConsumerState,
    attached: bool,
}

impl<H: ProbeHost> Consumer<H> {
    pub fn new(host: H) -> Self {
        Self {
            host,
            state: ConsumerState::Uninitialized,
            attached: false,
        }
    }

    pub fn state(&self) -> ConsumerState {
        self.state
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    /// Run the whole lifecycle, calling `on_sample` once per record in
    /// arrival order until `shutdown` fires or polling fails.
    ///
    /// Returns `Ok` on a clean stop, including a poll interrupted by the
    /// shutdown request.
    pub async fn run<F>(&mut self, shutdown: &CancellationToken, mut on_sample: F) -> Result<RunSummary>
    where
        F: FnMut(Sample) + Send,
    {
        // Nothing is held if open fails.
        self.host.open()?;
        self.state = ConsumerState::Opened;

        let mut summary = RunSummary::default();
        let mut channel = None;
        let result = self
            .poll_until_shutdown(&mut channel, shutdown, &mut on_sample, &mut summary)
            .await;
        self.shut_down(channel, &mut summary);

        result.map(|()| summary)
    }

    async fn poll_until_shutdown(
        &mut self,
        channel: &mut Option<H::Channel>,
        shutdown: &CancellationToken,
        on_sample: &mut (dyn FnMut(Sample) + Send),
        summary: &mut RunSummary,
    ) -> Result<()> {
        self.host.attach()?;
        self.attached = true;
        self.state = ConsumerState::Attached;

        let channel = channel.insert(self.host.channel()?);
        self.state = ConsumerState::Polling;
        info!("Polling ring buffer for samples...");

        while !shutdown.is_cancelled() {
            summary.polls += 1;
            match channel.poll(shutdown, on_sample).await {
                Ok(delivered) => summary.delivered += delivered as u64,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                    debug!("poll interrupted, shutting down");
                    break;
                }
                Err(e) => return Err(RqtapError::Poll(e)),
            }
        }

        Ok(())
    }

    fn shut_down(&mut self, channel: Option<H::Channel>, summary: &mut RunSummary) {
        // The channel exists only once polling was reached.
        let polled = channel.is_some();
        if let Some(channel) = channel {
            channel.release();
        }

        summary.dropped = self.host.dropped_samples();

        if self.attached {
            self.host.detach();
            self.attached = false;
        }
        self.host.destroy();

        self.state = if polled {
            ConsumerState::ShutDown
        } else {
            ConsumerState::Uninitialized
        };
    }
}

/// One console line per record
pub fn format_sample(sample: &Sample) -> String {
    format!(
        "[ringbuf-handler] nr_running->{} cpu->{}",
        sample.nr_running, sample.cpu
    )
}
