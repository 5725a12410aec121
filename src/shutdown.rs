//! SIGINT/SIGTERM handling.
//!
//! The first signal cancels a [`CancellationToken`] that the poll loop checks
//! between polls and races against while blocked. A second signal, while
//! teardown is still running, exits the process at once with `128 + signo`.

use std::process;

use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{Result, RqtapError};

struct Signals {
    sigint: Signal,
    sigterm: Signal,
}

impl Signals {
    fn install() -> Result<Self> {
        Ok(Self {
            sigint: signal(SignalKind::interrupt()).map_err(RqtapError::Signal)?,
            sigterm: signal(SignalKind::terminate()).map_err(RqtapError::Signal)?,
        })
    }

    /// Wait for either signal; returns its name and number
    async fn recv(&mut self) -> (&'static str, i32) {
        tokio::select! {
            _ = self.sigint.recv() => ("SIGINT", SignalKind::interrupt().as_raw_value()),
            _ = self.sigterm.recv() => ("SIGTERM", SignalKind::terminate().as_raw_value()),
        }
    }
}

/// Install SIGINT and SIGTERM handlers that cancel `token`.
///
/// The handlers are registered before this returns, so a signal delivered
/// right after startup is not lost.
pub fn spawn_signal_listener(token: CancellationToken) -> Result<JoinHandle<()>> {
    listen(token, |signo| process::exit(128 + signo))
}

fn listen<F>(token: CancellationToken, force_exit: F) -> Result<JoinHandle<()>>
where
    F: FnOnce(i32) + Send + 'static,
{
    let mut signals = Signals::install()?;

    Ok(tokio::spawn(async move {
        tokio::select! {
            (name, _) = signals.recv() => {
                info!("{} received, shutting down", name);
                token.cancel();
            }
            _ = token.cancelled() => {}
        }

        let (name, signo) = signals.recv().await;
        warn!("{} received during shutdown, exiting without cleanup", name);
        force_exit(signo);
    }))
}
