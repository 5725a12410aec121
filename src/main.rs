//! rqtap - run queue length sampler
//!
//! Loads a kprobe on `update_rq_clock`, polls its ring buffer and prints one
//! line per sample until SIGINT or SIGTERM.

use std::process;

#[cfg(not(target_os = "linux"))]
fn main() {
    eprintln!("Error: rqtap requires Linux to run eBPF programs");
    process::exit(1);
}

#[cfg(target_os = "linux")]
#[tokio::main(flavor = "current_thread")]
async fn main() {
    use rqtap::config::Settings;
    use rqtap::RqtapError;
    use tracing::info;
    use tracing_subscriber::EnvFilter;

    let settings = match Settings::new() {
        Ok(settings) => settings,
        Err(e) => {
            let e = RqtapError::from(e);
            eprintln!("Error: {}", e);
            process::exit(e.exit_code());
        }
    };

    // stdout carries sample lines only.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.log));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    info!("Starting rqtap v{}", rqtap::VERSION);

    if let Err(e) = run(settings).await {
        eprintln!("Error: {}", e);
        process::exit(e.exit_code());
    }
}

#[cfg(target_os = "linux")]
async fn run(settings: rqtap::config::Settings) -> rqtap::Result<()> {
    use rqtap::consumer::{format_sample, Consumer};
    use rqtap::ebpf::{loader::KprobeHost, preflight};
    use rqtap::shutdown::spawn_signal_listener;
    use tokio_util::sync::CancellationToken;
    use tracing::{info, warn};

    if settings.skip_preflight {
        warn!("Skipping pre-flight checks");
    } else {
        preflight::run_preflight_checks()?;
    }
    preflight::bump_memlock_rlimit()?;

    let shutdown = CancellationToken::new();
    let _signals = spawn_signal_listener(shutdown.clone())?;

    let mut consumer = Consumer::new(KprobeHost::new(&settings));
    info!("rqtap running. Press Ctrl+C to exit.");
    let summary = consumer
        .run(&shutdown, |sample| println!("{}", format_sample(&sample)))
        .await?;

    info!(
        "rqtap stopped: {} samples delivered over {} polls",
        summary.delivered, summary.polls
    );
    match summary.dropped {
        Some(0) | None => {}
        Some(dropped) => warn!("{} samples dropped on a full ring buffer", dropped),
    }
    Ok(())
}
