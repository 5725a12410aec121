//! Host checks and resource limits needed before the probe can load

use std::io;
use std::path::Path;

use tracing::{info, warn};

use super::btf::VMLINUX_BTF;
use crate::{Result, RqtapError};

/// BPF ring buffers landed in 5.8
const MIN_KERNEL_VERSION: (u32, u32) = (5, 8);

/// Run pre-flight checks to validate the system can run the probe
pub fn run_preflight_checks() -> Result<()> {
    info!("Running pre-flight checks...");

    check_kernel_version()?;
    check_btf();
    check_capabilities();

    info!("Pre-flight checks passed");
    Ok(())
}

/// Lift `RLIMIT_MEMLOCK` so the ring buffer pages can be pinned.
///
/// BPF maps live in locked kernel memory; kernels before 5.11 charge them
/// against this limit.
pub fn bump_memlock_rlimit() -> Result<()> {
    let rlim = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    // SAFETY: rlim is a valid, initialized rlimit
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) };
    if ret != 0 {
        return Err(RqtapError::ResourceLimit(io::Error::last_os_error()));
    }
    Ok(())
}

fn check_kernel_version() -> Result<()> {
    let output = std::process::Command::new("uname")
        .arg("-r")
        .output()
        .map_err(|e| RqtapError::Preflight(format!("Failed to get kernel version: {e}")))?;

    let release = String::from_utf8_lossy(&output.stdout);
    let release = release.trim();
    let version = parse_kernel_release(release).ok_or_else(|| {
        RqtapError::Preflight(format!("Could not parse kernel version: {release}"))
    })?;

    if version < MIN_KERNEL_VERSION {
        return Err(RqtapError::KernelVersionTooOld {
            version: release.to_string(),
            min_version: format!("{}.{}", MIN_KERNEL_VERSION.0, MIN_KERNEL_VERSION.1),
        });
    }

    info!("Kernel version: {} (supported)", release);
    Ok(())
}

/// Parse `major.minor` out of a `uname -r` string like `6.8.0-45-generic`
fn parse_kernel_release(release: &str) -> Option<(u32, u32)> {
    let mut parts = release.trim().split('.');
    let major = parts.next()?.trim().parse().ok()?;
    let minor = parts
        .next()?
        .split(|c: char| !c.is_ascii_digit())
        .next()?
        .parse()
        .ok()?;
    Some((major, minor))
}

fn check_btf() {
    if !Path::new(VMLINUX_BTF).exists() {
        warn!("BTF not found at {}", VMLINUX_BTF);
        warn!("The nr_running offset cannot be read from kernel types; set RQTAP_NR_RUNNING_OFFSET if samples look wrong");
        return;
    }

    info!("BTF available, struct rq layout will be read from {}", VMLINUX_BTF);
}

fn check_capabilities() {
    // SAFETY: geteuid has no preconditions
    let euid = unsafe { libc::geteuid() };

    if euid != 0 {
        warn!(
            "Not running as root (euid={}). Ensure CAP_BPF and CAP_PERFMON capabilities are granted.",
            euid
        );
    } else {
        info!("Running with root privileges");
    }
}
