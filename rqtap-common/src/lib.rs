//! Shared types between the eBPF probe (kernel) and userspace
//!
//! This crate defines the record exchanged through the ring buffer, its byte
//! contract, and the reserve/write/submit routine the probe runs. Everything
//! here must be:
//! - `#[repr(C)]` for stable memory layout
//! - `no_std` compatible for eBPF
//! - Shared between the kernel probe and the userspace consumer

#![cfg_attr(not(feature = "userspace"), no_std)]

/// Name of the kprobe program inside the eBPF object
pub const PROBE_PROGRAM: &str = "rq_probe";

/// Kernel function the probe attaches to by default
pub const DEFAULT_HOOK: &str = "update_rq_clock";

/// Ring buffer map carrying [`Sample`] records
pub const SAMPLES_MAP: &str = "SAMPLES";

/// Per-CPU counter of samples dropped because the ring buffer was full
pub const DROPPED_MAP: &str = "DROPPED";

/// Global holding the byte offset of `nr_running` inside `struct rq`
pub const NR_RUNNING_OFFSET_GLOBAL: &str = "RQ_NR_RUNNING_OFFSET";

/// Offset of `nr_running` in `struct rq` when `raw_spinlock_t` is 4 bytes
/// (no lock debugging compiled in).
pub const DEFAULT_NR_RUNNING_OFFSET: u32 = 4;

/// Ring buffer size in bytes. 256KB holds ~16K samples (8 bytes plus the
/// 8-byte record header each) before dropping.
pub const RING_BUF_SIZE: u32 = 256 * 1024;

/// Size of one encoded [`Sample`]
pub const SAMPLE_SIZE: usize = core::mem::size_of::<Sample>();

/// Run queue sample captured on entry to `update_rq_clock`
///
/// Layout (8 bytes total, 4-byte aligned, host byte order):
/// - nr_running: runnable tasks on the run queue at capture time
/// - cpu: logical CPU the probe executed on
///
/// Producer and consumer run on the same machine, so fields travel in host
/// byte order with no framing, length prefix or version.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
#[cfg_attr(feature = "userspace", derive(PartialEq, Eq))]
pub struct Sample {
    pub nr_running: u32,
    pub cpu: u32,
}

impl Sample {
    pub const fn new(nr_running: u32, cpu: u32) -> Self {
        Self { nr_running, cpu }
    }

    /// Encode into the wire layout, byte-identical to the in-kernel struct
    pub fn to_bytes(&self) -> [u8; SAMPLE_SIZE] {
        let mut out = [0u8; SAMPLE_SIZE];
        out[..4].copy_from_slice(&self.nr_running.to_ne_bytes());
        out[4..].copy_from_slice(&self.cpu.to_ne_bytes());
        out
    }

    /// Decode a record read from the ring buffer.
    ///
    /// Returns `None` unless `bytes` is exactly [`SAMPLE_SIZE`] long.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != SAMPLE_SIZE {
            return None;
        }
        let mut nr_running = [0u8; 4];
        let mut cpu = [0u8; 4];
        nr_running.copy_from_slice(&bytes[..4]);
        cpu.copy_from_slice(&bytes[4..]);
        Some(Self {
            nr_running: u32::from_ne_bytes(nr_running),
            cpu: u32::from_ne_bytes(cpu),
        })
    }
}

/// Producer side of the channel: a ring that hands out reserved slots
pub trait SampleRing {
    type Slot: ReservedSlot;

    /// Reserve one slot without blocking. `None` when the ring is full.
    fn reserve(&self) -> Option<Self::Slot>;

    /// Account for a sample that could not be reserved
    fn record_drop(&self);
}

/// A reserved, not yet visible slot. Must end in `submit` or `discard`.
pub trait ReservedSlot {
    fn write(&mut self, sample: Sample);

    /// Make the slot visible to the consumer
    fn submit(self);

    /// Return the slot to the ring without publishing it
    fn discard(self);
}

/// Result of one [`capture`] call
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Capture {
    Submitted,
    /// Ring full; nothing was published
    Dropped,
    /// `read` failed after reservation; the slot was discarded
    Discarded,
}

/// Reserve a slot, fill it from `read`, and submit it.
///
/// A full ring drops the sample silently. A failed read discards the slot,
/// so a partial record never becomes visible.
#[inline(always)]
pub fn capture<R, F>(ring: &R, read: F) -> Capture
where
    R: SampleRing,
    F: FnOnce() -> Option<Sample>,
{
    let Some(mut slot) = ring.reserve() else {
        ring.record_drop();
        return Capture::Dropped;
    };

    match read() {
        Some(sample) => {
            slot.write(sample);
            slot.submit();
            Capture::Submitted
        }
        None => {
            slot.discard();
            Capture::Discarded
        }
    }
}

#[cfg(feature = "userspace")]
const _: () = {
    assert!(SAMPLE_SIZE == 8, "Sample must be exactly 8 bytes");
    assert!(
        core::mem::align_of::<Sample>() == 4,
        "Sample must be 4-byte aligned"
    );
};
