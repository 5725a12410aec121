//! Run queue probe that sends samples via ring buffer
//!
//! This probe:
//! - Attaches as a kprobe on `update_rq_clock(struct rq *rq, ...)`
//! - Captures `rq->nr_running` and the current CPU id
//! - Sends samples to userspace via ring buffer
//!
//! Note: This binary must be built for the bpfel-unknown-none target.
//! The rqtap build.rs handles cross-compilation automatically.

#![no_std]
#![no_main]

use aya_ebpf::{
    helpers::{bpf_get_smp_processor_id, bpf_probe_read_kernel},
    macros::{kprobe, map},
    maps::{ring_buf::RingBufEntry, PerCpuArray, RingBuf},
    programs::ProbeContext,
};
use rqtap_common::{
    capture, ReservedSlot, Sample, SampleRing, DEFAULT_NR_RUNNING_OFFSET, RING_BUF_SIZE,
};

#[link_section = "license"]
#[used]
pub static LICENSE: [u8; 13] = *b"Dual BSD/GPL\0";

/// Byte offset of `nr_running` in `struct rq`. Overridden by userspace at load time.
#[no_mangle]
static RQ_NR_RUNNING_OFFSET: u32 = DEFAULT_NR_RUNNING_OFFSET;

#[map]
static SAMPLES: RingBuf = RingBuf::with_byte_size(RING_BUF_SIZE, 0);

#[map]
static DROPPED: PerCpuArray<u64> = PerCpuArray::with_max_entries(1, 0);

struct Samples;

struct Slot(RingBufEntry<Sample>);

impl SampleRing for Samples {
    type Slot = Slot;

    #[inline(always)]
    fn reserve(&self) -> Option<Slot> {
        SAMPLES.reserve::<Sample>(0).map(Slot)
    }

    #[inline(always)]
    fn record_drop(&self) {
        if let Some(dropped) = DROPPED.get_ptr_mut(0) {
            // SAFETY: per-CPU slot, and kprobes do not nest on one CPU
            unsafe { *dropped += 1 };
        }
    }
}

impl ReservedSlot for Slot {
    #[inline(always)]
    fn write(&mut self, sample: Sample) {
        self.0.write(sample);
    }

    #[inline(always)]
    fn submit(self) {
        self.0.submit(0);
    }

    #[inline(always)]
    fn discard(self) {
        self.0.discard(0);
    }
}

#[kprobe]
pub fn rq_probe(ctx: ProbeContext) -> u32 {
    // A full ring is not an error to the kernel; the sample is dropped.
    capture(&Samples, || read_sample(&ctx));
    0
}

#[inline(always)]
fn read_sample(ctx: &ProbeContext) -> Option<Sample> {
    let rq: *const u8 = ctx.arg(0)?;
    if rq.is_null() {
        return None;
    }

    // SAFETY: globals are read-only after load; volatile keeps the
    // userspace-provided value from being constant-folded.
    let offset = unsafe { core::ptr::read_volatile(&RQ_NR_RUNNING_OFFSET) };

    // SAFETY: bpf_probe_read_kernel validates the address
    let nr_running =
        unsafe { bpf_probe_read_kernel(rq.add(offset as usize) as *const u32) }.ok()?;
    // SAFETY: bpf_get_smp_processor_id is always safe to call from eBPF context
    let cpu = unsafe { bpf_get_smp_processor_id() };

    Some(Sample { nr_running, cpu })
}

#[cfg(not(test))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    loop {}
}
