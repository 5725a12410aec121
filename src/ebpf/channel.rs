//! Ring buffer reader bound to the probe's `SAMPLES` map

use std::io;

use async_trait::async_trait;
use aya::maps::{MapData, RingBuf};
use rqtap_common::{Sample, SAMPLE_SIZE};
use tokio::io::{unix::AsyncFd, Interest};
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

use super::SampleChannel;

/// Records handed out per poll before yielding back to the loop, so a busy
/// producer cannot keep the consumer from seeing a shutdown request.
const MAX_BATCH_SIZE: usize = 1024;

pub struct RingBufChannel {
    ring_buf: AsyncFd<RingBuf<MapData>>,
}

impl RingBufChannel {
    /// Register the ring buffer fd with the tokio reactor.
    /// Must be called from inside a runtime.
    pub fn new(ring_buf: RingBuf<MapData>) -> io::Result<Self> {
        let ring_buf = AsyncFd::with_interest(ring_buf, Interest::READABLE)?;
        Ok(Self { ring_buf })
    }
}

#[async_trait]
impl SampleChannel for RingBufChannel {
    async fn poll(
        &mut self,
        shutdown: &CancellationToken,
        on_sample: &mut (dyn FnMut(Sample) + Send),
    ) -> io::Result<usize> {
        loop {
            let mut guard = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    return Err(io::Error::from(io::ErrorKind::Interrupted));
                }
                guard = self.ring_buf.readable_mut() => guard?,
            };

            let drained = drain(guard.get_inner_mut(), on_sample, MAX_BATCH_SIZE);
            if drained.exhausted {
                // Wait for the next wakeup.
                guard.clear_ready();
            }
            if drained.delivered > 0 {
                trace!(delivered = drained.delivered, "drained ring buffer");
                return Ok(drained.delivered);
            }
        }
    }

    fn release(self) {
        drop(self.ring_buf.into_inner());
    }
}

/// Raw records in submission order
trait Records {
    /// Hand the next record to `f`. Returns false once nothing is left.
    fn with_next<F: FnOnce(&[u8])>(&mut self, f: F) -> bool;
}

impl Records for RingBuf<MapData> {
    fn with_next<F: FnOnce(&[u8])>(&mut self, f: F) -> bool {
        match self.next() {
            Some(item) => {
                f(&item);
                true
            }
            None => false,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
struct Drained {
    delivered: usize,
    /// Every available record was consumed
    exhausted: bool,
}

/// Deliver up to `max` decoded samples, skipping malformed records
fn drain<R: Records>(
    records: &mut R,
    on_sample: &mut (dyn FnMut(Sample) + Send),
    max: usize,
) -> Drained {
    let mut delivered = 0;
    while delivered < max {
        let more = records.with_next(|record| {
            if let Some(sample) = decode_record(record) {
                on_sample(sample);
                delivered += 1;
            }
        });
        if !more {
            return Drained {
                delivered,
                exhausted: true,
            };
        }
    }
    Drained {
        delivered,
        exhausted: false,
    }
}

/// Decode one ring buffer record, skipping anything that is not a `Sample`
fn decode_record(record: &[u8]) -> Option<Sample> {
    let sample = Sample::from_bytes(record);
    if sample.is_none() {
        warn!(
            "Malformed record: expected {} bytes, got {} bytes - skipping",
            SAMPLE_SIZE,
            record.len()
        );
    }
    sample
}
