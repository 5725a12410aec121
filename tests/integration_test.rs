use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rqtap::consumer::{Consumer, ConsumerState, RunSummary};
use rqtap::ebpf::{ProbeHost, SampleChannel};
use rqtap::error::{Result, RqtapError};
use rqtap_common::{capture, Capture, ReservedSlot, Sample, SampleRing, SAMPLE_SIZE};
use tokio_util::sync::CancellationToken;

// Same values on every Linux architecture
const ENOENT: i32 = 2;
const EINTR: i32 = 4;

#[derive(Default)]
struct RingState {
    published: VecDeque<[u8; SAMPLE_SIZE]>,
    reserved: usize,
    dropped: u64,
}

/// Bounded single-producer/single-consumer ring shared by both halves
#[derive(Clone)]
struct FakeRing {
    capacity: usize,
    state: Arc<Mutex<RingState>>,
}

struct FakeSlot {
    state: Arc<Mutex<RingState>>,
    bytes: [u8; SAMPLE_SIZE],
}

impl FakeRing {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            state: Arc::default(),
        }
    }

    fn produce(&self, nr_running: u32, cpu: u32) -> Capture {
        capture(self, || Some(Sample::new(nr_running, cpu)))
    }

    fn pending(&self) -> usize {
        self.state.lock().unwrap().published.len()
    }
}

impl SampleRing for FakeRing {
    type Slot = FakeSlot;

    fn reserve(&self) -> Option<FakeSlot> {
        let mut state = self.state.lock().unwrap();
        if state.published.len() + state.reserved >= self.capacity {
            return None;
        }
        state.reserved += 1;
        Some(FakeSlot {
            state: self.state.clone(),
            bytes: [0; SAMPLE_SIZE],
        })
    }

    fn record_drop(&self) {
        self.state.lock().unwrap().dropped += 1;
    }
}

impl ReservedSlot for FakeSlot {
    fn write(&mut self, sample: Sample) {
        self.bytes = sample.to_bytes();
    }

    fn submit(self) {
        let mut state = self.state.lock().unwrap();
        state.reserved -= 1;
        state.published.push_back(self.bytes);
    }

    fn discard(self) {
        self.state.lock().unwrap().reserved -= 1;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Stage {
    Open,
    Attach,
    Channel,
    Poll,
}

/// Acquire/release call counts, shared with the test body
#[derive(Default)]
struct Calls {
    opened: AtomicUsize,
    attached: AtomicUsize,
    channels: AtomicUsize,
    released: AtomicUsize,
    detached: AtomicUsize,
    destroyed: AtomicUsize,
}

impl Calls {
    fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

struct FakeChannel {
    ring: FakeRing,
    poll_error: Option<io::Error>,
    calls: Arc<Calls>,
}

#[async_trait]
impl SampleChannel for FakeChannel {
    async fn poll(
        &mut self,
        shutdown: &CancellationToken,
        on_sample: &mut (dyn FnMut(Sample) + Send),
    ) -> io::Result<usize> {
        if let Some(e) = self.poll_error.take() {
            return Err(e);
        }

        let batch: Vec<_> = {
            let mut state = self.ring.state.lock().unwrap();
            state.published.drain(..).collect()
        };
        if batch.is_empty() {
            // Block until the shutdown request interrupts the wait.
            shutdown.cancelled().await;
            return Err(io::ErrorKind::Interrupted.into());
        }

        let mut delivered = 0;
        for bytes in batch {
            let sample = Sample::from_bytes(&bytes).expect("fake ring holds whole samples");
            on_sample(sample);
            delivered += 1;
        }
        Ok(delivered)
    }

    fn release(self) {
        self.calls.released.fetch_add(1, Ordering::SeqCst);
    }
}

struct FakeHost {
    ring: FakeRing,
    fail_at: Option<Stage>,
    poll_error: Option<io::Error>,
    calls: Arc<Calls>,
}

impl FakeHost {
    fn new(ring: FakeRing) -> Self {
        Self {
            ring,
            fail_at: None,
            poll_error: None,
            calls: Arc::default(),
        }
    }

    fn failing_at(ring: FakeRing, stage: Stage) -> Self {
        let poll_error = (stage == Stage::Poll).then(|| io::Error::from_raw_os_error(5));
        Self {
            fail_at: Some(stage),
            poll_error,
            ..Self::new(ring)
        }
    }
}

impl ProbeHost for FakeHost {
    type Channel = FakeChannel;

    fn open(&mut self) -> Result<()> {
        if self.fail_at == Some(Stage::Open) {
            return Err(RqtapError::load("verifier rejected program"));
        }
        self.calls.opened.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn attach(&mut self) -> Result<()> {
        if self.fail_at == Some(Stage::Attach) {
            return Err(RqtapError::Attach {
                hook: "update_rq_clock".to_string(),
                reason: "symbol not found".to_string(),
                errno: Some(ENOENT),
            });
        }
        self.calls.attached.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn channel(&mut self) -> Result<FakeChannel> {
        if self.fail_at == Some(Stage::Channel) {
            return Err(RqtapError::Channel("SAMPLES map not found".to_string()));
        }
        self.calls.channels.fetch_add(1, Ordering::SeqCst);
        Ok(FakeChannel {
            ring: self.ring.clone(),
            poll_error: self.poll_error.take(),
            calls: self.calls.clone(),
        })
    }

    fn detach(&mut self) {
        self.calls.detached.fetch_add(1, Ordering::SeqCst);
    }

    fn destroy(&mut self) {
        self.calls.destroyed.fetch_add(1, Ordering::SeqCst);
    }

    fn dropped_samples(&self) -> Option<u64> {
        Some(self.ring.state.lock().unwrap().dropped)
    }
}

/// Run the consumer, cancelling once `stop_after` samples have arrived
async fn run_collecting(
    host: FakeHost,
    stop_after: usize,
) -> (Consumer<FakeHost>, Result<RunSummary>, Vec<Sample>) {
    let shutdown = CancellationToken::new();
    let stop = shutdown.clone();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();

    let mut consumer = Consumer::new(host);
    let result = consumer
        .run(&shutdown, move |sample| {
            let mut seen = sink.lock().unwrap();
            seen.push(sample);
            if seen.len() >= stop_after {
                stop.cancel();
            }
        })
        .await;

    let seen = seen.lock().unwrap().clone();
    (consumer, result, seen)
}

#[tokio::test]
async fn test_three_samples_delivered_in_order_by_one_poll() {
    let ring = FakeRing::with_capacity(16);
    assert_eq!(ring.produce(5, 0), Capture::Submitted);
    assert_eq!(ring.produce(2, 1), Capture::Submitted);
    assert_eq!(ring.produce(9, 0), Capture::Submitted);

    let (consumer, result, seen) = run_collecting(FakeHost::new(ring), 3).await;
    let summary = result.expect("clean shutdown");

    assert_eq!(
        seen,
        vec![Sample::new(5, 0), Sample::new(2, 1), Sample::new(9, 0)]
    );
    assert_eq!(summary.polls, 1);
    assert_eq!(summary.delivered, 3);
    assert_eq!(consumer.state(), ConsumerState::ShutDown);
}

#[tokio::test]
async fn test_fifo_for_many_samples() {
    let ring = FakeRing::with_capacity(256);
    let expected: Vec<_> = (0..200u32).map(|i| Sample::new(i * 3, i % 8)).collect();
    for sample in &expected {
        assert_eq!(ring.produce(sample.nr_running, sample.cpu), Capture::Submitted);
    }

    let (_, result, seen) = run_collecting(FakeHost::new(ring), expected.len()).await;

    assert_eq!(result.unwrap().delivered, expected.len() as u64);
    assert_eq!(seen, expected);
}

#[tokio::test]
async fn test_round_trip_is_exact() {
    let ring = FakeRing::with_capacity(1);
    ring.produce(7, 3);

    let (_, result, seen) = run_collecting(FakeHost::new(ring), 1).await;

    result.unwrap();
    assert_eq!(seen, vec![Sample::new(7, 3)]);
    assert_eq!(seen[0].to_bytes(), Sample::new(7, 3).to_bytes());
}

#[tokio::test]
async fn test_full_ring_drops_silently_and_is_counted() {
    let ring = FakeRing::with_capacity(2);
    assert_eq!(ring.produce(1, 0), Capture::Submitted);
    assert_eq!(ring.produce(2, 0), Capture::Submitted);
    assert_eq!(ring.produce(3, 0), Capture::Dropped);
    assert_eq!(ring.pending(), 2);

    let (_, result, seen) = run_collecting(FakeHost::new(ring), 2).await;
    let summary = result.unwrap();

    assert_eq!(seen, vec![Sample::new(1, 0), Sample::new(2, 0)]);
    assert_eq!(summary.dropped, Some(1));
}

#[tokio::test]
async fn test_interrupted_poll_is_clean_shutdown() {
    let ring = FakeRing::with_capacity(4);
    let mut host = FakeHost::new(ring);
    host.poll_error = Some(io::Error::from_raw_os_error(EINTR));
    let calls = host.calls.clone();

    let mut consumer = Consumer::new(host);
    let shutdown = CancellationToken::new();
    let summary = consumer
        .run(&shutdown, |_| {})
        .await
        .expect("EINTR is not a failure");

    assert_eq!(summary.polls, 1);
    assert_eq!(summary.delivered, 0);
    assert_eq!(Calls::get(&calls.released), 1);
    assert_eq!(Calls::get(&calls.destroyed), 1);
}

#[tokio::test]
async fn test_shutdown_while_blocked_interrupts_poll() {
    let ring = FakeRing::with_capacity(4);
    let host = FakeHost::new(ring);
    let calls = host.calls.clone();

    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        tokio::task::yield_now().await;
        trigger.cancel();
    });

    let mut consumer = Consumer::new(host);
    let summary = consumer.run(&shutdown, |_| {}).await.unwrap();

    assert_eq!(summary.polls, 1);
    assert_eq!(Calls::get(&calls.released), 1);
    assert_eq!(Calls::get(&calls.detached), 1);
    assert_eq!(Calls::get(&calls.destroyed), 1);
}

#[tokio::test]
async fn test_poll_error_is_fatal_with_errno_exit_code() {
    let ring = FakeRing::with_capacity(4);
    ring.produce(1, 0);
    let host = FakeHost::failing_at(ring, Stage::Poll);

    let (_, result, seen) = run_collecting(host, usize::MAX).await;

    let err = result.expect_err("EIO is fatal");
    assert!(matches!(err, RqtapError::Poll(_)));
    assert_eq!(err.exit_code(), 5);
    assert!(seen.is_empty());
}

#[tokio::test]
async fn test_cleanup_runs_once_per_acquired_resource() {
    // (stage, expect attach/detach, expect channel/release)
    let cases = [
        (Stage::Open, false, false),
        (Stage::Attach, false, false),
        (Stage::Channel, true, false),
        (Stage::Poll, true, true),
    ];

    for (stage, attached, channel) in cases {
        let host = FakeHost::failing_at(FakeRing::with_capacity(4), stage);
        let calls = host.calls.clone();

        let (consumer, result, _) = run_collecting(host, usize::MAX).await;
        let err = result.expect_err("injected failure must surface");

        let opened = stage != Stage::Open;
        assert_eq!(Calls::get(&calls.opened), opened as usize, "{stage:?}");
        assert_eq!(Calls::get(&calls.destroyed), opened as usize, "{stage:?}");
        assert_eq!(Calls::get(&calls.attached), attached as usize, "{stage:?}");
        assert_eq!(Calls::get(&calls.detached), attached as usize, "{stage:?}");
        assert_eq!(Calls::get(&calls.channels), channel as usize, "{stage:?}");
        assert_eq!(Calls::get(&calls.released), channel as usize, "{stage:?}");

        let expected_state = if channel {
            ConsumerState::ShutDown
        } else {
            ConsumerState::Uninitialized
        };
        assert_eq!(consumer.state(), expected_state, "{stage:?}");

        match stage {
            Stage::Open => assert!(matches!(err, RqtapError::Load { .. })),
            Stage::Attach => {
                assert!(matches!(err, RqtapError::Attach { .. }));
                assert_eq!(err.exit_code(), ENOENT);
            }
            Stage::Channel => assert!(matches!(err, RqtapError::Channel(_))),
            Stage::Poll => assert!(matches!(err, RqtapError::Poll(_))),
        }
        assert_ne!(err.exit_code(), 0);
    }
}

#[tokio::test]
async fn test_clean_run_releases_everything_once() {
    let ring = FakeRing::with_capacity(4);
    ring.produce(4, 2);
    let host = FakeHost::new(ring);
    let calls = host.calls.clone();

    let (consumer, result, _) = run_collecting(host, 1).await;
    result.unwrap();

    for counter in [
        &calls.opened,
        &calls.attached,
        &calls.channels,
        &calls.released,
        &calls.detached,
        &calls.destroyed,
    ] {
        assert_eq!(Calls::get(counter), 1);
    }
    assert_eq!(consumer.host().dropped_samples(), Some(0));
}

#[test]
fn test_error_types() {
    let err = RqtapError::KernelVersionTooOld {
        version: "5.4.0".to_string(),
        min_version: "5.8".to_string(),
    };

    assert!(err.to_string().contains("5.4.0"));
    assert!(err.to_string().contains("5.8"));
    assert_eq!(err.exit_code(), 1);
}

#[test]
fn test_version_const() {
    assert!(!rqtap::VERSION.is_empty());
}
