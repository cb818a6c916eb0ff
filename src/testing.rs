//! In-memory transports and sources for unit tests

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{AppError, Result};
use crate::playout::driver::Cadence;
use crate::playout::source::{MediaUnit, PlayoutSource, SourceProvider};
use crate::webrtc::capability::{CapabilitySet, CodecSpec, MediaKind};
use crate::webrtc::config::TransportPolicy;
use crate::webrtc::signaling::{ConnectionState, SdpAnswer, SdpOffer};
use crate::webrtc::transport::{
    FeedbackSource, MediaSample, MediaTransport, OutboundTrack, SampleSink, StateChangeHandler,
    TransportFactory,
};

/// Source backed by a queue of results
pub struct VecSource {
    items: VecDeque<Result<MediaUnit>>,
}

impl VecSource {
    pub fn units(n: usize) -> Self {
        Self {
            items: (0..n)
                .map(|i| {
                    Ok(MediaUnit {
                        data: Bytes::from(vec![i as u8; 4]),
                        timing_mark: None,
                    })
                })
                .collect(),
        }
    }

    pub fn marks(marks: &[u64]) -> Self {
        Self {
            items: marks
                .iter()
                .map(|m| {
                    Ok(MediaUnit {
                        data: Bytes::from_static(b"page"),
                        timing_mark: Some(*m),
                    })
                })
                .collect(),
        }
    }

    pub fn then_error(mut self, msg: &str) -> Self {
        self.items
            .push_back(Err(AppError::PlayoutError(msg.to_string())));
        self
    }
}

impl PlayoutSource for VecSource {
    fn next_unit(&mut self) -> Result<Option<MediaUnit>> {
        self.items.pop_front().transpose()
    }
}

/// Sink that records every write with its time
pub struct RecordingSink {
    writes: Mutex<Vec<(Instant, MediaSample)>>,
    fail_after: AtomicUsize,
    closed: AtomicBool,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self {
            writes: Mutex::new(Vec::new()),
            fail_after: AtomicUsize::new(usize::MAX),
            closed: AtomicBool::new(false),
        }
    }

    pub fn fail_after(&self, n: usize) {
        self.fail_after.store(n, Ordering::SeqCst);
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn count(&self) -> usize {
        self.writes.lock().len()
    }

    pub fn write_times(&self) -> Vec<Instant> {
        self.writes.lock().iter().map(|(t, _)| *t).collect()
    }

    pub fn durations(&self) -> Vec<Duration> {
        self.writes.lock().iter().map(|(_, s)| s.duration).collect()
    }
}

#[async_trait]
impl SampleSink for RecordingSink {
    async fn write_sample(&self, sample: &MediaSample) -> Result<()> {
        let mut writes = self.writes.lock();
        if self.closed.load(Ordering::SeqCst) || writes.len() >= self.fail_after.load(Ordering::SeqCst)
        {
            return Err(AppError::TransportError("track closed".to_string()));
        }
        writes.push((Instant::now(), sample.clone()));
        Ok(())
    }
}

/// Feedback source that yields scripted batch sizes, then fails or blocks
pub struct ScriptedFeedback {
    batches: Mutex<VecDeque<usize>>,
    closed: CancellationToken,
    pending: bool,
}

impl ScriptedFeedback {
    pub fn new(batches: Vec<usize>) -> Self {
        Self {
            batches: Mutex::new(batches.into()),
            closed: CancellationToken::new(),
            pending: false,
        }
    }

    /// Never yields until the token is cancelled
    pub fn pending() -> Self {
        Self::until_closed(CancellationToken::new())
    }

    pub fn until_closed(closed: CancellationToken) -> Self {
        Self {
            batches: Mutex::new(VecDeque::new()),
            closed,
            pending: true,
        }
    }
}

#[async_trait]
impl FeedbackSource for ScriptedFeedback {
    async fn read_feedback(&self, _buf: &mut [u8]) -> Result<usize> {
        let next = self.batches.lock().pop_front();
        if let Some(n) = next {
            return Ok(n);
        }
        if self.pending {
            self.closed.cancelled().await;
        }
        Err(AppError::TransportError("sender closed".to_string()))
    }
}

/// Transport that records calls and lets tests drive state changes
pub struct MockTransport {
    state: Mutex<ConnectionState>,
    handler: Mutex<Option<StateChangeHandler>>,
    closed: CancellationToken,
    close_calls: AtomicUsize,
    sinks: Mutex<Vec<Arc<RecordingSink>>>,
    fail_negotiate: bool,
    negotiate_delay: Duration,
    transition_on_read: Mutex<Option<ConnectionState>>,
}

impl MockTransport {
    fn new(
        fail_negotiate: bool,
        negotiate_delay: Duration,
        transition_on_read: Option<ConnectionState>,
    ) -> Self {
        Self {
            state: Mutex::new(ConnectionState::New),
            handler: Mutex::new(None),
            closed: CancellationToken::new(),
            close_calls: AtomicUsize::new(0),
            sinks: Mutex::new(Vec::new()),
            fail_negotiate,
            negotiate_delay,
            transition_on_read: Mutex::new(transition_on_read),
        }
    }

    /// Simulate a state transition reported by the network stack
    pub fn emit(&self, state: ConnectionState) {
        *self.state.lock() = state;
        if let Some(handler) = self.handler.lock().as_ref() {
            handler(state);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    pub fn sinks(&self) -> Vec<Arc<RecordingSink>> {
        self.sinks.lock().clone()
    }

    pub fn samples_written(&self) -> usize {
        self.sinks.lock().iter().map(|s| s.count()).sum()
    }
}

#[async_trait]
impl MediaTransport for MockTransport {
    async fn add_outbound_track(&self, codec: &CodecSpec) -> Result<OutboundTrack> {
        let sink = Arc::new(RecordingSink::new());
        self.sinks.lock().push(sink.clone());
        Ok(OutboundTrack {
            kind: codec.kind,
            sink,
            feedback: Arc::new(ScriptedFeedback::until_closed(self.closed.clone())),
        })
    }

    fn on_state_change(&self, handler: StateChangeHandler) {
        *self.handler.lock() = Some(handler);
    }

    fn current_state(&self) -> ConnectionState {
        let current = *self.state.lock();
        let transition = self.transition_on_read.lock().take();
        if let Some(next) = transition {
            self.emit(next);
            // Give the session event loop time to act before the caller resumes
            std::thread::sleep(Duration::from_millis(50));
        }
        current
    }

    async fn negotiate(&self, offer: SdpOffer) -> Result<SdpAnswer> {
        if !self.negotiate_delay.is_zero() {
            tokio::time::sleep(self.negotiate_delay).await;
        }
        if self.fail_negotiate {
            return Err(AppError::TransportError("Invalid SDP offer".to_string()));
        }
        Ok(SdpAnswer::new(format!("answer:{}", offer.sdp)))
    }

    async fn close(&self) -> Result<()> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.closed.cancel();
        for sink in self.sinks.lock().iter() {
            sink.close();
        }
        *self.state.lock() = ConnectionState::Closed;
        Ok(())
    }
}

/// Factory handing out [`MockTransport`]s
#[derive(Default)]
pub struct MockTransportFactory {
    transports: Mutex<Vec<Arc<MockTransport>>>,
    policies: Mutex<Vec<TransportPolicy>>,
    fail_negotiate: AtomicBool,
    negotiate_delay: Mutex<Duration>,
    transition_on_read: Mutex<Option<ConnectionState>>,
}

impl MockTransportFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_negotiate(&self, fail: bool) {
        self.fail_negotiate.store(fail, Ordering::SeqCst);
    }

    pub fn set_negotiate_delay(&self, delay: Duration) {
        *self.negotiate_delay.lock() = delay;
    }

    /// New transports move to `state` right after their state is first read
    pub fn set_transition_on_state_read(&self, state: Option<ConnectionState>) {
        *self.transition_on_read.lock() = state;
    }

    pub fn transports(&self) -> Vec<Arc<MockTransport>> {
        self.transports.lock().clone()
    }

    pub fn last(&self) -> Arc<MockTransport> {
        self.transports.lock().last().cloned().expect("no transport built")
    }

    pub fn policies(&self) -> Vec<TransportPolicy> {
        self.policies.lock().clone()
    }
}

#[async_trait]
impl TransportFactory for MockTransportFactory {
    async fn build(
        &self,
        policy: &TransportPolicy,
        capabilities: &CapabilitySet,
    ) -> Result<Arc<dyn MediaTransport>> {
        capabilities.validate(&policy.media)?;
        let transport = Arc::new(MockTransport::new(
            self.fail_negotiate.load(Ordering::SeqCst),
            *self.negotiate_delay.lock(),
            *self.transition_on_read.lock(),
        ));
        self.transports.lock().push(transport.clone());
        self.policies.lock().push(policy.clone());
        Ok(transport)
    }
}

/// Source provider producing fixed-size in-memory streams
pub struct MockSources {
    units: usize,
    frame: Duration,
    missing: Mutex<Option<MediaKind>>,
}

impl MockSources {
    pub fn new(units: usize, frame: Duration) -> Self {
        Self {
            units,
            frame,
            missing: Mutex::new(None),
        }
    }

    /// Make opening `kind` fail as if the file were absent
    pub fn set_missing(&self, kind: Option<MediaKind>) {
        *self.missing.lock() = kind;
    }
}

impl SourceProvider for MockSources {
    fn open(&self, kind: MediaKind) -> Result<Box<dyn PlayoutSource>> {
        if *self.missing.lock() == Some(kind) {
            return Err(AppError::PlayoutError(format!("no {} file", kind)));
        }
        Ok(Box::new(VecSource::units(self.units)))
    }

    fn cadence(&self, _kind: MediaKind) -> Cadence {
        Cadence::Fixed(self.frame)
    }
}

/// Poll `check` until it holds or the timeout elapses
pub async fn eventually(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}
