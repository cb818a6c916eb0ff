//! Leaky-bucket RTP pacer
//!
//! Outbound RTP passes through [`PacedWriter`], which delays each packet so the
//! long-run send rate stays at the shared [`TargetBitrate`]. Up to `max_burst`
//! worth of idle credit may be spent immediately.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;
use webrtc::interceptor::stream_info::StreamInfo;
use webrtc::interceptor::{
    Attributes, Interceptor, InterceptorBuilder, RTCPReader, RTCPWriter, RTPReader, RTPWriter,
};

use super::InterceptorResult;

/// RTP fixed header length
const RTP_HEADER_LEN: usize = 12;

/// Send-rate target shared between the estimator and the pacer
#[derive(Debug)]
pub struct TargetBitrate {
    bps: AtomicU64,
    min: u64,
    max: u64,
}

impl TargetBitrate {
    pub fn new(initial: u64, min: u64, max: u64) -> Self {
        let min = min.max(1);
        let max = max.max(min);
        Self {
            bps: AtomicU64::new(initial.clamp(min, max)),
            min,
            max,
        }
    }

    pub fn get(&self) -> u64 {
        self.bps.load(Ordering::Relaxed)
    }

    /// Store a new target, clamped to the configured range
    pub fn set(&self, bps: u64) -> u64 {
        let clamped = bps.clamp(self.min, self.max);
        self.bps.store(clamped, Ordering::Relaxed);
        clamped
    }

    pub fn min(&self) -> u64 {
        self.min
    }

    pub fn max(&self) -> u64 {
        self.max
    }
}

/// Token bucket expressed as the earliest time the next byte may leave
#[derive(Debug)]
struct LeakyBucket {
    target: Arc<TargetBitrate>,
    max_burst: Duration,
    next_send: Mutex<Option<Instant>>,
}

impl LeakyBucket {
    /// Reserve a send slot for `bytes`, returning how long to wait before sending.
    fn reserve(&self, bytes: usize, now: Instant) -> Duration {
        let rate = self.target.get().max(1);
        let cost = Duration::from_secs_f64(bytes as f64 * 8.0 / rate as f64);
        let earliest = now.checked_sub(self.max_burst).unwrap_or(now);

        let mut next = self.next_send.lock();
        let start = match *next {
            Some(t) if t > earliest => t,
            _ => earliest,
        };
        *next = Some(start + cost);
        start.saturating_duration_since(now)
    }
}

/// Builder for the pacing interceptor
pub struct PacerBuilder {
    target: Arc<TargetBitrate>,
    max_burst: Duration,
}

impl PacerBuilder {
    pub fn new(target: Arc<TargetBitrate>, max_burst: Duration) -> Self {
        Self { target, max_burst }
    }
}

impl InterceptorBuilder for PacerBuilder {
    fn build(&self, _id: &str) -> InterceptorResult<Arc<dyn Interceptor + Send + Sync>> {
        Ok(Arc::new(Pacer {
            bucket: Arc::new(LeakyBucket {
                target: self.target.clone(),
                max_burst: self.max_burst,
                next_send: Mutex::new(None),
            }),
        }))
    }
}

/// Pacing interceptor. One bucket is shared by all local streams.
pub struct Pacer {
    bucket: Arc<LeakyBucket>,
}

#[async_trait]
impl Interceptor for Pacer {
    async fn bind_rtcp_reader(
        &self,
        reader: Arc<dyn RTCPReader + Send + Sync>,
    ) -> Arc<dyn RTCPReader + Send + Sync> {
        reader
    }

    async fn bind_rtcp_writer(
        &self,
        writer: Arc<dyn RTCPWriter + Send + Sync>,
    ) -> Arc<dyn RTCPWriter + Send + Sync> {
        writer
    }

    async fn bind_local_stream(
        &self,
        _info: &StreamInfo,
        writer: Arc<dyn RTPWriter + Send + Sync>,
    ) -> Arc<dyn RTPWriter + Send + Sync> {
        Arc::new(PacedWriter {
            bucket: self.bucket.clone(),
            next: writer,
        })
    }

    async fn unbind_local_stream(&self, _info: &StreamInfo) {}

    async fn bind_remote_stream(
        &self,
        _info: &StreamInfo,
        reader: Arc<dyn RTPReader + Send + Sync>,
    ) -> Arc<dyn RTPReader + Send + Sync> {
        reader
    }

    async fn unbind_remote_stream(&self, _info: &StreamInfo) {}

    async fn close(&self) -> InterceptorResult<()> {
        Ok(())
    }
}

struct PacedWriter {
    bucket: Arc<LeakyBucket>,
    next: Arc<dyn RTPWriter + Send + Sync>,
}

#[async_trait]
impl RTPWriter for PacedWriter {
    async fn write(
        &self,
        pkt: &webrtc::rtp::packet::Packet,
        attributes: &Attributes,
    ) -> InterceptorResult<usize> {
        let size = RTP_HEADER_LEN + pkt.header.csrc.len() * 4 + pkt.payload.len();
        let wait = self.bucket.reserve(size, Instant::now());
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
        self.next.write(pkt, attributes).await
    }
}
