//! Real-time playout of one source onto one track

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::gate::ReadyGate;
use super::source::{MediaUnit, PlayoutSource};
use crate::error::{AppError, Result};
use crate::webrtc::capability::MediaKind;
use crate::webrtc::transport::{FeedbackSource, MediaSample, SampleSink};

/// Read buffer for one RTCP batch
const FEEDBACK_BUFFER_SIZE: usize = 1500;

/// How long each unit occupies on the timeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cadence {
    /// Same duration for every unit
    Fixed(Duration),
    /// Derived from the difference between consecutive timing marks
    Embedded { clock_rate: u32 },
}

/// Turns timing marks into sample durations
#[derive(Debug)]
pub struct CadenceClock {
    cadence: Cadence,
    last_mark: u64,
}

impl CadenceClock {
    pub fn new(cadence: Cadence) -> Self {
        Self {
            cadence,
            last_mark: 0,
        }
    }

    pub fn duration_for(&mut self, mark: Option<u64>) -> Duration {
        match self.cadence {
            Cadence::Fixed(d) => d,
            Cadence::Embedded { clock_rate } => match mark {
                // u64::MAX marks a page on which no packet completes
                Some(mark) if mark != u64::MAX && clock_rate > 0 => {
                    let delta = mark.saturating_sub(self.last_mark);
                    self.last_mark = mark;
                    let micros = delta as u128 * 1_000_000 / clock_rate as u128;
                    Duration::from_micros(micros.min(u64::MAX as u128) as u64)
                }
                _ => Duration::ZERO,
            },
        }
    }
}

/// Why a driver stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    EndOfStream,
    TrackClosed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlayoutSummary {
    pub units_sent: u64,
    pub reason: StopReason,
}

/// Pull the next unit on the blocking pool so file reads never stall the runtime
async fn read_unit(
    mut source: Box<dyn PlayoutSource>,
) -> Result<(Box<dyn PlayoutSource>, Option<MediaUnit>)> {
    tokio::task::spawn_blocking(move || {
        let unit = source.next_unit()?;
        Ok((source, unit))
    })
    .await
    .map_err(|e| AppError::PlayoutError(format!("source read task failed: {}", e)))?
}

/// Paces units from a source onto a sink once the gate opens
pub struct PlayoutDriver {
    label: String,
    source: Box<dyn PlayoutSource>,
    sink: Arc<dyn SampleSink>,
    cadence: Cadence,
    gate: ReadyGate,
    shutdown: CancellationToken,
}

impl PlayoutDriver {
    pub fn new(
        label: impl Into<String>,
        source: Box<dyn PlayoutSource>,
        sink: Arc<dyn SampleSink>,
        cadence: Cadence,
        gate: ReadyGate,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            label: label.into(),
            source,
            sink,
            cadence,
            gate,
            shutdown,
        }
    }

    /// Run until end of stream, a failed write, or shutdown.
    ///
    /// Returns an error only when the source fails to decode.
    pub async fn run(self) -> Result<PlayoutSummary> {
        let mut source = self.source;
        let mut sent = 0u64;
        let summary = |units_sent, reason| PlayoutSummary { units_sent, reason };

        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => {
                debug!("{} playout cancelled before transport was ready", self.label);
                return Ok(summary(sent, StopReason::Cancelled));
            }
            _ = self.gate.wait() => {}
        }
        info!("{} playout started", self.label);

        let mut clock = CadenceClock::new(self.cadence);
        let mut deadline = Instant::now();

        loop {
            let unit = match read_unit(source).await {
                Ok((next, Some(unit))) => {
                    source = next;
                    unit
                }
                Ok((_, None)) => {
                    info!("{} playout reached end of stream after {} units", self.label, sent);
                    return Ok(summary(sent, StopReason::EndOfStream));
                }
                Err(e) => {
                    warn!("{} playout stopped after {} units: {}", self.label, sent, e);
                    return Err(e);
                }
            };
            let duration = clock.duration_for(unit.timing_mark);

            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    debug!("{} playout cancelled after {} units", self.label, sent);
                    return Ok(summary(sent, StopReason::Cancelled));
                }
                _ = sleep_until(deadline) => {}
            }

            let sample = MediaSample {
                data: unit.data,
                duration,
            };
            if let Err(e) = self.sink.write_sample(&sample).await {
                debug!("{} track closed after {} units: {}", self.label, sent, e);
                return Ok(summary(sent, StopReason::TrackClosed));
            }
            sent += 1;
            deadline += duration;
        }
    }
}

/// Read and discard feedback until the source fails or shutdown.
///
/// Returns the number of control packets seen.
pub async fn drain_feedback(
    kind: MediaKind,
    feedback: Arc<dyn FeedbackSource>,
    shutdown: CancellationToken,
) -> u64 {
    let mut buf = vec![0u8; FEEDBACK_BUFFER_SIZE];
    let mut packets = 0u64;
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            result = feedback.read_feedback(&mut buf) => match result {
                Ok(n) => packets += n as u64,
                Err(e) => {
                    debug!("{} feedback drain stopped: {}", kind, e);
                    break;
                }
            }
        }
    }
    debug!("{} feedback drain read {} packets", kind, packets);
    packets
}
