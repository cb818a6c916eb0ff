//! Adapters from webrtc-rs tracks and senders to the transport traits

use std::sync::Arc;

use async_trait::async_trait;
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use super::transport::{FeedbackSource, MediaSample, SampleSink};
use crate::error::{AppError, Result};

/// Sample writer over a static-sample track; packetization happens inside webrtc-rs
pub struct StaticSampleSink {
    track: Arc<TrackLocalStaticSample>,
}

impl StaticSampleSink {
    pub fn new(track: Arc<TrackLocalStaticSample>) -> Self {
        Self { track }
    }
}

#[async_trait]
impl SampleSink for StaticSampleSink {
    async fn write_sample(&self, sample: &MediaSample) -> Result<()> {
        self.track
            .write_sample(&Sample {
                data: sample.data.clone(),
                duration: sample.duration,
                ..Default::default()
            })
            .await
            .map_err(|e| {
                AppError::TransportError(format!(
                    "Failed to write sample to track {}: {}",
                    self.track.id(),
                    e
                ))
            })
    }
}

/// RTCP reader over an RTP sender
pub struct SenderFeedback {
    sender: Arc<RTCRtpSender>,
}

impl SenderFeedback {
    pub fn new(sender: Arc<RTCRtpSender>) -> Self {
        Self { sender }
    }
}

#[async_trait]
impl FeedbackSource for SenderFeedback {
    async fn read_feedback(&self, buf: &mut [u8]) -> Result<usize> {
        let (packets, _) = self
            .sender
            .read(buf)
            .await
            .map_err(|e| AppError::TransportError(format!("RTCP read failed: {}", e)))?;
        Ok(packets.len())
    }
}
