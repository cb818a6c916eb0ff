//! Loss-based bandwidth estimation
//!
//! Watches incoming RTCP for transport-wide feedback, receiver reports and
//! REMB, and adjusts the pacer's [`TargetBitrate`].

use std::sync::Arc;

use async_trait::async_trait;
use tracing::trace;
use webrtc::interceptor::stream_info::StreamInfo;
use webrtc::interceptor::{
    Attributes, Interceptor, InterceptorBuilder, RTCPReader, RTCPWriter, RTPReader, RTPWriter,
};
use webrtc::rtcp::payload_feedbacks::receiver_estimated_maximum_bitrate::ReceiverEstimatedMaximumBitrate;
use webrtc::rtcp::receiver_report::ReceiverReport;
use webrtc::rtcp::transport_feedbacks::transport_layer_cc::TransportLayerCc;

use super::pacer::TargetBitrate;
use super::InterceptorResult;

/// Loss above which the target is reduced
const HIGH_LOSS: f64 = 0.10;
/// Loss below which the target is increased
const LOW_LOSS: f64 = 0.02;
const INCREASE_FACTOR: f64 = 1.05;

/// Loss fraction reported by one transport-wide feedback packet
pub fn loss_from_counts(status_count: u16, received: usize) -> Option<f64> {
    if status_count == 0 {
        return None;
    }
    let received = received.min(status_count as usize);
    Some(1.0 - received as f64 / status_count as f64)
}

/// Loss-based controller over a shared target bitrate
#[derive(Debug, Clone)]
pub struct LossBasedEstimator {
    target: Arc<TargetBitrate>,
}

impl LossBasedEstimator {
    pub fn new(target: Arc<TargetBitrate>) -> Self {
        Self { target }
    }

    pub fn on_loss(&self, loss: f64) -> u64 {
        let current = self.target.get() as f64;
        let next = if loss > HIGH_LOSS {
            current * (1.0 - 0.5 * loss)
        } else if loss < LOW_LOSS {
            current * INCREASE_FACTOR
        } else {
            current
        };
        self.target.set(next as u64)
    }

    /// Receiver-side estimate caps the target
    pub fn on_remb(&self, bitrate: f64) -> u64 {
        let current = self.target.get();
        if bitrate.is_finite() && bitrate > 0.0 && (bitrate as u64) < current {
            self.target.set(bitrate as u64)
        } else {
            current
        }
    }

    fn observe(&self, pkt: &(dyn webrtc::rtcp::packet::Packet + Send + Sync)) {
        let any = pkt.as_any();
        if let Some(cc) = any.downcast_ref::<TransportLayerCc>() {
            if let Some(loss) = loss_from_counts(cc.packet_status_count, cc.recv_deltas.len()) {
                let bps = self.on_loss(loss);
                trace!("TWCC loss {:.3}, target {} bps", loss, bps);
            }
        } else if let Some(rr) = any.downcast_ref::<ReceiverReport>() {
            for report in &rr.reports {
                let loss = report.fraction_lost as f64 / 256.0;
                let bps = self.on_loss(loss);
                trace!("RR loss {:.3}, target {} bps", loss, bps);
            }
        } else if let Some(remb) = any.downcast_ref::<ReceiverEstimatedMaximumBitrate>() {
            let bps = self.on_remb(remb.bitrate as f64);
            trace!("REMB {} bps, target {} bps", remb.bitrate, bps);
        }
    }
}

/// Builder for the estimator interceptor
pub struct BandwidthEstimatorBuilder {
    estimator: LossBasedEstimator,
}

impl BandwidthEstimatorBuilder {
    pub fn new(target: Arc<TargetBitrate>) -> Self {
        Self {
            estimator: LossBasedEstimator::new(target),
        }
    }
}

impl InterceptorBuilder for BandwidthEstimatorBuilder {
    fn build(&self, _id: &str) -> InterceptorResult<Arc<dyn Interceptor + Send + Sync>> {
        Ok(Arc::new(BandwidthEstimator {
            estimator: self.estimator.clone(),
        }))
    }
}

pub struct BandwidthEstimator {
    estimator: LossBasedEstimator,
}

#[async_trait]
impl Interceptor for BandwidthEstimator {
    async fn bind_rtcp_reader(
        &self,
        reader: Arc<dyn RTCPReader + Send + Sync>,
    ) -> Arc<dyn RTCPReader + Send + Sync> {
        Arc::new(FeedbackObserver {
            estimator: self.estimator.clone(),
            next: reader,
        })
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
        writer
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

struct FeedbackObserver {
    estimator: LossBasedEstimator,
    next: Arc<dyn RTCPReader + Send + Sync>,
}

#[async_trait]
impl RTCPReader for FeedbackObserver {
    async fn read(
        &self,
        buf: &mut [u8],
        attributes: &Attributes,
    ) -> InterceptorResult<(Vec<Box<dyn webrtc::rtcp::packet::Packet + Send + Sync>>, Attributes)>
    {
        let (pkts, attrs) = self.next.read(buf, attributes).await?;
        for pkt in &pkts {
            self.estimator.observe(pkt.as_ref());
        }
        Ok((pkts, attrs))
    }
}
