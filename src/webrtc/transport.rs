//! Media transport abstraction
//!
//! The session manager only talks to these traits. [`super::peer`] implements
//! them on top of webrtc-rs.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use super::capability::{CapabilitySet, CodecSpec, MediaKind};
use super::config::TransportPolicy;
use super::signaling::{ConnectionState, SdpAnswer, SdpOffer};
use crate::error::Result;

/// Callback invoked on every transport state transition
pub type StateChangeHandler = Box<dyn Fn(ConnectionState) + Send + Sync>;

/// One decoded unit ready to be packetized
#[derive(Debug, Clone)]
pub struct MediaSample {
    pub data: Bytes,
    pub duration: Duration,
}

/// Write side of an outbound track
#[async_trait]
pub trait SampleSink: Send + Sync {
    async fn write_sample(&self, sample: &MediaSample) -> Result<()>;
}

/// Incoming control packets for an outbound track
#[async_trait]
pub trait FeedbackSource: Send + Sync {
    /// Read one batch into `buf`, returning the number of packets
    async fn read_feedback(&self, buf: &mut [u8]) -> Result<usize>;
}

/// Handles returned when a track is attached to a transport
pub struct OutboundTrack {
    pub kind: MediaKind,
    pub sink: Arc<dyn SampleSink>,
    pub feedback: Arc<dyn FeedbackSource>,
}

impl std::fmt::Debug for OutboundTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundTrack")
            .field("kind", &self.kind)
            .finish()
    }
}

/// A negotiated peer connection
#[async_trait]
pub trait MediaTransport: Send + Sync {
    async fn add_outbound_track(&self, codec: &CodecSpec) -> Result<OutboundTrack>;

    /// Replace the state-change callback
    fn on_state_change(&self, handler: StateChangeHandler);

    fn current_state(&self) -> ConnectionState;

    /// Apply the remote offer and return the answer once gathering completes
    async fn negotiate(&self, offer: SdpOffer) -> Result<SdpAnswer>;

    async fn close(&self) -> Result<()>;
}

/// Constructs configured but unconnected transports
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn build(
        &self,
        policy: &TransportPolicy,
        capabilities: &CapabilitySet,
    ) -> Result<Arc<dyn MediaTransport>>;
}
