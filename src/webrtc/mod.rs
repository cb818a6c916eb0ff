//! WebRTC transport layer for WHEP playout
//!
//! Architecture:
//! ```text
//! POST offer
//!     |
//!     v
//! SessionManager ---- TransportFactory::build(policy, capabilities)
//!     |                        |
//!     |                        v
//!     |               FeedbackPipeline (pacer -> fec -> delay -> nack -> reports -> bwe)
//!     |                        |
//!     v                        v
//! PlayoutDriver x2 ----> MediaTransport (webrtc-rs peer connection)
//!     ^                        |
//!     +---- ready gate <-------+ state changes
//! ```

pub mod bwe;
pub mod capability;
pub mod config;
pub mod fec;
pub mod pacer;
pub mod peer;
pub mod pipeline;
pub mod playout_delay;
pub mod session;
pub mod signaling;
pub mod track;
pub mod transport;

pub use capability::{CapabilitySet, CodecSpec, MediaKind};
pub use config::{IceProtocolPreference, PolicyOverrides, Role, TransportPolicy};
pub use peer::RtcTransportFactory;
pub use pipeline::{FeedbackPipeline, StageKind};
pub use session::{SessionInfo, SessionManager};
pub use signaling::{ConnectionState, SdpAnswer, SdpOffer};
pub use transport::{MediaTransport, TransportFactory};

/// Result type of the webrtc-rs interceptor traits
pub(crate) type InterceptorResult<T> = std::result::Result<T, webrtc::interceptor::Error>;
