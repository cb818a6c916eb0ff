//! Transport policy

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use webrtc::ice::network_type::NetworkType;
use webrtc::ice::udp_mux::UDPMux;

use super::capability::MediaKind;
use crate::error::AppError;

/// Which side of the media flow this transport is on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Send,
    Receive,
}

/// ICE candidate protocol restriction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IceProtocolPreference {
    #[default]
    Any,
    UdpOnly,
    TcpOnly,
}

impl IceProtocolPreference {
    pub fn network_types(&self) -> Vec<NetworkType> {
        match self {
            Self::Any => vec![
                NetworkType::Udp4,
                NetworkType::Udp6,
                NetworkType::Tcp4,
                NetworkType::Tcp6,
            ],
            Self::UdpOnly => vec![NetworkType::Udp4, NetworkType::Udp6],
            Self::TcpOnly => vec![NetworkType::Tcp4, NetworkType::Tcp6],
        }
    }
}

impl FromStr for IceProtocolPreference {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "any" => Ok(Self::Any),
            "udp" | "udp-only" => Ok(Self::UdpOnly),
            "tcp" | "tcp-only" => Ok(Self::TcpOnly),
            other => Err(AppError::BadRequest(format!(
                "unknown transport preference '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for IceProtocolPreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => write!(f, "any"),
            Self::UdpOnly => write!(f, "udp-only"),
            Self::TcpOnly => write!(f, "tcp-only"),
        }
    }
}

/// NACK buffer and timing settings
#[derive(Debug, Clone)]
pub struct LossRecoveryConfig {
    /// Packets kept for retransmission (power of two, 64..=32768)
    pub responder_size: u16,
    /// Receive-side tracking window (power of two, 64..=32768)
    pub generator_size: u16,
    /// Most recent packets not yet considered lost
    pub generator_skip_last_n: u16,
    /// How often missing packets are reported
    pub generator_interval: Duration,
}

impl Default for LossRecoveryConfig {
    fn default() -> Self {
        Self {
            responder_size: 1024,
            generator_size: 512,
            generator_skip_last_n: 0,
            generator_interval: Duration::from_millis(40),
        }
    }
}

/// Send-side rate limits in bits per second
#[derive(Debug, Clone)]
pub struct PacingConfig {
    pub initial_bitrate: u64,
    pub min_bitrate: u64,
    pub max_bitrate: u64,
    /// Idle credit that may be spent without delay
    pub max_burst: Duration,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            initial_bitrate: 2_000_000,
            min_bitrate: 300_000,
            max_bitrate: 8_000_000,
            max_burst: Duration::from_millis(40),
        }
    }
}

/// Receiver jitter-buffer bounds advertised on video packets
#[derive(Debug, Clone)]
pub struct PlayoutDelayConfig {
    pub min: Duration,
    pub max: Duration,
}

impl Default for PlayoutDelayConfig {
    fn default() -> Self {
        Self {
            min: Duration::from_millis(500),
            max: Duration::from_millis(1500),
        }
    }
}

/// Local ICE socket shared by every session
#[derive(Clone, Default)]
pub struct LocalMuxes {
    pub udp: Option<Arc<dyn UDPMux + Send + Sync>>,
}

impl fmt::Debug for LocalMuxes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalMuxes")
            .field("udp", &self.udp.is_some())
            .finish()
    }
}

/// Settings applied when building one transport
#[derive(Debug, Clone)]
pub struct TransportPolicy {
    pub role: Role,
    pub ice_protocol: IceProtocolPreference,
    pub ice_lite: bool,
    pub loss_recovery: LossRecoveryConfig,
    pub fec_enabled: bool,
    /// Media packets protected by one repair packet (1..=15)
    pub fec_group_size: usize,
    pub pacing: PacingConfig,
    /// `None` leaves the playout-delay extension off
    pub playout_delay: Option<PlayoutDelayConfig>,
    pub report_interval: Duration,
    /// Public addresses advertised instead of the host ones
    pub nat_mapped_addresses: Vec<String>,
    pub muxes: LocalMuxes,
    pub stun_servers: Vec<String>,
    pub gathering_timeout: Duration,
    /// Kinds the transport must be able to carry
    pub media: Vec<MediaKind>,
}

impl Default for TransportPolicy {
    fn default() -> Self {
        Self {
            role: Role::Send,
            ice_protocol: IceProtocolPreference::Any,
            ice_lite: false,
            loss_recovery: LossRecoveryConfig::default(),
            fec_enabled: true,
            fec_group_size: 5,
            pacing: PacingConfig::default(),
            playout_delay: Some(PlayoutDelayConfig::default()),
            report_interval: Duration::from_secs(1),
            nat_mapped_addresses: vec![],
            muxes: LocalMuxes::default(),
            stun_servers: vec![],
            gathering_timeout: Duration::from_secs(5),
            media: vec![MediaKind::Audio, MediaKind::Video],
        }
    }
}

impl TransportPolicy {
    /// FEC runs only on the send side, and never over TCP
    pub fn fec_active(&self) -> bool {
        self.fec_enabled
            && self.role == Role::Send
            && self.ice_protocol != IceProtocolPreference::TcpOnly
    }

    pub fn with_overrides(&self, overrides: &PolicyOverrides) -> Self {
        let mut policy = self.clone();
        if let Some(protocol) = overrides.ice_protocol {
            policy.ice_protocol = protocol;
        }
        if let Some(fec) = overrides.fec_enabled {
            policy.fec_enabled = fec;
        }
        policy
    }
}

/// Per-request adjustments to the base policy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PolicyOverrides {
    pub ice_protocol: Option<IceProtocolPreference>,
    pub fec_enabled: Option<bool>,
}

impl PolicyOverrides {
    /// Parse `transport` and `flexfec` query values
    pub fn parse(transport: Option<&str>, flexfec: Option<&str>) -> Result<Self, AppError> {
        let ice_protocol = transport.map(str::parse).transpose()?;
        let fec_enabled = match flexfec.map(|v| v.to_ascii_lowercase()) {
            None => None,
            Some(v) if v == "disable" || v == "off" || v == "false" => Some(false),
            Some(v) if v == "enable" || v == "on" || v == "true" => Some(true),
            Some(v) => {
                return Err(AppError::BadRequest(format!(
                    "unknown flexfec value '{}'",
                    v
                )))
            }
        };
        Ok(Self {
            ice_protocol,
            fec_enabled,
        })
    }
}
