use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::playout::FileSources;
use crate::webrtc::config::{
    LocalMuxes, LossRecoveryConfig, PacingConfig, PlayoutDelayConfig, Role, TransportPolicy,
};
use crate::webrtc::IceProtocolPreference;

/// Main server configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// HTTP signaling listener
    pub web: WebConfig,
    /// ICE agent settings
    pub ice: IceConfig,
    /// Source files and playout timing
    pub media: FileSources,
    /// Feedback pipeline tuning
    pub feedback: FeedbackConfig,
}

/// Web server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    pub bind_address: String,
    pub http_port: u16,
    /// Serve signaling over TLS
    pub https_enabled: bool,
    /// PEM certificate; a self-signed one is generated when unset
    pub ssl_cert_path: Option<String>,
    pub ssl_key_path: Option<String>,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            http_port: 8082,
            https_enabled: false,
            ssl_cert_path: None,
            ssl_key_path: None,
        }
    }
}

/// ICE configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IceConfig {
    /// Shared UDP port for every session; 0 lets each session pick its own
    pub udp_port: u16,
    /// Addresses advertised as host candidates
    pub nat_1to1_ips: Vec<String>,
    /// Enable ICE lite mode
    pub lite: bool,
    pub protocol: IceProtocolPreference,
    pub stun_servers: Vec<String>,
    /// ICE candidate gathering timeout (ms)
    pub gathering_timeout_ms: u64,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            udp_port: 15060,
            nat_1to1_ips: vec!["127.0.0.1".to_string()],
            lite: true,
            protocol: IceProtocolPreference::Any,
            stun_servers: vec![],
            gathering_timeout_ms: 5000,
        }
    }
}

/// Feedback pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedbackConfig {
    pub fec_enabled: bool,
    pub fec_group_size: usize,
    pub nack_responder_size: u16,
    pub nack_generator_size: u16,
    pub nack_generator_skip_last_n: u16,
    pub nack_interval_ms: u64,
    pub report_interval_ms: u64,
    pub initial_bitrate_kbps: u64,
    pub min_bitrate_kbps: u64,
    pub max_bitrate_kbps: u64,
    pub max_burst_ms: u64,
    /// Stamp video with the playout-delay extension
    pub playout_delay_enabled: bool,
    pub playout_delay_min_ms: u64,
    pub playout_delay_max_ms: u64,
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        let recovery = LossRecoveryConfig::default();
        let pacing = PacingConfig::default();
        let delay = PlayoutDelayConfig::default();
        Self {
            fec_enabled: true,
            fec_group_size: 5,
            nack_responder_size: recovery.responder_size,
            nack_generator_size: recovery.generator_size,
            nack_generator_skip_last_n: recovery.generator_skip_last_n,
            nack_interval_ms: recovery.generator_interval.as_millis() as u64,
            report_interval_ms: 1000,
            initial_bitrate_kbps: pacing.initial_bitrate / 1000,
            min_bitrate_kbps: pacing.min_bitrate / 1000,
            max_bitrate_kbps: pacing.max_bitrate / 1000,
            max_burst_ms: pacing.max_burst.as_millis() as u64,
            playout_delay_enabled: true,
            playout_delay_min_ms: delay.min.as_millis() as u64,
            playout_delay_max_ms: delay.max.as_millis() as u64,
        }
    }
}

impl ServerConfig {
    /// Reject settings that can never produce a working server
    pub fn validate(&self) -> Result<()> {
        if self.media.h264_frame_ms == 0 {
            return Err(AppError::Config("h264_frame_ms must be non-zero".to_string()));
        }
        if self.ice.gathering_timeout_ms == 0 {
            return Err(AppError::Config(
                "gathering_timeout_ms must be non-zero".to_string(),
            ));
        }
        let fb = &self.feedback;
        if fb.min_bitrate_kbps > fb.max_bitrate_kbps {
            return Err(AppError::Config(format!(
                "min bitrate {} kbps exceeds max {} kbps",
                fb.min_bitrate_kbps, fb.max_bitrate_kbps
            )));
        }
        if fb.playout_delay_enabled && fb.playout_delay_min_ms > fb.playout_delay_max_ms {
            return Err(AppError::Config(format!(
                "playout delay min {} ms exceeds max {} ms",
                fb.playout_delay_min_ms, fb.playout_delay_max_ms
            )));
        }
        Ok(())
    }

    /// Base policy for every session; per-request overrides apply on top
    pub fn transport_policy(&self, muxes: LocalMuxes) -> TransportPolicy {
        let fb = &self.feedback;
        TransportPolicy {
            role: Role::Send,
            ice_protocol: self.ice.protocol,
            ice_lite: self.ice.lite,
            loss_recovery: LossRecoveryConfig {
                responder_size: fb.nack_responder_size,
                generator_size: fb.nack_generator_size,
                generator_skip_last_n: fb.nack_generator_skip_last_n,
                generator_interval: Duration::from_millis(fb.nack_interval_ms),
            },
            fec_enabled: fb.fec_enabled,
            fec_group_size: fb.fec_group_size,
            pacing: PacingConfig {
                initial_bitrate: fb.initial_bitrate_kbps * 1000,
                min_bitrate: fb.min_bitrate_kbps * 1000,
                max_bitrate: fb.max_bitrate_kbps * 1000,
                max_burst: Duration::from_millis(fb.max_burst_ms),
            },
            report_interval: Duration::from_millis(fb.report_interval_ms),
            playout_delay: fb.playout_delay_enabled.then(|| PlayoutDelayConfig {
                min: Duration::from_millis(fb.playout_delay_min_ms),
                max: Duration::from_millis(fb.playout_delay_max_ms),
            }),
            nat_mapped_addresses: self
                .ice
                .nat_1to1_ips
                .iter()
                .filter(|ip| !ip.trim().is_empty())
                .cloned()
                .collect(),
            muxes,
            stun_servers: self.ice.stun_servers.clone(),
            gathering_timeout: Duration::from_millis(self.ice.gathering_timeout_ms),
            ..Default::default()
        }
    }
}
