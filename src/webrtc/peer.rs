//! webrtc-rs backed transport

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::APIBuilder;
use webrtc::ice::mdns::MulticastDnsMode;
use webrtc::ice::udp_network::UDPNetwork;
use webrtc::ice_transport::ice_candidate_type::RTCIceCandidateType;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTCRtpHeaderExtensionCapability, RTPCodecType,
};
use webrtc::rtp_transceiver::RTCPFeedback;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use super::capability::{CapabilitySet, CodecSpec, MediaKind, PLAYOUT_DELAY_URI, TRANSPORT_CC_URI};
use super::config::TransportPolicy;
use super::fec::{announce_repair_ssrcs, RepairSsrcs};
use super::pipeline::{FeedbackPipeline, StageKind};
use super::signaling::{ConnectionState, SdpAnswer, SdpOffer};
use super::track::{SenderFeedback, StaticSampleSink};
use super::transport::{MediaTransport, OutboundTrack, StateChangeHandler, TransportFactory};
use crate::error::{AppError, Result};

/// Stream id shared by the audio and video tracks of one session
const STREAM_ID: &str = "whep-playout";

fn codec_type(kind: MediaKind) -> RTPCodecType {
    match kind {
        MediaKind::Audio => RTPCodecType::Audio,
        MediaKind::Video => RTPCodecType::Video,
    }
}

fn feedback(typ: &str, parameter: &str) -> RTCPFeedback {
    RTCPFeedback {
        typ: typ.to_string(),
        parameter: parameter.to_string(),
    }
}

/// RTCP feedback advertised for a codec given the assembled stages
fn codec_feedback(codec: &CodecSpec, pipeline: &FeedbackPipeline) -> Vec<RTCPFeedback> {
    let mut fb = Vec::new();
    if !codec.is_media() {
        return fb;
    }
    if codec.kind == MediaKind::Video {
        if pipeline.has_loss_recovery() {
            fb.push(feedback("nack", ""));
            fb.push(feedback("nack", "pli"));
        }
        fb.push(feedback("ccm", "fir"));
    }
    if pipeline.contains(StageKind::BandwidthEstimation) {
        fb.push(feedback("transport-cc", ""));
    }
    fb
}

fn codec_capability(codec: &CodecSpec, rtcp_feedback: Vec<RTCPFeedback>) -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: codec.mime_type.clone(),
        clock_rate: codec.clock_rate,
        channels: codec.channels,
        sdp_fmtp_line: codec.fmtp.clone(),
        rtcp_feedback,
    }
}

fn build_media_engine(
    capabilities: &CapabilitySet,
    pipeline: &FeedbackPipeline,
) -> Result<MediaEngine> {
    let mut media_engine = MediaEngine::default();

    for codec in capabilities.codecs() {
        media_engine
            .register_codec(
                RTCRtpCodecParameters {
                    capability: codec_capability(codec, codec_feedback(codec, pipeline)),
                    payload_type: codec.payload_type,
                    ..Default::default()
                },
                codec_type(codec.kind),
            )
            .map_err(|e| {
                AppError::CapabilityError(format!(
                    "Failed to register codec {}: {}",
                    codec.mime_type, e
                ))
            })?;
    }

    let mut extensions: Vec<(MediaKind, String)> = capabilities
        .header_extensions()
        .iter()
        .map(|ext| (ext.kind, ext.uri.clone()))
        .collect();
    if pipeline.contains(StageKind::BandwidthEstimation) {
        for kind in [MediaKind::Video, MediaKind::Audio] {
            if !extensions.iter().any(|(k, uri)| *k == kind && uri == TRANSPORT_CC_URI) {
                extensions.push((kind, TRANSPORT_CC_URI.to_string()));
            }
        }
    }
    if pipeline.contains(StageKind::PlayoutDelay)
        && !extensions
            .iter()
            .any(|(k, uri)| *k == MediaKind::Video && uri == PLAYOUT_DELAY_URI)
    {
        extensions.push((MediaKind::Video, PLAYOUT_DELAY_URI.to_string()));
    }

    for (kind, uri) in extensions {
        media_engine
            .register_header_extension(
                RTCRtpHeaderExtensionCapability { uri: uri.clone() },
                codec_type(kind),
                None,
            )
            .map_err(|e| {
                AppError::CapabilityError(format!(
                    "Failed to register header extension {}: {}",
                    uri, e
                ))
            })?;
    }

    Ok(media_engine)
}

fn build_setting_engine(policy: &TransportPolicy) -> SettingEngine {
    let mut setting_engine = SettingEngine::default();
    setting_engine.set_ice_multicast_dns_mode(MulticastDnsMode::Disabled);
    setting_engine.set_lite(policy.ice_lite);
    setting_engine.set_network_types(policy.ice_protocol.network_types());

    if !policy.nat_mapped_addresses.is_empty() {
        setting_engine.set_nat_1to1_ips(
            policy.nat_mapped_addresses.clone(),
            RTCIceCandidateType::Host,
        );
    }
    if let Some(mux) = &policy.muxes.udp {
        setting_engine.set_udp_network(UDPNetwork::Muxed(mux.clone()));
    }

    setting_engine
}

/// Builds [`RtcTransport`]s from a policy and capability set
#[derive(Debug, Default, Clone, Copy)]
pub struct RtcTransportFactory;

#[async_trait]
impl TransportFactory for RtcTransportFactory {
    async fn build(
        &self,
        policy: &TransportPolicy,
        capabilities: &CapabilitySet,
    ) -> Result<Arc<dyn MediaTransport>> {
        capabilities.validate(&policy.media)?;

        let capabilities = if policy.fec_active() {
            capabilities.clone()
        } else {
            capabilities.without_fec()
        };

        let pipeline = FeedbackPipeline::assemble(policy, &capabilities)?;
        debug!(
            "Feedback pipeline ({}, {}): {:?}",
            policy.ice_protocol,
            if policy.fec_active() { "fec" } else { "no fec" },
            pipeline.stage_kinds()
        );

        let media_engine = build_media_engine(&capabilities, &pipeline)?;
        let setting_engine = build_setting_engine(policy);
        let repair_ssrcs = pipeline.repair_ssrcs();

        let api = APIBuilder::new()
            .with_setting_engine(setting_engine)
            .with_media_engine(media_engine)
            .with_interceptor_registry(pipeline.into_registry())
            .build();

        let ice_servers = policy
            .stun_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .collect();

        let pc = api
            .new_peer_connection(RTCConfiguration {
                ice_servers,
                ..Default::default()
            })
            .await
            .map_err(|e| {
                AppError::TransportError(format!("Failed to create peer connection: {}", e))
            })?;

        Ok(Arc::new(RtcTransport::new(Arc::new(pc), policy, repair_ssrcs)))
    }
}

/// Peer connection wrapper exposing [`MediaTransport`]
pub struct RtcTransport {
    pc: Arc<RTCPeerConnection>,
    state: Arc<watch::Sender<ConnectionState>>,
    state_rx: watch::Receiver<ConnectionState>,
    handler: Arc<RwLock<Option<StateChangeHandler>>>,
    gathering_timeout: std::time::Duration,
    /// Present when the pipeline sends FlexFEC
    repair_ssrcs: Option<RepairSsrcs>,
}

impl RtcTransport {
    fn new(
        pc: Arc<RTCPeerConnection>,
        policy: &TransportPolicy,
        repair_ssrcs: Option<RepairSsrcs>,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(ConnectionState::New);
        let transport = Self {
            pc,
            state: Arc::new(state_tx),
            state_rx,
            handler: Arc::new(RwLock::new(None)),
            gathering_timeout: policy.gathering_timeout,
            repair_ssrcs,
        };
        transport.setup_event_handlers();
        transport
    }

    fn setup_event_handlers(&self) {
        let state = self.state.clone();
        let handler = self.handler.clone();

        self.pc
            .on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
                let state = state.clone();
                let handler = handler.clone();

                Box::pin(async move {
                    if s == RTCPeerConnectionState::Unspecified {
                        return;
                    }
                    let new_state = ConnectionState::from(s);
                    debug!("Peer connection state: {}", new_state);
                    let _ = state.send(new_state);
                    if let Some(callback) = handler.read().as_ref() {
                        callback(new_state);
                    }
                })
            }));
    }
}

#[async_trait]
impl MediaTransport for RtcTransport {
    async fn add_outbound_track(&self, codec: &CodecSpec) -> Result<OutboundTrack> {
        let track = Arc::new(TrackLocalStaticSample::new(
            codec_capability(codec, vec![]),
            codec.kind.to_string(),
            STREAM_ID.to_string(),
        ));

        let sender = self
            .pc
            .add_track(track.clone() as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| {
                AppError::TransportError(format!("Failed to add {} track: {}", codec.kind, e))
            })?;

        if let (MediaKind::Video, Some(table)) = (codec.kind, &self.repair_ssrcs) {
            for encoding in sender.get_parameters().await.encodings {
                let repair = table.assign(encoding.ssrc);
                debug!("Repair ssrc {} reserved for {}", repair, encoding.ssrc);
            }
        }

        info!("{} track added ({})", codec.kind, codec.mime_type);

        Ok(OutboundTrack {
            kind: codec.kind,
            sink: Arc::new(StaticSampleSink::new(track)),
            feedback: Arc::new(SenderFeedback::new(sender)),
        })
    }

    fn on_state_change(&self, handler: StateChangeHandler) {
        *self.handler.write() = Some(handler);
    }

    fn current_state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    async fn negotiate(&self, offer: SdpOffer) -> Result<SdpAnswer> {
        let sdp = RTCSessionDescription::offer(offer.sdp)
            .map_err(|e| AppError::TransportError(format!("Invalid SDP offer: {}", e)))?;

        self.pc.set_remote_description(sdp).await.map_err(|e| {
            AppError::TransportError(format!("Failed to set remote description: {}", e))
        })?;

        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| AppError::TransportError(format!("Failed to create answer: {}", e)))?;

        let mut gather_complete = self.pc.gathering_complete_promise().await;

        self.pc.set_local_description(answer).await.map_err(|e| {
            AppError::TransportError(format!("Failed to set local description: {}", e))
        })?;

        if tokio::time::timeout(self.gathering_timeout, gather_complete.recv())
            .await
            .is_err()
        {
            return Err(AppError::TransportError(format!(
                "ICE gathering did not complete within {:?}",
                self.gathering_timeout
            )));
        }

        let local = self.pc.local_description().await.ok_or_else(|| {
            AppError::TransportError("Local description unavailable".to_string())
        })?;

        let sdp = match &self.repair_ssrcs {
            Some(table) => announce_repair_ssrcs(&local.sdp, &table.pairs())
                .map_err(|e| AppError::TransportError(format!("Failed to announce FEC: {}", e)))?,
            None => local.sdp,
        };

        Ok(SdpAnswer::new(sdp))
    }

    async fn close(&self) -> Result<()> {
        self.handler.write().take();
        let result = self.pc.close().await;
        let _ = self.state.send(ConnectionState::Closed);
        if let Err(ref e) = result {
            warn!("Failed to close peer connection: {}", e);
        }
        result.map_err(|e| AppError::TransportError(format!("Failed to close peer connection: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
    use webrtc::rtp_transceiver::RTCRtpTransceiverInit;

    use crate::webrtc::config::{IceProtocolPreference, Role};

    #[test]
    fn test_codec_feedback_follows_pipeline() {
        let caps = CapabilitySet::default_whep();
        let pipeline = FeedbackPipeline::assemble(&TransportPolicy::default(), &caps).unwrap();

        let video = caps.primary_codec(MediaKind::Video).unwrap();
        let fb = codec_feedback(video, &pipeline);
        assert!(fb.iter().any(|f| f.typ == "nack" && f.parameter.is_empty()));
        assert!(fb.iter().any(|f| f.typ == "nack" && f.parameter == "pli"));
        assert!(fb.iter().any(|f| f.typ == "transport-cc"));

        let audio = caps.primary_codec(MediaKind::Audio).unwrap();
        let fb = codec_feedback(audio, &pipeline);
        assert!(fb.iter().all(|f| f.typ != "nack"));
        assert!(fb.iter().any(|f| f.typ == "transport-cc"));

        let fec = caps.fec_codec().unwrap();
        assert!(codec_feedback(fec, &pipeline).is_empty());
    }

    #[test]
    fn test_receive_role_has_no_transport_cc() {
        let caps = CapabilitySet::default_whep();
        let policy = TransportPolicy {
            role: Role::Receive,
            ..Default::default()
        };
        let pipeline = FeedbackPipeline::assemble(&policy, &caps).unwrap();
        let video = caps.primary_codec(MediaKind::Video).unwrap();
        let fb = codec_feedback(video, &pipeline);
        assert!(fb.iter().all(|f| f.typ != "transport-cc"));
    }

    #[test]
    fn test_media_engine_accepts_default_set() {
        let caps = CapabilitySet::default_whep();
        let pipeline = FeedbackPipeline::assemble(&TransportPolicy::default(), &caps).unwrap();
        assert!(build_media_engine(&caps, &pipeline).is_ok());
    }

    #[tokio::test]
    async fn test_factory_rejects_empty_capabilities() {
        let result = RtcTransportFactory
            .build(&TransportPolicy::default(), &CapabilitySet::new())
            .await;
        assert!(matches!(result, Err(AppError::CapabilityError(_))));
    }

    #[tokio::test]
    async fn test_factory_builds_tcp_only_transport() {
        let policy = TransportPolicy {
            ice_protocol: IceProtocolPreference::TcpOnly,
            ..Default::default()
        };
        let transport = RtcTransportFactory
            .build(&policy, &CapabilitySet::default_whep())
            .await
            .unwrap();
        assert_eq!(transport.current_state(), ConnectionState::New);
        transport.close().await.unwrap();
    }

    /// Offer from a plain receive-only webrtc-rs peer
    async fn recvonly_offer() -> (Arc<RTCPeerConnection>, SdpOffer) {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().unwrap();
        let api = APIBuilder::new().with_media_engine(media_engine).build();
        let offerer = Arc::new(
            api.new_peer_connection(RTCConfiguration::default())
                .await
                .unwrap(),
        );
        for kind in [RTPCodecType::Audio, RTPCodecType::Video] {
            offerer
                .add_transceiver_from_kind(
                    kind,
                    Some(RTCRtpTransceiverInit {
                        direction: RTCRtpTransceiverDirection::Recvonly,
                        send_encodings: vec![],
                    }),
                )
                .await
                .unwrap();
        }
        let offer = offerer.create_offer(None).await.unwrap();
        offerer.set_local_description(offer.clone()).await.unwrap();
        (offerer, SdpOffer::new(offer.sdp))
    }

    #[tokio::test]
    async fn test_answer_announces_fec_repair_flow() {
        let caps = CapabilitySet::default_whep();
        let transport = RtcTransportFactory
            .build(&TransportPolicy::default(), &caps)
            .await
            .unwrap();
        for kind in [MediaKind::Audio, MediaKind::Video] {
            transport
                .add_outbound_track(caps.primary_codec(kind).unwrap())
                .await
                .unwrap();
        }

        let (offerer, offer) = recvonly_offer().await;
        let answer = transport.negotiate(offer).await.unwrap();

        let video = &answer.sdp[answer.sdp.find("m=video").unwrap()..];
        let group = video
            .lines()
            .find_map(|l| l.strip_prefix("a=ssrc-group:FEC-FR "))
            .unwrap();
        let (media, repair) = group.split_once(' ').unwrap();
        assert_ne!(media, repair);
        assert!(video.contains(&format!("a=ssrc:{} cname:", media)));
        assert!(video.contains(&format!("a=ssrc:{} cname:", repair)));

        transport.close().await.unwrap();
        offerer.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_answer_without_fec_has_no_repair_flow() {
        let caps = CapabilitySet::default_whep();
        let policy = TransportPolicy {
            fec_enabled: false,
            ..Default::default()
        };
        let transport = RtcTransportFactory.build(&policy, &caps).await.unwrap();
        transport
            .add_outbound_track(caps.primary_codec(MediaKind::Video).unwrap())
            .await
            .unwrap();

        let (offerer, offer) = recvonly_offer().await;
        let answer = transport.negotiate(offer).await.unwrap();
        assert!(!answer.sdp.contains("FEC-FR"));

        transport.close().await.unwrap();
        offerer.close().await.unwrap();
    }
}
