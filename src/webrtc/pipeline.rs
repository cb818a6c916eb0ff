//! Feedback pipeline assembly
//!
//! Stage order is fixed. The first stage is closest to the wire:
//!
//! ```text
//! send:    pacing -> fec -> playout delay -> nack responder -> rtcp reports -> bandwidth estimation
//! receive:                                   nack generator -> rtcp reports
//! ```

use std::fmt;
use std::sync::Arc;

use webrtc::interceptor::nack::generator::Generator;
use webrtc::interceptor::nack::responder::Responder;
use webrtc::interceptor::registry::Registry;
use webrtc::interceptor::report::receiver::ReceiverReport;
use webrtc::interceptor::report::sender::SenderReport;
use webrtc::interceptor::twcc::sender::Sender as TwccSender;
use webrtc::interceptor::InterceptorBuilder;

use super::bwe::BandwidthEstimatorBuilder;
use super::capability::CapabilitySet;
use super::config::{Role, TransportPolicy};
use super::fec::{FecBuilder, RepairSsrcs};
use super::pacer::{PacerBuilder, TargetBitrate};
use super::playout_delay::PlayoutDelayBuilder;
use crate::error::{AppError, Result};

/// Smallest and largest NACK buffer sizes webrtc-rs accepts
const MIN_NACK_SIZE: u16 = 64;
const MAX_NACK_SIZE: u16 = 32768;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    Pacing,
    ForwardErrorCorrection,
    PlayoutDelay,
    LossRecoveryResponder,
    LossRecoveryGenerator,
    Reports,
    BandwidthEstimation,
}

impl StageKind {
    pub fn is_loss_recovery(&self) -> bool {
        matches!(
            self,
            StageKind::LossRecoveryResponder | StageKind::LossRecoveryGenerator
        )
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StageKind::Pacing => "pacing",
            StageKind::ForwardErrorCorrection => "fec",
            StageKind::PlayoutDelay => "playout-delay",
            StageKind::LossRecoveryResponder => "nack-responder",
            StageKind::LossRecoveryGenerator => "nack-generator",
            StageKind::Reports => "rtcp-reports",
            StageKind::BandwidthEstimation => "bandwidth-estimation",
        };
        write!(f, "{}", name)
    }
}

type BoxedBuilder = Box<dyn InterceptorBuilder + Send + Sync>;

/// One stage: a kind and the interceptor builders implementing it
pub struct PipelineStage {
    kind: StageKind,
    builders: Vec<BoxedBuilder>,
}

impl PipelineStage {
    pub fn kind(&self) -> StageKind {
        self.kind
    }
}

impl fmt::Debug for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineStage")
            .field("kind", &self.kind)
            .field("builders", &self.builders.len())
            .finish()
    }
}

/// Ordered interceptor chain for one transport
#[derive(Debug)]
pub struct FeedbackPipeline {
    stages: Vec<PipelineStage>,
    target_bitrate: Option<Arc<TargetBitrate>>,
    repair_ssrcs: Option<RepairSsrcs>,
}

impl FeedbackPipeline {
    /// Build every stage the policy calls for.
    ///
    /// Each builder is instantiated once here so that a bad configuration
    /// fails now, naming its stage, rather than inside the transport.
    pub fn assemble(policy: &TransportPolicy, capabilities: &CapabilitySet) -> Result<Self> {
        let mut stages = Vec::new();
        let mut target_bitrate = None;
        let mut repair_ssrcs = None;

        if policy.role == Role::Send {
            let pacing = &policy.pacing;
            if pacing.initial_bitrate == 0 || pacing.max_bitrate < pacing.min_bitrate {
                return Err(AppError::pipeline(
                    StageKind::Pacing,
                    format!(
                        "invalid bitrate range {}..{} (initial {})",
                        pacing.min_bitrate, pacing.max_bitrate, pacing.initial_bitrate
                    ),
                ));
            }
            let target = Arc::new(TargetBitrate::new(
                pacing.initial_bitrate,
                pacing.min_bitrate,
                pacing.max_bitrate,
            ));
            stages.push(stage(
                StageKind::Pacing,
                vec![Box::new(PacerBuilder::new(target.clone(), pacing.max_burst))],
            )?);
            target_bitrate = Some(target);

            if policy.fec_active() {
                let codec = capabilities.fec_codec().ok_or_else(|| {
                    AppError::pipeline(StageKind::ForwardErrorCorrection, "no FEC codec registered")
                })?;
                let table = RepairSsrcs::new();
                let builder = FecBuilder::new(codec.payload_type, policy.fec_group_size)
                    .map_err(|e| AppError::pipeline(StageKind::ForwardErrorCorrection, e))?
                    .with_repair_ssrcs(table.clone());
                stages.push(stage(StageKind::ForwardErrorCorrection, vec![Box::new(builder)])?);
                repair_ssrcs = Some(table);
            }

            if let Some(delay) = &policy.playout_delay {
                let builder = PlayoutDelayBuilder::new(delay.min, delay.max)
                    .map_err(|e| AppError::pipeline(StageKind::PlayoutDelay, e))?;
                stages.push(stage(StageKind::PlayoutDelay, vec![Box::new(builder)])?);
            }

            let size = nack_size(StageKind::LossRecoveryResponder, policy.loss_recovery.responder_size)?;
            stages.push(stage(
                StageKind::LossRecoveryResponder,
                vec![Box::new(Responder::builder().with_log2_size(size))],
            )?);
        } else {
            let recovery = &policy.loss_recovery;
            let size = nack_size(StageKind::LossRecoveryGenerator, recovery.generator_size)?;
            if recovery.generator_interval.is_zero() {
                return Err(AppError::pipeline(
                    StageKind::LossRecoveryGenerator,
                    "interval must be non-zero",
                ));
            }
            stages.push(stage(
                StageKind::LossRecoveryGenerator,
                vec![Box::new(
                    Generator::builder()
                        .with_log2_size_minus_6(size - 6)
                        .with_skip_last_n(recovery.generator_skip_last_n)
                        .with_interval(recovery.generator_interval),
                )],
            )?);
        }

        if policy.report_interval.is_zero() {
            return Err(AppError::pipeline(StageKind::Reports, "interval must be non-zero"));
        }
        stages.push(stage(
            StageKind::Reports,
            vec![
                Box::new(ReceiverReport::builder().with_interval(policy.report_interval)),
                Box::new(SenderReport::builder().with_interval(policy.report_interval)),
            ],
        )?);

        if let Some(target) = &target_bitrate {
            stages.push(stage(
                StageKind::BandwidthEstimation,
                vec![
                    Box::new(TwccSender::builder()),
                    Box::new(BandwidthEstimatorBuilder::new(target.clone())),
                ],
            )?);
        }

        Ok(Self {
            stages,
            target_bitrate,
            repair_ssrcs,
        })
    }

    pub fn stage_kinds(&self) -> Vec<StageKind> {
        self.stages.iter().map(|s| s.kind).collect()
    }

    pub fn contains(&self, kind: StageKind) -> bool {
        self.stages.iter().any(|s| s.kind == kind)
    }

    pub fn has_loss_recovery(&self) -> bool {
        self.stages.iter().any(|s| s.kind.is_loss_recovery())
    }

    /// Shared target the pacer follows (send role only)
    pub fn target_bitrate(&self) -> Option<Arc<TargetBitrate>> {
        self.target_bitrate.clone()
    }

    /// Media to repair SSRC pairing used by the FEC stage
    pub fn repair_ssrcs(&self) -> Option<RepairSsrcs> {
        self.repair_ssrcs.clone()
    }

    pub fn into_registry(self) -> Registry {
        let mut registry = Registry::new();
        for stage in self.stages {
            for builder in stage.builders {
                registry.add(builder);
            }
        }
        registry
    }
}

fn stage(kind: StageKind, builders: Vec<BoxedBuilder>) -> Result<PipelineStage> {
    for builder in &builders {
        builder
            .build(&format!("{}-probe", kind))
            .map_err(|e| AppError::pipeline(kind, e))?;
    }
    Ok(PipelineStage { kind, builders })
}

/// Validate a NACK buffer size and return its base-2 logarithm
fn nack_size(kind: StageKind, size: u16) -> Result<u8> {
    if !size.is_power_of_two() || !(MIN_NACK_SIZE..=MAX_NACK_SIZE).contains(&size) {
        return Err(AppError::pipeline(
            kind,
            format!(
                "buffer size {} must be a power of two in {}..={}",
                size, MIN_NACK_SIZE, MAX_NACK_SIZE
            ),
        ));
    }
    Ok(size.trailing_zeros() as u8)
}
