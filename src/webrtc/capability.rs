//! Codec and header-extension table offered by a transport

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

pub const MIME_TYPE_H264: &str = "video/H264";
pub const MIME_TYPE_OPUS: &str = "audio/opus";
pub const MIME_TYPE_RTX: &str = "video/rtx";
pub const MIME_TYPE_FLEXFEC: &str = "video/flexfec-03";

pub const TRANSPORT_CC_URI: &str =
    "http://www.ietf.org/id/draft-holmer-rmcat-transport-wide-cc-extensions-01";
pub const PLAYOUT_DELAY_URI: &str = "http://www.webrtc.org/experiments/rtp-hdrext/playout-delay";

pub const H264_PAYLOAD_TYPE: u8 = 96;
pub const RTX_PAYLOAD_TYPE: u8 = 97;
pub const FLEXFEC_PAYLOAD_TYPE: u8 = 49;
pub const OPUS_PAYLOAD_TYPE: u8 = 111;

/// Media kind of a track or codec
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Audio => write!(f, "audio"),
            MediaKind::Video => write!(f, "video"),
        }
    }
}

/// A single codec entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecSpec {
    pub kind: MediaKind,
    pub mime_type: String,
    pub clock_rate: u32,
    pub channels: u16,
    pub fmtp: String,
    pub payload_type: u8,
}

impl CodecSpec {
    pub fn new(kind: MediaKind, mime_type: &str, clock_rate: u32, payload_type: u8) -> Self {
        Self {
            kind,
            mime_type: mime_type.to_string(),
            clock_rate,
            channels: 0,
            fmtp: String::new(),
            payload_type,
        }
    }

    pub fn with_channels(mut self, channels: u16) -> Self {
        self.channels = channels;
        self
    }

    pub fn with_fmtp(mut self, fmtp: &str) -> Self {
        self.fmtp = fmtp.to_string();
        self
    }

    pub fn is_fec(&self) -> bool {
        self.mime_type.eq_ignore_ascii_case(MIME_TYPE_FLEXFEC)
    }

    pub fn is_rtx(&self) -> bool {
        self.mime_type.eq_ignore_ascii_case(MIME_TYPE_RTX)
    }

    /// Carries media rather than repair data
    pub fn is_media(&self) -> bool {
        !self.is_fec() && !self.is_rtx()
    }
}

/// Header extension entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderExtension {
    pub kind: MediaKind,
    pub uri: String,
}

/// Ordered set of codecs and header extensions.
///
/// The first media codec registered for a kind is the one outbound tracks use.
#[derive(Debug, Clone, Default)]
pub struct CapabilitySet {
    codecs: Vec<CodecSpec>,
    header_extensions: Vec<HeaderExtension>,
}

impl CapabilitySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opus audio, H.264 video with RTX and FlexFEC repair
    pub fn default_whep() -> Self {
        Self::new()
            .with_codec(
                CodecSpec::new(MediaKind::Audio, MIME_TYPE_OPUS, 48000, OPUS_PAYLOAD_TYPE)
                    .with_channels(2)
                    .with_fmtp("minptime=10;useinbandfec=1"),
            )
            .with_codec(
                CodecSpec::new(MediaKind::Video, MIME_TYPE_H264, 90000, H264_PAYLOAD_TYPE)
                    .with_fmtp(
                        "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f",
                    ),
            )
            .with_codec(
                CodecSpec::new(MediaKind::Video, MIME_TYPE_RTX, 90000, RTX_PAYLOAD_TYPE)
                    .with_fmtp(&format!("apt={}", H264_PAYLOAD_TYPE)),
            )
            .with_codec(
                CodecSpec::new(
                    MediaKind::Video,
                    MIME_TYPE_FLEXFEC,
                    90000,
                    FLEXFEC_PAYLOAD_TYPE,
                )
                .with_fmtp("repair-window=10000000"),
            )
    }

    pub fn with_codec(mut self, codec: CodecSpec) -> Self {
        self.codecs.push(codec);
        self
    }

    pub fn with_header_extension(mut self, kind: MediaKind, uri: &str) -> Self {
        self.header_extensions.push(HeaderExtension {
            kind,
            uri: uri.to_string(),
        });
        self
    }

    pub fn codecs(&self) -> &[CodecSpec] {
        &self.codecs
    }

    pub fn header_extensions(&self) -> &[HeaderExtension] {
        &self.header_extensions
    }

    pub fn is_empty(&self) -> bool {
        self.codecs.is_empty()
    }

    /// First media codec of the given kind
    pub fn primary_codec(&self, kind: MediaKind) -> Option<&CodecSpec> {
        self.codecs
            .iter()
            .find(|c| c.kind == kind && c.is_media())
    }

    pub fn fec_codec(&self) -> Option<&CodecSpec> {
        self.codecs.iter().find(|c| c.is_fec())
    }

    /// Copy of this set with FlexFEC entries removed
    pub fn without_fec(&self) -> Self {
        Self {
            codecs: self.codecs.iter().filter(|c| !c.is_fec()).cloned().collect(),
            header_extensions: self.header_extensions.clone(),
        }
    }

    /// Check the set can carry every kind in `required`.
    pub fn validate(&self, required: &[MediaKind]) -> Result<()> {
        if self.codecs.is_empty() {
            return Err(AppError::CapabilityError(
                "no codecs registered".to_string(),
            ));
        }

        for kind in required {
            if self.primary_codec(*kind).is_none() {
                return Err(AppError::CapabilityError(format!(
                    "no {} codec registered",
                    kind
                )));
            }
        }

        let mut seen = HashSet::new();
        for codec in &self.codecs {
            if !seen.insert((codec.kind, codec.payload_type)) {
                return Err(AppError::CapabilityError(format!(
                    "duplicate {} payload type {}",
                    codec.kind, codec.payload_type
                )));
            }
            if codec.clock_rate == 0 {
                return Err(AppError::CapabilityError(format!(
                    "{} has zero clock rate",
                    codec.mime_type
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BOTH: &[MediaKind] = &[MediaKind::Audio, MediaKind::Video];

    #[test]
    fn test_default_set_is_valid() {
        let caps = CapabilitySet::default_whep();
        assert!(caps.validate(BOTH).is_ok());
        assert_eq!(
            caps.primary_codec(MediaKind::Video).map(|c| c.payload_type),
            Some(H264_PAYLOAD_TYPE)
        );
        assert_eq!(
            caps.primary_codec(MediaKind::Audio).map(|c| c.payload_type),
            Some(OPUS_PAYLOAD_TYPE)
        );
        assert!(caps.fec_codec().is_some());
    }

    #[test]
    fn test_empty_set_rejected() {
        let err = CapabilitySet::new().validate(BOTH).unwrap_err();
        assert!(matches!(err, AppError::CapabilityError(_)));
    }

    #[test]
    fn test_missing_kind_rejected() {
        let caps = CapabilitySet::new().with_codec(CodecSpec::new(
            MediaKind::Audio,
            MIME_TYPE_OPUS,
            48000,
            111,
        ));
        assert!(caps.validate(&[MediaKind::Audio]).is_ok());
        assert!(matches!(
            caps.validate(BOTH),
            Err(AppError::CapabilityError(_))
        ));
    }

    #[test]
    fn test_duplicate_payload_type_rejected() {
        let caps = CapabilitySet::default_whep().with_codec(CodecSpec::new(
            MediaKind::Video,
            "video/VP8",
            90000,
            H264_PAYLOAD_TYPE,
        ));
        assert!(matches!(
            caps.validate(BOTH),
            Err(AppError::CapabilityError(_))
        ));

        // Same number on a different kind is fine
        let caps = CapabilitySet::default_whep().with_codec(CodecSpec::new(
            MediaKind::Audio,
            "audio/PCMU",
            8000,
            H264_PAYLOAD_TYPE,
        ));
        assert!(caps.validate(BOTH).is_ok());
    }

    #[test]
    fn test_without_fec() {
        let caps = CapabilitySet::default_whep().without_fec();
        assert!(caps.fec_codec().is_none());
        assert_eq!(caps.codecs().len(), 3);
        assert!(caps.validate(BOTH).is_ok());
    }
}
