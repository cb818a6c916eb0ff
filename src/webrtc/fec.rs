//! FlexFEC-03 repair packet generation
//!
//! Every `group_size` consecutive video packets produce one repair packet on a
//! separate SSRC. The repair payload is the XOR of the protected payloads, so
//! any single loss within a group can be rebuilt by the receiver.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |R|F|P|X|  CC   |M| PT recovery |        length recovery        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                          TS recovery                          |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |   SSRCCount   |                    reserved                   |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                             SSRC_i                            |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |           SN base_i           |k|          Mask [0-14]        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use tracing::debug;
use webrtc::interceptor::stream_info::StreamInfo;
use webrtc::interceptor::{
    Attributes, Interceptor, InterceptorBuilder, RTCPReader, RTCPWriter, RTPReader, RTPWriter,
};
use webrtc::rtp::header::Header;
use webrtc::rtp::packet::Packet;
use webrtc::sdp::description::common::Attribute;
use webrtc::sdp::SessionDescription;

use super::capability::{MIME_TYPE_FLEXFEC, MIME_TYPE_RTX};
use super::InterceptorResult;

pub const FLEXFEC_HEADER_LEN: usize = 20;
/// Largest group a single 15-bit mask can describe
pub const MAX_GROUP_SIZE: usize = 15;

/// Repair SSRC per protected media SSRC
///
/// Shared between the encoder and the transport so the answer can announce
/// the same `FEC-FR` pairing the encoder sends on.
#[derive(Debug, Clone, Default)]
pub struct RepairSsrcs {
    pairs: Arc<Mutex<HashMap<u32, u32>>>,
}

impl RepairSsrcs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Repair SSRC for `media_ssrc`, allocated on first use
    pub fn assign(&self, media_ssrc: u32) -> u32 {
        let mut pairs = self.pairs.lock();
        if let Some(repair) = pairs.get(&media_ssrc) {
            return *repair;
        }
        let repair = loop {
            let candidate = rand::random::<u32>();
            if candidate != 0
                && candidate != media_ssrc
                && !pairs.contains_key(&candidate)
                && !pairs.values().any(|r| *r == candidate)
            {
                break candidate;
            }
        };
        pairs.insert(media_ssrc, repair);
        repair
    }

    pub fn get(&self, media_ssrc: u32) -> Option<u32> {
        self.pairs.lock().get(&media_ssrc).copied()
    }

    /// `(media, repair)` pairs sorted by media SSRC
    pub fn pairs(&self) -> Vec<(u32, u32)> {
        let mut pairs: Vec<_> = self.pairs.lock().iter().map(|(m, r)| (*m, *r)).collect();
        pairs.sort_unstable();
        pairs
    }
}

/// Announce each repair flow next to its media source in a local description.
///
/// The repair SSRC copies the source's `a=ssrc` lines and is tied to it with
/// `a=ssrc-group:FEC-FR <media> <repair>`. Media SSRCs absent from the
/// description are skipped.
pub fn announce_repair_ssrcs(sdp: &str, pairs: &[(u32, u32)]) -> Result<String, String> {
    if pairs.is_empty() {
        return Ok(sdp.to_string());
    }
    let mut desc = SessionDescription::unmarshal(&mut Cursor::new(sdp.as_bytes()))
        .map_err(|e| format!("unparsable local description: {}", e))?;

    for media in desc
        .media_descriptions
        .iter_mut()
        .filter(|m| m.media_name.media == "video")
    {
        for (media_ssrc, repair_ssrc) in pairs {
            let prefix = format!("{} ", media_ssrc);
            let source_lines: Vec<String> = media
                .attributes
                .iter()
                .filter(|a| a.key == "ssrc")
                .filter_map(|a| a.value.as_deref()?.strip_prefix(prefix.as_str()))
                .map(str::to_string)
                .collect();
            if source_lines.is_empty() {
                continue;
            }
            for line in source_lines {
                media.attributes.push(Attribute::new(
                    "ssrc".to_string(),
                    Some(format!("{} {}", repair_ssrc, line)),
                ));
            }
            media.attributes.push(Attribute::new(
                "ssrc-group".to_string(),
                Some(format!("FEC-FR {} {}", media_ssrc, repair_ssrc)),
            ));
        }
    }
    Ok(desc.marshal())
}

/// Builder for the FlexFEC encoder interceptor
pub struct FecBuilder {
    payload_type: u8,
    group_size: usize,
    repair_ssrcs: RepairSsrcs,
}

impl FecBuilder {
    pub fn new(payload_type: u8, group_size: usize) -> Result<Self, String> {
        if group_size == 0 || group_size > MAX_GROUP_SIZE {
            return Err(format!(
                "group size {} outside 1..={}",
                group_size, MAX_GROUP_SIZE
            ));
        }
        if payload_type > 127 {
            return Err(format!("invalid payload type {}", payload_type));
        }
        Ok(Self {
            payload_type,
            group_size,
            repair_ssrcs: RepairSsrcs::new(),
        })
    }

    pub fn with_repair_ssrcs(mut self, repair_ssrcs: RepairSsrcs) -> Self {
        self.repair_ssrcs = repair_ssrcs;
        self
    }
}

impl InterceptorBuilder for FecBuilder {
    fn build(&self, _id: &str) -> InterceptorResult<Arc<dyn Interceptor + Send + Sync>> {
        Ok(Arc::new(FecInterceptor {
            payload_type: self.payload_type,
            group_size: self.group_size,
            repair_ssrcs: self.repair_ssrcs.clone(),
        }))
    }
}

pub struct FecInterceptor {
    payload_type: u8,
    group_size: usize,
    repair_ssrcs: RepairSsrcs,
}

fn is_protected_stream(info: &StreamInfo) -> bool {
    let mime = info.mime_type.to_ascii_lowercase();
    mime.starts_with("video/") && mime != MIME_TYPE_RTX && mime != MIME_TYPE_FLEXFEC
}

#[async_trait]
impl Interceptor for FecInterceptor {
    async fn bind_rtcp_reader(
        &self,
        reader: Arc<dyn RTCPReader + Send + Sync>,
    ) -> Arc<dyn RTCPReader + Send + Sync> {
        reader
    }

    async fn bind_rtcp_writer(
        &self,
        writer: Arc<dyn RTCPWriter + Send + Sync>,
    ) -> Arc<dyn RTCPWriter + Send + Sync> {
        writer
    }

    async fn bind_local_stream(
        &self,
        info: &StreamInfo,
        writer: Arc<dyn RTPWriter + Send + Sync>,
    ) -> Arc<dyn RTPWriter + Send + Sync> {
        if !is_protected_stream(info) {
            return writer;
        }
        let fec_ssrc = self.repair_ssrcs.assign(info.ssrc);
        debug!(
            "FlexFEC protecting ssrc {} with repair ssrc {}",
            info.ssrc, fec_ssrc
        );
        Arc::new(FecWriter {
            encoder: Mutex::new(FlexFecEncoder::new(
                info.ssrc,
                fec_ssrc,
                self.payload_type,
                self.group_size,
            )),
            next: writer,
        })
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

struct FecWriter {
    encoder: Mutex<FlexFecEncoder>,
    next: Arc<dyn RTPWriter + Send + Sync>,
}

#[async_trait]
impl RTPWriter for FecWriter {
    async fn write(&self, pkt: &Packet, attributes: &Attributes) -> InterceptorResult<usize> {
        let n = self.next.write(pkt, attributes).await?;
        let repair = self.encoder.lock().push(pkt);
        if let Some(repair) = repair {
            if let Err(e) = self.next.write(&repair, attributes).await {
                debug!("Failed to send FlexFEC repair packet: {}", e);
            }
        }
        Ok(n)
    }
}

/// XOR parity encoder for a single protected stream
#[derive(Debug)]
pub struct FlexFecEncoder {
    protected_ssrc: u32,
    fec_ssrc: u32,
    payload_type: u8,
    group_size: usize,
    sequence_number: u16,
    group: Vec<Packet>,
}

impl FlexFecEncoder {
    pub fn new(protected_ssrc: u32, fec_ssrc: u32, payload_type: u8, group_size: usize) -> Self {
        let group_size = group_size.clamp(1, MAX_GROUP_SIZE);
        Self {
            protected_ssrc,
            fec_ssrc,
            payload_type,
            group_size,
            sequence_number: rand::random::<u16>(),
            group: Vec::with_capacity(group_size),
        }
    }

    /// Add a media packet; returns a repair packet when a group completes.
    ///
    /// Packets that do not directly follow the previous one (retransmissions,
    /// reordering) are left unprotected.
    pub fn push(&mut self, pkt: &Packet) -> Option<Packet> {
        if let Some(last) = self.group.last() {
            if pkt.header.sequence_number != last.header.sequence_number.wrapping_add(1) {
                return None;
            }
        }
        self.group.push(pkt.clone());
        if self.group.len() < self.group_size {
            return None;
        }
        let repair = self.encode();
        self.group.clear();
        Some(repair)
    }

    fn encode(&mut self) -> Packet {
        let base = self.group[0].header.sequence_number;
        let max_len = self
            .group
            .iter()
            .map(|p| p.payload.len())
            .max()
            .unwrap_or(0);

        let mut bits0 = 0u8;
        let mut bits1 = 0u8;
        let mut length_recovery = 0u16;
        let mut ts_recovery = 0u32;
        let mut mask = 0u16;
        let mut parity = vec![0u8; max_len];

        for p in &self.group {
            let h = &p.header;
            bits0 ^= ((h.padding as u8) << 5) | ((h.extension as u8) << 4) | (h.csrc.len() as u8 & 0x0f);
            bits1 ^= ((h.marker as u8) << 7) | (h.payload_type & 0x7f);
            length_recovery ^= p.payload.len() as u16;
            ts_recovery ^= h.timestamp;
            let offset = h.sequence_number.wrapping_sub(base);
            if (offset as usize) < MAX_GROUP_SIZE {
                mask |= 1 << (14 - offset);
            }
            for (dst, src) in parity.iter_mut().zip(p.payload.iter()) {
                *dst ^= *src;
            }
        }

        let mut payload = BytesMut::with_capacity(FLEXFEC_HEADER_LEN + max_len);
        // R=0, F=0: flexible mask
        payload.put_u8(bits0 & 0x3f);
        payload.put_u8(bits1);
        payload.put_u16(length_recovery);
        payload.put_u32(ts_recovery);
        payload.put_u8(1);
        payload.put_bytes(0, 3);
        payload.put_u32(self.protected_ssrc);
        payload.put_u16(base);
        // k=1: mask fits in one 15-bit chunk
        payload.put_u16(0x8000 | mask);
        payload.put_slice(&parity);

        let last = &self.group[self.group.len() - 1];
        let header = Header {
            version: 2,
            payload_type: self.payload_type,
            sequence_number: self.sequence_number,
            timestamp: last.header.timestamp,
            ssrc: self.fec_ssrc,
            ..Default::default()
        };
        self.sequence_number = self.sequence_number.wrapping_add(1);

        Packet {
            header,
            payload: Bytes::from(payload),
        }
    }
}
