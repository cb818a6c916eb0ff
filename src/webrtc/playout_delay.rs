//! Playout-delay header extension
//!
//! Stamps every outbound video packet with the receiver jitter-buffer bounds.
//! Both bounds travel as 12-bit counts of 10 ms.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, warn};
use webrtc::interceptor::stream_info::StreamInfo;
use webrtc::interceptor::{
    Attributes, Interceptor, InterceptorBuilder, RTCPReader, RTCPWriter, RTPReader, RTPWriter,
};
use webrtc::rtp::packet::Packet;

use super::capability::PLAYOUT_DELAY_URI;
use super::InterceptorResult;

const GRANULARITY_MS: u128 = 10;
/// Largest delay a 12-bit field can carry
pub const MAX_PLAYOUT_DELAY: Duration = Duration::from_millis(4095 * 10);

/// Encode the 3-byte extension body
pub fn encode_playout_delay(min: Duration, max: Duration) -> [u8; 3] {
    let min = (min.as_millis() / GRANULARITY_MS).min(0x0fff) as u16;
    let max = (max.as_millis() / GRANULARITY_MS).min(0x0fff) as u16;
    [
        (min >> 4) as u8,
        (((min & 0x0f) << 4) | (max >> 8)) as u8,
        (max & 0xff) as u8,
    ]
}

pub struct PlayoutDelayBuilder {
    body: Bytes,
}

impl PlayoutDelayBuilder {
    pub fn new(min: Duration, max: Duration) -> Result<Self, String> {
        if min > max {
            return Err(format!("min delay {:?} exceeds max {:?}", min, max));
        }
        if max > MAX_PLAYOUT_DELAY {
            return Err(format!(
                "max delay {:?} exceeds {:?}",
                max, MAX_PLAYOUT_DELAY
            ));
        }
        Ok(Self {
            body: Bytes::copy_from_slice(&encode_playout_delay(min, max)),
        })
    }
}

impl InterceptorBuilder for PlayoutDelayBuilder {
    fn build(&self, _id: &str) -> InterceptorResult<Arc<dyn Interceptor + Send + Sync>> {
        Ok(Arc::new(PlayoutDelay {
            body: self.body.clone(),
        }))
    }
}

pub struct PlayoutDelay {
    body: Bytes,
}

#[async_trait]
impl Interceptor for PlayoutDelay {
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
        if !info.mime_type.to_ascii_lowercase().starts_with("video/") {
            return writer;
        }
        // Zero means the peer did not accept the extension
        let id = info
            .rtp_header_extensions
            .iter()
            .find(|e| e.uri == PLAYOUT_DELAY_URI)
            .map(|e| e.id as u8)
            .unwrap_or(0);
        if id == 0 {
            return writer;
        }
        debug!("Playout delay on ssrc {} (extension id {})", info.ssrc, id);
        Arc::new(PlayoutDelayWriter {
            id,
            body: self.body.clone(),
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

struct PlayoutDelayWriter {
    id: u8,
    body: Bytes,
    next: Arc<dyn RTPWriter + Send + Sync>,
}

#[async_trait]
impl RTPWriter for PlayoutDelayWriter {
    async fn write(&self, pkt: &Packet, attributes: &Attributes) -> InterceptorResult<usize> {
        let mut stamped = pkt.clone();
        if let Err(e) = stamped.header.set_extension(self.id, self.body.clone()) {
            warn!("Failed to set playout delay extension: {}", e);
            return self.next.write(pkt, attributes).await;
        }
        self.next.write(&stamped, attributes).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use webrtc::interceptor::stream_info::RTPHeaderExtension;
    use webrtc::rtp::header::Header;

    #[derive(Default)]
    struct CaptureWriter {
        packets: Mutex<Vec<Packet>>,
    }

    #[async_trait]
    impl RTPWriter for CaptureWriter {
        async fn write(&self, pkt: &Packet, _a: &Attributes) -> InterceptorResult<usize> {
            self.packets.lock().push(pkt.clone());
            Ok(pkt.payload.len())
        }
    }

    fn stream(mime: &str, extension_id: isize) -> StreamInfo {
        StreamInfo {
            ssrc: 42,
            mime_type: mime.to_string(),
            rtp_header_extensions: vec![RTPHeaderExtension {
                uri: PLAYOUT_DELAY_URI.to_string(),
                id: extension_id,
            }],
            ..Default::default()
        }
    }

    fn packet() -> Packet {
        Packet {
            header: Header {
                version: 2,
                payload_type: 96,
                ssrc: 42,
                ..Default::default()
            },
            payload: Bytes::from_static(b"nal"),
        }
    }

    #[test]
    fn test_encode_default_bounds() {
        // 500 ms -> 50, 1500 ms -> 150
        let body = encode_playout_delay(Duration::from_millis(500), Duration::from_millis(1500));
        assert_eq!(body, [0x03, 0x20, 0x96]);
        let min = ((body[0] as u16) << 4) | (body[1] as u16 >> 4);
        let max = (((body[1] & 0x0f) as u16) << 8) | body[2] as u16;
        assert_eq!((min, max), (50, 150));
    }

    #[test]
    fn test_builder_validates_bounds() {
        assert!(PlayoutDelayBuilder::new(Duration::from_secs(2), Duration::from_secs(1)).is_err());
        assert!(PlayoutDelayBuilder::new(Duration::ZERO, Duration::from_secs(41)).is_err());
        assert!(PlayoutDelayBuilder::new(Duration::ZERO, MAX_PLAYOUT_DELAY).is_ok());
    }

    #[tokio::test]
    async fn test_video_packets_are_stamped() {
        let interceptor = PlayoutDelayBuilder::new(
            Duration::from_millis(500),
            Duration::from_millis(1500),
        )
        .unwrap()
        .build("test")
        .unwrap();
        let capture = Arc::new(CaptureWriter::default());

        let writer = interceptor
            .bind_local_stream(&stream("video/H264", 5), capture.clone())
            .await;
        writer.write(&packet(), &Attributes::new()).await.unwrap();

        let sent = capture.packets.lock().pop().unwrap();
        assert_eq!(
            sent.header.get_extension(5),
            Some(Bytes::from_static(&[0x03, 0x20, 0x96]))
        );
    }

    #[tokio::test]
    async fn test_audio_and_unnegotiated_streams_untouched() {
        let interceptor = PlayoutDelayBuilder::new(Duration::ZERO, Duration::from_secs(1))
            .unwrap()
            .build("test")
            .unwrap();

        for info in [stream("audio/opus", 5), stream("video/H264", 0)] {
            let capture = Arc::new(CaptureWriter::default());
            let writer = interceptor.bind_local_stream(&info, capture.clone()).await;
            writer.write(&packet(), &Attributes::new()).await.unwrap();
            let sent = capture.packets.lock().pop().unwrap();
            assert!(!sent.header.extension);
        }
    }
}
