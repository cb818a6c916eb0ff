//! File-backed media sources

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use webrtc::media::io::h264_reader::H264Reader;
use webrtc::media::io::ogg_reader::OggReader;
use webrtc::media::Error as MediaError;

use super::driver::Cadence;
use crate::error::{AppError, Result};
use crate::webrtc::capability::MediaKind;

/// Largest NAL unit the H.264 reader will buffer
const H264_READER_CAPACITY: usize = 1_048_576;
pub const OPUS_CLOCK_RATE: u32 = 48000;

/// One demuxed unit and its optional embedded timing mark
#[derive(Debug, Clone)]
pub struct MediaUnit {
    pub data: Bytes,
    /// Ogg granule position; `None` for fixed-cadence sources
    pub timing_mark: Option<u64>,
}

/// Lazy, finite sequence of media units
pub trait PlayoutSource: Send {
    /// `Ok(None)` signals a clean end of stream
    fn next_unit(&mut self) -> Result<Option<MediaUnit>>;
}

/// Opens a fresh source per track per session
pub trait SourceProvider: Send + Sync {
    fn open(&self, kind: MediaKind) -> Result<Box<dyn PlayoutSource>>;

    fn cadence(&self, kind: MediaKind) -> Cadence;
}

fn open_file(path: &Path) -> Result<BufReader<File>> {
    let file = File::open(path).map_err(|e| {
        AppError::PlayoutError(format!("Failed to open {}: {}", path.display(), e))
    })?;
    Ok(BufReader::new(file))
}

/// Counts the bytes handed to the wrapped reader's consumer
struct CountingReader<R> {
    inner: R,
    consumed: Arc<AtomicU64>,
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.consumed.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }
}

/// Annex-B H.264 elementary stream, one NAL unit per sample
pub struct H264FileSource {
    reader: H264Reader<BufReader<File>>,
    path: PathBuf,
}

impl H264FileSource {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        Ok(Self {
            reader: H264Reader::new(open_file(path)?, H264_READER_CAPACITY),
            path: path.to_path_buf(),
        })
    }
}

impl PlayoutSource for H264FileSource {
    fn next_unit(&mut self) -> Result<Option<MediaUnit>> {
        match self.reader.next_nal() {
            Ok(nal) => Ok(Some(MediaUnit {
                data: nal.data.freeze(),
                timing_mark: None,
            })),
            // Only raised once the stream is drained with no partial NAL left
            Err(MediaError::ErrIoEOF) => Ok(None),
            Err(e) => Err(AppError::PlayoutError(format!(
                "H.264 decode error in {}: {}",
                self.path.display(),
                e
            ))),
        }
    }
}

/// Ogg/Opus stream, one page per sample
pub struct OggFileSource {
    reader: OggReader<CountingReader<BufReader<File>>>,
    consumed: Arc<AtomicU64>,
    path: PathBuf,
}

impl OggFileSource {
    pub fn open(path: impl AsRef<Path>, verify_checksum: bool) -> Result<Self> {
        let path = path.as_ref();
        let consumed = Arc::new(AtomicU64::new(0));
        let reader = CountingReader {
            inner: open_file(path)?,
            consumed: consumed.clone(),
        };
        let (reader, header) = OggReader::new(reader, verify_checksum).map_err(|e| {
            AppError::PlayoutError(format!("Invalid Ogg header in {}: {}", path.display(), e))
        })?;
        tracing::debug!(
            "Opened {}: {} channel(s) at {} Hz",
            path.display(),
            header.channel_map,
            header.sample_rate
        );
        Ok(Self {
            reader,
            consumed,
            path: path.to_path_buf(),
        })
    }
}

impl PlayoutSource for OggFileSource {
    fn next_unit(&mut self) -> Result<Option<MediaUnit>> {
        let before = self.consumed.load(Ordering::Relaxed);
        match self.reader.parse_next_page() {
            Ok((payload, header)) => Ok(Some(MediaUnit {
                data: payload.freeze(),
                timing_mark: Some(header.granule_position),
            })),
            // Clean end: the file stopped exactly on a page boundary
            Err(_) if self.consumed.load(Ordering::Relaxed) == before => Ok(None),
            Err(e) => Err(AppError::PlayoutError(format!(
                "Ogg decode error in {}: {}",
                self.path.display(),
                e
            ))),
        }
    }
}

/// Source files and pacing parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FileSources {
    pub video_file: PathBuf,
    pub audio_file: PathBuf,
    /// Fixed per-NAL duration for H.264
    pub h264_frame_ms: u64,
    pub verify_ogg_checksum: bool,
}

impl Default for FileSources {
    fn default() -> Self {
        Self {
            video_file: PathBuf::from("output.h264"),
            audio_file: PathBuf::from("output.ogg"),
            h264_frame_ms: 41,
            verify_ogg_checksum: true,
        }
    }
}

impl FileSources {
    /// Fail early if either file is missing
    pub fn check(&self) -> Result<()> {
        for path in [&self.video_file, &self.audio_file] {
            if !path.is_file() {
                return Err(AppError::Config(format!(
                    "media file not found: {}",
                    path.display()
                )));
            }
        }
        Ok(())
    }
}

impl SourceProvider for FileSources {
    fn open(&self, kind: MediaKind) -> Result<Box<dyn PlayoutSource>> {
        match kind {
            MediaKind::Video => Ok(Box::new(H264FileSource::open(&self.video_file)?)),
            MediaKind::Audio => Ok(Box::new(OggFileSource::open(
                &self.audio_file,
                self.verify_ogg_checksum,
            )?)),
        }
    }

    fn cadence(&self, kind: MediaKind) -> Cadence {
        match kind {
            MediaKind::Video => Cadence::Fixed(Duration::from_millis(self.h264_frame_ms)),
            MediaKind::Audio => Cadence::Embedded {
                clock_rate: OPUS_CLOCK_RATE,
            },
        }
    }
}
