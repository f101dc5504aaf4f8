//! Decode backends: format specific frame producers behind one trait
pub mod image_anim;
pub mod jxl_anim;
pub mod rgb_conversion;
pub mod video;

#[cfg(feature = "ffmpeg")]
pub mod ffmpeg;

#[cfg(test)]
pub(crate) mod testing;

pub use image_anim::AnimatedImage;
pub use jxl_anim::JxlAnimation;
pub use video::{MediaDemuxer, StreamInfo, VideoBackend, VideoPicture};

use crate::config::ClipConfig;

use anyhow::{bail, Context, Result};
use image::imageops::FilterType;
use image::RgbaImage;

use std::fs::File;
use std::io::{BufReader, Cursor, Read};
use std::path::PathBuf;
use std::sync::Arc;

/// Delays below this are treated as "unspecified" by most encoders
const MIN_FRAME_DELAY_MS: u32 = 10;
const DEFAULT_FRAME_DELAY_MS: u32 = 100;

/// Where the clip bytes come from
#[derive(Clone, Debug)]
pub enum ClipSource {
    File(PathBuf),
    Memory(Arc<[u8]>),
}

impl ClipSource {
    pub fn from_bytes(bytes: impl Into<Arc<[u8]>>) -> Self {
        Self::Memory(bytes.into())
    }

    /// Reads small files into memory so the worker never touches the disk again.
    ///
    /// Larger files stay on disk and are streamed by the backend.
    pub fn load(self, in_memory_limit: u64) -> Result<Self> {
        match self {
            Self::File(path) => {
                let size = std::fs::metadata(&path)
                    .with_context(|| format!("Could not stat clip {}", path.display()))?
                    .len();
                if size > in_memory_limit {
                    log::debug!("Streaming {} ({} bytes) from disk", path.display(), size);
                    return Ok(Self::File(path));
                }
                let bytes = std::fs::read(&path)
                    .with_context(|| format!("Could not read clip {}", path.display()))?;
                Ok(Self::Memory(bytes.into()))
            }
            memory => Ok(memory),
        }
    }

    /// Size of the underlying stream in bytes
    pub fn byte_len(&self) -> Result<u64> {
        match self {
            Self::File(path) => Ok(std::fs::metadata(path)
                .with_context(|| format!("Could not stat clip {}", path.display()))?
                .len()),
            Self::Memory(bytes) => Ok(bytes.len() as u64),
        }
    }

    /// First bytes of the stream, enough for format sniffing
    pub fn header(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        match self {
            Self::File(path) => {
                let file = File::open(path)
                    .with_context(|| format!("Could not open clip {}", path.display()))?;
                file.take(64)
                    .read_to_end(&mut buf)
                    .context("Could not read clip header")?;
            }
            Self::Memory(bytes) => buf.extend_from_slice(&bytes[..bytes.len().min(64)]),
        }
        Ok(buf)
    }

    /// Whole stream as shared bytes, reading the file if needed
    pub fn into_bytes(self) -> Result<Arc<[u8]>> {
        match self {
            Self::File(path) => Ok(std::fs::read(&path)
                .with_context(|| format!("Could not read clip {}", path.display()))?
                .into()),
            Self::Memory(bytes) => Ok(bytes),
        }
    }

    /// A fresh seekable reader positioned at the start of the stream
    pub(crate) fn reader(&self) -> Result<ClipInput> {
        match self {
            Self::File(path) => Ok(ClipInput::File(BufReader::new(
                File::open(path).with_context(|| format!("Could not open clip {}", path.display()))?,
            ))),
            Self::Memory(bytes) => Ok(ClipInput::Memory(Cursor::new(Arc::clone(bytes)))),
        }
    }
}

/// Buffered, seekable input over either source kind
pub(crate) enum ClipInput {
    File(BufReader<File>),
    Memory(Cursor<Arc<[u8]>>),
}

impl Read for ClipInput {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Self::File(reader) => reader.read(buf),
            Self::Memory(cursor) => cursor.read(buf),
        }
    }
}

impl std::io::BufRead for ClipInput {
    fn fill_buf(&mut self) -> std::io::Result<&[u8]> {
        match self {
            Self::File(reader) => reader.fill_buf(),
            Self::Memory(cursor) => cursor.fill_buf(),
        }
    }

    fn consume(&mut self, amt: usize) {
        match self {
            Self::File(reader) => reader.consume(amt),
            Self::Memory(cursor) => cursor.consume(amt),
        }
    }
}

impl std::io::Seek for ClipInput {
    fn seek(&mut self, pos: std::io::SeekFrom) -> std::io::Result<u64> {
        match self {
            Self::File(reader) => reader.seek(pos),
            Self::Memory(cursor) => cursor.seek(pos),
        }
    }
}

/// How a clip is going to be presented
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ClipMode {
    /// Silent, endlessly looping clip (GIF-like). Subject to admission limits.
    #[default]
    Gif,
    /// Regular video, audio tracks are tolerated (and ignored)
    Video,
}

/// A format specific frame producer.
///
/// Backends are created and used on a single worker thread, so they need not
/// be `Send`.
pub trait DecodeBackend {
    /// Opens the stream and validates that it can be played in this mode
    fn open(&mut self) -> Result<()>;

    /// Advances to the next frame, looping back to the start at end of stream
    fn read_next_frame(&mut self) -> Result<()>;

    /// Renders the current frame into `to` at `size`, returns whether it has alpha
    fn render_frame(&mut self, to: &mut RgbaImage, size: (u32, u32)) -> Result<bool>;

    /// Native size of the current frame, `(0, 0)` before the first one
    fn frame_size(&self) -> (u32, u32);

    /// How long the current frame stays on screen, in milliseconds
    fn next_frame_delay(&self) -> u32;

    fn name(&self) -> &'static str;
}

/// Constructs backends on the worker thread that is going to drive them
pub type BackendFactory =
    Arc<dyn Fn(ClipSource, ClipMode, &ClipConfig) -> Result<Box<dyn DecodeBackend>> + Send + Sync>;

/// Picks a backend by sniffing the stream header
pub fn open_backend(
    source: ClipSource,
    mode: ClipMode,
    config: &ClipConfig,
) -> Result<Box<dyn DecodeBackend>> {
    let source = source.load(config.in_memory_limit)?;
    let header = source.header()?;

    if jxl_anim::is_jxl(&header) {
        log::debug!("Detected JPEG XL clip");
        return Ok(Box::new(JxlAnimation::new(source.into_bytes()?)));
    }

    match image::guess_format(&header) {
        Ok(format @ (image::ImageFormat::Gif | image::ImageFormat::Png | image::ImageFormat::WebP)) => {
            log::debug!("Detected {:?} clip", format);
            return Ok(Box::new(AnimatedImage::new(source, format)));
        }
        Ok(format) => log::debug!("{:?} is not an animation format, trying video", format),
        Err(_) => {}
    }

    open_video(source, mode, config)
}

#[cfg(feature = "ffmpeg")]
fn open_video(
    source: ClipSource,
    mode: ClipMode,
    config: &ClipConfig,
) -> Result<Box<dyn DecodeBackend>> {
    let demuxer = ffmpeg::FfmpegDemuxer::new(source)?;
    Ok(Box::new(VideoBackend::new(
        demuxer,
        mode,
        config.silent_clip_max_bytes,
    )))
}

#[cfg(not(feature = "ffmpeg"))]
fn open_video(
    _source: ClipSource,
    _mode: ClipMode,
    _config: &ClipConfig,
) -> Result<Box<dyn DecodeBackend>> {
    bail!("Unsupported clip format (video support is not compiled in)")
}

/// Default factory used by `ClipScheduler::new`
pub fn default_factory() -> BackendFactory {
    Arc::new(open_backend)
}

pub(crate) fn normalize_delay(delay_ms: u32) -> u32 {
    if delay_ms < MIN_FRAME_DELAY_MS {
        DEFAULT_FRAME_DELAY_MS
    } else {
        delay_ms
    }
}

/// Scales `frame` into `to`, reusing the allocation when sizes match
pub(crate) fn render_scaled(frame: &RgbaImage, to: &mut RgbaImage, size: (u32, u32)) -> Result<bool> {
    let (width, height) = size;
    if width == 0 || height == 0 {
        bail!("Cannot render a frame at {}x{}", width, height);
    }

    if frame.dimensions() == size {
        if to.dimensions() == size {
            to.copy_from_slice(frame.as_raw());
        } else {
            *to = frame.clone();
        }
    } else {
        *to = image::imageops::resize(frame, width, height, FilterType::Triangle);
    }

    Ok(has_alpha(frame))
}

pub(crate) fn has_alpha(frame: &RgbaImage) -> bool {
    frame.pixels().any(|pixel| pixel.0[3] < 255)
}
