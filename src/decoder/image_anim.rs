//! GIF, APNG and animated WebP through image-rs
use super::{normalize_delay, render_scaled, ClipSource, DecodeBackend};

use anyhow::{bail, Context, Result};
use image::codecs::gif::GifDecoder;
use image::codecs::png::PngDecoder;
use image::codecs::webp::WebPDecoder;
use image::{AnimationDecoder, Frames, ImageFormat, RgbaImage};

use std::io::{BufRead, Seek};

/// Frame indexed animation decoded with image-rs.
///
/// Loops by reopening the stream and starting over at frame zero.
pub struct AnimatedImage {
    source: ClipSource,
    format: ImageFormat,
    frames: Option<Frames<'static>>,
    current: Option<RgbaImage>,
    delay_ms: u32,
    /// Index of the current frame within the loop
    index: usize,
    /// Known after the first full pass
    frame_count: Option<usize>,
}

impl AnimatedImage {
    pub fn new(source: ClipSource, format: ImageFormat) -> Self {
        Self {
            source,
            format,
            frames: None,
            current: None,
            delay_ms: 0,
            index: 0,
            frame_count: None,
        }
    }

    pub fn frame_index(&self) -> usize {
        self.index.saturating_sub(1)
    }

    pub fn frame_count(&self) -> Option<usize> {
        self.frame_count
    }

    fn frames(&self) -> Result<Frames<'static>> {
        let reader = self.source.reader()?;
        decode_frames(reader, self.format)
    }

    fn next_frame(&mut self) -> Option<image::ImageResult<image::Frame>> {
        self.frames.as_mut().and_then(|frames| frames.next())
    }
}

fn decode_frames<R>(reader: R, format: ImageFormat) -> Result<Frames<'static>>
where
    R: BufRead + Seek + 'static,
{
    let frames = match format {
        ImageFormat::Gif => GifDecoder::new(reader)
            .context("Failed to open GIF")?
            .into_frames(),
        ImageFormat::Png => {
            let decoder = PngDecoder::new(reader).context("Failed to open PNG")?;
            if !decoder.is_apng().context("Failed to read PNG animation info")? {
                bail!("PNG is not animated");
            }
            decoder
                .apng()
                .context("Failed to open APNG")?
                .into_frames()
        }
        ImageFormat::WebP => WebPDecoder::new(reader)
            .context("Failed to open WebP")?
            .into_frames(),
        format => bail!("{:?} has no animation support", format),
    };

    Ok(frames)
}

impl DecodeBackend for AnimatedImage {
    fn open(&mut self) -> Result<()> {
        self.frames = Some(self.frames()?);
        self.index = 0;
        Ok(())
    }

    fn read_next_frame(&mut self) -> Result<()> {
        if self.frames.is_none() {
            self.open()?;
        }

        let frame = match self.next_frame() {
            Some(frame) => frame,
            None => {
                if self.index == 0 {
                    bail!("Animation contains no frames");
                }

                // End of the loop, start over at frame zero
                self.frame_count = Some(self.index);
                self.index = 0;
                self.frames = Some(self.frames()?);
                match self.next_frame() {
                    Some(frame) => frame,
                    None => bail!("Animation lost its frames on restart"),
                }
            }
        };

        let frame = frame.context("Failed to decode animation frame")?;
        let (numer, denom) = frame.delay().numer_denom_ms();
        let delay_ms = if denom == 0 { 0 } else { numer / denom };

        self.delay_ms = normalize_delay(delay_ms);
        self.current = Some(frame.into_buffer());
        self.index += 1;

        Ok(())
    }

    fn render_frame(&mut self, to: &mut RgbaImage, size: (u32, u32)) -> Result<bool> {
        let frame = self
            .current
            .as_ref()
            .context("No frame decoded yet")?;
        render_scaled(frame, to, size)
    }

    fn frame_size(&self) -> (u32, u32) {
        self.current
            .as_ref()
            .map(|frame| frame.dimensions())
            .unwrap_or((0, 0))
    }

    fn next_frame_delay(&self) -> u32 {
        self.delay_ms
    }

    fn name(&self) -> &'static str {
        "image-rs"
    }
}
