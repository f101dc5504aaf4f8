//! Container and codec access through FFmpeg
use super::video::{DemuxStep, MediaDemuxer, StreamInfo, VideoPicture};
use super::ClipSource;

use anyhow::{anyhow, Context, Result};
use ffmpeg_next as ffmpeg;
use image::RgbaImage;

use std::io::Write;
use std::path::PathBuf;

/// Demuxes and decodes the best video stream of a container
pub struct FfmpegDemuxer {
    path: PathBuf,
    byte_len: u64,
    /// Keeps spilled in-memory sources alive for FFmpeg
    _spill: Option<tempfile::NamedTempFile>,
    input: Option<ffmpeg::format::context::Input>,
    decoder: Option<ffmpeg::decoder::Video>,
    scaler: Option<ffmpeg::software::scaling::Context>,
    stream_index: usize,
    draining: bool,
}

impl FfmpegDemuxer {
    pub fn new(source: ClipSource) -> Result<Self> {
        let byte_len = source.byte_len()?;
        let (path, spill) = match source {
            ClipSource::File(path) => (path, None),
            ClipSource::Memory(bytes) => {
                // FFmpeg wants something it can open by name
                let mut file = tempfile::NamedTempFile::new().context("Could not spill clip to disk")?;
                file.write_all(&bytes).context("Could not spill clip to disk")?;
                (file.path().to_path_buf(), Some(file))
            }
        };

        Ok(Self {
            path,
            byte_len,
            _spill: spill,
            input: None,
            decoder: None,
            scaler: None,
            stream_index: 0,
            draining: false,
        })
    }

    fn to_rgba(&mut self, frame: &ffmpeg::frame::Video) -> Result<RgbaImage> {
        let scaler = self.scaler.as_mut().context("Video decoder not opened")?;
        let mut rgba_frame = ffmpeg::frame::Video::empty();
        scaler
            .run(frame, &mut rgba_frame)
            .context("Failed to convert video frame")?;

        let width = rgba_frame.width();
        let height = rgba_frame.height();
        let data = rgba_frame.data(0);
        let stride = rgba_frame.stride(0);

        let mut rgba_bytes = Vec::with_capacity((width * height * 4) as usize);
        for y in 0..height as usize {
            let row_start = y * stride;
            rgba_bytes.extend_from_slice(&data[row_start..row_start + width as usize * 4]);
        }

        RgbaImage::from_raw(width, height, rgba_bytes).context("Video frame has the wrong size")
    }

    fn receive_picture(&mut self) -> Result<Option<VideoPicture>> {
        let decoder = self.decoder.as_mut().context("Video decoder not opened")?;
        let mut decoded = ffmpeg::frame::Video::empty();
        if decoder.receive_frame(&mut decoded).is_err() {
            return Ok(None);
        }

        let image = self.to_rgba(&decoded)?;
        Ok(Some(VideoPicture {
            pts: decoded.timestamp(),
            duration: None,
            image,
        }))
    }
}

impl MediaDemuxer for FfmpegDemuxer {
    fn open(&mut self) -> Result<StreamInfo> {
        ffmpeg::init().context("Failed to initialize FFmpeg")?;

        let input = ffmpeg::format::input(&self.path)
            .with_context(|| format!("Failed to open video {}", self.path.display()))?;
        let stream = input
            .streams()
            .best(ffmpeg::media::Type::Video)
            .context("No video stream found")?;
        let has_audio = input.streams().best(ffmpeg::media::Type::Audio).is_some();
        let time_base = stream.time_base();

        let context = ffmpeg::codec::context::Context::from_parameters(stream.parameters())
            .context("Failed to create codec context")?;
        let decoder = context
            .decoder()
            .video()
            .context("Failed to create video decoder")?;

        let scaler = ffmpeg::software::scaling::Context::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            ffmpeg::format::Pixel::RGBA,
            decoder.width(),
            decoder.height(),
            ffmpeg::software::scaling::Flags::BILINEAR,
        )
        .context("Failed to create scaler")?;

        let info = StreamInfo {
            width: decoder.width(),
            height: decoder.height(),
            time_base: (
                i64::from(time_base.numerator()),
                i64::from(time_base.denominator()),
            ),
            has_audio,
            byte_len: self.byte_len,
        };

        self.stream_index = stream.index();
        self.decoder = Some(decoder);
        self.scaler = Some(scaler);
        self.input = Some(input);
        self.draining = false;
        Ok(info)
    }

    fn next_picture(&mut self) -> Result<DemuxStep> {
        loop {
            if let Some(picture) = self.receive_picture()? {
                return Ok(DemuxStep::Picture(picture));
            }
            if self.draining {
                return Ok(DemuxStep::EndOfStream);
            }

            let input = self.input.as_mut().context("Video input not opened")?;
            let next = input.packets().next();
            let decoder = self.decoder.as_mut().context("Video decoder not opened")?;
            match next {
                Some((stream, packet)) => {
                    if stream.index() != self.stream_index {
                        continue;
                    }
                    if let Err(err) = decoder.send_packet(&packet) {
                        return Ok(DemuxStep::Corrupt(anyhow!("Packet rejected: {}", err)));
                    }
                }
                None => {
                    decoder
                        .send_eof()
                        .context("Failed to flush video decoder")?;
                    self.draining = true;
                }
            }
        }
    }

    fn rewind(&mut self) -> Result<()> {
        let input = self.input.as_mut().context("Video input not opened")?;
        input.seek(0, ..0).context("Failed to seek to start")?;
        if let Some(decoder) = self.decoder.as_mut() {
            decoder.flush();
        }
        self.draining = false;
        Ok(())
    }
}
