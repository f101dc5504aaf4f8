//! Timestamp driven playback of demuxed video streams
use super::{normalize_delay, render_scaled, ClipMode, DecodeBackend};

use anyhow::{bail, Context, Result};
use image::RgbaImage;

/// Consecutive undecodable packets tolerated before the stream counts as broken
const MAX_SKIPPED_PACKETS: usize = 64;
/// Used when a stream carries neither durations nor usable timestamps
const FALLBACK_FRAME_DELAY_MS: i64 = 40;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamInfo {
    pub width: u32,
    pub height: u32,
    /// Seconds per timestamp tick as `(numerator, denominator)`
    pub time_base: (i64, i64),
    pub has_audio: bool,
    pub byte_len: u64,
}

/// A decoded picture with timestamps in stream time base units
#[derive(Clone, Debug)]
pub struct VideoPicture {
    pub pts: Option<i64>,
    pub duration: Option<i64>,
    pub image: RgbaImage,
}

#[derive(Debug)]
pub enum DemuxStep {
    Picture(VideoPicture),
    /// A packet failed to decode, the stream itself is still usable
    Corrupt(anyhow::Error),
    EndOfStream,
}

/// Container and codec access for `VideoBackend`
pub trait MediaDemuxer {
    fn open(&mut self) -> Result<StreamInfo>;

    /// Decodes until the next picture, a skippable packet error or the end
    fn next_picture(&mut self) -> Result<DemuxStep>;

    /// Seeks to the start and drops all buffered decoder state
    fn rewind(&mut self) -> Result<()>;
}

/// Plays a demuxed video stream as an endless loop
pub struct VideoBackend<D> {
    demuxer: D,
    mode: ClipMode,
    max_silent_bytes: u64,
    info: Option<StreamInfo>,
    current: Option<RgbaImage>,
    /// Media time of the current frame, counted across loops
    current_ms: i64,
    /// Media time at which the current pass started
    loop_offset_ms: i64,
    /// Stream time of the first frame in this pass
    pass_start_ms: Option<i64>,
    last_stream_ms: Option<i64>,
    frame_delay_ms: u32,
    skipped_packets: usize,
}

impl<D: MediaDemuxer> VideoBackend<D> {
    pub fn new(demuxer: D, mode: ClipMode, max_silent_bytes: u64) -> Self {
        Self {
            demuxer,
            mode,
            max_silent_bytes,
            info: None,
            current: None,
            current_ms: 0,
            loop_offset_ms: 0,
            pass_start_ms: None,
            last_stream_ms: None,
            frame_delay_ms: 0,
            skipped_packets: 0,
        }
    }

    /// Media time of the current frame in milliseconds
    pub fn current_media_ms(&self) -> i64 {
        self.current_ms
    }

    pub fn stream_info(&self) -> Option<StreamInfo> {
        self.info
    }

    fn to_ms(&self, ticks: i64) -> i64 {
        let (num, den) = self.info.map(|info| info.time_base).unwrap_or((1, 1000));
        if den == 0 {
            return 0;
        }
        (i128::from(ticks) * 1000 * i128::from(num) / i128::from(den)) as i64
    }

    fn accept(&mut self, picture: VideoPicture) {
        let previous_delay = i64::from(self.frame_delay_ms);
        let stream_ms = match picture.pts {
            Some(pts) => self.to_ms(pts),
            None => self
                .last_stream_ms
                .map_or(0, |last| last + previous_delay.max(1)),
        };

        let gap = self
            .last_stream_ms
            .map(|last| stream_ms - last)
            .filter(|gap| *gap > 0);
        let duration = picture
            .duration
            .map(|duration| self.to_ms(duration))
            .filter(|duration| *duration > 0);
        let delay = duration
            .or(gap)
            .or((previous_delay > 0).then_some(previous_delay))
            .unwrap_or(FALLBACK_FRAME_DELAY_MS);

        let pass_start = *self.pass_start_ms.get_or_insert(stream_ms);
        self.current_ms = self.loop_offset_ms + (stream_ms - pass_start).max(0);
        self.last_stream_ms = Some(stream_ms);
        self.frame_delay_ms = normalize_delay(delay.clamp(0, i64::from(u32::MAX)) as u32);
        self.current = Some(picture.image);
    }

    fn rewind(&mut self) -> Result<()> {
        self.demuxer.rewind().context("Failed to rewind video")?;
        self.loop_offset_ms = self.current_ms + i64::from(self.frame_delay_ms);
        self.pass_start_ms = None;
        self.last_stream_ms = None;
        log::debug!("Video looped at {} ms", self.loop_offset_ms);
        Ok(())
    }
}

impl<D: MediaDemuxer> DecodeBackend for VideoBackend<D> {
    fn open(&mut self) -> Result<()> {
        let info = self.demuxer.open().context("Failed to open video stream")?;

        if self.mode == ClipMode::Gif {
            if info.has_audio {
                bail!("Clip has an audio track and cannot play as a silent loop");
            }
            if info.byte_len > self.max_silent_bytes {
                bail!(
                    "Clip is {} bytes, silent loops are limited to {} bytes",
                    info.byte_len,
                    self.max_silent_bytes
                );
            }
        }
        if info.width == 0 || info.height == 0 {
            bail!("Video stream reports no picture size");
        }

        log::info!(
            "Video clip: {}x{}, time base {}/{}",
            info.width,
            info.height,
            info.time_base.0,
            info.time_base.1
        );
        self.info = Some(info);
        Ok(())
    }

    fn read_next_frame(&mut self) -> Result<()> {
        if self.info.is_none() {
            bail!("Video stream not opened");
        }

        let mut rewound = false;
        loop {
            match self.demuxer.next_picture()? {
                DemuxStep::Picture(picture) => {
                    self.skipped_packets = 0;
                    self.accept(picture);
                    return Ok(());
                }
                DemuxStep::Corrupt(err) => {
                    self.skipped_packets += 1;
                    if self.skipped_packets > MAX_SKIPPED_PACKETS {
                        return Err(err.context("Too many undecodable packets in a row"));
                    }
                    log::warn!("Skipping undecodable packet: {:#}", err);
                }
                DemuxStep::EndOfStream => {
                    if rewound || self.current.is_none() {
                        bail!("Video stream contains no decodable frames");
                    }
                    self.rewind()?;
                    rewound = true;
                }
            }
        }
    }

    fn render_frame(&mut self, to: &mut RgbaImage, size: (u32, u32)) -> Result<bool> {
        match &self.current {
            Some(frame) => render_scaled(frame, to, size),
            None => bail!("No frame decoded yet"),
        }
    }

    fn frame_size(&self) -> (u32, u32) {
        self.current
            .as_ref()
            .map(|frame| frame.dimensions())
            .unwrap_or((0, 0))
    }

    fn next_frame_delay(&self) -> u32 {
        self.frame_delay_ms
    }

    fn name(&self) -> &'static str {
        "video"
    }
}
