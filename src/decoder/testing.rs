//! Test fixtures: encoded GIFs and a scripted in-memory backend
use super::{normalize_delay, BackendFactory, DecodeBackend};

use anyhow::{bail, Result};
use image::codecs::gif::{GifEncoder, Repeat};
use image::{Delay, Frame, Rgba, RgbaImage};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Color used for frame `index` in generated fixtures
pub fn frame_color(index: usize) -> Rgba<u8> {
    const PALETTE: [[u8; 4]; 4] = [
        [255, 0, 0, 255],
        [0, 255, 0, 255],
        [0, 0, 255, 255],
        [255, 255, 255, 255],
    ];
    Rgba(PALETTE[index % PALETTE.len()])
}

/// Encodes a looping GIF with one solid-colored frame per delay
pub fn build_gif(width: u32, height: u32, delays_ms: &[u32]) -> Vec<u8> {
    let mut out = Vec::new();
    {
        let mut encoder = GifEncoder::new(&mut out);
        encoder.set_repeat(Repeat::Infinite).unwrap();
        let frames = delays_ms.iter().enumerate().map(|(index, delay_ms)| {
            let rgba = RgbaImage::from_pixel(width, height, frame_color(index));
            Frame::from_parts(rgba, 0, 0, Delay::from_numer_denom_ms(*delay_ms, 1))
        });
        encoder.encode_frames(frames).unwrap();
    }
    out
}

/// Counts decode calls so tests can observe the producer from outside
#[derive(Clone, Default)]
pub struct DecodeCounter(Arc<AtomicUsize>);

impl DecodeCounter {
    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

/// Backend producing solid frames whose red channel is the frame index
pub struct SyntheticClip {
    pub size: (u32, u32),
    pub frames: usize,
    pub delay_ms: u32,
    /// Total decode count after which decoding fails for good
    pub fail_after: Option<usize>,
    pub fail_open: bool,
    decoded: usize,
    counter: DecodeCounter,
}

impl SyntheticClip {
    pub fn new(size: (u32, u32), frames: usize, delay_ms: u32) -> Self {
        Self {
            size,
            frames,
            delay_ms,
            fail_after: None,
            fail_open: false,
            decoded: 0,
            counter: DecodeCounter::default(),
        }
    }

    pub fn failing_after(mut self, decodes: usize) -> Self {
        self.fail_after = Some(decodes);
        self
    }

    pub fn failing_open(mut self) -> Self {
        self.fail_open = true;
        self
    }

    /// Reports decodes to an existing counter
    pub fn with_counter(mut self, counter: DecodeCounter) -> Self {
        self.counter = counter;
        self
    }

    fn index(&self) -> usize {
        (self.decoded.max(1) - 1) % self.frames
    }
}

/// Red channel value synthetic frames carry for `index`
pub fn synthetic_marker(index: usize) -> u8 {
    (index * 10) as u8
}

impl DecodeBackend for SyntheticClip {
    fn open(&mut self) -> Result<()> {
        if self.fail_open {
            bail!("synthetic open failure");
        }
        Ok(())
    }

    fn read_next_frame(&mut self) -> Result<()> {
        if let Some(limit) = self.fail_after {
            if self.decoded >= limit {
                bail!("synthetic stream failure");
            }
        }
        self.decoded += 1;
        self.counter.0.store(self.decoded, Ordering::SeqCst);
        Ok(())
    }

    fn render_frame(&mut self, to: &mut RgbaImage, size: (u32, u32)) -> Result<bool> {
        if self.decoded == 0 {
            bail!("nothing decoded");
        }
        *to = RgbaImage::from_pixel(size.0, size.1, Rgba([synthetic_marker(self.index()), 0, 0, 255]));
        Ok(false)
    }

    fn frame_size(&self) -> (u32, u32) {
        if self.decoded == 0 {
            (0, 0)
        } else {
            self.size
        }
    }

    fn next_frame_delay(&self) -> u32 {
        normalize_delay(self.delay_ms)
    }

    fn name(&self) -> &'static str {
        "synthetic"
    }
}

/// Factory building a fresh synthetic clip for every reader
pub fn synthetic_factory(make: impl Fn() -> SyntheticClip + Send + Sync + 'static) -> BackendFactory {
    Arc::new(move |_, _, _| Ok(Box::new(make()) as Box<dyn DecodeBackend>))
}
