//! JPEG XL stills and animations through jxl-rs
use super::rgb_conversion::{frame_to_rgba8, main_channel_samples};
use super::{normalize_delay, render_scaled, DecodeBackend};

use anyhow::{bail, Result};
use image::RgbaImage;
use jxl::api::{
    states::WithImageInfo, JxlColorType, JxlDecoder, JxlDecoderOptions, JxlOutputBuffer,
    ProcessingResult,
};
use jxl::image::{Image, Rect};

use std::panic;
use std::sync::Arc;

const CODESTREAM_SIGNATURE: [u8; 2] = [0xFF, 0x0A];
const CONTAINER_SIGNATURE: [u8; 12] = [
    0x00, 0x00, 0x00, 0x0C, 0x4A, 0x58, 0x4C, 0x20, 0x0D, 0x0A, 0x87, 0x0A,
];

pub fn is_jxl(header: &[u8]) -> bool {
    header.starts_with(&CODESTREAM_SIGNATURE) || header.starts_with(&CONTAINER_SIGNATURE)
}

#[derive(Clone, Copy, Debug)]
struct StreamLayout {
    width: usize,
    height: usize,
    color_type: JxlColorType,
    extra_channels: usize,
    animated: bool,
}

/// Frame indexed JPEG XL decoding.
///
/// The whole codestream stays in memory; looping restarts the decoder at
/// offset zero.
pub struct JxlAnimation {
    data: Arc<[u8]>,
    /// Bytes consumed by the decoder so far
    offset: usize,
    decoder: Option<JxlDecoder<WithImageInfo>>,
    layout: Option<StreamLayout>,
    current: Option<RgbaImage>,
    delay_ms: u32,
    index: usize,
}

impl JxlAnimation {
    pub fn new(data: Arc<[u8]>) -> Self {
        Self {
            data,
            offset: 0,
            decoder: None,
            layout: None,
            current: None,
            delay_ms: 0,
            index: 0,
        }
    }

    fn options() -> JxlDecoderOptions {
        let mut options = JxlDecoderOptions::default();
        options.adjust_orientation = true;
        options.coalescing = true; // Blend frames for animation
        options.premultiply_output = false;
        options
    }

    /// Decodes the header and leaves the decoder right before the first frame
    fn restart(&mut self) -> Result<()> {
        let mut input: &[u8] = &self.data;
        let decoder = JxlDecoder::new(Self::options());

        let decoder_with_info = match decoder.process(&mut input)? {
            ProcessingResult::Complete { result } => result,
            ProcessingResult::NeedsMoreInput { .. } => {
                bail!("Truncated JXL header");
            }
        };

        let basic_info = decoder_with_info.basic_info();
        let (width, height) = basic_info.size;
        let layout = StreamLayout {
            width,
            height,
            color_type: decoder_with_info.current_pixel_format().color_type,
            extra_channels: basic_info.extra_channels.len(),
            animated: basic_info.animation.is_some(),
        };

        if self.layout.is_none() {
            log::info!(
                "JXL clip: {}x{}, color type: {:?}, animated: {}",
                width,
                height,
                layout.color_type,
                layout.animated
            );
        }

        self.offset = self.data.len() - input.len();
        self.layout = Some(layout);
        self.decoder = Some(decoder_with_info);
        self.index = 0;
        Ok(())
    }

    /// Decodes one frame, `Ok(false)` at the end of the animation
    fn decode_frame(&mut self) -> Result<bool> {
        let Some(layout) = self.layout else {
            bail!("JXL decoder not opened");
        };
        let Some(decoder) = self.decoder.take() else {
            return Ok(false);
        };

        let data = Arc::clone(&self.data);
        let mut input: &[u8] = &data[self.offset..];

        // jxl-rs asserts instead of erroring when asked for a frame past the last one
        let decoder_with_frame =
            match panic::catch_unwind(panic::AssertUnwindSafe(|| decoder.process(&mut input))) {
                Ok(Ok(ProcessingResult::Complete { result })) => result,
                Ok(Ok(ProcessingResult::NeedsMoreInput { .. })) | Err(_) => return Ok(false),
                Ok(Err(e)) => return Err(e.into()),
            };

        let frame_header = decoder_with_frame.frame_header();
        let delay_ms = frame_header.duration.unwrap_or(100.0) as u32;

        let samples = main_channel_samples(layout.color_type);
        let mut main_channel = Image::<f32>::new((layout.width * samples, layout.height))?;
        let mut extra_channel_buffers: Vec<Image<f32>> = (0..layout.extra_channels)
            .map(|_| Image::<f32>::new((layout.width, layout.height)))
            .collect::<Result<Vec<_>, _>>()?;

        let rect = Rect {
            size: main_channel.size(),
            origin: (0, 0),
        };

        let mut output_bufs = vec![JxlOutputBuffer::from_image_rect_mut(
            main_channel.get_rect_mut(rect).into_raw(),
        )];
        for extra in &mut extra_channel_buffers {
            let extra_rect = Rect {
                size: extra.size(),
                origin: (0, 0),
            };
            output_bufs.push(JxlOutputBuffer::from_image_rect_mut(
                extra.get_rect_mut(extra_rect).into_raw(),
            ));
        }

        let decoder = match decoder_with_frame.process(&mut input, &mut output_bufs)? {
            ProcessingResult::Complete { result } => result,
            ProcessingResult::NeedsMoreInput { .. } => {
                bail!("Truncated JXL frame");
            }
        };
        drop(output_bufs);

        let alpha = match layout.color_type {
            JxlColorType::Grayscale => None,
            _ => extra_channel_buffers.first(),
        };
        let rgba = frame_to_rgba8(&main_channel, alpha, layout.color_type, layout.width, layout.height);
        let frame = RgbaImage::from_raw(layout.width as u32, layout.height as u32, rgba);
        let Some(frame) = frame else {
            bail!("JXL frame buffer has the wrong size");
        };

        self.offset = data.len() - input.len();
        self.decoder = Some(decoder);
        self.current = Some(frame);
        self.delay_ms = normalize_delay(delay_ms);
        self.index += 1;

        Ok(true)
    }
}

impl DecodeBackend for JxlAnimation {
    fn open(&mut self) -> Result<()> {
        self.restart()
    }

    fn read_next_frame(&mut self) -> Result<()> {
        if self.layout.is_none() {
            self.restart()?;
        }

        // Stills never change, keep showing the decoded frame
        if self.current.is_some() && self.layout.is_some_and(|layout| !layout.animated) {
            return Ok(());
        }

        if self.decode_frame()? {
            return Ok(());
        }

        if self.index == 0 {
            bail!("JXL stream contains no frames");
        }

        log::debug!("JXL animation looped after {} frames", self.index);
        self.restart()?;
        if !self.decode_frame()? {
            bail!("JXL stream lost its frames on restart");
        }
        Ok(())
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
        self.delay_ms
    }

    fn name(&self) -> &'static str {
        "jxl-rs"
    }
}
