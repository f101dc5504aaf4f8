use image::{imageops, Rgba, RgbaImage};

use std::sync::Arc;

/// Corner radius in logical pixels for rounded frames
const ROUND_RADIUS: u32 = 6;

/// Size and styling the consumer wants frames rendered at.
///
/// `frame_*` is the size of the picture itself, `outer_*` the box it is
/// centered in; both are logical pixels multiplied by `factor`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameRequest {
    pub frame_width: u32,
    pub frame_height: u32,
    pub outer_width: u32,
    pub outer_height: u32,
    pub factor: u32,
    pub rounded: bool,
}

impl Default for FrameRequest {
    fn default() -> Self {
        Self {
            frame_width: 0,
            frame_height: 0,
            outer_width: 0,
            outer_height: 0,
            factor: 1,
            rounded: false,
        }
    }
}

impl FrameRequest {
    pub fn new(frame_width: u32, frame_height: u32, outer_width: u32, outer_height: u32, rounded: bool) -> Self {
        Self {
            frame_width,
            frame_height,
            outer_width,
            outer_height,
            factor: 1,
            rounded,
        }
    }

    pub fn with_factor(mut self, factor: u32) -> Self {
        self.factor = factor.max(1);
        self
    }

    pub fn is_valid(&self) -> bool {
        let (width, height) = self.frame_size();
        width > 0 && height > 0
    }

    /// Picture size in device pixels
    pub fn frame_size(&self) -> (u32, u32) {
        (
            self.frame_width.saturating_mul(self.factor),
            self.frame_height.saturating_mul(self.factor),
        )
    }

    /// Box size in device pixels, never smaller than the picture
    pub fn outer_size(&self) -> (u32, u32) {
        let (width, height) = self.frame_size();
        (
            self.outer_width.saturating_mul(self.factor).max(width),
            self.outer_height.saturating_mul(self.factor).max(height),
        )
    }
}

/// Whether the consumer has painted a frame
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Displayed {
    NotShown = 0,
    Shown = 1,
    /// Painted once by a consumer that does not want the clip to keep animating
    ShownPause = 2,
}

impl Displayed {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Shown,
            2 => Self::ShownPause,
            _ => Self::NotShown,
        }
    }
}

/// Bookkeeping of the frame a reader currently shows
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameInfo {
    /// Position in the decode order, starting at 0
    pub sequence: u64,
    /// Clip clock time the frame is scheduled to appear at
    pub display_at: u64,
    pub has_alpha: bool,
}

/// One slot of the frame ring
#[derive(Debug)]
pub(crate) struct Frame {
    /// Decoded picture at the request's frame size
    pub original: RgbaImage,
    /// What the consumer paints
    pub prepared: Option<Arc<RgbaImage>>,
    pub request: FrameRequest,
    pub has_alpha: bool,
    /// Clip clock time the frame is scheduled to appear at
    pub timestamp: u64,
    /// Position in the decode order, starting at 0
    pub sequence: u64,
}

impl Default for Frame {
    fn default() -> Self {
        Self {
            original: RgbaImage::new(0, 0),
            prepared: None,
            request: FrameRequest::default(),
            has_alpha: false,
            timestamp: 0,
            sequence: 0,
        }
    }
}

impl Frame {
    pub fn info(&self) -> FrameInfo {
        FrameInfo {
            sequence: self.sequence,
            display_at: self.timestamp,
            has_alpha: self.has_alpha,
        }
    }

    /// Rebuilds the presentation buffer for `request` from the raw picture
    pub fn prepare(&mut self, request: FrameRequest) {
        self.request = request;
        let prepared = if request.is_valid() {
            prepare_frame(&request, &self.original, self.has_alpha)
        } else {
            self.original.clone()
        };
        self.prepared = Some(Arc::new(prepared));
    }
}

/// Scales `original` into the requested box and applies corner rounding
pub fn prepare_frame(request: &FrameRequest, original: &RgbaImage, has_alpha: bool) -> RgbaImage {
    let (frame_width, frame_height) = request.frame_size();
    let (outer_width, outer_height) = request.outer_size();

    let frame = if original.dimensions() == (frame_width, frame_height) || original.width() == 0 {
        original.clone()
    } else {
        imageops::resize(original, frame_width, frame_height, imageops::FilterType::Triangle)
    };

    let mut prepared = if (outer_width, outer_height) == frame.dimensions() {
        frame
    } else {
        let background = if has_alpha {
            Rgba([0, 0, 0, 0])
        } else {
            Rgba([0, 0, 0, 255])
        };
        let mut canvas = RgbaImage::from_pixel(outer_width, outer_height, background);
        let x = (i64::from(outer_width) - i64::from(frame.width())) / 2;
        let y = (i64::from(outer_height) - i64::from(frame.height())) / 2;
        imageops::replace(&mut canvas, &frame, x, y);
        canvas
    };

    if request.rounded {
        round_corners(&mut prepared, ROUND_RADIUS.saturating_mul(request.factor));
    }

    prepared
}

/// Fades the alpha channel out in each corner, anti-aliased over one pixel
pub fn round_corners(image: &mut RgbaImage, radius: u32) {
    let (width, height) = image.dimensions();
    let radius = radius.min(width / 2).min(height / 2);
    if radius == 0 {
        return;
    }

    let r = radius as f32;
    for dy in 0..radius {
        for dx in 0..radius {
            // Distance from the circle center to the pixel center
            let cx = r - (dx as f32 + 0.5);
            let cy = r - (dy as f32 + 0.5);
            let coverage = (r - (cx * cx + cy * cy).sqrt() + 0.5).clamp(0.0, 1.0);
            if coverage >= 1.0 {
                continue;
            }

            for (x, y) in [
                (dx, dy),
                (width - 1 - dx, dy),
                (dx, height - 1 - dy),
                (width - 1 - dx, height - 1 - dy),
            ] {
                let pixel = image.get_pixel_mut(x, y);
                pixel.0[3] = (f32::from(pixel.0[3]) * coverage).round() as u8;
            }
        }
    }
}
