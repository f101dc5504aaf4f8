use jxl::{api::JxlColorType, image::Image};

/// Convert f32 [0,1] to u8 [0,255]
#[inline]
fn f32_to_u8(val: f32) -> u8 {
    (val * 255.0).clamp(0.0, 255.0) as u8
}

/// Number of interleaved samples jxl-rs writes into the main channel
pub fn main_channel_samples(color_type: JxlColorType) -> usize {
    match color_type {
        JxlColorType::Grayscale | JxlColorType::GrayscaleAlpha => 1,
        JxlColorType::Rgb | JxlColorType::Bgr | JxlColorType::Rgba | JxlColorType::Bgra => 3,
    }
}

/// Interleaved RGBA8 from a decoded JXL frame.
///
/// `main` holds gray or interleaved color samples, `alpha` the first extra
/// channel if the stream has one.
pub fn frame_to_rgba8(
    main: &Image<f32>,
    alpha: Option<&Image<f32>>,
    color_type: JxlColorType,
    width: usize,
    height: usize,
) -> Vec<u8> {
    let mut rgba = vec![0u8; width * height * 4];
    let swap_rb = matches!(color_type, JxlColorType::Bgr | JxlColorType::Bgra);
    let samples = main_channel_samples(color_type);

    for y in 0..height {
        let main_row = main.row(y);
        let alpha_row = alpha.map(|alpha| alpha.row(y));
        let out_row = &mut rgba[y * width * 4..(y + 1) * width * 4];

        for x in 0..width {
            let out = &mut out_row[x * 4..x * 4 + 4];
            if samples == 1 {
                let gray = f32_to_u8(main_row[x]);
                out[..3].fill(gray);
            } else {
                let (r, b) = if swap_rb { (2, 0) } else { (0, 2) };
                out[0] = f32_to_u8(main_row[x * 3 + r]);
                out[1] = f32_to_u8(main_row[x * 3 + 1]);
                out[2] = f32_to_u8(main_row[x * 3 + b]);
            }
            out[3] = alpha_row.map_or(255, |row| f32_to_u8(row[x]));
        }
    }

    rgba
}
