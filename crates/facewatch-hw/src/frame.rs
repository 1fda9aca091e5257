//! Raw camera buffer conversion to RGB and dark-frame detection.

use image::{Pixel, RgbImage};

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid {format} length: expected {expected}, got {actual}")]
    InvalidLength {
        format: &'static str,
        expected: usize,
        actual: usize,
    },
}

fn check_len(format: &'static str, buf: &[u8], expected: usize) -> Result<(), FrameError> {
    if buf.len() < expected {
        return Err(FrameError::InvalidLength {
            format,
            expected,
            actual: buf.len(),
        });
    }
    Ok(())
}

#[inline]
fn clamp_u8(v: i32) -> u8 {
    v.clamp(0, 255) as u8
}

/// BT.601 limited-range YUV to RGB, integer arithmetic.
#[inline]
fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = i32::from(y) - 16;
    let d = i32::from(u) - 128;
    let e = i32::from(v) - 128;
    [
        clamp_u8((298 * c + 409 * e + 128) >> 8),
        clamp_u8((298 * c - 100 * d - 208 * e + 128) >> 8),
        clamp_u8((298 * c + 516 * d + 128) >> 8),
    ]
}

/// Convert packed YUYV (4:2:2) to RGB.
///
/// YUYV packs two pixels per 4 bytes: [Y0, U, Y1, V]. Both pixels share U and V.
pub fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let pixels = (width * height) as usize;
    check_len("YUYV", yuyv, pixels * 2)?;

    let mut data = Vec::with_capacity(pixels * 3);
    for quad in yuyv[..pixels * 2].chunks_exact(4) {
        let (y0, u, y1, v) = (quad[0], quad[1], quad[2], quad[3]);
        data.extend_from_slice(&yuv_to_rgb(y0, u, v));
        data.extend_from_slice(&yuv_to_rgb(y1, u, v));
    }
    // Odd pixel count: the last YUYV group is half-used.
    data.truncate(pixels * 3);
    while data.len() < pixels * 3 {
        data.push(0);
    }

    RgbImage::from_raw(width, height, data).ok_or(FrameError::InvalidLength {
        format: "YUYV",
        expected: pixels * 3,
        actual: 0,
    })
}

/// Replicate 8-bit grayscale into three channels.
pub fn grey_to_rgb(grey: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let pixels = (width * height) as usize;
    check_len("GREY", grey, pixels)?;
    let data = grey[..pixels].iter().flat_map(|&g| [g, g, g]).collect();
    RgbImage::from_raw(width, height, data).ok_or(FrameError::InvalidLength {
        format: "GREY",
        expected: pixels,
        actual: grey.len(),
    })
}

/// 16-bit little-endian grayscale, downscaled to 8 bits per channel.
pub fn y16_to_rgb(y16: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let pixels = (width * height) as usize;
    check_len("Y16", y16, pixels * 2)?;
    let data = y16[..pixels * 2]
        .chunks_exact(2)
        .flat_map(|px| {
            let value = u16::from_le_bytes([px[0], px[1]]);
            let g = (value >> 8) as u8;
            [g, g, g]
        })
        .collect();
    RgbImage::from_raw(width, height, data).ok_or(FrameError::InvalidLength {
        format: "Y16",
        expected: pixels * 2,
        actual: y16.len(),
    })
}

/// True if more than `threshold_pct` of pixels have luma below 32.
pub fn is_dark_frame(image: &RgbImage, threshold_pct: f32) -> bool {
    let total = (image.width() * image.height()) as usize;
    if total == 0 {
        return true;
    }
    let dark = image.pixels().filter(|p| p.to_luma().0[0] < 32).count();
    (dark as f32 / total as f32) > threshold_pct
}
