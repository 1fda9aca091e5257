//! Square face thumbnails for the gallery and the render stripe.

use ab_glyph::{FontVec, PxScale};
use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};
use std::path::Path;
use thiserror::Error;

pub const DEFAULT_THUMBNAIL_SIZE: u32 = 150;

/// Height of the darkened name band at the bottom of a labelled thumbnail.
const LABEL_BAND_HEIGHT: u32 = 27;

#[derive(Error, Debug)]
pub enum LabelerError {
    #[error("cannot read font {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid font file: {0}")]
    InvalidFont(String),
}

/// Draws text onto thumbnails with a TrueType font.
pub struct Labeler {
    font: FontVec,
    scale: PxScale,
}

impl Labeler {
    pub fn load(path: &Path) -> Result<Self, LabelerError> {
        let data = std::fs::read(path).map_err(|source| LabelerError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let font = FontVec::try_from_vec(data).map_err(|e| LabelerError::InvalidFont(e.to_string()))?;
        Ok(Self {
            font,
            scale: PxScale::from(20.0),
        })
    }

    pub fn draw(&self, image: &mut RgbImage, x: i32, y: i32, text: &str) {
        imageproc::drawing::draw_text_mut(image, Rgb([255, 255, 255]), x, y, self.scale, &self.font, text);
    }
}

/// Letterbox `crop` into a `size`×`size` black square.
///
/// A non-empty `name` darkens the bottom band; the name itself is drawn only
/// when a labeler is available.
pub fn make_thumbnail(
    crop: &RgbImage,
    size: u32,
    name: Option<&str>,
    labeler: Option<&Labeler>,
) -> RgbImage {
    let mut result = RgbImage::new(size, size);
    let (cols, rows) = crop.dimensions();

    if cols > 0 && rows > 0 && size > 0 {
        let (w, h) = if rows >= cols {
            ((cols * size / rows).max(1), size)
        } else {
            (size, (rows * size / cols).max(1))
        };
        let resized = imageops::resize(crop, w, h, FilterType::Triangle);
        let x = (size - w) / 2;
        let y = (size - h) / 2;
        imageops::overlay(&mut result, &resized, i64::from(x), i64::from(y));
    }

    if let Some(name) = name.filter(|n| !n.is_empty()) {
        let band_top = size.saturating_sub(LABEL_BAND_HEIGHT);
        for y in band_top..size {
            for x in 0..size {
                let p = result.get_pixel_mut(x, y);
                p.0 = p.0.map(|c| c / 2);
            }
        }
        if let Some(labeler) = labeler {
            labeler.draw(&mut result, 2, band_top as i32 + 3, name);
        }
    }

    result
}

/// Scale every pixel by `ratio` in [0, 1].
pub fn fade(image: &mut RgbImage, ratio: f32) {
    if ratio >= 1.0 {
        return;
    }
    let ratio = ratio.max(0.0);
    for p in image.pixels_mut() {
        p.0 = p.0.map(|c| (c as f32 * ratio).round() as u8);
    }
}
