//! Annotated output images from a track-state snapshot.
//!
//! Layout: the frame on the left (its depth map, colourised, underneath when
//! present), a circle on every face seen in the drawn frame, and a stripe of
//! thumbnails to the right of both. Each stripe row pairs the live face with
//! its gallery match, or a grey tile when unrecognized.

use crate::gallery::Gallery;
use crate::thumbnail::{fade, make_thumbnail, Labeler, DEFAULT_THUMBNAIL_SIZE};
use crate::tracks::{Snapshot, TrackState};
use crate::types::{DepthImage, TrackId};
use image::imageops;
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_hollow_circle_mut, draw_line_segment_mut};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

const RECOGNIZED: Rgb<u8> = Rgb([0, 255, 0]);
const UNRECOGNIZED: Rgb<u8> = Rgb([255, 0, 0]);
const UNMATCHED_GREY: u8 = 128;
const MARKER_THICKNESS: i32 = 3;
const WEAK_DASHES: u32 = 8;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    /// Redraw period.
    pub interval_ms: u64,
    /// How long a lost face keeps fading before it is removed.
    pub fade_timeout_ms: u64,
    /// Maximum number of rows in the thumbnail stripe.
    pub stripe_len: usize,
    pub thumbnail_size: u32,
    pub border: u32,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            interval_ms: 20,
            fade_timeout_ms: 5000,
            stripe_len: 6,
            thumbnail_size: DEFAULT_THUMBNAIL_SIZE,
            border: 5,
        }
    }
}

impl RenderConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn fade_timeout(&self) -> Duration {
        Duration::from_millis(self.fade_timeout_ms)
    }
}

/// Stripe order: recognized tracks by ascending gallery index, then unrecognized.
/// Ties break on track id.
pub fn stripe_order(tracks: &BTreeMap<TrackId, TrackState>) -> Vec<TrackId> {
    let mut order: Vec<(bool, usize, TrackId)> = tracks
        .iter()
        .map(|(&id, t)| {
            (
                t.matched_gallery_index.is_none(),
                t.matched_gallery_index.unwrap_or(usize::MAX),
                id,
            )
        })
        .collect();
    order.sort_unstable();
    order.into_iter().map(|(_, _, id)| id).collect()
}

/// False-colour a depth value: near = red, far = white-ish, 0 (no data) = black.
pub fn colorize_depth(depth: u16) -> Rgb<u8> {
    if depth == 0 {
        return Rgb([0, 0, 0]);
    }
    let d = u32::from(depth);
    let r = if d < 255 { (256 - d).min(255) as u8 } else { 0 };
    let g = if d < 255 * 2 { (d / 2) as u8 } else { 255 };
    let b = if d < 255 * 4 { (d / 4) as u8 } else { 255 };
    Rgb([r, g, b])
}

fn colorize(depth: &DepthImage) -> RgbImage {
    RgbImage::from_fn(depth.width(), depth.height(), |x, y| colorize_depth(depth.get_pixel(x, y).0[0]))
}

pub struct Renderer {
    config: RenderConfig,
    gallery: Arc<Gallery>,
    labeler: Option<Arc<Labeler>>,
}

impl Renderer {
    pub fn new(config: RenderConfig, gallery: Arc<Gallery>, labeler: Option<Arc<Labeler>>) -> Self {
        Self {
            config,
            gallery,
            labeler,
        }
    }

    pub fn config(&self) -> &RenderConfig {
        &self.config
    }

    /// Draw a snapshot. Reads only; the caller must not hold the table lock.
    pub fn draw(&self, snapshot: &Snapshot) -> RgbImage {
        let thumb = self.config.thumbnail_size;
        let border = self.config.border;
        let stripe_len = self.config.stripe_len as u32;

        let frame = &snapshot.frame.color;
        let depth = snapshot.frame.depth.as_deref();
        let (fw, fh) = frame.dimensions();
        let (dw, dh) = depth.map(|d| d.dimensions()).unwrap_or((0, 0));

        let stripe_w = thumb * 2 + border * 2;
        let stripe_h = ((thumb + border) * stripe_len).saturating_sub(border);

        // The stripe sits beside the frame, never over it.
        let content_w = fw.max(dw);
        let rows = (fh + dh).max(stripe_h);
        let cols = content_w + stripe_w;
        let mut result = RgbImage::new(cols, rows);

        let frame_y = (rows - fh - dh) / 2;
        let depth_y = frame_y + fh;

        imageops::overlay(&mut result, &**frame, 0, i64::from(frame_y));
        if let Some(depth) = depth {
            imageops::overlay(&mut result, &colorize(depth), 0, i64::from(depth_y));
        }

        let order = stripe_order(&snapshot.tracks);

        for &track_id in &order {
            let track = &snapshot.tracks[&track_id];
            if track.lost || track.frame_id != snapshot.frame_id {
                continue;
            }
            let offsets: &[u32] = if depth.is_some() { &[frame_y, depth_y] } else { &[frame_y] };
            for &y_offset in offsets {
                self.draw_marker(&mut result, track, snapshot.frame_id, y_offset);
            }
        }

        let stripe_x = content_w + border;
        for (row, &track_id) in order.iter().take(self.config.stripe_len).enumerate() {
            let track = &snapshot.tracks[&track_id];
            let y = (thumb + border) * row as u32;
            self.draw_stripe_row(&mut result, track, stripe_x, y);
        }

        result
    }

    fn draw_marker(&self, image: &mut RgbImage, track: &TrackState, frame_id: u64, y_offset: u32) {
        let face = &track.sample.face;
        let (cx, cy) = face.center();
        let center = (cx, cy + y_offset as f32);
        let radius = face.width.max(face.height) / 2.0;
        let color = if track.matched_gallery_index.is_some() {
            RECOGNIZED
        } else {
            UNRECOGNIZED
        };

        if track.weak {
            let rotation = ((frame_id * 2) % 360) as f32;
            let dash = 180.0 / WEAK_DASHES as f32;
            for i in 0..WEAK_DASHES {
                let start = rotation + (i * 2) as f32 * dash;
                draw_arc(image, center, radius, start, start + dash, color);
            }
        } else {
            for dr in 0..MARKER_THICKNESS {
                let r = radius as i32 + dr - MARKER_THICKNESS / 2;
                if r > 0 {
                    draw_hollow_circle_mut(image, (center.0 as i32, center.1 as i32), r, color);
                }
            }
        }

        if let (Some(labeler), Some(name)) = (
            self.labeler.as_deref(),
            track.matched_gallery_index.and_then(|i| self.gallery.name(i)),
        ) {
            if !name.is_empty() {
                let x = (center.0 + radius * 0.7) as i32;
                let y = (center.1 - radius * 0.5) as i32;
                labeler.draw(image, x, y, name);
            }
        }
    }

    fn draw_stripe_row(&self, image: &mut RgbImage, track: &TrackState, x: u32, y: u32) {
        let thumb = self.config.thumbnail_size;
        let ratio = track.fade_ratio;

        let mut face = make_thumbnail(&track.sample.crop, thumb, None, None);
        fade(&mut face, ratio);
        imageops::overlay(image, &face, i64::from(x), i64::from(y));

        let match_x = x + self.config.border + thumb;
        let tile = match track.matched_gallery_index.and_then(|i| self.gallery.thumbnail(i)) {
            Some(gallery_thumb) => {
                let mut tile = gallery_thumb.clone();
                fade(&mut tile, ratio);
                tile
            }
            None => {
                let grey = (UNMATCHED_GREY as f32 * ratio.clamp(0.0, 1.0)) as u8;
                RgbImage::from_pixel(thumb, thumb, Rgb([grey, grey, grey]))
            }
        };
        imageops::overlay(image, &tile, i64::from(match_x), i64::from(y));
    }
}

/// Draw a circular arc between two angles in degrees, `MARKER_THICKNESS` pixels wide.
fn draw_arc(image: &mut RgbImage, center: (f32, f32), radius: f32, start_deg: f32, end_deg: f32, color: Rgb<u8>) {
    const STEP_DEG: f32 = 3.0;
    for dr in 0..MARKER_THICKNESS {
        let r = radius + (dr - MARKER_THICKNESS / 2) as f32;
        if r <= 0.0 {
            continue;
        }
        let point = |deg: f32| {
            let rad = deg.to_radians();
            (center.0 + r * rad.cos(), center.1 + r * rad.sin())
        };
        let mut a = start_deg;
        while a < end_deg {
            let b = (a + STEP_DEG).min(end_deg);
            draw_line_segment_mut(image, point(a), point(b), color);
            a = b;
        }
    }
}
