use image::{ImageBuffer, Luma, RgbImage};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

/// Identifier the gateway assigns to each submitted frame. Strictly increasing per stream.
pub type FrameId = u64;

/// Identifier the gateway assigns to each tracked face. Unique per live face within a stream.
pub type TrackId = u64;

/// 16-bit depth map in millimetres, aligned with the color image.
pub type DepthImage = ImageBuffer<Luma<u16>, Vec<u16>>;

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl BoundingBox {
    pub fn center(&self) -> (f32, f32) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    /// Intersection-over-Union with another box.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.width).min(other.x + other.width);
        let y2 = (self.y + self.height).min(other.y + other.height);

        let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        let union = self.width * self.height + other.width * other.height - inter;

        if union > 0.0 {
            inter / union
        } else {
            0.0
        }
    }
}

/// A captured camera frame.
#[derive(Clone)]
pub struct Frame {
    pub color: Arc<RgbImage>,
    pub depth: Option<Arc<DepthImage>>,
    pub timestamp: Instant,
    /// Source-local counter, independent of the gateway's frame id.
    pub sequence: u64,
}

impl Frame {
    pub fn new(color: RgbImage, sequence: u64) -> Self {
        Self {
            color: Arc::new(color),
            depth: None,
            timestamp: Instant::now(),
            sequence,
        }
    }

    pub fn with_depth(mut self, depth: DepthImage) -> Self {
        self.depth = Some(Arc::new(depth));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.color.width() == 0 || self.color.height() == 0
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("sequence", &self.sequence)
            .field("width", &self.color.width())
            .field("height", &self.color.height())
            .field("depth", &self.depth.is_some())
            .finish()
    }
}

/// One face as seen by the gateway: where it is and what it looks like.
#[derive(Debug, Clone)]
pub struct Sample {
    pub track_id: TrackId,
    /// Frame the sample was taken from. May be older than the frame a tracking
    /// result is reported for.
    pub frame_id: FrameId,
    /// Face location in frame coordinates.
    pub face: BoundingBox,
    /// Face crop cut from the source frame.
    pub crop: Arc<RgbImage>,
    /// Top-left corner of `crop` in frame coordinates.
    pub crop_origin: (u32, u32),
}

impl Sample {
    /// Landmarks translated into `crop` coordinates.
    pub fn crop_landmarks(&self) -> Option<[(f32, f32); 5]> {
        let (ox, oy) = (self.crop_origin.0 as f32, self.crop_origin.1 as f32);
        self.face
            .landmarks
            .map(|lms| lms.map(|(x, y)| (x - ox, y - oy)))
    }
}

/// Opaque face template produced by a recognizer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub values: Vec<f32>,
    /// Recognition method that produced this template (e.g., "w600k_r50").
    pub method: Option<String>,
}

impl Template {
    /// Cosine similarity in [-1, 1]. Higher = more similar.
    pub fn similarity(&self, other: &Template) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 {
            dot / denom
        } else {
            0.0
        }
    }

    /// Cosine distance in [0, 2]. Lower = more similar.
    pub fn distance(&self, other: &Template) -> f32 {
        1.0 - self.similarity(other)
    }
}

/// One gallery entry as handed to the gateway's matcher.
#[derive(Debug, Clone)]
pub struct DatabaseElement {
    /// Position of the entry in the gallery.
    pub element_id: u64,
    /// Groups entries that belong to the same person.
    pub person_id: u64,
    pub template: Template,
    /// Maximum distance accepted as a match for this entry.
    pub distance_threshold: f32,
}

/// One result of a gallery search.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchResult {
    /// Matched gallery element, `None` when nothing was within threshold.
    pub element_id: Option<u64>,
    pub person_id: Option<u64>,
    pub distance: f32,
}

impl SearchResult {
    pub fn not_found(distance: f32) -> Self {
        Self {
            element_id: None,
            person_id: None,
            distance,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template(values: &[f32]) -> Template {
        Template { values: values.to_vec(), method: None }
    }

    #[test]
    fn test_similarity_identical() {
        let a = template(&[1.0, 0.0, 0.0]);
        assert!((a.similarity(&a) - 1.0).abs() < 1e-6);
        assert!(a.distance(&a).abs() < 1e-6);
    }

    #[test]
    fn test_similarity_orthogonal() {
        let a = template(&[1.0, 0.0]);
        let b = template(&[0.0, 1.0]);
        assert!(a.similarity(&b).abs() < 1e-6);
        assert!((a.distance(&b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_similarity_zero_vector() {
        let a = template(&[0.0, 0.0]);
        let b = template(&[1.0, 0.0]);
        assert_eq!(a.similarity(&b), 0.0);
    }

    #[test]
    fn test_iou_partial() {
        let a = BoundingBox { x: 0.0, y: 0.0, width: 10.0, height: 10.0, confidence: 1.0, landmarks: None };
        let b = BoundingBox { x: 5.0, ..a.clone() };
        // Overlap: 5x10 = 50, union: 100+100-50 = 150
        assert!((a.iou(&b) - 50.0 / 150.0).abs() < 1e-6);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_crop_landmarks_are_relative() {
        let sample = Sample {
            track_id: 1,
            frame_id: 1,
            face: BoundingBox {
                x: 100.0, y: 50.0, width: 40.0, height: 40.0, confidence: 0.9,
                landmarks: Some([(110.0, 60.0); 5]),
            },
            crop: Arc::new(RgbImage::new(60, 60)),
            crop_origin: (90, 40),
        };
        let lms = sample.crop_landmarks().unwrap();
        assert_eq!(lms[0], (20.0, 20.0));
    }

    #[test]
    fn test_template_json_roundtrip_keeps_method() {
        let t = Template { values: vec![0.5, -0.5], method: Some("w600k_r50".into()) };
        let json = serde_json::to_string(&t).unwrap();
        let back: Template = serde_json::from_str(&json).unwrap();
        assert_eq!(back.method.as_deref(), Some("w600k_r50"));
        assert_eq!(back.values, t.values);
    }
}
