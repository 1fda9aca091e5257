//! [`FaceService`] backed by the SCRFD and ArcFace ONNX models.
//!
//! Model directory layout:
//!
//! ```text
//! <config_dir>/
//!   det_10g.onnx        SCRFD detector
//!   w600k_r50.onnx      ArcFace recognizer (selected by the method config)
//! ```

use crate::detector::{DetectorError, FaceDetector, DEFAULT_CONFIDENCE_THRESHOLD};
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::tracker::TrackerParams;
use crate::video_worker::{StreamEngine, TrackingVideoWorker};
use facewatch_core::{
    BoundingBox, Capturer, FaceService, GatewayError, Recognizer, Sample, Template, VideoWorker,
    VideoWorkerParams,
};
use image::RgbImage;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const DETECTOR_MODEL: &str = "det_10g.onnx";
pub const DEFAULT_METHOD: &str = "w600k_r50";

/// Margin added around the detected box on every side, relative to its size.
const CROP_MARGIN: f32 = 0.2;

impl From<DetectorError> for GatewayError {
    fn from(e: DetectorError) -> Self {
        match e {
            DetectorError::ModelNotFound(p) => GatewayError::Config(format!("model not found: {p}")),
            other => GatewayError::Backend(other.to_string()),
        }
    }
}

impl From<RecognizerError> for GatewayError {
    fn from(e: RecognizerError) -> Self {
        match e {
            RecognizerError::ModelNotFound(p) => GatewayError::Config(format!("model not found: {p}")),
            other => GatewayError::Backend(other.to_string()),
        }
    }
}

pub struct OnnxService {
    model_dir: PathBuf,
    confidence_threshold: f32,
    tracker: TrackerParams,
}

impl OnnxService {
    /// `license_dir` is accepted for command-line parity; ONNX models need no license.
    pub fn create(config_dir: &Path, license_dir: Option<&Path>) -> Result<Self, GatewayError> {
        if !config_dir.is_dir() {
            return Err(GatewayError::Config(format!(
                "model directory not found: {}",
                config_dir.display()
            )));
        }
        if let Some(dir) = license_dir {
            tracing::debug!(license_dir = %dir.display(), "license directory ignored by ONNX backend");
        }
        let detector = config_dir.join(DETECTOR_MODEL);
        if !detector.is_file() {
            return Err(GatewayError::Config(format!(
                "detector model not found: {}",
                detector.display()
            )));
        }

        tracing::info!(model_dir = %config_dir.display(), "ONNX face service ready");
        Ok(Self {
            model_dir: config_dir.to_path_buf(),
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            tracker: TrackerParams::default(),
        })
    }

    pub fn with_tracker_params(mut self, tracker: TrackerParams) -> Self {
        self.tracker = tracker;
        self
    }

    pub fn with_confidence_threshold(mut self, threshold: f32) -> Self {
        self.confidence_threshold = threshold;
        self
    }

    fn recognizer_path(&self, method_config: &str) -> PathBuf {
        recognizer_model_path(&self.model_dir, method_config)
    }

    fn load_capturer(&self) -> Result<OnnxCapturer, GatewayError> {
        let detector = FaceDetector::load(&self.model_dir.join(DETECTOR_MODEL), self.confidence_threshold)?;
        Ok(OnnxCapturer { detector })
    }

    fn load_recognizer(&self, method_config: &str) -> Result<OnnxRecognizer, GatewayError> {
        let recognizer = FaceRecognizer::load(&self.recognizer_path(method_config))?;
        Ok(OnnxRecognizer { recognizer })
    }
}

/// Resolve a method config to a recognizer model file: a bare name gets `.onnx`
/// appended and is looked up in the model directory.
pub fn recognizer_model_path(model_dir: &Path, method_config: &str) -> PathBuf {
    let name = if method_config.is_empty() {
        DEFAULT_METHOD
    } else {
        method_config
    };
    let file = if Path::new(name).extension().is_some() {
        name.to_string()
    } else {
        format!("{name}.onnx")
    };
    model_dir.join(file)
}

impl FaceService for OnnxService {
    fn create_capturer(&self) -> Result<Box<dyn Capturer>, GatewayError> {
        Ok(Box::new(self.load_capturer()?))
    }

    fn create_recognizer(&self, method_config: &str) -> Result<Box<dyn Recognizer>, GatewayError> {
        Ok(Box::new(self.load_recognizer(method_config)?))
    }

    fn create_video_worker(
        &self,
        params: VideoWorkerParams,
        method_config: &str,
    ) -> Result<Arc<dyn VideoWorker>, GatewayError> {
        let engines = (0..params.streams_count)
            .map(|_| -> Result<StreamEngine, GatewayError> {
                Ok(StreamEngine {
                    capturer: Box::new(self.load_capturer()?),
                    recognizer: Box::new(self.load_recognizer(method_config)?),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let worker = TrackingVideoWorker::start(&params, self.tracker.clone(), engines)?;
        Ok(Arc::new(worker))
    }
}

pub struct OnnxCapturer {
    detector: FaceDetector,
}

impl Capturer for OnnxCapturer {
    fn capture(&mut self, image: &RgbImage) -> Result<Vec<Sample>, GatewayError> {
        let faces = self.detector.detect(image)?;
        Ok(faces
            .into_iter()
            .filter_map(|face| crop_face(image, face))
            .collect())
    }
}

/// Cut the face box plus margin out of `image`. `None` when the box lies outside.
pub fn crop_face(image: &RgbImage, face: BoundingBox) -> Option<Sample> {
    let (w, h) = (image.width() as f32, image.height() as f32);
    let mx = face.width * CROP_MARGIN;
    let my = face.height * CROP_MARGIN;
    let x0 = (face.x - mx).clamp(0.0, w);
    let y0 = (face.y - my).clamp(0.0, h);
    let x1 = (face.x + face.width + mx).clamp(0.0, w);
    let y1 = (face.y + face.height + my).clamp(0.0, h);

    let (cx, cy) = (x0.floor() as u32, y0.floor() as u32);
    let (cw, ch) = ((x1 - x0).round() as u32, (y1 - y0).round() as u32);
    if cw == 0 || ch == 0 {
        return None;
    }
    let crop = image::imageops::crop_imm(image, cx, cy, cw, ch).to_image();

    Some(Sample {
        track_id: 0,
        frame_id: 0,
        face,
        crop: Arc::new(crop),
        crop_origin: (cx, cy),
    })
}

pub struct OnnxRecognizer {
    recognizer: FaceRecognizer,
}

impl Recognizer for OnnxRecognizer {
    fn process(&mut self, sample: &Sample) -> Result<Template, GatewayError> {
        let landmarks = sample.crop_landmarks();
        let values = self.recognizer.extract(&sample.crop, landmarks.as_ref())?;
        Ok(Template {
            values,
            method: Some(self.recognizer.method().to_string()),
        })
    }

    fn method_name(&self) -> &str {
        self.recognizer.method()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn face(x: f32, y: f32, w: f32, h: f32) -> BoundingBox {
        BoundingBox { x, y, width: w, height: h, confidence: 0.9, landmarks: None }
    }

    #[test]
    fn test_crop_adds_margin_and_clamps() {
        let img = RgbImage::new(200, 100);
        let s = crop_face(&img, face(50.0, 20.0, 50.0, 50.0)).unwrap();
        assert_eq!(s.crop_origin, (40, 10));
        assert_eq!(s.crop.dimensions(), (70, 70));

        let s = crop_face(&img, face(180.0, 80.0, 50.0, 50.0)).unwrap();
        assert_eq!(s.crop_origin, (170, 70));
        assert_eq!(s.crop.dimensions(), (30, 30));
    }

    #[test]
    fn test_crop_outside_image_is_none() {
        let img = RgbImage::new(100, 100);
        assert!(crop_face(&img, face(300.0, 300.0, 20.0, 20.0)).is_none());
    }

    #[test]
    fn test_recognizer_model_path() {
        let dir = Path::new("/models");
        assert_eq!(recognizer_model_path(dir, ""), PathBuf::from("/models/w600k_r50.onnx"));
        assert_eq!(recognizer_model_path(dir, "glintr100"), PathBuf::from("/models/glintr100.onnx"));
        assert_eq!(recognizer_model_path(dir, "custom.onnx"), PathBuf::from("/models/custom.onnx"));
    }

    #[test]
    fn test_create_requires_detector_model() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(OnnxService::create(dir.path(), None), Err(GatewayError::Config(_))));
        assert!(matches!(
            OnnxService::create(Path::new("/nonexistent/models"), None),
            Err(GatewayError::Config(_))
        ));
    }
}
