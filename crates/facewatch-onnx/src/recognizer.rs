//! ArcFace face recognizer via ONNX Runtime.
//!
//! Extracts L2-normalized embeddings from face crops, aligned on their
//! landmarks when the detector provided them.

use crate::alignment::{self, ALIGNED_SIZE};
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5; // symmetric, unlike SCRFD

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

pub struct FaceRecognizer {
    session: Session,
    method: String,
}

impl FaceRecognizer {
    /// Load an ArcFace model. The file stem names the recognition method.
    pub fn load(model_path: &Path) -> Result<Self, RecognizerError> {
        if !model_path.exists() {
            return Err(RecognizerError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let method = model_path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("arcface")
            .to_string();

        tracing::info!(
            path = %model_path.display(),
            method = %method,
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded ArcFace model"
        );

        Ok(Self { session, method })
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// Embed a face crop. `landmarks` are in crop coordinates.
    pub fn extract(
        &mut self,
        crop: &RgbImage,
        landmarks: Option<&[(f32, f32); 5]>,
    ) -> Result<Vec<f32>, RecognizerError> {
        let aligned = match landmarks {
            Some(lms) => alignment::align_face(crop, lms),
            None => imageops::resize(crop, ALIGNED_SIZE, ALIGNED_SIZE, FilterType::Triangle),
        };

        let input = preprocess(&aligned);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw.is_empty() {
            return Err(RecognizerError::InferenceFailed("empty embedding".into()));
        }

        Ok(l2_normalize(raw.to_vec()))
    }
}

fn preprocess(aligned: &RgbImage) -> Array4<f32> {
    let (w, h) = aligned.dimensions();
    let mut tensor = Array4::<f32>::zeros((1, 3, h as usize, w as usize));
    for (x, y, px) in aligned.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = (px.0[c] as f32 - ARCFACE_MEAN) / ARCFACE_STD;
        }
    }
    tensor
}

fn l2_normalize(mut values: Vec<f32>) -> Vec<f32> {
    let norm = values.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        values.iter_mut().for_each(|x| *x /= norm);
    }
    values
}
