//! facewatch-onnx — Face gateway on ONNX Runtime.
//!
//! SCRFD for detection and ArcFace for recognition, with a greedy IoU tracker
//! and a brute-force cosine matcher driving the multi-stream video worker.

pub mod alignment;
pub mod detector;
pub mod matcher;
pub mod recognizer;
pub mod service;
pub mod tracker;
pub mod video_worker;

pub use service::OnnxService;
pub use tracker::TrackerParams;
pub use video_worker::{StreamEngine, TrackingVideoWorker};
