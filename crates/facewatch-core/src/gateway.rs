//! Capability interface of the face recognition backend.
//!
//! The backend is opaque: it captures faces on still images, turns samples into
//! templates, and runs a video worker that tracks faces across submitted frames
//! and matches them against a gallery. Tracking results are not delivered via
//! callbacks; each stream has listeners receiving [`WorkerEvent`] messages.

use crate::types::{DatabaseElement, FrameId, Sample, SearchResult, Template, TrackId};
use image::RgbImage;
use serde::Deserialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Error, Debug, Clone)]
pub enum GatewayError {
    #[error("stream {stream_id} out of range ({streams_count} streams)")]
    StreamOutOfRange { stream_id: usize, streams_count: usize },
    #[error("unknown listener {0:?}")]
    UnknownListener(ListenerId),
    #[error("configuration: {0}")]
    Config(String),
    #[error("backend: {0}")]
    Backend(String),
    #[error("video worker is shut down")]
    Closed,
}

/// A face reported by a tracking result.
#[derive(Debug, Clone)]
pub struct TrackedSample {
    pub sample: Sample,
    /// The sample is too poor for recognition (small, blurred, low confidence).
    pub weak: bool,
    pub quality: f32,
}

#[derive(Debug, Clone)]
pub struct TrackingData {
    pub stream_id: usize,
    pub frame_id: FrameId,
    pub samples: Vec<TrackedSample>,
}

#[derive(Debug, Clone)]
pub struct TrackingLostData {
    pub stream_id: usize,
    pub track_id: TrackId,
    pub first_frame_id: FrameId,
    pub last_frame_id: FrameId,
    pub best_quality_sample: Option<Sample>,
}

#[derive(Debug, Clone)]
pub struct MatchFoundData {
    pub stream_id: usize,
    pub sample: Sample,
    pub template: Template,
    /// Best results first. A lone `element_id == None` entry means "not found".
    pub search_results: Vec<SearchResult>,
}

/// Messages a video worker delivers to the listeners of a stream.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    Tracking(TrackingData),
    TrackingLost(TrackingLostData),
    MatchFound(MatchFoundData),
}

impl WorkerEvent {
    pub fn stream_id(&self) -> usize {
        match self {
            WorkerEvent::Tracking(d) => d.stream_id,
            WorkerEvent::TrackingLost(d) => d.stream_id,
            WorkerEvent::MatchFound(d) => d.stream_id,
        }
    }
}

pub type EventSender = mpsc::UnboundedSender<WorkerEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<WorkerEvent>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub u64);

/// How the matcher may shortcut a gallery search.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchAcceleration {
    /// Compare against every gallery element.
    #[default]
    None,
    /// Skip the remaining elements of a person once one of them is a confident hit.
    Heuristic,
}

/// Video worker construction parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VideoWorkerParams {
    pub streams_count: usize,
    /// 0 = one per stream.
    pub processing_threads_count: usize,
    /// 0 = one per stream.
    pub matching_threads_count: usize,
    /// Maximum number of search results per match event.
    pub search_k: usize,
    /// Also deliver match events when nothing in the gallery was close enough.
    pub not_found_match_found_callback: bool,
    pub acceleration: SearchAcceleration,
}

impl Default for VideoWorkerParams {
    fn default() -> Self {
        Self {
            streams_count: 1,
            processing_threads_count: 0,
            matching_threads_count: 0,
            search_k: 10,
            not_found_match_found_callback: true,
            acceleration: SearchAcceleration::None,
        }
    }
}

/// Detects faces on still images.
pub trait Capturer: Send {
    fn capture(&mut self, image: &RgbImage) -> Result<Vec<Sample>, GatewayError>;
}

/// Turns face samples into templates.
pub trait Recognizer: Send {
    fn process(&mut self, sample: &Sample) -> Result<Template, GatewayError>;
    fn method_name(&self) -> &str;
}

/// Tracks faces across video frames and matches them against a gallery.
pub trait VideoWorker: Send + Sync {
    fn streams_count(&self) -> usize;

    /// Replace the gallery the matcher searches.
    fn set_database(
        &self,
        elements: Vec<DatabaseElement>,
        acceleration: SearchAcceleration,
    ) -> Result<(), GatewayError>;

    /// Submit a frame for processing. Returns the id tracking results will reference.
    fn add_video_frame(
        &self,
        image: &RgbImage,
        stream_id: usize,
        timestamp_us: u64,
    ) -> Result<FrameId, GatewayError>;

    /// Deliver the events of `stream_id` to `sender` until the listener is removed.
    fn add_listener(&self, stream_id: usize, sender: EventSender)
        -> Result<ListenerId, GatewayError>;

    /// Drop the listener's sender, closing its channel once buffered events are drained.
    fn remove_listener(&self, id: ListenerId) -> Result<(), GatewayError>;

    fn enable_processing_on_stream(&self, stream_id: usize) -> Result<(), GatewayError>;

    fn disable_processing_on_stream(&self, stream_id: usize) -> Result<(), GatewayError>;

    /// Forget all tracks on the stream. Every live track gets a lost event.
    fn reset_tracker_on_stream(&self, stream_id: usize) -> Result<(), GatewayError>;

    /// Re-raise the first error that happened on a worker-internal thread.
    fn check_exceptions(&self) -> Result<(), GatewayError>;
}

/// Factory for backend objects.
pub trait FaceService {
    fn create_capturer(&self) -> Result<Box<dyn Capturer>, GatewayError>;

    fn create_recognizer(&self, method_config: &str) -> Result<Box<dyn Recognizer>, GatewayError>;

    fn create_video_worker(
        &self,
        params: VideoWorkerParams,
        method_config: &str,
    ) -> Result<Arc<dyn VideoWorker>, GatewayError>;
}

/// Validate a stream id against a worker's stream count.
pub fn check_stream(stream_id: usize, streams_count: usize) -> Result<(), GatewayError> {
    if stream_id < streams_count {
        Ok(())
    } else {
        Err(GatewayError::StreamOutOfRange {
            stream_id,
            streams_count,
        })
    }
}
