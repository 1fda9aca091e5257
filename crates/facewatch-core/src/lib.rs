//! facewatch-core — Orchestration primitives for multi-stream face tracking.
//!
//! The face detector, tracker and matcher live behind the [`gateway`] traits.
//! This crate owns everything around them: correlating asynchronous tracking
//! results with submitted frames, per-stream track state, gallery loading,
//! frame pacing and rendering of annotated output images.

pub mod correlator;
pub mod deferred;
pub mod gallery;
pub mod gateway;
pub mod pacing;
pub mod render;
pub mod source;
pub mod template_store;
pub mod thumbnail;
pub mod tracks;
pub mod types;

pub use correlator::{CorrelatorError, FrameCorrelator};
pub use deferred::{deferred_errors, ErrorPoll, ErrorReporter};
pub use gallery::{Gallery, GalleryError};
pub use gateway::{
    Capturer, FaceService, GatewayError, ListenerId, Recognizer, VideoWorker, VideoWorkerParams,
    WorkerEvent,
};
pub use pacing::FramePacer;
pub use render::{RenderConfig, Renderer};
pub use source::{FrameSource, SourceError};
pub use tracks::{Snapshot, TrackError, TrackState, TrackTable};
pub use types::{
    BoundingBox, DatabaseElement, DepthImage, Frame, FrameId, Sample, SearchResult, Template,
    TrackId,
};
