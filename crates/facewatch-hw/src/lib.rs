//! facewatch-hw — Frame sources for the orchestrator.
//!
//! V4L2 cameras via the `v4l` crate, plus image files and directories played
//! back as video.

pub mod camera;
pub mod frame;
pub mod sequence;

pub use camera::{CameraError, CameraOptions, DeviceInfo, PixelFormat, V4lCamera};
pub use sequence::ImageSequenceSource;

use facewatch_core::{FrameSource, SourceError};
use std::path::Path;

/// What a source argument on the command line refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceKind {
    Camera(String),
    Images(String),
}

/// Classify a source argument: a bare number `N` or a `/dev/video*` path is a
/// camera, anything else a file or directory of images.
pub fn classify(source: &str) -> SourceKind {
    if let Ok(index) = source.parse::<u32>() {
        return SourceKind::Camera(format!("/dev/video{index}"));
    }
    if source.starts_with("/dev/video") {
        return SourceKind::Camera(source.to_string());
    }
    SourceKind::Images(source.to_string())
}

/// Open a frame source from a command-line argument.
pub fn open_source(
    source: &str,
    camera_options: CameraOptions,
) -> Result<Box<dyn FrameSource>, SourceError> {
    match classify(source) {
        SourceKind::Camera(path) => Ok(Box::new(V4lCamera::open(&path, camera_options)?)),
        SourceKind::Images(path) => Ok(Box::new(ImageSequenceSource::open(Path::new(&path))?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        assert_eq!(classify("0"), SourceKind::Camera("/dev/video0".into()));
        assert_eq!(classify("/dev/video3"), SourceKind::Camera("/dev/video3".into()));
        assert_eq!(classify("./faces"), SourceKind::Images("./faces".into()));
        assert_eq!(classify("clip01.png"), SourceKind::Images("clip01.png".into()));
    }

    #[test]
    fn test_open_missing_source_fails() {
        assert!(open_source("/nonexistent/dir", CameraOptions::default()).is_err());
        assert!(open_source("/dev/video99", CameraOptions::default()).is_err());
    }
}
