use crate::types::Frame;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("capture failed: {0}")]
    Capture(String),
    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot decode {}: {source}", path.display())]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("bad frame: {0}")]
    BadFrame(String),
}

impl SourceError {
    /// A single unusable frame. The source itself can still deliver the next one.
    pub fn is_bad_frame(&self) -> bool {
        matches!(self, SourceError::Decode { .. } | SourceError::BadFrame(_))
    }
}

/// A camera, stream or file producing frames for one video stream.
pub trait FrameSource: Send {
    /// Human-readable source name, used for logging and output naming.
    fn name(&self) -> &str;

    /// Block until the next frame. `Ok(None)` means the source is exhausted.
    fn get(&mut self) -> Result<Option<Frame>, SourceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bad_frame_classification() {
        assert!(SourceError::BadFrame("short buffer".into()).is_bad_frame());
        let decode = SourceError::Decode {
            path: "a.png".into(),
            source: image::ImageError::IoError(std::io::Error::other("truncated")),
        };
        assert!(decode.is_bad_frame());
        assert!(!SourceError::Capture("device gone".into()).is_bad_frame());
        let io = SourceError::Io {
            path: "clip".into(),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        };
        assert!(!io.is_bad_frame());
    }
}
