//! Display surfaces for finished stream images.

use image::{ImageFormat, RgbImage};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DisplayError {
    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot encode {}: {source}", path.display())]
    Encode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
}

pub trait DisplaySink: Send {
    fn show(&mut self, stream_id: usize, image: &RgbImage) -> Result<(), DisplayError>;
}

/// Overwrites `<dir>/stream-<i>.png` with the latest image of each stream.
pub struct PngDirSink {
    dir: PathBuf,
}

impl PngDirSink {
    pub fn create(dir: &Path) -> Result<Self, DisplayError> {
        std::fs::create_dir_all(dir).map_err(|source| DisplayError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    pub fn path_for(&self, stream_id: usize) -> PathBuf {
        self.dir.join(format!("stream-{stream_id}.png"))
    }
}

impl DisplaySink for PngDirSink {
    fn show(&mut self, stream_id: usize, image: &RgbImage) -> Result<(), DisplayError> {
        let path = self.path_for(stream_id);
        // Readers never see a half-written file.
        let tmp = self.dir.join(format!(".stream-{stream_id}.png.tmp"));
        image
            .save_with_format(&tmp, ImageFormat::Png)
            .map_err(|source| DisplayError::Encode {
                path: tmp.clone(),
                source,
            })?;
        std::fs::rename(&tmp, &path).map_err(|source| DisplayError::Io { path, source })
    }
}

/// Discards every image.
pub struct NullSink;

impl DisplaySink for NullSink {
    fn show(&mut self, _stream_id: usize, _image: &RgbImage) -> Result<(), DisplayError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_png_sink_overwrites_per_stream_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = PngDirSink::create(&dir.path().join("out")).unwrap();

        sink.show(1, &RgbImage::new(4, 4)).unwrap();
        sink.show(1, &RgbImage::new(8, 6)).unwrap();

        let img = image::open(sink.path_for(1)).unwrap();
        assert_eq!((img.width(), img.height()), (8, 6));
        assert!(!sink.path_for(0).exists());
        let names: Vec<_> = std::fs::read_dir(dir.path().join("out"))
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec!["stream-1.png"]);
    }
}
