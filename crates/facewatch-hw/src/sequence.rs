//! Still images played back as a video stream.
//!
//! A directory yields its images in file-name order; a single file yields one
//! frame. A color image `foo.png` picks up `foo.depth.png` (16-bit grayscale,
//! millimetres) as its depth map when present.

use facewatch_core::{Frame, FrameSource, SourceError};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};

const DEPTH_SUFFIX: &str = ".depth";
const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp", "pgm", "ppm", "tif", "tiff"];

pub struct ImageSequenceSource {
    name: String,
    pending: VecDeque<PathBuf>,
    sequence: u64,
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

fn is_depth(path: &Path) -> bool {
    path.file_stem()
        .and_then(|s| s.to_str())
        .is_some_and(|s| s.ends_with(DEPTH_SUFFIX))
}

fn depth_path(color: &Path) -> Option<PathBuf> {
    let stem = color.file_stem()?.to_str()?;
    let path = color.with_file_name(format!("{stem}{DEPTH_SUFFIX}.png"));
    path.is_file().then_some(path)
}

impl ImageSequenceSource {
    /// Open a directory of images or a single image file.
    pub fn open(path: &Path) -> Result<Self, SourceError> {
        let io_err = |source: std::io::Error| SourceError::Io {
            path: path.to_path_buf(),
            source,
        };

        let pending = if path.is_dir() {
            let mut files = std::fs::read_dir(path)
                .map_err(io_err)?
                .map(|entry| entry.map(|e| e.path()))
                .collect::<Result<Vec<_>, _>>()
                .map_err(io_err)?;
            files.retain(|p| p.is_file() && is_image(p) && !is_depth(p));
            files.sort();
            files.into()
        } else if path.is_file() {
            VecDeque::from([path.to_path_buf()])
        } else {
            return Err(io_err(std::io::Error::from(std::io::ErrorKind::NotFound)));
        };

        tracing::info!(path = %path.display(), frames = pending.len(), "opened image sequence");

        Ok(Self {
            name: path.display().to_string(),
            pending,
            sequence: 0,
        })
    }

    pub fn remaining(&self) -> usize {
        self.pending.len()
    }
}

fn decode(path: &Path) -> Result<image::DynamicImage, SourceError> {
    image::open(path).map_err(|source| SourceError::Decode {
        path: path.to_path_buf(),
        source,
    })
}

impl FrameSource for ImageSequenceSource {
    fn name(&self) -> &str {
        &self.name
    }

    /// An undecodable image is a bad frame; the following `get` moves on to the next file.
    fn get(&mut self) -> Result<Option<Frame>, SourceError> {
        let Some(path) = self.pending.pop_front() else {
            return Ok(None);
        };

        let color = decode(&path)?.to_rgb8();
        self.sequence += 1;
        let mut frame = Frame::new(color, self.sequence);

        if let Some(depth_path) = depth_path(&path) {
            match decode(&depth_path).map(|d| d.into_luma16()) {
                Ok(depth) if depth.dimensions() == frame.color.dimensions() => {
                    frame = frame.with_depth(depth);
                }
                Ok(_) => {
                    tracing::warn!(
                        path = %depth_path.display(),
                        "depth map size differs from color image, ignored"
                    );
                }
                Err(e) => {
                    tracing::warn!(error = %e, "depth map ignored");
                }
            }
        }

        Ok(Some(frame))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Luma, Rgb, RgbImage};

    #[test]
    fn test_directory_plays_in_name_order_then_ends() {
        let dir = tempfile::tempdir().unwrap();
        RgbImage::from_pixel(4, 4, Rgb([2, 2, 2])).save(dir.path().join("b.png")).unwrap();
        RgbImage::from_pixel(4, 4, Rgb([1, 1, 1])).save(dir.path().join("a.png")).unwrap();
        std::fs::write(dir.path().join("readme.txt"), "x").unwrap();

        let mut source = ImageSequenceSource::open(dir.path()).unwrap();
        assert_eq!(source.remaining(), 2);
        let first = source.get().unwrap().unwrap();
        assert_eq!(first.color.get_pixel(0, 0).0, [1, 1, 1]);
        assert_eq!(first.sequence, 1);
        let second = source.get().unwrap().unwrap();
        assert_eq!(second.color.get_pixel(0, 0).0, [2, 2, 2]);
        assert!(source.get().unwrap().is_none());
    }

    #[test]
    fn test_depth_sibling_is_attached_not_played() {
        let dir = tempfile::tempdir().unwrap();
        RgbImage::new(4, 3).save(dir.path().join("f.png")).unwrap();
        image::ImageBuffer::<Luma<u16>, Vec<u16>>::from_pixel(4, 3, Luma([1200]))
            .save(dir.path().join("f.depth.png"))
            .unwrap();

        let mut source = ImageSequenceSource::open(dir.path()).unwrap();
        assert_eq!(source.remaining(), 1);
        let frame = source.get().unwrap().unwrap();
        assert_eq!(frame.depth.unwrap().get_pixel(2, 2).0, [1200]);
    }

    #[test]
    fn test_single_file_and_missing_path() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("one.png");
        RgbImage::new(2, 2).save(&file).unwrap();
        let mut source = ImageSequenceSource::open(&file).unwrap();
        assert!(source.get().unwrap().is_some());
        assert!(source.get().unwrap().is_none());

        assert!(ImageSequenceSource::open(&dir.path().join("missing")).is_err());
    }

    #[test]
    fn test_corrupt_image_is_a_bad_frame_and_playback_continues() {
        let dir = tempfile::tempdir().unwrap();
        RgbImage::from_pixel(4, 4, Rgb([1, 1, 1])).save(dir.path().join("a.png")).unwrap();
        std::fs::write(dir.path().join("b.png"), b"nope").unwrap();
        RgbImage::from_pixel(4, 4, Rgb([3, 3, 3])).save(dir.path().join("c.png")).unwrap();

        let mut source = ImageSequenceSource::open(dir.path()).unwrap();
        assert_eq!(source.get().unwrap().unwrap().color.get_pixel(0, 0).0, [1, 1, 1]);
        let err = source.get().unwrap_err();
        assert!(matches!(err, SourceError::Decode { .. }));
        assert!(err.is_bad_frame());
        let last = source.get().unwrap().unwrap();
        assert_eq!(last.color.get_pixel(0, 0).0, [3, 3, 3]);
        assert_eq!(last.sequence, 2);
        assert!(source.get().unwrap().is_none());
    }

    #[test]
    fn test_corrupt_depth_map_is_dropped_not_the_frame() {
        let dir = tempfile::tempdir().unwrap();
        RgbImage::new(4, 3).save(dir.path().join("f.png")).unwrap();
        std::fs::write(dir.path().join("f.depth.png"), b"nope").unwrap();

        let mut source = ImageSequenceSource::open(dir.path()).unwrap();
        let frame = source.get().unwrap().unwrap();
        assert!(frame.depth.is_none());
    }
}
