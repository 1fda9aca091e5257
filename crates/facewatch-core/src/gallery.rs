//! In-memory gallery of reference faces.
//!
//! Loaded from a directory with one subdirectory per person:
//!
//! ```text
//! database/
//!   alice/
//!     name.txt      (optional display name)
//!     photo1.jpg
//!     photo2.png
//!   bob/
//!     ...
//! ```
//!
//! Every photo with exactly one detectable face contributes one entry.

use crate::gateway::{Capturer, GatewayError, Recognizer};
use crate::thumbnail::{make_thumbnail, Labeler};
use crate::types::{DatabaseElement, Template};
use image::RgbImage;
use std::path::{Path, PathBuf};
use thiserror::Error;

const NAME_FILE: &str = "name.txt";

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("database directory not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("cannot read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("gateway: {0}")]
    Gateway(#[from] GatewayError),
}

/// Why a photo did not make it into the gallery.
#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    Unreadable(String),
    FaceCount(usize),
}

#[derive(Debug, Clone)]
pub struct SkippedPhoto {
    pub path: PathBuf,
    pub reason: SkipReason,
}

/// Gallery entries with their display thumbnails and names, index-aligned.
#[derive(Default)]
pub struct Gallery {
    entries: Vec<DatabaseElement>,
    thumbnails: Vec<RgbImage>,
    names: Vec<String>,
}

impl Gallery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one entry. Its element id is its index.
    pub fn push(
        &mut self,
        person_id: u64,
        template: Template,
        distance_threshold: f32,
        thumbnail: RgbImage,
        name: String,
    ) -> u64 {
        let element_id = self.entries.len() as u64;
        self.entries.push(DatabaseElement {
            element_id,
            person_id,
            template,
            distance_threshold,
        });
        self.thumbnails.push(thumbnail);
        self.names.push(name);
        element_id
    }

    pub fn entries(&self) -> &[DatabaseElement] {
        &self.entries
    }

    pub fn thumbnails(&self) -> &[RgbImage] {
        &self.thumbnails
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn thumbnail(&self, index: usize) -> Option<&RgbImage> {
        self.thumbnails.get(index)
    }

    pub fn name(&self, index: usize) -> Option<&str> {
        self.names.get(index).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Next unused person id.
    fn next_person_id(&self) -> u64 {
        self.entries.iter().map(|e| e.person_id + 1).max().unwrap_or(0)
    }

    /// Build a gallery from a database directory.
    ///
    /// Unreadable photos and photos without exactly one face are skipped with a
    /// warning and reported in the returned list. Only a missing root
    /// directory, filesystem errors and gateway failures are errors.
    pub fn load(
        root: &Path,
        capturer: &mut dyn Capturer,
        recognizer: &mut dyn Recognizer,
        distance_threshold: f32,
        thumbnail_size: u32,
        labeler: Option<&Labeler>,
    ) -> Result<(Self, Vec<SkippedPhoto>), GalleryError> {
        if !root.is_dir() {
            return Err(GalleryError::NotFound(root.to_path_buf()));
        }

        let mut gallery = Gallery::new();
        let mut skipped = Vec::new();

        let person_dirs = sorted_entries(root)?
            .into_iter()
            .filter(|p| p.is_dir())
            .collect::<Vec<_>>();

        for (person_id, person_dir) in person_dirs.iter().enumerate() {
            let files = sorted_entries(person_dir)?
                .into_iter()
                .filter(|p| p.is_file())
                .collect::<Vec<_>>();

            let name = read_name(person_dir);

            for path in files
                .iter()
                .filter(|p| p.file_name().and_then(|n| n.to_str()) != Some(NAME_FILE))
            {
                tracing::info!(path = %path.display(), name = %name, person_id, "processing");

                let image = match image::open(path) {
                    Ok(img) => img.to_rgb8(),
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "can't read image, skipped");
                        skipped.push(SkippedPhoto {
                            path: path.clone(),
                            reason: SkipReason::Unreadable(e.to_string()),
                        });
                        continue;
                    }
                };

                let mut samples = capturer.capture(&image)?;
                if samples.len() != 1 {
                    tracing::warn!(
                        path = %path.display(),
                        faces = samples.len(),
                        "expected exactly one face, image ignored"
                    );
                    skipped.push(SkippedPhoto {
                        path: path.clone(),
                        reason: SkipReason::FaceCount(samples.len()),
                    });
                    continue;
                }

                let sample = samples.remove(0);
                let template = recognizer.process(&sample)?;
                let thumbnail = make_thumbnail(&sample.crop, thumbnail_size, Some(&name), labeler);
                gallery.push(person_id as u64, template, distance_threshold, thumbnail, name.clone());
            }
        }

        assert_eq!(gallery.entries.len(), gallery.thumbnails.len());
        assert_eq!(gallery.entries.len(), gallery.names.len());

        tracing::info!(
            entries = gallery.len(),
            persons = person_dirs.len(),
            skipped = skipped.len(),
            "gallery loaded"
        );

        Ok((gallery, skipped))
    }

    /// Add persisted templates. Each label becomes its own person with a blank thumbnail.
    pub fn extend_from_templates(
        &mut self,
        templates: Vec<(String, Template)>,
        distance_threshold: f32,
        thumbnail_size: u32,
        labeler: Option<&Labeler>,
    ) {
        for (label, template) in templates {
            let person_id = self.next_person_id();
            let blank = RgbImage::new(thumbnail_size, thumbnail_size);
            let thumbnail = make_thumbnail(&blank, thumbnail_size, Some(&label), labeler);
            self.push(person_id, template, distance_threshold, thumbnail, label);
        }
    }
}

fn sorted_entries(dir: &Path) -> Result<Vec<PathBuf>, GalleryError> {
    let read = std::fs::read_dir(dir).map_err(|source| GalleryError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    let mut paths = read
        .map(|entry| entry.map(|e| e.path()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| GalleryError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
    paths.sort();
    Ok(paths)
}

fn read_name(person_dir: &Path) -> String {
    std::fs::read_to_string(person_dir.join(NAME_FILE))
        .map(|s| s.trim().to_string())
        .unwrap_or_default()
}
