//! Persisted templates: one JSON blob per file, file stem = display label.

use crate::types::Template;
use std::path::{Path, PathBuf};
use thiserror::Error;

const EXTENSION: &str = "json";

#[derive(Error, Debug)]
pub enum TemplateStoreError {
    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{}: {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid label {0:?}")]
    InvalidLabel(String),
}

/// Write `template` to `<dir>/<label>.json`, creating `dir` if needed.
pub fn save(dir: &Path, label: &str, template: &Template) -> Result<PathBuf, TemplateStoreError> {
    if label.is_empty() || label.contains(['/', '\\']) || label.starts_with('.') {
        return Err(TemplateStoreError::InvalidLabel(label.to_string()));
    }

    std::fs::create_dir_all(dir).map_err(|source| TemplateStoreError::Io {
        path: dir.to_path_buf(),
        source,
    })?;

    let path = dir.join(format!("{label}.{EXTENSION}"));
    let blob = serde_json::to_vec(template).map_err(|source| TemplateStoreError::Json {
        path: path.clone(),
        source,
    })?;
    std::fs::write(&path, blob).map_err(|source| TemplateStoreError::Io {
        path: path.clone(),
        source,
    })?;

    tracing::debug!(path = %path.display(), "template saved");
    Ok(path)
}

/// Read every `*.json` template in `dir`, sorted by label.
///
/// Blobs that fail to parse are skipped with a warning.
pub fn load(dir: &Path) -> Result<Vec<(String, Template)>, TemplateStoreError> {
    let read = std::fs::read_dir(dir).map_err(|source| TemplateStoreError::Io {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut paths = Vec::new();
    for entry in read {
        let path = entry
            .map_err(|source| TemplateStoreError::Io {
                path: dir.to_path_buf(),
                source,
            })?
            .path();
        if path.is_file() && path.extension().and_then(|e| e.to_str()) == Some(EXTENSION) {
            paths.push(path);
        }
    }
    paths.sort();

    let mut templates = Vec::with_capacity(paths.len());
    for path in paths {
        let Some(label) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
            continue;
        };
        let blob = std::fs::read(&path).map_err(|source| TemplateStoreError::Io {
            path: path.clone(),
            source,
        })?;
        match serde_json::from_slice::<Template>(&blob) {
            Ok(template) => templates.push((label, template)),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "unreadable template, skipped");
            }
        }
    }

    Ok(templates)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template(v: f32) -> Template {
        Template { values: vec![v, 1.0 - v], method: Some("test".into()) }
    }

    #[test]
    fn test_save_then_load_sorted_by_label() {
        let dir = tempfile::tempdir().unwrap();
        save(dir.path(), "zoe", &template(0.1)).unwrap();
        save(dir.path(), "adam", &template(0.9)).unwrap();

        let loaded = load(dir.path()).unwrap();
        let labels: Vec<_> = loaded.iter().map(|(l, _)| l.as_str()).collect();
        assert_eq!(labels, vec!["adam", "zoe"]);
        assert_eq!(loaded[0].1.values, vec![0.9, 1.0 - 0.9]);
    }

    #[test]
    fn test_corrupt_blob_and_other_files_skipped() {
        let dir = tempfile::tempdir().unwrap();
        save(dir.path(), "ok", &template(0.5)).unwrap();
        std::fs::write(dir.path().join("broken.json"), b"{not json").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"hello").unwrap();

        let loaded = load(dir.path()).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].0, "ok");
    }

    #[test]
    fn test_invalid_labels_rejected() {
        let dir = tempfile::tempdir().unwrap();
        for label in ["", "a/b", ".hidden"] {
            assert!(matches!(
                save(dir.path(), label, &template(0.0)),
                Err(TemplateStoreError::InvalidLabel(_))
            ));
        }
    }

    #[test]
    fn test_missing_dir_is_error() {
        assert!(load(Path::new("/nonexistent/templates")).is_err());
    }
}
