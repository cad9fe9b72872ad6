//! Enrollment gallery on disk.
//!
//! One subdirectory per identity under the gallery root, each holding that
//! person's sample images. Directory names are the folder-safe form of the
//! identity (`/` replaced by `-`).
//!
//! The indexer visits identities and files in lexicographic order so that
//! the label map built from its output is reproducible across platforms.

use crate::types::Identity;
use image::ImageReader;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("failed to read {path}: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("failed to modify {path}: {source}")]
    Write { path: PathBuf, source: io::Error },
    #[error("invalid identity: {0:?}")]
    InvalidIdentity(String),
}

/// One enrolled sample image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GalleryEntry {
    pub identity: Identity,
    pub path: PathBuf,
}

/// Folder-safe form of an identity.
pub fn folder_name(identity: &str) -> String {
    identity.replace('/', "-")
}

/// Directory holding the samples of `identity`.
pub fn identity_dir(root: &Path, identity: &str) -> Result<PathBuf, GalleryError> {
    let name = folder_name(identity);
    if name.is_empty() || name == "." || name == ".." || name.contains('\\') {
        return Err(GalleryError::InvalidIdentity(identity.to_string()));
    }
    Ok(root.join(name))
}

/// Create the sample directory for `identity` if missing.
pub fn ensure_identity_dir(root: &Path, identity: &str) -> Result<PathBuf, GalleryError> {
    let dir = identity_dir(root, identity)?;
    fs::create_dir_all(&dir).map_err(|source| GalleryError::Write {
        path: dir.clone(),
        source,
    })?;
    Ok(dir)
}

/// Scan the gallery and list every sample image, ordered by identity then
/// file name.
///
/// Returns an empty list when `root` does not exist. Top-level files are
/// ignored, and files whose image format cannot be recognized are skipped.
pub fn index(root: &Path) -> Result<Vec<GalleryEntry>, GalleryError> {
    if !root.exists() {
        tracing::debug!(root = %root.display(), "gallery root missing");
        return Ok(Vec::new());
    }

    let mut entries = Vec::new();
    for dir in sorted_children(root)? {
        if !dir.is_dir() {
            continue;
        }
        let Some(name) = dir.file_name().and_then(|n| n.to_str()) else {
            tracing::warn!(path = %dir.display(), "skipping non-UTF-8 identity folder");
            continue;
        };
        let identity = Identity::new(name);

        for file in sorted_children(&dir)? {
            if !file.is_file() {
                continue;
            }
            if !is_image_file(&file) {
                tracing::debug!(path = %file.display(), "skipping non-image file");
                continue;
            }
            entries.push(GalleryEntry {
                identity: identity.clone(),
                path: file,
            });
        }
    }

    Ok(entries)
}

/// Number of files in the sample directory of `identity`.
pub fn sample_count(root: &Path, identity: &str) -> Result<usize, GalleryError> {
    let dir = identity_dir(root, identity)?;
    if !dir.exists() {
        return Ok(0);
    }
    Ok(sorted_children(&dir)?.iter().filter(|p| p.is_file()).count())
}

/// Delete the sample directory of `identity`. Returns whether it existed.
pub fn remove_identity(root: &Path, identity: &str) -> Result<bool, GalleryError> {
    let dir = identity_dir(root, identity)?;
    if !dir.exists() {
        return Ok(false);
    }
    fs::remove_dir_all(&dir).map_err(|source| GalleryError::Write {
        path: dir.clone(),
        source,
    })?;
    tracing::info!(identity, "removed identity from gallery");
    Ok(true)
}

/// Delete everything under the gallery root, keeping the root itself.
/// Returns the number of removed entries.
pub fn reset(root: &Path) -> Result<usize, GalleryError> {
    if !root.exists() {
        return Ok(0);
    }
    let mut removed = 0;
    for path in sorted_children(root)? {
        let result = if path.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        match result {
            Ok(()) => removed += 1,
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to delete gallery entry"),
        }
    }
    tracing::info!(removed, "gallery reset");
    Ok(removed)
}

fn sorted_children(dir: &Path) -> Result<Vec<PathBuf>, GalleryError> {
    let read_err = |source| GalleryError::Read {
        path: dir.to_path_buf(),
        source,
    };
    let mut paths = fs::read_dir(dir)
        .map_err(read_err)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(read_err)?;
    paths.sort();
    Ok(paths)
}

fn is_image_file(path: &Path) -> bool {
    ImageReader::open(path)
        .and_then(|r| r.with_guessed_format())
        .map(|r| r.format().is_some())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::GrayImage;

    fn write_sample(root: &Path, folder: &str, file: &str) {
        let dir = root.join(folder);
        fs::create_dir_all(&dir).unwrap();
        GrayImage::from_pixel(8, 8, image::Luma([120u8]))
            .save(dir.join(file))
            .unwrap();
    }

    #[test]
    fn test_index_missing_root_is_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let entries = index(&tmp.path().join("nope")).unwrap();
        assert!(entries.is_empty());
    }

    #[test]
    fn test_index_lexicographic_order() {
        let tmp = tempfile::tempdir().unwrap();
        write_sample(tmp.path(), "zed", "1.png");
        write_sample(tmp.path(), "alice", "2.png");
        write_sample(tmp.path(), "alice", "1.png");
        write_sample(tmp.path(), "bob", "1.png");

        let entries = index(tmp.path()).unwrap();
        let order: Vec<(String, String)> = entries
            .iter()
            .map(|e| {
                (
                    e.identity.to_string(),
                    e.path.file_name().unwrap().to_string_lossy().into_owned(),
                )
            })
            .collect();
        assert_eq!(
            order,
            vec![
                ("alice".into(), "1.png".into()),
                ("alice".into(), "2.png".into()),
                ("bob".into(), "1.png".into()),
                ("zed".into(), "1.png".into()),
            ]
        );
    }

    #[test]
    fn test_index_skips_top_level_files_and_non_images() {
        let tmp = tempfile::tempdir().unwrap();
        write_sample(tmp.path(), "alice", "1.png");
        fs::write(tmp.path().join("stray.png"), b"not in a folder").unwrap();
        fs::write(tmp.path().join("alice").join("notes.txt"), b"hello").unwrap();

        let entries = index(tmp.path()).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].identity.as_str(), "alice");
    }

    #[test]
    fn test_folder_name_substitutes_slashes() {
        assert_eq!(folder_name("123/A"), "123-A");
        assert_eq!(folder_name("CS/2024/007"), "CS-2024-007");
        assert_eq!(folder_name("plain"), "plain");
    }

    #[test]
    fn test_identity_dir_rejects_traversal() {
        let root = Path::new("/gallery");
        assert!(identity_dir(root, "..").is_err());
        assert!(identity_dir(root, "").is_err());
        assert_eq!(identity_dir(root, "123/A").unwrap(), root.join("123-A"));
    }

    #[test]
    fn test_sample_count_and_remove() {
        let tmp = tempfile::tempdir().unwrap();
        write_sample(tmp.path(), "123-A", "1.png");
        write_sample(tmp.path(), "123-A", "2.png");

        assert_eq!(sample_count(tmp.path(), "123/A").unwrap(), 2);
        assert!(remove_identity(tmp.path(), "123/A").unwrap());
        assert_eq!(sample_count(tmp.path(), "123/A").unwrap(), 0);
        assert!(!remove_identity(tmp.path(), "123/A").unwrap());
    }

    #[test]
    fn test_reset_keeps_root() {
        let tmp = tempfile::tempdir().unwrap();
        write_sample(tmp.path(), "alice", "1.png");
        write_sample(tmp.path(), "bob", "1.png");
        fs::write(tmp.path().join("stray.txt"), b"x").unwrap();

        assert_eq!(reset(tmp.path()).unwrap(), 3);
        assert!(tmp.path().exists());
        assert!(index(tmp.path()).unwrap().is_empty());
    }
}
