//! Persistence of the fitted classifier and its label map.
//!
//! Both artifacts live side by side in the model directory and are only
//! meaningful together: a load succeeds only when both files are present.

use crate::classifier::{LabelMap, TrainedModel};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

const MODEL_FILE: &str = "trained_model.json";
const LABEL_MAP_FILE: &str = "label_map.json";

#[derive(Error, Debug)]
pub enum ModelStoreError {
    #[error("model store I/O on {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("corrupt model artifact {path}: {source}")]
    Corrupt {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// Model directory holding the (model, label map) pair.
#[derive(Debug, Clone)]
pub struct ModelStore {
    dir: PathBuf,
}

impl ModelStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn model_path(&self) -> PathBuf {
        self.dir.join(MODEL_FILE)
    }

    pub fn label_map_path(&self) -> PathBuf {
        self.dir.join(LABEL_MAP_FILE)
    }

    /// Persist the pair. Each file is written to a temporary sibling and
    /// renamed into place so a crash never leaves a truncated artifact.
    pub fn save<C: Serialize>(&self, trained: &TrainedModel<C>) -> Result<(), ModelStoreError> {
        fs::create_dir_all(&self.dir).map_err(|source| ModelStoreError::Io {
            path: self.dir.clone(),
            source,
        })?;
        write_json(&self.model_path(), &trained.model)?;
        write_json(&self.label_map_path(), &trained.labels)?;
        tracing::info!(dir = %self.dir.display(), identities = trained.labels.len(), "model saved");
        Ok(())
    }

    /// Restore the pair. A missing or half-present pair yields `Ok(None)`.
    pub fn load<C: DeserializeOwned>(&self) -> Result<Option<TrainedModel<C>>, ModelStoreError> {
        let model_path = self.model_path();
        let labels_path = self.label_map_path();
        match (model_path.exists(), labels_path.exists()) {
            (true, true) => {}
            (false, false) => return Ok(None),
            (has_model, has_labels) => {
                tracing::warn!(
                    dir = %self.dir.display(),
                    has_model,
                    has_labels,
                    "incomplete model artifacts; ignoring"
                );
                return Ok(None);
            }
        }

        let model: C = read_json(&model_path)?;
        let labels: LabelMap = read_json(&labels_path)?;
        tracing::info!(dir = %self.dir.display(), identities = labels.len(), "model loaded");
        Ok(Some(TrainedModel { model, labels }))
    }

    /// Delete both artifacts if present.
    pub fn clear(&self) -> Result<(), ModelStoreError> {
        for path in [self.model_path(), self.label_map_path()] {
            match fs::remove_file(&path) {
                Ok(()) => tracing::debug!(path = %path.display(), "removed model artifact"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(source) => return Err(ModelStoreError::Io { path, source }),
            }
        }
        Ok(())
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), ModelStoreError> {
    let io_err = |source| ModelStoreError::Io {
        path: path.to_path_buf(),
        source,
    };
    let bytes = serde_json::to_vec(value).map_err(|source| ModelStoreError::Corrupt {
        path: path.to_path_buf(),
        source,
    })?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, bytes).map_err(io_err)?;
    fs::rename(&tmp, path).map_err(io_err)
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, ModelStoreError> {
    let bytes = fs::read(path).map_err(|source| ModelStoreError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_slice(&bytes).map_err(|source| ModelStoreError::Corrupt {
        path: path.to_path_buf(),
        source,
    })
}
