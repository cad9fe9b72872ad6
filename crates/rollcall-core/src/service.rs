//! Classifier service: owns the current classifier state and the training
//! pipeline that rebuilds it from the gallery.
//!
//! Readers take an `Arc` snapshot of the (model, label map) pair at call
//! entry; training builds a complete new pair off to the side and swaps the
//! pointer, so no reader ever sees a model paired with the wrong label map.

use crate::classifier::{ClassifierError, LabelMap, TrainableClassifier, TrainedModel};
use crate::gallery::{self, GalleryError};
use crate::lbph::LbphModel;
use crate::model_store::ModelStore;
use crate::preprocess::{self, Mode};
use crate::types::Identity;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("gallery error: {0}")]
    Gallery(#[from] GalleryError),
    #[error("classifier error: {0}")]
    Classifier(#[from] ClassifierError),
}

/// Result of a training request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrainOutcome {
    /// A new model replaced the previous state.
    Trained {
        identities: usize,
        samples: usize,
        /// Unreadable images skipped during the run.
        skipped: usize,
        /// Whether the artifacts reached disk. The in-memory model is live
        /// either way.
        persisted: bool,
    },
    /// Coalesced with a training that finished within the debounce window.
    Debounced,
    /// No identity had a readable sample; the classifier is now untrained.
    EmptyGallery,
}

impl TrainOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, TrainOutcome::EmptyGallery)
    }
}

type Snapshot<C> = Option<Arc<TrainedModel<C>>>;

pub struct ClassifierService<C = LbphModel> {
    gallery_root: PathBuf,
    store: ModelStore,
    state: RwLock<Snapshot<C>>,
    /// Serializes training runs; holds the completion time of the last successful one.
    last_trained: Mutex<Option<Instant>>,
    debounce: Duration,
}

impl<C: TrainableClassifier> ClassifierService<C> {
    /// Create an untrained service.
    pub fn new(gallery_root: impl Into<PathBuf>, store: ModelStore, debounce: Duration) -> Self {
        Self {
            gallery_root: gallery_root.into(),
            store,
            state: RwLock::new(None),
            last_trained: Mutex::new(None),
            debounce,
        }
    }

    /// Create a service and restore any persisted model.
    pub fn open(gallery_root: impl Into<PathBuf>, store: ModelStore, debounce: Duration) -> Self {
        let service = Self::new(gallery_root, store, debounce);
        service.load();
        service
    }

    /// Replace the in-memory state with the persisted pair, if any.
    /// Returns whether a model was loaded.
    pub fn load(&self) -> bool {
        match self.store.load::<C>() {
            Ok(Some(trained)) => {
                self.swap(Some(Arc::new(trained)));
                true
            }
            Ok(None) => false,
            Err(e) => {
                tracing::warn!(error = %e, "failed to load persisted model; starting untrained");
                false
            }
        }
    }

    pub fn gallery_root(&self) -> &Path {
        &self.gallery_root
    }

    /// The current (model, label map) pair, or `None` when untrained.
    pub fn snapshot(&self) -> Snapshot<C> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_trained(&self) -> bool {
        self.snapshot().is_some()
    }

    /// Identities known to the current label map.
    pub fn identities(&self) -> Vec<Identity> {
        self.snapshot()
            .map(|s| s.labels.iter().map(|(_, id)| id.clone()).collect())
            .unwrap_or_default()
    }

    /// Rebuild the classifier from a fresh scan of the gallery.
    ///
    /// Unless `force` is set, a request arriving within the debounce window
    /// of the last successful training is coalesced into it.
    pub fn train(&self, force: bool) -> Result<TrainOutcome, ServiceError> {
        let mut last_trained = self
            .last_trained
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if !force {
            if let Some(at) = *last_trained {
                if at.elapsed() < self.debounce {
                    tracing::debug!("training skipped: debounce window active");
                    return Ok(TrainOutcome::Debounced);
                }
            }
        }

        let entries = gallery::index(&self.gallery_root)?;
        let mut decoded: Vec<(Identity, image::GrayImage)> = Vec::with_capacity(entries.len());
        let mut skipped = 0usize;
        for entry in entries {
            match image::open(&entry.path) {
                Ok(img) => decoded.push((entry.identity, preprocess::normalize(&img, Mode::Training))),
                Err(e) => {
                    skipped += 1;
                    tracing::warn!(path = %entry.path.display(), error = %e, "skipping unreadable sample");
                }
            }
        }

        if decoded.is_empty() {
            tracing::info!(root = %self.gallery_root.display(), "no usable samples; classifier cleared");
            self.swap(None);
            if let Err(e) = self.store.clear() {
                tracing::warn!(error = %e, "failed to remove stale model artifacts");
            }
            return Ok(TrainOutcome::EmptyGallery);
        }

        let labels = LabelMap::from_identities(decoded.iter().map(|(id, _)| id.clone()));
        let mut samples = Vec::with_capacity(decoded.len());
        for (identity, sample) in decoded {
            // Every identity came from `decoded`, so the lookup cannot miss.
            if let Some(label) = labels.label_of(&identity) {
                samples.push((sample, label));
            }
        }

        let model = C::fit(&samples)?;
        let trained = Arc::new(TrainedModel { model, labels });
        let identities = trained.labels.len();
        self.swap(Some(Arc::clone(&trained)));

        let persisted = match self.store.save(&*trained) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(error = %e, "failed to persist model; continuing with in-memory state");
                false
            }
        };

        *last_trained = Some(Instant::now());
        tracing::info!(identities, samples = samples.len(), skipped, persisted, "training complete");

        Ok(TrainOutcome::Trained {
            identities,
            samples: samples.len(),
            skipped,
            persisted,
        })
    }

    /// Drop the in-memory model and its persisted artifacts.
    pub fn reset(&self) {
        self.swap(None);
        *self
            .last_trained
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
        if let Err(e) = self.store.clear() {
            tracing::warn!(error = %e, "failed to remove model artifacts during reset");
        }
        tracing::info!("classifier reset");
    }

    fn swap(&self, next: Snapshot<C>) {
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = next;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::{GrayImage, Luma};
    use std::fs;

    /// Write a synthetic face-like sample whose texture depends on `seed`.
    pub(crate) fn write_sample(root: &Path, folder: &str, file: &str, seed: u32) {
        let dir = root.join(folder);
        fs::create_dir_all(&dir).unwrap();
        pattern(seed).save(dir.join(file)).unwrap();
    }

    pub(crate) fn pattern(seed: u32) -> GrayImage {
        let period = 3 + seed * 4;
        GrayImage::from_fn(120, 120, |x, y| {
            let on = ((x / period) + (y / (period + seed))) % 2 == 0;
            Luma([if on { 40 + seed as u8 } else { 200 }])
        })
    }

    /// (model, label map) presence on disk.
    fn artifacts(root: &Path) -> (bool, bool) {
        let store = ModelStore::new(root.join("models"));
        (store.model_path().exists(), store.label_map_path().exists())
    }

    fn service(root: &Path) -> ClassifierService {
        ClassifierService::new(
            root.join("gallery"),
            ModelStore::new(root.join("models")),
            Duration::from_secs(5),
        )
    }

    #[test]
    fn test_training_is_deterministic() {
        let tmp = tempfile::tempdir().unwrap();
        let gallery = tmp.path().join("gallery");
        write_sample(&gallery, "carol", "1.png", 2);
        write_sample(&gallery, "alice", "1.png", 0);
        write_sample(&gallery, "bob", "1.png", 1);

        let svc = service(tmp.path());
        svc.train(true).unwrap();
        let first = svc.snapshot().unwrap().labels.clone();
        svc.train(true).unwrap();
        let second = svc.snapshot().unwrap().labels.clone();

        assert_eq!(first, second);
        assert_eq!(first.get(0).map(Identity::as_str), Some("alice"));
        assert_eq!(first.get(2).map(Identity::as_str), Some("carol"));
    }

    #[test]
    fn test_train_reports_counts_and_persists() {
        let tmp = tempfile::tempdir().unwrap();
        let gallery = tmp.path().join("gallery");
        write_sample(&gallery, "alice", "1.png", 0);
        write_sample(&gallery, "alice", "2.png", 1);
        write_sample(&gallery, "bob", "1.png", 2);
        fs::write(gallery.join("bob").join("broken.jpg"), b"garbage").unwrap();

        let svc = service(tmp.path());
        let outcome = svc.train(true).unwrap();
        assert_eq!(
            outcome,
            TrainOutcome::Trained {
                identities: 2,
                samples: 3,
                skipped: 1,
                persisted: true
            }
        );
        assert_eq!(artifacts(tmp.path()), (true, true));
    }

    #[test]
    fn test_trained_model_recognizes_its_samples() {
        let tmp = tempfile::tempdir().unwrap();
        let gallery = tmp.path().join("gallery");
        write_sample(&gallery, "alice", "1.png", 0);
        write_sample(&gallery, "bob", "1.png", 3);

        let svc = service(tmp.path());
        svc.train(true).unwrap();
        let snap = svc.snapshot().unwrap();
        let query = preprocess::normalize_gray(&pattern(3), Mode::Inference);
        let p = snap.model.predict(&query).unwrap();
        assert_eq!(snap.labels.get(p.label).map(Identity::as_str), Some("bob"));
    }

    #[test]
    fn test_empty_gallery_clears_state_and_artifacts() {
        let tmp = tempfile::tempdir().unwrap();
        let gallery = tmp.path().join("gallery");
        write_sample(&gallery, "alice", "1.png", 0);

        let svc = service(tmp.path());
        assert!(svc.train(true).unwrap().is_success());
        assert!(svc.is_trained());

        gallery::reset(&gallery).unwrap();
        let outcome = svc.train(true).unwrap();
        assert_eq!(outcome, TrainOutcome::EmptyGallery);
        assert!(!outcome.is_success());
        assert!(!svc.is_trained());
        let store = ModelStore::new(tmp.path().join("models"));
        assert!(!store.model_path().exists());
        assert!(!store.label_map_path().exists());
    }

    #[test]
    fn test_missing_gallery_is_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let svc = service(tmp.path());
        assert_eq!(svc.train(true).unwrap(), TrainOutcome::EmptyGallery);
    }

    #[test]
    fn test_debounce_coalesces_unforced_requests() {
        let tmp = tempfile::tempdir().unwrap();
        let gallery = tmp.path().join("gallery");
        write_sample(&gallery, "alice", "1.png", 0);

        let svc = service(tmp.path());
        assert!(matches!(svc.train(false).unwrap(), TrainOutcome::Trained { .. }));

        write_sample(&gallery, "bob", "1.png", 1);
        assert_eq!(svc.train(false).unwrap(), TrainOutcome::Debounced);
        assert_eq!(svc.identities().len(), 1);

        assert!(matches!(
            svc.train(true).unwrap(),
            TrainOutcome::Trained { identities: 2, .. }
        ));
    }

    #[test]
    fn test_restart_restores_persisted_model() {
        let tmp = tempfile::tempdir().unwrap();
        let gallery = tmp.path().join("gallery");
        write_sample(&gallery, "alice", "1.png", 0);
        service(tmp.path()).train(true).unwrap();

        let restarted: ClassifierService = ClassifierService::open(
            tmp.path().join("gallery"),
            ModelStore::new(tmp.path().join("models")),
            Duration::from_secs(5),
        );
        assert!(restarted.is_trained());
        assert_eq!(restarted.identities(), vec![Identity::from("alice")]);
    }

    #[test]
    fn test_reset_drops_model() {
        let tmp = tempfile::tempdir().unwrap();
        write_sample(&tmp.path().join("gallery"), "alice", "1.png", 0);
        let svc = service(tmp.path());
        svc.train(true).unwrap();

        svc.reset();
        assert!(!svc.is_trained());
        assert_eq!(artifacts(tmp.path()), (false, false));
    }

    #[test]
    fn test_snapshot_survives_retrain() {
        let tmp = tempfile::tempdir().unwrap();
        let gallery = tmp.path().join("gallery");
        write_sample(&gallery, "alice", "1.png", 0);
        let svc = service(tmp.path());
        svc.train(true).unwrap();

        let held = svc.snapshot().unwrap();
        write_sample(&gallery, "aaron", "1.png", 2);
        svc.train(true).unwrap();

        // The in-flight snapshot keeps its own consistent pair.
        assert_eq!(held.labels.len(), 1);
        assert_eq!(held.labels.get(0).map(Identity::as_str), Some("alice"));
        let fresh = svc.snapshot().unwrap();
        assert_eq!(fresh.labels.get(0).map(Identity::as_str), Some("aaron"));
    }
}
