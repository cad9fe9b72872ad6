//! Registration capture and gallery maintenance.
//!
//! A capture is accepted only when the frame holds exactly one face that is
//! not already confidently recognized as somebody else.

use crate::classifier::TrainableClassifier;
use crate::config::RecognitionConfig;
use crate::detector::FaceDetector;
use crate::gallery::{self, GalleryError};
use crate::pipeline::{self, PipelineError, RecognitionPipeline};
use crate::preprocess::SAMPLE_SIZE;
use crate::service::{ServiceError, TrainOutcome};
use crate::types::{FaceBox, FaceMatch, Identity};
use image::imageops::{self, FilterType};
use image::GrayImage;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EnrollError {
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error(transparent)]
    Gallery(#[from] GalleryError),
    #[error(transparent)]
    Training(#[from] ServiceError),
    #[error("failed to write sample {path}: {source}")]
    Save {
        path: PathBuf,
        source: image::ImageError,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum CaptureOutcome {
    NoFace,
    /// The face already belongs to another enrolled identity.
    Duplicate { identity: Identity, confidence: f64 },
    MultipleFaces { count: usize },
    Saved {
        path: PathBuf,
        /// Samples now stored for the identity.
        count: usize,
        bbox: FaceBox,
    },
}

pub struct Enroller<C, B> {
    pipeline: Arc<RecognitionPipeline<C, B>>,
    duplicate_threshold: f64,
    duplicate_min_confidence: f64,
}

impl<C: TrainableClassifier, B: FaceDetector> Enroller<C, B> {
    pub fn new(pipeline: Arc<RecognitionPipeline<C, B>>, config: &RecognitionConfig) -> Self {
        Self {
            pipeline,
            duplicate_threshold: config.duplicate_threshold,
            duplicate_min_confidence: config.duplicate_min_confidence,
        }
    }

    /// Validate `frame` and store its face as a new sample for `identity`.
    pub fn capture(&self, identity: &str, frame: &GrayImage) -> Result<CaptureOutcome, EnrollError> {
        let root = self.pipeline.classifier().gallery_root().to_path_buf();
        let dir = gallery::identity_dir(&root, identity)?;

        let matches = self.pipeline.detect_and_recognize(frame, self.duplicate_threshold)?;
        if matches.is_empty() {
            return Ok(CaptureOutcome::NoFace);
        }
        if let Some((other, confidence)) = self.duplicate_of(identity, &matches) {
            tracing::warn!(identity, existing = %other, confidence, "capture rejected: face already enrolled");
            return Ok(CaptureOutcome::Duplicate { identity: other, confidence });
        }
        if matches.len() > 1 {
            return Ok(CaptureOutcome::MultipleFaces { count: matches.len() });
        }

        let bbox = matches[0].bbox;
        let crop = imageops::crop_imm(frame, bbox.x, bbox.y, bbox.width, bbox.height).to_image();
        let sample = imageops::resize(&crop, SAMPLE_SIZE, SAMPLE_SIZE, FilterType::Triangle);

        gallery::ensure_identity_dir(&root, identity)?;
        let path = dir.join(format!("{}.jpg", uuid::Uuid::new_v4()));
        sample
            .save(&path)
            .map_err(|source| EnrollError::Save { path: path.clone(), source })?;

        let count = gallery::sample_count(&root, identity)?;
        tracing::info!(identity, count, path = %path.display(), "sample captured");
        Ok(CaptureOutcome::Saved { path, count, bbox })
    }

    /// Decode an encoded image and [`Self::capture`] it.
    pub fn capture_from_bytes(&self, identity: &str, bytes: &[u8]) -> Result<CaptureOutcome, EnrollError> {
        let frame = pipeline::decode(bytes)?.to_luma8();
        self.capture(identity, &frame)
    }

    /// Delete an identity's samples and retrain without them.
    pub fn remove_identity(&self, identity: &str) -> Result<TrainOutcome, EnrollError> {
        let root = self.pipeline.classifier().gallery_root();
        let removed = gallery::remove_identity(root, identity)?;
        tracing::info!(identity, removed, "identity removed from gallery");
        Ok(self.pipeline.classifier().train(true)?)
    }

    /// Delete every sample and drop the classifier.
    pub fn reset(&self) -> Result<usize, EnrollError> {
        let classifier = self.pipeline.classifier();
        let removed = gallery::reset(classifier.gallery_root())?;
        classifier.reset();
        tracing::info!(removed, "gallery reset");
        Ok(removed)
    }

    fn duplicate_of(&self, identity: &str, matches: &[FaceMatch]) -> Option<(Identity, f64)> {
        let own = gallery::folder_name(identity);
        matches.iter().find_map(|m| {
            let other = m.recognition.identity()?;
            let same = other.as_str() == identity || gallery::folder_name(other.as_str()) == own;
            (!same && m.confidence > self.duplicate_min_confidence).then(|| (other.clone(), m.confidence))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::tests::FixedBackend;
    use crate::detector::{Detection, Detector, DetectorConfig};
    use crate::lbph::LbphModel;
    use crate::model_store::ModelStore;
    use crate::service::tests::{pattern, write_sample};
    use crate::service::ClassifierService;
    use crate::types::Recognition;
    use image::Luma;
    use std::path::Path;
    use std::time::Duration;

    type TestEnroller = Enroller<LbphModel, FixedBackend>;

    fn face(x: f32) -> Detection {
        Detection { x, y: 40.0, width: 120.0, height: 120.0, score: 0.9 }
    }

    fn enroller(root: &Path, faces: Vec<Detection>) -> TestEnroller {
        enroller_with(root, faces, &RecognitionConfig::default())
    }

    fn enroller_with(root: &Path, faces: Vec<Detection>, config: &RecognitionConfig) -> TestEnroller {
        let svc = Arc::new(ClassifierService::new(
            root.join("gallery"),
            ModelStore::new(root.join("models")),
            Duration::from_secs(5),
        ));
        let detector = Detector::new(FixedBackend::new(faces), DetectorConfig::default());
        Enroller::new(Arc::new(RecognitionPipeline::new(svc, detector)), config)
    }

    fn frame(seed: u32) -> GrayImage {
        let mut frame = GrayImage::from_pixel(400, 300, Luma([128]));
        imageops::replace(&mut frame, &pattern(seed), 40, 40);
        frame
    }

    fn scored(identity: Option<&str>, confidence: f64) -> FaceMatch {
        FaceMatch {
            bbox: FaceBox { x: 0, y: 0, width: 50, height: 50 },
            recognition: identity.map_or(Recognition::Unknown, |i| Recognition::Identified(Identity::from(i))),
            distance: Some(100.0 - confidence),
            confidence,
        }
    }

    #[test]
    fn test_duplicate_rule() {
        let tmp = tempfile::tempdir().unwrap();
        let e = enroller(tmp.path(), vec![]);

        assert!(e.duplicate_of("new", &[scored(Some("123/A"), 75.0)]).is_some());
        assert!(e.duplicate_of("new", &[scored(Some("123/A"), 70.0)]).is_none());
        assert!(e.duplicate_of("new", &[scored(None, 99.0)]).is_none());
        // same person, raw or folder-safe
        assert!(e.duplicate_of("123/A", &[scored(Some("123/A"), 95.0)]).is_none());
        assert!(e.duplicate_of("123-A", &[scored(Some("123/A"), 95.0)]).is_none());
    }

    #[test]
    fn test_capture_saves_sample() {
        let tmp = tempfile::tempdir().unwrap();
        let e = enroller(tmp.path(), vec![face(40.0)]);

        let outcome = e.capture("123/A", &frame(1)).unwrap();
        let CaptureOutcome::Saved { path, count, bbox } = outcome.clone() else {
            panic!("expected a saved sample, got {outcome:?}");
        };
        assert_eq!(count, 1);
        assert_eq!(bbox, FaceBox { x: 40, y: 40, width: 120, height: 120 });
        assert_eq!(path.parent().unwrap(), tmp.path().join("gallery").join("123-A"));
        assert_eq!(path.extension().unwrap(), "jpg");

        let saved = image::open(&path).unwrap();
        assert_eq!((saved.width(), saved.height()), (SAMPLE_SIZE, SAMPLE_SIZE));
    }

    #[test]
    fn test_capture_without_face() {
        let tmp = tempfile::tempdir().unwrap();
        let e = enroller(tmp.path(), vec![]);
        assert_eq!(e.capture("a", &frame(0)).unwrap(), CaptureOutcome::NoFace);
        assert!(!tmp.path().join("gallery").join("a").exists());
    }

    #[test]
    fn test_capture_rejects_multiple_faces() {
        let tmp = tempfile::tempdir().unwrap();
        let e = enroller(tmp.path(), vec![face(40.0), face(240.0)]);
        assert_eq!(
            e.capture("a", &frame(0)).unwrap(),
            CaptureOutcome::MultipleFaces { count: 2 }
        );
    }

    #[test]
    fn test_capture_same_identity_is_not_duplicate() {
        let tmp = tempfile::tempdir().unwrap();
        let gallery = tmp.path().join("gallery");
        write_sample(&gallery, "alice", "1.png", 2);
        let e = enroller(tmp.path(), vec![face(40.0)]);
        e.pipeline.classifier().train(true).unwrap();

        assert!(matches!(
            e.capture("alice", &frame(2)).unwrap(),
            CaptureOutcome::Saved { count: 2, .. }
        ));
    }

    #[test]
    fn test_capture_rejects_face_enrolled_as_someone_else() {
        let tmp = tempfile::tempdir().unwrap();
        write_sample(&tmp.path().join("gallery"), "bob", "1.png", 2);
        let capture = |duplicate_threshold, duplicate_min_confidence| {
            let config = RecognitionConfig {
                duplicate_threshold,
                duplicate_min_confidence,
                ..RecognitionConfig::default()
            };
            let e = enroller_with(tmp.path(), vec![face(40.0)], &config);
            e.pipeline.classifier().train(true).unwrap();
            e.capture("alice", &frame(2)).unwrap()
        };

        let outcome = capture(1000.0, -1.0);
        let CaptureOutcome::Duplicate { identity, confidence } = outcome.clone() else {
            panic!("expected a duplicate, got {outcome:?}");
        };
        assert_eq!(identity, Identity::from("bob"));
        assert!(confidence >= 0.0);
        assert!(!tmp.path().join("gallery").join("alice").exists());

        // nothing clears a zero threshold, so the face reads as unknown
        assert!(matches!(capture(0.0, -1.0), CaptureOutcome::Saved { count: 1, .. }));
        // confidence never exceeds 100
        assert!(matches!(capture(1000.0, 100.0), CaptureOutcome::Saved { count: 2, .. }));
    }

    #[test]
    fn test_capture_rejects_invalid_identity() {
        let tmp = tempfile::tempdir().unwrap();
        let e = enroller(tmp.path(), vec![face(40.0)]);
        assert!(matches!(
            e.capture("..", &frame(0)),
            Err(EnrollError::Gallery(GalleryError::InvalidIdentity(_)))
        ));
    }

    #[test]
    fn test_capture_from_bytes_rejects_garbage() {
        let tmp = tempfile::tempdir().unwrap();
        let e = enroller(tmp.path(), vec![face(40.0)]);
        assert!(matches!(
            e.capture_from_bytes("a", b"nope"),
            Err(EnrollError::Pipeline(PipelineError::Decode(_)))
        ));
    }

    #[test]
    fn test_remove_and_reset() {
        let tmp = tempfile::tempdir().unwrap();
        let gallery = tmp.path().join("gallery");
        write_sample(&gallery, "alice", "1.png", 0);
        write_sample(&gallery, "bob", "1.png", 3);
        let e = enroller(tmp.path(), vec![]);
        e.pipeline.classifier().train(true).unwrap();

        let outcome = e.remove_identity("bob").unwrap();
        assert!(matches!(outcome, TrainOutcome::Trained { identities: 1, .. }));
        assert_eq!(e.pipeline.classifier().identities(), vec![Identity::from("alice")]);

        assert_eq!(e.reset().unwrap(), 1);
        assert!(!e.pipeline.classifier().is_trained());
        assert!(gallery.exists());
    }
}
