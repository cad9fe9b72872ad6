//! Per-frame detect-and-classify pipeline.

use crate::classifier::{ClassifierError, LabelMap, Prediction, TrainableClassifier};
use crate::detector::{Detector, DetectorError, FaceDetector, ScrfdDetector};
use crate::lbph::LbphModel;
use crate::preprocess::{self, Mode};
use crate::service::ClassifierService;
use crate::types::{confidence_from_distance, FaceBox, FaceMatch, Recognition};
use image::{imageops, DynamicImage, GrayImage};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("detection failed: {0}")]
    Detector(#[from] DetectorError),
    #[error("image decode failed: {0}")]
    Decode(#[from] image::ImageError),
    #[error("classification failed: {0}")]
    Classifier(#[from] ClassifierError),
}

/// Decode an encoded image (JPEG, PNG, ...) from memory.
pub fn decode(bytes: &[u8]) -> Result<DynamicImage, PipelineError> {
    Ok(image::load_from_memory(bytes)?)
}

/// Turn a raw prediction into a [`FaceMatch`]: identified only when the
/// distance is strictly below `threshold` and the label is mapped.
pub fn classify(bbox: FaceBox, labels: &LabelMap, prediction: Prediction, threshold: f64) -> FaceMatch {
    let recognition = if prediction.distance < threshold {
        labels
            .get(prediction.label)
            .cloned()
            .map_or(Recognition::Unknown, Recognition::Identified)
    } else {
        Recognition::Unknown
    };
    FaceMatch {
        bbox,
        recognition,
        distance: Some(prediction.distance),
        confidence: confidence_from_distance(prediction.distance),
    }
}

/// Detector and classifier service wired together. Safe to share between
/// camera consumers; detection is serialized, classification is not.
pub struct RecognitionPipeline<C = LbphModel, B = ScrfdDetector> {
    classifier: Arc<ClassifierService<C>>,
    detector: Mutex<Detector<B>>,
}

impl<C: TrainableClassifier, B: FaceDetector> RecognitionPipeline<C, B> {
    pub fn new(classifier: Arc<ClassifierService<C>>, detector: Detector<B>) -> Self {
        Self {
            classifier,
            detector: Mutex::new(detector),
        }
    }

    pub fn classifier(&self) -> &Arc<ClassifierService<C>> {
        &self.classifier
    }

    /// Face boxes only, in frame coordinates.
    pub fn detect(&self, frame: &GrayImage) -> Result<Vec<FaceBox>, PipelineError> {
        let mut detector = self.detector.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(detector.detect(frame)?)
    }

    /// Detect every face in `frame` and classify it against the model
    /// snapshot current at entry. An untrained classifier yields Unknown
    /// matches with zero confidence.
    pub fn detect_and_recognize(&self, frame: &GrayImage, threshold: f64) -> Result<Vec<FaceMatch>, PipelineError> {
        let snapshot = self.classifier.snapshot();
        let boxes = self.detect(frame)?;

        let mut matches = Vec::with_capacity(boxes.len());
        for bbox in boxes {
            if bbox.width == 0 || bbox.height == 0 {
                continue;
            }
            let face = match &snapshot {
                None => FaceMatch {
                    bbox,
                    recognition: Recognition::Unknown,
                    distance: None,
                    confidence: 0.0,
                },
                Some(trained) => {
                    let crop = imageops::crop_imm(frame, bbox.x, bbox.y, bbox.width, bbox.height).to_image();
                    let sample = preprocess::normalize_gray(&crop, Mode::Inference);
                    let prediction = trained.model.predict(&sample)?;
                    classify(bbox, &trained.labels, prediction, threshold)
                }
            };
            matches.push(face);
        }

        tracing::debug!(
            faces = matches.len(),
            identified = matches.iter().filter(|m| !m.recognition.is_unknown()).count(),
            threshold,
            "frame recognized"
        );
        Ok(matches)
    }

    /// Decode an encoded image and run [`Self::detect_and_recognize`] on it.
    pub fn recognize_bytes(&self, bytes: &[u8], threshold: f64) -> Result<Vec<FaceMatch>, PipelineError> {
        let frame = decode(bytes)?.to_luma8();
        self.detect_and_recognize(&frame, threshold)
    }
}
