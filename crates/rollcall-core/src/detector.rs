//! Face detection.
//!
//! [`Detector`] is the stage the pipeline calls: it downscales the frame to a
//! fixed working width, equalizes lighting, runs a [`FaceDetector`] backend,
//! drops boxes below the minimum face size and maps survivors back to
//! original-frame coordinates. [`ScrfdDetector`] is the bundled backend,
//! running SCRFD through ONNX Runtime with anchor-free 3-stride decoding and
//! NMS.

use crate::preprocess::clahe_enhance;
use crate::types::FaceBox;
use image::imageops::{self, FilterType};
use image::GrayImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const SCRFD_INPUT_SIZE: usize = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_CONFIDENCE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

const DETECT_CLAHE_TILES: u32 = 8;
const DETECT_CLIP_LIMIT: f32 = 1.5;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// A raw detection in the coordinates of the image handed to the backend.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub score: f32,
}

/// A face-detection capability.
pub trait FaceDetector: Send {
    /// Detect faces in a grayscale image, best first. No faces is an empty
    /// list, not an error.
    fn detect(&mut self, gray: &GrayImage) -> Result<Vec<Detection>, DetectorError>;
}

impl<T: FaceDetector + ?Sized> FaceDetector for Box<T> {
    fn detect(&mut self, gray: &GrayImage) -> Result<Vec<Detection>, DetectorError> {
        (**self).detect(gray)
    }
}

/// Detection stage settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectorConfig {
    /// Frames are resized to this width before detection.
    pub target_width: u32,
    /// Minimum face side, in detection-frame pixels.
    pub min_face_size: u32,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            target_width: 400,
            min_face_size: 40,
        }
    }
}

/// Downscale → equalize → detect → filter → rescale.
pub struct Detector<B = ScrfdDetector> {
    backend: B,
    config: DetectorConfig,
}

impl<B: FaceDetector> Detector<B> {
    pub fn new(backend: B, config: DetectorConfig) -> Self {
        Self { backend, config }
    }

    /// Locate faces in `frame`, returning boxes in original-frame coordinates.
    pub fn detect(&mut self, frame: &GrayImage) -> Result<Vec<FaceBox>, DetectorError> {
        let (width, height) = frame.dimensions();
        if width == 0 || height == 0 || self.config.target_width == 0 {
            return Ok(Vec::new());
        }

        let scale = self.config.target_width as f32 / width as f32;
        let small_h = ((height as f32 * scale).round() as u32).max(1);
        let mut small = imageops::resize(frame, self.config.target_width, small_h, FilterType::Triangle);
        let (sw, sh) = small.dimensions();
        clahe_enhance(&mut small, sw, sh, DETECT_CLAHE_TILES, DETECT_CLIP_LIMIT);

        let detections = self.backend.detect(&small)?;
        let min = self.config.min_face_size as f32;
        let inv_scale = 1.0 / scale;

        let boxes: Vec<FaceBox> = detections
            .into_iter()
            .filter(|d| d.width >= min && d.height >= min)
            .filter_map(|d| {
                // a box hanging off the top-left edge loses the overhang
                let x0 = d.x.max(0.0);
                let y0 = d.y.max(0.0);
                let w = d.width - (x0 - d.x);
                let h = d.height - (y0 - d.y);
                if w <= 0.0 || h <= 0.0 {
                    return None;
                }
                let bbox = FaceBox {
                    x: (x0 * inv_scale) as u32,
                    y: (y0 * inv_scale) as u32,
                    width: (w * inv_scale) as u32,
                    height: (h * inv_scale) as u32,
                };
                bbox.clamp_to(width, height)
            })
            .collect();

        tracing::trace!(faces = boxes.len(), scale, "detection pass");
        Ok(boxes)
    }
}

/// Metadata for coordinate de-mapping after letterbox resize.
struct LetterboxInfo {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

/// Output tensor indices for one stride: (score_idx, bbox_idx).
type StrideOutputIndices = (usize, usize);

/// SCRFD face detector backend.
pub struct ScrfdDetector {
    session: Session,
    /// Per-stride output indices for strides [8, 16, 32], discovered by name
    /// at load time with a positional fallback.
    stride_indices: [StrideOutputIndices; 3],
}

impl ScrfdDetector {
    /// Load the SCRFD ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        tracing::info!(path = model_path, outputs = ?output_names, "loaded SCRFD model");

        if output_names.len() < 6 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD model requires at least 6 outputs (3 strides × score/bbox), got {}",
                output_names.len()
            )));
        }

        let stride_indices = discover_output_indices(&output_names);
        tracing::debug!(?stride_indices, "SCRFD output tensor mapping");

        Ok(Self {
            session,
            stride_indices,
        })
    }

    /// Letterbox a grayscale image into a 640×640 NCHW tensor.
    fn preprocess(gray: &GrayImage) -> (Array4<f32>, LetterboxInfo) {
        let (width, height) = gray.dimensions();
        let size = SCRFD_INPUT_SIZE as f32;
        let scale = (size / width as f32).min(size / height as f32);

        let new_w = ((width as f32 * scale).round() as u32).clamp(1, SCRFD_INPUT_SIZE as u32);
        let new_h = ((height as f32 * scale).round() as u32).clamp(1, SCRFD_INPUT_SIZE as u32);
        let pad_x = (size - new_w as f32) / 2.0;
        let pad_y = (size - new_h as f32) / 2.0;
        let resized = imageops::resize(gray, new_w, new_h, FilterType::Triangle);

        let pad_x0 = pad_x.floor() as usize;
        let pad_y0 = pad_y.floor() as usize;
        let (nw, nh) = (new_w as usize, new_h as usize);

        // Padding at SCRFD_MEAN normalizes to 0.0.
        let mut tensor = Array4::<f32>::zeros((1, 3, SCRFD_INPUT_SIZE, SCRFD_INPUT_SIZE));
        for y in 0..nh {
            for x in 0..nw {
                let pixel = resized.get_pixel(x as u32, y as u32).0[0] as f32;
                let v = (pixel - SCRFD_MEAN) / SCRFD_STD;
                for c in 0..3 {
                    tensor[[0, c, y + pad_y0, x + pad_x0]] = v;
                }
            }
        }

        (tensor, LetterboxInfo { scale, pad_x, pad_y })
    }
}

impl FaceDetector for ScrfdDetector {
    fn detect(&mut self, gray: &GrayImage) -> Result<Vec<Detection>, DetectorError> {
        let (input, letterbox) = Self::preprocess(gray);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut all = Vec::new();
        for (pos, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx) = self.stride_indices[pos];
            let (_, scores) = outputs[score_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("scores stride {stride}: {e}")))?;
            let (_, bboxes) = outputs[bbox_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("bboxes stride {stride}: {e}")))?;

            all.extend(decode_stride(
                scores,
                bboxes,
                stride,
                &letterbox,
                SCRFD_CONFIDENCE_THRESHOLD,
            ));
        }

        Ok(nms(all, SCRFD_NMS_THRESHOLD))
    }
}

/// Map stride slots to output tensors.
///
/// Named exports (`score_8`, `bbox_16`, ...) are matched by name; anything
/// else falls back to the standard positional layout `[0-2]` scores,
/// `[3-5]` boxes.
fn discover_output_indices(names: &[String]) -> [StrideOutputIndices; 3] {
    let find = |prefix: &str, stride: usize| -> Option<usize> {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| n == &target)
    };

    let named: Option<Vec<StrideOutputIndices>> = SCRFD_STRIDES
        .iter()
        .map(|&stride| Some((find("score", stride)?, find("bbox", stride)?)))
        .collect();

    match named {
        Some(v) => {
            tracing::info!("SCRFD: using name-based output tensor mapping");
            [v[0], v[1], v[2]]
        }
        None => {
            tracing::info!(?names, "SCRFD: output names not recognized, using positional mapping");
            [(0, 3), (1, 4), (2, 5)]
        }
    }
}

/// Decode detections for a single stride level.
fn decode_stride(
    scores: &[f32],
    bboxes: &[f32],
    stride: usize,
    letterbox: &LetterboxInfo,
    threshold: f32,
) -> Vec<Detection> {
    let grid = SCRFD_INPUT_SIZE / stride;
    let num_anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;
    let s = stride as f32;

    let mut detections = Vec::new();
    for idx in 0..num_anchors {
        let score = scores.get(idx).copied().unwrap_or(0.0);
        if score <= threshold {
            continue;
        }
        let off = idx * 4;
        if off + 3 >= bboxes.len() {
            continue;
        }

        let anchor = idx / SCRFD_ANCHORS_PER_CELL;
        let ax = (anchor % grid) as f32 * s;
        let ay = (anchor / grid) as f32 * s;

        let x1 = (ax - bboxes[off] * s - letterbox.pad_x) / letterbox.scale;
        let y1 = (ay - bboxes[off + 1] * s - letterbox.pad_y) / letterbox.scale;
        let x2 = (ax + bboxes[off + 2] * s - letterbox.pad_x) / letterbox.scale;
        let y2 = (ay + bboxes[off + 3] * s - letterbox.pad_y) / letterbox.scale;

        detections.push(Detection {
            x: x1,
            y: y1,
            width: x2 - x1,
            height: y2 - y1,
            score,
        });
    }
    detections
}

/// Non-maximum suppression; output is sorted by score, best first.
fn nms(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    detections.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

    let mut keep: Vec<Detection> = Vec::new();
    for det in detections {
        if keep.iter().all(|k| iou(k, &det) <= iou_threshold) {
            keep.push(det);
        }
    }
    keep
}

fn iou(a: &Detection, b: &Detection) -> f32 {
    let x1 = a.x.max(b.x);
    let y1 = a.y.max(b.y);
    let x2 = (a.x + a.width).min(b.x + b.width);
    let y2 = (a.y + a.height).min(b.y + b.height);

    let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let union = a.width * a.height + b.width * b.height - inter;
    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}
