//! Frame streaming coordinator.
//!
//! A dedicated OS thread pulls frames from the camera service at a bounded
//! rate, runs recognition on a duty cycle, marks attendance when a session
//! is bound, draws the overlay and hands JPEG frames to a sink. Control
//! requests arrive over a channel and also cut the frame-budget sleep short.

use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, GrayImage, Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut};
use imageproc::rect::Rect;
use rollcall_core::classifier::TrainableClassifier;
use rollcall_core::detector::FaceDetector;
use rollcall_core::pipeline::PipelineError;
use rollcall_core::{AttendanceMatcher, FaceMatch, RecognitionPipeline, SessionId};
use rollcall_hw::frame::FrameError;
use rollcall_hw::{CameraService, Frame};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::label;

const IDENTIFIED_COLOR: Rgb<u8> = Rgb([36, 255, 12]);
const UNKNOWN_COLOR: Rgb<u8> = Rgb([230, 40, 40]);
const LABEL_COLOR: Rgb<u8> = Rgb([0, 0, 0]);
const TAG_HEIGHT: u32 = label::GLYPH_HEIGHT + 2;

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("recognition error: {0}")]
    Pipeline(#[from] PipelineError),
    #[error("JPEG encode failed: {0}")]
    Encode(#[from] image::ImageError),
    #[error("coordinator thread exited")]
    ChannelClosed,
}

/// One processed frame, ready for transport.
#[derive(Debug, Clone)]
pub struct AnnotatedFrame {
    pub jpeg: Vec<u8>,
    pub matches: Vec<FaceMatch>,
    pub sequence: u32,
    pub session: Option<SessionId>,
}

/// Consumer of annotated frames.
pub trait FrameSink: Send + Sync {
    fn deliver(&self, frame: AnnotatedFrame);
}

/// Sink keeping only the newest frame, for pull-based clients.
#[derive(Default)]
pub struct LatestFrame {
    slot: RwLock<Option<Arc<AnnotatedFrame>>>,
}

impl LatestFrame {
    pub fn get(&self) -> Option<Arc<AnnotatedFrame>> {
        self.slot.read().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl FrameSink for LatestFrame {
    fn deliver(&self, frame: AnnotatedFrame) {
        *self.slot.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(frame));
    }
}

#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub fps: u32,
    /// Without a session, recognition runs on every Nth frame.
    pub detect_interval: u32,
    pub attendance_threshold: f64,
    pub preview_threshold: f64,
    pub jpeg_quality: u8,
}

impl StreamSettings {
    pub fn frame_budget(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.fps.max(1) as f64)
    }
}

/// Per-frame recognition, marking and rendering.
pub struct FrameAnnotator<C, B> {
    pipeline: Arc<RecognitionPipeline<C, B>>,
    matcher: Arc<AttendanceMatcher>,
    settings: StreamSettings,
    /// Matches from the most recent recognition pass, redrawn on skipped frames.
    last_matches: Vec<FaceMatch>,
    index: u64,
}

impl<C: TrainableClassifier, B: FaceDetector> FrameAnnotator<C, B> {
    pub fn new(pipeline: Arc<RecognitionPipeline<C, B>>, matcher: Arc<AttendanceMatcher>, settings: StreamSettings) -> Self {
        Self {
            pipeline,
            matcher,
            settings,
            last_matches: Vec::new(),
            index: 0,
        }
    }

    pub fn settings(&self) -> &StreamSettings {
        &self.settings
    }

    /// Forget the duty-cycle position and the cached matches.
    pub fn reset(&mut self) {
        self.index = 0;
        self.last_matches.clear();
    }

    pub fn annotate(&mut self, frame: &Frame, session: Option<SessionId>) -> Result<AnnotatedFrame, StreamError> {
        let gray = frame.to_image()?;
        let interval = u64::from(self.settings.detect_interval.max(1));
        let should_detect = session.is_some() || self.index % interval == 0;
        self.index += 1;

        if should_detect {
            let threshold = if session.is_some() {
                self.settings.attendance_threshold
            } else {
                self.settings.preview_threshold
            };
            self.last_matches = self.pipeline.detect_and_recognize(&gray, threshold)?;

            if let Some(session) = session {
                for identity in self.last_matches.iter().filter_map(|m| m.recognition.identity()) {
                    if let Err(e) = self.matcher.mark(identity, session) {
                        tracing::warn!(identity = %identity, error = %e, "attendance mark failed");
                    }
                }
            }
        }

        let rgb = overlay(&gray, &self.last_matches);
        let jpeg = encode_jpeg(&rgb, self.settings.jpeg_quality)?;
        Ok(AnnotatedFrame {
            jpeg,
            matches: self.last_matches.clone(),
            sequence: frame.sequence,
            session,
        })
    }
}

/// Draw a box and a colored tag strip carrying the recognition tag for
/// every match.
pub fn overlay(gray: &GrayImage, matches: &[FaceMatch]) -> RgbImage {
    let mut rgb = DynamicImage::ImageLuma8(gray.clone()).to_rgb8();
    for m in matches {
        let color = if m.recognition.is_unknown() {
            UNKNOWN_COLOR
        } else {
            IDENTIFIED_COLOR
        };
        let b = m.bbox;
        if b.width == 0 || b.height == 0 {
            continue;
        }
        draw_hollow_rect_mut(&mut rgb, Rect::at(b.x as i32, b.y as i32).of_size(b.width, b.height), color);
        if b.width > 2 && b.height > 2 {
            draw_hollow_rect_mut(
                &mut rgb,
                Rect::at(b.x as i32 + 1, b.y as i32 + 1).of_size(b.width - 2, b.height - 2),
                color,
            );
        }
        let tag_y = b.y.saturating_sub(TAG_HEIGHT + 2);
        draw_filled_rect_mut(&mut rgb, Rect::at(b.x as i32, tag_y as i32).of_size(b.width, TAG_HEIGHT), color);
        label::draw_label(
            &mut rgb,
            b.x + 1,
            tag_y + 1,
            b.width.saturating_sub(2),
            m.recognition.tag(),
            LABEL_COLOR,
        );
    }
    rgb
}

pub fn encode_jpeg(rgb: &RgbImage, quality: u8) -> Result<Vec<u8>, image::ImageError> {
    let mut jpeg = Vec::new();
    JpegEncoder::new_with_quality(&mut jpeg, quality.clamp(1, 100)).encode_image(rgb)?;
    Ok(jpeg)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStatus {
    Idle,
    Streaming { session: Option<SessionId> },
}

enum Command {
    Start(Option<SessionId>),
    Stop,
}

/// Clone-safe handle to the coordinator thread.
#[derive(Clone)]
pub struct StreamHandle {
    tx: mpsc::Sender<Command>,
    status: Arc<Mutex<StreamStatus>>,
}

impl StreamHandle {
    /// Start streaming, or rebind the running stream to `session`.
    pub fn start(&self, session: Option<SessionId>) -> Result<(), StreamError> {
        self.tx
            .send(Command::Start(session))
            .map_err(|_| StreamError::ChannelClosed)
    }

    /// Stop streaming and release the camera.
    pub fn stop(&self) -> Result<(), StreamError> {
        self.tx.send(Command::Stop).map_err(|_| StreamError::ChannelClosed)
    }

    pub fn status(&self) -> StreamStatus {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Spawn the coordinator on a dedicated OS thread. It idles until the first
/// start request and exits when every handle is dropped.
pub fn spawn_coordinator<C, B>(
    camera: Arc<CameraService>,
    annotator: FrameAnnotator<C, B>,
    sink: Arc<dyn FrameSink>,
) -> std::io::Result<StreamHandle>
where
    C: TrainableClassifier + 'static,
    B: FaceDetector + 'static,
{
    let (tx, rx) = mpsc::channel::<Command>();
    let status = Arc::new(Mutex::new(StreamStatus::Idle));
    let thread_status = Arc::clone(&status);

    std::thread::Builder::new()
        .name("rollcall-stream".into())
        .spawn(move || {
            let mut coordinator = Coordinator {
                camera,
                annotator,
                sink,
                status: thread_status,
                bound: None,
            };
            coordinator.run(rx);
        })?;

    Ok(StreamHandle { tx, status })
}

struct Coordinator<C, B> {
    camera: Arc<CameraService>,
    annotator: FrameAnnotator<C, B>,
    sink: Arc<dyn FrameSink>,
    status: Arc<Mutex<StreamStatus>>,
    /// `Some` while streaming; the inner value is the bound session.
    bound: Option<Option<SessionId>>,
}

impl<C: TrainableClassifier, B: FaceDetector> Coordinator<C, B> {
    fn run(&mut self, rx: mpsc::Receiver<Command>) {
        tracing::info!("stream coordinator started");
        let budget = self.annotator.settings().frame_budget();

        loop {
            let Some(session) = self.bound else {
                match rx.recv() {
                    Ok(cmd) => {
                        self.apply(cmd);
                        continue;
                    }
                    Err(_) => break,
                }
            };

            let started = Instant::now();
            self.step(session);

            if self.bound.is_none() {
                continue;
            }
            let remaining = budget.saturating_sub(started.elapsed());
            match rx.recv_timeout(remaining) {
                Ok(cmd) => self.apply(cmd),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        self.camera.release();
        tracing::info!("stream coordinator exiting");
    }

    fn step(&mut self, session: Option<SessionId>) {
        let frame = match self.camera.read() {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(error = %e, "camera read failed; stream ended");
                self.go_idle();
                return;
            }
        };
        match self.annotator.annotate(&frame, session) {
            Ok(annotated) => self.sink.deliver(annotated),
            Err(e) => tracing::warn!(seq = frame.sequence, error = %e, "frame dropped"),
        }
    }

    fn apply(&mut self, cmd: Command) {
        match cmd {
            Command::Start(session) => {
                if let Err(e) = self.camera.open() {
                    tracing::error!(error = %e, "cannot start stream");
                    self.go_idle();
                    return;
                }
                if self.bound != Some(session) {
                    self.annotator.reset();
                }
                tracing::info!(session = ?session.map(|s| s.0), "streaming");
                self.bound = Some(session);
                self.set_status(StreamStatus::Streaming { session });
            }
            Command::Stop => {
                self.camera.release();
                self.go_idle();
            }
        }
    }

    fn go_idle(&mut self) {
        self.bound = None;
        self.annotator.reset();
        self.set_status(StreamStatus::Idle);
    }

    fn set_status(&self, status: StreamStatus) {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner) = status;
    }
}
