use crate::store::SqliteStore;
use crate::stream::{LatestFrame, StreamHandle, StreamStatus};
use rollcall_core::detector::ScrfdDetector;
use rollcall_core::enroll::{CaptureOutcome, Enroller};
use rollcall_core::lbph::LbphModel;
use rollcall_core::{AttendanceMatcher, Identity, RecognitionConfig, RecognitionPipeline, SessionId, TrainOutcome};
use rollcall_hw::{CameraError, CameraService, Frame};
use serde_json::json;
use std::sync::Arc;
use zbus::interface;

pub const BUS_NAME: &str = "org.rollcall.Attendance1";
pub const OBJECT_PATH: &str = "/org/rollcall/Attendance1";

/// Everything the D-Bus handlers operate on.
pub struct AppState {
    pub recognition: RecognitionConfig,
    pub pipeline: Arc<RecognitionPipeline>,
    pub enroller: Enroller<LbphModel, ScrfdDetector>,
    pub matcher: Arc<AttendanceMatcher>,
    pub store: Arc<SqliteStore>,
    pub camera: Arc<CameraService>,
    pub stream: StreamHandle,
    pub latest: Arc<LatestFrame>,
}

/// D-Bus interface for the attendance daemon.
///
/// Bus name: org.rollcall.Attendance1
/// Object path: /org/rollcall/Attendance1
pub struct AttendanceService {
    state: Arc<AppState>,
}

impl AttendanceService {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    /// Run `f` on the blocking pool; recognition and SQLite calls never run
    /// on the executor.
    async fn blocking<T, F>(&self, f: F) -> zbus::fdo::Result<T>
    where
        F: FnOnce(&AppState) -> zbus::fdo::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let state = Arc::clone(&self.state);
        tokio::task::spawn_blocking(move || f(&state))
            .await
            .map_err(failed)?
    }
}

#[interface(name = "org.rollcall.Attendance1")]
impl AttendanceService {
    /// Rebuild the classifier from the gallery. Returns a JSON summary.
    async fn train(&self, force: bool) -> zbus::fdo::Result<String> {
        tracing::info!(force, "train requested");
        let outcome = self
            .blocking(move |s| s.pipeline.classifier().train(force).map_err(failed))
            .await?;
        if outcome == TrainOutcome::EmptyGallery {
            return Err(zbus::fdo::Error::Failed("no usable samples in gallery".into()));
        }
        Ok(train_json(&outcome).to_string())
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let s = &self.state;
        let (streaming, session) = match s.stream.status() {
            StreamStatus::Idle => (false, None),
            StreamStatus::Streaming { session } => (true, session.map(|id| id.0)),
        };
        let classifier = s.pipeline.classifier();
        Ok(json!({
            "version": env!("CARGO_PKG_VERSION"),
            "camera": format!("{:?}", s.camera.state()).to_lowercase(),
            "streaming": streaming,
            "session": session,
            "trained": classifier.is_trained(),
            "identities": classifier.identities().len(),
            "gallery": classifier.gallery_root().display().to_string(),
        })
        .to_string())
    }

    /// Open (or reactivate) the session registered under `token`. Returns its id.
    async fn open_session(&self, token: String) -> zbus::fdo::Result<i64> {
        tracing::info!(token = %token, "open_session requested");
        let session = self
            .blocking(move |s| s.store.open_session(&token).map_err(failed))
            .await?;
        Ok(session.0)
    }

    async fn close_session(&self, token: String) -> zbus::fdo::Result<bool> {
        tracing::info!(token = %token, "close_session requested");
        self.blocking(move |s| {
            let Some(session) = s.store.active_session(&token).map_err(failed)? else {
                return Ok(false);
            };
            s.store.close_session(session).map_err(failed)
        })
        .await
    }

    /// Start streaming. An empty token streams in preview mode without marking.
    async fn start_stream(&self, session: String) -> zbus::fdo::Result<()> {
        tracing::info!(session = %session, "start_stream requested");
        let bound = if session.is_empty() {
            None
        } else {
            let token = session.clone();
            Some(
                self.blocking(move |s| active_session(&s.store, &token))
                    .await?,
            )
        };
        self.state.stream.start(bound).map_err(failed)
    }

    /// Stop streaming and release the camera.
    async fn stop_camera(&self) -> zbus::fdo::Result<()> {
        tracing::info!("stop_camera requested");
        self.state.stream.stop().map_err(failed)
    }

    /// The newest annotated JPEG frame, or an empty array before the first one.
    async fn latest_frame(&self) -> zbus::fdo::Result<Vec<u8>> {
        Ok(self
            .state
            .latest
            .get()
            .map(|frame| frame.jpeg.clone())
            .unwrap_or_default())
    }

    /// Take the pending recognition notification as JSON (`null` when none).
    async fn last_recognition(&self) -> zbus::fdo::Result<String> {
        serde_json::to_string(&self.state.matcher.board().take()).map_err(failed)
    }

    /// Recognize a JPEG submitted by a client and mark attendance for
    /// every identified face. Returns the frame report as JSON.
    async fn process_frame(&self, session: String, jpeg: Vec<u8>) -> zbus::fdo::Result<String> {
        tracing::debug!(session = %session, bytes = jpeg.len(), "process_frame requested");
        self.blocking(move |s| {
            let session = active_session(&s.store, &session)?;
            let matches = s
                .pipeline
                .recognize_bytes(&jpeg, s.recognition.frame_threshold)
                .map_err(failed)?;
            let report = s.matcher.mark_matches(matches, session).map_err(failed)?;
            serde_json::to_string(&report).map_err(failed)
        })
        .await
    }

    /// Capture one enrollment sample for `identity` from the camera.
    async fn enroll(&self, identity: String, name: String) -> zbus::fdo::Result<String> {
        tracing::info!(identity = %identity, "enroll requested");
        let identity = identity.trim().to_string();
        if identity.is_empty() {
            return Err(zbus::fdo::Error::InvalidArgs("identity must not be empty".into()));
        }
        self.blocking(move |s| {
            let frame = enrollment_frame(&s.camera).map_err(failed)?;
            let gray = frame.to_image().map_err(failed)?;
            let outcome = s.enroller.capture(&identity, &gray).map_err(failed)?;
            if matches!(outcome, CaptureOutcome::Saved { .. }) {
                let display = if name.trim().is_empty() { identity.as_str() } else { name.trim() };
                s.store
                    .upsert_student(&Identity::new(identity.as_str()), display)
                    .map_err(failed)?;
            }
            Ok(capture_json(&outcome).to_string())
        })
        .await
    }

    /// Delete an identity's samples and directory entry, then retrain.
    async fn remove_identity(&self, identity: String) -> zbus::fdo::Result<String> {
        tracing::info!(identity = %identity, "remove_identity requested");
        self.blocking(move |s| {
            let outcome = s.enroller.remove_identity(&identity).map_err(failed)?;
            let removed = s.store.remove_student(&identity).map_err(failed)?;
            s.matcher.forget(&identity);
            Ok(json!({
                "student_removed": removed,
                "training": train_json(&outcome),
            })
            .to_string())
        })
        .await
    }

    /// Attendance recorded for the session registered under `token`.
    async fn attendance(&self, token: String) -> zbus::fdo::Result<String> {
        self.blocking(move |s| {
            let Some(session) = s.store.active_session(&token).map_err(failed)? else {
                return Err(zbus::fdo::Error::InvalidArgs(format!("no active session {token:?}")));
            };
            let records = s.store.attendance(session).map_err(failed)?;
            serde_json::to_string(&records).map_err(failed)
        })
        .await
    }

    /// Stop streaming, then delete every sample, student and attendance record.
    async fn reset(&self) -> zbus::fdo::Result<String> {
        tracing::warn!("reset requested");
        if let Err(e) = self.state.stream.stop() {
            tracing::warn!(error = %e, "stream stop failed during reset");
        }
        self.blocking(|s| {
            let samples = s.enroller.reset().map_err(failed)?;
            s.store.reset().map_err(failed)?;
            s.matcher.clear();
            Ok(json!({ "samples_removed": samples }).to_string())
        })
        .await
    }
}

fn failed(e: impl std::fmt::Display) -> zbus::fdo::Error {
    zbus::fdo::Error::Failed(e.to_string())
}

fn active_session(store: &SqliteStore, token: &str) -> zbus::fdo::Result<SessionId> {
    store
        .active_session(token)
        .map_err(failed)?
        .ok_or_else(|| zbus::fdo::Error::InvalidArgs(format!("no active session {token:?}")))
}

/// The stream's last frame while it runs, otherwise a one-shot capture.
fn enrollment_frame(camera: &CameraService) -> Result<Arc<Frame>, CameraError> {
    if camera.is_open() {
        if let Some(frame) = camera.last_frame() {
            return Ok(frame);
        }
    }
    camera.open()?;
    let frame = camera.read();
    camera.release();
    frame
}

fn train_json(outcome: &TrainOutcome) -> serde_json::Value {
    match outcome {
        TrainOutcome::Trained {
            identities,
            samples,
            skipped,
            persisted,
        } => json!({
            "status": "trained",
            "identities": identities,
            "samples": samples,
            "skipped": skipped,
            "persisted": persisted,
        }),
        TrainOutcome::Debounced => json!({ "status": "debounced" }),
        TrainOutcome::EmptyGallery => json!({ "status": "empty_gallery" }),
    }
}

fn capture_json(outcome: &CaptureOutcome) -> serde_json::Value {
    match outcome {
        CaptureOutcome::NoFace => json!({ "status": "no_face" }),
        CaptureOutcome::Duplicate { identity, confidence } => json!({
            "status": "duplicate",
            "identity": identity,
            "confidence": confidence,
        }),
        CaptureOutcome::MultipleFaces { count } => json!({
            "status": "multiple_faces",
            "count": count,
        }),
        CaptureOutcome::Saved { path, count, bbox } => json!({
            "status": "saved",
            "path": path.display().to_string(),
            "count": count,
            "bbox": bbox,
        }),
    }
}
