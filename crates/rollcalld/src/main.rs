use anyhow::{Context, Result};
use rollcall_core::attendance::{AttendanceStore, NotificationBoard, SessionRegistry, StudentDirectory};
use rollcall_core::detector::{Detector, DetectorConfig, ScrfdDetector};
use rollcall_core::enroll::Enroller;
use rollcall_core::model_store::ModelStore;
use rollcall_core::{AttendanceMatcher, ClassifierService, RecognitionPipeline};
use rollcall_hw::CameraService;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod label;
mod store;
mod stream;

use config::Config;
use dbus_interface::{AppState, AttendanceService, BUS_NAME, OBJECT_PATH};
use store::SqliteStore;
use stream::{FrameAnnotator, FrameSink, LatestFrame, StreamSettings};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "rollcalld starting");

    let config = Config::load()?;
    let state = Arc::new(build_state(&config)?);

    let _conn = zbus::connection::Builder::session()?
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, AttendanceService::new(Arc::clone(&state)))?
        .build()
        .await?;

    tracing::info!(bus = BUS_NAME, path = OBJECT_PATH, "rollcalld ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");

    if let Err(e) = state.stream.stop() {
        tracing::warn!(error = %e, "stream stop failed");
    }
    state.camera.release();
    Ok(())
}

fn build_state(config: &Config) -> Result<AppState> {
    let recognition = config.recognition.clone();

    let store = Arc::new(SqliteStore::open(&config.db_path)?);

    let classifier = Arc::new(ClassifierService::open(
        config.gallery_dir.clone(),
        ModelStore::new(config.model_dir.clone()),
        recognition.train_debounce(),
    ));
    tracing::info!(
        gallery = %config.gallery_dir.display(),
        trained = classifier.is_trained(),
        identities = classifier.identities().len(),
        "classifier ready"
    );

    let model_path = config
        .detector_model
        .to_str()
        .context("detector model path is not valid UTF-8")?;
    let backend = ScrfdDetector::load(model_path)
        .with_context(|| format!("failed to load detector model {model_path}"))?;
    let detector = Detector::new(
        backend,
        DetectorConfig {
            target_width: recognition.detect_width,
            min_face_size: recognition.min_face_size,
        },
    );
    let pipeline = Arc::new(RecognitionPipeline::new(classifier, detector));

    let matcher = Arc::new(AttendanceMatcher::new(
        Arc::clone(&store) as Arc<dyn StudentDirectory>,
        Arc::clone(&store) as Arc<dyn AttendanceStore>,
        Arc::clone(&store) as Arc<dyn SessionRegistry>,
        Arc::new(NotificationBoard::new()),
        &recognition,
    ));
    let enroller = Enroller::new(Arc::clone(&pipeline), &recognition);

    let camera = Arc::new(CameraService::v4l(
        config.camera_device.clone(),
        config.camera_width,
        config.camera_height,
    ));
    let latest = Arc::new(LatestFrame::default());
    let annotator = FrameAnnotator::new(
        Arc::clone(&pipeline),
        Arc::clone(&matcher),
        StreamSettings {
            fps: config.fps,
            detect_interval: config.detect_interval,
            attendance_threshold: recognition.attendance_threshold,
            preview_threshold: recognition.preview_threshold,
            jpeg_quality: config.jpeg_quality,
        },
    );
    let stream = stream::spawn_coordinator(
        Arc::clone(&camera),
        annotator,
        Arc::clone(&latest) as Arc<dyn FrameSink>,
    )
    .context("failed to spawn stream coordinator")?;

    Ok(AppState {
        recognition,
        pipeline,
        enroller,
        matcher,
        store,
        camera,
        stream,
        latest,
    })
}
