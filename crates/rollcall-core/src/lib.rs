//! rollcall-core — Face recognition and attendance matching engine.
//!
//! Turns a directory of per-person photographs into an LBPH classifier,
//! recognizes faces in camera frames, and converts recognitions into
//! session-scoped attendance records.

pub mod attendance;
pub mod classifier;
pub mod config;
pub mod cooldown;
pub mod detector;
pub mod enroll;
pub mod gallery;
pub mod lbph;
pub mod model_store;
pub mod pipeline;
pub mod preprocess;
pub mod service;
pub mod types;

pub use attendance::{AttendanceMatcher, MarkOutcome, Notification, NotificationBoard};
pub use config::RecognitionConfig;
pub use pipeline::RecognitionPipeline;
pub use service::{ClassifierService, TrainOutcome};
pub use types::{FaceBox, FaceMatch, Identity, Recognition, SessionId};
