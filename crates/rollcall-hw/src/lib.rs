//! rollcall-hw — Hardware abstraction for camera capture.
//!
//! Provides V4L2-based camera access and the process-wide camera service
//! that owns the capture handle and the last captured frame.

pub mod camera;
pub mod frame;
pub mod service;

pub use camera::{CameraError, FrameSource, PixelFormat, V4lCamera};
pub use frame::Frame;
pub use service::{CameraService, CameraState};
