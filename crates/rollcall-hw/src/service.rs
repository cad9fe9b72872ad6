//! Process-wide camera service.
//!
//! Owns the single capture handle and the last captured frame. Opening is
//! idempotent and concurrent openers wait for the one in flight; releasing
//! is safe at any time and takes effect before the next read.

use crate::camera::{CameraError, FrameSource, V4lCamera};
use crate::frame::Frame;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock};

type Opener = Box<dyn Fn() -> Result<Box<dyn FrameSource>, CameraError> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CameraState {
    Closed,
    Opening,
    Open,
}

enum Slot {
    Closed,
    Opening,
    Open(Box<dyn FrameSource>),
}

impl Slot {
    fn state(&self) -> CameraState {
        match self {
            Slot::Closed => CameraState::Closed,
            Slot::Opening => CameraState::Opening,
            Slot::Open(_) => CameraState::Open,
        }
    }
}

pub struct CameraService {
    opener: Opener,
    slot: Mutex<Slot>,
    opened: Condvar,
    last_frame: RwLock<Option<Arc<Frame>>>,
}

impl CameraService {
    pub fn new<F>(opener: F) -> Self
    where
        F: Fn() -> Result<Box<dyn FrameSource>, CameraError> + Send + Sync + 'static,
    {
        Self {
            opener: Box::new(opener),
            slot: Mutex::new(Slot::Closed),
            opened: Condvar::new(),
            last_frame: RwLock::new(None),
        }
    }

    /// A service backed by a V4L2 device.
    pub fn v4l(device: impl Into<String>, width: u32, height: u32) -> Self {
        let device = device.into();
        Self::new(move || {
            let camera = V4lCamera::open(&device, width, height)?;
            Ok(Box::new(camera) as Box<dyn FrameSource>)
        })
    }

    pub fn state(&self) -> CameraState {
        self.lock().state()
    }

    pub fn is_open(&self) -> bool {
        self.state() == CameraState::Open
    }

    /// Open the camera unless it is already open.
    pub fn open(&self) -> Result<(), CameraError> {
        let mut slot = self.lock();
        loop {
            match *slot {
                Slot::Open(_) => return Ok(()),
                Slot::Opening => {
                    slot = self.opened.wait(slot).unwrap_or_else(PoisonError::into_inner);
                }
                Slot::Closed => break,
            }
        }
        *slot = Slot::Opening;
        drop(slot);

        let result = (self.opener)();

        let mut slot = self.lock();
        let outcome = match result {
            Ok(source) if matches!(*slot, Slot::Opening) => {
                *slot = Slot::Open(source);
                tracing::info!("camera opened");
                Ok(())
            }
            // Released while opening; the new handle is dropped here.
            Ok(_) => Err(CameraError::NotOpen),
            Err(e) => {
                if matches!(*slot, Slot::Opening) {
                    *slot = Slot::Closed;
                }
                tracing::warn!(error = %e, "camera open failed");
                Err(e)
            }
        };
        self.opened.notify_all();
        outcome
    }

    /// Release the capture handle. Idempotent.
    pub fn release(&self) {
        let mut slot = self.lock();
        if !matches!(*slot, Slot::Closed) {
            *slot = Slot::Closed;
            tracing::info!("camera released");
        }
        self.opened.notify_all();
    }

    /// Capture one frame and publish it as the last frame. A read failure
    /// releases the handle so the next open starts fresh.
    pub fn read(&self) -> Result<Arc<Frame>, CameraError> {
        let mut slot = self.lock();
        let Slot::Open(source) = &mut *slot else {
            return Err(CameraError::NotOpen);
        };
        match source.read() {
            Ok(frame) => {
                drop(slot);
                let frame = Arc::new(frame);
                *self.last_frame.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&frame));
                Ok(frame)
            }
            Err(e) => {
                *slot = Slot::Closed;
                tracing::warn!(error = %e, "camera read failed; handle released");
                Err(e)
            }
        }
    }

    /// The most recently captured frame, if any.
    pub fn last_frame(&self) -> Option<Arc<Frame>> {
        self.last_frame
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
