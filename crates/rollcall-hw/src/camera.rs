//! V4L2 capture for the classroom camera.

use crate::frame::{self, Frame, FrameError};
use std::io;
use std::path::Path;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

/// Kernel errno for a device held by another process.
const EBUSY: i32 = 16;
const STREAM_BUFFERS: u32 = 4;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("camera device not found: {0}")]
    DeviceNotFound(String),
    #[error("frame capture failed: {0}")]
    CaptureFailed(String),
    #[error("camera is in use by another process")]
    DeviceBusy,
    #[error("no usable pixel format: {0}")]
    FormatNegotiationFailed(String),
    #[error("device cannot stream video")]
    StreamingNotSupported,
    #[error("camera is not open")]
    NotOpen,
    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// A pull-based source of grayscale frames.
pub trait FrameSource: Send {
    fn read(&mut self) -> Result<Frame, CameraError>;
}

/// Pixel formats the capture path can turn into luma.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// Packed YUYV 4:2:2; luma is every other byte.
    Yuyv,
    /// Motion JPEG, decoded per frame.
    Mjpeg,
    Grey,
    /// 16-bit little-endian luma.
    Y16,
}

impl PixelFormat {
    /// Formats requested from the driver, most preferred first.
    const PREFERRED: [&'static [u8; 4]; 2] = [b"YUYV", b"MJPG"];

    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        match &fourcc.repr {
            b"YUYV" => Some(Self::Yuyv),
            b"MJPG" => Some(Self::Mjpeg),
            b"GREY" => Some(Self::Grey),
            b"Y16 " | b"Y16\0" => Some(Self::Y16),
            _ => None,
        }
    }
}

/// An open V4L2 device with a running mmap stream.
pub struct V4lCamera {
    stream: MmapStream<'static>,
    pub device_path: String,
    pub width: u32,
    pub height: u32,
    pixel_format: PixelFormat,
}

impl V4lCamera {
    /// Open `device_path` and start streaming at (or near) `width × height`.
    pub fn open(device_path: &str, width: u32, height: u32) -> Result<Self, CameraError> {
        if !Path::new(device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path.to_string()));
        }
        let device = Device::with_path(device_path).map_err(|e| open_error(device_path, e))?;

        let caps = device
            .query_caps()
            .map_err(|e| CameraError::CaptureFailed(format!("query capabilities: {e}")))?;
        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CameraError::StreamingNotSupported);
        }

        let (pixel_format, width, height) = negotiate(&device, width, height)?;
        tracing::info!(
            device = device_path,
            card = %caps.card,
            width,
            height,
            format = ?pixel_format,
            "camera streaming"
        );

        let stream = MmapStream::with_buffers(&device, BufType::VideoCapture, STREAM_BUFFERS)
            .map_err(|e| CameraError::CaptureFailed(format!("start mmap stream: {e}")))?;

        Ok(Self {
            stream,
            device_path: device_path.to_string(),
            width,
            height,
            pixel_format,
        })
    }

    pub fn pixel_format(&self) -> PixelFormat {
        self.pixel_format
    }

    /// Dequeue the next buffer and convert it to luma.
    pub fn capture_frame(&mut self) -> Result<Frame, CameraError> {
        let (buf, meta) = self
            .stream
            .next()
            .map_err(|e| CameraError::CaptureFailed(format!("dequeue buffer: {e}")))?;
        let sequence = meta.sequence;
        let (gray, width, height) = to_luma(self.pixel_format, buf, self.width, self.height)?;
        Ok(Frame::from_gray(gray, width, height, sequence)?)
    }
}

impl FrameSource for V4lCamera {
    fn read(&mut self) -> Result<Frame, CameraError> {
        self.capture_frame()
    }
}

fn open_error(path: &str, e: io::Error) -> CameraError {
    match e.raw_os_error() {
        Some(EBUSY) => CameraError::DeviceBusy,
        _ => CameraError::DeviceNotFound(format!("{path}: {e}")),
    }
}

/// Ask for each preferred format in turn and accept the first the driver
/// honors; otherwise fall back to whatever it settled on, if convertible.
fn negotiate(device: &Device, width: u32, height: u32) -> Result<(PixelFormat, u32, u32), CameraError> {
    let mut settled = None;
    for fourcc in PixelFormat::PREFERRED {
        let mut fmt = device
            .format()
            .map_err(|e| CameraError::FormatNegotiationFailed(format!("read format: {e}")))?;
        fmt.fourcc = FourCC::new(fourcc);
        fmt.width = width;
        fmt.height = height;
        let applied = device
            .set_format(&fmt)
            .map_err(|e| CameraError::FormatNegotiationFailed(format!("set format: {e}")))?;
        if applied.fourcc == fmt.fourcc {
            settled = Some(applied);
            break;
        }
        settled.get_or_insert(applied);
    }

    let applied =
        settled.ok_or_else(|| CameraError::FormatNegotiationFailed("driver returned no format".into()))?;
    let format = PixelFormat::from_fourcc(applied.fourcc).ok_or_else(|| {
        CameraError::FormatNegotiationFailed(format!("{:?} is not supported", applied.fourcc))
    })?;
    Ok((format, applied.width, applied.height))
}

fn to_luma(format: PixelFormat, buf: &[u8], width: u32, height: u32) -> Result<(Vec<u8>, u32, u32), CameraError> {
    let gray = match format {
        PixelFormat::Mjpeg => return Ok(frame::mjpeg_to_grayscale(buf)?),
        PixelFormat::Yuyv => frame::yuyv_to_grayscale(buf, width, height)?,
        PixelFormat::Y16 => frame::y16_to_grayscale(buf, width, height)?,
        PixelFormat::Grey => {
            let pixels = (width * height) as usize;
            let luma = buf.get(..pixels).ok_or_else(|| {
                CameraError::CaptureFailed(format!("short GREY buffer: {} of {pixels} bytes", buf.len()))
            })?;
            luma.to_vec()
        }
    };
    Ok((gray, width, height))
}
