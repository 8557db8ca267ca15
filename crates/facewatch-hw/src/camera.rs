//! V4L2 camera access via the `v4l` crate.

use crate::frame::{FrameError, PixelFormat};
use image::RgbImage;
use std::io;
use std::path::Path;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::mmap::Stream as MmapStream;
use v4l::io::traits::CaptureStream as _;
use v4l::video::Capture;
use v4l::{Device, FourCC};

const EBUSY: i32 = 16;
const STREAM_BUFFERS: u32 = 4;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("permission denied opening {0}")]
    PermissionDenied(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error(transparent)]
    Frame(#[from] FrameError),
}

impl CameraError {
    fn from_io(context: &str, e: io::Error) -> Self {
        if e.raw_os_error() == Some(EBUSY) {
            return CameraError::DeviceBusy;
        }
        match e.kind() {
            io::ErrorKind::PermissionDenied => CameraError::PermissionDenied(context.to_string()),
            io::ErrorKind::NotFound => CameraError::DeviceNotFound(context.to_string()),
            _ => CameraError::CaptureFailed(format!("{context}: {e}")),
        }
    }

    /// Format ioctls fail with EBUSY while another session still streams.
    fn from_negotiation(context: &str, e: io::Error) -> Self {
        if e.raw_os_error() == Some(EBUSY) {
            return CameraError::DeviceBusy;
        }
        CameraError::FormatNegotiationFailed(format!("{context}: {e}"))
    }
}

/// A discovered V4L2 capture device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// An opened camera with a negotiated format.
pub struct Camera {
    device: Device,
    pub path: String,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

impl Camera {
    /// Open `path` and negotiate a frame size close to `width`×`height`.
    ///
    /// YUYV is requested first; drivers answering with MJPEG or GREY are accepted.
    pub fn open(path: &str, width: u32, height: u32) -> Result<Self, CameraError> {
        if !Path::new(path).exists() {
            return Err(CameraError::DeviceNotFound(path.to_string()));
        }
        let device = Device::with_path(path).map_err(|e| CameraError::from_io(path, e))?;

        let caps = device
            .query_caps()
            .map_err(|e| CameraError::CaptureFailed(format!("query capabilities: {e}")))?;
        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CameraError::CaptureFailed(format!("{path} is not a capture device")));
        }

        let mut fmt = device
            .format()
            .map_err(|e| CameraError::from_negotiation("get format", e))?;
        fmt.fourcc = FourCC::new(&PixelFormat::Yuyv.fourcc());
        fmt.width = width;
        fmt.height = height;
        let negotiated = device
            .set_format(&fmt)
            .map_err(|e| CameraError::from_negotiation("set format", e))?;

        let format = PixelFormat::from_fourcc(&negotiated.fourcc.repr).ok_or_else(|| {
            CameraError::FormatNegotiationFailed(format!(
                "unsupported pixel format {} (need YUYV, MJPG or GREY)",
                negotiated.fourcc
            ))
        })?;

        tracing::info!(
            device = path,
            card = %caps.card,
            width = negotiated.width,
            height = negotiated.height,
            format = ?format,
            "opened camera"
        );

        Ok(Self {
            device,
            path: path.to_string(),
            width: negotiated.width,
            height: negotiated.height,
            format,
        })
    }

    /// Start memory-mapped streaming.
    pub fn stream(&self) -> Result<FrameStream<'_>, CameraError> {
        let inner = MmapStream::with_buffers(&self.device, BufType::VideoCapture, STREAM_BUFFERS)
            .map_err(|e| CameraError::from_io(&self.path, e))?;
        Ok(FrameStream { camera: self, inner })
    }

    /// Enumerate `/dev/video*` nodes that support video capture.
    pub fn list_devices() -> Vec<DeviceInfo> {
        let mut devices = Vec::new();
        for i in 0..16 {
            let path = format!("/dev/video{i}");
            if !Path::new(&path).exists() {
                continue;
            }
            let Ok(dev) = Device::with_path(&path) else {
                continue;
            };
            let Ok(caps) = dev.query_caps() else {
                continue;
            };
            if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
                continue;
            }
            devices.push(DeviceInfo {
                path,
                name: caps.card.clone(),
                driver: caps.driver.clone(),
                bus: caps.bus.clone(),
            });
        }
        devices
    }
}

/// Active capture stream yielding RGB frames.
pub struct FrameStream<'a> {
    camera: &'a Camera,
    inner: MmapStream<'a>,
}

impl FrameStream<'_> {
    /// Block for the next buffer and convert it. Returns the driver sequence number.
    pub fn next_frame(&mut self) -> Result<(RgbImage, u32), CameraError> {
        let (buf, meta) = self
            .inner
            .next()
            .map_err(|e| CameraError::CaptureFailed(format!("dequeue buffer: {e}")))?;
        let used = (meta.bytesused as usize).min(buf.len());
        let payload = if used > 0 { &buf[..used] } else { buf };
        let image = self
            .camera
            .format
            .to_rgb(payload, self.camera.width, self.camera.height)?;
        Ok((image, meta.sequence))
    }
}
