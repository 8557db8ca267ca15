//! facewatch-hw: V4L2 camera capture for the facewatch engine.

pub mod camera;
pub mod capture;
pub mod frame;

pub use camera::{Camera, CameraError, DeviceInfo};
pub use capture::V4lCapture;
pub use frame::PixelFormat;
