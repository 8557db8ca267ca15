//! Capture Source capability: live frames on request.

use crate::types::{DisplayGeometry, Frame};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

/// Reasons a capture stream could not be obtained.
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("no capture device: {0}")]
    NoDevice(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("capture failed: {0}")]
    Failed(String),
}

/// Open capture session. Dropping or releasing it frees the device.
pub trait CaptureStream: Send + Sync {
    /// Latest frame, or `None` if no frame is available yet (or anymore).
    fn snapshot(&self) -> Option<Frame>;

    /// Stop capturing. Idempotent.
    fn release(&self);
}

/// Factory for capture sessions.
#[async_trait]
pub trait CaptureSource: Send + Sync {
    /// Open the device, requesting frames of roughly `size`.
    async fn request_capture(
        &self,
        size: DisplayGeometry,
    ) -> Result<Arc<dyn CaptureStream>, CaptureError>;
}
