//! [`CaptureSource`] backed by a V4L2 camera.
//!
//! Each capture session runs on its own OS thread that keeps only the most
//! recent frame. The pipeline samples that frame at its own pace, so a slow
//! tick never queues stale frames. A new session first waits for the
//! previous thread to close the device.

use crate::camera::{Camera, CameraError};
use async_trait::async_trait;
use facewatch_core::capture::{CaptureError, CaptureSource, CaptureStream};
use facewatch_core::types::{DisplayGeometry, Frame};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::{oneshot, watch};

/// Consecutive dequeue failures after which the session gives up.
const MAX_CONSECUTIVE_ERRORS: u32 = 10;

/// How long a new session waits for the previous thread to let go of the device.
const RETIRE_TIMEOUT: Duration = Duration::from_secs(2);

impl From<CameraError> for CaptureError {
    fn from(e: CameraError) -> Self {
        match e {
            CameraError::DeviceNotFound(path) => CaptureError::NoDevice(path),
            CameraError::PermissionDenied(path) => CaptureError::PermissionDenied(path),
            CameraError::DeviceBusy => CaptureError::DeviceBusy,
            other => CaptureError::Failed(other.to_string()),
        }
    }
}

/// The OS thread behind one capture session.
struct CaptureThread {
    handle: JoinHandle<()>,
    stop: Arc<AtomicBool>,
}

impl CaptureThread {
    /// Signal the thread and wait until it has closed the device.
    async fn retire(self, limit: Duration) -> Result<(), CaptureError> {
        self.stop.store(true, Ordering::Release);
        let handle = self.handle;
        let join = tokio::task::spawn_blocking(move || handle.join());
        match tokio::time::timeout(limit, join).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(_))) => {
                tracing::warn!("previous capture thread panicked");
                Ok(())
            }
            Ok(Err(e)) => Err(CaptureError::Failed(format!("join capture thread: {e}"))),
            Err(_) => {
                tracing::warn!(limit_ms = limit.as_millis() as u64, "previous capture thread still holds the device");
                Err(CaptureError::DeviceBusy)
            }
        }
    }
}

pub struct V4lCapture {
    device_path: String,
    session: Mutex<Option<CaptureThread>>,
}

impl V4lCapture {
    pub fn new(device_path: impl Into<String>) -> Self {
        Self {
            device_path: device_path.into(),
            session: Mutex::new(None),
        }
    }

    fn take_session(&self) -> Option<CaptureThread> {
        match self.session.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }
}

#[async_trait]
impl CaptureSource for V4lCapture {
    async fn request_capture(
        &self,
        size: DisplayGeometry,
    ) -> Result<Arc<dyn CaptureStream>, CaptureError> {
        if let Some(previous) = self.take_session() {
            previous.retire(RETIRE_TIMEOUT).await?;
        }

        let (latest_tx, latest_rx) = watch::channel(None);
        let stop = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = oneshot::channel();

        let path = self.device_path.clone();
        let thread_stop = stop.clone();
        let handle = std::thread::Builder::new()
            .name("facewatch-capture".into())
            .spawn(move || capture_loop(&path, size, latest_tx, thread_stop, ready_tx))
            .map_err(|e| CaptureError::Failed(format!("spawn capture thread: {e}")))?;

        ready_rx
            .await
            .map_err(|_| CaptureError::Failed("capture thread exited during setup".into()))??;

        let thread = CaptureThread {
            handle,
            stop: stop.clone(),
        };
        match self.session.lock() {
            Ok(mut guard) => *guard = Some(thread),
            Err(poisoned) => *poisoned.into_inner() = Some(thread),
        }

        Ok(Arc::new(V4lStream {
            latest: latest_rx,
            stop,
        }))
    }
}

fn capture_loop(
    path: &str,
    size: DisplayGeometry,
    latest: watch::Sender<Option<Frame>>,
    stop: Arc<AtomicBool>,
    ready: oneshot::Sender<Result<(), CaptureError>>,
) {
    let camera = match Camera::open(path, size.width, size.height) {
        Ok(camera) => camera,
        Err(e) => {
            let _ = ready.send(Err(e.into()));
            return;
        }
    };
    let mut stream = match camera.stream() {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready.send(Err(e.into()));
            return;
        }
    };
    let _ = ready.send(Ok(()));

    let mut errors = 0u32;
    while !stop.load(Ordering::Acquire) {
        match stream.next_frame() {
            Ok((image, sequence)) => {
                errors = 0;
                latest.send_replace(Some(Frame::new(image, sequence)));
            }
            Err(e) => {
                errors += 1;
                tracing::warn!(error = %e, errors, "frame capture failed");
                if errors >= MAX_CONSECUTIVE_ERRORS {
                    tracing::error!(device = path, "too many capture errors; ending session");
                    break;
                }
            }
        }
    }

    latest.send_replace(None);
    tracing::info!(device = path, "capture session closed");
}

/// Handle to a running capture thread.
struct V4lStream {
    latest: watch::Receiver<Option<Frame>>,
    stop: Arc<AtomicBool>,
}

impl CaptureStream for V4lStream {
    fn snapshot(&self) -> Option<Frame> {
        if self.stop.load(Ordering::Acquire) {
            return None;
        }
        self.latest.borrow().clone()
    }

    fn release(&self) {
        if !self.stop.swap(true, Ordering::AcqRel) {
            tracing::debug!("capture released");
        }
    }
}

impl Drop for V4lStream {
    fn drop(&mut self) {
        self.release();
    }
}
