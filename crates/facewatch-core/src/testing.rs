//! In-process fakes for the external capabilities, shared by unit tests.

use crate::capture::{CaptureError, CaptureSource, CaptureStream};
use crate::enrollment::{ImageStore, ImageStoreError};
use crate::overlay::{Annotation, Overlay};
use crate::provider::{DetectorProfile, ModelError, ModelProvider};
use crate::types::{AuxAttributes, BoundingBox, Descriptor, DisplayGeometry, FaceDetection, Frame};
use async_trait::async_trait;
use image::{Rgb, RgbImage};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;

pub fn face(x: f32, y: f32, descriptor: &[f32]) -> FaceDetection {
    FaceDetection {
        bbox: BoundingBox { x, y, width: 80.0, height: 80.0, confidence: 0.9 },
        landmarks: vec![(x + 20.0, y + 30.0), (x + 60.0, y + 30.0)],
        descriptor: Descriptor::new(descriptor.to_vec()),
        attributes: AuxAttributes { confidence: 0.9 },
    }
}

/// Model provider returning canned detections.
///
/// Enrollment images carry their descriptor in the red channel of pixel
/// (0, 0): value `v` yields descriptor `[v / 10]`, `0` means no face.
#[derive(Default)]
pub struct FakeModels {
    pub detections: Vec<FaceDetection>,
    /// When set, each `detect` call consumes one permit before returning.
    pub detect_gate: Option<Arc<Semaphore>>,
    /// When set, `load_models` consumes one permit before returning.
    pub load_gate: Option<Arc<Semaphore>>,
    pub fail_load: bool,
    /// Number of upcoming `detect` calls that fail.
    pub failures: AtomicUsize,
    pub detect_calls: AtomicUsize,
    /// Simulated inference latency.
    pub detect_delay: Option<Duration>,
    pub detect_starts: Mutex<Vec<Instant>>,
    pub in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
}

impl FakeModels {
    pub fn with_detections(detections: Vec<FaceDetection>) -> Self {
        Self {
            detections,
            ..Self::default()
        }
    }
}

#[async_trait]
impl ModelProvider for FakeModels {
    async fn load_models(&self, _dir: &Path) -> Result<(), ModelError> {
        if let Some(gate) = &self.load_gate {
            gate.acquire().await.expect("gate closed").forget();
        }
        if self.fail_load {
            return Err(ModelError::LoadFailed("synthetic".into()));
        }
        Ok(())
    }

    async fn detect(
        &self,
        _image: Arc<RgbImage>,
        _profile: DetectorProfile,
    ) -> Result<Vec<FaceDetection>, ModelError> {
        self.detect_calls.fetch_add(1, Ordering::SeqCst);
        self.detect_starts.lock().unwrap().push(Instant::now());
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);

        if let Some(gate) = &self.detect_gate {
            gate.acquire().await.expect("gate closed").forget();
        }
        if let Some(delay) = self.detect_delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(ModelError::InferenceFailed("synthetic".into()));
        }
        Ok(self.detections.clone())
    }

    async fn detect_single(&self, image: Arc<RgbImage>) -> Result<Option<FaceDetection>, ModelError> {
        let value = image.get_pixel(0, 0).0[0];
        Ok((value != 0).then(|| face(0.0, 0.0, &[value as f32 / 10.0])))
    }
}

/// Image store where `<label>/<n>.jpg` resolves through a fixed table.
pub struct FakeStore(pub Vec<(&'static str, u8)>);

#[async_trait]
impl ImageStore for FakeStore {
    async fn load_image(&self, path: &Path) -> Result<RgbImage, ImageStoreError> {
        self.0
            .iter()
            .find(|(p, _)| Path::new(p) == path)
            .map(|(_, v)| RgbImage::from_pixel(1, 1, Rgb([*v, 0, 0])))
            .ok_or_else(|| ImageStoreError::NotFound(path.to_path_buf()))
    }
}

/// Stream serving one fixed frame until released.
pub struct FakeStream {
    frame: Option<Frame>,
    pub released: AtomicBool,
}

impl FakeStream {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            frame: Some(Frame::new(RgbImage::new(width, height), 0)),
            released: AtomicBool::new(false),
        }
    }

    pub fn empty() -> Self {
        Self {
            frame: None,
            released: AtomicBool::new(false),
        }
    }
}

impl CaptureStream for FakeStream {
    fn snapshot(&self) -> Option<Frame> {
        if self.released.load(Ordering::SeqCst) {
            return None;
        }
        self.frame.clone()
    }

    fn release(&self) {
        self.released.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct FakeCapture {
    pub unavailable: AtomicBool,
    pub requests: AtomicUsize,
    pub streams: Mutex<Vec<Arc<FakeStream>>>,
}

#[async_trait]
impl CaptureSource for FakeCapture {
    async fn request_capture(
        &self,
        size: DisplayGeometry,
    ) -> Result<Arc<dyn CaptureStream>, CaptureError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CaptureError::PermissionDenied("synthetic".into()));
        }
        // Native frames at twice the display size exercise rescaling.
        let stream = Arc::new(FakeStream::new(size.width * 2, size.height * 2));
        self.streams.lock().unwrap().push(stream.clone());
        Ok(stream)
    }
}

/// Overlay that only counts and remembers operations.
#[derive(Default)]
pub struct CountingOverlay {
    pub clears: usize,
    pub draws: usize,
    pub last: Vec<Annotation>,
}

impl Overlay for CountingOverlay {
    fn clear(&mut self) {
        self.clears += 1;
        self.last.clear();
    }

    fn draw(&mut self, annotation: &Annotation) {
        self.draws += 1;
        self.last.push(annotation.clone());
    }
}
