//! ONNX-backed [`ModelProvider`]: SCRFD detection plus ArcFace descriptors.

use crate::detector::{DetectorError, FaceDetector};
use crate::provider::{DetectorProfile, ModelError, ModelProvider};
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::types::{AuxAttributes, FaceDetection};
use async_trait::async_trait;
use image::RgbImage;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

pub const DETECTOR_MODEL: &str = "det_10g.onnx";
pub const RECOGNIZER_MODEL: &str = "w600k_r50.onnx";

impl From<DetectorError> for ModelError {
    fn from(e: DetectorError) -> Self {
        match e {
            DetectorError::ModelNotFound(path) => ModelError::LoadFailed(format!("missing {path}")),
            other => ModelError::InferenceFailed(other.to_string()),
        }
    }
}

impl From<RecognizerError> for ModelError {
    fn from(e: RecognizerError) -> Self {
        match e {
            RecognizerError::ModelNotFound(path) => ModelError::LoadFailed(format!("missing {path}")),
            other => ModelError::InferenceFailed(other.to_string()),
        }
    }
}

struct Loaded {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

impl Loaded {
    fn analyze(&mut self, image: &RgbImage, profile: DetectorProfile) -> Result<Vec<FaceDetection>, ModelError> {
        let detected = self.detector.detect(image, profile)?;

        let mut faces = Vec::with_capacity(detected.len());
        for d in detected {
            let descriptor = match self.recognizer.extract(image, &d.landmarks) {
                Ok(descriptor) => descriptor,
                Err(RecognizerError::Unalignable) => {
                    tracing::debug!(bbox = ?d.bbox, "skipping face with degenerate landmarks");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            faces.push(FaceDetection {
                bbox: d.bbox,
                landmarks: d.landmarks.to_vec(),
                descriptor,
                attributes: AuxAttributes {
                    confidence: d.bbox.confidence,
                },
            });
        }
        Ok(faces)
    }
}

/// Marks an inference running on the blocking pool. Cleared on drop, which
/// happens when the blocking closure returns, not when its caller gives up.
struct InFlight(Arc<AtomicBool>);

impl InFlight {
    fn acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| InFlight(flag.clone()))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Model provider running both networks on the blocking pool.
///
/// At most one inference runs at a time. A call arriving while an earlier
/// one is still on the pool (for example after its caller timed out) fails
/// with [`ModelError::Busy`] instead of queueing another blocking thread.
#[derive(Clone, Default)]
pub struct OnnxModels {
    loaded: Arc<Mutex<Option<Loaded>>>,
    busy: Arc<AtomicBool>,
}

impl OnnxModels {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.lock().map(|g| g.is_some()).unwrap_or(false)
    }

    async fn with_models<T, F>(&self, f: F) -> Result<T, ModelError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Loaded) -> Result<T, ModelError> + Send + 'static,
    {
        let in_flight = InFlight::acquire(&self.busy).ok_or(ModelError::Busy)?;
        let loaded = self.loaded.clone();
        tokio::task::spawn_blocking(move || {
            let _in_flight = in_flight;
            let mut guard = loaded
                .lock()
                .map_err(|_| ModelError::InferenceFailed("model lock poisoned".into()))?;
            let models = guard.as_mut().ok_or(ModelError::NotLoaded)?;
            f(models)
        })
        .await
        .map_err(|e| ModelError::InferenceFailed(format!("inference task failed: {e}")))?
    }
}

#[async_trait]
impl ModelProvider for OnnxModels {
    async fn load_models(&self, dir: &Path) -> Result<(), ModelError> {
        let detector_path = dir.join(DETECTOR_MODEL);
        let recognizer_path = dir.join(RECOGNIZER_MODEL);
        let loaded = self.loaded.clone();

        tokio::task::spawn_blocking(move || {
            let detector = FaceDetector::load(&detector_path)
                .map_err(|e| ModelError::LoadFailed(e.to_string()))?;
            let recognizer = FaceRecognizer::load(&recognizer_path)
                .map_err(|e| ModelError::LoadFailed(e.to_string()))?;
            let mut guard = loaded
                .lock()
                .map_err(|_| ModelError::LoadFailed("model lock poisoned".into()))?;
            *guard = Some(Loaded { detector, recognizer });
            Ok(())
        })
        .await
        .map_err(|e| ModelError::LoadFailed(format!("load task failed: {e}")))?
    }

    async fn detect(
        &self,
        image: Arc<RgbImage>,
        profile: DetectorProfile,
    ) -> Result<Vec<FaceDetection>, ModelError> {
        self.with_models(move |m| m.analyze(&image, profile)).await
    }

    async fn detect_single(&self, image: Arc<RgbImage>) -> Result<Option<FaceDetection>, ModelError> {
        // Reference photos get the full-resolution detector; the best-scoring face wins.
        let faces = self
            .with_models(move |m| m.analyze(&image, DetectorProfile::Accurate))
            .await?;
        Ok(faces.into_iter().next())
    }
}
