//! Gallery construction from reference images.
//!
//! Each identity label owns `K` reference images at `<label>/<index>.<ext>`
//! (index starting at 1) inside an image store. Bad images are skipped; a
//! label only drops out when none of its images produced a descriptor.

use crate::gallery::{Gallery, Identity};
use crate::provider::{ModelError, ModelProvider};
use async_trait::async_trait;
use image::RgbImage;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ImageStoreError {
    #[error("image not found: {0}")]
    NotFound(PathBuf),
    #[error("failed to decode {path}: {reason}")]
    Decode { path: PathBuf, reason: String },
}

/// Why a single reference image contributed no descriptor.
#[derive(Error, Debug)]
pub enum EnrollmentError {
    #[error("reference image missing for {label}: {path}")]
    ImageMissing { label: String, path: PathBuf },
    #[error("no face detected in {path} ({label})")]
    NoFaceDetected { label: String, path: PathBuf },
    #[error("inference failed on {path} ({label}): {source}")]
    Inference {
        label: String,
        path: PathBuf,
        #[source]
        source: ModelError,
    },
}

/// Source of reference images.
#[async_trait]
pub trait ImageStore: Send + Sync {
    async fn load_image(&self, path: &Path) -> Result<RgbImage, ImageStoreError>;
}

/// Image store rooted at a directory on disk.
pub struct FsImageStore {
    root: PathBuf,
}

impl FsImageStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl ImageStore for FsImageStore {
    async fn load_image(&self, path: &Path) -> Result<RgbImage, ImageStoreError> {
        let full = self.root.join(path);
        if !full.is_file() {
            return Err(ImageStoreError::NotFound(full));
        }
        tokio::task::spawn_blocking(move || {
            image::open(&full)
                .map(|img| img.to_rgb8())
                .map_err(|e| ImageStoreError::Decode {
                    path: full.clone(),
                    reason: e.to_string(),
                })
        })
        .await
        .map_err(|e| ImageStoreError::Decode {
            path: path.to_path_buf(),
            reason: format!("decode task failed: {e}"),
        })?
    }
}

/// What to enroll.
#[derive(Debug, Clone)]
pub struct EnrollmentPlan {
    pub labels: Vec<String>,
    pub images_per_identity: usize,
    pub extension: String,
}

impl EnrollmentPlan {
    pub fn new(labels: Vec<String>, images_per_identity: usize) -> Self {
        Self {
            labels,
            images_per_identity,
            extension: "jpg".to_string(),
        }
    }

    /// Store-relative path of reference image `index` (1-based) for `label`.
    pub fn reference_path(&self, label: &str, index: usize) -> PathBuf {
        Path::new(label).join(format!("{index}.{}", self.extension))
    }
}

/// Result of an enrollment run.
#[derive(Debug, Default)]
pub struct EnrollmentReport {
    pub gallery: Gallery,
    /// Images that were skipped, with the reason.
    pub skipped: Vec<EnrollmentError>,
    /// Labels that produced no descriptor at all.
    pub excluded: Vec<String>,
}

/// Build a gallery by extracting one descriptor per reference image.
///
/// Labels are processed in plan order, which fixes gallery order. Never
/// aborts on a bad image.
pub async fn enroll(
    models: &dyn ModelProvider,
    store: &dyn ImageStore,
    plan: &EnrollmentPlan,
) -> EnrollmentReport {
    let mut identities = Vec::with_capacity(plan.labels.len());
    let mut skipped = Vec::new();
    let mut excluded = Vec::new();
    let mut seen: Vec<&str> = Vec::new();

    for label in &plan.labels {
        if seen.contains(&label.as_str()) {
            tracing::warn!(label = %label, "label listed twice; enrolling first occurrence only");
            continue;
        }
        seen.push(label);

        let mut descriptors = Vec::with_capacity(plan.images_per_identity);
        for index in 1..=plan.images_per_identity {
            let path = plan.reference_path(label, index);
            match enroll_image(models, store, label, &path).await {
                Ok(descriptor) => descriptors.push(descriptor),
                Err(err) => {
                    tracing::warn!(error = %err, "skipping reference image");
                    skipped.push(err);
                }
            }
        }

        tracing::debug!(label = %label, descriptors = descriptors.len(), "label processed");
        match Identity::new(label.clone(), descriptors) {
            Some(identity) => identities.push(identity),
            None => {
                tracing::warn!(label = %label, "no usable reference image; identity excluded");
                excluded.push(label.clone());
            }
        }
    }

    let gallery = Gallery::from_identities(identities);
    tracing::info!(
        identities = gallery.len(),
        skipped = skipped.len(),
        excluded = excluded.len(),
        "enrollment complete"
    );

    EnrollmentReport {
        gallery,
        skipped,
        excluded,
    }
}

async fn enroll_image(
    models: &dyn ModelProvider,
    store: &dyn ImageStore,
    label: &str,
    path: &Path,
) -> Result<crate::types::Descriptor, EnrollmentError> {
    let image = store.load_image(path).await.map_err(|e| {
        tracing::debug!(error = %e, "reference image load failed");
        EnrollmentError::ImageMissing {
            label: label.to_string(),
            path: path.to_path_buf(),
        }
    })?;

    let detection = models
        .detect_single(Arc::new(image))
        .await
        .map_err(|source| EnrollmentError::Inference {
            label: label.to_string(),
            path: path.to_path_buf(),
            source,
        })?;

    detection
        .map(|d| d.descriptor)
        .ok_or_else(|| EnrollmentError::NoFaceDetected {
            label: label.to_string(),
            path: path.to_path_buf(),
        })
}
