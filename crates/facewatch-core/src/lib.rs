//! facewatch-core: live face identification engine.
//!
//! Builds a gallery of known identities from reference images, then
//! periodically detects faces in captured frames, matches them against the
//! gallery by Euclidean descriptor distance and draws labelled boxes onto an
//! overlay. Detection and embeddings run SCRFD and ArcFace through ONNX
//! Runtime; camera and overlay are injected through traits.

pub mod alignment;
pub mod capture;
pub mod controller;
pub mod detector;
pub mod enrollment;
pub mod gallery;
pub mod matcher;
pub mod models;
pub mod overlay;
pub mod pipeline;
pub mod provider;
pub mod recognizer;
pub mod types;

#[cfg(test)]
mod testing;

pub use capture::{CaptureError, CaptureSource, CaptureStream};
pub use controller::{spawn_controller, Capabilities, ControllerConfig, ControllerError, ControllerHandle};
pub use enrollment::{EnrollmentPlan, FsImageStore, ImageStore};
pub use gallery::{Gallery, GalleryEntry, Identity};
pub use matcher::{EuclideanMatcher, Matcher, DEFAULT_MATCH_THRESHOLD};
pub use models::OnnxModels;
pub use overlay::{Annotation, Canvas, Overlay, SharedOverlay};
pub use pipeline::PipelineConfig;
pub use provider::{DetectorProfile, ModelError, ModelProvider};
pub use types::{
    BoundingBox, Descriptor, DisplayGeometry, FaceDetection, Frame, Indicator, MatchResult, PipelineState,
};
