use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

/// Label reported for faces that match no enrolled identity.
pub const UNKNOWN_LABEL: &str = "unknown";

/// Axis-aligned face box in pixel coordinates of some image space.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

impl BoundingBox {
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// Intersection-over-Union with another box.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.width).min(other.x + other.width);
        let y2 = (self.y + self.height).min(other.y + other.height);

        let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        let union = self.area() + other.area() - inter;
        if union > 0.0 {
            inter / union
        } else {
            0.0
        }
    }

    /// Map the box from one coordinate space into another by per-axis scale.
    pub fn scaled(&self, sx: f32, sy: f32) -> BoundingBox {
        BoundingBox {
            x: self.x * sx,
            y: self.y * sy,
            width: self.width * sx,
            height: self.height * sy,
            confidence: self.confidence,
        }
    }
}

/// Face embedding produced by the embedding model for a single face.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Descriptor {
    values: Vec<f32>,
}

impl Descriptor {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Euclidean distance. Smaller = more similar.
    ///
    /// Descriptors of different dimension are incomparable and sit at
    /// infinite distance from each other.
    pub fn distance(&self, other: &Descriptor) -> f32 {
        if self.values.len() != other.values.len() {
            return f32::INFINITY;
        }
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

impl From<Vec<f32>> for Descriptor {
    fn from(values: Vec<f32>) -> Self {
        Self::new(values)
    }
}

/// Informational per-face attributes. Never used for matching.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuxAttributes {
    /// Detector confidence for the face box.
    pub confidence: f32,
}

/// One face found in a frame: geometry, landmarks and embedding.
#[derive(Debug, Clone)]
pub struct FaceDetection {
    pub bbox: BoundingBox,
    pub landmarks: Vec<(f32, f32)>,
    pub descriptor: Descriptor,
    pub attributes: AuxAttributes,
}

impl FaceDetection {
    /// Rescale box and landmarks by per-axis factors.
    pub fn rescaled(self, sx: f32, sy: f32) -> FaceDetection {
        FaceDetection {
            bbox: self.bbox.scaled(sx, sy),
            landmarks: self
                .landmarks
                .into_iter()
                .map(|(x, y)| (x * sx, y * sy))
                .collect(),
            descriptor: self.descriptor,
            attributes: self.attributes,
        }
    }
}

/// Size of the overlay surface that detections are mapped onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayGeometry {
    pub width: u32,
    pub height: u32,
}

impl DisplayGeometry {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Per-axis factors mapping `(width, height)` native pixels onto this geometry.
    pub fn scale_from(&self, width: u32, height: u32) -> (f32, f32) {
        let sx = if width > 0 {
            self.width as f32 / width as f32
        } else {
            1.0
        };
        let sy = if height > 0 {
            self.height as f32 / height as f32
        } else {
            1.0
        };
        (sx, sy)
    }
}

impl Default for DisplayGeometry {
    fn default() -> Self {
        Self::new(640, 400)
    }
}

/// A captured RGB frame.
#[derive(Debug, Clone)]
pub struct Frame {
    pub image: Arc<RgbImage>,
    pub sequence: u32,
    pub timestamp: Instant,
}

impl Frame {
    pub fn new(image: RgbImage, sequence: u32) -> Self {
        Self {
            image: Arc::new(image),
            sequence,
            timestamp: Instant::now(),
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

/// Outcome of matching one descriptor against the gallery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    /// Label of the matched identity, `None` when nothing is within threshold.
    pub identity: Option<String>,
    /// Distance to the nearest reference descriptor.
    pub distance: f32,
}

impl MatchResult {
    pub fn unknown(distance: f32) -> Self {
        Self {
            identity: None,
            distance,
        }
    }

    pub fn is_known(&self) -> bool {
        self.identity.is_some()
    }

    pub fn label(&self) -> &str {
        self.identity.as_deref().unwrap_or(UNKNOWN_LABEL)
    }
}

impl fmt::Display for MatchResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:.2})", self.label(), self.distance)
    }
}

/// Lifecycle state of the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Uninitialized,
    LoadingModels,
    Idle,
    Capturing,
    Stopped,
}

impl PipelineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineState::Uninitialized => "uninitialized",
            PipelineState::LoadingModels => "loading_models",
            PipelineState::Idle => "idle",
            PipelineState::Capturing => "capturing",
            PipelineState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Host-facing readiness flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Indicator {
    Initializing,
    Ready,
}

impl fmt::Display for Indicator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Indicator::Initializing => f.write_str("Initializing"),
            Indicator::Ready => f.write_str("Ready"),
        }
    }
}
