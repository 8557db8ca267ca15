//! Model Provider capability: detection, landmarks and embeddings.

use crate::types::FaceDetection;
use async_trait::async_trait;
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("model load failed: {0}")]
    LoadFailed(String),
    #[error("models not loaded")]
    NotLoaded,
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("previous inference still running")]
    Busy,
}

/// Detector variant trading speed for accuracy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectorProfile {
    #[default]
    Fast,
    Accurate,
}

impl DetectorProfile {
    /// Tick period used when none is configured.
    pub fn default_tick_period_ms(&self) -> u64 {
        match self {
            DetectorProfile::Fast => 100,
            DetectorProfile::Accurate => 1000,
        }
    }
}

impl fmt::Display for DetectorProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DetectorProfile::Fast => f.write_str("fast"),
            DetectorProfile::Accurate => f.write_str("accurate"),
        }
    }
}

impl FromStr for DetectorProfile {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fast" => Ok(DetectorProfile::Fast),
            "accurate" => Ok(DetectorProfile::Accurate),
            other => Err(format!("unknown detector profile: {other} (expected fast or accurate)")),
        }
    }
}

/// Face inference backend.
///
/// Calls may be long-running; implementations should keep heavy work off
/// the async executor threads.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Load every model the provider needs from `dir`.
    async fn load_models(&self, dir: &Path) -> Result<(), ModelError>;

    /// Detect all faces in `image`, each with landmarks and descriptor.
    async fn detect(
        &self,
        image: Arc<RgbImage>,
        profile: DetectorProfile,
    ) -> Result<Vec<FaceDetection>, ModelError>;

    /// Detect the most prominent face in `image`, if any.
    async fn detect_single(&self, image: Arc<RgbImage>) -> Result<Option<FaceDetection>, ModelError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_parse() {
        assert_eq!("fast".parse::<DetectorProfile>(), Ok(DetectorProfile::Fast));
        assert_eq!("Accurate".parse::<DetectorProfile>(), Ok(DetectorProfile::Accurate));
        assert!("ssd".parse::<DetectorProfile>().is_err());
    }

    #[test]
    fn test_profile_default_periods() {
        assert_eq!(DetectorProfile::Fast.default_tick_period_ms(), 100);
        assert_eq!(DetectorProfile::Accurate.default_tick_period_ms(), 1000);
    }
}
