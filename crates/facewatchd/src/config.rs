use anyhow::{bail, Context, Result};
use facewatch_core::controller::ControllerConfig;
use facewatch_core::enrollment::EnrollmentPlan;
use facewatch_core::pipeline::PipelineConfig;
use facewatch_core::{DetectorProfile, DisplayGeometry, DEFAULT_MATCH_THRESHOLD};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Daemon configuration: TOML file, then `FACEWATCH_*` overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// V4L2 device path.
    pub camera_device: String,
    /// Directory holding `det_10g.onnx` and `w600k_r50.onnx`.
    pub model_dir: PathBuf,
    /// Root of the reference images, laid out as `<label>/<n>.<ext>`.
    pub image_dir: PathBuf,
    /// Identities to enroll, in gallery order.
    pub labels: Vec<String>,
    pub images_per_identity: usize,
    pub image_extension: String,
    /// Maximum Euclidean distance for a positive match (inclusive).
    ///
    /// The 0.58 default was tuned for 128-d face-api descriptors. The shipped
    /// recognizer emits L2-normalised ArcFace embeddings, where 0.58 means a
    /// cosine similarity of at least ~0.83 and rejects many genuine webcam
    /// matches; raise it (around 1.0 to 1.1) when running those models.
    pub match_threshold: f32,
    pub detector_profile: DetectorProfile,
    /// Tick period; the profile default when unset.
    pub tick_period_ms: Option<u64>,
    pub display_width: u32,
    pub display_height: u32,
    /// Per-tick inference limit; `0` disables it.
    pub inference_timeout_ms: u64,
    /// TrueType font for overlay labels.
    pub font_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            camera_device: "/dev/video0".to_string(),
            model_dir: PathBuf::from("/usr/share/facewatch/models"),
            image_dir: PathBuf::from("images"),
            labels: Vec::new(),
            images_per_identity: 2,
            image_extension: "jpg".to_string(),
            match_threshold: DEFAULT_MATCH_THRESHOLD,
            detector_profile: DetectorProfile::Fast,
            tick_period_ms: None,
            display_width: 640,
            display_height: 400,
            inference_timeout_ms: 5000,
            font_path: None,
        }
    }
}

impl Config {
    /// Load from `path` (or the default location), apply environment overrides, validate.
    ///
    /// A missing file yields the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.map(Path::to_path_buf).unwrap_or_else(default_path);
        Self::load_with(&path, |key| std::env::var(key).ok())
    }

    /// [`Config::load`] with an explicit file and override source.
    pub fn load_with(path: &Path, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading config at {}", path.display()))?;
            Self::from_toml_str(&raw).with_context(|| format!("parsing config {}", path.display()))?
        } else {
            tracing::info!(path = %path.display(), "no config file; using defaults");
            Self::default()
        };

        config.apply_overrides(lookup)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// Apply `FACEWATCH_*` overrides read through `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        fn parse<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T>
        where
            T::Err: std::fmt::Display,
        {
            raw.parse::<T>()
                .map_err(|e| anyhow::anyhow!("invalid {key}={raw:?}: {e}"))
        }

        if let Some(v) = lookup("FACEWATCH_CAMERA_DEVICE") {
            self.camera_device = v;
        }
        if let Some(v) = lookup("FACEWATCH_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("FACEWATCH_IMAGE_DIR") {
            self.image_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("FACEWATCH_LABELS") {
            self.labels = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(v) = lookup("FACEWATCH_IMAGES_PER_IDENTITY") {
            self.images_per_identity = parse("FACEWATCH_IMAGES_PER_IDENTITY", &v)?;
        }
        if let Some(v) = lookup("FACEWATCH_MATCH_THRESHOLD") {
            self.match_threshold = parse("FACEWATCH_MATCH_THRESHOLD", &v)?;
        }
        if let Some(v) = lookup("FACEWATCH_DETECTOR_PROFILE") {
            self.detector_profile = parse("FACEWATCH_DETECTOR_PROFILE", &v)?;
        }
        if let Some(v) = lookup("FACEWATCH_TICK_PERIOD_MS") {
            self.tick_period_ms = Some(parse("FACEWATCH_TICK_PERIOD_MS", &v)?);
        }
        if let Some(v) = lookup("FACEWATCH_INFERENCE_TIMEOUT_MS") {
            self.inference_timeout_ms = parse("FACEWATCH_INFERENCE_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = lookup("FACEWATCH_FONT_PATH") {
            self.font_path = Some(PathBuf::from(v));
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if !self.match_threshold.is_finite() || self.match_threshold <= 0.0 {
            bail!("match_threshold must be a positive number, got {}", self.match_threshold);
        }
        if self.display_width == 0 || self.display_height == 0 {
            bail!(
                "display geometry must be non-zero, got {}x{}",
                self.display_width,
                self.display_height
            );
        }
        if self.images_per_identity == 0 {
            bail!("images_per_identity must be at least 1");
        }
        if self.tick_period_ms == Some(0) {
            bail!("tick_period_ms must be at least 1");
        }
        Ok(())
    }

    pub fn geometry(&self) -> DisplayGeometry {
        DisplayGeometry::new(self.display_width, self.display_height)
    }

    pub fn tick_period(&self) -> Duration {
        Duration::from_millis(
            self.tick_period_ms
                .unwrap_or_else(|| self.detector_profile.default_tick_period_ms()),
        )
    }

    pub fn controller_config(&self) -> ControllerConfig {
        let mut enrollment = EnrollmentPlan::new(self.labels.clone(), self.images_per_identity);
        enrollment.extension = self.image_extension.clone();

        ControllerConfig {
            model_dir: self.model_dir.clone(),
            enrollment,
            match_threshold: self.match_threshold,
            pipeline: PipelineConfig {
                profile: self.detector_profile,
                period: self.tick_period(),
                geometry: self.geometry(),
                inference_timeout: (self.inference_timeout_ms > 0)
                    .then(|| Duration::from_millis(self.inference_timeout_ms)),
            },
        }
    }
}

/// `$FACEWATCH_CONFIG`, else `$XDG_CONFIG_HOME/facewatch/config.toml`, else under `~/.config`.
pub fn default_path() -> PathBuf {
    if let Ok(path) = std::env::var("FACEWATCH_CONFIG") {
        return PathBuf::from(path);
    }
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".config")
        })
        .join("facewatch/config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.camera_device, "/dev/video0");
        assert_eq!(config.match_threshold, 0.58);
        assert_eq!(config.images_per_identity, 2);
        assert_eq!(config.geometry(), DisplayGeometry::new(640, 400));
        assert_eq!(config.tick_period(), Duration::from_millis(100));
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = Config::from_toml_str(
            r#"
            labels = ["alice", "bob"]
            detector_profile = "accurate"
            match_threshold = 0.7
            "#,
        )
        .unwrap();

        assert_eq!(config.labels, vec!["alice", "bob"]);
        assert_eq!(config.detector_profile, DetectorProfile::Accurate);
        assert_eq!(config.tick_period(), Duration::from_millis(1000));
        assert_eq!(config.display_height, 400);
    }

    #[test]
    fn test_unknown_profile_rejected() {
        assert!(Config::from_toml_str(r#"detector_profile = "turbo""#).is_err());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config
            .apply_overrides(env(&[
                ("FACEWATCH_LABELS", "alice, bob,,carol"),
                ("FACEWATCH_TICK_PERIOD_MS", "250"),
                ("FACEWATCH_INFERENCE_TIMEOUT_MS", "0"),
                ("FACEWATCH_DETECTOR_PROFILE", "Accurate"),
            ]))
            .unwrap();

        assert_eq!(config.labels, vec!["alice", "bob", "carol"]);
        let controller = config.controller_config();
        assert_eq!(controller.pipeline.period, Duration::from_millis(250));
        assert_eq!(controller.pipeline.inference_timeout, None);
        assert_eq!(controller.pipeline.profile, DetectorProfile::Accurate);
    }

    #[test]
    fn test_bad_env_value_is_an_error() {
        let mut config = Config::default();
        let err = config
            .apply_overrides(env(&[("FACEWATCH_MATCH_THRESHOLD", "close")]))
            .unwrap_err();
        assert!(err.to_string().contains("FACEWATCH_MATCH_THRESHOLD"));
    }

    #[test]
    fn test_validation() {
        let bad = [
            Config { match_threshold: 0.0, ..Config::default() },
            Config { match_threshold: f32::NAN, ..Config::default() },
            Config { display_width: 0, ..Config::default() },
            Config { images_per_identity: 0, ..Config::default() },
            Config { tick_period_ms: Some(0), ..Config::default() },
        ];
        for config in bad {
            assert!(config.validate().is_err(), "{config:?} should be rejected");
        }
    }

    #[test]
    fn test_controller_config_carries_extension() {
        let config = Config {
            labels: vec!["alice".into()],
            image_extension: "png".into(),
            ..Config::default()
        };
        let controller = config.controller_config();
        assert_eq!(
            controller.enrollment.reference_path("alice", 1),
            PathBuf::from("alice/1.png")
        );
        assert_eq!(controller.pipeline.inference_timeout, Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let missing = Path::new("/nonexistent/facewatch.toml");

        let config = Config::load_with(missing, env(&[])).unwrap();
        assert_eq!(config, Config::default());

        let config = Config::load_with(missing, env(&[("FACEWATCH_MODEL_DIR", "/opt/models")])).unwrap();
        assert_eq!(config.model_dir, PathBuf::from("/opt/models"));
    }
}
