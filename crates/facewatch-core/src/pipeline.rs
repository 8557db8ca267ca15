//! Periodic detect → match → render scheduler.
//!
//! One pipeline task runs per capture session. Ticks never overlap: the
//! next one is only awaited after the previous render finished, and a slow
//! tick pushes the schedule back instead of bursting to catch up.

use crate::capture::CaptureStream;
use crate::gallery::Gallery;
use crate::matcher::{EuclideanMatcher, Matcher};
use crate::overlay::{Annotation, AnnotationRenderer};
use crate::provider::{DetectorProfile, ModelError, ModelProvider};
use crate::types::{DisplayGeometry, FaceDetection, Indicator, PipelineState};
use image::RgbImage;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

/// Ticks between timing summaries.
const STATS_EVERY: u64 = 50;

/// A tick that had to be dropped.
#[derive(Error, Debug)]
pub enum TickError {
    #[error("inference failed: {0}")]
    Inference(#[from] ModelError),
    #[error("inference timed out after {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// The capture stream had no frame to offer.
    NoFrame,
    /// Annotations for `faces` detections were written to the overlay.
    Rendered { faces: usize },
    /// Inference finished after capture stopped; nothing was written.
    Discarded,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub profile: DetectorProfile,
    pub period: Duration,
    pub geometry: DisplayGeometry,
    /// Upper bound for one inference call; `None` waits indefinitely.
    pub inference_timeout: Option<Duration>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let profile = DetectorProfile::default();
        Self {
            profile,
            period: Duration::from_millis(profile.default_tick_period_ms()),
            geometry: DisplayGeometry::default(),
            inference_timeout: Some(Duration::from_secs(5)),
        }
    }
}

#[derive(Default)]
struct TickStats {
    ticks: u64,
    inference: Duration,
    render: Duration,
}

enum Wake {
    Tick,
    StateChanged,
    Closed,
}

pub struct Pipeline {
    models: Arc<dyn ModelProvider>,
    capture: Arc<dyn CaptureStream>,
    gallery: Arc<Gallery>,
    matcher: EuclideanMatcher,
    renderer: AnnotationRenderer,
    state: watch::Receiver<PipelineState>,
    indicator: Arc<watch::Sender<Indicator>>,
    config: PipelineConfig,
    stats: TickStats,
}

impl Pipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        models: Arc<dyn ModelProvider>,
        capture: Arc<dyn CaptureStream>,
        gallery: Arc<Gallery>,
        matcher: EuclideanMatcher,
        renderer: AnnotationRenderer,
        state: watch::Receiver<PipelineState>,
        indicator: Arc<watch::Sender<Indicator>>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            models,
            capture,
            gallery,
            matcher,
            renderer,
            state,
            indicator,
            config,
            stats: TickStats::default(),
        }
    }

    fn is_capturing(&self) -> bool {
        *self.state.borrow() == PipelineState::Capturing
    }

    /// Tick until the controller leaves `Capturing`.
    ///
    /// A state change wakes the loop immediately, so no tick is started
    /// after a stop. A tick already awaiting inference either runs to
    /// completion with its render discarded, or is dropped when the owning
    /// controller aborts the task.
    pub async fn run(mut self) {
        let mut interval = tokio::time::interval(self.config.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            period_ms = self.config.period.as_millis() as u64,
            profile = %self.config.profile,
            identities = self.gallery.len(),
            "pipeline started"
        );

        loop {
            let wake = tokio::select! {
                _ = interval.tick() => Wake::Tick,
                changed = self.state.changed() => match changed {
                    Ok(()) => Wake::StateChanged,
                    Err(_) => Wake::Closed,
                },
            };

            if matches!(wake, Wake::Closed) || !self.is_capturing() {
                break;
            }
            if matches!(wake, Wake::StateChanged) {
                continue;
            }

            match self.tick().await {
                Ok(TickOutcome::Rendered { faces }) => {
                    tracing::trace!(faces, "tick rendered");
                }
                Ok(TickOutcome::NoFrame) => tracing::debug!("no frame available; tick skipped"),
                Ok(TickOutcome::Discarded) => tracing::debug!("tick finished after stop; render discarded"),
                Err(e) => tracing::warn!(error = %e, "tick dropped"),
            }
        }

        tracing::info!(ticks = self.stats.ticks, "pipeline stopped");
    }

    /// Run one detect → match → render cycle.
    pub async fn tick(&mut self) -> Result<TickOutcome, TickError> {
        let Some(frame) = self.capture.snapshot() else {
            return Ok(TickOutcome::NoFrame);
        };

        let inference_start = Instant::now();
        let detections = self.infer(Arc::clone(&frame.image)).await?;
        let inference = inference_start.elapsed();

        let render_start = Instant::now();
        let (sx, sy) = self.config.geometry.scale_from(frame.width(), frame.height());
        let annotations: Vec<Annotation> = detections
            .into_iter()
            .map(|det| det.rescaled(sx, sy))
            .map(|det| Annotation {
                result: self.matcher.find_best(&det.descriptor, &self.gallery),
                bbox: det.bbox,
            })
            .collect();

        if !self.renderer.render(&annotations) {
            return Ok(TickOutcome::Discarded);
        }

        self.record(inference, render_start.elapsed());
        if *self.indicator.borrow() == Indicator::Initializing {
            self.indicator.send_replace(Indicator::Ready);
            tracing::info!("first tick rendered; ready");
        }

        Ok(TickOutcome::Rendered {
            faces: annotations.len(),
        })
    }

    async fn infer(&self, image: Arc<RgbImage>) -> Result<Vec<FaceDetection>, TickError> {
        let detect = self.models.detect(image, self.config.profile);
        match self.config.inference_timeout {
            Some(limit) => tokio::time::timeout(limit, detect)
                .await
                .map_err(|_| TickError::Timeout(limit))?
                .map_err(TickError::from),
            None => detect.await.map_err(TickError::from),
        }
    }

    fn record(&mut self, inference: Duration, render: Duration) {
        let stats = &mut self.stats;
        stats.ticks += 1;
        stats.inference += inference;
        stats.render += render;

        if stats.ticks % STATS_EVERY == 0 {
            let per_tick = |d: Duration| format!("{:.2}", d.as_secs_f64() * 1000.0 / stats.ticks as f64);
            tracing::info!(
                ticks = stats.ticks,
                inference_ms_per_tick = per_tick(stats.inference),
                render_ms_per_tick = per_tick(stats.render),
                "pipeline timings"
            );
        }
    }
}
