//! Lifecycle controller: model readiness, capture start/stop, scheduler ownership.
//!
//! The controller runs as a single tokio task that exclusively owns the
//! capture stream and the pipeline task. Callers talk to it through a
//! cloneable [`ControllerHandle`]; requests are served one at a time, in
//! order, after models are loaded and the gallery is built.

use crate::capture::{CaptureError, CaptureSource, CaptureStream};
use crate::enrollment::{self, EnrollmentPlan, ImageStore};
use crate::gallery::Gallery;
use crate::matcher::EuclideanMatcher;
use crate::overlay::{self, AnnotationRenderer, SharedOverlay};
use crate::pipeline::{Pipeline, PipelineConfig};
use crate::provider::ModelProvider;
use crate::types::{Indicator, PipelineState};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

#[derive(Error, Debug)]
pub enum ControllerError {
    #[error("models are not loaded")]
    ModelsNotLoaded,
    #[error("model loading failed; capture disabled ({0})")]
    ModelLoad(String),
    #[error("capture unavailable: {0}")]
    CaptureUnavailable(#[from] CaptureError),
    #[error("controller task exited")]
    ChannelClosed,
}

/// External capabilities the controller drives.
#[derive(Clone)]
pub struct Capabilities {
    pub models: Arc<dyn ModelProvider>,
    pub capture: Arc<dyn CaptureSource>,
    pub images: Arc<dyn ImageStore>,
    pub overlay: SharedOverlay,
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub model_dir: PathBuf,
    pub enrollment: EnrollmentPlan,
    pub match_threshold: f32,
    pub pipeline: PipelineConfig,
}

enum ControllerRequest {
    Start {
        reply: oneshot::Sender<Result<PipelineState, ControllerError>>,
    },
    Stop {
        reply: oneshot::Sender<PipelineState>,
    },
    Gallery {
        reply: oneshot::Sender<Option<Arc<Gallery>>>,
    },
}

/// Clone-safe handle to the controller task.
#[derive(Clone)]
pub struct ControllerHandle {
    tx: mpsc::Sender<ControllerRequest>,
    state: watch::Receiver<PipelineState>,
    indicator: watch::Receiver<Indicator>,
    load_error: watch::Receiver<Option<String>>,
}

impl ControllerHandle {
    /// Start capturing. Waits for model loading if it is still in progress.
    ///
    /// A no-op returning `Capturing` when already capturing.
    pub async fn start(&self) -> Result<PipelineState, ControllerError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(ControllerRequest::Start { reply: reply_tx })
            .await
            .map_err(|_| ControllerError::ChannelClosed)?;
        reply_rx.await.map_err(|_| ControllerError::ChannelClosed)?
    }

    /// Stop capturing. A no-op when not capturing. Returns the resulting state.
    pub async fn stop(&self) -> Result<PipelineState, ControllerError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(ControllerRequest::Stop { reply: reply_tx })
            .await
            .map_err(|_| ControllerError::ChannelClosed)?;
        reply_rx.await.map_err(|_| ControllerError::ChannelClosed)
    }

    /// The enrolled gallery, once built.
    pub async fn gallery(&self) -> Result<Option<Arc<Gallery>>, ControllerError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(ControllerRequest::Gallery { reply: reply_tx })
            .await
            .map_err(|_| ControllerError::ChannelClosed)?;
        reply_rx.await.map_err(|_| ControllerError::ChannelClosed)
    }

    pub fn state(&self) -> PipelineState {
        *self.state.borrow()
    }

    pub fn indicator(&self) -> Indicator {
        *self.indicator.borrow()
    }

    /// Why model loading failed, if it did.
    pub fn load_error(&self) -> Option<String> {
        self.load_error.borrow().clone()
    }

    /// Receiver that observes every state transition.
    pub fn subscribe_state(&self) -> watch::Receiver<PipelineState> {
        self.state.clone()
    }

    pub fn subscribe_indicator(&self) -> watch::Receiver<Indicator> {
        self.indicator.clone()
    }
}

/// Spawn the controller task. It loads models and enrolls the gallery
/// immediately, then serves start/stop requests.
pub fn spawn_controller(caps: Capabilities, config: ControllerConfig) -> ControllerHandle {
    let (tx, rx) = mpsc::channel(8);
    let (state_tx, state_rx) = watch::channel(PipelineState::Uninitialized);
    let (indicator_tx, indicator_rx) = watch::channel(Indicator::Initializing);
    let (load_error_tx, load_error_rx) = watch::channel(None);

    let controller = Controller {
        caps,
        config,
        state: state_tx,
        indicator: Arc::new(indicator_tx),
        load_error: load_error_tx,
        gallery: None,
        session: None,
    };
    tokio::spawn(controller.run(rx));

    ControllerHandle {
        tx,
        state: state_rx,
        indicator: indicator_rx,
        load_error: load_error_rx,
    }
}

/// One capture session. Its pipeline and renderer observe `state`, a
/// channel private to the session that never returns to `Capturing`, so a
/// late tick from an ended session can never paint into the next one.
struct Session {
    state: watch::Sender<PipelineState>,
    stream: Arc<dyn CaptureStream>,
    task: JoinHandle<()>,
}

impl Session {
    fn end(self) {
        self.state.send_replace(PipelineState::Stopped);
        // Drops a tick stuck in inference instead of waiting for it.
        self.task.abort();
        self.stream.release();
    }
}

struct Controller {
    caps: Capabilities,
    config: ControllerConfig,
    state: watch::Sender<PipelineState>,
    indicator: Arc<watch::Sender<Indicator>>,
    load_error: watch::Sender<Option<String>>,
    gallery: Option<Arc<Gallery>>,
    session: Option<Session>,
}

impl Controller {
    async fn run(mut self, mut rx: mpsc::Receiver<ControllerRequest>) {
        self.initialize().await;

        while let Some(req) = rx.recv().await {
            match req {
                ControllerRequest::Start { reply } => {
                    let result = self.start().await;
                    let _ = reply.send(result);
                }
                ControllerRequest::Stop { reply } => {
                    let _ = reply.send(self.stop());
                }
                ControllerRequest::Gallery { reply } => {
                    let _ = reply.send(self.gallery.clone());
                }
            }
        }

        self.stop();
        tracing::info!("controller exiting");
    }

    fn current(&self) -> PipelineState {
        *self.state.borrow()
    }

    fn transition(&self, next: PipelineState) {
        let prev = self.state.send_replace(next);
        tracing::info!(from = %prev, to = %next, "state transition");
    }

    async fn initialize(&mut self) {
        self.transition(PipelineState::LoadingModels);

        let dir = &self.config.model_dir;
        if let Err(e) = self.caps.models.load_models(dir).await {
            tracing::error!(error = %e, dir = %dir.display(), "model load failed; capture disabled");
            self.load_error.send_replace(Some(e.to_string()));
            self.transition(PipelineState::Uninitialized);
            return;
        }
        tracing::info!(dir = %dir.display(), "models loaded");

        let report = enrollment::enroll(
            self.caps.models.as_ref(),
            self.caps.images.as_ref(),
            &self.config.enrollment,
        )
        .await;
        if report.gallery.is_empty() {
            tracing::warn!("gallery is empty; every face will be reported as unknown");
        }
        self.gallery = Some(Arc::new(report.gallery));

        self.transition(PipelineState::Idle);
    }

    async fn start(&mut self) -> Result<PipelineState, ControllerError> {
        match self.current() {
            PipelineState::Capturing => return Ok(PipelineState::Capturing),
            PipelineState::Idle | PipelineState::Stopped => {}
            PipelineState::Uninitialized | PipelineState::LoadingModels => {
                return Err(match self.load_error.borrow().clone() {
                    Some(reason) => ControllerError::ModelLoad(reason),
                    None => ControllerError::ModelsNotLoaded,
                });
            }
        }
        let gallery = self.gallery.clone().ok_or(ControllerError::ModelsNotLoaded)?;

        let geometry = self.config.pipeline.geometry;
        let stream = self.caps.capture.request_capture(geometry).await.map_err(|e| {
            tracing::warn!(error = %e, "capture request failed");
            ControllerError::CaptureUnavailable(e)
        })?;

        self.indicator.send_replace(Indicator::Initializing);
        self.transition(PipelineState::Capturing);

        let (session_state, _) = watch::channel(PipelineState::Capturing);
        let renderer = AnnotationRenderer::new(self.caps.overlay.clone(), session_state.subscribe());
        let pipeline = Pipeline::new(
            self.caps.models.clone(),
            stream.clone(),
            gallery,
            EuclideanMatcher::new(self.config.match_threshold),
            renderer,
            session_state.subscribe(),
            self.indicator.clone(),
            self.config.pipeline.clone(),
        );
        self.session = Some(Session {
            state: session_state,
            stream,
            task: tokio::spawn(pipeline.run()),
        });

        Ok(PipelineState::Capturing)
    }

    fn stop(&mut self) -> PipelineState {
        let current = self.current();
        if current != PipelineState::Capturing {
            return current;
        }

        // Ending the session first gates any pending render before the clear.
        self.transition(PipelineState::Stopped);
        if let Some(session) = self.session.take() {
            session.end();
        }
        overlay::clear_overlay(&self.caps.overlay);

        PipelineState::Stopped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gallery::GalleryEntry;
    use crate::provider::DetectorProfile;
    use crate::testing::{face, CountingOverlay, FakeCapture, FakeModels, FakeStore};
    use crate::types::DisplayGeometry;
    use std::sync::atomic::Ordering;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::Semaphore;

    struct Fixture {
        handle: ControllerHandle,
        models: Arc<FakeModels>,
        capture: Arc<FakeCapture>,
        overlay: Arc<Mutex<CountingOverlay>>,
    }

    impl Fixture {
        fn new(models: FakeModels) -> Self {
            let models = Arc::new(models);
            let capture = Arc::new(FakeCapture::default());
            let overlay = Arc::new(Mutex::new(CountingOverlay::default()));
            // alice/2.jpg holds no face; bob has a single reference image.
            let store = FakeStore(vec![("alice/1.jpg", 1), ("alice/2.jpg", 0), ("bob/1.jpg", 5)]);
            let caps = Capabilities {
                models: models.clone(),
                capture: capture.clone(),
                images: Arc::new(store),
                overlay: overlay.clone(),
            };
            let config = ControllerConfig {
                model_dir: PathBuf::from("models"),
                enrollment: EnrollmentPlan::new(vec!["alice".into(), "bob".into()], 2),
                match_threshold: 0.58,
                pipeline: PipelineConfig {
                    profile: DetectorProfile::Fast,
                    period: Duration::from_millis(100),
                    geometry: DisplayGeometry::new(640, 400),
                    inference_timeout: None,
                },
            };
            Self {
                handle: spawn_controller(caps, config),
                models,
                capture,
                overlay,
            }
        }

        fn counts(&self) -> (usize, usize) {
            let overlay = self.overlay.lock().unwrap();
            (overlay.clears, overlay.draws)
        }

        async fn wait_for(&self, state: PipelineState) {
            self.handle
                .subscribe_state()
                .wait_for(|s| *s == state)
                .await
                .expect("controller alive");
        }
    }

    fn gated(permits: usize) -> (FakeModels, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(permits));
        let models = FakeModels {
            detect_gate: Some(gate.clone()),
            ..FakeModels::with_detections(vec![face(10.0, 10.0, &[0.1])])
        };
        (models, gate)
    }

    #[tokio::test]
    async fn test_initialization_builds_gallery() {
        let f = Fixture::new(FakeModels::default());
        f.wait_for(PipelineState::Idle).await;

        let gallery = f.handle.gallery().await.unwrap().expect("gallery built");
        assert_eq!(
            gallery.summary(),
            vec![
                GalleryEntry { label: "alice".into(), descriptors: 1 },
                GalleryEntry { label: "bob".into(), descriptors: 1 },
            ]
        );
        assert_eq!(f.handle.indicator(), Indicator::Initializing);
    }

    #[tokio::test]
    async fn test_start_waits_for_model_readiness() {
        let gate = Arc::new(Semaphore::new(0));
        let f = Fixture::new(FakeModels {
            load_gate: Some(gate.clone()),
            ..FakeModels::default()
        });
        f.wait_for(PipelineState::LoadingModels).await;

        let handle = f.handle.clone();
        let start = tokio::spawn(async move { handle.start().await });
        tokio::task::yield_now().await;
        assert!(!start.is_finished());
        assert_eq!(f.capture.requests.load(Ordering::SeqCst), 0);

        gate.add_permits(1);
        assert_eq!(start.await.unwrap().unwrap(), PipelineState::Capturing);
        assert_eq!(f.capture.requests.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_model_load_failure_rejects_start() {
        let f = Fixture::new(FakeModels {
            fail_load: true,
            ..FakeModels::default()
        });

        match f.handle.start().await {
            Err(ControllerError::ModelLoad(reason)) => assert!(reason.contains("synthetic")),
            other => panic!("expected a model load error, got {other:?}"),
        }
        assert!(f.handle.load_error().unwrap().contains("synthetic"));
        assert_eq!(f.handle.state(), PipelineState::Uninitialized);
        assert_eq!(f.capture.requests.load(Ordering::SeqCst), 0);
        assert!(f.handle.gallery().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_capture_unavailable_keeps_state_and_allows_retry() {
        let f = Fixture::new(FakeModels::default());
        f.wait_for(PipelineState::Idle).await;
        f.capture.unavailable.store(true, Ordering::SeqCst);

        let err = f.handle.start().await.unwrap_err();
        assert!(matches!(
            err,
            ControllerError::CaptureUnavailable(CaptureError::PermissionDenied(_))
        ));
        assert_eq!(f.handle.state(), PipelineState::Idle);

        f.capture.unavailable.store(false, Ordering::SeqCst);
        assert_eq!(f.handle.start().await.unwrap(), PipelineState::Capturing);
    }

    #[tokio::test(start_paused = true)]
    async fn test_double_start_runs_one_scheduler() {
        let f = Fixture::new(FakeModels::with_detections(vec![face(0.0, 0.0, &[0.1])]));

        assert_eq!(f.handle.start().await.unwrap(), PipelineState::Capturing);
        assert_eq!(f.handle.start().await.unwrap(), PipelineState::Capturing);
        assert_eq!(f.capture.requests.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(950)).await;
        let calls = f.models.detect_calls.load(Ordering::SeqCst);
        assert!((10..=11).contains(&calls), "expected a single 100ms schedule, got {calls} ticks");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_before_first_tick_renders_nothing() {
        let (models, gate) = gated(0);
        let f = Fixture::new(models);

        f.handle.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(f.models.detect_calls.load(Ordering::SeqCst), 1);

        assert_eq!(f.handle.stop().await.unwrap(), PipelineState::Stopped);
        gate.add_permits(10);
        tokio::time::sleep(Duration::from_millis(500)).await;

        // The only overlay operation is the clear performed by stop().
        assert_eq!(f.counts(), (1, 0));
        assert_eq!(f.models.detect_calls.load(Ordering::SeqCst), 1);
        assert_eq!(f.handle.indicator(), Indicator::Initializing);
        assert!(f.capture.streams.lock().unwrap()[0].released.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_inflight_tick_after_stop_does_not_paint() {
        let (models, gate) = gated(1);
        let f = Fixture::new(models);

        f.handle.start().await.unwrap();
        // First tick renders; the second (t=100ms) blocks in inference.
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(f.counts(), (1, 1));
        assert_eq!(f.handle.indicator(), Indicator::Ready);
        assert_eq!(f.models.detect_calls.load(Ordering::SeqCst), 2);

        f.handle.stop().await.unwrap();
        let after_stop = f.counts();
        assert_eq!(after_stop, (2, 1));

        gate.add_permits(10);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(f.counts(), after_stop);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_behind_hung_tick_stays_responsive() {
        let (models, _gate) = gated(0);
        let f = Fixture::new(models);

        f.handle.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(f.handle.stop().await.unwrap(), PipelineState::Stopped);

        let limit = Duration::from_secs(60);
        let restarted = tokio::time::timeout(limit, f.handle.start()).await;
        assert_eq!(restarted.expect("start answered").unwrap(), PipelineState::Capturing);
        let stopped = tokio::time::timeout(limit, f.handle.stop()).await;
        assert_eq!(stopped.expect("stop answered").unwrap(), PipelineState::Stopped);

        assert!(f.handle.gallery().await.unwrap().is_some());
        assert_eq!(f.capture.requests.load(Ordering::SeqCst), 2);
        assert_eq!(f.counts(), (2, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_idempotent_and_restart_works() {
        let f = Fixture::new(FakeModels::with_detections(vec![face(0.0, 0.0, &[0.1])]));
        f.wait_for(PipelineState::Idle).await;

        assert_eq!(f.handle.stop().await.unwrap(), PipelineState::Idle);
        f.handle.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(f.handle.stop().await.unwrap(), PipelineState::Stopped);
        let cleared = f.counts().0;
        assert_eq!(f.handle.stop().await.unwrap(), PipelineState::Stopped);
        assert_eq!(f.counts().0, cleared, "second stop must not touch the overlay");

        assert_eq!(f.handle.start().await.unwrap(), PipelineState::Capturing);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(f.handle.indicator(), Indicator::Ready);

        let streams = f.capture.streams.lock().unwrap();
        assert_eq!(streams.len(), 2);
        assert!(streams[0].released.load(Ordering::SeqCst));
        assert!(!streams[1].released.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_controllers_are_independent() {
        let a = Fixture::new(FakeModels::default());
        let b = Fixture::new(FakeModels::default());
        b.wait_for(PipelineState::Idle).await;

        a.handle.start().await.unwrap();
        assert_eq!(a.handle.state(), PipelineState::Capturing);
        assert_eq!(b.handle.state(), PipelineState::Idle);
        assert_eq!(b.capture.requests.load(Ordering::SeqCst), 0);
    }
}
