use facewatch_core::capture::CaptureError;
use facewatch_core::{Canvas, ControllerError, ControllerHandle, PipelineConfig};
use image::ImageFormat;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use zbus::interface;
use zbus::object_server::SignalEmitter;

pub const BUS_NAME: &str = "org.facewatch.Facewatch1";
pub const OBJECT_PATH: &str = "/org/facewatch/Facewatch1";

/// D-Bus interface for the facewatch daemon.
///
/// Bus name: org.facewatch.Facewatch1
/// Object path: /org/facewatch/Facewatch1
pub struct FacewatchService {
    pub controller: ControllerHandle,
    pub canvas: Arc<Mutex<Canvas>>,
    pub pipeline: PipelineConfig,
}

impl FacewatchService {
    fn canvas(&self) -> MutexGuard<'_, Canvas> {
        match self.canvas.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn to_fdo(e: ControllerError) -> zbus::fdo::Error {
    match e {
        ControllerError::CaptureUnavailable(CaptureError::PermissionDenied(msg)) => {
            zbus::fdo::Error::AccessDenied(msg)
        }
        other => zbus::fdo::Error::Failed(other.to_string()),
    }
}

#[interface(name = "org.facewatch.Facewatch1")]
impl FacewatchService {
    /// Start capture and the identification loop. Returns the resulting state.
    async fn start(&self) -> zbus::fdo::Result<String> {
        tracing::info!("start requested");
        let state = self.controller.start().await.map_err(to_fdo)?;
        Ok(state.to_string())
    }

    /// Stop capture and clear the overlay. Returns the resulting state.
    async fn stop(&self) -> zbus::fdo::Result<String> {
        tracing::info!("stop requested");
        let state = self.controller.stop().await.map_err(to_fdo)?;
        Ok(state.to_string())
    }

    /// Daemon status as JSON.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let identities = match self.controller.gallery().await {
            Ok(Some(gallery)) => gallery.len(),
            _ => 0,
        };
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "state": self.controller.state(),
            "indicator": self.controller.indicator(),
            "error": self.controller.load_error(),
            "profile": self.pipeline.profile,
            "period_ms": self.pipeline.period.as_millis() as u64,
            "identities": identities,
        })
        .to_string())
    }

    /// Enrolled identities with descriptor counts, as JSON.
    async fn gallery(&self) -> zbus::fdo::Result<String> {
        let gallery = self.controller.gallery().await.map_err(to_fdo)?;
        let summary = gallery.map(|g| g.summary()).unwrap_or_default();
        serde_json::to_string(&summary).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// Annotations currently on the overlay, as JSON.
    async fn annotations(&self) -> zbus::fdo::Result<String> {
        let canvas = self.canvas();
        serde_json::to_string(canvas.annotations()).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// Write the overlay to `path` as PNG.
    async fn save_overlay(&self, path: &str) -> zbus::fdo::Result<bool> {
        let target = PathBuf::from(path);
        let image = self.canvas().image().clone();
        tokio::task::spawn_blocking(move || image.save_with_format(&target, ImageFormat::Png))
            .await
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?
            .map_err(|e| zbus::fdo::Error::IOError(format!("{path}: {e}")))?;
        tracing::info!(path, "overlay saved");
        Ok(true)
    }

    /// Emitted on every lifecycle transition.
    #[zbus(signal)]
    pub async fn state_changed(emitter: &SignalEmitter<'_>, state: &str) -> zbus::Result<()>;
}
