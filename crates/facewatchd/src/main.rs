use anyhow::{Context, Result};
use facewatch_core::{
    spawn_controller, Canvas, Capabilities, FsImageStore, OnnxModels, SharedOverlay,
};
use facewatch_hw::V4lCapture;
use std::sync::{Arc, Mutex};
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;

use config::Config;
use dbus_interface::{FacewatchService, BUS_NAME, OBJECT_PATH};

fn build_canvas(config: &Config) -> Canvas {
    let canvas = Canvas::new(config.geometry());
    let Some(path) = &config.font_path else {
        return canvas;
    };
    let font = std::fs::read(path)
        .map_err(anyhow::Error::from)
        .and_then(|bytes| ab_glyph::FontVec::try_from_vec(bytes).map_err(anyhow::Error::from));
    match font {
        Ok(font) => canvas.with_font(font),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "font unusable; labels drawn without text");
            canvas
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::load(None).context("loading configuration")?;
    tracing::info!(
        camera = %config.camera_device,
        models = %config.model_dir.display(),
        images = %config.image_dir.display(),
        labels = config.labels.len(),
        profile = %config.detector_profile,
        "facewatchd starting"
    );
    if config.labels.is_empty() {
        tracing::warn!("no identity labels configured; every face will be unknown");
    }

    let canvas = Arc::new(Mutex::new(build_canvas(&config)));
    let overlay: SharedOverlay = canvas.clone();
    let caps = Capabilities {
        models: Arc::new(OnnxModels::new()),
        capture: Arc::new(V4lCapture::new(config.camera_device.clone())),
        images: Arc::new(FsImageStore::new(config.image_dir.clone())),
        overlay,
    };
    let controller_config = config.controller_config();
    let pipeline = controller_config.pipeline.clone();
    let controller = spawn_controller(caps, controller_config);

    let service = FacewatchService {
        controller: controller.clone(),
        canvas,
        pipeline,
    };
    let connection = zbus::connection::Builder::session()?
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("registering on the session bus")?;

    let iface = connection
        .object_server()
        .interface::<_, FacewatchService>(OBJECT_PATH)
        .await?;
    let mut states = controller.subscribe_state();
    tokio::spawn(async move {
        while states.changed().await.is_ok() {
            let state = *states.borrow_and_update();
            if let Err(e) = FacewatchService::state_changed(iface.signal_emitter(), state.as_str()).await {
                tracing::warn!(error = %e, "failed to emit StateChanged");
            }
        }
    });

    tracing::info!(bus = BUS_NAME, path = OBJECT_PATH, "facewatchd ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("facewatchd shutting down");
    controller.stop().await?;

    Ok(())
}
