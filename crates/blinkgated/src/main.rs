use anyhow::{Context, Result};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod enrollment;
mod frames;
mod inference;
mod store;

use dbus_interface::{AppState, CheckInService};

const BUS_NAME: &str = "org.blinkgate.CheckIn1";
const OBJECT_PATH: &str = "/org/blinkgate/CheckIn1";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("blinkgated starting");

    let config = config::Config::load().context("failed to load configuration")?;
    tracing::info!(
        model_dir = %config.model_dir.display(),
        db_path = %config.db_path.display(),
        similarity_threshold = config.similarity_threshold,
        required_blinks = config.required_blinks,
        session_bus = config.session_bus,
        "configuration loaded"
    );

    let store = store::BiometricStore::open(&config.db_path)
        .await
        .with_context(|| format!("failed to open database {}", config.db_path.display()))?;

    // Model loading is CPU-heavy; keep it off the async workers
    let (detector_path, landmark_path, embedding_path) = (
        config.detector_model_path(),
        config.landmark_model_path(),
        config.embedding_model_path(),
    );
    let runtime = tokio::task::spawn_blocking(move || {
        inference::InferenceRuntime::load(&detector_path, &landmark_path, &embedding_path)
    })
    .await
    .context("model loader panicked")?
    .context("failed to load inference models (run `blinkgate setup`)")?;
    tracing::info!(
        embedding_version = runtime.embedding_version(),
        "models loaded"
    );

    let session_bus = config.session_bus;
    let state = Arc::new(AppState::new(
        config,
        store,
        runtime.landmarks.clone(),
        runtime.embedder.clone(),
    ));
    let service = CheckInService { state };

    let builder = if session_bus {
        tracing::warn!("running on the session bus (development mode)");
        zbus::connection::Builder::session()?
    } else {
        zbus::connection::Builder::system()?
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("failed to register on D-Bus")?;

    tracing::info!(bus = BUS_NAME, path = OBJECT_PATH, "blinkgated ready");

    // Keep running until signaled
    tokio::signal::ctrl_c().await?;
    tracing::info!("blinkgated shutting down");

    Ok(())
}
