//! Camera pipeline HTTP service

use std::path::PathBuf;
use std::sync::Arc;

use campipe::capture::{SyntheticMode, SyntheticSensor, V4l2Sensor};
use campipe::settings::{CameraSettings, JsonFileStore, MemoryStore, SettingsStore};
use campipe::{http, Config, PipelineController, Sensor, SensorBackend};
use clap::Parser;
use color_eyre::Result;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "campipe")]
#[command(about = "Camera frame pipeline with snapshot and MJPEG stream endpoints", long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on, overrides the config file
    #[arg(short, long)]
    bind: Option<String>,

    /// Use the synthetic test-pattern sensor instead of V4L2
    #[arg(long)]
    synthetic: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("campipe=info")),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("campipe launching...");

    let args = Args::parse();
    let mut config = Config::load(args.config.as_deref())?;
    if args.synthetic {
        config.capture.backend = SensorBackend::Synthetic;
    }
    if let Some(bind) = args.bind {
        config.http.bind = bind;
    }

    let sensor: Box<dyn Sensor> = match config.capture.backend {
        SensorBackend::V4l2 => Box::new(V4l2Sensor::new(config.capture.clone())),
        SensorBackend::Synthetic => Box::new(SyntheticSensor::new(SyntheticMode::Jpeg, 25)),
    };
    info!("Using {:?} sensor", config.capture.backend);

    let store: Arc<dyn SettingsStore> = match &config.storage.settings_path {
        Some(path) => {
            info!("Persisting settings to {}", path.display());
            Arc::new(JsonFileStore::open(path)?)
        }
        None => Arc::new(MemoryStore::new()),
    };

    let defaults = CameraSettings {
        framesize: config.capture.framesize,
        ..CameraSettings::default()
    };
    let pipeline = Arc::new(PipelineController::new(
        config.pipeline.clone(),
        sensor,
        config.capture.buffer_count as usize,
        defaults,
        store,
    ));

    // A camera that fails to come up leaves the API reachable for status and retries
    let bring_up = {
        let pipeline = Arc::clone(&pipeline);
        tokio::task::spawn_blocking(move || pipeline.init().and_then(|_| pipeline.start()))
    };
    match bring_up.await? {
        Ok(()) => info!("Camera pipeline started"),
        Err(e) => warn!("Camera pipeline not running: {}", e),
    }

    let app = http::router(Arc::clone(&pipeline), &config.http.base_path);
    let listener = tokio::net::TcpListener::bind(&config.http.bind).await?;
    info!(
        "Listening on http://{}{}",
        listener.local_addr()?,
        config.http.base_path
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(Arc::clone(&pipeline)))
        .await?;

    tokio::task::spawn_blocking(move || pipeline.shutdown()).await?;
    info!("campipe shutting down");
    Ok(())
}

/// Resolves on Ctrl-C, after stopping capture so open streams end and the
/// server can drain its connections.
async fn shutdown_signal(pipeline: Arc<PipelineController>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");

    let stopped = tokio::task::spawn_blocking(move || {
        if pipeline.is_started() {
            pipeline.stop()
        } else {
            Ok(())
        }
    })
    .await;
    match stopped {
        Ok(Err(e)) => warn!("Stopping pipeline failed: {}", e),
        Err(e) => error!("Stop task failed: {}", e),
        Ok(Ok(())) => {}
    }
}
