//! Demo binary: records a fixed-length film from the mock camera.

use anyhow::Result;
use clap::Parser;
use scope_daq::acquisition::{AcquisitionController, AcquisitionEvent};
use scope_daq::config::Settings;
use scope_daq::core::{FilmSettings, SessionKey};
use scope_daq::data::DaxWriter;
use scope_daq::instrument::mock::MockCamera;
use scope_daq::properties::{CameraConfig, CameraGeometry, PropertyMap};
use std::path::PathBuf;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "scope_daq",
    about = "Acquisition control core for laboratory microscopy instruments",
    version
)]
struct Cli {
    /// Path to a TOML settings file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of frames to record.
    #[arg(long, default_value_t = 50)]
    frames: u64,

    /// Output film path (a .inf metadata sidecar is written alongside).
    #[arg(long)]
    output: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let settings = Settings::new(cli.config.as_deref())?;

    let output = cli
        .output
        .unwrap_or_else(|| settings.storage.default_path.join("film_0001.dax"));
    let sink = DaxWriter::create(&output)?;

    let camera = MockCamera::new(512, 512);
    let mut controller = AcquisitionController::new(Box::new(camera), settings.camera.clone());

    let mut properties = PropertyMap::new();
    properties.insert("exposure_time", 0.01);
    let config = CameraConfig {
        geometry: CameraGeometry::full_sensor(512, 512),
        properties,
        film: FilmSettings::fixed_length(cli.frames),
    };

    if !controller.configure(config, Some(Box::new(sink))).await {
        let reason = controller
            .last_error()
            .await
            .unwrap_or_else(|| "unknown".to_string());
        anyhow::bail!("camera configuration failed: {reason}");
    }

    let mut events = controller.subscribe();
    let key = SessionKey::new();
    controller.start(key).await?;

    let mut received = 0u64;
    loop {
        match events.recv().await {
            Ok(AcquisitionEvent::NewFrames { frames, .. }) => {
                received += frames.len() as u64;
                info!(frames = received, "received frame batch");
            }
            Ok(AcquisitionEvent::LimitReached { .. }) => {
                info!("film complete");
                break;
            }
            Ok(AcquisitionEvent::DeviceFault { .. }) => {
                anyhow::bail!("device fault during film");
            }
            Ok(AcquisitionEvent::SinkError { message, .. }) => {
                anyhow::bail!("film sink failed: {message}");
            }
            Err(RecvError::Lagged(missed)) => {
                warn!(missed, "event stream lagged");
            }
            Err(RecvError::Closed) => break,
        }
    }

    controller.stop().await?;
    controller.shutdown().await?;
    info!(path = %output.display(), "film written");
    Ok(())
}
