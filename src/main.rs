//! Waveplate sweep: rotate a motorized waveplate through a range of angles and record a
//! spectrum at every position.
//!
//! ```bash
//! waveplate_sweep --motor_serial 83836244 --spectrometer_serial FLMS01234 \
//!     --initial_angle 0 --final_angle 90 --step 5 --wait 5 \
//!     --spectrometer_integration_time 100 --path data/ --fname run1.txt
//! ```
//!
//! Set `RUST_LOG` to change verbosity (default `debug`).

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;
use waveplate_sweep::config::{SweepArgs, SweepConfig};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")),
        )
        .init();

    let config = SweepConfig::load(SweepArgs::parse())?;
    info!("Output file: {}", config.output_path().display());

    run(&config).await?;
    println!("Data collection finished");
    Ok(())
}

#[cfg(feature = "instrument_serial")]
async fn run(config: &SweepConfig) -> Result<()> {
    use waveplate_sweep::experiment::{run_experiment, ConsolePrompt, SerialDevices};

    let summary = run_experiment(
        config,
        &mut SerialDevices::default(),
        &mut ConsolePrompt::new(),
    )
    .await?;
    info!(
        "Recorded {} angles x {} pixels to '{}'",
        summary.angles.len(),
        summary.pixels,
        summary.output.display()
    );
    Ok(())
}

#[cfg(not(feature = "instrument_serial"))]
async fn run(_config: &SweepConfig) -> Result<()> {
    Err(waveplate_sweep::error::SweepError::SerialFeatureDisabled.into())
}
