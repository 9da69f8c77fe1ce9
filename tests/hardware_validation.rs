//! Hardware Validation Tests
//!
//! Tests for a PRM1Z8 rotation mount on a TDC001 controller and an OBP spectrometer.
//! Serial numbers come from `WAVEPLATE_MOTOR_SERIAL` and `WAVEPLATE_SPECTROMETER_SERIAL`.
//!
//! Run with: cargo test --features hardware_tests --test hardware_validation -- --nocapture --test-threads=1
//!
//! SAFETY: These tests move physical hardware. Ensure no obstructions before running.

#![cfg(all(feature = "hardware_tests", feature = "instrument_serial"))]

use anyhow::{Context, Result};
use std::time::Duration;
use tokio::time::sleep;
use waveplate_sweep::experiment::{DeviceProvider, SerialDevices};
use waveplate_sweep::hardware::{RotationStage, Spectrometer};

const POSITION_TOLERANCE_DEG: f64 = 0.2;

fn serial(var: &str) -> Result<String> {
    std::env::var(var).with_context(|| format!("{var} is not set"))
}

// =============================================================================
// Rotation mount
// =============================================================================

#[tokio::test]
async fn test_motor_moves_and_reports_position() -> Result<()> {
    let mut devices = SerialDevices::default();
    let motor = devices
        .connect_stage(&serial("WAVEPLATE_MOTOR_SERIAL")?)
        .await?;
    assert!(motor.is_connected().await);

    for target in [10.0, 0.0] {
        motor.move_abs(target).await?;
        sleep(Duration::from_secs(5)).await;
        let position = motor.position().await?;
        println!("Commanded {target:.2} deg, reported {position:.3} deg");
        assert!(
            (position - target).abs() <= POSITION_TOLERANCE_DEG,
            "Motor at {position} instead of {target}"
        );
    }
    Ok(())
}

// =============================================================================
// Spectrometer
// =============================================================================

#[tokio::test]
async fn test_spectrometer_captures_consistent_axis() -> Result<()> {
    let mut devices = SerialDevices::default();
    let spectrometer = devices
        .connect_spectrometer(&serial("WAVEPLATE_SPECTROMETER_SERIAL")?)
        .await?;

    spectrometer.set_integration_time(50.0).await?;
    sleep(Duration::from_secs(2)).await;

    let first = spectrometer.spectrum().await?;
    let second = spectrometer.spectrum().await?;
    println!(
        "{} pixels, {:.2} nm to {:.2} nm",
        first.len(),
        first.wavelengths.first().copied().unwrap_or_default(),
        first.wavelengths.last().copied().unwrap_or_default()
    );

    assert!(!first.is_empty());
    assert_eq!(first.wavelengths, second.wavelengths);
    Ok(())
}
