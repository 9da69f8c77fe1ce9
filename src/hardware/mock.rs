//! Mock Hardware Implementations
//!
//! Provides simulated devices for testing the sweep without physical hardware.
//! Both mocks are cheap to clone and share their state, so a test can hand one clone to
//! the sweep and inspect the other afterwards.
//!
//! # Available Mocks
//!
//! - `MockRotator` - rotation mount with optional drift and connection loss
//! - `MockSpectrometer` - spectrometer with a fixed linear wavelength axis

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::hardware::capabilities::{RotationStage, Spectrometer, Spectrum};

// =============================================================================
// MockRotator - Simulated Rotation Mount
// =============================================================================

#[derive(Debug, Default)]
struct RotatorState {
    position: f64,
    moves: Vec<f64>,
    /// (moves before drift starts, offset added to the reported position)
    drift: Option<(usize, f64)>,
    /// Number of successful connectivity checks before the link drops
    connected_checks: Option<usize>,
    checks: usize,
}

/// Mock rotation mount
///
/// Moves are instantaneous. The reported position equals the commanded one unless a
/// drift is configured.
///
/// # Example
///
/// ```rust,ignore
/// let rotator = MockRotator::new().with_drift(2, 0.5);
/// rotator.move_abs(10.0).await?;
/// assert_eq!(rotator.position().await?, 10.0);
/// ```
#[derive(Debug, Clone, Default)]
pub struct MockRotator {
    state: Arc<RwLock<RotatorState>>,
}

impl MockRotator {
    /// Create a mock mount at 0 degrees
    pub fn new() -> Self {
        Self::default()
    }

    /// Report positions off by `offset_deg` from move number `after_moves` (0-based) on
    pub fn with_drift(self, after_moves: usize, offset_deg: f64) -> Self {
        if let Ok(mut state) = self.state.try_write() {
            state.drift = Some((after_moves, offset_deg));
        }
        self
    }

    /// Answer `checks` connectivity checks, then report the link as lost
    pub fn disconnect_after(self, checks: usize) -> Self {
        if let Ok(mut state) = self.state.try_write() {
            state.connected_checks = Some(checks);
        }
        self
    }

    /// Every commanded angle, in order
    pub async fn moves(&self) -> Vec<f64> {
        self.state.read().await.moves.clone()
    }
}

#[async_trait]
impl RotationStage for MockRotator {
    async fn move_abs(&self, position_deg: f64) -> Result<()> {
        let mut state = self.state.write().await;
        let reported = match state.drift {
            Some((after, offset)) if state.moves.len() >= after => position_deg + offset,
            _ => position_deg,
        };
        state.moves.push(position_deg);
        state.position = reported;
        debug!("MockRotator: moved to {position_deg:.2} deg");
        Ok(())
    }

    async fn position(&self) -> Result<f64> {
        Ok(self.state.read().await.position)
    }

    async fn is_connected(&self) -> bool {
        let mut state = self.state.write().await;
        state.checks += 1;
        match state.connected_checks {
            Some(limit) => state.checks <= limit,
            None => true,
        }
    }
}

// =============================================================================
// MockSpectrometer - Simulated Spectrometer
// =============================================================================

#[derive(Debug, Default)]
struct SpectrometerState {
    integration_time_ms: Option<f64>,
    /// Failures to return from the next calls to `set_integration_time`
    integration_failures: usize,
    integration_calls: usize,
    captures: usize,
    /// (capture number, nm added to the wavelength axis from that capture on)
    axis_shift: Option<(usize, f64)>,
}

/// Mock spectrometer
///
/// Returns `pixels` points on a 0.5 nm grid starting at 400 nm. Intensities encode the
/// capture number so tests can tell the blocks in the output file apart: capture `n`,
/// pixel `p` has `1000 * n + p` counts.
#[derive(Debug, Clone)]
pub struct MockSpectrometer {
    pixels: usize,
    state: Arc<RwLock<SpectrometerState>>,
}

impl MockSpectrometer {
    /// Create a mock spectrometer with `pixels` pixels
    pub fn new(pixels: usize) -> Self {
        Self {
            pixels,
            state: Arc::new(RwLock::new(SpectrometerState::default())),
        }
    }

    /// Fail the first `times` integration time requests
    pub fn failing_integration_time(self, times: usize) -> Self {
        if let Ok(mut state) = self.state.try_write() {
            state.integration_failures = times;
        }
        self
    }

    /// Shift the wavelength axis by `shift_nm` from capture number `capture` (0-based)
    pub fn with_axis_shift(self, capture: usize, shift_nm: f64) -> Self {
        if let Ok(mut state) = self.state.try_write() {
            state.axis_shift = Some((capture, shift_nm));
        }
        self
    }

    /// Spectra captured so far
    pub async fn captures(&self) -> usize {
        self.state.read().await.captures
    }

    /// Calls made to `set_integration_time`, failed ones included
    pub async fn integration_calls(&self) -> usize {
        self.state.read().await.integration_calls
    }

    /// Integration time currently applied
    pub async fn integration_time_ms(&self) -> Option<f64> {
        self.state.read().await.integration_time_ms
    }
}

impl Default for MockSpectrometer {
    fn default() -> Self {
        Self::new(16)
    }
}

#[async_trait]
impl Spectrometer for MockSpectrometer {
    async fn set_integration_time(&self, millis: f64) -> Result<()> {
        let mut state = self.state.write().await;
        state.integration_calls += 1;
        if state.integration_failures > 0 {
            state.integration_failures -= 1;
            bail!("MockSpectrometer: device busy");
        }
        state.integration_time_ms = Some(millis);
        Ok(())
    }

    async fn spectrum(&self) -> Result<Spectrum> {
        let mut state = self.state.write().await;
        let capture = state.captures;
        state.captures += 1;

        let shift = match state.axis_shift {
            Some((from, shift_nm)) if capture >= from => shift_nm,
            _ => 0.0,
        };

        let wavelengths = (0..self.pixels)
            .map(|p| 400.0 + 0.5 * p as f64 + shift)
            .collect();
        let intensities = (0..self.pixels)
            .map(|p| (1000 * capture + p) as f64)
            .collect();

        debug!("MockSpectrometer: capture #{capture}");
        Ok(Spectrum {
            wavelengths,
            intensities,
        })
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_rotator_absolute_move() {
        let rotator = MockRotator::new();
        assert_eq!(rotator.position().await.unwrap(), 0.0);

        rotator.move_abs(10.0).await.unwrap();
        assert_eq!(rotator.position().await.unwrap(), 10.0);

        rotator.move_abs(25.0).await.unwrap();
        assert_eq!(rotator.moves().await, vec![10.0, 25.0]);
    }

    #[tokio::test]
    async fn test_mock_rotator_drift_starts_after_moves() {
        let rotator = MockRotator::new().with_drift(1, 0.5);

        rotator.move_abs(10.0).await.unwrap();
        assert_eq!(rotator.position().await.unwrap(), 10.0);

        rotator.move_abs(20.0).await.unwrap();
        assert_eq!(rotator.position().await.unwrap(), 20.5);
    }

    #[tokio::test]
    async fn test_mock_rotator_disconnects() {
        let rotator = MockRotator::new().disconnect_after(2);
        assert!(rotator.is_connected().await);
        assert!(rotator.is_connected().await);
        assert!(!rotator.is_connected().await);
    }

    #[tokio::test]
    async fn test_mock_spectrometer_encodes_capture_number() {
        let spectrometer = MockSpectrometer::new(4);
        let first = spectrometer.spectrum().await.unwrap();
        let second = spectrometer.spectrum().await.unwrap();

        assert_eq!(first.wavelengths, vec![400.0, 400.5, 401.0, 401.5]);
        assert_eq!(first.intensities, vec![0.0, 1.0, 2.0, 3.0]);
        assert_eq!(second.intensities[0], 1000.0);
        assert_eq!(spectrometer.captures().await, 2);
    }

    #[tokio::test]
    async fn test_mock_spectrometer_integration_failures() {
        let spectrometer = MockSpectrometer::new(4).failing_integration_time(1);
        assert!(spectrometer.set_integration_time(50.0).await.is_err());
        assert!(spectrometer.set_integration_time(50.0).await.is_ok());
        assert_eq!(spectrometer.integration_calls().await, 2);
        assert_eq!(spectrometer.integration_time_ms().await, Some(50.0));
    }

    #[tokio::test]
    async fn test_mock_spectrometer_axis_shift() {
        let spectrometer = MockSpectrometer::new(2).with_axis_shift(1, 2.0);
        assert_eq!(spectrometer.spectrum().await.unwrap().wavelengths[0], 400.0);
        assert_eq!(spectrometer.spectrum().await.unwrap().wavelengths[0], 402.0);
    }
}
