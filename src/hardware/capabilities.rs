//! Capability traits for the two instruments a sweep drives.
//!
//! The measurement loop only sees these traits. Serial drivers implement them for real
//! hardware and the mocks in [`crate::hardware::mock`] implement them for tests.

use anyhow::Result;
use async_trait::async_trait;

/// One spectrometer capture.
///
/// `wavelengths` (nm) and `intensities` (counts) have the same length and are ordered by
/// wavelength.
#[derive(Debug, Clone, PartialEq)]
pub struct Spectrum {
    /// Wavelength axis in nanometers.
    pub wavelengths: Vec<f64>,
    /// Intensity per wavelength in counts.
    pub intensities: Vec<f64>,
}

impl Spectrum {
    /// Number of pixels in the capture.
    pub fn len(&self) -> usize {
        self.intensities.len()
    }

    /// True when the capture has no pixels.
    pub fn is_empty(&self) -> bool {
        self.intensities.is_empty()
    }
}

/// Motorized rotation mount holding the waveplate.
#[async_trait]
pub trait RotationStage: Send + Sync {
    /// Command an absolute move in degrees.
    ///
    /// Returns as soon as the command is sent. Callers wait for the mount to settle.
    async fn move_abs(&self, position_deg: f64) -> Result<()>;

    /// Position reported by the device, converted to degrees.
    async fn position(&self) -> Result<f64>;

    /// Whether the device still answers.
    async fn is_connected(&self) -> bool;
}

/// Spectrometer returning a full wavelength/intensity capture.
#[async_trait]
pub trait Spectrometer: Send + Sync {
    /// Set the exposure length in milliseconds.
    async fn set_integration_time(&self, millis: f64) -> Result<()>;

    /// Capture one spectrum.
    async fn spectrum(&self) -> Result<Spectrum>;
}
