//! Custom error types for the application.
//!
//! This module defines the primary error type, `SweepError`, for the whole sweep. Using
//! the `thiserror` crate, it provides a centralized and consistent way to report every
//! condition that ends a run, from a bad command line to a waveplate that did not arrive
//! where it was sent.
//!
//! ## Error Hierarchy
//!
//! `SweepError` groups failures by the stage that detects them:
//!
//! - **Configuration**: `Config` (missing or invalid values, unreadable config file) and
//!   `OutputExists` (the output file is never overwritten).
//! - **Discovery**: `Discovery`, raised when serial devices cannot be listed or the motor
//!   serial number is not among them.
//! - **Connection**: `Connection`, raised when the motor or spectrometer cannot be opened.
//! - **Runtime integrity**: `MotorDisconnected`, `Drift` and `SpectralRangeChanged`, raised
//!   inside the sweep. Rows already written stay on disk.
//!
//! None of these are recovered from. The binary prints the message and exits non-zero.

use std::path::PathBuf;
use thiserror::Error;

use crate::config::ConfigError;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, SweepError>;

/// Every way a sweep session can fail.
#[derive(Error, Debug)]
pub enum SweepError {
    /// Configuration could not be loaded or failed validation.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The output file already exists.
    #[error("The selected file name already exists: {}", .0.display())]
    OutputExists(PathBuf),

    /// Serial device enumeration failed or the motor was not found.
    #[error("Discovery error: {0}")]
    Discovery(String),

    /// A device could not be opened.
    #[error("Connection error: {0}")]
    Connection(String),

    /// A device stopped answering or returned garbage after it was opened.
    #[error("Instrument error: {0}")]
    Instrument(String),

    /// The motor stopped responding during the sweep.
    #[error("Polarizer connection lost, ending collection")]
    MotorDisconnected,

    /// The motor reported a position outside the tolerance around the commanded angle.
    #[error(
        "polarizer has drifted from desired values, ending collection \
         (commanded {commanded:.3} deg, reported {reported:.3} deg)"
    )]
    Drift {
        /// Angle sent to the motor, degrees.
        commanded: f64,
        /// Angle the motor reported after settling, degrees.
        reported: f64,
    },

    /// A capture's wavelength axis differs from the background's.
    #[error("spectrometer has collected a different spectral range at {angle:.3} deg, ending collection")]
    SpectralRangeChanged {
        /// Angle at which the mismatching capture was taken, degrees.
        angle: f64,
    },

    /// Standard input closed while waiting for the operator.
    #[error("Operator input closed before confirmation")]
    PromptClosed,

    /// File system failure while writing results.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serial support was compiled out.
    #[error("Serial support not enabled. Rebuild with --features instrument_serial")]
    SerialFeatureDisabled,
}

impl SweepError {
    /// Wraps a driver failure, keeping the full `anyhow` context chain in the message.
    pub fn instrument(err: anyhow::Error) -> Self {
        Self::Instrument(format!("{err:#}"))
    }

    /// Wraps a failure to open a device.
    pub fn connection(err: anyhow::Error) -> Self {
        Self::Connection(format!("{err:#}"))
    }
}
