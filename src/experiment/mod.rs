//! Sweep orchestration.
//!
//! - `angles`: the target angle sequence and tolerance comparisons
//! - `prompt`: operator confirmations
//! - `sweep`: the measurement loop over a rotation stage and a spectrometer
//! - `session`: output file, device connection and the sweep, end to end
//!
//! # Example
//!
//! ```rust,ignore
//! use waveplate_sweep::experiment::{run_experiment, ConsolePrompt, SerialDevices};
//!
//! let config = SweepConfig::load(SweepArgs::parse())?;
//! let summary = run_experiment(&config, &mut SerialDevices::default(), &mut ConsolePrompt::new()).await?;
//! ```

pub mod angles;
pub mod prompt;
pub mod session;
pub mod sweep;

pub use prompt::{AutoConfirm, ConsolePrompt, Operator};
#[cfg(feature = "instrument_serial")]
pub use session::SerialDevices;
pub use session::{run_experiment, DeviceProvider, SweepSummary};
pub use sweep::{Sweep, SweepReport, SweepSettings};
