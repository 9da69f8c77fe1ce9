//! Instrument access: capability traits, serial discovery, drivers and mocks.
//!
//! - [`capabilities`] - `RotationStage` and `Spectrometer`, the seams the sweep uses
//! - [`discovery`] - resolve USB serial numbers to port paths
//! - [`apt`] - Thorlabs APT protocol (TDC001 driving a PRM1Z8 rotation mount)
//! - [`obp`] - Ocean binary protocol spectrometers
//! - [`mock`] - simulated devices for tests

pub mod apt;
pub mod capabilities;
pub mod discovery;
pub mod mock;
pub mod obp;

pub use capabilities::{RotationStage, Spectrometer, Spectrum};
