//! One complete sweep session, from output file to the last spectrum.

use async_trait::async_trait;
use chrono::Local;
use std::path::PathBuf;
use tracing::{info, warn};

use crate::config::SweepConfig;
use crate::data::SpectrumWriter;
use crate::error::AppResult;
use crate::experiment::prompt::Operator;
use crate::experiment::sweep::{Sweep, SweepSettings};
use crate::hardware::{RotationStage, Spectrometer};

/// Opens the instruments a session needs.
#[async_trait]
pub trait DeviceProvider: Send {
    /// Rotation mount type.
    type Stage: RotationStage;
    /// Spectrometer type.
    type Spectrometer: Spectrometer;

    /// Find and open the motor controller with USB serial number `serial`.
    async fn connect_stage(&mut self, serial: &str) -> AppResult<Self::Stage>;

    /// Find and open the spectrometer with serial number `serial`.
    async fn connect_spectrometer(&mut self, serial: &str) -> AppResult<Self::Spectrometer>;
}

/// What a finished session produced.
#[derive(Debug, Clone, PartialEq)]
pub struct SweepSummary {
    /// File the data was written to.
    pub output: PathBuf,
    /// Angles measured, in order.
    pub angles: Vec<f64>,
    /// Pixels per spectrum.
    pub pixels: usize,
}

/// Run a whole session for `config`.
///
/// The output file is created before any device is touched, so an existing file ends the
/// session without side effects. On any later failure the file keeps what was written.
pub async fn run_experiment<D, O>(
    config: &SweepConfig,
    devices: &mut D,
    operator: &mut O,
) -> AppResult<SweepSummary>
where
    D: DeviceProvider,
    O: Operator,
{
    let output = config.output_path();
    let mut writer = SpectrumWriter::create(&output)?;
    writer.write_header(&Local::now())?;

    info!("Connecting to motor {}", config.motor_serial);
    let stage = devices.connect_stage(&config.motor_serial).await?;
    info!("Connecting to spectrometer {}", config.spectrometer_serial);
    let spectrometer = devices
        .connect_spectrometer(&config.spectrometer_serial)
        .await?;

    let sweep = Sweep::new(
        config.angles(),
        SweepSettings::from_config(config),
        stage,
        spectrometer,
    );
    info!(
        "Sweeping {} angles from {} to {} deg",
        sweep.angles().len(),
        config.initial_angle,
        config.final_angle
    );

    let report = match sweep.run(&mut writer, operator).await {
        Ok(report) => report,
        Err(e) => {
            warn!(
                "Sweep stopped with {} intensity blocks kept in '{}'",
                writer.intensity_blocks(),
                writer.path().display()
            );
            return Err(e);
        }
    };
    writer.finish()?;

    Ok(SweepSummary {
        output,
        angles: report.angles,
        pixels: report.pixels,
    })
}

#[cfg(feature = "instrument_serial")]
pub use serial::SerialDevices;

#[cfg(feature = "instrument_serial")]
mod serial {
    use super::*;
    use crate::error::SweepError;
    use crate::hardware::apt::AptMotor;
    use crate::hardware::discovery::{list_devices, resolve_motor_port, resolve_port, SerialDevice};
    use crate::hardware::obp::ObpSpectrometer;
    use tokio_serial::SerialStream;

    /// Opens the APT motor controller and OBP spectrometer on local serial ports.
    ///
    /// Ports are enumerated once and reused for both devices.
    #[derive(Debug, Default)]
    pub struct SerialDevices {
        devices: Option<Vec<SerialDevice>>,
    }

    impl SerialDevices {
        fn devices(&mut self) -> AppResult<&[SerialDevice]> {
            if self.devices.is_none() {
                self.devices = Some(list_devices()?);
            }
            Ok(self.devices.as_deref().unwrap_or_default())
        }
    }

    #[async_trait]
    impl DeviceProvider for SerialDevices {
        type Stage = AptMotor<SerialStream>;
        type Spectrometer = ObpSpectrometer<SerialStream>;

        async fn connect_stage(&mut self, serial: &str) -> AppResult<Self::Stage> {
            let port = resolve_motor_port(self.devices()?, serial)?.to_string();
            let motor = AptMotor::open(&port)
                .await
                .map_err(SweepError::connection)?;
            info!("Motor {serial} connected on {port}");
            Ok(motor)
        }

        async fn connect_spectrometer(&mut self, serial: &str) -> AppResult<Self::Spectrometer> {
            let port = resolve_port(self.devices()?, serial)
                .map(str::to_string)
                .ok_or_else(|| {
                    SweepError::Connection(format!(
                        "cannot make connection to spectrometer (serial {serial} not found)"
                    ))
                })?;
            let spectrometer = ObpSpectrometer::open(&port, serial)
                .await
                .map_err(|e| {
                    SweepError::Connection(format!("cannot make connection to spectrometer: {e:#}"))
                })?;
            info!("Spectrometer {serial} connected on {port}");
            Ok(spectrometer)
        }
    }
}
