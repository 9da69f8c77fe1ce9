//! The measurement loop.
//!
//! A sweep is strictly sequential:
//!
//! 1. Move to the first angle and settle
//! 2. Apply the integration time (one retry allowed) and let the detector settle
//! 3. After operator confirmation, capture the background and write the wavelength axis
//!    and background intensities
//! 4. After a second confirmation, for every angle: check the motor link, move, settle,
//!    verify the reported position, capture, verify the wavelength axis, append
//!
//! Any failed check ends the whole run. Nothing is retried inside the loop and blocks
//! already written stay in the file.

use std::io::Write;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info};

use crate::config::{ConfigError, SweepConfig};
use crate::data::SpectrumWriter;
use crate::error::{AppResult, SweepError};
use crate::error_recovery::RetryPolicy;
use crate::experiment::angles::{all_close, is_close};
use crate::experiment::prompt::Operator;
use crate::hardware::{RotationStage, Spectrometer, Spectrum};

/// Largest accepted difference between commanded and reported angle.
pub const DRIFT_TOLERANCE_DEG: f64 = 0.2;

/// Pause after changing the integration time before the first capture.
pub const SPECTROMETER_SETTLE: Duration = Duration::from_secs(2);

/// Relative tolerance for comparing wavelength axes.
pub const WAVELENGTH_RTOL: f64 = 1e-5;

/// Absolute tolerance (nm) for comparing wavelength axes.
pub const WAVELENGTH_ATOL: f64 = 1e-8;

/// Prompt shown before the background capture.
pub const BACKGROUND_PROMPT: &str = "press enter to capture background";

/// Prompt shown before the sweep starts.
pub const START_PROMPT: &str = "Press enter to begin collecting data...";

/// Timing and tolerances of one sweep.
#[derive(Debug, Clone, PartialEq)]
pub struct SweepSettings {
    /// Wait after every move, the initial one included.
    pub settle: Duration,
    /// Wait after setting the integration time.
    pub spectrometer_settle: Duration,
    /// Spectrometer integration time (milliseconds).
    pub integration_time_ms: f64,
    /// Accepted |commanded - reported| in degrees.
    pub drift_tolerance_deg: f64,
    /// Attempts allowed when setting the integration time.
    pub integration_retry: RetryPolicy,
}

impl SweepSettings {
    /// Settings for `config` with the standard tolerances.
    pub fn from_config(config: &SweepConfig) -> Self {
        Self {
            settle: config.wait,
            spectrometer_settle: SPECTROMETER_SETTLE,
            integration_time_ms: config.integration_time_ms,
            drift_tolerance_deg: DRIFT_TOLERANCE_DEG,
            integration_retry: RetryPolicy::single_retry(),
        }
    }
}

/// Outcome of a completed sweep.
#[derive(Debug, Clone, PartialEq)]
pub struct SweepReport {
    /// Angles measured, in order.
    pub angles: Vec<f64>,
    /// Pixels per spectrum.
    pub pixels: usize,
}

/// One configured sweep over a rotation stage and a spectrometer.
pub struct Sweep<M, S> {
    angles: Vec<f64>,
    settings: SweepSettings,
    stage: M,
    spectrometer: S,
}

impl<M, S> Sweep<M, S>
where
    M: RotationStage,
    S: Spectrometer,
{
    /// Sweep `angles` in order with the given devices.
    pub fn new(angles: Vec<f64>, settings: SweepSettings, stage: M, spectrometer: S) -> Self {
        Self {
            angles,
            settings,
            stage,
            spectrometer,
        }
    }

    /// Target angles, in order.
    pub fn angles(&self) -> &[f64] {
        &self.angles
    }

    /// Capture the background, then measure every angle, writing as it goes.
    pub async fn run<W, O>(
        &self,
        writer: &mut SpectrumWriter<W>,
        operator: &mut O,
    ) -> AppResult<SweepReport>
    where
        W: Write,
        O: Operator,
    {
        let Some(&start) = self.angles.first() else {
            return Err(ConfigError::Validation("angle sequence is empty".to_string()).into());
        };

        let background = self.capture_background(start, writer, operator).await?;

        operator.confirm(START_PROMPT).await?;
        for (index, &angle) in self.angles.iter().enumerate() {
            let spectrum = self.measure(angle, &background).await?;
            writer.write_intensities(&spectrum.intensities)?;
            debug!("Angle {}/{} written", index + 1, self.angles.len());
        }

        Ok(SweepReport {
            angles: self.angles.clone(),
            pixels: background.len(),
        })
    }

    async fn capture_background<W, O>(
        &self,
        start: f64,
        writer: &mut SpectrumWriter<W>,
        operator: &mut O,
    ) -> AppResult<Spectrum>
    where
        W: Write,
        O: Operator,
    {
        info!("time to collect background!");
        self.stage
            .move_abs(start)
            .await
            .map_err(SweepError::instrument)?;
        sleep(self.settings.settle).await;

        let millis = self.settings.integration_time_ms;
        self.settings
            .integration_retry
            .run("set integration time", || {
                self.spectrometer.set_integration_time(millis)
            })
            .await
            .map_err(SweepError::instrument)?;
        sleep(self.settings.spectrometer_settle).await;

        operator.confirm(BACKGROUND_PROMPT).await?;
        let background = self
            .spectrometer
            .spectrum()
            .await
            .map_err(SweepError::instrument)?;
        info!("Background captured ({} pixels)", background.len());

        writer.write_wavelengths(&background.wavelengths)?;
        writer.write_background(&background.intensities)?;
        Ok(background)
    }

    /// Move to `angle`, verify it arrived, and capture a spectrum on the background's axis.
    async fn measure(&self, angle: f64, background: &Spectrum) -> AppResult<Spectrum> {
        if !self.stage.is_connected().await {
            return Err(SweepError::MotorDisconnected);
        }

        self.stage
            .move_abs(angle)
            .await
            .map_err(SweepError::instrument)?;
        info!("moving to {angle} deg");
        sleep(self.settings.settle).await;

        let reported = self
            .stage
            .position()
            .await
            .map_err(SweepError::instrument)?;
        if !is_close(reported, angle, 0.0, self.settings.drift_tolerance_deg) {
            return Err(SweepError::Drift {
                commanded: angle,
                reported,
            });
        }

        info!("collecting");
        let spectrum = self
            .spectrometer
            .spectrum()
            .await
            .map_err(SweepError::instrument)?;

        if !all_close(
            &spectrum.wavelengths,
            &background.wavelengths,
            WAVELENGTH_RTOL,
            WAVELENGTH_ATOL,
        ) {
            return Err(SweepError::SpectralRangeChanged { angle });
        }
        Ok(spectrum)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::prompt::AutoConfirm;
    use crate::hardware::mock::{MockRotator, MockSpectrometer};
    use tracing_test::traced_test;

    fn settings() -> SweepSettings {
        SweepSettings {
            settle: Duration::from_secs(5),
            spectrometer_settle: SPECTROMETER_SETTLE,
            integration_time_ms: 100.0,
            drift_tolerance_deg: DRIFT_TOLERANCE_DEG,
            integration_retry: RetryPolicy::single_retry(),
        }
    }

    fn text(writer: SpectrumWriter<Vec<u8>>) -> String {
        String::from_utf8(writer.finish().unwrap()).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_sweep_writes_background_then_each_angle() {
        let rotator = MockRotator::new();
        let spectrometer = MockSpectrometer::new(4);
        let sweep = Sweep::new(
            vec![0.0, 5.0, 10.0],
            settings(),
            rotator.clone(),
            spectrometer.clone(),
        );
        let mut writer = SpectrumWriter::new("mem", Vec::new());
        let mut operator = AutoConfirm::default();

        let report = sweep.run(&mut writer, &mut operator).await.unwrap();

        assert_eq!(report.angles, vec![0.0, 5.0, 10.0]);
        assert_eq!(report.pixels, 4);
        assert_eq!(writer.intensity_blocks(), 4);
        // initial move, then one move per angle
        assert_eq!(rotator.moves().await, vec![0.0, 0.0, 5.0, 10.0]);
        assert_eq!(spectrometer.captures().await, 4);
        assert_eq!(spectrometer.integration_time_ms().await, Some(100.0));
        assert_eq!(operator.prompts, vec![BACKGROUND_PROMPT, START_PROMPT]);

        let output = text(writer);
        assert_eq!(output.matches("Wavelengths (nm)").count(), 1);
        assert_eq!(output.matches("Background (counts)").count(), 1);
        // header lines + 4 wavelengths + 4 background + 3 * 4 sweep values
        assert_eq!(output.lines().count(), 2 + 4 + 4 + 12);
    }

    #[tokio::test(start_paused = true)]
    async fn test_settle_time_is_waited_after_every_move() {
        let sweep = Sweep::new(
            vec![0.0, 5.0, 10.0],
            settings(),
            MockRotator::new(),
            MockSpectrometer::new(2),
        );
        let mut writer = SpectrumWriter::new("mem", Vec::new());

        let started = tokio::time::Instant::now();
        sweep
            .run(&mut writer, &mut AutoConfirm::default())
            .await
            .unwrap();

        // 4 moves * 5 s settle + 2 s detector settle
        assert_eq!(started.elapsed(), Duration::from_secs(22));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drift_aborts_before_capture() {
        // background move and first sweep move are fine, the second sweep move drifts
        let rotator = MockRotator::new().with_drift(2, 0.3);
        let spectrometer = MockSpectrometer::new(4);
        let sweep = Sweep::new(
            vec![0.0, 5.0, 10.0],
            settings(),
            rotator.clone(),
            spectrometer.clone(),
        );
        let mut writer = SpectrumWriter::new("mem", Vec::new());

        let err = sweep
            .run(&mut writer, &mut AutoConfirm::default())
            .await
            .unwrap_err();

        match err {
            SweepError::Drift {
                commanded,
                reported,
            } => {
                assert_eq!(commanded, 5.0);
                assert!((reported - 5.3).abs() < 1e-9);
            }
            other => panic!("unexpected error: {other}"),
        }
        // background + angle 0 only, nothing captured at the drifted angle
        assert_eq!(spectrometer.captures().await, 2);
        assert_eq!(rotator.moves().await, vec![0.0, 0.0, 5.0]);
        assert_eq!(writer.intensity_blocks(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drift_within_tolerance_is_accepted() {
        let sweep = Sweep::new(
            vec![0.0, 5.0],
            settings(),
            MockRotator::new().with_drift(0, 0.15),
            MockSpectrometer::new(2),
        );
        let mut writer = SpectrumWriter::new("mem", Vec::new());
        assert!(sweep
            .run(&mut writer, &mut AutoConfirm::default())
            .await
            .is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wavelength_change_aborts_without_writing() {
        // capture 0 is the background, capture 2 is the second sweep angle
        let spectrometer = MockSpectrometer::new(4).with_axis_shift(2, 0.5);
        let sweep = Sweep::new(
            vec![0.0, 5.0, 10.0],
            settings(),
            MockRotator::new(),
            spectrometer.clone(),
        );
        let mut writer = SpectrumWriter::new("mem", Vec::new());

        let err = sweep
            .run(&mut writer, &mut AutoConfirm::default())
            .await
            .unwrap_err();

        assert!(matches!(err, SweepError::SpectralRangeChanged { angle } if angle == 5.0));
        assert_eq!(spectrometer.captures().await, 3);
        assert_eq!(writer.intensity_blocks(), 2);
        assert!(!text(writer).contains("2.000000000000000000e+03"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_motor_aborts_before_moving() {
        let rotator = MockRotator::new().disconnect_after(1);
        let sweep = Sweep::new(
            vec![0.0, 5.0, 10.0],
            settings(),
            rotator.clone(),
            MockSpectrometer::new(2),
        );
        let mut writer = SpectrumWriter::new("mem", Vec::new());

        let err = sweep
            .run(&mut writer, &mut AutoConfirm::default())
            .await
            .unwrap_err();

        assert!(matches!(err, SweepError::MotorDisconnected));
        assert_eq!(rotator.moves().await, vec![0.0, 0.0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_integration_time_retried_once() {
        let spectrometer = MockSpectrometer::new(2).failing_integration_time(1);
        let sweep = Sweep::new(vec![0.0], settings(), MockRotator::new(), spectrometer.clone());
        let mut writer = SpectrumWriter::new("mem", Vec::new());

        sweep
            .run(&mut writer, &mut AutoConfirm::default())
            .await
            .unwrap();
        assert_eq!(spectrometer.integration_calls().await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_integration_time_gives_up_after_second_failure() {
        let spectrometer = MockSpectrometer::new(2).failing_integration_time(2);
        let sweep = Sweep::new(vec![0.0], settings(), MockRotator::new(), spectrometer.clone());
        let mut writer = SpectrumWriter::new("mem", Vec::new());

        let err = sweep
            .run(&mut writer, &mut AutoConfirm::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SweepError::Instrument(_)));
        assert_eq!(spectrometer.integration_calls().await, 2);
        assert_eq!(spectrometer.captures().await, 0);
        assert_eq!(writer.intensity_blocks(), 0);
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_each_move_is_logged() {
        let sweep = Sweep::new(
            vec![0.0, 2.5],
            settings(),
            MockRotator::new(),
            MockSpectrometer::new(2),
        );
        let mut writer = SpectrumWriter::new("mem", Vec::new());
        sweep
            .run(&mut writer, &mut AutoConfirm::default())
            .await
            .unwrap();

        assert!(logs_contain("time to collect background!"));
        assert!(logs_contain("moving to 0 deg"));
        assert!(logs_contain("moving to 2.5 deg"));
    }

    #[tokio::test]
    async fn test_empty_sequence_rejected() {
        let sweep = Sweep::new(Vec::new(), settings(), MockRotator::new(), MockSpectrometer::new(2));
        let mut writer = SpectrumWriter::new("mem", Vec::new());
        assert!(matches!(
            sweep.run(&mut writer, &mut AutoConfirm::default()).await,
            Err(SweepError::Config(_))
        ));
    }
}
