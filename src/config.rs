//! Sweep configuration.
//!
//! Values are gathered from three layers, highest precedence first:
//! 1. Command-line flags
//! 2. Environment variables prefixed with `WAVEPLATE_`
//! 3. An optional config file given with `--config-file`
//!
//! The config file either holds the same flags as the command line, separated by
//! whitespace, or, when its extension is `.toml`, a table using the flag names as keys:
//!
//! ```text
//! # sweep.txt
//! --motor_serial 83836244 --spectrometer_serial FLMS01234
//! --initial_angle 0 --final_angle 90 --step 5 --wait 5
//! --spectrometer_integration_time 100 --path data/ --fname run1.txt
//! ```
//!
//! ```toml
//! # sweep.toml
//! motor_serial = "83836244"
//! initial_angle = 0.0
//! final_angle = 90.0
//! ```
//!
//! Every field must be set by some layer. [`SweepConfig`] is only constructed after the
//! merged values pass validation, so nothing downstream deals with partial configuration.

use clap::Parser;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Deserializer, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::experiment::angles::angle_sequence;

/// Prefix for environment variable overrides, e.g. `WAVEPLATE_MOTOR_SERIAL`.
pub const ENV_PREFIX: &str = "WAVEPLATE_";

/// Angles are only meaningful within one turn of the mount.
const ANGLE_RANGE: std::ops::RangeInclusive<f64> = 0.0..=360.0;

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A layer could not be merged or deserialized.
    #[error("Configuration load error: {0}")]
    Load(#[from] Box<figment::Error>),

    /// The config file could not be read.
    #[error("cannot read config file {}: {source}", path.display())]
    ReadFile {
        /// Path given with `--config-file`.
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: std::io::Error,
    },

    /// The config file holds tokens that are not valid flags.
    #[error("cannot parse flags in config file {}: {source}", path.display())]
    FlagFile {
        /// Path given with `--config-file`.
        path: PathBuf,
        /// Parser failure.
        #[source]
        source: clap::Error,
    },

    /// One or more required values were not provided by any layer.
    #[error("The inputs for the program are not all specified (missing: {})", .0.join(", "))]
    Missing(Vec<&'static str>),

    /// A value was provided but cannot be used.
    #[error("Configuration validation error: {0}")]
    Validation(String),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Load(Box::new(err))
    }
}

/// Command-line flags. Every value is optional here; requirements are enforced after the
/// layers are merged.
#[derive(Debug, Clone, Default, Parser, Serialize, Deserialize)]
#[command(
    name = "waveplate_sweep",
    version,
    about = "Rotate a motorized waveplate through an angle sweep and record a spectrum at every position"
)]
pub struct SweepArgs {
    /// Read additional flags (or a TOML table) from this file
    #[arg(long = "config-file", value_name = "FILE")]
    #[serde(skip)]
    pub config_file: Option<PathBuf>,

    /// Motor controller USB serial number
    #[arg(long = "motor_serial")]
    #[serde(
        default,
        deserialize_with = "string_or_number",
        skip_serializing_if = "Option::is_none"
    )]
    pub motor_serial: Option<String>,

    /// Initial motor angle (degrees), background data is taken here, must be in [0,360]
    #[arg(long = "initial_angle", allow_negative_numbers = true)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_angle: Option<f64>,

    /// Final waveplate angle (degrees)
    #[arg(long = "final_angle", allow_negative_numbers = true)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_angle: Option<f64>,

    /// Angular distance travelled between spectrometer captures (degrees)
    #[arg(long = "step", allow_negative_numbers = true)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<f64>,

    /// Settle time after every move before the position is checked (seconds)
    #[arg(long = "wait")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait: Option<f64>,

    /// Spectrometer serial number
    #[arg(long = "spectrometer_serial")]
    #[serde(
        default,
        deserialize_with = "string_or_number",
        skip_serializing_if = "Option::is_none"
    )]
    pub spectrometer_serial: Option<String>,

    /// Spectrometer integration time (milliseconds)
    #[arg(long = "spectrometer_integration_time")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spectrometer_integration_time: Option<f64>,

    /// Directory the output file is written to, including the trailing separator
    #[arg(long = "path")]
    #[serde(
        default,
        deserialize_with = "string_or_number",
        skip_serializing_if = "Option::is_none"
    )]
    pub path: Option<String>,

    /// Output file name
    #[arg(long = "fname")]
    #[serde(
        default,
        deserialize_with = "string_or_number",
        skip_serializing_if = "Option::is_none"
    )]
    pub fname: Option<String>,
}

/// Serial numbers and file names are strings, but TOML and environment layers happily hand
/// them over as integers.
fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Signed(i64),
        Unsigned(u64),
        Float(f64),
    }

    Ok(Option::<Raw>::deserialize(deserializer)?.map(|raw| match raw {
        Raw::Text(s) => s,
        Raw::Signed(n) => n.to_string(),
        Raw::Unsigned(n) => n.to_string(),
        Raw::Float(n) => n.to_string(),
    }))
}

impl SweepArgs {
    /// Parse the whitespace-separated flags stored in `path`.
    pub fn from_flag_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;

        let tokens = std::iter::once("waveplate_sweep").chain(contents.split_whitespace());
        let args = Self::try_parse_from(tokens).map_err(|source| ConfigError::FlagFile {
            path: path.to_path_buf(),
            source,
        })?;

        if args.config_file.is_some() {
            tracing::warn!(
                "Ignoring nested --config-file inside {}",
                path.display()
            );
        }
        Ok(args)
    }
}

/// Fully specified and validated sweep configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct SweepConfig {
    /// USB serial number of the motor controller.
    pub motor_serial: String,
    /// Serial number of the spectrometer.
    pub spectrometer_serial: String,
    /// Background is captured here and the sweep starts here (degrees).
    pub initial_angle: f64,
    /// Nominal end of the sweep (degrees).
    pub final_angle: f64,
    /// Signed distance between consecutive angles (degrees).
    pub step: f64,
    /// Settle time after each move.
    pub wait: Duration,
    /// Spectrometer integration time (milliseconds).
    pub integration_time_ms: f64,
    /// Output directory, concatenated verbatim with `fname`.
    pub path: String,
    /// Output file name.
    pub fname: String,
}

impl SweepConfig {
    /// Merge the command line with the environment and any config file, then validate.
    pub fn load(args: SweepArgs) -> Result<Self, ConfigError> {
        Self::from_layers(args, Env::prefixed(ENV_PREFIX))
    }

    /// Same as [`SweepConfig::load`] with an explicit environment provider.
    pub fn from_layers(args: SweepArgs, env: Env) -> Result<Self, ConfigError> {
        let base = match args.config_file.as_deref() {
            Some(path) => file_layer(path)?,
            None => Figment::new(),
        };

        let merged: SweepArgs = base
            .merge(env)
            .merge(Serialized::defaults(&args))
            .extract()?;

        let config = Self::try_from(merged)?;
        debug!(?config, "Configuration loaded");
        Ok(config)
    }

    /// Output file location: `path` and `fname` joined without inserting a separator.
    pub fn output_path(&self) -> PathBuf {
        PathBuf::from(format!("{}{}", self.path, self.fname))
    }

    /// Target angles of the sweep, in order.
    pub fn angles(&self) -> Vec<f64> {
        angle_sequence(self.initial_angle, self.final_angle, self.step)
    }
}

fn file_layer(path: &Path) -> Result<Figment, ConfigError> {
    let is_toml = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));

    if is_toml {
        // Toml::file skips missing files silently
        std::fs::metadata(path).map_err(|source| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Figment::from(Toml::file(path)))
    } else {
        let file_args = SweepArgs::from_flag_file(path)?;
        Ok(Figment::from(Serialized::defaults(file_args)))
    }
}

impl TryFrom<SweepArgs> for SweepConfig {
    type Error = ConfigError;

    fn try_from(args: SweepArgs) -> Result<Self, Self::Error> {
        let missing: Vec<&'static str> = [
            ("--motor_serial", args.motor_serial.is_none()),
            ("--initial_angle", args.initial_angle.is_none()),
            ("--final_angle", args.final_angle.is_none()),
            ("--step", args.step.is_none()),
            ("--wait", args.wait.is_none()),
            ("--spectrometer_serial", args.spectrometer_serial.is_none()),
            (
                "--spectrometer_integration_time",
                args.spectrometer_integration_time.is_none(),
            ),
            ("--path", args.path.is_none()),
            ("--fname", args.fname.is_none()),
        ]
        .into_iter()
        .filter_map(|(name, absent)| absent.then_some(name))
        .collect();

        let (
            Some(motor_serial),
            Some(initial_angle),
            Some(final_angle),
            Some(step),
            Some(wait),
            Some(spectrometer_serial),
            Some(integration_time_ms),
            Some(path),
            Some(fname),
        ) = (
            args.motor_serial,
            args.initial_angle,
            args.final_angle,
            args.step,
            args.wait,
            args.spectrometer_serial,
            args.spectrometer_integration_time,
            args.path,
            args.fname,
        )
        else {
            return Err(ConfigError::Missing(missing));
        };

        for (name, angle) in [("initial_angle", initial_angle), ("final_angle", final_angle)] {
            if !ANGLE_RANGE.contains(&angle) {
                return Err(ConfigError::Validation(format!(
                    "{name} must be in [0,360] degrees, got {angle}"
                )));
            }
        }

        if !step.is_finite() || step == 0.0 {
            return Err(ConfigError::Validation(format!(
                "step must be a nonzero number of degrees, got {step}"
            )));
        }

        if final_angle != initial_angle && (final_angle - initial_angle).signum() != step.signum() {
            return Err(ConfigError::Validation(format!(
                "step {step} never reaches final_angle {final_angle} from initial_angle {initial_angle}"
            )));
        }

        let wait = Duration::try_from_secs_f64(wait).map_err(|_| {
            ConfigError::Validation(format!("wait must be a non-negative number of seconds, got {wait}"))
        })?;

        if !(integration_time_ms.is_finite() && integration_time_ms > 0.0) {
            return Err(ConfigError::Validation(format!(
                "spectrometer_integration_time must be positive, got {integration_time_ms}"
            )));
        }

        if fname.trim().is_empty() {
            return Err(ConfigError::Validation("fname must not be empty".to_string()));
        }

        Ok(Self {
            motor_serial,
            spectrometer_serial,
            initial_angle,
            final_angle,
            step,
            wait,
            integration_time_ms,
            path,
            fname,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    fn complete_args() -> SweepArgs {
        SweepArgs {
            config_file: None,
            motor_serial: Some("83836244".into()),
            initial_angle: Some(0.0),
            final_angle: Some(10.0),
            step: Some(5.0),
            wait: Some(5.0),
            spectrometer_serial: Some("FLMS01234".into()),
            spectrometer_integration_time: Some(100.0),
            path: Some("data/".into()),
            fname: Some("run1.txt".into()),
        }
    }

    fn no_env() -> Env {
        Env::prefixed("WAVEPLATE_UNIT_TEST_UNSET_")
    }

    #[test]
    fn test_complete_args_validate() {
        let config = SweepConfig::from_layers(complete_args(), no_env()).unwrap();
        assert_eq!(config.motor_serial, "83836244");
        assert_eq!(config.wait, Duration::from_secs(5));
        assert_eq!(config.output_path(), PathBuf::from("data/run1.txt"));
        assert_eq!(config.angles(), vec![0.0, 5.0, 10.0]);
    }

    #[test]
    fn test_missing_fields_are_all_listed() {
        let args = SweepArgs {
            step: None,
            fname: None,
            ..complete_args()
        };
        let err = SweepConfig::from_layers(args, no_env()).unwrap_err();
        match err {
            ConfigError::Missing(names) => assert_eq!(names, vec!["--step", "--fname"]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_cli_flags_parse_with_underscores() {
        let args = SweepArgs::try_parse_from([
            "waveplate_sweep",
            "--motor_serial",
            "83836244",
            "--initial_angle",
            "10",
            "--step",
            "-2.5",
        ])
        .unwrap();
        assert_eq!(args.motor_serial.as_deref(), Some("83836244"));
        assert_eq!(args.initial_angle, Some(10.0));
        assert_eq!(args.step, Some(-2.5));
        assert!(args.final_angle.is_none());
    }

    #[test]
    fn test_zero_step_rejected() {
        let args = SweepArgs {
            step: Some(0.0),
            ..complete_args()
        };
        let err = SweepConfig::from_layers(args, no_env()).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn test_step_pointing_away_from_final_rejected() {
        let args = SweepArgs {
            step: Some(-5.0),
            ..complete_args()
        };
        assert!(matches!(
            SweepConfig::from_layers(args, no_env()),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn test_descending_sweep_accepted() {
        let args = SweepArgs {
            initial_angle: Some(90.0),
            final_angle: Some(80.0),
            step: Some(-5.0),
            ..complete_args()
        };
        let config = SweepConfig::from_layers(args, no_env()).unwrap();
        assert_eq!(config.angles(), vec![90.0, 85.0, 80.0]);
    }

    #[test]
    fn test_degenerate_sweep_accepts_any_step_sign() {
        let args = SweepArgs {
            initial_angle: Some(30.0),
            final_angle: Some(30.0),
            step: Some(-1.0),
            ..complete_args()
        };
        assert!(SweepConfig::from_layers(args, no_env()).is_ok());
    }

    #[test]
    fn test_angle_out_of_range_rejected() {
        let args = SweepArgs {
            final_angle: Some(400.0),
            ..complete_args()
        };
        assert!(matches!(
            SweepConfig::from_layers(args, no_env()),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn test_negative_wait_rejected() {
        let args = SweepArgs {
            wait: Some(-1.0),
            ..complete_args()
        };
        assert!(matches!(
            SweepConfig::from_layers(args, no_env()),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn test_flag_file_fills_only_unset_values() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "sweep.txt",
                "--motor_serial 11111111 --initial_angle 0 --final_angle 10\n\
                 --step 5 --wait 1 --spectrometer_serial FLMS0001\n\
                 --spectrometer_integration_time 20 --path out/ --fname from_file.txt\n",
            )?;

            let args = SweepArgs {
                config_file: Some("sweep.txt".into()),
                motor_serial: Some("22222222".into()),
                ..SweepArgs::default()
            };
            let config = SweepConfig::from_layers(args, no_env()).map_err(|e| e.to_string())?;

            assert_eq!(config.motor_serial, "22222222");
            assert_eq!(config.fname, "from_file.txt");
            assert_eq!(config.integration_time_ms, 20.0);
            Ok(())
        });
    }

    #[test]
    fn test_toml_file_and_env_layers() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "sweep.toml",
                r#"
                motor_serial = 11111111
                initial_angle = 0.0
                final_angle = 90.0
                step = 10.0
                wait = 2.5
                spectrometer_serial = "FLMS0001"
                spectrometer_integration_time = 50.0
                path = "out/"
                fname = "toml.txt"
                "#,
            )?;
            jail.set_env("WAVEPLATE_FNAME", "from_env.txt");

            let args = SweepArgs {
                config_file: Some("sweep.toml".into()),
                step: Some(30.0),
                ..SweepArgs::default()
            };
            let config = SweepConfig::load(args).map_err(|e| e.to_string())?;

            assert_eq!(config.motor_serial, "11111111");
            assert_eq!(config.fname, "from_env.txt");
            assert_eq!(config.step, 30.0);
            assert_eq!(config.wait, Duration::from_millis(2500));
            assert_eq!(config.angles(), vec![0.0, 30.0, 60.0, 90.0]);
            Ok(())
        });
    }

    #[test]
    fn test_numeric_file_names_from_env_stay_text() {
        Jail::expect_with(|jail| {
            jail.set_env("WAVEPLATE_PATH", "2026");
            jail.set_env("WAVEPLATE_FNAME", "1019");

            let args = SweepArgs {
                path: None,
                fname: None,
                ..complete_args()
            };
            let config = SweepConfig::load(args).map_err(|e| e.to_string())?;

            assert_eq!(config.path, "2026");
            assert_eq!(config.fname, "1019");
            assert_eq!(config.output_path(), PathBuf::from("20261019"));
            Ok(())
        });
    }

    #[test]
    fn test_missing_config_file_is_reported() {
        let args = SweepArgs {
            config_file: Some("/nonexistent/sweep.toml".into()),
            ..complete_args()
        };
        assert!(matches!(
            SweepConfig::from_layers(args, no_env()),
            Err(ConfigError::ReadFile { .. })
        ));
    }

    #[test]
    fn test_bad_token_in_flag_file_is_reported() {
        Jail::expect_with(|jail| {
            jail.create_file("bad.txt", "--motor_serial 1 --not_a_flag 3")?;
            let result = SweepArgs::from_flag_file(Path::new("bad.txt"));
            assert!(matches!(result, Err(ConfigError::FlagFile { .. })));
            Ok(())
        });
    }
}
