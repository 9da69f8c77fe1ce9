//! Plain-text spectrum file writer.
//!
//! Layout of a sweep file:
//!
//! ```text
//! File was created at:Mon Oct 19 14:03:07 2026
//! Polarizer angles [deg]:
//! Wavelengths (nm)
//! 4.000000000000000000e+02
//! ...
//! Background (counts)
//! 1.523000000000000000e+03
//! ...
//! <one block of intensities per sweep angle, no separator>
//! ```
//!
//! Every value sits on its own line in `%.18e` notation, so each block has exactly as
//! many lines as the detector has pixels. The file is flushed after every block; a run
//! that aborts leaves everything written so far on disk.

use chrono::{DateTime, TimeZone};
use std::fmt::Display;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::{AppResult, SweepError};

/// `asctime()` layout used for the creation line.
const CREATED_FORMAT: &str = "%a %b %e %H:%M:%S %Y";

/// Writer for one sweep output file.
pub struct SpectrumWriter<W: Write> {
    path: PathBuf,
    out: BufWriter<W>,
    intensity_blocks: usize,
}

impl SpectrumWriter<File> {
    /// Create the file at `path`, creating missing parent directories.
    ///
    /// # Errors
    /// [`SweepError::OutputExists`] if the file is already there. Existing data is never
    /// overwritten.
    pub fn create(path: &Path) -> AppResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::AlreadyExists => SweepError::OutputExists(path.to_path_buf()),
                _ => SweepError::Io(e),
            })?;

        info!("Writing sweep data to '{}'", path.display());
        Ok(Self::new(path, file))
    }
}

impl<W: Write> SpectrumWriter<W> {
    /// Wrap any sink; `path` is only used for reporting.
    pub fn new(path: impl Into<PathBuf>, inner: W) -> Self {
        Self {
            path: path.into(),
            out: BufWriter::new(inner),
            intensity_blocks: 0,
        }
    }

    /// Where the data goes.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Intensity blocks written so far, background included.
    pub fn intensity_blocks(&self) -> usize {
        self.intensity_blocks
    }

    /// Creation timestamp and the angle heading.
    pub fn write_header<Tz>(&mut self, created: &DateTime<Tz>) -> AppResult<()>
    where
        Tz: TimeZone,
        Tz::Offset: Display,
    {
        writeln!(self.out, "File was created at:{}", created.format(CREATED_FORMAT))?;
        writeln!(self.out, "Polarizer angles [deg]:")?;
        self.flush()
    }

    /// The wavelength axis, written once per file.
    pub fn write_wavelengths(&mut self, wavelengths: &[f64]) -> AppResult<()> {
        writeln!(self.out, "Wavelengths (nm)")?;
        self.write_column(wavelengths)
    }

    /// The background intensities, written once per file right after the wavelengths.
    pub fn write_background(&mut self, intensities: &[f64]) -> AppResult<()> {
        writeln!(self.out, "Background (counts)")?;
        self.write_column(intensities)?;
        self.intensity_blocks += 1;
        Ok(())
    }

    /// Intensities captured at one sweep angle.
    pub fn write_intensities(&mut self, intensities: &[f64]) -> AppResult<()> {
        self.write_column(intensities)?;
        self.intensity_blocks += 1;
        Ok(())
    }

    /// Flush and hand back the sink.
    pub fn finish(self) -> AppResult<W> {
        debug!(
            "Closing '{}' after {} intensity blocks",
            self.path.display(),
            self.intensity_blocks
        );
        self.out.into_inner().map_err(|e| SweepError::Io(e.into_error()))
    }

    fn write_column(&mut self, values: &[f64]) -> AppResult<()> {
        for &value in values {
            writeln!(self.out, "{}", format_value(value))?;
        }
        self.flush()
    }

    fn flush(&mut self) -> AppResult<()> {
        self.out.flush()?;
        Ok(())
    }
}

/// Format like C's `%.18e`: 18 fractional digits and an exponent with explicit sign and
/// at least two digits (`4.005000000000000000e+02`).
pub fn format_value(value: f64) -> String {
    if value.is_nan() {
        return "nan".to_string();
    }
    if value.is_infinite() {
        return if value > 0.0 { "inf" } else { "-inf" }.to_string();
    }

    let formatted = format!("{value:.18e}");
    match formatted.split_once('e') {
        Some((mantissa, exponent)) => {
            let exponent: i32 = exponent.parse().unwrap_or(0);
            let sign = if exponent < 0 { '-' } else { '+' };
            format!("{mantissa}e{sign}{:02}", exponent.abs())
        }
        None => formatted,
    }
}
