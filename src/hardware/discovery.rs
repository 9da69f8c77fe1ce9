//! Serial device discovery.
//!
//! Both instruments are attached over USB serial bridges. The operator identifies them
//! by serial number; port paths (`/dev/ttyUSB0`, `COM3`, ...) change between sessions.

use crate::error::{AppResult, SweepError};
use tracing::{info, warn};

/// One enumerated serial port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialDevice {
    /// Port path usable with `serialport::new`.
    pub port: String,
    /// USB serial number, absent for non-USB ports.
    pub serial_number: Option<String>,
    /// USB product string, if the device reports one.
    pub product: Option<String>,
}

/// List every serial port on the machine.
#[cfg(feature = "instrument_serial")]
pub fn list_devices() -> AppResult<Vec<SerialDevice>> {
    use serialport::SerialPortType;

    let ports = serialport::available_ports()
        .map_err(|e| SweepError::Discovery(format!("Can't list devices: {e}")))?;

    let devices: Vec<SerialDevice> = ports
        .into_iter()
        .map(|port| match port.port_type {
            SerialPortType::UsbPort(usb) => SerialDevice {
                port: port.port_name,
                serial_number: usb.serial_number,
                product: usb.product,
            },
            _ => SerialDevice {
                port: port.port_name,
                serial_number: None,
                product: None,
            },
        })
        .collect();

    info!("Connected serial devices: {}", devices.len());
    for device in &devices {
        info!(
            "  {} serial={} product={}",
            device.port,
            device.serial_number.as_deref().unwrap_or("-"),
            device.product.as_deref().unwrap_or("-")
        );
    }
    Ok(devices)
}

/// List every serial port on the machine.
#[cfg(not(feature = "instrument_serial"))]
pub fn list_devices() -> AppResult<Vec<SerialDevice>> {
    Err(SweepError::SerialFeatureDisabled)
}

/// Port path of the device whose USB serial number is `serial`.
///
/// Serial numbers are unique per device; if the bridge reports the same one on several
/// interfaces, the first port wins.
pub fn resolve_port<'a>(devices: &'a [SerialDevice], serial: &str) -> Option<&'a str> {
    let serial = serial.trim();
    let mut matches = devices
        .iter()
        .filter(|d| d.serial_number.as_deref().map(str::trim) == Some(serial));

    let first = matches.next()?;
    let extra = matches.count();
    if extra > 0 {
        warn!(
            "Serial number {serial} found on {} ports, using {}",
            extra + 1,
            first.port
        );
    }
    Some(first.port.as_str())
}

/// Resolve the motor's port, failing with the discovery error the operator acts on.
pub fn resolve_motor_port<'a>(devices: &'a [SerialDevice], serial: &str) -> AppResult<&'a str> {
    resolve_port(devices, serial)
        .ok_or_else(|| SweepError::Discovery(format!("No motor is connected (serial {serial})")))
}
