//! Thorlabs APT motor controller driver (TDC001 driving a PRM1Z8 rotation mount)
//!
//! Reference: Thorlabs APT Communications Protocol, issue 20+
//!
//! Protocol Overview:
//! - Every message starts with a 6-byte header:
//!   `[id lo][id hi][param1][param2][dest][source]` for header-only messages, or
//!   `[id lo][id hi][len lo][len hi][dest | 0x80][source]` followed by `len` data bytes
//! - Host address is 0x01, a single-channel USB controller is 0x50
//! - Multi-byte fields are little-endian; positions are signed 32-bit encoder counts
//! - The controller also sends unsolicited messages (e.g. move completed), which are
//!   skipped while waiting for a specific reply
//!
//! # Example Usage
//!
//! ```no_run
//! use waveplate_sweep::hardware::apt::AptMotor;
//! use waveplate_sweep::hardware::RotationStage;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let motor = AptMotor::open("/dev/ttyUSB0").await?;
//!
//!     motor.move_abs(45.0).await?;
//!     tokio::time::sleep(std::time::Duration::from_secs(5)).await;
//!
//!     println!("Position: {:.2}°", motor.position().await?);
//!     Ok(())
//! }
//! ```

use crate::hardware::capabilities::RotationStage;
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

/// Message identifiers used by this driver.
pub mod msg {
    /// Request hardware information.
    pub const HW_REQ_INFO: u16 = 0x0005;
    /// Hardware information reply.
    pub const HW_GET_INFO: u16 = 0x0006;
    /// Stop the controller from writing its flash on every parameter change.
    pub const HW_NO_FLASH_PROGRAMMING: u16 = 0x0018;
    /// Enable or disable a motor channel.
    pub const MOD_SET_CHANENABLESTATE: u16 = 0x0210;
    /// Absolute move in encoder counts.
    pub const MOT_MOVE_ABSOLUTE: u16 = 0x0453;
    /// Sent by the controller when a move finishes.
    pub const MOT_MOVE_COMPLETED: u16 = 0x0464;
    /// Request a DC servo status update.
    pub const MOT_REQ_DCSTATUSUPDATE: u16 = 0x0490;
    /// DC servo status update reply.
    pub const MOT_GET_DCSTATUSUPDATE: u16 = 0x0491;
}

const HOST: u8 = 0x01;
const GENERIC_USB: u8 = 0x50;
const HAS_DATA: u8 = 0x80;
const HEADER_LEN: usize = 6;
/// Longest data block any APT message carries.
const MAX_DATA_LEN: usize = 255;

/// PRM1-Z8 encoder counts per degree of rotation.
pub const PRM1Z8_COUNTS_PER_DEGREE: f64 = 1919.6418;

const DEFAULT_TIMEOUT: Duration = Duration::from_millis(1000);

/// A decoded APT message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AptFrame {
    /// Message identifier.
    pub id: u16,
    /// Header parameter bytes, zero for messages carrying data.
    pub params: (u8, u8),
    /// Data block following the header.
    pub data: Bytes,
}

/// Encode a header-only message addressed to the controller.
pub fn short_frame(id: u16, param1: u8, param2: u8) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN);
    buf.put_u16_le(id);
    buf.put_u8(param1);
    buf.put_u8(param2);
    buf.put_u8(GENERIC_USB);
    buf.put_u8(HOST);
    buf.freeze()
}

/// Encode a message with a data block addressed to the controller.
pub fn long_frame(id: u16, data: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + data.len());
    buf.put_u16_le(id);
    buf.put_u16_le(data.len() as u16);
    buf.put_u8(GENERIC_USB | HAS_DATA);
    buf.put_u8(HOST);
    buf.put_slice(data);
    buf.freeze()
}

/// Encode an absolute move of `channel` to `counts`.
pub fn move_absolute_frame(channel: u16, counts: i32) -> Bytes {
    let mut data = BytesMut::with_capacity(6);
    data.put_u16_le(channel);
    data.put_i32_le(counts);
    long_frame(msg::MOT_MOVE_ABSOLUTE, &data)
}

/// Length of the data block announced by a header, zero for header-only messages.
fn data_len(header: &[u8; HEADER_LEN]) -> usize {
    if header[4] & HAS_DATA != 0 {
        u16::from_le_bytes([header[2], header[3]]) as usize
    } else {
        0
    }
}

/// DC servo status reported by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DcStatus {
    /// Channel the status belongs to.
    pub channel: u16,
    /// Position in encoder counts.
    pub position: i32,
    /// Status bit field.
    pub status_bits: u32,
}

impl DcStatus {
    /// Decode the data block of a `MOT_GET_DCSTATUSUPDATE` message.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < 14 {
            bail!("DC status block too short: {} bytes", data.len());
        }
        Ok(Self {
            channel: u16::from_le_bytes([data[0], data[1]]),
            position: i32::from_le_bytes([data[2], data[3], data[4], data[5]]),
            status_bits: u32::from_le_bytes([data[10], data[11], data[12], data[13]]),
        })
    }
}

/// Driver for a single-channel APT DC servo controller
///
/// Implements [`RotationStage`]. Positions are converted between degrees and encoder
/// counts with the mount's calibration factor.
pub struct AptMotor<T> {
    /// Link to the controller, locked for the duration of a request/reply exchange
    port: Mutex<T>,
    channel: u16,
    /// Calibration factor: encoder counts per degree
    counts_per_degree: f64,
    /// How long to wait for a reply
    timeout: Duration,
}

#[cfg(feature = "instrument_serial")]
impl AptMotor<tokio_serial::SerialStream> {
    /// Open the controller on `port_path` and enable its motor channel
    ///
    /// # Errors
    /// Returns error if the serial port cannot be opened or the controller rejects
    /// the initialization messages
    pub async fn open(port_path: &str) -> Result<Self> {
        use tokio_serial::{SerialPort, SerialPortBuilderExt};

        // FTDI link settings from the APT protocol manual
        let mut port = tokio_serial::new(port_path, 115_200)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::Hardware)
            .open_native_async()
            .with_context(|| format!("Failed to open APT serial port: {port_path}"))?;

        port.clear(tokio_serial::ClearBuffer::All)
            .context("Failed to purge APT serial buffers")?;
        tokio::time::sleep(Duration::from_millis(50)).await;
        port.write_request_to_send(true)
            .context("Failed to assert RTS on APT serial port")?;

        let motor = Self::new(port);
        motor.initialize().await?;
        debug!(port = port_path, "APT controller opened");
        Ok(motor)
    }
}

impl<T> AptMotor<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wrap an already open link to the controller, using the PRM1Z8 calibration
    pub fn new(port: T) -> Self {
        Self::with_calibration(port, PRM1Z8_COUNTS_PER_DEGREE)
    }

    /// Wrap a link with a custom calibration factor (encoder counts per degree)
    pub fn with_calibration(port: T, counts_per_degree: f64) -> Self {
        Self {
            port: Mutex::new(port),
            channel: 1,
            counts_per_degree,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Change the reply timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Disable flash writes and enable the motor channel
    pub async fn initialize(&self) -> Result<()> {
        self.send(short_frame(msg::HW_NO_FLASH_PROGRAMMING, 0, 0))
            .await
            .context("APT no-flash-programming failed")?;
        self.send(short_frame(
            msg::MOD_SET_CHANENABLESTATE,
            self.channel as u8,
            0x01,
        ))
        .await
        .context("APT channel enable failed")
    }

    /// Degrees to encoder counts
    pub fn to_counts(&self, degrees: f64) -> i32 {
        (degrees * self.counts_per_degree).round() as i32
    }

    /// Encoder counts to degrees
    pub fn to_degrees(&self, counts: i32) -> f64 {
        f64::from(counts) / self.counts_per_degree
    }

    /// Latest DC servo status of the motor channel
    pub async fn status(&self) -> Result<DcStatus> {
        let reply = self
            .request(
                short_frame(msg::MOT_REQ_DCSTATUSUPDATE, self.channel as u8, 0),
                msg::MOT_GET_DCSTATUSUPDATE,
            )
            .await
            .context("APT status request failed")?;
        DcStatus::decode(&reply.data)
    }

    async fn send(&self, frame: Bytes) -> Result<()> {
        let mut port = self.port.lock().await;
        port.write_all(&frame).await.context("APT write failed")?;
        port.flush().await.context("APT flush failed")?;
        trace!("APT sent {:#06x}", u16::from_le_bytes([frame[0], frame[1]]));
        Ok(())
    }

    /// Send `frame` and wait for a message with id `reply_id`, skipping anything else
    async fn request(&self, frame: Bytes, reply_id: u16) -> Result<AptFrame> {
        let mut port = self.port.lock().await;
        port.write_all(&frame).await.context("APT write failed")?;
        port.flush().await.context("APT flush failed")?;

        let exchange = async {
            loop {
                let reply = read_frame(&mut *port).await?;
                if reply.id == reply_id {
                    return Ok::<_, anyhow::Error>(reply);
                }
                trace!("Skipping unsolicited APT message {:#06x}", reply.id);
            }
        };

        tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| anyhow!("APT reply {:#06x} timed out after {:?}", reply_id, self.timeout))?
    }
}

/// Read one complete message from the link.
async fn read_frame<R: AsyncRead + Unpin>(port: &mut R) -> Result<AptFrame> {
    let mut header = [0u8; HEADER_LEN];
    port.read_exact(&mut header)
        .await
        .context("APT header read failed")?;

    let len = data_len(&header);
    if len > MAX_DATA_LEN {
        bail!("APT message announces {len} data bytes, link out of sync");
    }

    let mut data = vec![0u8; len];
    port.read_exact(&mut data)
        .await
        .context("APT data read failed")?;

    let params = if len == 0 { (header[2], header[3]) } else { (0, 0) };
    Ok(AptFrame {
        id: u16::from_le_bytes([header[0], header[1]]),
        params,
        data: Bytes::from(data),
    })
}

#[async_trait]
impl<T> RotationStage for AptMotor<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn move_abs(&self, position_deg: f64) -> Result<()> {
        let counts = self.to_counts(position_deg);
        // The controller answers with MOT_MOVE_COMPLETED once motion stops; that reply is
        // skipped by the next request
        self.send(move_absolute_frame(self.channel, counts))
            .await
            .with_context(|| format!("APT move to {position_deg} deg failed"))
    }

    async fn position(&self) -> Result<f64> {
        let status = self.status().await?;
        Ok(self.to_degrees(status.position))
    }

    async fn is_connected(&self) -> bool {
        match self
            .request(short_frame(msg::HW_REQ_INFO, 0, 0), msg::HW_GET_INFO)
            .await
        {
            Ok(_) => true,
            Err(e) => {
                warn!("APT controller did not answer info request: {e:#}");
                false
            }
        }
    }
}
