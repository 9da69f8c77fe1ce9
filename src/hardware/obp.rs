//! Ocean binary protocol (OBP) spectrometer driver
//!
//! Reference: Ocean Insight OBP firmware/command reference (STS, Ocean ST/SR series)
//!
//! Protocol Overview:
//! - Every message is a 44-byte header, an optional payload, a 16-byte checksum block
//!   and the footer `C5 C4 C3 C2`
//! - Header: start bytes `C1 C0`, protocol version 0x1100, flags, error number, message
//!   type (u32), regarding (u32), 6 reserved bytes, checksum type, immediate data length,
//!   16 bytes of immediate data, then the number of bytes remaining after the header
//! - Small arguments and replies travel in the immediate data field; spectra travel in
//!   the payload as little-endian u16 pixel counts
//! - Checksums are not used (checksum type 0, checksum block zeroed)

use crate::hardware::capabilities::{Spectrometer, Spectrum};
use anyhow::{anyhow, bail, ensure, Context, Result};
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, trace};

/// Message types used by this driver.
pub mod msg {
    /// Read the device serial number.
    pub const GET_SERIAL_NUMBER: u32 = 0x0000_0100;
    /// Acquire and return one raw spectrum.
    pub const GET_RAW_SPECTRUM: u32 = 0x0010_1100;
    /// Set integration time in microseconds.
    pub const SET_INTEGRATION_TIME: u32 = 0x0011_0010;
    /// Number of wavelength calibration coefficients.
    pub const GET_WAVELENGTH_COEFF_COUNT: u32 = 0x0018_0100;
    /// One wavelength calibration coefficient.
    pub const GET_WAVELENGTH_COEFF: u32 = 0x0018_0101;
}

/// Header flag bits.
pub mod flags {
    /// Message is a response.
    pub const RESPONSE: u16 = 0x0001;
    /// Positive acknowledgement.
    pub const ACK: u16 = 0x0002;
    /// Sender asks for an acknowledgement.
    pub const ACK_REQUESTED: u16 = 0x0004;
    /// Negative acknowledgement.
    pub const NACK: u16 = 0x0008;
    /// Device raised an exception.
    pub const EXCEPTION: u16 = 0x0010;
}

const START: [u8; 2] = [0xC1, 0xC0];
const FOOTER: [u8; 4] = [0xC5, 0xC4, 0xC3, 0xC2];
const PROTOCOL_VERSION: u16 = 0x1100;
const HEADER_LEN: usize = 44;
const IMMEDIATE_LEN: usize = 16;
const CHECKSUM_LEN: usize = 16;
const TRAILER_LEN: usize = CHECKSUM_LEN + FOOTER.len();
/// Upper bound on a reply, well above the largest detector
const MAX_REMAINING: usize = 1 << 20;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// One OBP message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObpMessage {
    /// Message type.
    pub message_type: u32,
    /// Header flags.
    pub flags: u16,
    /// Error number, nonzero when the device rejected the request.
    pub error: u16,
    /// Immediate data (at most 16 bytes).
    pub immediate: Vec<u8>,
    /// Payload.
    pub payload: Bytes,
}

impl ObpMessage {
    /// An empty request of the given type.
    pub fn request(message_type: u32) -> Self {
        Self {
            message_type,
            flags: 0,
            error: 0,
            immediate: Vec::new(),
            payload: Bytes::new(),
        }
    }

    /// Attach immediate data, truncated to the 16 bytes the header holds.
    pub fn with_immediate(mut self, data: &[u8]) -> Self {
        self.immediate = data[..data.len().min(IMMEDIATE_LEN)].to_vec();
        self
    }

    /// Ask the device to acknowledge the request.
    pub fn with_ack(mut self) -> Self {
        self.flags |= flags::ACK_REQUESTED;
        self
    }

    /// Serialize to wire format.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len() + TRAILER_LEN);
        buf.put_slice(&START);
        buf.put_u16_le(PROTOCOL_VERSION);
        buf.put_u16_le(self.flags);
        buf.put_u16_le(self.error);
        buf.put_u32_le(self.message_type);
        buf.put_u32_le(0); // regarding
        buf.put_bytes(0, 6); // reserved
        buf.put_u8(0); // no checksum
        buf.put_u8(self.immediate.len() as u8);
        buf.put_slice(&self.immediate);
        buf.put_bytes(0, IMMEDIATE_LEN - self.immediate.len());
        buf.put_u32_le((self.payload.len() + TRAILER_LEN) as u32);
        buf.put_slice(&self.payload);
        buf.put_bytes(0, CHECKSUM_LEN);
        buf.put_slice(&FOOTER);
        buf.freeze()
    }

    /// True when the device refused the request.
    pub fn is_rejected(&self) -> bool {
        self.flags & (flags::NACK | flags::EXCEPTION) != 0 || self.error != 0
    }
}

/// Read one complete message from the link.
async fn read_message<R: AsyncRead + Unpin>(port: &mut R) -> Result<ObpMessage> {
    let mut header = [0u8; HEADER_LEN];
    port.read_exact(&mut header)
        .await
        .context("OBP header read failed")?;

    ensure!(header[..2] == START, "OBP start bytes missing, link out of sync");

    let flags = u16::from_le_bytes([header[4], header[5]]);
    let error = u16::from_le_bytes([header[6], header[7]]);
    let message_type = u32::from_le_bytes([header[8], header[9], header[10], header[11]]);
    let immediate_len = (header[23] as usize).min(IMMEDIATE_LEN);
    let immediate = header[24..24 + immediate_len].to_vec();
    let remaining = u32::from_le_bytes([header[40], header[41], header[42], header[43]]) as usize;

    if !(TRAILER_LEN..=MAX_REMAINING).contains(&remaining) {
        bail!("OBP message announces {remaining} trailing bytes");
    }

    let mut rest = vec![0u8; remaining];
    port.read_exact(&mut rest)
        .await
        .context("OBP payload read failed")?;

    ensure!(rest[remaining - FOOTER.len()..] == FOOTER, "OBP footer missing");

    let payload_len = remaining - TRAILER_LEN;
    rest.truncate(payload_len);

    Ok(ObpMessage {
        message_type,
        flags,
        error,
        immediate,
        payload: Bytes::from(rest),
    })
}

/// Evaluate the wavelength calibration polynomial at every pixel.
pub fn wavelength_axis(coefficients: &[f64], pixels: usize) -> Vec<f64> {
    (0..pixels)
        .map(|pixel| {
            let x = pixel as f64;
            coefficients.iter().rev().fold(0.0, |acc, c| acc * x + c)
        })
        .collect()
}

/// Driver for spectrometers speaking the Ocean binary protocol over a serial link
///
/// Implements [`Spectrometer`]. The wavelength calibration is read alongside every
/// capture, so a device reset or swap shows up as a changed wavelength axis.
pub struct ObpSpectrometer<T> {
    /// Link to the spectrometer, locked for the duration of a request/reply exchange
    port: Mutex<T>,
    /// How long to wait for a reply, on top of the exposure for spectrum requests
    timeout: Duration,
    /// Integration time last accepted by the device, microseconds
    integration_us: AtomicU64,
}

#[cfg(feature = "instrument_serial")]
impl ObpSpectrometer<tokio_serial::SerialStream> {
    /// Open the spectrometer on `port_path` and check that it reports `expected_serial`
    ///
    /// # Errors
    /// Returns error if the port cannot be opened, the device does not answer, or it
    /// reports a different serial number
    pub async fn open(port_path: &str, expected_serial: &str) -> Result<Self> {
        use tokio_serial::SerialPortBuilderExt;

        let port = tokio_serial::new(port_path, 115_200)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .with_context(|| format!("Failed to open spectrometer serial port: {port_path}"))?;

        let spectrometer = Self::new(port);
        spectrometer.verify_serial(expected_serial).await?;
        debug!(port = port_path, serial = expected_serial, "Spectrometer opened");
        Ok(spectrometer)
    }
}

impl<T> ObpSpectrometer<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wrap an already open link
    pub fn new(port: T) -> Self {
        Self {
            port: Mutex::new(port),
            timeout: DEFAULT_TIMEOUT,
            integration_us: AtomicU64::new(0),
        }
    }

    /// Change the reply timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Integration time last accepted by the device
    pub fn integration_time(&self) -> Duration {
        Duration::from_micros(self.integration_us.load(Ordering::Relaxed))
    }

    /// Send a request and wait for the matching reply
    async fn query(&self, request: ObpMessage) -> Result<ObpMessage> {
        self.query_within(request, self.timeout).await
    }

    /// Send a request and wait up to `timeout` for the matching reply
    async fn query_within(&self, request: ObpMessage, timeout: Duration) -> Result<ObpMessage> {
        let mut port = self.port.lock().await;
        port.write_all(&request.encode())
            .await
            .context("OBP write failed")?;
        port.flush().await.context("OBP flush failed")?;
        trace!("OBP sent {:#010x}", request.message_type);

        let reply = tokio::time::timeout(timeout, read_message(&mut *port))
            .await
            .map_err(|_| {
                anyhow!(
                    "OBP reply {:#010x} timed out after {:?}",
                    request.message_type,
                    timeout
                )
            })??;

        if reply.message_type != request.message_type {
            bail!(
                "OBP reply type {:#010x} does not match request {:#010x}",
                reply.message_type,
                request.message_type
            );
        }
        if reply.is_rejected() {
            bail!(
                "spectrometer rejected {:#010x} (error {}, flags {:#06x})",
                request.message_type,
                reply.error,
                reply.flags
            );
        }
        Ok(reply)
    }

    /// Serial number reported by the device
    pub async fn serial_number(&self) -> Result<String> {
        let reply = self
            .query(ObpMessage::request(msg::GET_SERIAL_NUMBER))
            .await
            .context("serial number request failed")?;
        let raw = if reply.payload.is_empty() {
            &reply.immediate[..]
        } else {
            &reply.payload[..]
        };
        Ok(String::from_utf8_lossy(raw)
            .trim_end_matches('\0')
            .trim()
            .to_string())
    }

    async fn verify_serial(&self, expected: &str) -> Result<()> {
        let reported = self.serial_number().await?;
        ensure!(
            reported == expected.trim(),
            "spectrometer reports serial {reported}, expected {expected}"
        );
        Ok(())
    }

    /// Wavelength calibration polynomial, constant term first
    pub async fn wavelength_coefficients(&self) -> Result<Vec<f64>> {
        let reply = self
            .query(ObpMessage::request(msg::GET_WAVELENGTH_COEFF_COUNT))
            .await
            .context("wavelength coefficient count request failed")?;
        let count = *reply
            .immediate
            .first()
            .ok_or_else(|| anyhow!("empty wavelength coefficient count"))?;

        let mut coefficients = Vec::with_capacity(count as usize);
        for index in 0..count {
            let reply = self
                .query(ObpMessage::request(msg::GET_WAVELENGTH_COEFF).with_immediate(&[index]))
                .await
                .with_context(|| format!("wavelength coefficient {index} request failed"))?;
            let bytes: [u8; 4] = reply
                .immediate
                .get(..4)
                .and_then(|b| b.try_into().ok())
                .ok_or_else(|| anyhow!("wavelength coefficient {index} reply too short"))?;
            coefficients.push(f64::from(f32::from_le_bytes(bytes)));
        }
        Ok(coefficients)
    }
}

#[async_trait]
impl<T> Spectrometer for ObpSpectrometer<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn set_integration_time(&self, millis: f64) -> Result<()> {
        let micros = (millis * 1000.0).round();
        ensure!(
            micros >= 1.0 && micros <= f64::from(u32::MAX),
            "integration time {millis} ms out of range"
        );
        let request = ObpMessage::request(msg::SET_INTEGRATION_TIME)
            .with_immediate(&(micros as u32).to_le_bytes())
            .with_ack();
        self.query(request)
            .await
            .with_context(|| format!("setting integration time to {millis} ms failed"))?;
        self.integration_us.store(micros as u64, Ordering::Relaxed);
        debug!("Integration time set to {millis} ms");
        Ok(())
    }

    async fn spectrum(&self) -> Result<Spectrum> {
        let coefficients = self.wavelength_coefficients().await?;
        // the device answers only once the exposure has finished
        let reply = self
            .query_within(
                ObpMessage::request(msg::GET_RAW_SPECTRUM),
                self.timeout + self.integration_time(),
            )
            .await
            .context("spectrum request failed")?;

        ensure!(
            reply.payload.len() % 2 == 0,
            "spectrum payload has odd length {}",
            reply.payload.len()
        );
        let intensities: Vec<f64> = reply
            .payload
            .chunks_exact(2)
            .map(|px| f64::from(u16::from_le_bytes([px[0], px[1]])))
            .collect();
        let wavelengths = wavelength_axis(&coefficients, intensities.len());

        Ok(Spectrum {
            wavelengths,
            intensities,
        })
    }
}
