use crate::modbus::{ModbusRTUCodec, Operation, Request, ResponseKind};
use crate::registers::{RegisterAddress, Width};
use futures::{SinkExt as _, StreamExt as _};
use std::future::Future;
use std::time::Duration;
use tokio_serial::{SerialPortBuilderExt as _, SerialStream};
use tokio_util::codec::Framed;
use tracing::{debug, info, trace};

pub const DEFAULT_DEVICE_ID: u8 = 10;

/// The register holding the device's own bus address.
pub const IDENTITY: RegisterAddress = RegisterAddress::new(1, 0);

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not open serial port `{1}`")]
    OpenPort(#[source] tokio_serial::Error, String),
}

/// Failure of a single register read.
#[derive(thiserror::Error, Debug)]
pub enum ReadError {
    #[error("device reported it is busy")]
    Busy,
    #[error("no response within {0:?}")]
    Timeout(Duration),
    #[error("serial line error")]
    Line(#[source] std::io::Error),
    #[error("serial link closed")]
    Closed,
    #[error("device responded with exception code {0}")]
    Exception(u8),
    #[error("malformed response: {0}")]
    Malformed(&'static str),
    #[error("response came from device {0}")]
    UnexpectedDevice(u8),
}

impl ReadError {
    /// Whether the bus itself misbehaved, as opposed to the device responding with nonsense.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ReadError::Busy | ReadError::Timeout(_) | ReadError::Line(_) | ReadError::Closed
        )
    }
}

#[derive(clap::Parser, Clone)]
#[group(id = "connection::Args")]
pub struct Args {
    /// Path to the serial device the controller is attached to.
    #[arg(long, short = 'p', default_value = "/dev/ttyAMA0")]
    port: String,

    /// The modbus device ID configured on the controller.
    #[arg(long, short = 'i', default_value_t = DEFAULT_DEVICE_ID)]
    device_id: u8,

    /// The baudrate configured on the controller.
    #[arg(long, default_value = "19200")]
    baudrate: u32,

    /// If the modbus response isn't received in this amount of time, consider the read failed.
    #[arg(long, default_value = "1s")]
    read_timeout: humantime::Duration,
}

/// A half-duplex request/response link to a single device.
///
/// Only one request is ever outstanding: every method takes `&mut self` and completes the full
/// round trip before returning.
pub trait Bus {
    fn device_id(&self) -> u8;

    /// Read `count` consecutive holding registers starting at `address`.
    fn read_holdings(
        &mut self,
        address: u16,
        count: u16,
    ) -> impl Future<Output = Result<Vec<u16>, ReadError>>;
}

/// Opens sessions to the device.
pub trait Connect {
    type Bus: Bus;
    fn connect(&mut self) -> impl Future<Output = Result<Client<Self::Bus>, Error>>;
}

pub struct RtuBus {
    io: Framed<SerialStream, ModbusRTUCodec>,
    device_id: u8,
    read_timeout: Duration,
}

impl Bus for RtuBus {
    fn device_id(&self) -> u8 {
        self.device_id
    }

    async fn read_holdings(&mut self, address: u16, count: u16) -> Result<Vec<u16>, ReadError> {
        // Anything still buffered is a late answer to a request we have given up on.
        let stale = self.io.read_buffer().len();
        if stale > 0 {
            debug!(message = "discarding stale bytes", count = stale);
            self.io.read_buffer_mut().clear();
        }
        let request = Request {
            device_id: self.device_id,
            operation: Operation::GetHoldings { address, count },
        };
        self.io.send(&request).await.map_err(ReadError::Line)?;
        let response = tokio::time::timeout(self.read_timeout, self.io.next())
            .await
            .map_err(|_| ReadError::Timeout(self.read_timeout))?
            .ok_or(ReadError::Closed)?
            .map_err(ReadError::Line)?;
        trace!(message = "decoded a response", ?response);
        if response.device_id != self.device_id {
            return Err(ReadError::UnexpectedDevice(response.device_id));
        }
        if response.is_server_busy() {
            return Err(ReadError::Busy);
        }
        match response.kind {
            ResponseKind::ErrorCode(code) => Err(ReadError::Exception(code)),
            ResponseKind::CrcMismatch => Err(ReadError::Malformed("checksum mismatch")),
            ResponseKind::UnexpectedFunction(_) => {
                Err(ReadError::Malformed("unexpected function code"))
            }
            ResponseKind::GetHoldings { values } => {
                if values.len() != 2 * usize::from(count) {
                    return Err(ReadError::Malformed("wrong number of registers"));
                }
                Ok(values.chunks_exact(2).map(|w| u16::from_be_bytes([w[0], w[1]])).collect())
            }
        }
    }
}

pub struct SerialConnector {
    args: Args,
}

impl SerialConnector {
    pub fn new(args: Args) -> Self {
        Self { args }
    }
}

impl Connect for SerialConnector {
    type Bus = RtuBus;

    async fn connect(&mut self) -> Result<Client<RtuBus>, Error> {
        let Args { port, device_id, baudrate, read_timeout } = &self.args;
        info!(message = "connecting...", port = %port, device_id, baudrate);
        let stream = tokio_serial::new(port, *baudrate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::Two)
            .open_native_async()
            .map_err(|e| Error::OpenPort(e, port.clone()))?;
        info!(message = "connected", port = %port);
        let bus = RtuBus {
            io: Framed::new(stream, ModbusRTUCodec {}),
            device_id: *device_id,
            read_timeout: **read_timeout,
        };
        Ok(Client::new(bus))
    }
}

/// Raw register access on top of a [`Bus`].
pub struct Client<B> {
    bus: B,
}

impl<B: Bus> Client<B> {
    pub fn new(bus: B) -> Self {
        Self { bus }
    }

    pub fn device_id(&self) -> u8 {
        self.bus.device_id()
    }

    /// Check that the device on the other end answers with its own address.
    pub async fn test(&mut self) -> Result<bool, ReadError> {
        let raw = self.read_raw(IDENTITY, Width::Word, false).await?;
        Ok(raw == i64::from(self.device_id()))
    }

    pub async fn read_raw(
        &mut self,
        address: RegisterAddress,
        width: Width,
        signed: bool,
    ) -> Result<i64, ReadError> {
        let words = self.bus.read_holdings(address.linear(), width.registers()).await?;
        match (width, &words[..], signed) {
            (Width::Word, &[w], false) => Ok(i64::from(w)),
            (Width::Word, &[w], true) => Ok(i64::from(w as i16)),
            (Width::Long, &[hi, lo], false) => Ok(i64::from(u32::from(hi) << 16 | u32::from(lo))),
            (Width::Long, &[hi, lo], true) => {
                Ok(i64::from((u32::from(hi) << 16 | u32::from(lo)) as i32))
            }
            _ => Err(ReadError::Malformed("wrong number of registers")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedBus;

    #[tokio::test]
    async fn reads_words_with_sign() {
        let bus = ScriptedBus::new(10).with(RegisterAddress::new(4, 1), &[0xFFD8]);
        let mut client = Client::new(bus);
        let at = RegisterAddress::new(4, 1);
        assert_eq!(client.read_raw(at, Width::Word, false).await.unwrap(), 0xFFD8);
        assert_eq!(client.read_raw(at, Width::Word, true).await.unwrap(), -40);
    }

    #[tokio::test]
    async fn reads_longs_high_word_first() {
        let at = RegisterAddress::new(4, 28);
        let bus = ScriptedBus::new(10).with(at, &[0x0001, 0x86A0]);
        let mut client = Client::new(bus);
        assert_eq!(client.read_raw(at, Width::Long, false).await.unwrap(), 100_000);

        let bus = ScriptedBus::new(10).with(at, &[0xFFFF, 0xFFFE]);
        let mut client = Client::new(bus);
        assert_eq!(client.read_raw(at, Width::Long, true).await.unwrap(), -2);
        assert_eq!(client.read_raw(at, Width::Long, false).await.unwrap(), 0xFFFF_FFFE);
    }

    #[tokio::test]
    async fn reads_at_linear_address() {
        let bus = ScriptedBus::new(10);
        let log = bus.log();
        let mut client = Client::new(bus);
        client.read_raw(RegisterAddress::new(5, 2), Width::Long, false).await.unwrap();
        let calls = log.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!((calls[0].address, calls[0].count), (1282, 2));
    }

    #[tokio::test]
    async fn test_compares_identity_register() {
        let bus = ScriptedBus::new(10).with(IDENTITY, &[10]);
        assert!(Client::new(bus).test().await.unwrap());
        let bus = ScriptedBus::new(10).with(IDENTITY, &[7]);
        assert!(!Client::new(bus).test().await.unwrap());
    }

    #[test]
    fn classifies_errors() {
        assert!(ReadError::Busy.is_transient());
        assert!(ReadError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(!ReadError::Exception(2).is_transient());
        assert!(!ReadError::Malformed("x").is_transient());
    }
}
