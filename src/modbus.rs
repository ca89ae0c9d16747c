use tokio_util::bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

pub const READ_HOLDINGS: u8 = 3;
pub const EXCEPTION_SERVER_BUSY: u8 = 6;

#[derive(Debug, Clone, Copy)]
pub struct Request {
    pub device_id: u8,
    pub operation: Operation,
}

#[derive(Debug, Clone, Copy)]
pub enum Operation {
    GetHoldings { address: u16, count: u16 },
}

#[derive(Debug)]
pub struct Response {
    pub device_id: u8,
    pub kind: ResponseKind,
}

impl Response {
    pub fn exception_code(&self) -> Option<u8> {
        match &self.kind {
            ResponseKind::ErrorCode(c) => Some(*c),
            _ => None,
        }
    }

    pub fn is_server_busy(&self) -> bool {
        self.exception_code() == Some(EXCEPTION_SERVER_BUSY)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum ResponseKind {
    ErrorCode(u8),
    GetHoldings { values: Vec<u8> },
    /// A complete frame arrived, but its checksum does not match its contents.
    CrcMismatch,
    /// The frame carries a function code we never ask for. Its length is unknowable, so
    /// everything buffered was discarded with it.
    UnexpectedFunction(u8),
}

/// CRC-16/MODBUS: initial value `0xFFFF`, reflected polynomial `0xA001`.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc = 0xFFFF_u16;
    for byte in data {
        crc ^= u16::from(*byte);
        for _ in 0..8 {
            crc = if crc & 1 != 0 { (crc >> 1) ^ 0xA001 } else { crc >> 1 };
        }
    }
    crc
}

/// Modbus RTU framing for a serial line.
///
/// RTU frames carry no length prefix or transaction identifier. The length is implied by the
/// function code (and, for register reads, a byte count), which is enough for the handful of
/// responses a read-only client can receive.
pub struct ModbusRTUCodec {}

impl Encoder<&Request> for ModbusRTUCodec {
    type Error = std::io::Error;
    fn encode(&mut self, req: &Request, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let start = dst.len();
        match req.operation {
            Operation::GetHoldings { address, count } => {
                dst.extend([req.device_id, READ_HOLDINGS]);
                dst.extend(address.to_be_bytes());
                dst.extend(count.to_be_bytes());
            }
        }
        let crc = crc16(&dst[start..]);
        dst.extend(crc.to_le_bytes());
        trace!(message = "sending encoded", buffer = ?dst);
        Ok(())
    }
}

impl Decoder for ModbusRTUCodec {
    type Item = Response;
    type Error = std::io::Error;
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        trace!(message = "attempt at decoding", buffer = ?src);
        let [device_id, function_code, code, ..] = src[..] else {
            return Ok(None);
        };
        let frame_length = if function_code & 0x80 != 0 {
            5
        } else if function_code == READ_HOLDINGS {
            5 + usize::from(code)
        } else {
            src.advance(src.len());
            return Ok(Some(Response {
                device_id,
                kind: ResponseKind::UnexpectedFunction(function_code),
            }));
        };
        let Some(frame) = src.get(..frame_length) else {
            return Ok(None);
        };
        let (payload, crc) = frame.split_at(frame_length - 2);
        let kind = if crc16(payload).to_le_bytes() != crc {
            ResponseKind::CrcMismatch
        } else if function_code & 0x80 != 0 {
            ResponseKind::ErrorCode(code)
        } else {
            ResponseKind::GetHoldings { values: payload[3..].to_vec() }
        };
        src.advance(frame_length);
        Ok(Some(Response { device_id, kind }))
    }
}
