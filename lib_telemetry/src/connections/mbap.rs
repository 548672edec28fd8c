//! # Modbus TCP Framing
//!
//! Every Modbus TCP message is a 7-byte MBAP header followed by a PDU:
//!
//! ```text
//! | transaction id (2) | protocol id (2) = 0 | length (2) | unit id (1) | PDU ... |
//! ```
//!
//! `length` counts the unit id plus the PDU. Only function 0x04 (Read Input
//! Registers) is modelled here.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::error::{DeviceError, ExceptionCode};

/// Read Input Registers.
pub const FUNCTION_READ_INPUT_REGISTERS: u8 = 0x04;
/// Bit set on the function code of an exception response.
pub const EXCEPTION_FLAG: u8 = 0x80;
/// Size of the MBAP header in bytes.
pub const MBAP_HEADER_LEN: usize = 7;
/// Largest register count a single 0x04 request may ask for.
pub const MAX_READ_REGISTERS: u16 = 125;
/// Largest PDU allowed by the protocol.
pub const MAX_PDU_LEN: usize = 253;

/// Decoded MBAP header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    pub transaction_id: u16,
    pub protocol_id: u16,
    pub length: u16,
    pub unit_id: u8,
}

impl MbapHeader {
    pub fn decode(raw: &[u8; MBAP_HEADER_LEN]) -> Self {
        let mut buf = &raw[..];
        Self {
            transaction_id: buf.get_u16(),
            protocol_id: buf.get_u16(),
            length: buf.get_u16(),
            unit_id: buf.get_u8(),
        }
    }

    /// Number of PDU bytes that follow this header.
    ///
    /// A header whose length field cannot describe a valid PDU means the
    /// byte stream is out of sync, so it is reported as a lost connection.
    pub fn pdu_len(&self) -> Result<usize, DeviceError> {
        let len = usize::from(self.length);
        if len < 2 || len - 1 > MAX_PDU_LEN {
            return Err(DeviceError::lost(
                std::io::ErrorKind::InvalidData,
                format!("invalid MBAP length field {}", self.length),
            ));
        }
        Ok(len - 1)
    }
}

/// Builds a complete Read Input Registers request frame.
pub fn encode_read_input_registers(transaction_id: u16, unit_id: u8, start: u16, count: u16) -> Bytes {
    let mut buf = BytesMut::with_capacity(MBAP_HEADER_LEN + 5);
    buf.put_u16(transaction_id);
    buf.put_u16(0);
    buf.put_u16(6);
    buf.put_u8(unit_id);
    buf.put_u8(FUNCTION_READ_INPUT_REGISTERS);
    buf.put_u16(start);
    buf.put_u16(count);
    buf.freeze()
}

/// Decodes the PDU of a Read Input Registers response.
pub fn decode_read_input_registers(pdu: &[u8], expected: u16) -> Result<Vec<u16>, DeviceError> {
    let mut buf = pdu;
    if buf.remaining() < 2 {
        return Err(DeviceError::Malformed(format!("PDU of {} bytes is too short", pdu.len())));
    }

    let function = buf.get_u8();
    if function == FUNCTION_READ_INPUT_REGISTERS | EXCEPTION_FLAG {
        return Err(DeviceError::Exception(ExceptionCode(buf.get_u8())));
    }
    if function != FUNCTION_READ_INPUT_REGISTERS {
        return Err(DeviceError::Malformed(format!("unexpected function code {function:#04x}")));
    }

    let byte_count = usize::from(buf.get_u8());
    let wanted = usize::from(expected) * 2;
    if byte_count != wanted || buf.remaining() != byte_count {
        return Err(DeviceError::Malformed(format!(
            "expected {wanted} data bytes, header says {byte_count}, got {}",
            buf.remaining()
        )));
    }

    let mut registers = Vec::with_capacity(usize::from(expected));
    while buf.has_remaining() {
        registers.push(buf.get_u16());
    }
    Ok(registers)
}
