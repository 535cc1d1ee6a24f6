//! Modbus wire framing: the MBAP header, function/exception codes, and the
//! small byte-packing helpers the dispatcher uses to assemble replies.
//!
//! This module frames the server side of the Modbus TCP wire format: the
//! same MBAP header, function codes, and exception codes a Modbus client
//! implementation would frame from the other direction.

/// Modbus function codes this gateway implements (§4.4, §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FunctionCode {
    /// Read Coils.
    ReadCoils = 0x01,
    /// Read Discrete Inputs.
    ReadDiscreteInputs = 0x02,
    /// Read Holding Registers.
    ReadHoldingRegisters = 0x03,
    /// Read Input Registers.
    ReadInputRegisters = 0x04,
    /// Write Single Coil.
    WriteSingleCoil = 0x05,
    /// Write Single Register.
    WriteSingleRegister = 0x06,
    /// Write Multiple Coils.
    WriteMultipleCoils = 0x0F,
    /// Write Multiple Registers.
    WriteMultipleRegisters = 0x10,
    /// Report Slave ID.
    ReportSlaveId = 0x11,
    /// Mask Write Register.
    MaskWriteRegister = 0x16,
    /// Write And Read Registers (atomic).
    WriteAndReadRegisters = 0x17,
    /// Read Input Registers, extended (16-bit byte count, larger limit).
    ReadInputRegistersExtended = 0x42,
}

impl FunctionCode {
    /// Parse a function code byte.
    #[must_use]
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::ReadCoils),
            0x02 => Some(Self::ReadDiscreteInputs),
            0x03 => Some(Self::ReadHoldingRegisters),
            0x04 => Some(Self::ReadInputRegisters),
            0x05 => Some(Self::WriteSingleCoil),
            0x06 => Some(Self::WriteSingleRegister),
            0x0F => Some(Self::WriteMultipleCoils),
            0x10 => Some(Self::WriteMultipleRegisters),
            0x11 => Some(Self::ReportSlaveId),
            0x16 => Some(Self::MaskWriteRegister),
            0x17 => Some(Self::WriteAndReadRegisters),
            0x42 => Some(Self::ReadInputRegistersExtended),
            _ => None,
        }
    }
}

/// Modbus exception codes the dispatcher can reply with (§4.4, §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExceptionCode {
    /// Unsupported function code.
    IllegalFunction = 0x01,
    /// Address outside every bank's window.
    IllegalDataAddress = 0x02,
    /// Quantity/value out of the function's valid range.
    IllegalDataValue = 0x03,
    /// Application state is `APPLICATION_STOP`.
    SlaveOrServerBusy = 0x06,
}

/// Standard read-register quantity limit (FC 0x03/0x04/0x17), in words.
pub const MAX_READ_REGISTERS: u16 = 0x7D;
/// Extended read quantity limit for FC 0x42, in words.
pub const MAX_READ_REGISTERS_FC66: u16 = 256;
/// Write-register quantity limit (FC 0x10/0x17), in words.
pub const MAX_WRITE_REGISTERS: u16 = 0x7B;
/// Coil quantity limit (FC 0x01/0x02/0x0F), in bits.
pub const MAX_COILS: u16 = 0x7D0;

/// Modbus TCP Application Protocol (MBAP) header.
#[derive(Debug, Clone, Copy)]
pub struct MbapHeader {
    /// Transaction identifier, echoed verbatim in the reply.
    pub transaction_id: u16,
    /// Protocol identifier; always 0 for Modbus.
    pub protocol_id: u16,
    /// Length of the remaining data (unit ID + PDU).
    pub length: u16,
    /// Unit identifier (slave address); echoed verbatim, not routed on.
    pub unit_id: u8,
}

impl MbapHeader {
    /// Header size in bytes.
    pub const SIZE: usize = 7;

    /// Build a reply header for a PDU of `pdu_len` bytes, echoing this
    /// request's transaction and unit IDs.
    #[must_use]
    pub fn reply(&self, pdu_len: u16) -> Self {
        Self {
            transaction_id: self.transaction_id,
            protocol_id: 0,
            length: pdu_len + 1,
            unit_id: self.unit_id,
        }
    }

    /// Serialize to wire bytes.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..2].copy_from_slice(&self.transaction_id.to_be_bytes());
        bytes[2..4].copy_from_slice(&self.protocol_id.to_be_bytes());
        bytes[4..6].copy_from_slice(&self.length.to_be_bytes());
        bytes[6] = self.unit_id;
        bytes
    }

    /// Parse from the first [`MbapHeader::SIZE`] bytes of a buffer.
    ///
    /// # Errors
    ///
    /// Returns an error string if fewer than [`MbapHeader::SIZE`] bytes are
    /// available.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, String> {
        if bytes.len() < Self::SIZE {
            return Err(format!("MBAP header too short: {} bytes", bytes.len()));
        }
        Ok(Self {
            transaction_id: u16::from_be_bytes([bytes[0], bytes[1]]),
            protocol_id: u16::from_be_bytes([bytes[2], bytes[3]]),
            length: u16::from_be_bytes([bytes[4], bytes[5]]),
            unit_id: bytes[6],
        })
    }
}

/// Unpack `count` bits from a byte-packed buffer, little-bit-first within
/// each byte (Modbus convention).
#[must_use]
pub fn unpack_bits(bytes: &[u8], count: usize) -> Vec<bool> {
    (0..count).map(|i| (bytes[i / 8] >> (i % 8)) & 1 != 0).collect()
}

/// Pack bits into Modbus's byte-per-8-bits wire format.
#[must_use]
pub fn pack_bits(bits: &[bool]) -> Vec<u8> {
    let mut out = vec![0u8; (bits.len() + 7) / 8];
    for (i, &b) in bits.iter().enumerate() {
        if b {
            out[i / 8] |= 1 << (i % 8);
        }
    }
    out
}

/// Build an exception PDU: `function | 0x80`, then the exception code.
#[must_use]
pub fn exception_pdu(function: u8, code: ExceptionCode) -> Vec<u8> {
    vec![function | 0x80, code as u8]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mbap_round_trip() {
        let header = MbapHeader {
            transaction_id: 0x1234,
            protocol_id: 0,
            length: 6,
            unit_id: 1,
        };
        let bytes = header.to_bytes();
        let parsed = MbapHeader::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.transaction_id, 0x1234);
        assert_eq!(parsed.unit_id, 1);
    }

    #[test]
    fn test_function_code_round_trip() {
        assert_eq!(FunctionCode::from_byte(0x17), Some(FunctionCode::WriteAndReadRegisters));
        assert_eq!(FunctionCode::from_byte(0x42), Some(FunctionCode::ReadInputRegistersExtended));
        assert_eq!(FunctionCode::from_byte(0x99), None);
    }

    #[test]
    fn test_bit_pack_unpack_round_trip() {
        let bits = vec![true, false, true, true, false, false, false, false, true];
        let packed = pack_bits(&bits);
        let unpacked = unpack_bits(&packed, bits.len());
        assert_eq!(bits, unpacked);
    }

    #[test]
    fn test_exception_pdu_sets_high_bit() {
        let pdu = exception_pdu(0x03, ExceptionCode::IllegalDataAddress);
        assert_eq!(pdu[0], 0x83);
        assert_eq!(pdu[1], 0x02);
    }
}
