//! KBUS fieldbus driver abstraction.
//!
//! This crate provides:
//! - [`KbusDriver`], the trait the cycle engine drives the backplane through
//! - [`simulated`] module with a fixed-topology backend used by every test in
//!   the workspace that doesn't need real hardware

pub mod simulated;

pub use simulated::SimulatedKbusDriver;

use gw_common::GatewayResult;

/// Requested run state of the backplane coupler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplicationState {
    /// Normal cyclic operation.
    Running,
    /// Host is stopping; the driver should accelerate its own polling.
    Stopped,
}

/// Classification and addressing detail for one installed terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalInfo {
    /// 1-based position on the backplane.
    pub position: u16,
    /// Raw 16-bit terminal identifier as reported by the module.
    pub raw_id: u16,
    /// Module family, 750 or 753.
    pub family: u16,
    /// First configuration specifier (only set for non-digital modules whose
    /// type decode required the extended register pair).
    pub spec1: Option<i32>,
    /// Second configuration specifier.
    pub spec2: Option<i32>,
    /// Human-readable description string built from the type decode.
    pub description: String,
    /// Bit offset of this terminal's inputs within the process-input image.
    pub bit_offset_in: u32,
    /// Number of input bits this terminal contributes.
    pub bit_size_in: u32,
    /// Bit offset of this terminal's outputs within the process-output image.
    pub bit_offset_out: u32,
    /// Number of output bits this terminal contributes.
    pub bit_size_out: u32,
}

/// Aggregate bit counts across all installed terminals, as reported by
/// `get-bit-counts`. Word order matches the KBUSINFO register bank
/// (analog-output, analog-input, digital-output, digital-input).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BitCounts {
    /// Total analog output bits.
    pub analog_out: u32,
    /// Total analog input bits.
    pub analog_in: u32,
    /// Total digital output bits.
    pub digital_out: u32,
    /// Total digital input bits.
    pub digital_in: u32,
}

/// Result of decoding one terminal's type registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminalTypeDetails {
    /// Whether the high bit of register 9 marked this module digital.
    pub digital: bool,
    /// Decoded family (750 or 753), meaningless for digital modules.
    pub family: u16,
    /// First specifier, present only when register 30's value mod 10 is 9.
    pub spec1: Option<i32>,
    /// Second specifier: either register 30 mod 10, or register 28 when the
    /// extended pair was read.
    pub spec2: Option<i32>,
}

/// Decode one terminal's module-catalog registers into a [`TerminalTypeDetails`].
///
/// `read_reg(slot, register)` must return the raw 16-bit register value for
/// the given 1-based slot. This mirrors the original firmware's
/// `kbus_getTerminalType` byte-for-byte: register 9's high bit flags a
/// digital module; otherwise register 16 bit 0x100 promotes the 750 series to
/// 753, register 30 mod 10 is usually the type specifier directly, and only
/// when that value is 9 do registers 29/28 hold the real specifier pair.
///
/// # Errors
///
/// Propagates whatever `read_reg` returns; a failed register read aborts the
/// decode for this terminal.
pub fn decode_terminal_type_details<F>(
    slot: usize,
    read_reg: F,
) -> GatewayResult<TerminalTypeDetails>
where
    F: Fn(usize, u16) -> GatewayResult<u16>,
{
    let reg9 = read_reg(slot, 9)?;
    if reg9 & 0x8000 != 0 {
        return Ok(TerminalTypeDetails {
            digital: true,
            family: 0,
            spec1: None,
            spec2: None,
        });
    }

    let reg16 = read_reg(slot, 16)?;
    let family = if reg16 & 0x100 != 0 { 753 } else { 750 };

    let reg30 = read_reg(slot, 30)?;
    let remainder = (reg30 % 10) as i32;

    if remainder != 9 {
        Ok(TerminalTypeDetails {
            digital: false,
            family,
            spec1: None,
            spec2: Some(remainder),
        })
    } else {
        let spec1 = i32::from(read_reg(slot, 29)?);
        let spec2 = i32::from(read_reg(slot, 28)?);
        Ok(TerminalTypeDetails {
            digital: false,
            family,
            spec1: Some(spec1),
            spec2: Some(spec2),
        })
    }
}

/// Abstraction over the local I/O backplane.
///
/// Method names deliberately mirror the operation set the cycle engine
/// drives the bus through (open, one push per cycle, explicit write/read
/// framing, a driver-local watchdog trigger, close) rather than a generic
/// read/write pair, since the KBUS cycle body's step ordering (§4.2) depends
/// on them being separately callable.
pub trait KbusDriver: Send {
    /// Open the local I/O device.
    fn open(&mut self) -> GatewayResult<()>;

    /// Command the coupler into `Running` or `Stopped`.
    fn set_application_state(&mut self, state: ApplicationState) -> GatewayResult<()>;

    /// Discover installed terminals and allocate internal bookkeeping.
    /// Idempotent: a reset tears this down and calls it again.
    fn create_info(&mut self) -> GatewayResult<()>;

    /// Current bus error code; 0 means healthy.
    fn get_status(&self) -> GatewayResult<i32>;

    /// Byte offset of the first digital input/output within the process
    /// image, as (`in_offset`, `out_offset`).
    fn get_digital_offsets(&self) -> (u32, u32);

    /// Full terminal table, classified via [`decode_terminal_type_details`].
    fn get_terminal_info(&mut self) -> GatewayResult<Vec<TerminalInfo>>;

    /// Aggregate bit counts across all terminals.
    fn get_bit_counts(&self) -> BitCounts;

    /// Begin a write transaction to the bus.
    fn write_start(&mut self) -> GatewayResult<()>;

    /// Write output process-data bytes.
    fn write_bytes(&mut self, data: &[u8]) -> GatewayResult<()>;

    /// End the write transaction.
    fn write_end(&mut self) -> GatewayResult<()>;

    /// Begin a read transaction from the bus.
    fn read_start(&mut self) -> GatewayResult<()>;

    /// Read input process-data bytes into `buf`, returning the number of
    /// bytes actually read.
    fn read_bytes(&mut self, buf: &mut [u8]) -> GatewayResult<usize>;

    /// End the read transaction.
    fn read_end(&mut self) -> GatewayResult<()>;

    /// Push exactly one bus cycle (the actual I/O exchange with the
    /// backplane's physical terminals).
    fn push_one_cycle(&mut self) -> GatewayResult<()>;

    /// Kick the driver's own liveness watchdog. Distinct from the
    /// Modbus-register safety watchdog; see the cycle engine's cycle body.
    fn watchdog_trigger(&mut self) -> GatewayResult<()>;

    /// Close the device and release resources.
    fn close(&mut self) -> GatewayResult<()>;
}
