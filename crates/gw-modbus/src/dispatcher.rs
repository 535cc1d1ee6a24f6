//! The Modbus request dispatcher (§4.4): routes one parsed PDU to the
//! register/coil banks or the watchdog bank, and mediates FC 0x17's
//! write-then-read atomicity against the KBUS cycle engine.
//!
//! `Dispatcher` is the seam between the wire layer ([`crate::server`],
//! [`crate::codec`]) and the process data ([`crate::banks::GatewayBanks`]).
//! It never touches a socket; [`Dispatcher::dispatch`] takes a PDU byte
//! slice (function code + body, no MBAP header) and returns a reply PDU,
//! always - exceptions are just PDUs with the high bit set on the function
//! code, per §4.4's error-reply semantics.

use crate::banks::{GatewayBanks, RegisterTarget};
use crate::codec::{
    exception_pdu, pack_bits, unpack_bits, ExceptionCode, FunctionCode, MAX_COILS,
    MAX_READ_REGISTERS, MAX_READ_REGISTERS_FC66, MAX_WRITE_REGISTERS,
};
use crate::watchdog_bank::{WatchdogBank, WriteOutcome, IDX_MIN};
use gw_common::RuntimeState;
use gw_runtime::CycleControl;
use std::sync::Arc;

/// Reports "LMB" plus the crate version for FC 0x11 (§6).
const SLAVE_ID_PREFIX: &str = "LMB";

/// The Modbus request dispatcher.
pub struct Dispatcher {
    banks: Arc<GatewayBanks>,
    watchdog: Arc<WatchdogBank>,
    cycle: Arc<dyn CycleControl>,
}

type Reply = Vec<u8>;

impl Dispatcher {
    /// Build a dispatcher over the given banks, watchdog, and cycle-control
    /// seam. `cycle` is the abstraction the force-update callback (§4.4
    /// step 4, the "message-received callback") and the `APPLICATION_STOP`
    /// check are driven through.
    #[must_use]
    pub fn new(banks: Arc<GatewayBanks>, watchdog: Arc<WatchdogBank>, cycle: Arc<dyn CycleControl>) -> Self {
        Self { banks, watchdog, cycle }
    }

    /// Dispatch one PDU (function code byte followed by its body) and
    /// return the reply PDU. Never panics on malformed input; a PDU too
    /// short to contain even a function code replies
    /// [`ExceptionCode::IllegalFunction`] with function byte 0.
    #[must_use]
    pub fn dispatch(&self, pdu: &[u8]) -> Reply {
        let Some((&function_byte, body)) = pdu.split_first() else {
            return exception_pdu(0, ExceptionCode::IllegalFunction);
        };

        // §4.4: "Rejects with SLAVE_OR_SERVER_BUSY when application state
        // is STOP." The cycle engine's STOPPED state is this gateway's
        // application-stop: once `stop()` has zeroed outputs and closed the
        // driver, no further banks traffic is accepted.
        if self.cycle.runtime_state() == RuntimeState::Stopped {
            return exception_pdu(function_byte, ExceptionCode::SlaveOrServerBusy);
        }

        // §4.4 step 1: every accepted request resets the watchdog countdown,
        // independent of which function it carries.
        self.watchdog.kick();

        let Some(function) = FunctionCode::from_byte(function_byte) else {
            return exception_pdu(function_byte, ExceptionCode::IllegalFunction);
        };

        if function == FunctionCode::WriteAndReadRegisters {
            // §4.4 step 3: FC 0x17 answers from its own combined
            // write+read path and returns immediately; it does not go
            // through the generic post-write force-update below because
            // the force-update already happens *between* its two halves.
            return self.write_and_read_registers(body, function_byte);
        }

        let reply = match function {
            FunctionCode::ReadCoils => self.read_bits(body, function_byte, false),
            FunctionCode::ReadDiscreteInputs => self.read_bits(body, function_byte, true),
            FunctionCode::ReadHoldingRegisters | FunctionCode::ReadInputRegisters => {
                self.read_registers(body, function_byte, MAX_READ_REGISTERS, false)
            }
            FunctionCode::ReadInputRegistersExtended => {
                self.read_registers(body, function_byte, MAX_READ_REGISTERS_FC66, true)
            }
            FunctionCode::WriteSingleCoil => self.write_single_coil(body, function_byte),
            FunctionCode::WriteMultipleCoils => self.write_multiple_coils(body, function_byte),
            FunctionCode::WriteSingleRegister => self.write_single_register(body, function_byte),
            FunctionCode::WriteMultipleRegisters => self.write_multiple_registers(body, function_byte),
            FunctionCode::MaskWriteRegister => self.mask_write_register(body, function_byte),
            FunctionCode::ReportSlaveId => self.report_slave_id(function_byte),
            FunctionCode::WriteAndReadRegisters => unreachable!("handled above"),
        };

        // §4.4 step 4: "invoke the registered message-received callback
        // (bound to the cycle engine's force-update), so a write becomes
        // visible to the I/O before the ensuing read." Only a no-op unless
        // `operation_mode == 1`; see `CycleEngine::force_update`.
        self.cycle.force_update();

        reply
    }

    fn read_word(&self, target: RegisterTarget, idx: usize) -> Option<u16> {
        if target == RegisterTarget::Watchdog {
            self.watchdog.read(idx)
        } else {
            self.banks.read_register(target, idx)
        }
    }

    fn register_capacity(&self, target: RegisterTarget) -> usize {
        if target == RegisterTarget::Watchdog {
            self.watchdog.capacity()
        } else {
            self.banks.capacity(target)
        }
    }

    /// Write one register word, translating the watchdog bank's
    /// [`WriteOutcome`] into the exception the caller should reply with on
    /// rejection.
    fn write_word(&self, target: RegisterTarget, idx: usize, value: u16) -> Result<(), ExceptionCode> {
        if target == RegisterTarget::Watchdog {
            match self.watchdog.write(idx, value) {
                WriteOutcome::Ok => Ok(()),
                WriteOutcome::Rejected if idx == IDX_MIN => Err(ExceptionCode::IllegalFunction),
                WriteOutcome::Rejected => Err(ExceptionCode::IllegalDataValue),
            }
        } else if self.banks.write_register(target, idx, value) {
            Ok(())
        } else {
            Err(ExceptionCode::IllegalDataAddress)
        }
    }

    fn read_bits(&self, body: &[u8], function_byte: u8, discrete_input: bool) -> Reply {
        let Some((addr, qty)) = parse_addr_qty(body) else {
            return exception_pdu(function_byte, ExceptionCode::IllegalDataValue);
        };
        if qty == 0 || qty > MAX_COILS {
            return exception_pdu(function_byte, ExceptionCode::IllegalDataValue);
        }

        let routed = if discrete_input {
            crate::banks::route_coil_in(addr)
        } else {
            crate::banks::route_coil_out(addr)
        };
        let Some((target, start)) = routed else {
            return exception_pdu(function_byte, ExceptionCode::IllegalDataAddress);
        };
        if start + usize::from(qty) > self.banks.coil_capacity(target) {
            return exception_pdu(function_byte, ExceptionCode::IllegalDataAddress);
        }

        let bits: Vec<bool> = (0..usize::from(qty))
            .map(|i| self.banks.read_coil(target, start + i).unwrap_or(false))
            .collect();
        let packed = pack_bits(&bits);

        let mut reply = Vec::with_capacity(2 + packed.len());
        reply.push(function_byte);
        reply.push(packed.len() as u8);
        reply.extend(packed);
        reply
    }

    fn read_registers(&self, body: &[u8], function_byte: u8, max_qty: u16, extended_header: bool) -> Reply {
        let Some((addr, qty)) = parse_addr_qty(body) else {
            return exception_pdu(function_byte, ExceptionCode::IllegalDataValue);
        };
        if qty == 0 || qty > max_qty {
            return exception_pdu(function_byte, ExceptionCode::IllegalDataValue);
        }

        let Some((target, start)) = crate::banks::route_register_read(addr) else {
            return exception_pdu(function_byte, ExceptionCode::IllegalDataAddress);
        };
        if start + usize::from(qty) > self.register_capacity(target) {
            return exception_pdu(function_byte, ExceptionCode::IllegalDataAddress);
        }

        let mut values = Vec::with_capacity(usize::from(qty));
        for i in 0..usize::from(qty) {
            match self.read_word(target, start + i) {
                Some(v) => values.push(v),
                None => return exception_pdu(function_byte, ExceptionCode::IllegalDataAddress),
            }
        }

        let byte_count = values.len() * 2;
        let mut reply = Vec::with_capacity(1 + usize::from(extended_header) + 1 + byte_count);
        reply.push(function_byte);
        if extended_header {
            reply.extend_from_slice(&(byte_count as u16).to_be_bytes());
        } else {
            reply.push(byte_count as u8);
        }
        for v in values {
            reply.extend_from_slice(&v.to_be_bytes());
        }
        reply
    }

    fn write_single_coil(&self, body: &[u8], function_byte: u8) -> Reply {
        if body.len() < 4 {
            return exception_pdu(function_byte, ExceptionCode::IllegalDataValue);
        }
        let addr = u16::from_be_bytes([body[0], body[1]]);
        let raw = u16::from_be_bytes([body[2], body[3]]);
        let value = match raw {
            0xFF00 => true,
            0x0000 => false,
            _ => return exception_pdu(function_byte, ExceptionCode::IllegalDataValue),
        };

        let Some((target, bit)) = crate::banks::route_coil_out(addr) else {
            return exception_pdu(function_byte, ExceptionCode::IllegalDataAddress);
        };
        if bit >= self.banks.coil_capacity(target) || !self.banks.write_coil(target, bit, value) {
            return exception_pdu(function_byte, ExceptionCode::IllegalDataAddress);
        }

        let mut reply = vec![function_byte];
        reply.extend_from_slice(&body[0..4]);
        reply
    }

    fn write_multiple_coils(&self, body: &[u8], function_byte: u8) -> Reply {
        if body.len() < 5 {
            return exception_pdu(function_byte, ExceptionCode::IllegalDataValue);
        }
        let addr = u16::from_be_bytes([body[0], body[1]]);
        let qty = u16::from_be_bytes([body[2], body[3]]);
        let byte_count = body[4] as usize;
        let expected_bytes = (usize::from(qty) + 7) / 8;
        if qty == 0 || qty > MAX_COILS || byte_count != expected_bytes || body.len() < 5 + byte_count {
            return exception_pdu(function_byte, ExceptionCode::IllegalDataValue);
        }

        let Some((target, start)) = crate::banks::route_coil_out(addr) else {
            return exception_pdu(function_byte, ExceptionCode::IllegalDataAddress);
        };
        if start + usize::from(qty) > self.banks.coil_capacity(target) {
            return exception_pdu(function_byte, ExceptionCode::IllegalDataAddress);
        }

        let bits = unpack_bits(&body[5..5 + byte_count], usize::from(qty));
        for (i, bit) in bits.into_iter().enumerate() {
            self.banks.write_coil(target, start + i, bit);
        }

        let mut reply = vec![function_byte];
        reply.extend_from_slice(&body[0..4]);
        reply
    }

    fn write_single_register(&self, body: &[u8], function_byte: u8) -> Reply {
        if body.len() < 4 {
            return exception_pdu(function_byte, ExceptionCode::IllegalDataValue);
        }
        let addr = u16::from_be_bytes([body[0], body[1]]);
        let value = u16::from_be_bytes([body[2], body[3]]);

        let Some((target, idx)) = crate::banks::route_register_write(addr) else {
            return exception_pdu(function_byte, ExceptionCode::IllegalDataAddress);
        };
        if let Err(code) = self.write_word(target, idx, value) {
            return exception_pdu(function_byte, code);
        }

        let mut reply = vec![function_byte];
        reply.extend_from_slice(&body[0..4]);
        reply
    }

    fn write_multiple_registers(&self, body: &[u8], function_byte: u8) -> Reply {
        if body.len() < 5 {
            return exception_pdu(function_byte, ExceptionCode::IllegalDataValue);
        }
        let addr = u16::from_be_bytes([body[0], body[1]]);
        let qty = u16::from_be_bytes([body[2], body[3]]);
        let byte_count = body[4] as usize;
        if qty == 0 || qty > MAX_WRITE_REGISTERS || byte_count != usize::from(qty) * 2 || body.len() < 5 + byte_count {
            return exception_pdu(function_byte, ExceptionCode::IllegalDataValue);
        }

        let Some((target, start)) = crate::banks::route_register_write(addr) else {
            return exception_pdu(function_byte, ExceptionCode::IllegalDataAddress);
        };
        if start + usize::from(qty) > self.register_capacity(target) {
            return exception_pdu(function_byte, ExceptionCode::IllegalDataAddress);
        }

        let data = &body[5..5 + byte_count];
        for i in 0..usize::from(qty) {
            let value = u16::from_be_bytes([data[i * 2], data[i * 2 + 1]]);
            if let Err(code) = self.write_word(target, start + i, value) {
                return exception_pdu(function_byte, code);
            }
        }

        let mut reply = vec![function_byte];
        reply.extend_from_slice(&body[0..4]);
        reply
    }

    fn mask_write_register(&self, body: &[u8], function_byte: u8) -> Reply {
        if body.len() < 6 {
            return exception_pdu(function_byte, ExceptionCode::IllegalDataValue);
        }
        let addr = u16::from_be_bytes([body[0], body[1]]);
        let and_mask = u16::from_be_bytes([body[2], body[3]]);
        let or_mask = u16::from_be_bytes([body[4], body[5]]);

        let Some((read_target, read_idx)) = crate::banks::route_register_read(addr) else {
            return exception_pdu(function_byte, ExceptionCode::IllegalDataAddress);
        };
        let Some(current) = self.read_word(read_target, read_idx) else {
            return exception_pdu(function_byte, ExceptionCode::IllegalDataAddress);
        };
        let Some((write_target, write_idx)) = crate::banks::route_register_write(addr) else {
            return exception_pdu(function_byte, ExceptionCode::IllegalDataAddress);
        };

        let new_value = (current & and_mask) | (or_mask & !and_mask);
        if let Err(code) = self.write_word(write_target, write_idx, new_value) {
            return exception_pdu(function_byte, code);
        }

        let mut reply = vec![function_byte];
        reply.extend_from_slice(&body[0..6]);
        reply
    }

    /// FC 0x17: write half, then the force-update callback (so the write is
    /// visible to the I/O cycle before the read half is assembled, per §4.4
    /// and the FC 0x17 atomicity property of §8), then the read half. Both
    /// halves' banks are resolved *before* either is applied, so a bad
    /// address on either side fails the whole request without a partial
    /// write.
    fn write_and_read_registers(&self, body: &[u8], function_byte: u8) -> Reply {
        if body.len() < 9 {
            return exception_pdu(function_byte, ExceptionCode::IllegalDataValue);
        }
        let read_addr = u16::from_be_bytes([body[0], body[1]]);
        let read_qty = u16::from_be_bytes([body[2], body[3]]);
        let write_addr = u16::from_be_bytes([body[4], body[5]]);
        let write_qty = u16::from_be_bytes([body[6], body[7]]);
        let write_byte_count = body[8] as usize;

        if read_qty == 0
            || read_qty > MAX_READ_REGISTERS
            || write_qty == 0
            || write_qty > MAX_WRITE_REGISTERS
            || write_byte_count != usize::from(write_qty) * 2
            || body.len() < 9 + write_byte_count
        {
            return exception_pdu(function_byte, ExceptionCode::IllegalDataValue);
        }

        let Some((write_target, write_start)) = crate::banks::route_register_write(write_addr) else {
            return exception_pdu(function_byte, ExceptionCode::IllegalDataAddress);
        };
        if write_start + usize::from(write_qty) > self.register_capacity(write_target) {
            return exception_pdu(function_byte, ExceptionCode::IllegalDataAddress);
        }
        let Some((read_target, read_start)) = crate::banks::route_register_read(read_addr) else {
            return exception_pdu(function_byte, ExceptionCode::IllegalDataAddress);
        };
        if read_start + usize::from(read_qty) > self.register_capacity(read_target) {
            return exception_pdu(function_byte, ExceptionCode::IllegalDataAddress);
        }

        let data = &body[9..9 + write_byte_count];
        for i in 0..usize::from(write_qty) {
            let value = u16::from_be_bytes([data[i * 2], data[i * 2 + 1]]);
            if let Err(code) = self.write_word(write_target, write_start + i, value) {
                return exception_pdu(function_byte, code);
            }
        }

        // The write is now visible to the banks; kick one KBUS cycle before
        // assembling the read half so at least one cycle completes between
        // the two halves (§8 FC 0x17 atomicity).
        self.cycle.force_update();

        let mut values = Vec::with_capacity(usize::from(read_qty));
        for i in 0..usize::from(read_qty) {
            match self.read_word(read_target, read_start + i) {
                Some(v) => values.push(v),
                None => return exception_pdu(function_byte, ExceptionCode::IllegalDataAddress),
            }
        }

        let mut reply = Vec::with_capacity(2 + values.len() * 2);
        reply.push(function_byte);
        reply.push((values.len() * 2) as u8);
        for v in values {
            reply.extend_from_slice(&v.to_be_bytes());
        }
        reply
    }

    /// FC 0x11: "LMB" plus the crate version, and a run-indicator status
    /// byte (always 0xFF - the gateway always reports itself running; a
    /// stopped dispatcher already answered `SLAVE_OR_SERVER_BUSY` above).
    fn report_slave_id(&self, function_byte: u8) -> Reply {
        let mut id = SLAVE_ID_PREFIX.as_bytes().to_vec();
        id.extend_from_slice(env!("CARGO_PKG_VERSION").as_bytes());

        let mut reply = Vec::with_capacity(2 + id.len() + 1);
        reply.push(function_byte);
        reply.push((id.len() + 1) as u8);
        reply.extend(id);
        reply.push(0xFF);
        reply
    }
}

/// Parse a 4-byte `(address, quantity)` prefix shared by every read PDU.
fn parse_addr_qty(body: &[u8]) -> Option<(u16, u16)> {
    if body.len() < 4 {
        return None;
    }
    Some((u16::from_be_bytes([body[0], body[1]]), u16::from_be_bytes([body[2], body[3]])))
}
