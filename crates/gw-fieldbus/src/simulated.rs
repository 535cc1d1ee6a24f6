//! Simulated KBUS backend used by every test in the workspace that doesn't
//! need real backplane hardware.
//!
//! Carries a small fixed terminal table (a handful of digital and analog
//! 750-series terminals) and loops configured output bytes back to the
//! corresponding input bytes so behavioral tests can observe cross-cycle
//! effects (FC 0x17 atomicity, watchdog zeroing).

use crate::{ApplicationState, BitCounts, KbusDriver, TerminalInfo};
use gw_common::{GatewayError, GatewayResult};

/// One entry of the simulated backplane's fixed terminal table.
#[derive(Debug, Clone, Copy)]
struct SimTerminal {
    raw_id: u16,
    digital: bool,
    bit_size_in: u32,
    bit_size_out: u32,
}

const FIXED_TERMINALS: &[SimTerminal] = &[
    // Coupler-adjacent digital output terminal: 8 output bits, no inputs.
    SimTerminal {
        raw_id: 0x1502,
        digital: true,
        bit_size_in: 0,
        bit_size_out: 8,
    },
    // Digital input terminal: 8 input bits, no outputs.
    SimTerminal {
        raw_id: 0x1402,
        digital: true,
        bit_size_in: 8,
        bit_size_out: 0,
    },
    // Analog output terminal: one 16-bit channel.
    SimTerminal {
        raw_id: 0x1752,
        digital: false,
        bit_size_in: 0,
        bit_size_out: 16,
    },
    // Analog input terminal: one 16-bit channel.
    SimTerminal {
        raw_id: 0x1652,
        digital: false,
        bit_size_in: 16,
        bit_size_out: 0,
    },
];

/// A simulated KBUS backplane: fixed topology, loopback outputs-to-inputs.
///
/// Every successful `push_one_cycle` copies the bytes last written via
/// `write_bytes` into the buffer `read_bytes` will next return, so a test
/// harness can write an output word and observe the mirrored value appear
/// on the input side after one cycle, exactly as a wired-back physical
/// backplane would.
#[derive(Debug)]
pub struct SimulatedKbusDriver {
    opened: bool,
    app_state: ApplicationState,
    error_code: i32,
    terminals: Vec<TerminalInfo>,
    bit_counts: BitCounts,
    out_bytes: Vec<u8>,
    in_bytes: Vec<u8>,
    digital_in_offset: u32,
    digital_out_offset: u32,
}

impl Default for SimulatedKbusDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedKbusDriver {
    /// Create a new simulated driver. Not yet opened.
    #[must_use]
    pub fn new() -> Self {
        Self {
            opened: false,
            app_state: ApplicationState::Stopped,
            error_code: 0,
            terminals: Vec::new(),
            bit_counts: BitCounts::default(),
            out_bytes: Vec::new(),
            in_bytes: Vec::new(),
            digital_in_offset: 0,
            digital_out_offset: 0,
        }
    }

    /// Inject a bus error to be observed on the next `get_status` call.
    /// Used by tests that exercise the cycle engine's error-recovery loop.
    pub fn inject_error(&mut self, code: i32) {
        self.error_code = code;
    }

    /// Clear an injected bus error.
    pub fn clear_error(&mut self) {
        self.error_code = 0;
    }

    fn bytes_for_bits(bits: u32) -> usize {
        ((bits as usize) + 7) / 8
    }
}

impl KbusDriver for SimulatedKbusDriver {
    fn open(&mut self) -> GatewayResult<()> {
        self.opened = true;
        self.error_code = 0;
        Ok(())
    }

    fn set_application_state(&mut self, state: ApplicationState) -> GatewayResult<()> {
        if !self.opened {
            return Err(GatewayError::BusInit("driver not open".into()));
        }
        self.app_state = state;
        Ok(())
    }

    fn create_info(&mut self) -> GatewayResult<()> {
        if !self.opened {
            return Err(GatewayError::BusInit("driver not open".into()));
        }

        self.terminals.clear();
        let mut bit_offset_in = 0u32;
        let mut bit_offset_out = 0u32;
        let mut counts = BitCounts::default();

        for (idx, t) in FIXED_TERMINALS.iter().enumerate() {
            let info = TerminalInfo {
                position: u16::try_from(idx + 1).unwrap_or(u16::MAX),
                raw_id: t.raw_id,
                family: 750,
                spec1: None,
                spec2: None,
                description: format!("terminal {:04X}", t.raw_id),
                bit_offset_in,
                bit_size_in: t.bit_size_in,
                bit_offset_out,
                bit_size_out: t.bit_size_out,
            };

            if t.digital {
                counts.digital_in += t.bit_size_in;
                counts.digital_out += t.bit_size_out;
            } else {
                counts.analog_in += t.bit_size_in;
                counts.analog_out += t.bit_size_out;
            }

            bit_offset_in += t.bit_size_in;
            bit_offset_out += t.bit_size_out;
            self.terminals.push(info);
        }

        self.bit_counts = counts;
        // First digital terminal in the fixed table starts at byte 0.
        self.digital_out_offset = 0;
        self.digital_in_offset = 0;

        let total_in_bytes = Self::bytes_for_bits(bit_offset_in);
        let total_out_bytes = Self::bytes_for_bits(bit_offset_out);
        self.in_bytes = vec![0u8; total_in_bytes];
        self.out_bytes = vec![0u8; total_out_bytes];

        Ok(())
    }

    fn get_status(&self) -> GatewayResult<i32> {
        Ok(self.error_code)
    }

    fn get_digital_offsets(&self) -> (u32, u32) {
        (self.digital_in_offset, self.digital_out_offset)
    }

    fn get_terminal_info(&mut self) -> GatewayResult<Vec<TerminalInfo>> {
        Ok(self.terminals.clone())
    }

    fn get_bit_counts(&self) -> BitCounts {
        self.bit_counts
    }

    fn write_start(&mut self) -> GatewayResult<()> {
        Ok(())
    }

    fn write_bytes(&mut self, data: &[u8]) -> GatewayResult<()> {
        let n = data.len().min(self.out_bytes.len());
        self.out_bytes[..n].copy_from_slice(&data[..n]);
        Ok(())
    }

    fn write_end(&mut self) -> GatewayResult<()> {
        Ok(())
    }

    fn read_start(&mut self) -> GatewayResult<()> {
        Ok(())
    }

    fn read_bytes(&mut self, buf: &mut [u8]) -> GatewayResult<usize> {
        let n = buf.len().min(self.in_bytes.len());
        buf[..n].copy_from_slice(&self.in_bytes[..n]);
        Ok(n)
    }

    fn read_end(&mut self) -> GatewayResult<()> {
        Ok(())
    }

    fn push_one_cycle(&mut self) -> GatewayResult<()> {
        if self.error_code != 0 {
            return Err(GatewayError::BusCycle(format!(
                "simulated bus error {}",
                self.error_code
            )));
        }
        // Loop outputs back to inputs so tests can observe round-trips.
        let n = self.in_bytes.len().min(self.out_bytes.len());
        self.in_bytes[..n].copy_from_slice(&self.out_bytes[..n]);
        Ok(())
    }

    fn watchdog_trigger(&mut self) -> GatewayResult<()> {
        Ok(())
    }

    fn close(&mut self) -> GatewayResult<()> {
        self.opened = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_and_create_info() {
        let mut drv = SimulatedKbusDriver::new();
        drv.open().unwrap();
        drv.create_info().unwrap();
        assert_eq!(drv.get_terminal_info().unwrap().len(), FIXED_TERMINALS.len());
        let counts = drv.get_bit_counts();
        assert_eq!(counts.digital_out, 8);
        assert_eq!(counts.digital_in, 8);
        assert_eq!(counts.analog_out, 16);
        assert_eq!(counts.analog_in, 16);
    }

    #[test]
    fn test_loopback_cycle() {
        let mut drv = SimulatedKbusDriver::new();
        drv.open().unwrap();
        drv.create_info().unwrap();

        drv.write_bytes(&[0xAB, 0xCD, 0xEF]).unwrap();
        drv.push_one_cycle().unwrap();

        let mut buf = vec![0u8; 3];
        let n = drv.read_bytes(&mut buf).unwrap();
        assert_eq!(&buf[..n], &[0xAB, 0xCD, 0xEF][..n]);
    }

    #[test]
    fn test_injected_error_surfaces_on_cycle() {
        let mut drv = SimulatedKbusDriver::new();
        drv.open().unwrap();
        drv.create_info().unwrap();

        drv.inject_error(7);
        assert_eq!(drv.get_status().unwrap(), 7);
        assert!(drv.push_one_cycle().is_err());

        drv.clear_error();
        assert_eq!(drv.get_status().unwrap(), 0);
        assert!(drv.push_one_cycle().is_ok());
    }

    #[test]
    fn test_requires_open_before_create_info() {
        let mut drv = SimulatedKbusDriver::new();
        assert!(drv.create_info().is_err());
    }
}
