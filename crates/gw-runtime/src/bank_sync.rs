//! The seam between the KBUS cycle engine and the Modbus register banks.
//!
//! `gw-modbus` owns the register banks and implements [`BankSync`] on them;
//! `gw-runtime`'s [`crate::cycle_engine::CycleEngine`] drives the process
//! image through this trait without depending on `gw-modbus` directly
//! (`gw-modbus` already depends on `gw-runtime`, so the dependency can't run
//! the other way).

use gw_common::RuntimeState;
use gw_fieldbus::TerminalInfo;

/// The seam the Modbus dispatcher drives the cycle engine through, without
/// naming its `KbusDriver` type parameter.
///
/// `gw-modbus` depends on `gw-runtime` but must stay agnostic of which
/// concrete fieldbus driver backs a given `CycleEngine<D>`; this trait
/// erases `D` so the dispatcher can hold an `Arc<dyn CycleControl>`.
pub trait CycleControl: Send + Sync {
    /// Request an out-of-band cycle (honored only in coupler mode).
    fn force_update(&self);

    /// Current lifecycle state, for the dispatcher's `APPLICATION_STOP`
    /// check (§4.4 step "Rejects with SLAVE_OR_SERVER_BUSY").
    fn runtime_state(&self) -> RuntimeState;

    /// Current bus error code, observable in any state.
    fn get_error(&self) -> i32;
}

/// Copies process data between the register banks and the process-image
/// buffers (§4.3), and zeroes outputs on watchdog expiration / bus error
/// recovery. All methods must internally take whatever lock the
/// implementation uses to guard the output banks (the "write-mapping
/// mutex" of §5); the cycle engine calls these without holding any lock of
/// its own beyond the process-image's cycle mutex.
pub trait BankSync: Send + Sync {
    /// Copy the output banks (PD-OUT-1/2) into `pd_out`'s first
    /// `min(n, 256)*2` and, if `n > 512`, remaining bytes. Returns the
    /// number of bytes actually copied, or 0 if the banks are not yet sized
    /// (mirrors `copy-register-out`'s "uninitialized -> 0" rule).
    fn copy_banks_to_pd_out(&self, pd_out: &mut [u8]) -> usize;

    /// Map the write-coil bitmap (COIL-OUT-1) onto PD-OUT-1's byte view
    /// starting at `digital_out_offset`, under the same lock as
    /// [`BankSync::copy_banks_to_pd_out`].
    fn map_write_coils_to_pd_out(&self, pd_out: &mut [u8], digital_out_offset: usize, bytes_to_write: usize);

    /// Copy `pd_in`'s first `bytes_to_read` bytes into the input banks
    /// (PD-IN-1/2). No lock: single-writer, word-tearing-tolerant readers.
    fn copy_pd_in_to_banks(&self, pd_in: &[u8]);

    /// Map the PD-IN-1 byte view back onto the read-coil bitmap
    /// (COIL-IN-1), starting at `digital_in_offset`. No lock.
    fn map_pd_in_to_read_coils(&self, pd_in: &[u8], digital_in_offset: usize);

    /// Zero every output bank under the write-mapping lock. Called on
    /// watchdog expiration and when the cycle engine re-enters setup after
    /// a bus error.
    fn zero_output_banks(&self);

    /// Publish discovered topology for the out-of-scope `/tmp/KBUS`
    /// exporter (§6 Exported State). Called once per setup, before the
    /// engine reports itself initialized.
    fn publish_topology(&self, terminals: &[TerminalInfo]);
}

/// No-op [`BankSync`] for tests that exercise the cycle engine in
/// isolation from the register banks.
#[derive(Debug, Default)]
pub struct NullBankSync;

impl BankSync for NullBankSync {
    fn copy_banks_to_pd_out(&self, _pd_out: &mut [u8]) -> usize {
        0
    }

    fn map_write_coils_to_pd_out(&self, _pd_out: &mut [u8], _digital_out_offset: usize, _bytes_to_write: usize) {}

    fn copy_pd_in_to_banks(&self, _pd_in: &[u8]) {}

    fn map_pd_in_to_read_coils(&self, _pd_in: &[u8], _digital_in_offset: usize) {}

    fn zero_output_banks(&self) {}

    fn publish_topology(&self, _terminals: &[TerminalInfo]) {}
}
