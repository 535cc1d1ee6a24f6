//! Register-level view of the safety watchdog (§4.5): maps the 12-word
//! `WATCHDOG` bank (0x1000-0x100B) onto [`gw_runtime::Watchdog`]'s countdown
//! primitive, plus the scratch words the original leaves as plain
//! read/write registers.

use gw_runtime::Watchdog;
use std::sync::Mutex;

/// Local word index of the configured timeout (register 0).
pub const IDX_TIMEOUT: usize = 0;
/// Local word index of the trigger (register 3).
pub const IDX_TRIGGER: usize = 3;
/// Local word index of the observed minimum (register 4).
pub const IDX_MIN: usize = 4;
/// Local word index of the status read-back (register 6).
pub const IDX_STATUS: usize = 6;
/// Local word index of the stop handshake (register 8).
pub const IDX_STOP: usize = 8;

const BANK_LEN: usize = 12;

/// Result of a watchdog register write, for the dispatcher to turn into a
/// wire exception where appropriate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Accepted; reply echoes the written value.
    Ok,
    /// Register 0 written while active, or register 4 written at all.
    Rejected,
}

/// The `WATCHDOG` bank: the live countdown plus the handful of plain
/// scratch registers the original leaves unspecified.
pub struct WatchdogBank {
    watchdog: Watchdog,
    scratch: Mutex<[u16; BANK_LEN]>,
}

impl WatchdogBank {
    /// Build a new, inactive watchdog bank. `on_expire` zeroes the output
    /// banks; the cycle engine's caller wires this to
    /// [`crate::banks::GatewayBanks::zero_outputs`].
    pub fn new<F>(on_expire: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        let mut watchdog = Watchdog::new(on_expire);
        watchdog.start();
        Self {
            watchdog,
            scratch: Mutex::new([0; BANK_LEN]),
        }
    }

    /// Read one word of the bank, local index 0..11.
    #[must_use]
    pub fn read(&self, idx: usize) -> Option<u16> {
        if idx >= BANK_LEN {
            return None;
        }
        Some(match idx {
            IDX_TIMEOUT => u16::try_from(self.watchdog.timeout_ticks()).unwrap_or(u16::MAX),
            IDX_MIN => u16::try_from(self.watchdog.min_trigger_ticks()).unwrap_or(u16::MAX),
            IDX_STATUS => u16::from(self.watchdog.is_active()),
            _ => self.scratch.lock().unwrap()[idx],
        })
    }

    /// Write one word of the bank. Always echoes the value in the reply
    /// except when `WriteOutcome::Rejected` is returned (register 0 while
    /// active is `ILLEGAL_DATA_VALUE`; register 4 is always
    /// `ILLEGAL_FUNCTION` — the dispatcher distinguishes the two by which
    /// index it called with).
    pub fn write(&self, idx: usize, value: u16) -> WriteOutcome {
        match idx {
            IDX_TIMEOUT => {
                if self.watchdog.set_timeout_ticks(u32::from(value)) {
                    WriteOutcome::Ok
                } else {
                    WriteOutcome::Rejected
                }
            }
            IDX_MIN => WriteOutcome::Rejected,
            IDX_TRIGGER => {
                self.watchdog.trigger();
                self.scratch.lock().unwrap()[idx] = 0; // self-clearing
                WriteOutcome::Ok
            }
            IDX_STATUS => {
                // Generic scratch write: the original firmware accepts any
                // value here, but the next read recomputes this word from
                // `is_active()` regardless, so the written value is never
                // observed.
                self.scratch.lock().unwrap()[idx] = value;
                WriteOutcome::Ok
            }
            IDX_STOP => {
                self.watchdog.stop_handshake(value);
                WriteOutcome::Ok
            }
            _ if idx < BANK_LEN => {
                self.scratch.lock().unwrap()[idx] = value;
                WriteOutcome::Ok
            }
            _ => WriteOutcome::Rejected,
        }
    }

    /// Reload the live countdown from the current timeout. Called on every
    /// accepted Modbus request (§4.4 step 1), not only on explicit writes
    /// to register 3.
    pub fn kick(&self) {
        self.watchdog.trigger();
    }

    /// Bank capacity in words.
    #[must_use]
    pub fn capacity(&self) -> usize {
        BANK_LEN
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_self_clears_and_reads_active() {
        let bank = WatchdogBank::new(|| {});
        assert_eq!(bank.write(IDX_TRIGGER, 1), WriteOutcome::Ok);
        assert_eq!(bank.read(IDX_TRIGGER), Some(0));
        assert_eq!(bank.read(IDX_STATUS), Some(1));
    }

    #[test]
    fn test_timeout_rejected_while_active() {
        let bank = WatchdogBank::new(|| {});
        bank.write(IDX_TRIGGER, 1);
        assert_eq!(bank.write(IDX_TIMEOUT, 50), WriteOutcome::Rejected);
    }

    #[test]
    fn test_min_register_always_rejected() {
        let bank = WatchdogBank::new(|| {});
        assert_eq!(bank.write(IDX_MIN, 5), WriteOutcome::Rejected);
    }

    #[test]
    fn test_scratch_register_round_trip() {
        let bank = WatchdogBank::new(|| {});
        assert_eq!(bank.write(1, 0xABCD), WriteOutcome::Ok);
        assert_eq!(bank.read(1), Some(0xABCD));
    }

    #[test]
    fn test_stop_handshake_via_bank() {
        let bank = WatchdogBank::new(|| {});
        bank.write(IDX_TRIGGER, 1);
        assert_eq!(bank.read(IDX_STATUS), Some(1));
        bank.write(IDX_STOP, 0x55AA);
        bank.write(IDX_STOP, 0xAA55);
        assert_eq!(bank.read(IDX_STATUS), Some(0));
    }
}
