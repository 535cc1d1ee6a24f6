//! The Modbus safety watchdog: a 100-ms countdown that forces outputs to
//! zero on client inactivity.
//!
//! This module owns the countdown state machine and its background ticking
//! thread; `gw-modbus`'s WATCHDOG register bank wires Modbus reads/writes of
//! 0x1000-0x100B onto the methods here. Keeping the countdown itself here
//! (rather than in `gw-modbus`) mirrors the reference workspace's split
//! between a generic timer primitive (`gw-runtime`) and the protocol-level
//! register semantics that drive it (`gw-modbus`).

use crossbeam_utils::CachePadded;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

/// One tick of the watchdog countdown, per §4.5.
pub const TICK: Duration = Duration::from_millis(100);

/// Default timeout in 100-ms ticks (10 s).
pub const DEFAULT_TIMEOUT_TICKS: u32 = 100;

/// Magic value that arms the stop handshake (register 8).
pub const STOP_ARM: u16 = 0x55AA;
/// Magic value that completes the stop handshake while armed.
pub const STOP_CONFIRM: u16 = 0xAA55;

/// Shared countdown state, decremented by a dedicated 100-ms thread.
struct WatchdogInner {
    active: CachePadded<AtomicBool>,
    timeout_ticks: AtomicU32,
    countdown_ticks: AtomicU32,
    min_ticks: AtomicU32,
    stop_pending: AtomicBool,
    running: AtomicBool,
    on_expire: Box<dyn Fn() + Send + Sync>,
}

/// The Modbus safety watchdog.
///
/// `INACTIVE -> ACTIVE` on [`Watchdog::trigger`] (timeout > 0);
/// `ACTIVE -> INACTIVE` on expiry (invokes the expiration callback) or on a
/// completed stop handshake (no callback — a deliberate disarm).
pub struct Watchdog {
    inner: Arc<WatchdogInner>,
    thread: Option<JoinHandle<()>>,
}

impl Watchdog {
    /// Create a new, inactive watchdog with the default timeout.
    ///
    /// `on_expire` is invoked from the background tick thread when the
    /// countdown reaches zero while active; it must not block or panic.
    pub fn new<F>(on_expire: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(WatchdogInner {
                active: CachePadded::new(AtomicBool::new(false)),
                timeout_ticks: AtomicU32::new(DEFAULT_TIMEOUT_TICKS),
                countdown_ticks: AtomicU32::new(DEFAULT_TIMEOUT_TICKS),
                min_ticks: AtomicU32::new(DEFAULT_TIMEOUT_TICKS),
                stop_pending: AtomicBool::new(false),
                running: AtomicBool::new(false),
                on_expire: Box::new(on_expire),
            }),
            thread: None,
        }
    }

    /// Start the 100-ms background tick thread. Idempotent.
    pub fn start(&mut self) {
        if self.inner.running.swap(true, Ordering::AcqRel) {
            return;
        }
        let inner = Arc::clone(&self.inner);
        self.thread = Some(
            thread::Builder::new()
                .name("modbus-watchdog".into())
                .spawn(move || {
                    while inner.running.load(Ordering::Acquire) {
                        thread::sleep(TICK);
                        inner.tick();
                    }
                })
                .expect("failed to spawn watchdog thread"),
        );
    }

    /// Stop the background tick thread, joining it.
    pub fn stop_thread(&mut self) {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }

    /// Register 0: configured timeout in 100-ms ticks.
    #[must_use]
    pub fn timeout_ticks(&self) -> u32 {
        self.inner.timeout_ticks.load(Ordering::Acquire)
    }

    /// Write register 0. Honored only while inactive; also resets register 4
    /// (observed minimum) to the new timeout.
    ///
    /// Returns `false` if the watchdog is currently active (caller should
    /// reply `ILLEGAL_DATA_VALUE`).
    pub fn set_timeout_ticks(&self, ticks: u32) -> bool {
        if self.inner.active.load(Ordering::Acquire) {
            return false;
        }
        self.inner.timeout_ticks.store(ticks, Ordering::Release);
        self.inner.min_ticks.store(ticks, Ordering::Release);
        true
    }

    /// Register 4: the lowest value the live countdown has reached since the
    /// last reset (a register-0 write, or an explicit trigger-start).
    #[must_use]
    pub fn min_trigger_ticks(&self) -> u32 {
        self.inner.min_ticks.load(Ordering::Acquire)
    }

    /// Register 6: status read-back, 1 = active, 0 = inactive.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::Acquire)
    }

    /// Register 3: trigger write. Starts the watchdog if inactive, or
    /// reloads the live countdown from the *current* timeout if already
    /// active. Always succeeds (the register self-clears to 0 afterward;
    /// the caller handles that side of the protocol).
    pub fn trigger(&self) {
        let timeout = self.inner.timeout_ticks.load(Ordering::Acquire);
        self.inner.countdown_ticks.store(timeout, Ordering::Release);
        if !self.inner.active.swap(true, Ordering::AcqRel) {
            debug!(timeout_ticks = timeout, "watchdog armed");
        }
    }

    /// Register 8: stop handshake. `STOP_ARM` arms a pending-stop flag;
    /// `STOP_CONFIRM` while pending disarms the watchdog without zeroing
    /// outputs; any other value clears the pending flag.
    pub fn stop_handshake(&self, value: u16) {
        match value {
            STOP_ARM => {
                self.inner.stop_pending.store(true, Ordering::Release);
            }
            STOP_CONFIRM if self.inner.stop_pending.load(Ordering::Acquire) => {
                self.inner.stop_pending.store(false, Ordering::Release);
                self.inner.active.store(false, Ordering::Release);
                info!("watchdog stopped via magic handshake");
            }
            _ => {
                self.inner.stop_pending.store(false, Ordering::Release);
            }
        }
    }

    /// Advance the countdown by one tick. Called by the background thread;
    /// exposed for deterministic unit tests that don't want to sleep.
    pub fn tick(&self) {
        self.inner.tick();
    }
}

impl WatchdogInner {
    fn tick(&self) {
        if !self.active.load(Ordering::Acquire) {
            return;
        }

        let prev = self.countdown_ticks.load(Ordering::Acquire);
        if prev == 0 {
            return;
        }
        let next = prev - 1;
        self.countdown_ticks.store(next, Ordering::Release);

        let min = self.min_ticks.load(Ordering::Acquire);
        if next < min {
            self.min_ticks.store(next, Ordering::Release);
        }

        if next == 0 {
            self.active.store(false, Ordering::Release);
            warn!("watchdog expired, zeroing outputs");
            (self.on_expire)();
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.stop_thread();
    }
}
