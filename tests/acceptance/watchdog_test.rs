//! Watchdog fault-handling acceptance tests.
//!
//! These drive the real [`gw_runtime::Watchdog`] background tick thread
//! end to end (no simulated stand-in): arm it, let it run unattended, and
//! check that it expires on schedule and invokes the output-zeroing
//! callback exactly when the countdown reaches zero.
//!
//! # Acceptance criteria
//!
//! - A watchdog that is never kicked expires within one tick of its
//!   configured timeout and the expiry callback fires exactly once.
//! - A watchdog kicked faster than its timeout never expires.
//! - The stop handshake disarms the watchdog without running the expiry
//!   callback.

use gw_runtime::Watchdog;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Background-thread expiry: an un-kicked watchdog must trip on its own and
/// zero outputs via the expiry callback.
#[test]
fn test_background_expiry_zeroes_outputs() {
    let fired = Arc::new(AtomicUsize::new(0));
    let fired2 = Arc::clone(&fired);
    let mut wd = Watchdog::new(move || {
        fired2.fetch_add(1, Ordering::Relaxed);
    });
    assert!(wd.set_timeout_ticks(2)); // 200ms
    wd.start();
    wd.trigger();

    let start = Instant::now();
    while wd.is_active() {
        if start.elapsed() > Duration::from_secs(2) {
            panic!("watchdog did not expire within 2s of a 200ms timeout");
        }
        std::thread::sleep(Duration::from_millis(20));
    }

    assert_eq!(fired.load(Ordering::Relaxed), 1, "expiry callback must fire exactly once");
    wd.stop_thread();
}

/// Regular kicking (faster than the timeout) must keep the watchdog armed
/// and never invoke the expiry callback.
#[test]
fn test_regular_kicks_prevent_expiry() {
    let fired = Arc::new(AtomicUsize::new(0));
    let fired2 = Arc::clone(&fired);
    let mut wd = Watchdog::new(move || {
        fired2.fetch_add(1, Ordering::Relaxed);
    });
    assert!(wd.set_timeout_ticks(3)); // 300ms
    wd.start();
    wd.trigger();

    for _ in 0..10 {
        std::thread::sleep(Duration::from_millis(100));
        wd.trigger();
        assert!(wd.is_active(), "watchdog expired despite regular kicks");
    }

    assert_eq!(fired.load(Ordering::Relaxed), 0);
    wd.stop_thread();
}

/// The stop handshake disarms the watchdog immediately, without running
/// the expiry (output-zeroing) callback.
#[test]
fn test_stop_handshake_disarms_without_zeroing_outputs() {
    let fired = Arc::new(AtomicUsize::new(0));
    let fired2 = Arc::clone(&fired);
    let mut wd = Watchdog::new(move || {
        fired2.fetch_add(1, Ordering::Relaxed);
    });
    assert!(wd.set_timeout_ticks(50)); // 5s, far longer than the test runs
    wd.start();
    wd.trigger();
    assert!(wd.is_active());

    wd.stop_handshake(0x55AA);
    wd.stop_handshake(0xAA55);

    assert!(!wd.is_active());
    assert_eq!(fired.load(Ordering::Relaxed), 0, "stop handshake must not run the expiry callback");
    wd.stop_thread();
}

/// The observed low-water mark (register 4) must track real elapsed ticks
/// under the live background thread, not just the manual `tick()` used by
/// the crate's own unit tests.
#[test]
fn test_min_trigger_ticks_tracks_background_thread() {
    let mut wd = Watchdog::new(|| {});
    assert!(wd.set_timeout_ticks(10)); // 1s
    wd.start();
    wd.trigger();

    std::thread::sleep(Duration::from_millis(450));
    let min = wd.min_trigger_ticks();
    assert!(min < 10, "low-water mark should have dropped below the configured timeout, got {min}");
    assert!(wd.is_active(), "watchdog should still be armed at ~4.5 ticks of a 10-tick timeout");

    wd.stop_thread();
}

/// Re-arming before expiry (a fresh trigger) must reload the countdown
/// without raising the already-observed low-water mark back up.
#[test]
fn test_retrigger_reloads_countdown_but_not_min() {
    let mut wd = Watchdog::new(|| {});
    assert!(wd.set_timeout_ticks(5)); // 500ms
    wd.start();
    wd.trigger();

    std::thread::sleep(Duration::from_millis(350));
    let min_before = wd.min_trigger_ticks();
    assert!(min_before < 5);

    wd.trigger(); // kick again well before expiry
    std::thread::sleep(Duration::from_millis(50));
    assert!(wd.is_active());
    assert_eq!(
        wd.min_trigger_ticks(),
        min_before,
        "a fresh trigger must not raise the low-water mark"
    );

    wd.stop_thread();
}
