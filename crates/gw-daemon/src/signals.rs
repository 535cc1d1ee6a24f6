//! Unix signal handling for graceful shutdown.
//!
//! `main.c`'s `signal_handler` sets a single `main_running` flag for
//! SIGINT/SIGABRT/SIGTERM (SIGKILL cannot actually be caught; the original
//! registers a handler for it anyway, which the kernel silently ignores) and
//! the main loop polls it every second. SIGHUP is ignored once daemonized.
//! This mirrors that shape with an atomic flag set from `extern "C"`
//! handlers, which must stay async-signal-safe.

use std::os::raw::c_int;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_shutdown_signal(_sig: c_int) {
    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
}

/// Handle to the process-wide shutdown flag.
///
/// Cheap to clone; every clone observes the same underlying flag.
#[derive(Clone, Default)]
pub struct SignalHandler {
    installed: Arc<AtomicBool>,
}

impl SignalHandler {
    /// Install handlers for SIGINT, SIGABRT, and SIGTERM.
    ///
    /// # Errors
    ///
    /// Returns an error if `libc::signal` reports failure (`SIG_ERR`).
    pub fn install() -> std::io::Result<Self> {
        // SAFETY: the handler only stores to a static atomic, which is
        // async-signal-safe; no allocation or locking happens inside it.
        unsafe {
            for sig in [libc::SIGINT, libc::SIGABRT, libc::SIGTERM] {
                if libc::signal(sig, handle_shutdown_signal as libc::sighandler_t) == libc::SIG_ERR
                {
                    return Err(std::io::Error::last_os_error());
                }
            }
        }
        Ok(Self {
            installed: Arc::new(AtomicBool::new(true)),
        })
    }

    /// Ignore SIGHUP, matching `start_daemon`'s behavior once detached from
    /// the controlling terminal.
    ///
    /// # Errors
    ///
    /// Returns an error if `libc::signal` reports failure.
    pub fn ignore_sighup() -> std::io::Result<()> {
        // SAFETY: SIG_IGN is a sentinel value, not a function pointer; no
        // handler code runs.
        unsafe {
            if libc::signal(libc::SIGHUP, libc::SIG_IGN) == libc::SIG_ERR {
                return Err(std::io::Error::last_os_error());
            }
        }
        Ok(())
    }

    /// Whether a shutdown signal has been received.
    #[must_use]
    pub fn shutdown_requested(&self) -> bool {
        SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown_flag_starts_clear() {
        // Other tests in the same binary may have already tripped the
        // static flag; only assert the type is usable, not the global state.
        let handler = SignalHandler {
            installed: Arc::new(AtomicBool::new(true)),
        };
        let _ = handler.shutdown_requested();
    }

    #[test]
    fn test_manual_trip_is_observed() {
        SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
        let handler = SignalHandler {
            installed: Arc::new(AtomicBool::new(true)),
        };
        assert!(handler.shutdown_requested());
        SHUTDOWN_REQUESTED.store(false, Ordering::SeqCst);
    }
}
