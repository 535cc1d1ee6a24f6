//! Real-time scheduling attachment for the KBUS cycle thread.
//!
//! The cycle engine runs its periodic cycle at `SCHED_FIFO` priority
//! `kbus_priority` (1..99, default 60, from configuration). Acquiring
//! realtime priority can fail in unprivileged environments (containers,
//! test sandboxes); that failure is logged and the thread continues at
//! normal scheduling rather than aborting startup.

use gw_common::{GatewayError, GatewayResult};
use tracing::{info, warn};

/// Attach the *calling* thread to `SCHED_FIFO` at the given priority.
///
/// Intended to be called from inside the KBUS cycle thread immediately
/// after it starts. `priority` must be in `1..=99`; callers validate this
/// against [`gw_common::GatewayConfig`]'s `kbus_priority` range before
/// calling.
///
/// # Errors
///
/// Returns [`GatewayError::Config`] only if `priority` is out of range.
/// A kernel-level failure to apply the scheduling policy (e.g. missing
/// `CAP_SYS_NICE`) is not an error: it is logged as a warning and the
/// thread proceeds at the default scheduling policy.
pub fn attach_rt_fifo(priority: i32) -> GatewayResult<()> {
    if !(1..=99).contains(&priority) {
        return Err(GatewayError::Config(format!(
            "kbus_priority {priority} out of range 1..99"
        )));
    }

    match set_sched_fifo(priority) {
        Ok(()) => {
            info!(priority, "KBUS cycle thread attached to SCHED_FIFO");
        }
        Err(e) => {
            warn!(
                priority,
                error = %e,
                "failed to acquire SCHED_FIFO priority, continuing at default scheduling"
            );
        }
    }

    Ok(())
}

#[cfg(target_os = "linux")]
fn set_sched_fifo(priority: i32) -> Result<(), String> {
    let param = libc::sched_param {
        sched_priority: priority,
    };

    // SAFETY: pthread_setschedparam with SCHED_FIFO affects only the
    // calling thread's scheduling class and is reverted on thread exit.
    let rc = unsafe {
        libc::pthread_setschedparam(
            libc::pthread_self(),
            libc::SCHED_FIFO,
            &param as *const libc::sched_param,
        )
    };
    if rc != 0 {
        return Err(std::io::Error::from_raw_os_error(rc).to_string());
    }

    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn set_sched_fifo(_priority: i32) -> Result<(), String> {
    Err("SCHED_FIFO not supported on this platform".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_out_of_range_priority() {
        assert!(attach_rt_fifo(0).is_err());
        assert!(attach_rt_fifo(100).is_err());
    }

    #[test]
    fn test_in_range_priority_never_errors() {
        // Even without CAP_SYS_NICE the call must succeed (warn, don't fail).
        assert!(attach_rt_fifo(60).is_ok());
    }
}
