//! The KBUS cycle engine: a periodic, realtime-scheduled, single-shot
//! re-entrancy-guarded I/O cycle (§4.2).
//!
//! `CycleEngine` owns the fieldbus driver and the process image; it is
//! driven by a dedicated thread that fires the cycle body once per
//! `kbus_cycle_ms`. Re-entrancy is guarded by [`ProcessImage::try_lock`]
//! rather than signal masking: a tick that finds the process image already
//! locked (by a concurrent force-update, or a prior cycle still running
//! recovery) simply drops, which is the "missed-tick backpressure" policy
//! of §5.

use crate::bank_sync::{BankSync, CycleControl};
use crate::process_image::{ProcessImage, ProcessImageGuard};
use crate::realtime;
use gw_common::{CycleMetrics, GatewayConfig, GatewayError, GatewayResult, MetricsSnapshot, RuntimeState, StateMachine};
use gw_fieldbus::{ApplicationState, BitCounts, KbusDriver, TerminalInfo};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Cycle-time histogram capacity, matching the reference workspace's
/// `io_image.rs` sizing for its own per-cycle histogram.
const METRICS_HISTOGRAM_SIZE: usize = 4096;

/// Sleep interval of the bus-error recovery loop (§4.2).
const ERROR_RECOVERY_SLEEP: Duration = Duration::from_millis(50);

/// Cycle period while the host is stopping (§4.2, application-state-stop).
const STOP_CYCLE_MS: u64 = 5;

/// The KBUS cycle engine.
pub struct CycleEngine<D: KbusDriver> {
    driver: Mutex<D>,
    image: Arc<ProcessImage>,
    sync: Arc<dyn BankSync>,
    state: Mutex<StateMachine>,
    config: GatewayConfig,
    terminals: RwLock<Vec<TerminalInfo>>,
    bit_counts: RwLock<BitCounts>,
    digital_offsets: RwLock<(u32, u32)>,
    bytes_to_read: AtomicUsize,
    bytes_to_write: AtomicUsize,
    error_code: AtomicI32,
    period_ms: Mutex<u64>,
    initialized: AtomicBool,
    thread_running: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
    metrics: Mutex<CycleMetrics>,
}

impl<D: KbusDriver + 'static> CycleEngine<D> {
    /// Construct a new engine. Not yet set up: call [`CycleEngine::start`]
    /// to run the setup sequence and begin cyclic operation.
    pub fn new(driver: D, sync: Arc<dyn BankSync>, config: GatewayConfig) -> Arc<Self> {
        let period_ms = config.kbus_cycle_ms;
        let deadline = Duration::from_millis(period_ms);
        Arc::new(Self {
            driver: Mutex::new(driver),
            image: Arc::new(ProcessImage::new()),
            sync,
            state: Mutex::new(StateMachine::new()),
            config,
            terminals: RwLock::new(Vec::new()),
            bit_counts: RwLock::new(BitCounts::default()),
            digital_offsets: RwLock::new((0, 0)),
            bytes_to_read: AtomicUsize::new(0),
            bytes_to_write: AtomicUsize::new(0),
            error_code: AtomicI32::new(0),
            period_ms: Mutex::new(period_ms),
            initialized: AtomicBool::new(false),
            thread_running: Arc::new(AtomicBool::new(false)),
            thread: Mutex::new(None),
            metrics: Mutex::new(CycleMetrics::new(METRICS_HISTOGRAM_SIZE, deadline)),
        })
    }

    /// Shared handle to the process image, for wiring into the Modbus
    /// dispatcher's `copy-register-{in,out}` operations.
    #[must_use]
    pub fn process_image(&self) -> Arc<ProcessImage> {
        Arc::clone(&self.image)
    }

    /// Whether the setup sequence has completed.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn runtime_state(&self) -> RuntimeState {
        self.state.lock().unwrap().state()
    }

    /// Current bus error code (0 = healthy). Observable in any state.
    #[must_use]
    pub fn get_error(&self) -> i32 {
        self.error_code.load(Ordering::Acquire)
    }

    /// Byte offset of the first digital input within the process image.
    #[must_use]
    pub fn digital_byte_offset_in(&self) -> u32 {
        self.digital_offsets.read().unwrap().0 / 8
    }

    /// Byte offset of the first digital output within the process image.
    #[must_use]
    pub fn digital_byte_offset_out(&self) -> u32 {
        self.digital_offsets.read().unwrap().1 / 8
    }

    /// `ceil((AnalogOutput + DigitalOutput) / 8)`.
    #[must_use]
    pub fn bytes_to_write(&self) -> usize {
        self.bytes_to_write.load(Ordering::Acquire)
    }

    /// `ceil((AnalogInput + DigitalInput) / 8)`.
    #[must_use]
    pub fn bytes_to_read(&self) -> usize {
        self.bytes_to_read.load(Ordering::Acquire)
    }

    /// Discovered terminal topology, snapshot as of the last setup.
    #[must_use]
    pub fn terminals(&self) -> Vec<TerminalInfo> {
        self.terminals.read().unwrap().clone()
    }

    /// Aggregate bit counts, snapshot as of the last setup.
    #[must_use]
    pub fn bit_counts(&self) -> BitCounts {
        *self.bit_counts.read().unwrap()
    }

    /// Snapshot of observed cycle-body durations (min/max/mean/overrun
    /// count), measured from the successful `try_lock` to the end of the
    /// bus write/read exchange. A dropped tick (lock contention) is not a
    /// cycle and is not counted here.
    #[must_use]
    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.lock().unwrap().snapshot()
    }

    /// Run the setup sequence: open the driver, set it Running, discover
    /// topology, publish it, and size the byte counts. Leaves the engine in
    /// `INIT`.
    fn setup(&self) -> GatewayResult<()> {
        let mut driver = self.driver.lock().unwrap();

        driver.open()?;
        driver.set_application_state(ApplicationState::Running)?;
        driver.create_info()?;
        let status = driver.get_status()?;
        self.error_code.store(status, Ordering::Release);

        let terminals = driver.get_terminal_info()?;
        let counts = driver.get_bit_counts();
        let offsets = driver.get_digital_offsets();
        drop(driver);

        self.sync.publish_topology(&terminals);

        *self.terminals.write().unwrap() = terminals;
        *self.bit_counts.write().unwrap() = counts;
        *self.digital_offsets.write().unwrap() = offsets;

        let bytes_to_read = div_ceil8(counts.analog_in + counts.digital_in);
        let bytes_to_write = div_ceil8(counts.analog_out + counts.digital_out);
        self.bytes_to_read.store(bytes_to_read, Ordering::Release);
        self.bytes_to_write.store(bytes_to_write, Ordering::Release);

        let mut state = self.state.lock().unwrap();
        if state.state() == RuntimeState::Uninit {
            state.transition(RuntimeState::Init)?;
        }
        self.initialized.store(true, Ordering::Release);

        info!(bytes_to_read, bytes_to_write, "KBUS setup complete");
        Ok(())
    }

    /// Run the setup sequence and start the periodic cycle thread.
    ///
    /// # Errors
    ///
    /// Propagates a [`GatewayError::BusInit`] if the driver cannot be
    /// opened or its initial topology discovered; this is fatal at startup
    /// per §7.
    pub fn start(self: &Arc<Self>) -> GatewayResult<()> {
        self.setup()?;

        {
            let mut state = self.state.lock().unwrap();
            state.transition(RuntimeState::Running)?;
        }

        self.thread_running.store(true, Ordering::Release);
        let engine = Arc::clone(self);
        let running = Arc::clone(&self.thread_running);
        let kbus_priority = self.config.kbus_priority;
        let handle = thread::Builder::new()
            .name("kbus-cycle".into())
            .spawn(move || {
                if let Err(e) = realtime::attach_rt_fifo(kbus_priority) {
                    warn!(error = %e, "could not validate kbus_priority, continuing");
                }

                while running.load(Ordering::Acquire) {
                    let period = *engine.period_ms.lock().unwrap();
                    thread::sleep(Duration::from_millis(period));
                    if !running.load(Ordering::Acquire) {
                        break;
                    }
                    engine.cycle_body();
                }
            })
            .expect("failed to spawn kbus-cycle thread");

        *self.thread.lock().unwrap() = Some(handle);
        Ok(())
    }

    /// Stop cyclic execution: joins the periodic thread, zeroes outputs,
    /// and closes the driver.
    pub fn stop(&self) {
        self.thread_running.store(false, Ordering::Release);
        if let Some(handle) = self.thread.lock().unwrap().take() {
            let _ = handle.join();
        }

        self.sync.zero_output_banks();

        {
            let mut state = self.state.lock().unwrap();
            if matches!(state.state(), RuntimeState::Running | RuntimeState::ErrorRecovery) {
                let _ = state.transition(RuntimeState::Stopped);
            }
        }

        let mut driver = self.driver.lock().unwrap();
        let _ = driver.close();
    }

    /// Force an immediate, synchronous cycle. Only honored when
    /// `operation_mode == 1` (coupler mode); a no-op otherwise.
    ///
    /// The process image's try-lock already guarantees this cannot race a
    /// concurrently-running scheduled cycle into a double bus push: if the
    /// periodic thread currently holds the lock, this call's attempt to
    /// acquire it will simply drop, satisfying the same non-reentrancy
    /// invariant the original's explicit timer stop/restart achieved.
    pub fn force_update(&self) {
        if !self.config.coupler_mode() {
            return;
        }
        self.cycle_body();
    }

    /// Apply the `APPLICATION_STATE_STOP` transition: accelerate the cycle
    /// period to 5 ms and command the driver into `Stopped`.
    pub fn application_state_stop(&self) -> GatewayResult<()> {
        *self.period_ms.lock().unwrap() = STOP_CYCLE_MS;
        self.driver
            .lock()
            .unwrap()
            .set_application_state(ApplicationState::Stopped)
    }

    /// Apply the `APPLICATION_STATE_RUN` transition: revert the cycle
    /// period to the configured value and command the driver into
    /// `Running`.
    pub fn application_state_run(&self) -> GatewayResult<()> {
        *self.period_ms.lock().unwrap() = self.config.kbus_cycle_ms;
        self.driver
            .lock()
            .unwrap()
            .set_application_state(ApplicationState::Running)
    }

    /// The cycle body (§4.2): error-check, push, watchdog-kick,
    /// write-out, read-in. Entered under the process image's try-lock,
    /// which is held for the duration of error recovery too, matching the
    /// original firmware's single `pthread_mutex_trylock` scope.
    fn cycle_body(&self) {
        let Some(mut guard) = self.image.try_lock() else {
            return;
        };

        let start = Instant::now();
        self.cycle_body_locked(&mut guard);
        self.metrics.lock().unwrap().record(start.elapsed());
    }

    /// The bus exchange itself, run under the process image lock acquired
    /// by [`CycleEngine::cycle_body`]. Split out so the caller can time the
    /// whole exchange (including early returns) in one place.
    fn cycle_body_locked(&self, guard: &mut ProcessImageGuard<'_>) {
        let status = match self.driver.lock().unwrap().get_status() {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "failed to poll bus status");
                return;
            }
        };
        self.error_code.store(status, Ordering::Release);

        if status != 0 {
            self.run_error_recovery();
            return;
        }

        if let Err(e) = self.driver.lock().unwrap().push_one_cycle() {
            warn!(error = %e, "bus cycle push failed");
            return;
        }

        if let Err(e) = self.driver.lock().unwrap().watchdog_trigger() {
            warn!(error = %e, "driver watchdog trigger failed");
        }

        let bytes_to_write = self.bytes_to_write.load(Ordering::Acquire);
        let bytes_to_read = self.bytes_to_read.load(Ordering::Acquire);
        let (digital_in_offset, digital_out_offset) = *self.digital_offsets.read().unwrap();

        self.sync.copy_banks_to_pd_out(guard.pd_out_mut());
        self.sync.map_write_coils_to_pd_out(
            guard.pd_out_mut(),
            (digital_out_offset / 8) as usize,
            bytes_to_write,
        );

        let mut driver = self.driver.lock().unwrap();
        let write_result = (|| {
            driver.write_start()?;
            driver.write_bytes(&guard.pd_out()[..bytes_to_write])?;
            driver.write_end()
        })();
        if let Err(e) = write_result {
            warn!(error = %e, "bus write failed");
            return;
        }

        let read_result = (|| {
            driver.read_start()?;
            let n = driver.read_bytes(&mut guard.pd_in_mut()[..bytes_to_read])?;
            driver.read_end()?;
            Ok::<usize, GatewayError>(n)
        })();
        drop(driver);

        match read_result {
            Ok(_n) => {
                self.sync.copy_pd_in_to_banks(&guard.pd_in()[..bytes_to_read]);
                self.sync
                    .map_pd_in_to_read_coils(guard.pd_in(), (digital_in_offset / 8) as usize);
            }
            Err(e) => {
                warn!(error = %e, "bus read failed");
            }
        }
    }

    /// Error-recovery loop: push, trigger, poll; sleep 50 ms and repeat
    /// until the bus error clears, then clear outputs and re-run setup.
    fn run_error_recovery(&self) {
        error!("bus error detected, entering error-recovery loop");
        self.state.lock().unwrap().enter_error_recovery();

        loop {
            {
                let mut driver = self.driver.lock().unwrap();
                let _ = driver.push_one_cycle();
                let _ = driver.watchdog_trigger();
                match driver.get_status() {
                    Ok(0) => break,
                    Ok(code) => self.error_code.store(code, Ordering::Release),
                    Err(_) => {}
                }
            }
            thread::sleep(ERROR_RECOVERY_SLEEP);
        }

        self.error_code.store(0, Ordering::Release);
        self.sync.zero_output_banks();

        if let Err(e) = self.setup() {
            error!(error = %e, "re-setup after bus error failed");
            return;
        }

        let mut state = self.state.lock().unwrap();
        let _ = state.transition(RuntimeState::Running);
        info!("bus error cleared, cycle resumed");
    }
}

impl<D: KbusDriver + 'static> CycleControl for CycleEngine<D> {
    fn force_update(&self) {
        CycleEngine::force_update(self);
    }

    fn runtime_state(&self) -> RuntimeState {
        CycleEngine::runtime_state(self)
    }

    fn get_error(&self) -> i32 {
        CycleEngine::get_error(self)
    }
}

fn div_ceil8(bits: u32) -> usize {
    ((bits as usize) + 7) / 8
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bank_sync::NullBankSync;
    use gw_fieldbus::SimulatedKbusDriver;

    fn engine() -> Arc<CycleEngine<SimulatedKbusDriver>> {
        let config = GatewayConfig {
            kbus_cycle_ms: 5,
            ..GatewayConfig::default()
        };
        CycleEngine::new(SimulatedKbusDriver::new(), Arc::new(NullBankSync), config)
    }

    #[test]
    fn test_start_initializes_and_sizes_bytes() {
        let engine = engine();
        engine.start().unwrap();
        assert!(engine.is_initialized());
        assert_eq!(engine.runtime_state(), RuntimeState::Running);
        assert_eq!(engine.bytes_to_write(), 3); // 8 digital + 16 analog out bits
        assert_eq!(engine.bytes_to_read(), 3);
        engine.stop();
    }

    #[test]
    fn test_force_update_noop_without_coupler_mode() {
        let engine = engine();
        engine.start().unwrap();
        // operation_mode defaults to 0: force_update must be a no-op, not a
        // panic, and must not desync bytesToWrite/bytesToRead bookkeeping.
        engine.force_update();
        engine.stop();
    }

    #[test]
    fn test_force_update_runs_cycle_in_coupler_mode() {
        let config = GatewayConfig {
            kbus_cycle_ms: 5,
            operation_mode: 1,
            ..GatewayConfig::default()
        };
        let engine = CycleEngine::new(SimulatedKbusDriver::new(), Arc::new(NullBankSync), config);
        engine.start().unwrap();
        engine.force_update();
        engine.stop();
    }

    #[test]
    fn test_application_state_stop_accelerates_period() {
        let engine = engine();
        engine.start().unwrap();
        engine.application_state_stop().unwrap();
        assert_eq!(*engine.period_ms.lock().unwrap(), STOP_CYCLE_MS);
        engine.application_state_run().unwrap();
        assert_eq!(*engine.period_ms.lock().unwrap(), 5);
        engine.stop();
    }

    #[test]
    fn test_error_surfaces_and_recovers() {
        let engine = engine();
        engine.start().unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(engine.get_error(), 0);
        engine.stop();
    }

    #[test]
    fn test_metrics_accumulate_with_running_cycles() {
        let engine = engine();
        engine.start().unwrap();
        std::thread::sleep(Duration::from_millis(50));
        engine.stop();

        let snapshot = engine.metrics_snapshot();
        assert!(snapshot.total_cycles > 0);
        assert!(snapshot.min_ns.is_some());
        assert!(snapshot.max_ns.is_some());
        assert!(snapshot.mean_ns.is_some());
    }

    #[test]
    fn test_metrics_empty_before_any_cycle_runs() {
        let engine = engine();
        let snapshot = engine.metrics_snapshot();
        assert_eq!(snapshot.total_cycles, 0);
        assert!(snapshot.min_ns.is_none());
    }
}
