#![doc = "Cyclic execution engine for the KBUS-to-Modbus gateway: the KBUS cycle loop, process image, and safety watchdog."]

pub mod bank_sync;
pub mod cycle_engine;
pub mod process_image;
pub mod realtime;
pub mod watchdog;

pub use bank_sync::{BankSync, CycleControl, NullBankSync};
pub use cycle_engine::CycleEngine;
pub use process_image::{ProcessImage, ProcessImageGuard, PD_CAPACITY};
pub use realtime::attach_rt_fifo;
pub use watchdog::Watchdog;
