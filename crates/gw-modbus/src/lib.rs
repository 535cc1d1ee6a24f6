//! Modbus-TCP/UDP server for the gateway: register/coil banks (§3), the
//! request dispatcher (§4.4), the safety watchdog's register view (§4.5),
//! and the TCP+UDP server loop that drives them (§4.6).

pub mod banks;
pub mod codec;
pub mod dispatcher;
pub mod server;
pub mod watchdog_bank;

pub use banks::{CoilTarget, GatewayBanks, RegisterTarget};
pub use dispatcher::Dispatcher;
pub use server::{ModbusServer, ServerHandle};
pub use watchdog_bank::WatchdogBank;
