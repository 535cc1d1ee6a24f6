use thiserror::Error;

/// Gateway-wide error type covering configuration, bus, and protocol faults.
///
/// Kept deliberately small and `Clone + PartialEq` so it can cross thread
/// boundaries (cycle engine -> dispatcher -> daemon) without extra wrapping.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum GatewayError {
    /// Bad configuration key or out-of-range value. Fatal at startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// Fieldbus device could not be opened or initialized. Fatal at startup.
    #[error("bus init error: {0}")]
    BusInit(String),

    /// Transient per-cycle bus fault. Not fatal; the cycle engine enters its
    /// error-recovery loop and this is surfaced only via `get-error`.
    #[error("bus cycle error: {0}")]
    BusCycle(String),

    /// Malformed Modbus ADU. Answered with an exception PDU; the connection
    /// stays open.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Well-formed request referencing a bad address/value/function.
    /// Answered with an exception PDU.
    #[error("client error: {0}")]
    Client(String),

    /// I/O failure on an accepted socket. Closes that connection only.
    #[error("socket error: {0}")]
    Socket(String),

    /// Invalid state transition attempted on the cycle engine or watchdog.
    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        /// Source state.
        from: String,
        /// Attempted target state.
        to: String,
    },
}

impl From<std::io::Error> for GatewayError {
    fn from(e: std::io::Error) -> Self {
        GatewayError::Socket(e.to_string())
    }
}

/// Convenience alias for gateway operations.
pub type GatewayResult<T> = Result<T, GatewayError>;
