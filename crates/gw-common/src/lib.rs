#![doc = "Common types shared across the gateway workspace: configuration, errors, the cycle-engine state machine, and cycle timing metrics."]

pub mod config;
pub mod error;
pub mod metrics;
pub mod state;

pub use config::*;
pub use error::*;
pub use metrics::*;
pub use state::*;
