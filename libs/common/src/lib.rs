//! canbridge basic library
//!
//! Provides basic functions shared by the bridge service and its tools:
//! - logging setup
//! - graceful shutdown signal handling

pub mod logging;
pub mod shutdown;

pub use logging::{init_with_config, LogConfig, LogGuard, LoggingError};
pub use shutdown::{cancel_on_signal, wait_for_shutdown};
