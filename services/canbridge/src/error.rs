//! Error handling for the CAN bridge
//!
//! One error type covers the whole service. Bus failures are split into
//! transient errors, which the loops log and survive, and unavailable
//! interfaces, which end the loop that depends on them.

use std::io;

use thiserror::Error;

use crate::lift::LiftDirection;

// Linux errno values that mean the interface is gone or down rather than busy.
const ENXIO: i32 = 6;
const EBADF: i32 = 9;
const ENODEV: i32 = 19;
const ENETDOWN: i32 = 100;

/// CAN bridge error type
#[derive(Error, Debug, Clone)]
pub enum BridgeError {
    /// Malformed or out-of-range arbitration identifier
    #[error("Invalid CAN ID: {0}. Use hexadecimal (0xXXX) or decimal format (max 0x7FF)")]
    InvalidIdentifier(String),

    /// Send/receive failure on an otherwise healthy interface
    #[error("Transient bus error on {interface}: {message}")]
    TransientBusError { interface: String, message: String },

    /// Interface missing, down or misconfigured
    #[error("Interface {interface} unavailable: {message}")]
    InterfaceUnavailable { interface: String, message: String },

    /// Unparseable control-plane input
    #[error("{0}")]
    ProtocolError(String),

    /// `start` issued while the lift transmitter is already emitting
    #[error("Lift already running ({0}); send STOP first")]
    LiftAlreadyRunning(LiftDirection),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Interface lifecycle command failed
    #[error("Interface setup error: {0}")]
    LifecycleError(String),

    /// Input/Output operation errors
    #[error("IO error: {0}")]
    IoError(String),

    /// General internal errors
    #[error("Internal error: {0}")]
    InternalError(String),
}

/// Result type alias for the CAN bridge
pub type Result<T> = std::result::Result<T, BridgeError>;

impl BridgeError {
    /// Classify an I/O error raised by a bus handle bound to `interface`
    pub fn from_bus_io(interface: &str, err: &io::Error) -> Self {
        let gone = matches!(
            err.raw_os_error(),
            Some(ENXIO) | Some(EBADF) | Some(ENODEV) | Some(ENETDOWN)
        ) || err.kind() == io::ErrorKind::NotFound;

        if gone {
            BridgeError::InterfaceUnavailable {
                interface: interface.to_string(),
                message: err.to_string(),
            }
        } else {
            BridgeError::TransientBusError {
                interface: interface.to_string(),
                message: err.to_string(),
            }
        }
    }

    /// Whether this error must terminate the loop that observed it
    pub fn is_fatal(&self) -> bool {
        matches!(self, BridgeError::InterfaceUnavailable { .. })
    }
}

impl From<io::Error> for BridgeError {
    fn from(err: io::Error) -> Self {
        BridgeError::IoError(err.to_string())
    }
}

impl From<figment::Error> for BridgeError {
    fn from(err: figment::Error) -> Self {
        BridgeError::ConfigError(err.to_string())
    }
}
