//! Two-interface CAN bridge
//!
//! Relays classic CAN frames between two interfaces, dropping identifiers on
//! a runtime-mutable blocklist, and drives a lift actuator by emitting a
//! periodic command frame on request. Operators control it over a
//! line-oriented TCP protocol or an interactive prompt.

pub mod bridge;
pub mod can;
pub mod cli;
pub mod config;
pub mod control;
pub mod error;
pub mod filter;
pub mod interface;
pub mod lift;
pub mod runtime;

pub use bridge::{BridgeLoop, BridgeState, BridgeStats, BridgeStatsSnapshot, BridgeTiming};
pub use can::{BusSide, CanBus, CanFrame, CanId, MockCanBus, SharedBus};
pub use config::BridgeConfig;
pub use control::{Command, ControlClient, ControlPlane, ControlServer};
pub use error::{BridgeError, Result};
pub use filter::FilterTable;
pub use interface::{InterfaceLifecycle, IpLinkLifecycle, LinkState, NoopLifecycle};
pub use lift::{LiftDirection, LiftTransmitter, TransmitterStatus};
pub use runtime::{start_bridge, BusSet, RunningBridge};
