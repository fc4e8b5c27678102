//! CAN bus primitives: frames, bus handles and an in-memory mock

pub mod bus;
pub mod frame;
pub mod mock;

pub use bus::{CanBus, SharedBus};
#[cfg(all(target_os = "linux", feature = "socketcan"))]
pub use bus::SocketCanBus;
pub use frame::{BusSide, CanFrame, CanId, MAX_PAYLOAD, MAX_STANDARD_ID};
pub use mock::MockCanBus;
