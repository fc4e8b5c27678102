//! Bus handles
//!
//! A [`CanBus`] is a non-blocking endpoint bound to one interface. The bridge
//! loop polls two of them; the lift transmitter writes to a third.

use std::sync::Arc;

use crate::error::Result;

use super::frame::CanFrame;

/// Non-blocking send/receive endpoint bound to one CAN interface
pub trait CanBus: Send + Sync {
    /// Interface name, e.g. `can0`
    fn interface(&self) -> &str;

    /// Poll for the next frame without blocking.
    ///
    /// `Ok(None)` means nothing is pending right now.
    fn try_recv(&self) -> Result<Option<CanFrame>>;

    /// Queue one frame for transmission without blocking.
    fn send(&self, frame: &CanFrame) -> Result<()>;
}

/// Shared bus handle
pub type SharedBus = Arc<dyn CanBus>;

#[cfg(all(target_os = "linux", feature = "socketcan"))]
pub use self::socketcan_impl::SocketCanBus;

#[cfg(all(target_os = "linux", feature = "socketcan"))]
mod socketcan_impl {
    use std::io;

    use socketcan::{CanSocket, EmbeddedFrame, Id, Socket, StandardId};
    use tracing::{debug, trace};

    use super::CanBus;
    use crate::can::frame::{CanFrame, CanId};
    use crate::error::{BridgeError, Result};

    /// Convert a received frame, or `None` for frames the bridge does not
    /// relay (remote, error and extended-id frames)
    fn bridgeable(interface: &str, raw: socketcan::CanFrame) -> Result<Option<CanFrame>> {
        let socketcan::CanFrame::Data(data_frame) = raw else {
            trace!("{}: skipping remote/error frame", interface);
            return Ok(None);
        };

        match data_frame.id() {
            Id::Standard(sid) => {
                let id = CanId::new(sid.as_raw())?;
                CanFrame::new(id, data_frame.data()).map(Some)
            },
            Id::Extended(eid) => {
                trace!("{}: skipping extended frame 0x{:X}", interface, eid.as_raw());
                Ok(None)
            },
        }
    }

    /// SocketCAN raw socket in non-blocking mode
    pub struct SocketCanBus {
        interface: String,
        socket: CanSocket,
    }

    impl SocketCanBus {
        /// Open a raw CAN socket on `interface`
        pub fn open(interface: &str) -> Result<Self> {
            debug!("Opening CAN interface: {}", interface);

            let socket =
                CanSocket::open(interface).map_err(|e| BridgeError::from_bus_io(interface, &e))?;
            socket
                .set_nonblocking(true)
                .map_err(|e| BridgeError::from_bus_io(interface, &e))?;

            Ok(Self {
                interface: interface.to_string(),
                socket,
            })
        }
    }

    impl CanBus for SocketCanBus {
        fn interface(&self) -> &str {
            &self.interface
        }

        fn try_recv(&self) -> Result<Option<CanFrame>> {
            loop {
                let raw = match self.socket.read_frame() {
                    Ok(frame) => frame,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                    Err(e) => return Err(BridgeError::from_bus_io(&self.interface, &e)),
                };
                if let Some(frame) = bridgeable(&self.interface, raw)? {
                    return Ok(Some(frame));
                }
            }
        }

        fn send(&self, frame: &CanFrame) -> Result<()> {
            let sid = StandardId::new(frame.id().raw())
                .ok_or_else(|| BridgeError::InvalidIdentifier(frame.id().to_string()))?;
            let raw = socketcan::CanFrame::new(sid, frame.data()).ok_or_else(|| {
                BridgeError::InternalError(format!("Cannot encode frame {frame}"))
            })?;

            self.socket
                .write_frame(&raw)
                .map_err(|e| BridgeError::from_bus_io(&self.interface, &e))
        }
    }

}
