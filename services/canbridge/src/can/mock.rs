//! Mock CAN bus for testing
//!
//! In-memory bus handle for exercising the bridge, the transmitter and the
//! control plane without CAN hardware. Frames injected with
//! [`MockCanBus::inject`] are returned by `try_recv`; frames passed to `send`
//! are recorded for inspection.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;

use super::bus::CanBus;
use super::frame::CanFrame;
use crate::error::{BridgeError, Result};

#[derive(Debug, Default)]
struct MockBusState {
    /// Frames waiting to be received
    receive_queue: VecDeque<CanFrame>,
    /// History of sent frames
    sent: Vec<CanFrame>,
}

/// Mock bus handle
#[derive(Debug)]
pub struct MockCanBus {
    interface: String,
    state: Mutex<MockBusState>,
    failing_sends: AtomicUsize,
    unavailable: AtomicBool,
}

impl MockCanBus {
    pub fn new(interface: &str) -> Self {
        Self {
            interface: interface.to_string(),
            state: Mutex::new(MockBusState::default()),
            failing_sends: AtomicUsize::new(0),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Make a frame available to the next `try_recv`
    pub fn inject(&self, frame: CanFrame) {
        self.state.lock().receive_queue.push_back(frame);
    }

    /// Frames still waiting to be received
    pub fn pending(&self) -> usize {
        self.state.lock().receive_queue.len()
    }

    /// Copy of every frame sent so far
    pub fn sent_frames(&self) -> Vec<CanFrame> {
        self.state.lock().sent.clone()
    }

    pub fn sent_count(&self) -> usize {
        self.state.lock().sent.len()
    }

    /// Fail the next `count` sends with a transient error
    pub fn fail_next_sends(&self, count: usize) {
        self.failing_sends.store(count, Ordering::SeqCst);
    }

    /// Simulate the interface disappearing
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(BridgeError::InterfaceUnavailable {
                interface: self.interface.clone(),
                message: "No such device".to_string(),
            });
        }
        Ok(())
    }
}

impl CanBus for MockCanBus {
    fn interface(&self) -> &str {
        &self.interface
    }

    fn try_recv(&self) -> Result<Option<CanFrame>> {
        self.check_available()?;
        Ok(self.state.lock().receive_queue.pop_front())
    }

    fn send(&self, frame: &CanFrame) -> Result<()> {
        self.check_available()?;

        let consumed = self
            .failing_sends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if consumed {
            let err = io::Error::other("No buffer space available");
            return Err(BridgeError::from_bus_io(&self.interface, &err));
        }

        self.state.lock().sent.push(*frame);
        Ok(())
    }
}
