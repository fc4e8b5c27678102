//! CAN interface lifecycle
//!
//! Brings the bridged interfaces up before the bridge starts and down on
//! shutdown. The real implementation shells out to `ip link`; the no-op
//! implementation is for virtual or externally managed interfaces.

use std::fmt;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::{BridgeError, Result};

/// Operational state reported by the interface provider
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Up,
    Down,
    Unknown,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkState::Up => write!(f, "UP"),
            LinkState::Down => write!(f, "DOWN"),
            LinkState::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// Human-readable status line for one interface
pub fn describe(interface: &str, state: LinkState) -> String {
    match state {
        LinkState::Up => format!("{interface} is UP"),
        LinkState::Down => format!("{interface} is DOWN"),
        LinkState::Unknown => format!("{interface} state is unknown"),
    }
}

/// Extract the link state from `ip link show` output
pub fn parse_link_state(output: &str) -> LinkState {
    if output.contains("state UP") {
        LinkState::Up
    } else if output.contains("state DOWN") {
        LinkState::Down
    } else {
        LinkState::Unknown
    }
}

/// Interface setup provider
#[async_trait]
pub trait InterfaceLifecycle: Send + Sync {
    /// Configure and bring `interface` up, resetting it if it is already up
    async fn bring_up(&self, interface: &str) -> Result<()>;

    /// Bring `interface` down
    async fn tear_down(&self, interface: &str) -> Result<()>;

    async fn query_state(&self, interface: &str) -> LinkState;
}

/// `ip link` based lifecycle
#[derive(Debug, Clone)]
pub struct IpLinkLifecycle {
    bitrate: u32,
    txqueuelen: u32,
    use_sudo: bool,
}

impl IpLinkLifecycle {
    pub fn new(bitrate: u32, txqueuelen: u32, use_sudo: bool) -> Self {
        Self {
            bitrate,
            txqueuelen,
            use_sudo,
        }
    }

    fn command(&self, args: &[&str]) -> Command {
        if self.use_sudo {
            let mut cmd = Command::new("sudo");
            cmd.arg("ip").args(args);
            cmd
        } else {
            let mut cmd = Command::new("ip");
            cmd.args(args);
            cmd
        }
    }

    async fn run(&self, args: &[&str]) -> Result<()> {
        debug!("Running ip {}", args.join(" "));
        let output = self
            .command(args)
            .output()
            .await
            .map_err(|e| BridgeError::LifecycleError(format!("ip {}: {}", args.join(" "), e)))?;

        if output.status.success() {
            Ok(())
        } else {
            Err(BridgeError::LifecycleError(format!(
                "ip {} exited with {}: {}",
                args.join(" "),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }
}

#[async_trait]
impl InterfaceLifecycle for IpLinkLifecycle {
    async fn bring_up(&self, interface: &str) -> Result<()> {
        let state = self.query_state(interface).await;
        if state == LinkState::Up {
            info!("{} is still UP. Resetting...", interface);
        } else {
            info!("{} is {}. Starting up now...", interface, state);
        }

        self.run(&["link", "set", interface, "down"]).await?;

        let bitrate = self.bitrate.to_string();
        self.run(&["link", "set", interface, "up", "type", "can", "bitrate", &bitrate])
            .await?;

        let txqueuelen = self.txqueuelen.to_string();
        self.run(&["link", "set", interface, "txqueuelen", &txqueuelen])
            .await?;

        info!(
            "{} has been reset (bitrate {}, txqueuelen {})",
            interface, self.bitrate, self.txqueuelen
        );
        Ok(())
    }

    async fn tear_down(&self, interface: &str) -> Result<()> {
        self.run(&["link", "set", interface, "down"]).await?;
        info!("{} brought down", interface);
        Ok(())
    }

    async fn query_state(&self, interface: &str) -> LinkState {
        // querying never needs privileges
        match Command::new("ip")
            .args(["link", "show", interface])
            .output()
            .await
        {
            Ok(output) => parse_link_state(&String::from_utf8_lossy(&output.stdout)),
            Err(e) => {
                warn!("Error checking {} state: {}", interface, e);
                LinkState::Unknown
            },
        }
    }
}

/// Lifecycle for interfaces configured outside this process
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopLifecycle;

#[async_trait]
impl InterfaceLifecycle for NoopLifecycle {
    async fn bring_up(&self, interface: &str) -> Result<()> {
        debug!("Interface setup skipped for {}", interface);
        Ok(())
    }

    async fn tear_down(&self, _interface: &str) -> Result<()> {
        Ok(())
    }

    async fn query_state(&self, _interface: &str) -> LinkState {
        LinkState::Unknown
    }
}

/// Lifecycle call recorded by [`RecordingLifecycle`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleCall {
    BringUp(String),
    TearDown(String),
}

/// In-memory lifecycle for tests: tracks state per interface and records calls
#[derive(Debug, Default)]
pub struct RecordingLifecycle {
    calls: Mutex<Vec<LifecycleCall>>,
    up: Mutex<Vec<String>>,
    fail_bring_up: Mutex<Option<String>>,
}

impl RecordingLifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `bring_up` fail for `interface`
    pub fn fail_bring_up_for(&self, interface: &str) {
        *self.fail_bring_up.lock() = Some(interface.to_string());
    }

    pub fn calls(&self) -> Vec<LifecycleCall> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl InterfaceLifecycle for RecordingLifecycle {
    async fn bring_up(&self, interface: &str) -> Result<()> {
        self.calls
            .lock()
            .push(LifecycleCall::BringUp(interface.to_string()));

        if self.fail_bring_up.lock().as_deref() == Some(interface) {
            return Err(BridgeError::LifecycleError(format!(
                "Cannot find device \"{interface}\""
            )));
        }

        let mut up = self.up.lock();
        if !up.iter().any(|name| name == interface) {
            up.push(interface.to_string());
        }
        Ok(())
    }

    async fn tear_down(&self, interface: &str) -> Result<()> {
        self.calls
            .lock()
            .push(LifecycleCall::TearDown(interface.to_string()));
        self.up.lock().retain(|name| name != interface);
        Ok(())
    }

    async fn query_state(&self, interface: &str) -> LinkState {
        if self.up.lock().iter().any(|name| name == interface) {
            LinkState::Up
        } else {
            LinkState::Down
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const IP_LINK_UP: &str = "3: can0: <NOARP,UP,LOWER_UP,ECHO> mtu 16 qdisc pfifo_fast \
        state UP mode DEFAULT group default qlen 10000\n    link/can";
    const IP_LINK_DOWN: &str =
        "4: can1: <NOARP,ECHO> mtu 16 qdisc noop state DOWN mode DEFAULT group default qlen 10";

    #[test]
    fn test_parse_link_state() {
        assert_eq!(parse_link_state(IP_LINK_UP), LinkState::Up);
        assert_eq!(parse_link_state(IP_LINK_DOWN), LinkState::Down);
        assert_eq!(parse_link_state(""), LinkState::Unknown);
    }

    #[test]
    fn test_describe() {
        assert_eq!(describe("can0", LinkState::Up), "can0 is UP");
        assert_eq!(describe("can1", LinkState::Down), "can1 is DOWN");
        assert_eq!(describe("vcan0", LinkState::Unknown), "vcan0 state is unknown");
    }

    #[test]
    fn test_sudo_prefix() {
        let lifecycle = IpLinkLifecycle::new(250_000, 10_000, true);
        let cmd = lifecycle.command(&["link", "set", "can0", "down"]);
        assert_eq!(cmd.as_std().get_program(), "sudo");
        let args: Vec<_> = cmd.as_std().get_args().collect();
        assert_eq!(args, ["ip", "link", "set", "can0", "down"]);

        let plain = IpLinkLifecycle::new(250_000, 10_000, false);
        assert_eq!(plain.command(&["link"]).as_std().get_program(), "ip");
    }

    #[tokio::test]
    async fn test_recording_lifecycle_tracks_state() {
        let lifecycle = RecordingLifecycle::new();
        lifecycle.bring_up("can0").await.unwrap();
        assert_eq!(lifecycle.query_state("can0").await, LinkState::Up);
        assert_eq!(lifecycle.query_state("can1").await, LinkState::Down);

        lifecycle.tear_down("can0").await.unwrap();
        assert_eq!(lifecycle.query_state("can0").await, LinkState::Down);
        assert_eq!(
            lifecycle.calls(),
            vec![
                LifecycleCall::BringUp("can0".into()),
                LifecycleCall::TearDown("can0".into()),
            ]
        );
    }

    #[tokio::test]
    async fn test_noop_reports_unknown() {
        let lifecycle = NoopLifecycle;
        lifecycle.bring_up("vcan0").await.unwrap();
        assert_eq!(lifecycle.query_state("vcan0").await, LinkState::Unknown);
    }
}
