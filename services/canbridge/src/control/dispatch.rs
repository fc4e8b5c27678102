//! Command execution against the shared bridge objects

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use super::command::{Command, HELP_TEXT};
use crate::bridge::{BridgeState, BridgeStats};
use crate::can::CanId;
use crate::error::{BridgeError, Result};
use crate::filter::FilterTable;
use crate::interface::{describe, InterfaceLifecycle};
use crate::lift::{LiftDirection, LiftTransmitter, TransmitterStatus};

/// Lines to send back to the command's origin
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub lines: Vec<String>,
    /// The origin asked to end its session
    pub quit: bool,
}

impl Reply {
    fn line(text: impl Into<String>) -> Self {
        Self {
            lines: vec![text.into()],
            quit: false,
        }
    }

    fn lines(lines: Vec<String>) -> Self {
        Self { lines, quit: false }
    }

    fn error(err: &BridgeError) -> Self {
        Self::line(format!("ERROR: {err}"))
    }
}

/// Handles shared with the bridge and the transmitter
pub struct ControlPlane {
    filters: Arc<FilterTable>,
    state: Arc<BridgeState>,
    stats: Arc<BridgeStats>,
    lift: Arc<LiftTransmitter>,
    lifecycle: Arc<dyn InterfaceLifecycle>,
    interfaces: Vec<String>,
    block_window: Duration,
}

impl ControlPlane {
    pub fn new(
        filters: Arc<FilterTable>,
        state: Arc<BridgeState>,
        stats: Arc<BridgeStats>,
        lift: Arc<LiftTransmitter>,
        lifecycle: Arc<dyn InterfaceLifecycle>,
        interfaces: Vec<String>,
    ) -> Self {
        Self {
            filters,
            state,
            stats,
            lift,
            lifecycle,
            interfaces,
            block_window: Duration::ZERO,
        }
    }

    /// Hold the lift id blocked for `window` after a lift start
    pub fn with_block_window(mut self, window: Duration) -> Self {
        self.block_window = window;
        self
    }

    /// Parse and execute one line of input. Blank lines produce no reply.
    pub async fn handle_line(&self, line: &str) -> Option<Reply> {
        match Command::parse_line(line) {
            Ok(Some(command)) => Some(self.execute(command).await),
            Ok(None) => None,
            Err(e) => {
                warn!("Rejected command '{}': {}", line.trim(), e);
                Some(Reply::error(&e))
            },
        }
    }

    pub async fn execute(&self, command: Command) -> Reply {
        info!("Control command: {}", command);

        match command {
            Command::Lift(direction) => match self.start_lift(direction).await {
                Ok(()) => Reply::line(format!("Lift started: {direction}")),
                Err(e) => Reply::error(&e),
            },
            Command::Stop => self.stop_lift().await,
            Command::StatusCheck => Reply::lines(self.interface_status().await),
            Command::Block(id) => {
                if self.filters.block(id) {
                    Reply::line(format!("Blocked CAN ID: {id}"))
                } else {
                    Reply::line(format!("CAN ID {id} was already blocked"))
                }
            },
            Command::Unblock(id) => {
                if self.filters.unblock(id) {
                    Reply::line(format!("Unblocked CAN ID: {id}"))
                } else {
                    Reply::line(format!("CAN ID {id} was not blocked"))
                }
            },
            Command::List => Reply::lines(self.list_blocked()),
            Command::Status => Reply::lines(self.status_report().await),
            Command::Pause => {
                self.state.pause();
                info!("CAN passthrough paused");
                Reply::line("CAN passthrough paused")
            },
            Command::Resume => {
                self.state.resume();
                info!("CAN passthrough resumed");
                Reply::line("CAN passthrough resumed")
            },
            Command::Help => Reply::lines(HELP_TEXT.iter().map(|s| s.to_string()).collect()),
            Command::Quit => Reply {
                lines: vec!["Goodbye".to_string()],
                quit: true,
            },
        }
    }

    /// Block the lift id, start the emitter, then unblock.
    ///
    /// An id that was blocked before the command stays blocked.
    async fn start_lift(&self, direction: LiftDirection) -> Result<()> {
        let lift_id = self.lift.command_id();
        let added = self.filters.block(lift_id);

        if let Err(e) = self.lift.start(direction) {
            if added {
                self.filters.unblock(lift_id);
            }
            return Err(e);
        }

        if added {
            if !self.block_window.is_zero() {
                tokio::time::sleep(self.block_window).await;
            }
            self.filters.unblock(lift_id);
        }
        Ok(())
    }

    async fn stop_lift(&self) -> Reply {
        let report = self.lift.stop().await;
        if !self.state.resume() {
            info!("CAN passthrough resumed");
        }

        match report {
            None => Reply::line("Lift is not running"),
            Some(report) => {
                let mut lines = vec![format!(
                    "Lift operation stopped ({} frames sent)",
                    report.frames_sent
                )];
                if let Some(e) = report.failure {
                    lines.push(format!("ERROR: lift emitter had failed: {e}"));
                }
                Reply::lines(lines)
            },
        }
    }

    fn list_blocked(&self) -> Vec<String> {
        let ids = self.filters.snapshot();
        if ids.is_empty() {
            vec!["No IDs are currently blocked".to_string()]
        } else {
            ids.iter().map(|id| format!("Blocked: {id}")).collect()
        }
    }

    async fn interface_status(&self) -> Vec<String> {
        let mut lines = Vec::with_capacity(self.interfaces.len());
        for interface in &self.interfaces {
            let state = self.lifecycle.query_state(interface).await;
            lines.push(describe(interface, state));
        }
        lines
    }

    async fn status_report(&self) -> Vec<String> {
        let blocked = format_blocked(&self.filters.snapshot());
        let stats = self.stats.snapshot();
        let lift = match self.lift.status() {
            TransmitterStatus::Idle => "idle".to_string(),
            TransmitterStatus::Running {
                direction,
                frames_sent,
            } => format!("running {direction} ({frames_sent} frames sent)"),
            TransmitterStatus::Failed {
                direction,
                frames_sent,
            } => format!("failed while running {direction} ({frames_sent} frames sent)"),
        };

        let mut lines = vec![
            format!("CAN Passthrough Active: {}", self.state.is_active()),
            format!("Blocked IDs: {blocked}"),
            format!("Lift: {lift}"),
            format!(
                "Forwarded: {} A->B, {} B->A; filtered {}, dropped while paused {}, send errors {}",
                stats.forwarded_a_to_b,
                stats.forwarded_b_to_a,
                stats.filtered,
                stats.dropped_paused,
                stats.send_errors
            ),
        ];
        lines.extend(self.interface_status().await);
        lines
    }
}

fn format_blocked(ids: &[CanId]) -> String {
    if ids.is_empty() {
        "None".to_string()
    } else {
        ids.iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    }
}
