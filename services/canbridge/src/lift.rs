//! Periodic lift command transmitter
//!
//! While running, one command frame is written to the lift's bus on every
//! period. The emitter runs as its own task with a child cancellation token;
//! `stop` cancels it and waits for it to finish, so no frame is emitted after
//! `stop` returns.
//!
//! Frame layout (8 bytes):
//!
//! ```text
//! byte 0    0xFF        lift state: running
//! byte 1    0x07 / 0xF8 direction: up / down
//! byte 2-5  0x00        reserved
//! byte 6    0x02        constant
//! byte 7    0x00 / 0x80 heartbeat, alternating per frame starting at 0x00
//! ```

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::can::{CanFrame, CanId, SharedBus};
use crate::error::{BridgeError, Result};

/// Default lift command identifier
pub const LIFT_COMMAND_ID: u16 = 0x1A0;

pub const DEFAULT_LIFT_ID: CanId = CanId::masked(LIFT_COMMAND_ID);

/// Default emission rate
pub const LIFT_FRAME_RATE_HZ: f64 = 65.0;

/// Accepted emission rate range, in Hz
pub const MIN_LIFT_RATE_HZ: f64 = 1.0;
pub const MAX_LIFT_RATE_HZ: f64 = 1000.0;

const LIFT_STATE_RUNNING: u8 = 0xFF;
const ACTION_UP: u8 = 0x07;
const ACTION_DOWN: u8 = 0xF8;
const CONSTANT_BYTE6: u8 = 0x02;
const HEARTBEAT_ODD: u8 = 0x80;

/// Lift travel direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LiftDirection {
    Up,
    Down,
}

impl LiftDirection {
    /// Value of payload byte 1
    pub const fn action_byte(self) -> u8 {
        match self {
            LiftDirection::Up => ACTION_UP,
            LiftDirection::Down => ACTION_DOWN,
        }
    }
}

impl fmt::Display for LiftDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LiftDirection::Up => write!(f, "UP"),
            LiftDirection::Down => write!(f, "DOWN"),
        }
    }
}

impl FromStr for LiftDirection {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "UP" => Ok(LiftDirection::Up),
            "DOWN" => Ok(LiftDirection::Down),
            other => Err(BridgeError::ProtocolError(format!(
                "Invalid direction '{other}'. Use 'UP' or 'DOWN'."
            ))),
        }
    }
}

/// Payload for the `tick`-th frame since start
pub fn lift_payload(direction: LiftDirection, tick: u64) -> [u8; 8] {
    let heartbeat = if tick % 2 == 0 { 0x00 } else { HEARTBEAT_ODD };
    [
        LIFT_STATE_RUNNING,
        direction.action_byte(),
        0x00,
        0x00,
        0x00,
        0x00,
        CONSTANT_BYTE6,
        heartbeat,
    ]
}

/// Transmitter state as reported to the control plane
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransmitterStatus {
    Idle,
    Running {
        direction: LiftDirection,
        frames_sent: u64,
    },
    /// The emitter exited on its own (unavailable interface)
    Failed {
        direction: LiftDirection,
        frames_sent: u64,
    },
}

/// Summary returned by [`LiftTransmitter::stop`]
#[derive(Debug, Clone)]
pub struct StopReport {
    pub direction: LiftDirection,
    pub frames_sent: u64,
    /// Error that ended the emitter before `stop`, if any
    pub failure: Option<BridgeError>,
}

struct RunningLift {
    direction: LiftDirection,
    ticks: Arc<AtomicU64>,
    cancel: CancellationToken,
    task: JoinHandle<Result<()>>,
}

/// Start/stop state machine driving the periodic emitter task
pub struct LiftTransmitter {
    bus: SharedBus,
    id: CanId,
    period: Duration,
    shutdown: CancellationToken,
    running: Mutex<Option<RunningLift>>,
    failed: Arc<Notify>,
}

impl LiftTransmitter {
    /// `shutdown` is the parent token; cancelling it stops any running emitter.
    pub fn new(bus: SharedBus, id: CanId, period: Duration, shutdown: CancellationToken) -> Self {
        Self {
            bus,
            id,
            period,
            shutdown,
            running: Mutex::new(None),
            failed: Arc::new(Notify::new()),
        }
    }

    /// Period for a rate in Hz, which must lie in
    /// [`MIN_LIFT_RATE_HZ`]..=[`MAX_LIFT_RATE_HZ`]
    pub fn period_for_rate(rate_hz: f64) -> Result<Duration> {
        if !(MIN_LIFT_RATE_HZ..=MAX_LIFT_RATE_HZ).contains(&rate_hz) {
            return Err(BridgeError::ConfigError(format!(
                "Lift rate {rate_hz} Hz outside {MIN_LIFT_RATE_HZ}..={MAX_LIFT_RATE_HZ} Hz"
            )));
        }
        Duration::try_from_secs_f64(1.0 / rate_hz)
            .map_err(|e| BridgeError::ConfigError(format!("Lift rate {rate_hz} Hz: {e}")))
    }

    pub fn command_id(&self) -> CanId {
        self.id
    }

    /// Start emitting in `direction`.
    ///
    /// Rejected while an emitter is alive. An emitter that already died on
    /// its own is replaced.
    pub fn start(&self, direction: LiftDirection) -> Result<()> {
        let mut slot = self.running.lock();

        if let Some(current) = slot.as_ref() {
            if !current.task.is_finished() {
                return Err(BridgeError::LiftAlreadyRunning(current.direction));
            }
            warn!(
                "Replacing lift emitter that exited on its own ({})",
                current.direction
            );
        }

        let ticks = Arc::new(AtomicU64::new(0));
        let cancel = self.shutdown.child_token();
        let task = tokio::spawn(emit_frames(
            Arc::clone(&self.bus),
            self.id,
            self.period,
            direction,
            Arc::clone(&ticks),
            cancel.clone(),
            Arc::clone(&self.failed),
        ));

        *slot = Some(RunningLift {
            direction,
            ticks,
            cancel,
            task,
        });

        info!("Lift started: {} ({} every {:?})", direction, self.id, self.period);
        Ok(())
    }

    /// Stop the emitter and wait for it to exit.
    ///
    /// Returns `None` if nothing was running.
    pub async fn stop(&self) -> Option<StopReport> {
        let current = self.running.lock().take()?;
        current.cancel.cancel();

        let failure = match current.task.await {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e),
            Err(join_err) => Some(BridgeError::InternalError(format!(
                "Lift emitter panicked: {join_err}"
            ))),
        };

        let report = StopReport {
            direction: current.direction,
            frames_sent: current.ticks.load(Ordering::Acquire),
            failure,
        };
        info!(
            "Lift operation stopped ({} frames sent)",
            report.frames_sent
        );
        Some(report)
    }

    pub fn status(&self) -> TransmitterStatus {
        match self.running.lock().as_ref() {
            None => TransmitterStatus::Idle,
            Some(current) => {
                let frames_sent = current.ticks.load(Ordering::Acquire);
                if current.task.is_finished() {
                    TransmitterStatus::Failed {
                        direction: current.direction,
                        frames_sent,
                    }
                } else {
                    TransmitterStatus::Running {
                        direction: current.direction,
                        frames_sent,
                    }
                }
            },
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self.status(), TransmitterStatus::Running { .. })
    }

    /// Resolve once an emitter has exited on its own. Returns the
    /// [`TransmitterStatus::Failed`] status observed at that point.
    pub async fn wait_failure(&self) -> TransmitterStatus {
        loop {
            self.failed.notified().await;
            // a stale wakeup from an emitter that was since replaced or stopped
            if let status @ TransmitterStatus::Failed { .. } = self.status() {
                return status;
            }
        }
    }
}

async fn emit_frames(
    bus: SharedBus,
    id: CanId,
    period: Duration,
    direction: LiftDirection,
    ticks: Arc<AtomicU64>,
    cancel: CancellationToken,
    failed: Arc<Notify>,
) -> Result<()> {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {},
        }

        let tick = ticks.load(Ordering::Acquire);
        let frame = CanFrame::new(id, &lift_payload(direction, tick))?;
        match bus.send(&frame) {
            Ok(()) => debug!("Lift frame sent: {}", frame),
            Err(e) if e.is_fatal() => {
                error!("Lift emitter stopping: {}", e);
                failed.notify_one();
                return Err(e);
            },
            Err(e) => warn!("Failed to send lift frame: {}", e),
        }
        ticks.store(tick + 1, Ordering::Release);
    }

    Ok(())
}
