//! Bridge loop
//!
//! Relays frames between side A and side B. Each iteration polls A then B
//! without blocking and forwards whatever is not blocked. While the bridge is
//! paused, both sides are drained and discarded on every throttle tick so that
//! nothing received during the pause is replayed after `resume`.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::can::{BusSide, SharedBus};
use crate::error::Result;
use crate::filter::FilterTable;

/// Forwarding on/off switch shared with the control plane
#[derive(Debug)]
pub struct BridgeState {
    active: AtomicBool,
}

impl BridgeState {
    pub fn new(active: bool) -> Self {
        Self {
            active: AtomicBool::new(active),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Stop forwarding. Returns the previous state.
    pub fn pause(&self) -> bool {
        self.active.swap(false, Ordering::AcqRel)
    }

    /// Resume forwarding. Returns the previous state.
    pub fn resume(&self) -> bool {
        self.active.swap(true, Ordering::AcqRel)
    }
}

impl Default for BridgeState {
    fn default() -> Self {
        Self::new(true)
    }
}

/// Bridge loop counters
#[derive(Debug, Default)]
pub struct BridgeStats {
    forwarded_a_to_b: AtomicU64,
    forwarded_b_to_a: AtomicU64,
    filtered: AtomicU64,
    dropped_paused: AtomicU64,
    send_errors: AtomicU64,
}

/// Point-in-time copy of [`BridgeStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeStatsSnapshot {
    pub forwarded_a_to_b: u64,
    pub forwarded_b_to_a: u64,
    pub filtered: u64,
    pub dropped_paused: u64,
    pub send_errors: u64,
}

impl BridgeStats {
    pub fn snapshot(&self) -> BridgeStatsSnapshot {
        BridgeStatsSnapshot {
            forwarded_a_to_b: self.forwarded_a_to_b.load(Ordering::Relaxed),
            forwarded_b_to_a: self.forwarded_b_to_a.load(Ordering::Relaxed),
            filtered: self.filtered.load(Ordering::Relaxed),
            dropped_paused: self.dropped_paused.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
        }
    }

    fn record_forward(&self, from: BusSide) {
        let counter = match from {
            BusSide::A => &self.forwarded_a_to_b,
            BusSide::B => &self.forwarded_b_to_a,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Loop timing
#[derive(Debug, Clone, Copy)]
pub struct BridgeTiming {
    /// Sleep between checks while paused
    pub pause_throttle: Duration,
    /// Wait after an iteration in which neither side had a frame
    pub idle_poll: Duration,
}

impl Default for BridgeTiming {
    fn default() -> Self {
        Self {
            pause_throttle: Duration::from_millis(10),
            idle_poll: Duration::from_millis(1),
        }
    }
}

/// Frame relay between two bus handles
pub struct BridgeLoop {
    side_a: SharedBus,
    side_b: SharedBus,
    filters: Arc<FilterTable>,
    state: Arc<BridgeState>,
    stats: Arc<BridgeStats>,
    timing: BridgeTiming,
}

impl BridgeLoop {
    pub fn new(
        side_a: SharedBus,
        side_b: SharedBus,
        filters: Arc<FilterTable>,
        state: Arc<BridgeState>,
        stats: Arc<BridgeStats>,
        timing: BridgeTiming,
    ) -> Self {
        Self {
            side_a,
            side_b,
            filters,
            state,
            stats,
            timing,
        }
    }

    /// Run until cancelled or until a bus becomes unavailable.
    ///
    /// Transient bus errors are logged and skipped; an unavailable interface
    /// ends the loop with that error.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        info!(
            "Bridge loop started: {} <-> {}",
            self.side_a.interface(),
            self.side_b.interface()
        );

        let mut pause_ticker = ticker(self.timing.pause_throttle);
        let mut idle_ticker = ticker(self.timing.idle_poll);

        let result = loop {
            if cancel.is_cancelled() {
                break Ok(());
            }

            if !self.state.is_active() {
                if let Err(e) = self.drain_paused() {
                    break Err(e);
                }
                if wait_or_cancel(&mut pause_ticker, &cancel).await {
                    break Ok(());
                }
                continue;
            }

            let moved_a = match self.relay_one(BusSide::A) {
                Ok(moved) => moved,
                Err(e) => break Err(e),
            };
            let moved_b = match self.relay_one(BusSide::B) {
                Ok(moved) => moved,
                Err(e) => break Err(e),
            };

            if moved_a || moved_b {
                // Skip the idle tick while traffic is flowing, but let other tasks run
                tokio::task::yield_now().await;
            } else if wait_or_cancel(&mut idle_ticker, &cancel).await {
                break Ok(());
            }
        };

        match &result {
            Ok(()) => info!("Bridge loop stopped"),
            Err(e) => error!("Bridge loop terminated: {}", e),
        }
        result
    }

    fn bus(&self, side: BusSide) -> &SharedBus {
        match side {
            BusSide::A => &self.side_a,
            BusSide::B => &self.side_b,
        }
    }

    /// Poll `from` once and forward the frame if allowed.
    ///
    /// Returns whether a frame was read.
    fn relay_one(&self, from: BusSide) -> Result<bool> {
        let source = self.bus(from);
        let frame = match source.try_recv() {
            Ok(Some(frame)) => frame.received_on(from),
            Ok(None) => return Ok(false),
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!("CAN passthrough error: {}", e);
                return Ok(false);
            },
        };

        if !self.state.is_active() {
            self.stats.dropped_paused.fetch_add(1, Ordering::Relaxed);
            return Ok(true);
        }

        if self.filters.contains(frame.id()) {
            trace!("Dropped blocked frame from side {}: {}", from, frame);
            self.stats.filtered.fetch_add(1, Ordering::Relaxed);
            return Ok(true);
        }

        let target = self.bus(from.opposite());
        match target.send(&frame) {
            Ok(()) => {
                trace!(
                    "{} -> {}: {}",
                    source.interface(),
                    target.interface(),
                    frame
                );
                self.stats.record_forward(from);
            },
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!("CAN passthrough error: {}", e);
                self.stats.send_errors.fetch_add(1, Ordering::Relaxed);
            },
        }

        Ok(true)
    }

    /// Discard everything that arrived while paused
    fn drain_paused(&self) -> Result<()> {
        for side in [BusSide::A, BusSide::B] {
            let bus = self.bus(side);
            loop {
                match bus.try_recv() {
                    Ok(Some(frame)) => {
                        trace!("Paused, discarding frame from side {}: {}", side, frame);
                        self.stats.dropped_paused.fetch_add(1, Ordering::Relaxed);
                    },
                    Ok(None) => break,
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => {
                        debug!("Error while draining {}: {}", bus.interface(), e);
                        break;
                    },
                }
            }
        }
        Ok(())
    }
}

fn ticker(period: Duration) -> Interval {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

/// Wait for the next tick. Returns `true` if cancelled instead.
async fn wait_or_cancel(ticker: &mut Interval, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = ticker.tick() => false,
    }
}
