//! Service orchestration
//!
//! Startup order: bring interfaces up, open bus handles, seed the blocklist,
//! spawn the bridge loop and the control server. Shutdown runs in reverse and
//! always tears the interfaces down, also after a bridge failure.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::bridge::{BridgeLoop, BridgeState, BridgeStats};
use crate::can::SharedBus;
use crate::config::BridgeConfig;
use crate::control::{run_prompt, spawn_stdin_reader, ControlPlane, ControlServer, PromptExit};
use crate::error::{BridgeError, Result};
use crate::filter::FilterTable;
use crate::interface::{InterfaceLifecycle, IpLinkLifecycle, NoopLifecycle};
use crate::lift::{LiftTransmitter, TransmitterStatus};

/// Bus handles the service runs on
pub struct BusSet {
    pub side_a: SharedBus,
    pub side_b: SharedBus,
    /// Handle owned by the lift transmitter
    pub lift: SharedBus,
}

/// Open SocketCAN handles for every configured interface
#[cfg(all(target_os = "linux", feature = "socketcan"))]
pub fn open_socketcan_buses(config: &BridgeConfig) -> Result<BusSet> {
    use crate::can::SocketCanBus;

    Ok(BusSet {
        side_a: Arc::new(SocketCanBus::open(&config.interfaces.side_a)?),
        side_b: Arc::new(SocketCanBus::open(&config.interfaces.side_b)?),
        lift: Arc::new(SocketCanBus::open(&config.lift.interface)?),
    })
}

#[cfg(not(all(target_os = "linux", feature = "socketcan")))]
pub fn open_socketcan_buses(_config: &BridgeConfig) -> Result<BusSet> {
    Err(BridgeError::ConfigError(
        "Built without SocketCAN support (enable the can-linux feature on Linux)".to_string(),
    ))
}

/// Lifecycle provider selected by `interfaces.manage`
pub fn lifecycle_for(config: &BridgeConfig) -> Arc<dyn InterfaceLifecycle> {
    let ifaces = &config.interfaces;
    if ifaces.manage {
        Arc::new(IpLinkLifecycle::new(
            ifaces.bitrate,
            ifaces.txqueuelen,
            ifaces.use_sudo,
        ))
    } else {
        Arc::new(NoopLifecycle)
    }
}

/// Interfaces touched by the service, without duplicates
fn managed_interfaces(config: &BridgeConfig) -> Vec<String> {
    let mut names = vec![
        config.interfaces.side_a.clone(),
        config.interfaces.side_b.clone(),
    ];
    if !names.contains(&config.lift.interface) {
        names.push(config.lift.interface.clone());
    }
    names
}

/// A started bridge with its background tasks
pub struct RunningBridge {
    filters: Arc<FilterTable>,
    state: Arc<BridgeState>,
    stats: Arc<BridgeStats>,
    lift: Arc<LiftTransmitter>,
    plane: Arc<ControlPlane>,
    lifecycle: Arc<dyn InterfaceLifecycle>,
    interfaces: Vec<String>,
    cancel: CancellationToken,
    bridge_task: Option<JoinHandle<Result<()>>>,
    bridge_result: Option<Result<()>>,
    control_task: Option<JoinHandle<Result<()>>>,
    control_addr: Option<SocketAddr>,
    lift_watch: Option<JoinHandle<()>>,
}

impl RunningBridge {
    pub fn filters(&self) -> &Arc<FilterTable> {
        &self.filters
    }

    pub fn state(&self) -> &Arc<BridgeState> {
        &self.state
    }

    pub fn stats(&self) -> &Arc<BridgeStats> {
        &self.stats
    }

    pub fn lift(&self) -> &Arc<LiftTransmitter> {
        &self.lift
    }

    pub fn plane(&self) -> &Arc<ControlPlane> {
        &self.plane
    }

    /// Bound control address, when the TCP endpoint is enabled
    pub fn control_addr(&self) -> Option<SocketAddr> {
        self.control_addr
    }

    /// Wait until the bridge loop exits on its own.
    ///
    /// Cancel-safe; pending forever once the result has been collected.
    pub async fn wait_bridge(&mut self) {
        let Some(task) = self.bridge_task.as_mut() else {
            return std::future::pending().await;
        };
        let result = join_result("bridge loop", task.await);
        self.bridge_task = None;
        self.bridge_result = Some(result);
    }

    /// Stop everything and tear the interfaces down.
    ///
    /// Returns the bridge loop's error if it ended on one.
    pub async fn shutdown(mut self) -> Result<()> {
        info!("Initiating shutdown sequence...");
        self.cancel.cancel();

        if let Some(report) = self.lift.stop().await {
            if let Some(e) = report.failure {
                warn!("Lift emitter had failed: {}", e);
            }
        }

        if let Some(task) = self.bridge_task.take() {
            self.bridge_result = Some(join_result("bridge loop", task.await));
        }
        if let Some(task) = self.control_task.take() {
            if let Err(e) = join_result("control server", task.await) {
                error!("Control server error: {}", e);
            }
        }
        if let Some(task) = self.lift_watch.take() {
            if let Err(e) = task.await {
                error!("Lift watcher task failed: {}", e);
            }
        }

        for interface in &self.interfaces {
            if let Err(e) = self.lifecycle.tear_down(interface).await {
                error!("Error shutting down {}: {}", interface, e);
            }
        }
        info!("Shutdown complete");

        self.bridge_result.take().unwrap_or(Ok(()))
    }
}

fn join_result(
    name: &str,
    joined: std::result::Result<Result<()>, tokio::task::JoinError>,
) -> Result<()> {
    joined.map_err(|e| BridgeError::InternalError(format!("{name} task failed: {e}")))?
}

/// Bring interfaces up, open buses with `open_buses` and start all tasks.
///
/// Interfaces that were brought up are torn down again if a later step fails.
pub async fn start_bridge<F>(
    config: &BridgeConfig,
    lifecycle: Arc<dyn InterfaceLifecycle>,
    open_buses: F,
    cancel: CancellationToken,
) -> Result<RunningBridge>
where
    F: FnOnce(&BridgeConfig) -> Result<BusSet>,
{
    let lift_period = config.lift.period()?;

    info!("Setting up CAN interfaces...");
    let interfaces = managed_interfaces(config);
    let mut brought_up = Vec::new();
    for interface in &interfaces {
        if let Err(e) = lifecycle.bring_up(interface).await {
            error!("Failed to initialize CAN interfaces: {}", e);
            tear_down_all(lifecycle.as_ref(), &brought_up).await;
            return Err(e);
        }
        brought_up.push(interface.clone());
    }

    let started = spawn_tasks(
        config,
        Arc::clone(&lifecycle),
        open_buses,
        lift_period,
        cancel.clone(),
    )
    .await;
    match started {
        Ok(tasks) => {
            info!("CAN bridge started successfully");
            Ok(tasks.into_running(lifecycle, interfaces, cancel))
        },
        Err(e) => {
            error!("Failed to start CAN bridge: {}", e);
            tear_down_all(lifecycle.as_ref(), &brought_up).await;
            Err(e)
        },
    }
}

/// Everything started after the interfaces are up
struct StartedTasks {
    filters: Arc<FilterTable>,
    state: Arc<BridgeState>,
    stats: Arc<BridgeStats>,
    lift: Arc<LiftTransmitter>,
    plane: Arc<ControlPlane>,
    bridge_task: JoinHandle<Result<()>>,
    control_task: Option<JoinHandle<Result<()>>>,
    control_addr: Option<SocketAddr>,
    lift_watch: JoinHandle<()>,
}

impl StartedTasks {
    fn into_running(
        self,
        lifecycle: Arc<dyn InterfaceLifecycle>,
        interfaces: Vec<String>,
        cancel: CancellationToken,
    ) -> RunningBridge {
        RunningBridge {
            filters: self.filters,
            state: self.state,
            stats: self.stats,
            lift: self.lift,
            plane: self.plane,
            lifecycle,
            interfaces,
            cancel,
            bridge_task: Some(self.bridge_task),
            bridge_result: None,
            control_task: self.control_task,
            control_addr: self.control_addr,
            lift_watch: Some(self.lift_watch),
        }
    }
}

async fn spawn_tasks<F>(
    config: &BridgeConfig,
    lifecycle: Arc<dyn InterfaceLifecycle>,
    open_buses: F,
    lift_period: Duration,
    cancel: CancellationToken,
) -> Result<StartedTasks>
where
    F: FnOnce(&BridgeConfig) -> Result<BusSet>,
{
    let buses = open_buses(config)?;
    info!("CAN interfaces successfully initialized");

    let filters = Arc::new(FilterTable::new());
    filters.block_all(config.filter.blocked.iter().copied());
    if filters.is_empty() {
        info!("Initial blocked IDs: None");
    } else {
        let ids: Vec<String> = filters.snapshot().iter().map(ToString::to_string).collect();
        info!("Initial blocked IDs: {}", ids.join(", "));
    }

    let state = Arc::new(BridgeState::default());
    let stats = Arc::new(BridgeStats::default());
    let lift = Arc::new(LiftTransmitter::new(
        buses.lift,
        config.lift.arbitration_id,
        lift_period,
        cancel.clone(),
    ));
    let plane = Arc::new(
        ControlPlane::new(
            Arc::clone(&filters),
            Arc::clone(&state),
            Arc::clone(&stats),
            Arc::clone(&lift),
            lifecycle,
            vec![
                config.interfaces.side_a.clone(),
                config.interfaces.side_b.clone(),
            ],
        )
        .with_block_window(config.lift.block_window()),
    );

    let (control_task, control_addr) = if config.control.enabled {
        let server = ControlServer::bind(config.control.listen, Arc::clone(&plane)).await?;
        let addr = server.local_addr()?;
        (Some(tokio::spawn(server.run(cancel.child_token()))), Some(addr))
    } else {
        (None, None)
    };

    let bridge = BridgeLoop::new(
        buses.side_a,
        buses.side_b,
        Arc::clone(&filters),
        Arc::clone(&state),
        Arc::clone(&stats),
        config.bridge.timing(),
    );
    let bridge_task = tokio::spawn(bridge.run(cancel.child_token()));
    let lift_watch = tokio::spawn(watch_lift(Arc::clone(&lift), cancel.child_token()));

    Ok(StartedTasks {
        filters,
        state,
        stats,
        lift,
        plane,
        bridge_task,
        control_task,
        control_addr,
        lift_watch,
    })
}

/// Log every lift emitter that dies on its own until `cancel` fires
async fn watch_lift(lift: Arc<LiftTransmitter>, cancel: CancellationToken) {
    loop {
        let status = tokio::select! {
            _ = cancel.cancelled() => return,
            status = lift.wait_failure() => status,
        };
        if let TransmitterStatus::Failed {
            direction,
            frames_sent,
        } = status
        {
            error!(
                "Lift emitter failed: {} stopped after {} frames; interface unavailable",
                direction, frames_sent
            );
        }
    }
}

async fn tear_down_all(lifecycle: &dyn InterfaceLifecycle, interfaces: &[String]) {
    for interface in interfaces {
        if let Err(e) = lifecycle.tear_down(interface).await {
            warn!("Error shutting down {}: {}", interface, e);
        }
    }
}

/// Run the service until a signal, `quit` at the prompt or a bridge failure
pub async fn run_service(config: BridgeConfig) -> Result<()> {
    let cancel = CancellationToken::new();
    let lifecycle = lifecycle_for(&config);

    let mut running = start_bridge(&config, lifecycle, open_socketcan_buses, cancel.clone()).await?;

    tokio::spawn(common::cancel_on_signal(cancel.clone()));

    let prompt_task = config.control.interactive.then(|| {
        let plane = Arc::clone(running.plane());
        let token = cancel.clone();
        tokio::spawn(async move {
            let exit = run_prompt(&plane, spawn_stdin_reader(), io::stdout(), &token).await;
            match exit {
                Ok(PromptExit::Quit) => token.cancel(),
                Ok(PromptExit::InputClosed) => info!("Stdin closed; prompt disabled"),
                Ok(PromptExit::Cancelled) => {},
                Err(e) => warn!("Prompt stopped: {}", e),
            }
        })
    });

    tokio::select! {
        _ = cancel.cancelled() => {},
        _ = running.wait_bridge() => {},
    }

    let result = running.shutdown().await;
    if let Some(task) = prompt_task {
        if let Err(e) = task.await {
            error!("Prompt task failed: {}", e);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::can::MockCanBus;
    use crate::can::CanId;
    use crate::interface::{LifecycleCall, RecordingLifecycle};
    use crate::lift::LiftDirection;
    use std::time::Duration;
    use tracing_test::traced_test;

    fn test_config() -> BridgeConfig {
        let mut config = BridgeConfig::default();
        config.control.enabled = false;
        config.control.interactive = false;
        config
    }

    fn mock_buses(_config: &BridgeConfig) -> Result<BusSet> {
        Ok(BusSet {
            side_a: Arc::new(MockCanBus::new("can0")),
            side_b: Arc::new(MockCanBus::new("can1")),
            lift: Arc::new(MockCanBus::new("can0")),
        })
    }

    #[test]
    fn test_lift_interface_not_duplicated() {
        let mut config = BridgeConfig::default();
        assert_eq!(managed_interfaces(&config), vec!["can0", "can1"]);

        config.lift.interface = "can2".to_string();
        assert_eq!(managed_interfaces(&config), vec!["can0", "can1", "can2"]);
    }

    #[tokio::test]
    async fn test_interfaces_brought_up_then_torn_down() {
        let lifecycle = Arc::new(RecordingLifecycle::new());
        let running = start_bridge(
            &test_config(),
            lifecycle.clone(),
            mock_buses,
            CancellationToken::new(),
        )
        .await
        .unwrap();

        running.shutdown().await.unwrap();
        assert_eq!(
            lifecycle.calls(),
            vec![
                LifecycleCall::BringUp("can0".into()),
                LifecycleCall::BringUp("can1".into()),
                LifecycleCall::TearDown("can0".into()),
                LifecycleCall::TearDown("can1".into()),
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_bring_up_rolls_back() {
        let lifecycle = Arc::new(RecordingLifecycle::new());
        lifecycle.fail_bring_up_for("can1");

        let result = start_bridge(
            &test_config(),
            lifecycle.clone(),
            mock_buses,
            CancellationToken::new(),
        )
        .await;

        assert!(matches!(result, Err(BridgeError::LifecycleError(_))));
        assert_eq!(
            lifecycle.calls().last(),
            Some(&LifecycleCall::TearDown("can0".into()))
        );
    }

    #[tokio::test]
    async fn test_failed_open_rolls_back() {
        let lifecycle = Arc::new(RecordingLifecycle::new());
        let result = start_bridge(
            &test_config(),
            lifecycle.clone(),
            |_config: &BridgeConfig| -> Result<BusSet> {
                Err(BridgeError::InterfaceUnavailable {
                    interface: "can1".to_string(),
                    message: "No such device".to_string(),
                })
            },
            CancellationToken::new(),
        )
        .await;

        assert!(result.is_err());
        let teardowns = lifecycle
            .calls()
            .into_iter()
            .filter(|c| matches!(c, LifecycleCall::TearDown(_)))
            .count();
        assert_eq!(teardowns, 2);
    }

    #[tokio::test]
    async fn test_config_blocklist_seeds_filter() {
        let mut config = test_config();
        config.filter.blocked = vec![
            CanId::new(0x321).unwrap(),
            CanId::new(0x010).unwrap(),
            CanId::new(0x321).unwrap(),
        ];

        let running = start_bridge(
            &config,
            Arc::new(RecordingLifecycle::new()),
            mock_buses,
            CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(
            running.filters().snapshot(),
            vec![CanId::new(0x010).unwrap(), CanId::new(0x321).unwrap()]
        );
        running.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_control_bind_rolls_back() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let mut config = test_config();
        config.control.enabled = true;
        config.control.listen = taken.local_addr().unwrap();

        let lifecycle = Arc::new(RecordingLifecycle::new());
        let result = start_bridge(
            &config,
            lifecycle.clone(),
            mock_buses,
            CancellationToken::new(),
        )
        .await;

        assert!(matches!(result, Err(BridgeError::IoError(_))));
        assert_eq!(
            lifecycle.calls(),
            vec![
                LifecycleCall::BringUp("can0".into()),
                LifecycleCall::BringUp("can1".into()),
                LifecycleCall::TearDown("can0".into()),
                LifecycleCall::TearDown("can1".into()),
            ]
        );
    }

    #[tokio::test]
    async fn test_out_of_range_rate_fails_before_bring_up() {
        let mut config = test_config();
        config.lift.rate_hz = 1e-20;

        let lifecycle = Arc::new(RecordingLifecycle::new());
        let result = start_bridge(
            &config,
            lifecycle.clone(),
            mock_buses,
            CancellationToken::new(),
        )
        .await;

        assert!(matches!(result, Err(BridgeError::ConfigError(_))));
        assert!(lifecycle.calls().is_empty());
    }

    #[tokio::test]
    #[traced_test]
    async fn test_dead_lift_emitter_is_logged() {
        let lift_bus = Arc::new(MockCanBus::new("can0"));
        let buses = {
            let lift_bus = lift_bus.clone();
            move |_: &BridgeConfig| -> Result<BusSet> {
                Ok(BusSet {
                    side_a: Arc::new(MockCanBus::new("can0")),
                    side_b: Arc::new(MockCanBus::new("can1")),
                    lift: lift_bus,
                })
            }
        };

        let running = start_bridge(
            &test_config(),
            Arc::new(RecordingLifecycle::new()),
            buses,
            CancellationToken::new(),
        )
        .await
        .unwrap();

        running.lift().start(LiftDirection::Up).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        lift_bus.set_unavailable(true);
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(logs_contain("Lift emitter failed: UP stopped after"));
        running.shutdown().await.unwrap();
    }
}
