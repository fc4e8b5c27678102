//! End-to-end tests: the control protocol over TCP driving a bridge on mock buses

use std::sync::Arc;
use std::time::Duration;

use canbridge::config::BridgeConfig;
use canbridge::interface::{LifecycleCall, RecordingLifecycle};
use canbridge::{
    start_bridge, BusSet, CanFrame, CanId, ControlClient, MockCanBus, Result, RunningBridge,
};
use tokio_util::sync::CancellationToken;

struct Rig {
    a: Arc<MockCanBus>,
    b: Arc<MockCanBus>,
    lift: Arc<MockCanBus>,
    lifecycle: Arc<RecordingLifecycle>,
    running: RunningBridge,
    client: ControlClient,
}

impl Rig {
    async fn start() -> Self {
        let a = Arc::new(MockCanBus::new("can0"));
        let b = Arc::new(MockCanBus::new("can1"));
        let lift = Arc::new(MockCanBus::new("can0"));
        let lifecycle = Arc::new(RecordingLifecycle::new());

        let mut config = BridgeConfig::default();
        config.control.listen = "127.0.0.1:0".parse().unwrap();
        config.control.interactive = false;

        let buses = {
            let (a, b, lift) = (a.clone(), b.clone(), lift.clone());
            move |_: &BridgeConfig| -> Result<BusSet> {
                Ok(BusSet {
                    side_a: a,
                    side_b: b,
                    lift,
                })
            }
        };

        let running = start_bridge(&config, lifecycle.clone(), buses, CancellationToken::new())
            .await
            .unwrap();
        let client = ControlClient::connect(running.control_addr().unwrap())
            .await
            .unwrap();

        Self {
            a,
            b,
            lift,
            lifecycle,
            running,
            client,
        }
    }

    async fn send(&mut self, command: &str) -> String {
        self.client.request_line(command).await.unwrap()
    }
}

fn frame(id: u16) -> CanFrame {
    CanFrame::new(CanId::new(id).unwrap(), &[0xDE, 0xAD]).unwrap()
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(30)).await;
}

#[tokio::test]
async fn test_block_then_unblock_over_tcp() {
    let mut rig = Rig::start().await;

    assert_eq!(rig.send("block 0x123").await, "Blocked CAN ID: 0x123");
    rig.a.inject(frame(0x123));
    rig.a.inject(frame(0x124));
    settle().await;

    let ids: Vec<u16> = rig.b.sent_frames().iter().map(|f| f.id().raw()).collect();
    assert_eq!(ids, vec![0x124]);

    assert_eq!(rig.send("unblock 0x123").await, "Unblocked CAN ID: 0x123");
    rig.a.inject(frame(0x123));
    settle().await;

    let ids: Vec<u16> = rig.b.sent_frames().iter().map(|f| f.id().raw()).collect();
    assert_eq!(ids, vec![0x124, 0x123]);

    rig.running.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_pause_and_resume_over_tcp() {
    let mut rig = Rig::start().await;

    assert_eq!(rig.send("pause").await, "CAN passthrough paused");
    rig.b.inject(frame(0x200));
    settle().await;
    assert_eq!(rig.a.sent_count(), 0);

    assert_eq!(rig.send("RESUME").await, "CAN passthrough resumed");
    settle().await;
    // paused traffic is not replayed
    assert_eq!(rig.a.sent_count(), 0);

    rig.b.inject(frame(0x201));
    settle().await;
    assert_eq!(rig.a.sent_count(), 1);

    rig.running.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_lift_up_then_stop_over_tcp() {
    let mut rig = Rig::start().await;

    assert_eq!(rig.send("LIFT_UP").await, "Lift started: UP");
    tokio::time::sleep(Duration::from_millis(100)).await;
    let stop = rig.send("STOP").await;
    assert!(stop.starts_with("Lift operation stopped"), "{stop}");

    let sent = rig.lift.sent_count();
    assert!(sent >= 5, "only {sent} lift frames");
    for (k, f) in rig.lift.sent_frames().iter().enumerate() {
        assert_eq!(f.id().raw(), 0x1A0);
        assert_eq!(f.data()[1], 0x07);
        assert_eq!(f.data()[7], if k % 2 == 0 { 0x00 } else { 0x80 });
    }

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(rig.lift.sent_count(), sent);

    // lift id is not left blocked
    assert_eq!(rig.send("list").await, "No IDs are currently blocked");

    rig.running.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_errors_keep_session_open() {
    let mut rig = Rig::start().await;

    assert_eq!(rig.send("jump").await, "ERROR: Unknown command: jump");
    assert!(rig.send("block 0x900").await.starts_with("ERROR: Invalid CAN ID"));
    assert_eq!(rig.send("block 17").await, "Blocked CAN ID: 0x11");

    let status = rig.client.request("status").await.unwrap();
    assert_eq!(status.len(), 6);
    assert_eq!(status[0], "CAN Passthrough Active: true");
    assert_eq!(status[1], "Blocked IDs: 0x11");
    assert_eq!(status[4], "can0 is UP");
    assert_eq!(status[5], "can1 is UP");

    rig.running.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_oversized_line_keeps_session_open() {
    let mut rig = Rig::start().await;

    let reply = rig.client.request(&"b".repeat(2000)).await.unwrap();
    assert_eq!(reply, vec!["ERROR: line longer than 1024 bytes"]);

    assert_eq!(rig.send("block 0x42").await, "Blocked CAN ID: 0x42");
    assert_eq!(rig.send("list").await, "Blocked: 0x42");

    rig.running.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_multi_line_replies_stay_in_step() {
    let mut rig = Rig::start().await;

    let help = rig.client.request("help").await.unwrap();
    assert_eq!(help.len(), canbridge::control::HELP_TEXT.len());
    assert_eq!(help[0], "Available commands:");

    // the next reply is not polluted by leftover lines of the previous one
    assert_eq!(rig.send("list").await, "No IDs are currently blocked");
    let status = rig.client.request("status").await.unwrap();
    assert_eq!(status[0], "CAN Passthrough Active: true");
    assert_eq!(rig.send("pause").await, "CAN passthrough paused");

    rig.running.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_quit_closes_only_that_connection() {
    let mut rig = Rig::start().await;
    let addr = rig.running.control_addr().unwrap();

    assert_eq!(rig.send("quit").await, "Goodbye");
    assert!(rig.client.request_line("list").await.is_err());

    let mut other = ControlClient::connect(addr).await.unwrap();
    assert_eq!(
        other.request_line("list").await.unwrap(),
        "No IDs are currently blocked"
    );

    rig.running.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_two_clients_share_blocklist() {
    let mut rig = Rig::start().await;
    let mut other = ControlClient::connect(rig.running.control_addr().unwrap())
        .await
        .unwrap();

    assert_eq!(rig.send("block 0x10").await, "Blocked CAN ID: 0x10");
    assert_eq!(
        other.request_line("block 0x10").await.unwrap(),
        "CAN ID 0x10 was already blocked"
    );
    assert_eq!(
        other.request_line("unblock 0x10").await.unwrap(),
        "Unblocked CAN ID: 0x10"
    );
    assert!(rig.running.filters().is_empty());

    rig.running.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unavailable_interface_fails_shutdown() {
    let rig = Rig::start().await;
    let Rig {
        a,
        mut running,
        lifecycle,
        ..
    } = rig;

    a.set_unavailable(true);
    tokio::time::timeout(Duration::from_secs(2), running.wait_bridge())
        .await
        .unwrap();

    let result = running.shutdown().await;
    assert!(result.unwrap_err().is_fatal());
    // interfaces are still torn down
    assert!(lifecycle
        .calls()
        .contains(&LifecycleCall::TearDown("can1".into())));
}

#[tokio::test]
async fn test_batch_update_against_running_instance() {
    let rig = Rig::start().await;
    let addr = rig.running.control_addr().unwrap();

    let commands = [
        canbridge::Command::Block(CanId::new(0x1A0).unwrap()),
        canbridge::Command::Block(CanId::new(0x7FF).unwrap()),
        canbridge::Command::Unblock(CanId::new(0x1A0).unwrap()),
    ];
    let replies = canbridge::cli::run_batch(addr, &commands).await.unwrap();
    assert_eq!(
        replies,
        vec![
            "Blocked CAN ID: 0x1A0",
            "Blocked CAN ID: 0x7FF",
            "Unblocked CAN ID: 0x1A0",
        ]
    );
    assert_eq!(
        rig.running.filters().snapshot(),
        vec![CanId::new(0x7FF).unwrap()]
    );

    rig.running.shutdown().await.unwrap();
}
