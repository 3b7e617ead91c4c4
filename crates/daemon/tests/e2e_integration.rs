//! End-to-end integration tests for labterm.
//!
//! These run real shells on local PTYs through the full stack:
//! - Router and lifecycle flows for start, input, resize and teardown
//! - Out-of-band process death
//! - Teardown guarantees under concurrency
//! - The WebSocket gateway driven by the orchestrator

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use daemon::config::Config;
use daemon::orchestrator::DaemonOrchestrator;
use daemon::router::MessageRouter;
use daemon::runtime::LocalRuntime;
use daemon::session::{
    BridgeOptions, LifecycleController, LifecycleOptions, OutputRouter, SessionLifecycle,
    SessionStatus,
};
use futures_util::{SinkExt, StreamExt};
use labterm_protocol::{
    decode, encode, ClientEvent, ReplyStatus, ServerEvent, SessionInput, SessionResize,
    StartSession, WireFormat,
};
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::Message as WsMessage;

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Slack on top of one poll interval for the exit to reach the client.
const EXIT_MARGIN: Duration = Duration::from_millis(80);

struct Harness {
    controller: Arc<LifecycleController>,
    router: MessageRouter<LifecycleController>,
}

fn harness() -> Harness {
    let output = Arc::new(OutputRouter::default());
    let options = LifecycleOptions {
        bridge: BridgeOptions {
            shell: vec!["/bin/sh".to_string()],
            poll_interval: POLL_INTERVAL,
            ..BridgeOptions::default()
        },
        max_sessions: 16,
    };
    let runtime = LocalRuntime::with_containers(["c1", "c3", "c4", "attacker-lab1"]);
    let controller = LifecycleController::new(Arc::new(runtime), Arc::clone(&output), options);
    controller.start_exit_watcher();
    let router = MessageRouter::new(Arc::clone(&controller), output);
    Harness { controller, router }
}

fn start(container_ref: &str) -> ClientEvent {
    ClientEvent::StartSession(StartSession {
        container_ref: Some(container_ref.to_string()),
        role: "attacker".to_string(),
        room: "lab1".to_string(),
        rows: Some(24),
        cols: Some(80),
    })
}

fn input(data: &'static [u8]) -> ClientEvent {
    ClientEvent::SessionInput(SessionInput {
        data: Bytes::from_static(data),
    })
}

fn bridge_of(reply: Option<ServerEvent>) -> String {
    match reply {
        Some(ServerEvent::StartSessionReply(reply)) if reply.is_ok() => {
            reply.bridge_id.unwrap_or_default()
        }
        other => panic!("expected successful start, got {:?}", other),
    }
}

/// Collects output for `bridge_id` until `needle` shows up. Fails on a
/// `session_error` seen first.
async fn read_until(
    rx: &mut mpsc::Receiver<ServerEvent>,
    bridge_id: &str,
    needle: &str,
) -> String {
    let mut seen = Vec::new();
    let found = timeout(Duration::from_secs(5), async {
        while let Some(event) = rx.recv().await {
            match event {
                ServerEvent::SessionOutput(out) if out.bridge_id == bridge_id => {
                    seen.extend_from_slice(&out.data);
                    if String::from_utf8_lossy(&seen).contains(needle) {
                        return true;
                    }
                }
                ServerEvent::SessionError(err) => panic!("session error: {}", err.message),
                _ => {}
            }
        }
        false
    })
    .await;
    assert_eq!(found, Ok(true), "never saw {:?}", needle);
    String::from_utf8_lossy(&seen).into_owned()
}

async fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
    let end = Instant::now() + deadline;
    while Instant::now() < end {
        if check() {
            return true;
        }
        sleep(Duration::from_millis(5)).await;
    }
    check()
}

// =============================================================================
// Scenarios
// =============================================================================

#[tokio::test]
async fn test_input_produces_listing() {
    let h = harness();
    let mut rx = h.router.output().register_client("s1");

    let bridge_id = bridge_of(h.router.dispatch("s1", start("c1")).await);
    assert!(h.router.dispatch("s1", input(b"ls\n")).await.is_none());

    // Integration tests run from the package root.
    let listing = read_until(&mut rx, &bridge_id, "Cargo.toml").await;
    assert!(listing.contains("src"));

    h.router.handle_disconnect("s1").await;
}

#[tokio::test]
async fn test_unknown_container_leaves_registry_untouched() {
    let h = harness();
    let _rx = h.router.output().register_client("s2");

    let reply = h.router.dispatch("s2", start("no-such-container")).await;
    match reply {
        Some(ServerEvent::StartSessionReply(reply)) => {
            assert_eq!(reply.status, ReplyStatus::Error);
            assert!(reply.bridge_id.is_none());
        }
        other => panic!("unexpected reply: {:?}", other),
    }
    assert!(h.controller.get_session("s2").is_none());
    assert_eq!(h.controller.registry().bridge_count(), 0);
}

#[tokio::test]
async fn test_out_of_band_kill_is_detected() {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let h = harness();
    let mut rx = h.router.output().register_client("s3");
    let bridge_id = bridge_of(h.router.dispatch("s3", start("c3")).await);

    let pid = h
        .controller
        .registry()
        .running_bridge("s3")
        .and_then(|bridge| bridge.pid())
        .expect("running bridge with a pid");

    let killed_at = Instant::now();
    kill(Pid::from_raw(pid as i32), Signal::SIGKILL).unwrap();

    let closed = timeout(Duration::from_secs(2), async {
        loop {
            if let Some(ServerEvent::SessionClosed(closed)) = rx.recv().await {
                break closed;
            }
        }
    })
    .await
    .unwrap();
    let detected_in = killed_at.elapsed();
    assert!(
        detected_in < POLL_INTERVAL + EXIT_MARGIN,
        "exit reached the client after {:?}",
        detected_in
    );

    // The notice is sent once the session is gone from the registry.
    assert!(h.controller.get_session("s3").is_none());
    assert_eq!(h.controller.registry().bridge_count(), 0);
    assert_eq!(closed.bridge_id, bridge_id);
    assert_eq!(closed.reason, "shell exited");
}

#[tokio::test]
async fn test_resize_after_termination_is_silent() {
    let h = harness();
    let mut rx = h.router.output().register_client("s4");
    bridge_of(h.router.dispatch("s4", start("c4")).await);

    assert!(h.controller.cleanup_session("s4").await);
    while rx.try_recv().is_ok() {}

    let resize = ClientEvent::SessionResize(SessionResize { rows: 40, cols: 120 });
    assert!(h.router.dispatch("s4", resize).await.is_none());
    assert!(h.controller.handle_resize("s4", 40, 120).await.is_ok());

    sleep(Duration::from_millis(100)).await;
    assert!(rx.try_recv().is_err());
}

// =============================================================================
// Teardown properties
// =============================================================================

#[tokio::test]
async fn test_no_output_after_cleanup_returns() {
    let h = harness();
    let mut rx = h.router.output().register_client("flood");
    let bridge_id = bridge_of(h.router.dispatch("flood", start("c1")).await);

    h.router.dispatch("flood", input(b"yes labterm\n")).await;
    read_until(&mut rx, &bridge_id, "labterm").await;

    assert!(h.controller.cleanup_session("flood").await);
    assert!(h.controller.get_session("flood").is_none());

    while rx.try_recv().is_ok() {}
    sleep(Duration::from_millis(200)).await;
    while let Ok(event) = rx.try_recv() {
        if let ServerEvent::SessionOutput(out) = event {
            assert_ne!(out.bridge_id, bridge_id, "output after cleanup");
        }
    }
}

#[tokio::test]
async fn test_restart_replaces_bridge() {
    let h = harness();
    let mut rx = h.router.output().register_client("dup");

    let first = bridge_of(h.router.dispatch("dup", start("c1")).await);
    let second = bridge_of(h.router.dispatch("dup", start("c1")).await);

    assert_ne!(first, second);
    assert_eq!(h.controller.registry().bridge_count(), 1);
    assert!(h.controller.registry().get_bridge(&first).is_none());
    assert_eq!(
        h.controller.get_session("dup").map(|s| s.bridge_id),
        Some(second.clone())
    );

    h.router.dispatch("dup", input(b"echo $((20 + 22))\n")).await;
    read_until(&mut rx, &second, "42").await;
}

#[tokio::test]
async fn test_concurrent_input_and_cleanup() {
    let h = harness();
    let _rx = h.router.output().register_client("race");
    bridge_of(h.router.dispatch("race", start("c1")).await);

    let mut tasks = Vec::new();
    for i in 0..32 {
        let controller = Arc::clone(&h.controller);
        tasks.push(tokio::spawn(async move {
            if i == 16 {
                controller.cleanup_session("race").await;
            } else {
                let _ = controller.handle_input("race", b"true\n").await;
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert!(h.controller.get_session("race").is_none());
    assert_eq!(h.controller.registry().bridge_count(), 0);
}

#[tokio::test]
async fn test_room_isolation_on_failure() {
    let h = harness();
    let _a = h.router.output().register_client("a");
    let _b = h.router.output().register_client("b");

    bridge_of(h.router.dispatch("a", start("c1")).await);
    h.router.dispatch("b", start("missing")).await;

    let session = h.controller.get_session("a").unwrap();
    assert_eq!(session.status(), SessionStatus::Running);
    assert!(h.controller.get_session("b").is_none());
}

// =============================================================================
// Full stack over WebSocket
// =============================================================================

#[tokio::test]
async fn test_websocket_session_round_trip() {
    let temp_dir = TempDir::new().unwrap();
    let mut config = Config::default();
    config.daemon.data_dir = temp_dir.path().to_path_buf();
    config.gateway.listen_addr = "127.0.0.1:0".to_string();
    config.session.shell = vec!["/bin/sh".to_string()];

    let mut orchestrator = DaemonOrchestrator::new(config, Arc::new(LocalRuntime::new())).unwrap();
    orchestrator.start().await.unwrap();
    let addr = orchestrator.local_addr().unwrap();

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{}", addr))
        .await
        .unwrap();

    // MessagePack frames get MessagePack replies.
    let frame = encode(&start("attacker-lab1"), WireFormat::MessagePack).unwrap();
    ws.send(WsMessage::Binary(frame)).await.unwrap();
    let frame = encode(&input(b"echo hello-$((1 + 1))\n"), WireFormat::MessagePack).unwrap();
    ws.send(WsMessage::Binary(frame)).await.unwrap();

    let mut bridge_id = None;
    let mut seen = Vec::new();
    timeout(Duration::from_secs(5), async {
        while let Some(Ok(msg)) = ws.next().await {
            let WsMessage::Binary(data) = msg else {
                continue;
            };
            match decode::<ServerEvent>(&data, WireFormat::MessagePack).unwrap() {
                ServerEvent::StartSessionReply(reply) => {
                    assert!(reply.is_ok());
                    bridge_id = reply.bridge_id;
                }
                ServerEvent::SessionOutput(out) => {
                    seen.extend_from_slice(&out.data);
                    if String::from_utf8_lossy(&seen).contains("hello-2") {
                        break;
                    }
                }
                other => panic!("unexpected event: {:?}", other),
            }
        }
    })
    .await
    .unwrap();
    assert!(bridge_id.is_some());
    assert_eq!(orchestrator.controller().session_count(), 1);

    ws.close(None).await.unwrap();
    let controller = Arc::clone(orchestrator.controller());
    assert!(wait_until(Duration::from_secs(3), || controller.session_count() == 0).await);

    orchestrator.stop().await.unwrap();
}
