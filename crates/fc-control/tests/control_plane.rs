//! End-to-end control-plane tests
//!
//! Drives the agent transport with a framed client and checks the registry,
//! dispatcher, scheduler and shell gateway react to it.

use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use fc_control::server::AgentServer;
use fc_control::shell::ShellOptions;
use fc_control::ControlState;
use fc_core::config::ControlConfig;
use fc_core::error::ShellError;
use fc_core::ipc::FleetEvent;
use fc_core::types::{DeviceId, DeviceStatus, Target};
use fc_protocol::{ErrorCode, Frame, FrameCodec, Message};

const AGENT_TOKEN: &str = "fleet-secret";

type AgentStream = Framed<TcpStream, FrameCodec>;

fn test_config() -> ControlConfig {
    ControlConfig {
        agent_token: Some(AGENT_TOKEN.to_string()),
        ..ControlConfig::default()
    }
}

async fn start_agent_server(state: Arc<ControlState>) -> (SocketAddr, CancellationToken) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind agent listener");
    let address = listener.local_addr().unwrap();
    let cancel = state.shutdown.child_token();
    let server = AgentServer::new(state, cancel.clone());
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });
    (address, cancel)
}

async fn next_frame(framed: &mut AgentStream) -> Option<Frame> {
    timeout(Duration::from_secs(5), framed.next())
        .await
        .expect("Timed out waiting for a frame")
        .map(|frame| frame.expect("Failed to decode frame"))
}

/// Connect and register, returning the stream and the RegisterAck
async fn register(address: SocketAddr, host: &str, token: Option<&str>) -> (AgentStream, Message) {
    let socket = TcpStream::connect(address)
        .await
        .expect("Failed to connect to agent server");
    let mut framed = Framed::new(socket, FrameCodec::new());
    framed
        .send(Frame::control(Message::Register {
            host: host.to_string(),
            model: Some("Pixel 8".to_string()),
            address: None,
            token: token.map(str::to_string),
            version: Some("1.0".to_string()),
        }))
        .await
        .expect("Failed to send Register");
    let ack = next_frame(&mut framed)
        .await
        .expect("Connection closed before RegisterAck");
    (framed, ack.message)
}

/// The server hung up: either a clean EOF or a reset
async fn assert_closed(framed: &mut AgentStream) {
    let next = timeout(Duration::from_secs(5), framed.next())
        .await
        .expect("Timed out waiting for the connection to close");
    assert!(!matches!(next, Some(Ok(_))), "Unexpected frame: {:?}", next);
}

async fn wait_until<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    timeout(Duration::from_secs(5), async {
        while !condition().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("Condition not reached in time");
}

#[tokio::test]
async fn test_agent_lifecycle() {
    let state = Arc::new(ControlState::in_memory(test_config()));
    let mut events = state.subscribe();
    let (address, _cancel) = start_agent_server(Arc::clone(&state)).await;

    let (mut agent, ack) = register(address, "lab-01", Some(AGENT_TOKEN)).await;
    assert!(matches!(ack, Message::RegisterAck { accepted: true, .. }));

    let device_id = DeviceId::new("lab-01-Pixel 8");
    assert!(state.registry.is_online(&device_id));
    let info = state.registry.get(&device_id).unwrap();
    assert!(info.address.is_some());

    match events.recv().await.unwrap() {
        FleetEvent::DeviceConnected {
            device,
            online_count,
        } => {
            assert_eq!(device.id, device_id);
            assert_eq!(online_count, 1);
        }
        other => panic!("Expected DeviceConnected, got {:?}", other),
    }

    // Commands pushed through the dispatcher reach the agent
    let report = state
        .dispatcher
        .send(
            &Target::Device(device_id.clone()),
            "battery_status",
            &["--verbose".to_string()],
        )
        .unwrap();
    assert_eq!(report.delivered(), 1);
    let frame = next_frame(&mut agent).await.expect("Expected a Command frame");
    match frame.message {
        Message::Command { request, extras } => {
            assert_eq!(request, "battery_status");
            assert_eq!(extras, vec!["--verbose".to_string()]);
        }
        other => panic!("Expected Command, got {:?}", other),
    }
    assert_eq!(state.command_log.len(), 1);

    agent
        .send(Frame::control(Message::Heartbeat { timestamp: 42 }))
        .await
        .unwrap();
    let frame = next_frame(&mut agent).await.expect("Expected HeartbeatAck");
    assert!(matches!(frame.message, Message::HeartbeatAck { timestamp: 42 }));

    agent
        .send(Frame::control(Message::Response {
            kind: "battery_status".to_string(),
            payload: Bytes::from_static(b"{\"level\":81}"),
        }))
        .await
        .unwrap();
    match timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap()
    {
        FleetEvent::DeviceResponse {
            device_id: from,
            kind,
            payload,
        } => {
            assert_eq!(from, device_id);
            assert_eq!(kind, "battery_status");
            assert_eq!(payload, b"{\"level\":81}".to_vec());
        }
        other => panic!("Expected DeviceResponse, got {:?}", other),
    }

    // Hanging up marks the device offline but keeps its record
    drop(agent);
    wait_until(|| {
        let state = Arc::clone(&state);
        let device_id = device_id.clone();
        async move { !state.registry.is_online(&device_id) }
    })
    .await;
    let info = state.registry.get(&device_id).unwrap();
    assert_eq!(info.status, DeviceStatus::Offline);
    assert!(info.disconnected_at.is_some());

    let err = state
        .dispatcher
        .send(&Target::Device(device_id), "battery_status", &[])
        .unwrap_err();
    assert!(err.to_string().contains("lab-01"));

    state.shutdown();
}

#[tokio::test]
async fn test_reconnect_replaces_session() {
    let state = Arc::new(ControlState::in_memory(test_config()));
    let (address, _cancel) = start_agent_server(Arc::clone(&state)).await;
    let device_id = DeviceId::new("lab-02-Pixel 8");

    let (first, _) = register(address, "lab-02", Some(AGENT_TOKEN)).await;
    let (mut second, ack) = register(address, "lab-02", Some(AGENT_TOKEN)).await;
    assert!(matches!(ack, Message::RegisterAck { accepted: true, .. }));
    assert_eq!(state.registry.len(), 1);

    // The stale connection going away must not take the new one offline
    drop(first);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(state.registry.is_online(&device_id));

    state
        .dispatcher
        .send(&Target::All, "ping", &[])
        .unwrap();
    let frame = next_frame(&mut second).await.expect("Expected a Command frame");
    assert!(matches!(frame.message, Message::Command { .. }));

    state.shutdown();
}

#[tokio::test]
async fn test_bad_token_counts_failed_attempts() {
    let state = Arc::new(ControlState::in_memory(test_config()));
    let (address, _cancel) = start_agent_server(Arc::clone(&state)).await;
    let loopback: IpAddr = "127.0.0.1".parse().unwrap();

    let (_agent, ack) = register(address, "intruder", Some("guess")).await;
    match ack {
        Message::RegisterAck { accepted, reason } => {
            assert!(!accepted);
            assert!(reason.is_some());
        }
        other => panic!("Expected RegisterAck, got {:?}", other),
    }
    assert_eq!(state.security.failed_attempts(&loopback), 1);
    assert!(state.registry.is_empty());

    let (_agent, ack) = register(address, "intruder", None).await;
    assert!(matches!(ack, Message::RegisterAck { accepted: false, .. }));
    assert_eq!(state.security.failed_attempts(&loopback), 2);

    // A good token clears the counter
    let (_agent, ack) = register(address, "lab-03", Some(AGENT_TOKEN)).await;
    assert!(matches!(ack, Message::RegisterAck { accepted: true, .. }));
    assert_eq!(state.security.failed_attempts(&loopback), 0);

    state.shutdown();
}

#[tokio::test]
async fn test_blocked_address_is_dropped_at_accept() {
    let state = Arc::new(ControlState::in_memory(test_config()));
    let (address, _cancel) = start_agent_server(Arc::clone(&state)).await;
    let loopback: IpAddr = "127.0.0.1".parse().unwrap();

    state.security.block(loopback, "test");

    let socket = TcpStream::connect(address).await.unwrap();
    let mut framed = Framed::new(socket, FrameCodec::new());
    let _ = framed
        .send(Frame::control(Message::Register {
            host: "lab-04".to_string(),
            model: None,
            address: None,
            token: Some(AGENT_TOKEN.to_string()),
            version: None,
        }))
        .await;
    assert_closed(&mut framed).await;
    assert!(state.registry.is_empty());

    state.shutdown();
}

#[tokio::test]
async fn test_first_frame_must_be_register() {
    let state = Arc::new(ControlState::in_memory(test_config()));
    let (address, _cancel) = start_agent_server(Arc::clone(&state)).await;

    let socket = TcpStream::connect(address).await.unwrap();
    let mut framed = Framed::new(socket, FrameCodec::new());
    framed
        .send(Frame::control(Message::Heartbeat { timestamp: 1 }))
        .await
        .unwrap();

    let frame = next_frame(&mut framed).await.expect("Expected an Error frame");
    assert!(matches!(
        frame.message,
        Message::Error {
            code: ErrorCode::InvalidMessage,
            ..
        }
    ));
    assert_closed(&mut framed).await;

    state.shutdown();
}

#[tokio::test]
async fn test_task_run_reaches_agent() {
    let state = Arc::new(ControlState::in_memory(test_config()));
    let (address, _cancel) = start_agent_server(Arc::clone(&state)).await;
    let (mut agent, _) = register(address, "lab-05", Some(AGENT_TOKEN)).await;

    let task = state
        .scheduler
        .create("inventory", "system_info", 60, Target::All)
        .unwrap();
    let task = state.scheduler.run_now(&task.id).unwrap();
    assert_eq!(task.run_count, 1);
    assert!(task.last_run.is_some());

    let frame = next_frame(&mut agent).await.expect("Expected a Command frame");
    match frame.message {
        Message::Command { request, .. } => assert_eq!(request, "system_info"),
        other => panic!("Expected Command, got {:?}", other),
    }

    state.shutdown();
}

#[cfg(unix)]
#[tokio::test]
async fn test_shell_session_on_connected_device() {
    let state = Arc::new(ControlState::in_memory(test_config()));
    let (address, _cancel) = start_agent_server(Arc::clone(&state)).await;
    let (_agent, _) = register(address, "lab-06", Some(AGENT_TOKEN)).await;
    let device_id = DeviceId::new("lab-06-Pixel 8");

    let session = state
        .shell
        .create(
            device_id.clone(),
            "operator",
            ShellOptions {
                working_directory: Some("/".to_string()),
                ..ShellOptions::default()
            },
        )
        .unwrap();

    let output = state.shell.execute(&session.id, "echo hello").await.unwrap();
    assert_eq!(output.stdout.trim(), "hello");
    assert_eq!(output.exit_code, Some(0));

    let err = state
        .shell
        .execute(&session.id, "rm -rf /")
        .await
        .unwrap_err();
    assert!(matches!(err, ShellError::CommandBlocked(_)));
    assert!(!state.security.recent_events(10).is_empty());

    let history = state.shell.history(&session.id, None).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(state.shell.stats().total_commands, 2);

    assert!(state
        .shell
        .close(&session.id, fc_core::types::CloseReason::Manual)
        .unwrap());
    let err = state.shell.execute(&session.id, "echo again").await.unwrap_err();
    assert!(matches!(err, ShellError::SessionInactive(_)));

    state.shutdown();
}
