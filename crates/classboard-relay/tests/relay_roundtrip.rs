use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use classboard_core::protocol::{ClientMessage, ServerMessage};
use classboard_core::{
    ChannelRegistry, LineTool, OperationsCoordinator, RelayTransport, SerializableColor, SyncConfig,
    SyncSettings, resolve_sync_config,
};
use classboard_relay::{AppState, app};
use futures_util::{SinkExt, StreamExt};
use kurbo::Point;
use serde_json::json;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start_relay() -> SocketAddr {
    start_relay_on("127.0.0.1:0".parse().unwrap()).await
}

async fn start_relay_on(addr: SocketAddr) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = Arc::new(AppState::new(64));
    tokio::spawn(async move {
        let _ = axum::serve(listener, app(state)).await;
    });
    addr
}

async fn connect(addr: SocketAddr) -> Client {
    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws", addr))
        .await
        .expect("ws connect");
    ws
}

async fn send(ws: &mut Client, msg: &ClientMessage) {
    let text = serde_json::to_string(msg).unwrap();
    ws.send(Message::Text(text.into())).await.unwrap();
}

async fn recv(ws: &mut Client) -> ServerMessage {
    loop {
        let msg = timeout(Duration::from_secs(3), ws.next())
            .await
            .expect("timed out waiting for relay")
            .expect("relay closed the socket")
            .unwrap();
        if let Message::Text(text) = msg {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

async fn subscribe(ws: &mut Client, topic: &str) -> usize {
    send(ws, &ClientMessage::Subscribe { topic: topic.to_string() }).await;
    match recv(ws).await {
        ServerMessage::Subscribed { subscriber_count, .. } => subscriber_count,
        other => panic!("Expected subscribed, got {:?}", other),
    }
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    for _ in 0..100 {
        if condition() {
            return;
        }
        sleep(Duration::from_millis(50)).await;
    }
    panic!("condition not met in time");
}

#[tokio::test]
async fn test_publish_reaches_other_subscribers_only() {
    let addr = start_relay().await;
    let mut alice = connect(addr).await;
    let mut bob = connect(addr).await;

    assert_eq!(subscribe(&mut alice, "session-s1-main").await, 1);
    assert_eq!(subscribe(&mut bob, "session-s1-main").await, 2);

    let operation = json!({"id": "op-1", "timestamp": 1, "sender_id": "alice", "operation_type": "undo"});
    send(
        &mut alice,
        &ClientMessage::Publish {
            topic: "session-s1-main".to_string(),
            operation: operation.clone(),
        },
    )
    .await;

    match recv(&mut bob).await {
        ServerMessage::Operation { topic, operation: received, .. } => {
            assert_eq!(topic, "session-s1-main");
            assert_eq!(received, operation);
        }
        other => panic!("Expected operation, got {:?}", other),
    }

    // No echo to the publisher.
    assert!(timeout(Duration::from_millis(200), alice.next()).await.is_err());
}

#[tokio::test]
async fn test_topics_are_isolated() {
    let addr = start_relay().await;
    let mut alice = connect(addr).await;
    let mut bob = connect(addr).await;

    subscribe(&mut alice, "session-s1-student-a").await;
    subscribe(&mut alice, "session-s1-main").await;
    subscribe(&mut bob, "session-s1-student-b").await;

    send(
        &mut alice,
        &ClientMessage::Publish {
            topic: "session-s1-student-a".to_string(),
            operation: json!({"operation_type": "redo"}),
        },
    )
    .await;
    assert!(timeout(Duration::from_millis(200), bob.next()).await.is_err());
}

#[tokio::test]
async fn test_malformed_message_gets_error() {
    let addr = start_relay().await;
    let mut ws = connect(addr).await;

    ws.send(Message::Text("not json".into())).await.unwrap();
    assert!(matches!(recv(&mut ws).await, ServerMessage::Error { .. }));

    // The connection survives.
    assert_eq!(subscribe(&mut ws, "t").await, 1);
}

fn relay_board(url: &str, board_id: &str, sender: &str) -> (OperationsCoordinator, Arc<ChannelRegistry>, SyncConfig) {
    let registry = Arc::new(ChannelRegistry::new(Arc::new(RelayTransport::connect(url).unwrap())));
    let config = resolve_sync_config(board_id, Some("s1"), sender, None, None).unwrap();
    let board = OperationsCoordinator::new(
        board_id,
        Some(registry.clone()),
        Some(config.clone()),
        SyncSettings::default(),
    );
    (board, registry, config)
}

/// A teacher board and its shared student mirror, both subscribed.
async fn teacher_and_student(addr: SocketAddr) -> (OperationsCoordinator, OperationsCoordinator) {
    let url = format!("ws://{}/ws", addr);
    let (teacher, teacher_registry, teacher_config) = relay_board(&url, "teacher-main", "teacher");
    let (student, student_registry, student_config) = relay_board(&url, "student-shared-teacher", "student");

    wait_for(|| teacher_registry.connection_status(&teacher_config).is_connected).await;
    wait_for(|| student_registry.connection_status(&student_config).is_connected).await;
    (teacher, student)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_boards_sync_through_relay() {
    let addr = start_relay().await;
    let (mut teacher, mut student) = teacher_and_student(addr).await;

    teacher
        .start_drawing(LineTool::Pen, Point::new(0.0, 0.0), SerializableColor::black(), 3.0)
        .unwrap();
    teacher.continue_drawing(Point::new(30.0, 40.0));
    teacher.stop_drawing().unwrap();

    wait_for(|| {
        student.poll(Instant::now());
        student.history().len() == 2
    })
    .await;
    assert_eq!(student.state().lines, teacher.state().lines);

    assert!(teacher.undo());
    wait_for(|| {
        student.poll(Instant::now());
        student.state().is_empty()
    })
    .await;

    // Nothing was echoed back to the teacher.
    assert_eq!(teacher.poll(Instant::now()), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_long_stroke_is_not_throttled() {
    let addr = start_relay().await;
    let (mut teacher, mut student) = teacher_and_student(addr).await;

    let started = Instant::now();
    teacher
        .start_drawing(LineTool::Pen, Point::new(0.0, 0.0), SerializableColor::black(), 3.0)
        .unwrap();
    for i in 1..=200 {
        assert!(teacher.continue_drawing(Point::new(i as f64, (i % 7) as f64)));
    }
    teacher.stop_drawing().unwrap();

    wait_for(|| {
        student.poll(Instant::now());
        student.history().len() == 2
    })
    .await;
    let elapsed = started.elapsed();
    assert!(elapsed < Duration::from_secs(2), "stroke took {:?} to arrive", elapsed);
    assert_eq!(student.state().lines, teacher.state().lines);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_transport_recovers_when_relay_starts_late() {
    let addr = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };
    let url = format!("ws://{}/ws", addr);
    let (mut teacher, registry, config) = relay_board(&url, "teacher-main", "teacher");
    sleep(Duration::from_millis(200)).await;
    assert!(!registry.connection_status(&config).is_connected);

    start_relay_on(addr).await;
    wait_for(|| registry.connection_status(&config).is_connected).await;

    // The topic was subscribed again on the new socket.
    let mut observer = connect(addr).await;
    assert_eq!(subscribe(&mut observer, &config.topic).await, 2);
    teacher
        .start_drawing(LineTool::Pen, Point::new(0.0, 0.0), SerializableColor::black(), 3.0)
        .unwrap();
    match recv(&mut observer).await {
        ServerMessage::Operation { topic, operation, .. } => {
            assert_eq!(topic, config.topic);
            assert_eq!(operation["operation_type"], "draw_start");
        }
        other => panic!("Expected operation, got {:?}", other),
    }
}
