use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::routing::get;
use axum::Router;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use sync_core::push::{ConnectionState, PushChannelManager};
use sync_core::socket::WsConnector;
use sync_core::{ReconnectPolicy, SlotChange};

#[derive(Clone)]
struct Calendar {
    connections: Arc<AtomicUsize>,
    /// Close the socket after sending the scripted frames.
    hang_up: bool,
}

async fn serve(calendar: Calendar) -> String {
    let app = Router::new()
        .route("/ws/calendar", get(upgrade))
        .with_state(calendar);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("ws://{addr}/ws/calendar")
}

async fn upgrade(State(calendar): State<Calendar>, ws: WebSocketUpgrade) -> axum::response::Response {
    let connection = calendar.connections.fetch_add(1, Ordering::SeqCst) as i64;
    ws.on_upgrade(move |socket| push_frames(socket, connection, calendar.hang_up))
}

async fn push_frames(mut socket: WebSocket, connection: i64, hang_up: bool) {
    let frames = [
        slot_frame(connection * 10 + 1, "created"),
        json!({"type": "presence", "online": true}).to_string(),
        slot_frame(connection * 10 + 2, "updated"),
    ];
    for frame in frames {
        if socket.send(WsMessage::Text(frame)).await.is_err() {
            return;
        }
    }
    if socket.send(WsMessage::Binary(vec![0, 1, 2])).await.is_err() {
        return;
    }
    if hang_up {
        let _ = socket.send(WsMessage::Close(None)).await;
        return;
    }
    while let Some(Ok(_)) = socket.recv().await {}
}

fn slot_frame(slot_id: i64, change_type: &str) -> String {
    json!({
        "type": "slot_change",
        "change_type": change_type,
        "slot_id": slot_id,
        "timestamp": "2024-06-03T08:30:00Z",
        "interviewer": "sam",
    })
    .to_string()
}

fn sink() -> (
    impl FnMut(SlotChange) -> bool + Send + 'static,
    mpsc::UnboundedReceiver<SlotChange>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    (move |change| tx.send(change).is_ok(), rx)
}

#[tokio::test]
async fn slot_changes_arrive_in_transport_order() {
    let url = serve(Calendar {
        connections: Arc::default(),
        hang_up: false,
    })
    .await;
    let (deliver, mut changes) = sink();
    let handle = PushChannelManager::new(
        Arc::new(WsConnector::new(&url).expect("url")),
        deliver,
        ReconnectPolicy::default(),
        CancellationToken::new(),
    )
    .spawn();

    let first = changes.recv().await.expect("first change");
    let second = changes.recv().await.expect("second change");
    assert_eq!((first.slot_id, second.slot_id), (1, 2));
    assert_eq!(first.payload["interviewer"], "sam");
    assert_eq!(handle.status().state, ConnectionState::Open);
    assert_eq!(handle.status().attempt, 0);

    handle.shutdown().await;
}

#[tokio::test]
async fn server_hang_up_reconnects_and_resumes() {
    let connections = Arc::new(AtomicUsize::new(0));
    let url = serve(Calendar {
        connections: connections.clone(),
        hang_up: true,
    })
    .await;
    let (deliver, mut changes) = sink();
    let policy = ReconnectPolicy {
        base: Duration::from_millis(10),
        cap: Duration::from_millis(50),
        max_attempts: 5,
    };
    let handle = PushChannelManager::new(
        Arc::new(WsConnector::new(&url).expect("url")),
        deliver,
        policy,
        CancellationToken::new(),
    )
    .spawn();

    let mut seen = Vec::new();
    while seen.len() < 4 {
        let change = tokio::time::timeout(Duration::from_secs(5), changes.recv())
            .await
            .expect("change before timeout")
            .expect("channel open");
        seen.push(change.slot_id);
    }
    assert_eq!(seen, [1, 2, 11, 12]);
    assert!(connections.load(Ordering::SeqCst) >= 2);

    handle.shutdown().await;
}

#[tokio::test]
async fn unreachable_endpoint_parks_after_max_attempts() {
    // Grab a free port and release it so connects are refused.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    let (deliver, _changes) = sink();
    let policy = ReconnectPolicy {
        base: Duration::from_millis(1),
        cap: Duration::from_millis(5),
        max_attempts: 3,
    };
    let handle = PushChannelManager::new(
        Arc::new(WsConnector::new(&format!("ws://{addr}/ws/calendar")).expect("url")),
        deliver,
        policy,
        CancellationToken::new(),
    )
    .spawn();

    let mut status = handle.subscribe();
    let parked = tokio::time::timeout(
        Duration::from_secs(5),
        status.wait_for(|s| s.state == ConnectionState::Disabled),
    )
    .await
    .expect("parks before timeout")
    .map(|s| *s)
    .expect("status channel open");
    assert_eq!(parked.attempt, 3);

    handle.shutdown().await;
}
