//! Transport behavior across a dropped socket, against a minimal gateway that
//! records every frame per socket and can be told to hang up.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::Router;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use chrono::Utc;
use tokio::sync::{Notify, mpsc};

use pawlink_chat::{Connection, ConnectionState, SubscriptionEvent};
use pawlink_types::events::{ClientCommand, ServerEvent, WireMessage};
use pawlink_types::{RoomId, UserId};

const WAIT: Duration = Duration::from_secs(5);

#[derive(Clone)]
struct Upstream {
    upgrades: Arc<AtomicUsize>,
    frames: mpsc::UnboundedSender<(usize, ClientCommand)>,
    hang_up: Arc<Notify>,
}

async fn upgrade(ws: WebSocketUpgrade, State(up): State<Upstream>) -> Response {
    let socket_no = up.upgrades.fetch_add(1, Ordering::SeqCst) + 1;
    ws.on_upgrade(move |socket| serve(socket, socket_no, up))
}

async fn serve(mut socket: WebSocket, socket_no: usize, up: Upstream) {
    loop {
        tokio::select! {
            _ = up.hang_up.notified() => {
                let _ = socket.send(Message::Close(None)).await;
                return;
            }
            frame = socket.recv() => {
                let text = match frame {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(_)) => continue,
                    _ => return,
                };
                let cmd: ClientCommand = serde_json::from_str(text.as_str()).unwrap();
                if let ClientCommand::SendMessage(wire) = &cmd {
                    let echo = ServerEvent::ReceiveMessage(wire.clone());
                    let json = serde_json::to_string(&echo).unwrap();
                    if socket.send(Message::Text(json.into())).await.is_err() {
                        return;
                    }
                }
                let _ = up.frames.send((socket_no, cmd));
            }
        }
    }
}

struct TestGateway {
    url: String,
    upgrades: Arc<AtomicUsize>,
    frames: mpsc::UnboundedReceiver<(usize, ClientCommand)>,
    hang_up: Arc<Notify>,
}

impl TestGateway {
    async fn start() -> Self {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();

        let (tx, frames) = mpsc::unbounded_channel();
        let up = Upstream {
            upgrades: Arc::new(AtomicUsize::new(0)),
            frames: tx,
            hang_up: Arc::new(Notify::new()),
        };
        let app = Router::new()
            .route("/gateway", get(upgrade))
            .with_state(up.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            url: format!("ws://{}/gateway", addr),
            upgrades: up.upgrades,
            frames,
            hang_up: up.hang_up,
        }
    }

    fn upgrades(&self) -> usize {
        self.upgrades.load(Ordering::SeqCst)
    }

    /// Next `n` frames, each tagged with the socket (1-based) it arrived on.
    async fn next_frames(&mut self, n: usize) -> Vec<(usize, ClientCommand)> {
        let mut out = Vec::new();
        while out.len() < n {
            let frame = tokio::time::timeout(WAIT, self.frames.recv())
                .await
                .expect("timed out waiting for a frame")
                .expect("gateway gone");
            out.push(frame);
        }
        out
    }
}

fn join(room: &str) -> ClientCommand {
    ClientCommand::JoinChat(RoomId::from(room))
}

#[tokio::test]
async fn live_rooms_are_rejoined_after_drop() {
    let mut gateway = TestGateway::start().await;
    let conn = Connection::new(gateway.url.clone(), Duration::from_millis(50));
    conn.connect();
    conn.connect();

    let mut adoption = conn.subscribe(&RoomId::from("42")).unwrap();
    let _vet = conn.subscribe(&RoomId::from("7")).unwrap();
    let closed = conn.subscribe(&RoomId::from("9")).unwrap();

    let first = gateway.next_frames(3).await;
    assert_eq!(first, vec![(1, join("42")), (1, join("7")), (1, join("9"))]);
    assert_eq!(gateway.upgrades(), 1);

    // Room 9 is closed before the socket goes away
    closed.cancel();
    gateway.hang_up.notify_one();

    let rejoined = gateway.next_frames(2).await;
    assert!(rejoined.iter().all(|(socket_no, _)| *socket_no == 2));
    let rejoined: Vec<ClientCommand> = rejoined.into_iter().map(|(_, cmd)| cmd).collect();
    assert_eq!(rejoined.len(), 2);
    assert!(rejoined.contains(&join("42")));
    assert!(rejoined.contains(&join("7")));
    assert_eq!(gateway.upgrades(), 2);

    let state = *conn.state().borrow();
    assert_eq!(state, ConnectionState::Connected);

    let wire = WireMessage {
        room_id: RoomId::from("42"),
        sender_id: UserId::from("u1"),
        message: "back online".into(),
        timestamp: Utc::now(),
        sender_name: None,
        id: None,
    };
    conn.send(ClientCommand::SendMessage(wire.clone())).unwrap();

    // The message follows the rejoins, with no join for the closed room in between
    assert_eq!(
        gateway.next_frames(1).await,
        vec![(2, ClientCommand::SendMessage(wire.clone()))]
    );

    let event = tokio::time::timeout(WAIT, adoption.recv())
        .await
        .expect("timed out waiting for the echo");
    assert_eq!(
        event,
        Some(SubscriptionEvent::Event(ServerEvent::ReceiveMessage(wire)))
    );

    conn.shutdown();
}
