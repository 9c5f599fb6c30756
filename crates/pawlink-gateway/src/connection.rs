use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, info, warn};
use uuid::Uuid;

use pawlink_types::RoomId;
use pawlink_types::events::{ClientCommand, ServerEvent};

use crate::dispatcher::Dispatcher;

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

type JoinedRooms = Arc<RwLock<HashSet<RoomId>>>;

/// Serve one client socket until it closes.
pub async fn handle_connection(socket: WebSocket, dispatcher: Dispatcher) {
    let conn_id = Uuid::new_v4();
    let (mut sender, mut receiver) = socket.split();

    info!("Client {} connected to gateway", conn_id);

    // Rooms this socket joined, shared between the send and recv tasks
    let joined: JoinedRooms = Arc::new(RwLock::new(HashSet::new()));
    let send_joined = joined.clone();

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    let mut broadcast_rx = dispatcher.subscribe();

    // Forward room events -> client, with heartbeat
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                result = broadcast_rx.recv() => {
                    let msg = match result {
                        Ok(msg) => msg,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            warn!("Broadcast receiver lagged by {} messages", n);
                            continue;
                        }
                        Err(_) => break,
                    };

                    if msg.skip_conn == Some(conn_id) {
                        continue;
                    }
                    let is_member = send_joined
                        .read()
                        .unwrap_or_else(PoisonError::into_inner)
                        .contains(&msg.room_id);
                    if !is_member {
                        continue;
                    }

                    if sender.send(Message::Text(msg.json.to_string().into())).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!(
                                "Heartbeat timeout (missed {} pongs), dropping connection",
                                missed_heartbeats
                            );
                            break;
                        }
                    }
                    if sender.send(Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Read commands from client
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<ClientCommand>(&text) {
                    Ok(cmd) => handle_command(&dispatcher, conn_id, cmd, &joined).await,
                    Err(e) => {
                        let raw: String = text.chars().take(200).collect();
                        warn!("{} bad command: {} -- raw: {}", conn_id, e, raw);
                    }
                },
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Wait for either task to finish
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    info!("Client {} disconnected from gateway", conn_id);
}

async fn handle_command(
    dispatcher: &Dispatcher,
    conn_id: Uuid,
    cmd: ClientCommand,
    joined: &JoinedRooms,
) {
    match cmd {
        ClientCommand::JoinChat(room_id) => {
            info!("{} joined room {}", conn_id, room_id);
            joined
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(room_id);
        }

        ClientCommand::SendMessage(msg) => {
            dispatcher.publish_message(msg).await;
        }

        // Typing is relayed to the other sockets in the room only
        ClientCommand::Typing(payload) => {
            debug!("{} typing in {}", payload.sender_id, payload.room_id);
            dispatcher.broadcast(&ServerEvent::Typing(payload), Some(conn_id));
        }

        ClientCommand::StopTyping(payload) => {
            debug!("{} stopped typing in {}", payload.sender_id, payload.room_id);
            dispatcher.broadcast(&ServerEvent::StopTyping(payload), Some(conn_id));
        }
    }
}
