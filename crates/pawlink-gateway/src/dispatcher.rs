use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{RwLock, broadcast};
use tracing::{debug, info, warn};
use uuid::Uuid;

use pawlink_types::api::{ChatSummary, HistoryEntry, HistorySender, Participant};
use pawlink_types::events::{ServerEvent, WireMessage};
use pawlink_types::{RoomId, UserId};

/// A serialized event on its way to the sockets that joined `room_id`.
#[derive(Debug, Clone)]
pub struct RoomBroadcast {
    pub room_id: RoomId,
    /// Connection that caused the event; it is not sent back there.
    pub skip_conn: Option<Uuid>,
    pub json: Arc<str>,
}

#[derive(Debug, Clone)]
struct RoomInfo {
    pet_id: String,
    participants: Vec<UserId>,
    last_message: Option<String>,
    updated_at: DateTime<Utc>,
}

/// Room state and fan-out for every connected socket.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    /// All room events; each connection filters by its joined rooms
    broadcast_tx: broadcast::Sender<RoomBroadcast>,

    rooms: RwLock<HashMap<RoomId, RoomInfo>>,

    /// room_id -> recorded messages, oldest first
    history: RwLock<HashMap<RoomId, Vec<HistoryEntry>>>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        let (broadcast_tx, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(DispatcherInner {
                broadcast_tx,
                rooms: RwLock::new(HashMap::new()),
                history: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RoomBroadcast> {
        self.inner.broadcast_tx.subscribe()
    }

    /// Send an event to every socket in its room, except `skip_conn`.
    pub fn broadcast(&self, event: &ServerEvent, skip_conn: Option<Uuid>) {
        let json = match serde_json::to_string(event) {
            Ok(json) => json,
            Err(e) => {
                warn!("Failed to serialize event for room {}: {}", event.room_id(), e);
                return;
            }
        };
        let _ = self.inner.broadcast_tx.send(RoomBroadcast {
            room_id: event.room_id().clone(),
            skip_conn,
            json: json.into(),
        });
    }

    /// Record a message and echo it to the whole room, sender included.
    pub async fn publish_message(&self, msg: WireMessage) {
        let now = Utc::now();
        let entry = HistoryEntry {
            id: msg.id.clone(),
            sender_id: msg.sender_id.clone(),
            message_text: msg.message.clone(),
            created_at: now,
            sender: msg.sender_name.clone().map(HistorySender::Name),
        };

        self.inner
            .history
            .write()
            .await
            .entry(msg.room_id.clone())
            .or_default()
            .push(entry);

        {
            let mut rooms = self.inner.rooms.write().await;
            let room = rooms.entry(msg.room_id.clone()).or_insert_with(|| RoomInfo {
                pet_id: String::new(),
                participants: Vec::new(),
                last_message: None,
                updated_at: now,
            });
            if !room.participants.contains(&msg.sender_id) {
                room.participants.push(msg.sender_id.clone());
            }
            room.last_message = Some(msg.message.clone());
            room.updated_at = now;
        }

        debug!("{} posted to room {}", msg.sender_id, msg.room_id);
        self.broadcast(&ServerEvent::ReceiveMessage(msg), None);
    }

    pub async fn history(&self, room_id: &RoomId) -> Vec<HistoryEntry> {
        self.inner
            .history
            .read()
            .await
            .get(room_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Find or create the room between `user_id` and the owner of `pet_id`.
    pub async fn initiate(&self, pet_id: &str, user_id: &UserId) -> RoomId {
        let mut rooms = self.inner.rooms.write().await;

        if let Some((room_id, _)) = rooms
            .iter()
            .find(|(_, r)| r.pet_id == pet_id && r.participants.contains(user_id))
        {
            return room_id.clone();
        }

        let room_id = RoomId::new(Uuid::new_v4().to_string());
        rooms.insert(
            room_id.clone(),
            RoomInfo {
                pet_id: pet_id.to_string(),
                participants: vec![user_id.clone()],
                last_message: None,
                updated_at: Utc::now(),
            },
        );
        info!("{} opened room {} for pet {}", user_id, room_id, pet_id);
        room_id
    }

    /// Rooms `user_id` takes part in, most recently active first.
    pub async fn list(&self, user_id: &UserId) -> Vec<ChatSummary> {
        let rooms = self.inner.rooms.read().await;
        let mut summaries: Vec<ChatSummary> = rooms
            .iter()
            .filter(|(_, r)| r.participants.contains(user_id))
            .map(|(room_id, r)| ChatSummary {
                id: room_id.clone(),
                other_participant: r
                    .participants
                    .iter()
                    .find(|p| *p != user_id)
                    .map(|p| Participant {
                        id: Some(p.clone()),
                        name: None,
                    }),
                pet_name: (!r.pet_id.is_empty()).then(|| r.pet_id.clone()),
                pet_image: None,
                last_message: r.last_message.clone(),
                updated_at: r.updated_at,
            })
            .collect();
        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        summaries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wire(room: &str, sender: &str, body: &str) -> WireMessage {
        WireMessage {
            room_id: room.into(),
            sender_id: sender.into(),
            message: body.into(),
            timestamp: Utc::now(),
            sender_name: Some("Ana".into()),
            id: None,
        }
    }

    #[tokio::test]
    async fn publish_records_and_broadcasts() {
        let d = Dispatcher::new();
        let mut rx = d.subscribe();

        d.publish_message(wire("42", "u1", "hi")).await;

        let b = rx.recv().await.unwrap();
        assert_eq!(b.room_id.as_str(), "42");
        assert!(b.skip_conn.is_none());
        assert!(b.json.contains("receive_message"));

        let history = d.history(&RoomId::from("42")).await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].message_text, "hi");
    }

    #[tokio::test]
    async fn initiate_reuses_room_per_pet_and_user() {
        let d = Dispatcher::new();
        let u = UserId::from("u1");
        let a = d.initiate("pet-1", &u).await;
        let b = d.initiate("pet-1", &u).await;
        let c = d.initiate("pet-2", &u).await;
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn list_shows_counterpart_and_last_message() {
        let d = Dispatcher::new();
        let owner = UserId::from("owner");
        let room = d.initiate("pet-1", &UserId::from("adopter")).await;
        d.publish_message(wire(room.as_str(), "owner", "still available")).await;

        let list = d.list(&owner).await;
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].last_message.as_deref(), Some("still available"));
        assert_eq!(
            list[0].other_participant.as_ref().and_then(|p| p.id.clone()),
            Some(UserId::from("adopter"))
        );
        assert!(d.list(&UserId::from("stranger")).await.is_empty());
    }
}
