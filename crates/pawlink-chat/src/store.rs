use std::collections::HashSet;

use chrono::{DateTime, Utc};
use tracing::{debug, trace, warn};

use pawlink_types::events::WireMessage;
use pawlink_types::{ChatMessage, RoomId, UserId};

use crate::error::ChatError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    NotLoaded,
    Loading,
    Loaded,
    Failed,
}

/// Render-ready message list for the one open room.
///
/// Append-only: live messages go to the end in arrival order, history is
/// placed before anything that arrived while it was loading. Nothing is
/// de-duplicated by content; only a repeated gateway-supplied id is dropped.
#[derive(Debug)]
pub struct MessageStore {
    room_id: RoomId,
    messages: Vec<ChatMessage>,
    /// Live messages received while history was still in flight.
    pending: Vec<ChatMessage>,
    seen_ids: HashSet<String>,
    load_state: LoadState,
}

impl MessageStore {
    pub fn new(room_id: RoomId) -> Self {
        Self {
            room_id,
            messages: Vec::new(),
            pending: Vec::new(),
            seen_ids: HashSet::new(),
            load_state: LoadState::NotLoaded,
        }
    }

    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn load_state(&self) -> LoadState {
        self.load_state
    }

    /// Mark history as in flight. Returns false if this activation already
    /// started a load; history is fetched once per room activation.
    pub fn begin_history_load(&mut self) -> bool {
        if self.load_state != LoadState::NotLoaded {
            return false;
        }
        self.load_state = LoadState::Loading;
        true
    }

    /// Install the result of the history fetch. On failure the list stays as
    /// it is (usually empty) and the store is marked `Failed`; no retry.
    pub fn apply_history(&mut self, result: Result<Vec<ChatMessage>, ChatError>) {
        let history = match result {
            Ok(history) => history,
            Err(e) => {
                warn!("History load for room {} failed: {}", self.room_id, e);
                self.load_state = LoadState::Failed;
                self.flush_pending();
                return;
            }
        };

        debug!("Loaded {} history messages for room {}", history.len(), self.room_id);

        for msg in history {
            if msg.room_id != self.room_id {
                warn!("History for room {} contained a message for {}", self.room_id, msg.room_id);
                continue;
            }
            self.push(msg);
        }
        self.load_state = LoadState::Loaded;
        self.flush_pending();
    }

    /// Append a live message. Returns false when it was not added: wrong room,
    /// held back until history arrives, or a repeat of a known id.
    pub fn apply_incoming(&mut self, msg: ChatMessage) -> bool {
        if msg.room_id != self.room_id {
            trace!("Ignoring message for room {} while {} is open", msg.room_id, self.room_id);
            return false;
        }

        if self.load_state == LoadState::Loading {
            self.pending.push(msg);
            return false;
        }

        self.push(msg)
    }

    /// Build the outgoing payload for `body`. The store itself is not touched:
    /// the message becomes visible when the gateway echoes it back.
    pub fn outgoing(
        &self,
        sender_id: &UserId,
        sender_name: Option<&str>,
        body: &str,
        now: DateTime<Utc>,
    ) -> WireMessage {
        WireMessage {
            room_id: self.room_id.clone(),
            sender_id: sender_id.clone(),
            message: body.to_string(),
            timestamp: now,
            sender_name: sender_name.map(str::to_string),
            id: None,
        }
    }

    fn flush_pending(&mut self) {
        for msg in std::mem::take(&mut self.pending) {
            self.push(msg);
        }
    }

    fn push(&mut self, msg: ChatMessage) -> bool {
        if let Some(id) = &msg.id {
            if !self.seen_ids.insert(id.clone()) {
                debug!("Dropping repeat of message {} in room {}", id, self.room_id);
                return false;
            }
        }
        self.messages.push(msg);
        true
    }
}
