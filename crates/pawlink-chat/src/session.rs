use chrono::Utc;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use pawlink_types::events::{ClientCommand, ServerEvent};
use pawlink_types::{ChatMessage, RoomId, TypingKind, TypingSignal, UserId};

use crate::api::HistorySource;
use crate::config::ChatConfig;
use crate::connection::{Connection, RoomSubscription, SubscriptionEvent};
use crate::error::{ChatError, Result};
use crate::presenter::{Presenter, ScrollAnchor, ViewState};
use crate::store::{LoadState, MessageStore};
use crate::typing::{LocalTyping, RemoteTyping};

type HistoryTask = JoinHandle<Result<Vec<ChatMessage>>>;

/// Who is chatting on this client.
#[derive(Debug, Clone)]
pub struct Identity {
    pub user_id: UserId,
    pub display_name: Option<String>,
}

/// What `ChatSession::next_update` just applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionUpdate {
    HistoryLoaded { count: usize },
    HistoryFailed { reason: String },
    /// A live message arrived; `appended` is false when it was held for
    /// history or dropped as a repeat.
    Message { appended: bool },
    /// The subscription fell behind and skipped events. The message list was
    /// reset and history is being fetched again.
    Resync { skipped: u64 },
    RemoteTyping(bool),
    /// The quiet period ran out and `stop_typing` was sent.
    LocalTypingStopped,
    Unchanged,
}

/// One open room: subscription, message list, typing state and rendering.
pub struct ChatSession<H: HistorySource> {
    connection: Connection,
    history: H,
    identity: Identity,
    subscription: RoomSubscription,
    store: MessageStore,
    history_task: Option<HistoryTask>,
    local_typing: LocalTyping,
    remote_typing: RemoteTyping,
    presenter: Presenter,
    scroll: ScrollAnchor,
}

impl<H: HistorySource> ChatSession<H> {
    /// Join `room_id` and start fetching its history.
    pub fn open(
        connection: Connection,
        history: H,
        identity: Identity,
        room_id: RoomId,
        config: &ChatConfig,
    ) -> Result<Self> {
        info!("Opening room {} as {}", room_id, identity.user_id);

        let subscription = connection.subscribe(&room_id)?;
        let mut session = Self {
            subscription,
            store: MessageStore::new(room_id),
            history_task: None,
            local_typing: LocalTyping::new(config.typing_quiet_period),
            remote_typing: RemoteTyping::new(
                identity.user_id.clone(),
                config.remote_typing_timeout,
            ),
            presenter: Presenter::new(identity.user_id.clone()),
            scroll: ScrollAnchor::default(),
            connection,
            history,
            identity,
        };
        session.start_history();
        Ok(session)
    }

    pub fn with_presenter(mut self, presenter: Presenter) -> Self {
        self.presenter = presenter;
        self
    }

    pub fn room_id(&self) -> &RoomId {
        self.store.room_id()
    }

    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    pub fn is_composing(&self) -> bool {
        self.local_typing.is_composing()
    }

    pub fn is_remote_typing(&self) -> bool {
        self.remote_typing.is_typing()
    }

    /// Wait for the next thing that changes this room and apply it. `None`
    /// once the subscription has ended (shutdown or cancellation).
    pub async fn next_update(&mut self) -> Option<SessionUpdate> {
        let local_deadline = self.local_typing.deadline();
        let remote_deadline = self.remote_typing.deadline();

        tokio::select! {
            joined = wait_history(&mut self.history_task) => {
                self.history_task = None;
                Some(self.finish_history(joined))
            }
            event = self.subscription.recv() => {
                match event? {
                    SubscriptionEvent::Event(event) => Some(self.apply_event(event)),
                    SubscriptionEvent::Lagged(skipped) => Some(self.resync(skipped)),
                }
            }
            _ = sleep_until(local_deadline) => {
                match self.local_typing.poll_expired(Instant::now()) {
                    Some(kind) => {
                        // The connection being gone is reported by the next send
                        let _ = self.emit_typing(kind);
                        Some(SessionUpdate::LocalTypingStopped)
                    }
                    None => Some(SessionUpdate::Unchanged),
                }
            }
            _ = sleep_until(remote_deadline) => {
                if self.remote_typing.expire(Instant::now()) {
                    Some(SessionUpdate::RemoteTyping(self.remote_typing.is_typing()))
                } else {
                    Some(SessionUpdate::Unchanged)
                }
            }
        }
    }

    /// The input box changed. Emits `typing` when composing starts.
    pub fn input_changed(&mut self) -> Result<()> {
        match self.local_typing.on_keystroke(Instant::now()) {
            Some(kind) => self.emit_typing(kind),
            None => Ok(()),
        }
    }

    /// Publish `body` to the room. Does not insert locally: the message shows
    /// up once the gateway echoes it back.
    pub fn send(&mut self, body: &str) -> Result<()> {
        if body.trim().is_empty() {
            return Err(ChatError::EmptyMessage);
        }

        if let Some(kind) = self.local_typing.on_submit() {
            self.emit_typing(kind)?;
        }

        let wire = self.store.outgoing(
            &self.identity.user_id,
            self.identity.display_name.as_deref(),
            body,
            Utc::now(),
        );
        debug!("Sending message to room {}", wire.room_id);
        self.connection.send(ClientCommand::SendMessage(wire))
    }

    /// Leave the current room's stream and open `room_id` with fresh history.
    pub fn switch_room(&mut self, room_id: RoomId) -> Result<()> {
        info!("Switching room {} -> {}", self.store.room_id(), room_id);

        if let Some(kind) = self.local_typing.on_submit() {
            self.emit_typing(kind)?;
        }

        let next = self.connection.subscribe(&room_id)?;
        if let Some(task) = self.history_task.take() {
            task.abort();
        }
        std::mem::replace(&mut self.subscription, next).cancel();

        self.store = MessageStore::new(room_id);
        self.remote_typing.clear();
        self.scroll.reset();
        self.start_history();
        Ok(())
    }

    pub fn view(&mut self) -> ViewState {
        let rows = self.presenter.rows(self.store.messages());
        let remote_typing = self.remote_typing.is_typing();
        let scroll_to_latest = self.scroll.observe(rows.len(), remote_typing);

        ViewState {
            rows,
            loading: self.store.load_state() == LoadState::Loading,
            load_failed: self.store.load_state() == LoadState::Failed,
            remote_typing,
            scroll_to_latest,
        }
    }

    fn start_history(&mut self) {
        if !self.store.begin_history_load() {
            return;
        }
        let source = self.history.clone();
        let room_id = self.store.room_id().clone();
        self.history_task = Some(tokio::spawn(async move {
            source.fetch_history(&room_id).await
        }));
    }

    /// Live events were lost, so the list can no longer be trusted. Rebuild it
    /// from history; anything still buffered arrives after it.
    fn resync(&mut self, skipped: u64) -> SessionUpdate {
        warn!("Room {} missed {} events, reloading history", self.store.room_id(), skipped);
        if let Some(task) = self.history_task.take() {
            task.abort();
        }
        self.store = MessageStore::new(self.store.room_id().clone());
        self.scroll.reset();
        self.start_history();
        SessionUpdate::Resync { skipped }
    }

    fn finish_history(
        &mut self,
        joined: std::result::Result<Result<Vec<ChatMessage>>, JoinError>,
    ) -> SessionUpdate {
        let result = joined
            .unwrap_or_else(|e| Err(ChatError::Transport(format!("history task failed: {e}"))));

        let update = match &result {
            Ok(history) => SessionUpdate::HistoryLoaded {
                count: history.len(),
            },
            Err(e) => SessionUpdate::HistoryFailed {
                reason: e.to_string(),
            },
        };
        self.store.apply_history(result);
        update
    }

    fn apply_event(&mut self, event: ServerEvent) -> SessionUpdate {
        match event {
            ServerEvent::ReceiveMessage(wire) => {
                let msg = ChatMessage::from(wire);
                self.remote_typing.on_message(&msg.sender_id);
                SessionUpdate::Message {
                    appended: self.store.apply_incoming(msg),
                }
            }
            other => {
                let Some(signal) = other.typing_signal() else {
                    return SessionUpdate::Unchanged;
                };
                if self.remote_typing.on_signal(&signal, Instant::now()) {
                    SessionUpdate::RemoteTyping(self.remote_typing.is_typing())
                } else {
                    SessionUpdate::Unchanged
                }
            }
        }
    }

    fn emit_typing(&self, kind: TypingKind) -> Result<()> {
        let signal = TypingSignal {
            room_id: self.store.room_id().clone(),
            sender_id: self.identity.user_id.clone(),
            kind,
        };
        self.connection.send(ClientCommand::typing(&signal))
    }
}

impl<H: HistorySource> Drop for ChatSession<H> {
    fn drop(&mut self) {
        if let Some(task) = self.history_task.take() {
            task.abort();
        }
    }
}

async fn wait_history(
    task: &mut Option<HistoryTask>,
) -> std::result::Result<Result<Vec<ChatMessage>>, JoinError> {
    match task {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
