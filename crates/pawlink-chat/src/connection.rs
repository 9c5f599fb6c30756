use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use pawlink_types::RoomId;
use pawlink_types::events::{ClientCommand, ServerEvent};

use crate::config::ChatConfig;
use crate::error::{ChatError, Result};

/// Capacity of the fan-out channel feeding room subscriptions.
const EVENT_BUFFER: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// `connect()` has not been called yet
    Idle,
    Connecting,
    Connected,
    /// Socket lost, waiting to reconnect (or shut down)
    Disconnected,
}

/// The one live transport session shared by every chat surface.
///
/// Cheap to clone. Built once by the application and handed to whoever needs
/// it; `connect()` may be called from any clone, only the first call opens a
/// socket.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    gateway_url: String,
    reconnect_delay: Duration,

    /// Outbound commands. Buffered until a socket is up.
    outbound_tx: mpsc::UnboundedSender<ClientCommand>,

    /// Taken by the transport task on the first `connect()`.
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<ClientCommand>>>,

    /// Every event from the gateway, for all joined rooms
    events_tx: broadcast::Sender<ServerEvent>,

    /// Live subscriptions per room, used to rejoin after a reconnect
    rooms: Mutex<HashMap<RoomId, usize>>,

    state_tx: watch::Sender<ConnectionState>,
    shutdown: CancellationToken,
}

#[derive(Debug, PartialEq, Eq)]
enum PumpExit {
    Shutdown,
    Dropped,
}

/// What a [`RoomSubscription`] yields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionEvent {
    Event(ServerEvent),
    /// The handle fell behind the shared buffer and `n` events (for any
    /// room) were skipped. Anything derived from the stream must be rebuilt.
    Lagged(u64),
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Connection {
    pub fn new(gateway_url: impl Into<String>, reconnect_delay: Duration) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, _) = broadcast::channel(EVENT_BUFFER);
        let (state_tx, _) = watch::channel(ConnectionState::Idle);

        Self {
            inner: Arc::new(ConnectionInner {
                gateway_url: gateway_url.into(),
                reconnect_delay,
                outbound_tx,
                outbound_rx: Mutex::new(Some(outbound_rx)),
                events_tx,
                rooms: Mutex::new(HashMap::new()),
                state_tx,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn from_config(config: &ChatConfig) -> Self {
        Self::new(config.gateway_url.clone(), config.reconnect_delay)
    }

    /// Start the transport task. Idempotent: calls after the first one do
    /// nothing. Must be called from within a Tokio runtime.
    pub fn connect(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }

        let Some(outbound_rx) = lock(&self.inner.outbound_rx).take() else {
            trace!("connect() called on an already started connection");
            return;
        };

        info!("Starting gateway connection to {}", self.inner.gateway_url);
        tokio::spawn(run_transport(self.inner.clone(), outbound_rx));
    }

    /// Ask the gateway to add this session to a room. Has to be re-issued when
    /// the active room changes or a surface remounts.
    pub fn join_room(&self, room_id: &RoomId) -> Result<()> {
        debug!("Joining room {}", room_id);
        self.send(ClientCommand::JoinChat(room_id.clone()))
    }

    /// Queue a command for the gateway. Fire-and-forget: `Ok` means queued,
    /// not delivered.
    pub fn send(&self, cmd: ClientCommand) -> Result<()> {
        if self.inner.shutdown.is_cancelled() {
            return Err(ChatError::Closed);
        }
        self.inner
            .outbound_tx
            .send(cmd)
            .map_err(|_| ChatError::Closed)
    }

    /// Join `room_id` and get a handle that yields only that room's events.
    pub fn subscribe(&self, room_id: &RoomId) -> Result<RoomSubscription> {
        // Subscribe before joining so nothing sent right after the join is missed.
        let events = self.inner.events_tx.subscribe();
        self.join_room(room_id)?;

        *lock(&self.inner.rooms).entry(room_id.clone()).or_insert(0) += 1;

        Ok(RoomSubscription {
            room_id: room_id.clone(),
            events,
            cancel: self.inner.shutdown.child_token(),
            inner: self.inner.clone(),
        })
    }

    /// Rooms with at least one live subscription.
    pub fn joined_rooms(&self) -> Vec<RoomId> {
        let mut rooms: Vec<RoomId> = lock(&self.inner.rooms).keys().cloned().collect();
        rooms.sort();
        rooms
    }

    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Close the socket and end every subscription.
    pub fn shutdown(&self) {
        info!("Shutting down gateway connection");
        self.inner.shutdown.cancel();
    }

    /// Steal the outbound queue so tests can inspect what would be sent.
    #[cfg(test)]
    pub(crate) fn take_outbound(&self) -> Option<mpsc::UnboundedReceiver<ClientCommand>> {
        lock(&self.inner.outbound_rx).take()
    }

    /// Feed a raw frame as if the gateway had sent it.
    #[cfg(test)]
    pub(crate) fn inject(&self, text: &str) {
        self.inner.dispatch(text);
    }
}

impl ConnectionInner {
    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_replace(state);
    }

    fn release_room(&self, room_id: &RoomId) {
        let mut rooms = lock(&self.rooms);
        if let Some(count) = rooms.get_mut(room_id) {
            *count -= 1;
            if *count == 0 {
                rooms.remove(room_id);
                debug!("No subscriptions left for room {}", room_id);
            }
        }
    }

    fn dispatch(&self, text: &str) {
        match serde_json::from_str::<ServerEvent>(text) {
            Ok(event) => {
                trace!("Gateway event for room {}", event.room_id());
                // No receivers just means no surface is open right now.
                let _ = self.events_tx.send(event);
            }
            Err(e) => {
                let raw: String = text.chars().take(200).collect();
                warn!("Dropping malformed gateway frame: {} -- raw: {}", e, raw);
            }
        }
    }
}

async fn run_transport(
    inner: Arc<ConnectionInner>,
    mut outbound: mpsc::UnboundedReceiver<ClientCommand>,
) {
    // Only a session that actually existed has server-side room membership to restore.
    let mut had_session = false;
    // Command that was dequeued but not written when the socket failed
    let mut retry: Option<ClientCommand> = None;

    loop {
        inner.set_state(ConnectionState::Connecting);

        let attempt = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            result = connect_async(inner.gateway_url.as_str()) => result,
        };

        match attempt {
            Ok((ws, _)) => {
                info!("Connected to gateway {}", inner.gateway_url);
                inner.set_state(ConnectionState::Connected);

                let rejoin = if had_session {
                    lock(&inner.rooms).keys().cloned().collect()
                } else {
                    Vec::new()
                };
                had_session = true;

                let (sink, stream) = ws.split();
                match pump(sink, stream, &inner, &mut outbound, rejoin, &mut retry).await {
                    PumpExit::Shutdown => break,
                    PumpExit::Dropped => warn!("Gateway connection dropped"),
                }
            }
            Err(e) => warn!("Gateway connect to {} failed: {}", inner.gateway_url, e),
        }

        inner.set_state(ConnectionState::Disconnected);

        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            _ = tokio::time::sleep(inner.reconnect_delay) => {}
        }
    }

    inner.set_state(ConnectionState::Disconnected);
    info!("Gateway connection closed");
}

/// Shuttle frames between the socket and the command/event channels until
/// the socket drops or we are shut down. A command that could not be written
/// is left in `retry` and goes out first on the next socket, after the rejoins.
async fn pump<S, R>(
    mut sink: S,
    mut stream: R,
    inner: &ConnectionInner,
    outbound: &mut mpsc::UnboundedReceiver<ClientCommand>,
    rejoin: Vec<RoomId>,
    retry: &mut Option<ClientCommand>,
) -> PumpExit
where
    S: Sink<Message, Error = WsError> + Unpin,
    R: Stream<Item = std::result::Result<Message, WsError>> + Unpin,
{
    if !rejoin.is_empty() {
        info!("Rejoining {} rooms after reconnect", rejoin.len());
    }
    for room_id in rejoin {
        if let Err(e) = send_command(&mut sink, &ClientCommand::JoinChat(room_id)).await {
            warn!("Rejoin failed: {}", e);
            return PumpExit::Dropped;
        }
    }

    if let Some(cmd) = retry.take() {
        debug!("Resending {} after reconnect", cmd.name());
        if let Err(e) = send_command(&mut sink, &cmd).await {
            warn!("Failed to resend {}: {}", cmd.name(), e);
            *retry = Some(cmd);
            return PumpExit::Dropped;
        }
    }

    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                return PumpExit::Shutdown;
            }
            cmd = outbound.recv() => {
                let Some(cmd) = cmd else {
                    return PumpExit::Shutdown;
                };
                if let Err(e) = send_command(&mut sink, &cmd).await {
                    warn!("Failed to send {}: {}", cmd.name(), e);
                    *retry = Some(cmd);
                    return PumpExit::Dropped;
                }
            }
            frame = stream.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => inner.dispatch(text.as_str()),
                    Some(Ok(Message::Close(_))) | None => return PumpExit::Dropped,
                    // Pings are answered by tungstenite itself
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("Gateway read error: {}", e);
                        return PumpExit::Dropped;
                    }
                }
            }
        }
    }
}

async fn send_command<S>(sink: &mut S, cmd: &ClientCommand) -> Result<()>
where
    S: Sink<Message, Error = WsError> + Unpin,
{
    let text = serde_json::to_string(cmd)?;
    trace!("-> {}", cmd.name());
    sink.send(Message::Text(text.into())).await?;
    Ok(())
}

/// Handle on one room's live events.
///
/// Dropping it (or calling [`RoomSubscription::cancel`]) stops delivery and
/// removes the room from the set rejoined after a reconnect.
pub struct RoomSubscription {
    room_id: RoomId,
    events: broadcast::Receiver<ServerEvent>,
    cancel: CancellationToken,
    inner: Arc<ConnectionInner>,
}

impl RoomSubscription {
    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    /// Token that ends this subscription when cancelled. Also cancelled by
    /// `Connection::shutdown`.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(self) {
        drop(self);
    }

    /// Next event for this room, or `None` once cancelled or shut down.
    pub async fn recv(&mut self) -> Option<SubscriptionEvent> {
        loop {
            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return None,
                result = self.events.recv() => result,
            };

            match result {
                Ok(event) if event.room_id() == &self.room_id => {
                    return Some(SubscriptionEvent::Event(event));
                }
                Ok(_) => continue,
                Err(RecvError::Lagged(n)) => {
                    warn!("Subscription for room {} lagged by {} events", self.room_id, n);
                    return Some(SubscriptionEvent::Lagged(n));
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

impl Drop for RoomSubscription {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.inner.release_room(&self.room_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pawlink_types::events::WireMessage;

    fn message_frame(room: &str, body: &str) -> String {
        format!(
            r#"{{"event":"receive_message","data":{{"roomId":"{room}","senderId":"u1","message":"{body}","timestamp":"2024-05-01T10:00:00Z"}}}}"#
        )
    }

    #[tokio::test]
    async fn subscription_only_sees_its_room() {
        let conn = Connection::new("ws://unused", Duration::from_secs(1));
        let mut sub = conn.subscribe(&RoomId::from("42")).unwrap();

        conn.inner.dispatch(&message_frame("7", "elsewhere"));
        conn.inner.dispatch(&message_frame("42", "here"));

        match sub.recv().await {
            Some(SubscriptionEvent::Event(ServerEvent::ReceiveMessage(msg))) => {
                assert_eq!(msg.message, "here")
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn commands_queue_before_connect() {
        let conn = Connection::new("ws://unused", Duration::from_secs(1));
        let _sub = conn.subscribe(&RoomId::from("42")).unwrap();

        let mut rx = lock(&conn.inner.outbound_rx).take().unwrap();
        assert_eq!(
            rx.recv().await,
            Some(ClientCommand::JoinChat(RoomId::from("42")))
        );
    }

    #[tokio::test]
    async fn dropping_last_handle_forgets_room() {
        let conn = Connection::new("ws://unused", Duration::from_secs(1));
        let room = RoomId::from("42");

        let a = conn.subscribe(&room).unwrap();
        let b = conn.subscribe(&room).unwrap();
        assert_eq!(conn.joined_rooms(), vec![room.clone()]);

        a.cancel();
        assert_eq!(conn.joined_rooms(), vec![room.clone()]);
        drop(b);
        assert!(conn.joined_rooms().is_empty());
    }

    #[tokio::test]
    async fn cancelled_subscription_ends() {
        let conn = Connection::new("ws://unused", Duration::from_secs(1));
        let mut sub = conn.subscribe(&RoomId::from("42")).unwrap();

        sub.cancel_token().cancel();
        conn.inner.dispatch(&message_frame("42", "late"));
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn shutdown_rejects_sends_and_ends_subscriptions() {
        let conn = Connection::new("ws://unused", Duration::from_secs(1));
        let mut sub = conn.subscribe(&RoomId::from("42")).unwrap();

        conn.shutdown();
        assert!(matches!(
            conn.join_room(&RoomId::from("1")),
            Err(ChatError::Closed)
        ));
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn lagging_subscription_reports_skipped_events() {
        let conn = Connection::new("ws://unused", Duration::from_secs(1));
        let mut sub = conn.subscribe(&RoomId::from("42")).unwrap();

        for i in 0..EVENT_BUFFER + 10 {
            conn.inner.dispatch(&message_frame("42", &format!("m{i}")));
        }

        assert_eq!(sub.recv().await, Some(SubscriptionEvent::Lagged(10)));
        match sub.recv().await {
            Some(SubscriptionEvent::Event(ServerEvent::ReceiveMessage(msg))) => {
                assert_eq!(msg.message, "m10")
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    type Frames = Arc<Mutex<Vec<ClientCommand>>>;

    fn failing_sink() -> impl Sink<Message, Error = WsError> + Unpin {
        Box::pin(futures_util::sink::unfold((), |(), _msg: Message| async {
            Err::<(), WsError>(WsError::ConnectionClosed)
        }))
    }

    fn recording_sink(frames: Frames) -> impl Sink<Message, Error = WsError> + Unpin {
        Box::pin(futures_util::sink::unfold(frames, |frames, msg: Message| async move {
            if let Message::Text(text) = &msg {
                lock(&frames).push(serde_json::from_str(text.as_str()).unwrap());
            }
            Ok::<_, WsError>(frames)
        }))
    }

    #[tokio::test]
    async fn unwritten_command_is_resent_after_rejoin() {
        let conn = Connection::new("ws://unused", Duration::from_secs(1));
        let mut outbound = lock(&conn.inner.outbound_rx).take().unwrap();
        let send = ClientCommand::SendMessage(WireMessage {
            room_id: RoomId::from("42"),
            sender_id: "u1".into(),
            message: "still there?".into(),
            timestamp: chrono::Utc::now(),
            sender_name: None,
            id: None,
        });
        conn.send(send.clone()).unwrap();

        // The socket dies while the message is being written
        let mut retry = None;
        let exit = pump(
            failing_sink(),
            futures_util::stream::pending::<std::result::Result<Message, WsError>>(),
            &conn.inner,
            &mut outbound,
            Vec::new(),
            &mut retry,
        )
        .await;
        assert_eq!(exit, PumpExit::Dropped);
        assert_eq!(retry, Some(send.clone()));

        let frames = Frames::default();
        let exit = pump(
            recording_sink(frames.clone()),
            futures_util::stream::empty::<std::result::Result<Message, WsError>>(),
            &conn.inner,
            &mut outbound,
            vec![RoomId::from("42")],
            &mut retry,
        )
        .await;
        assert_eq!(exit, PumpExit::Dropped);
        assert!(retry.is_none());
        assert_eq!(
            *lock(&frames),
            vec![ClientCommand::JoinChat(RoomId::from("42")), send]
        );
    }

    #[test]
    fn malformed_frames_are_dropped() {
        let conn = Connection::new("ws://unused", Duration::from_secs(1));
        let mut rx = conn.inner.events_tx.subscribe();
        conn.inner.dispatch("not json");
        conn.inner.dispatch(r#"{"event":"unknown","data":{}}"#);
        assert!(rx.try_recv().is_err());
    }
}
