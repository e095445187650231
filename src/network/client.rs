//! Client Session
//!
//! One remote participant (a phone). The session joins a room, picks an
//! avatar and fires taps; it never decides anything about the race, it only
//! renders the room snapshots the host projects into the store.
//!
//! ```text
//! ClientSession ──> ClientTransport ──┬── StoreTransport  (direct store access)
//!       ^                             └── RelayTransport  (WebSocket relay)
//!       └──────── TransportEvent::Room(RoomInfo) ─────────┘
//! ```
//!
//! Taps are queued to a background worker so [`ClientSession::send_tap`]
//! never waits on the network. The tap counter it returns is local and
//! optimistic.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::core::env;
use crate::core::room_code::{RoomCode, RoomCodeError};
use crate::core::time::now_millis;
use crate::game::state::PlayerId;
use crate::network::protocol::{ClientMessage, ErrorCode, JoinRoom, RoomInfo, SelectAvatar, ServerMessage, TapInput};
use crate::network::session::{admit_player, SessionError};
use crate::store::{FieldPath, RoomSnapshot, RoomStore, StoreError};
use crate::MAX_PLAYERS_PER_ROOM;

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// How long to wait for the join acknowledgement.
    pub join_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            join_timeout: Duration::from_secs(10),
        }
    }
}

impl ClientConfig {
    /// Load from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            join_timeout: env::millis_or("TAP_RACE_JOIN_TIMEOUT_MS", defaults.join_timeout),
        }
    }
}

/// Client errors.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Room code is malformed.
    #[error("invalid room code: {0}")]
    InvalidRoomCode(#[from] RoomCodeError),

    /// No active room with that code.
    #[error("room not found")]
    RoomNotFound,

    /// Room is at capacity.
    #[error("room is full")]
    RoomFull,

    /// The relay refused the request.
    #[error("rejected: {}", .0.message())]
    Rejected(ErrorCode),

    /// No join acknowledgement in time.
    #[error("timed out waiting for join acknowledgement")]
    JoinTimeout,

    /// The transport is gone.
    #[error("disconnected")]
    Disconnected,

    /// Operation needs a joined player.
    #[error("not joined")]
    NotJoined,

    /// Room Store failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// WebSocket failure.
    #[error("transport error: {0}")]
    Transport(String),
}

impl From<SessionError> for ClientError {
    fn from(error: SessionError) -> Self {
        match error {
            SessionError::RoomNotFound(_) => ClientError::RoomNotFound,
            SessionError::RoomFull { .. } => ClientError::RoomFull,
            SessionError::Store(e) => ClientError::Store(e),
            other => ClientError::Transport(other.to_string()),
        }
    }
}

impl From<ErrorCode> for ClientError {
    fn from(code: ErrorCode) -> Self {
        match code {
            ErrorCode::RoomNotFound => ClientError::RoomNotFound,
            ErrorCode::RoomFull => ClientError::RoomFull,
            other => ClientError::Rejected(other),
        }
    }
}

/// Connection state, as shown by the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Joined and receiving room updates.
    Connected,
    /// Transport dropped or player left. Taps are dropped.
    Disconnected,
}

/// Something the transport observed.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// New room view.
    Room(RoomInfo),
    /// Room or connection went away.
    Closed,
}

/// Result of a successful join.
pub struct JoinAck {
    /// Assigned identity.
    pub player_id: PlayerId,
    /// Room updates, including any that arrived before the acknowledgement.
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

/// How a client reaches the room.
#[async_trait]
pub trait ClientTransport: Send + Sync + 'static {
    /// Join `room_code` as `player_name`.
    async fn join(&self, room_code: &str, player_name: &str) -> Result<JoinAck, ClientError>;

    /// Set the avatar. Repeating overwrites.
    async fn select_avatar(&self, player_id: &PlayerId, avatar_id: &str) -> Result<(), ClientError>;

    /// Submit one tap.
    async fn send_tap(&self, tap: TapInput) -> Result<(), ClientError>;

    /// Leave the room.
    async fn leave(&self, player_id: &PlayerId) -> Result<(), ClientError>;
}

// =============================================================================
// STORE TRANSPORT
// =============================================================================

/// Talks to the Room Store directly.
pub struct StoreTransport {
    store: Arc<dyn RoomStore>,
    max_players: usize,
    joined: Mutex<Option<(RoomCode, JoinHandle<()>)>>,
}

impl StoreTransport {
    /// Transport over `store`.
    pub fn new(store: Arc<dyn RoomStore>) -> Self {
        Self {
            store,
            max_players: MAX_PLAYERS_PER_ROOM,
            joined: Mutex::new(None),
        }
    }

    /// Override the room capacity enforced on join.
    pub fn with_max_players(mut self, max_players: usize) -> Self {
        self.max_players = max_players;
        self
    }

    fn room(&self) -> Result<RoomCode, ClientError> {
        self.joined
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|(code, _)| code.clone())
            .ok_or(ClientError::NotJoined)
    }
}

#[async_trait]
impl ClientTransport for StoreTransport {
    async fn join(&self, room_code: &str, player_name: &str) -> Result<JoinAck, ClientError> {
        let code = RoomCode::parse(room_code)?;
        let player = admit_player(self.store.as_ref(), &code, player_name, self.max_players).await?;
        let mut subscription = match self.store.subscribe(&code).await {
            Ok(subscription) => subscription,
            Err(e) => {
                let _ = self.store.remove_field(&code, &FieldPath::player(&player.id)).await;
                return Err(e.into());
            }
        };

        let (events_tx, events) = mpsc::unbounded_channel();
        let forwarder = tokio::spawn(async move {
            while let Some(snapshot) = subscription.next().await {
                let event = match snapshot {
                    RoomSnapshot::Present(room) => TransportEvent::Room(RoomInfo::from_room(&room)),
                    RoomSnapshot::Deleted => TransportEvent::Closed,
                };
                let closed = event == TransportEvent::Closed;
                if events_tx.send(event).is_err() || closed {
                    return;
                }
            }
            let _ = events_tx.send(TransportEvent::Closed);
        });

        let previous = self
            .joined
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace((code, forwarder));
        if let Some((_, handle)) = previous {
            handle.abort();
        }
        Ok(JoinAck {
            player_id: player.id,
            events,
        })
    }

    async fn select_avatar(&self, player_id: &PlayerId, avatar_id: &str) -> Result<(), ClientError> {
        let code = self.room()?;
        self.store
            .write_field(&code, &FieldPath::player_field(player_id, "avatarId"), json!(avatar_id))
            .await?;
        Ok(())
    }

    async fn send_tap(&self, tap: TapInput) -> Result<(), ClientError> {
        let code = self.room()?;
        self.store
            .append_to_list(&code, &FieldPath::pending_taps(&tap.player_id), json!(tap.timestamp))
            .await?;
        Ok(())
    }

    async fn leave(&self, player_id: &PlayerId) -> Result<(), ClientError> {
        let joined = self.joined.lock().unwrap_or_else(PoisonError::into_inner).take();
        let Some((code, forwarder)) = joined else {
            return Err(ClientError::NotJoined);
        };
        forwarder.abort();
        match self.store.remove_field(&code, &FieldPath::player(player_id)).await {
            Ok(()) | Err(StoreError::RoomNotFound(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for StoreTransport {
    fn drop(&mut self) {
        if let Some((_, forwarder)) = self.joined.lock().unwrap_or_else(PoisonError::into_inner).take() {
            forwarder.abort();
        }
    }
}

// =============================================================================
// RELAY TRANSPORT
// =============================================================================

/// Talks to a [`RelayServer`](crate::network::server::RelayServer) over WebSocket.
pub struct RelayTransport {
    outgoing: mpsc::Sender<Message>,
    acks: tokio::sync::Mutex<mpsc::UnboundedReceiver<Result<PlayerId, ErrorCode>>>,
    events: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl RelayTransport {
    /// Open a WebSocket to `url`.
    pub async fn connect(url: &str) -> Result<Self, ClientError> {
        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        info!("Connected to relay {}", url);

        let (mut write, mut read) = ws_stream.split();
        let (outgoing, mut outgoing_rx) = mpsc::channel::<Message>(100);
        let (ack_tx, acks) = mpsc::unbounded_channel();
        let (events_tx, events) = mpsc::unbounded_channel();

        let writer = tokio::spawn(async move {
            while let Some(message) = outgoing_rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if let Err(e) = write.send(message).await {
                    debug!("Relay write failed: {}", e);
                    break;
                }
                if closing {
                    break;
                }
            }
        });

        let reader = tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                let text = match frame {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        debug!("Relay read failed: {}", e);
                        break;
                    }
                };
                match ServerMessage::from_json(&text) {
                    Ok(ServerMessage::Success {
                        player_id: Some(player_id),
                        ..
                    }) => {
                        let _ = ack_tx.send(Ok(player_id));
                    }
                    Ok(ServerMessage::Error { code, message }) => {
                        debug!("Relay error {:?}: {}", code, message);
                        let _ = ack_tx.send(Err(code));
                    }
                    Ok(ServerMessage::RoomInfo(info)) => {
                        let _ = events_tx.send(TransportEvent::Room(info));
                    }
                    Ok(ServerMessage::Shutdown { reason }) => {
                        info!("Relay closed the room: {}", reason);
                        break;
                    }
                    // Roster changes also arrive as a full RoomInfo.
                    Ok(_) => {}
                    Err(e) => warn!("Failed to parse relay message: {} - {}", e, text),
                }
            }
            let _ = events_tx.send(TransportEvent::Closed);
        });

        Ok(Self {
            outgoing,
            acks: tokio::sync::Mutex::new(acks),
            events: Mutex::new(Some(events)),
            reader,
            writer,
        })
    }

    async fn send(&self, message: Message) -> Result<(), ClientError> {
        self.outgoing.send(message).await.map_err(|_| ClientError::Disconnected)
    }

    async fn send_json(&self, message: &ClientMessage) -> Result<(), ClientError> {
        let text = message.to_json().map_err(|e| ClientError::Transport(e.to_string()))?;
        self.send(Message::Text(text)).await
    }
}

#[async_trait]
impl ClientTransport for RelayTransport {
    async fn join(&self, room_code: &str, player_name: &str) -> Result<JoinAck, ClientError> {
        let mut acks = self.acks.lock().await;
        // Errors for earlier requests are not about this join.
        while acks.try_recv().is_ok() {}

        self.send_json(&ClientMessage::JoinRoom(JoinRoom {
            room_code: room_code.to_string(),
            player_name: player_name.to_string(),
        }))
        .await?;

        let player_id = match acks.recv().await {
            Some(Ok(player_id)) => player_id,
            Some(Err(code)) => return Err(code.into()),
            None => return Err(ClientError::Disconnected),
        };

        let events = self
            .events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(ClientError::Rejected(ErrorCode::AlreadyJoined))?;
        Ok(JoinAck { player_id, events })
    }

    async fn select_avatar(&self, player_id: &PlayerId, avatar_id: &str) -> Result<(), ClientError> {
        self.send_json(&ClientMessage::SelectAvatar(SelectAvatar {
            player_id: player_id.clone(),
            avatar_id: avatar_id.to_string(),
        }))
        .await
    }

    async fn send_tap(&self, tap: TapInput) -> Result<(), ClientError> {
        let bytes = tap.to_bytes().map_err(|e| ClientError::Transport(e.to_string()))?;
        self.send(Message::Binary(bytes)).await
    }

    async fn leave(&self, player_id: &PlayerId) -> Result<(), ClientError> {
        self.send_json(&ClientMessage::LeaveRoom {
            player_id: player_id.clone(),
        })
        .await?;
        self.send(Message::Close(None)).await
    }
}

impl Drop for RelayTransport {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

// =============================================================================
// CLIENT SESSION
// =============================================================================

/// One remote participant.
pub struct ClientSession<T: ClientTransport> {
    transport: Arc<T>,
    player_id: PlayerId,
    tap_count: AtomicU32,
    taps: mpsc::UnboundedSender<TapInput>,
    state: watch::Sender<ConnectionState>,
    view: watch::Sender<Option<RoomInfo>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<T: ClientTransport> ClientSession<T> {
    /// Join `room_code` as `player_name` over `transport`.
    ///
    /// Room updates that arrive before the acknowledgement are kept and
    /// applied in order once the session exists.
    pub async fn connect(
        transport: T,
        config: ClientConfig,
        room_code: &str,
        player_name: &str,
    ) -> Result<Self, ClientError> {
        let transport = Arc::new(transport);
        let ack = tokio::time::timeout(config.join_timeout, transport.join(room_code, player_name))
            .await
            .map_err(|_| ClientError::JoinTimeout)??;
        info!(player = %ack.player_id, room = room_code, "joined room");

        let (state, _) = watch::channel(ConnectionState::Connected);
        let (view, _) = watch::channel(None);

        let pump = {
            let view = view.clone();
            let state = state.clone();
            let mut events = ack.events;
            tokio::spawn(async move {
                while let Some(event) = events.recv().await {
                    match event {
                        TransportEvent::Room(info) => {
                            view.send_replace(Some(info));
                        }
                        TransportEvent::Closed => break,
                    }
                }
                state.send_replace(ConnectionState::Disconnected);
            })
        };

        let (taps, mut tap_rx) = mpsc::unbounded_channel::<TapInput>();
        let worker = {
            let transport = Arc::clone(&transport);
            let state = state.clone();
            tokio::spawn(async move {
                while let Some(tap) = tap_rx.recv().await {
                    if let Err(e) = transport.send_tap(tap).await {
                        debug!("tap lost: {}", e);
                        if matches!(e, ClientError::Disconnected) {
                            state.send_replace(ConnectionState::Disconnected);
                        }
                    }
                }
            })
        };

        Ok(Self {
            transport,
            player_id: ack.player_id,
            tap_count: AtomicU32::new(0),
            taps,
            state,
            view,
            tasks: Mutex::new(vec![pump, worker]),
        })
    }

    /// Identity assigned on join.
    pub fn player_id(&self) -> &PlayerId {
        &self.player_id
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch connection state changes.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Latest room view.
    pub fn view(&self) -> Option<RoomInfo> {
        self.view.borrow().clone()
    }

    /// Watch room view changes.
    pub fn watch_view(&self) -> watch::Receiver<Option<RoomInfo>> {
        self.view.subscribe()
    }

    /// Own progress according to the latest room view.
    pub fn progress(&self) -> f32 {
        self.view
            .borrow()
            .as_ref()
            .and_then(|info| info.players.iter().find(|p| p.id == self.player_id))
            .map_or(0.0, |p| p.progress)
    }

    /// Taps sent so far (local, optimistic).
    pub fn tap_count(&self) -> u32 {
        self.tap_count.load(Ordering::Relaxed)
    }

    /// Choose an avatar. Re-selecting overwrites.
    pub async fn select_avatar(&self, avatar_id: &str) -> Result<(), ClientError> {
        if self.state() != ConnectionState::Connected {
            return Err(ClientError::Disconnected);
        }
        self.transport.select_avatar(&self.player_id, avatar_id).await
    }

    /// Fire one tap without waiting for it to be delivered.
    ///
    /// Returns the local tap counter. While disconnected the tap is dropped
    /// and the counter does not move.
    pub fn send_tap(&self) -> u32 {
        if self.state() != ConnectionState::Connected {
            return self.tap_count();
        }
        let tap = TapInput {
            player_id: self.player_id.clone(),
            timestamp: now_millis(),
        };
        if self.taps.send(tap).is_err() {
            return self.tap_count();
        }
        self.tap_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Leave the room. Best effort: the session is disconnected either way.
    pub async fn disconnect(&self) {
        if self.state() == ConnectionState::Connected {
            if let Err(e) = self.transport.leave(&self.player_id).await {
                warn!(player = %self.player_id, error = %e, "leave failed");
            }
        }
        for task in self.tasks.lock().unwrap_or_else(PoisonError::into_inner).drain(..) {
            task.abort();
        }
        self.state.send_replace(ConnectionState::Disconnected);
    }
}

impl<T: ClientTransport> Drop for ClientSession<T> {
    fn drop(&mut self) {
        for task in self.tasks.lock().unwrap_or_else(PoisonError::into_inner).drain(..) {
            task.abort();
        }
    }
}
