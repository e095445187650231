//! WebSocket Relay Server
//!
//! Serves the JSON wire protocol to mobile clients that cannot reach the
//! Room Store directly. The relay holds no game state: every client message
//! becomes a store operation, and every store snapshot of the joined room is
//! forwarded back as `RoomInfo` / `PlayerJoined` / `PlayerLeft`.
//!
//! ```text
//! client ──ws──> relay ──write/append──> Room Store ──snapshots──> host
//! client <──ws── relay <──snapshots───── Room Store <──writes───── host
//! ```

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, instrument, warn};

use crate::core::env;
use crate::core::room_code::RoomCode;
use crate::core::time::now_millis;
use crate::game::state::{diff_roster, PlayerId};
use crate::network::protocol::{
    ClientMessage, ErrorCode, JoinRoom, RoomInfo, SelectAvatar, ServerMessage, TapInput,
};
use crate::network::session::{admit_player, RoomConfig, SessionError};
use crate::store::{FieldPath, RoomSnapshot, RoomStore, RoomSubscription, StoreError};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Connections silent for this long are dropped.
    pub idle_timeout: Duration,
    /// How often idle connections are reaped.
    pub cleanup_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            max_connections: 256,
            idle_timeout: Duration::from_secs(300),
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

impl ServerConfig {
    /// Load from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bind_addr: env::parse_or("TAP_RACE_BIND_ADDR", defaults.bind_addr),
            max_connections: env::parse_or("TAP_RACE_MAX_CONNECTIONS", defaults.max_connections),
            idle_timeout: env::secs_or("TAP_RACE_IDLE_TIMEOUT_SECS", defaults.idle_timeout),
            cleanup_interval: defaults.cleanup_interval,
        }
    }
}

/// Relay server errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Failed to bind to address.
    #[error("Failed to bind: {0}")]
    BindFailed(#[from] std::io::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Connected client state.
struct ConnectedClient {
    /// Joined room and player, once joined.
    joined: Option<(RoomCode, PlayerId)>,
    /// Forwards room snapshots to this client.
    watcher: Option<JoinHandle<()>>,
    /// Connection time.
    connected_at: Instant,
    /// Last activity.
    last_activity: Instant,
    /// Dropping this closes the connection.
    _close: oneshot::Sender<()>,
}

impl ConnectedClient {
    fn new(close: oneshot::Sender<()>) -> Self {
        Self {
            joined: None,
            watcher: None,
            connected_at: Instant::now(),
            last_activity: Instant::now(),
            _close: close,
        }
    }
}

impl Drop for ConnectedClient {
    fn drop(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
    }
}

type ClientMap = Arc<RwLock<BTreeMap<SocketAddr, ConnectedClient>>>;

/// Everything a connection task needs.
#[derive(Clone)]
struct RelayContext {
    store: Arc<dyn RoomStore>,
    clients: ClientMap,
    max_players: usize,
}

impl RelayContext {
    async fn joined(&self, addr: SocketAddr) -> Option<(RoomCode, PlayerId)> {
        self.clients.read().await.get(&addr).and_then(|c| c.joined.clone())
    }

    /// The joined player's room, if `player_id` is this connection's player.
    async fn own_room(&self, addr: SocketAddr, player_id: &PlayerId) -> Option<RoomCode> {
        match self.joined(addr).await {
            Some((code, joined)) if joined == *player_id => Some(code),
            _ => None,
        }
    }

    async fn remove_player(&self, code: &RoomCode, player_id: &PlayerId) {
        match self.store.remove_field(code, &FieldPath::player(player_id)).await {
            Ok(()) => info!(room = %code, player = %player_id, "player left"),
            Err(StoreError::RoomNotFound(_)) => {}
            Err(e) => warn!(room = %code, player = %player_id, error = %e, "failed to remove player"),
        }
    }
}

/// The relay server.
pub struct RelayServer {
    /// Server configuration.
    config: ServerConfig,
    /// Shared state for connection tasks.
    ctx: RelayContext,
    /// Shutdown signal.
    shutdown_tx: broadcast::Sender<()>,
}

impl RelayServer {
    /// Create a relay in front of `store`.
    pub fn new(config: ServerConfig, room: RoomConfig, store: Arc<dyn RoomStore>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            ctx: RelayContext {
                store,
                clients: Arc::new(RwLock::new(BTreeMap::new())),
                max_players: room.max_players,
            },
            shutdown_tx,
        }
    }

    /// Bind the configured address and serve until shutdown.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already-bound listener until shutdown.
    #[instrument(skip(self, listener))]
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        info!("Relay listening on {}", listener.local_addr()?);

        let cleanup_ctx = self.ctx.clone();
        let idle_timeout = self.config.idle_timeout;
        let cleanup_interval = self.config.cleanup_interval;
        let cleanup_handle = tokio::spawn(async move {
            Self::run_cleanup_loop(cleanup_ctx, idle_timeout, cleanup_interval).await;
        });

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let clients_count = self.ctx.clients.read().await.len();
                            if clients_count >= self.config.max_connections {
                                warn!("Connection limit reached, rejecting {}", addr);
                                continue;
                            }

                            info!("New connection from {}", addr);
                            self.handle_connection(stream, addr);
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        cleanup_handle.abort();
        Ok(())
    }

    /// Handle a new WebSocket connection.
    fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let ctx = self.ctx.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let ws_stream = match accept_async(stream).await {
                Ok(ws) => ws,
                Err(e) => {
                    error!("WebSocket handshake failed for {}: {}", addr, e);
                    return;
                }
            };

            let (mut ws_sender, mut ws_receiver) = ws_stream.split();
            let (msg_tx, mut msg_rx) = mpsc::channel::<ServerMessage>(64);
            let (close_tx, mut close_rx) = oneshot::channel::<()>();

            ctx.clients.write().await.insert(addr, ConnectedClient::new(close_tx));

            // Spawn message sender task
            let sender_task = tokio::spawn(async move {
                while let Some(msg) = msg_rx.recv().await {
                    let text = match msg.to_json() {
                        Ok(t) => t,
                        Err(e) => {
                            error!("Failed to serialize message: {}", e);
                            continue;
                        }
                    };
                    if ws_sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                let _ = ws_sender.close().await;
            });

            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                Self::touch(&ctx, addr).await;
                                match ClientMessage::from_json(&text) {
                                    Ok(client_msg) => {
                                        Self::handle_client_message(&ctx, addr, client_msg, &msg_tx).await;
                                    }
                                    Err(e) => {
                                        debug!("Invalid message from {}: {}", addr, e);
                                        let _ = msg_tx.send(ServerMessage::error(ErrorCode::InvalidMessage)).await;
                                    }
                                }
                            }
                            Some(Ok(Message::Binary(data))) => {
                                Self::touch(&ctx, addr).await;
                                match TapInput::from_bytes(&data) {
                                    Ok(tap) => {
                                        Self::handle_client_message(&ctx, addr, ClientMessage::TapInput(tap), &msg_tx).await;
                                    }
                                    Err(e) => debug!("Invalid binary frame from {}: {}", addr, e),
                                }
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                debug!("Client {} disconnected", addr);
                                break;
                            }
                            Some(Err(e)) => {
                                error!("WebSocket error for {}: {}", addr, e);
                                break;
                            }
                            _ => {}
                        }
                    }
                    _ = &mut close_rx => {
                        debug!("Closing connection {}", addr);
                        break;
                    }
                    _ = shutdown_rx.recv() => {
                        let _ = msg_tx.send(ServerMessage::Shutdown {
                            reason: "Server shutting down".to_string(),
                        }).await;
                        break;
                    }
                }
            }

            // Flush queued replies, then close.
            drop(msg_tx);
            Self::disconnect(&ctx, addr).await;
            if tokio::time::timeout(Duration::from_secs(1), sender_task).await.is_err() {
                debug!("Sender for {} did not drain in time", addr);
            }

            info!("Client {} cleaned up", addr);
        });
    }

    async fn touch(ctx: &RelayContext, addr: SocketAddr) {
        if let Some(client) = ctx.clients.write().await.get_mut(&addr) {
            client.last_activity = Instant::now();
        }
    }

    /// Forget a connection, removing its player from the room.
    async fn disconnect(ctx: &RelayContext, addr: SocketAddr) {
        let Some(mut client) = ctx.clients.write().await.remove(&addr) else {
            return;
        };
        info!("Client {} disconnected after {:?}", addr, client.connected_at.elapsed());
        if let Some((code, player_id)) = client.joined.take() {
            ctx.remove_player(&code, &player_id).await;
        }
    }

    /// Handle a client message.
    async fn handle_client_message(
        ctx: &RelayContext,
        addr: SocketAddr,
        msg: ClientMessage,
        sender: &mpsc::Sender<ServerMessage>,
    ) {
        match msg {
            ClientMessage::JoinRoom(join) => {
                Self::handle_join(ctx, addr, join, sender).await;
            }
            ClientMessage::SelectAvatar(select) => {
                Self::handle_select_avatar(ctx, addr, select, sender).await;
            }
            ClientMessage::TapInput(tap) => {
                Self::handle_tap(ctx, addr, tap, sender).await;
            }
            ClientMessage::LeaveRoom { player_id } => {
                Self::handle_leave(ctx, addr, player_id, sender).await;
            }
            ClientMessage::Ping { timestamp } => {
                let _ = sender
                    .send(ServerMessage::Pong {
                        timestamp,
                        server_time: now_millis(),
                    })
                    .await;
            }
        }
    }

    async fn handle_join(
        ctx: &RelayContext,
        addr: SocketAddr,
        join: JoinRoom,
        sender: &mpsc::Sender<ServerMessage>,
    ) {
        if ctx.joined(addr).await.is_some() {
            let _ = sender.send(ServerMessage::error(ErrorCode::AlreadyJoined)).await;
            return;
        }

        let code = match RoomCode::parse(&join.room_code) {
            Ok(code) => code,
            Err(e) => {
                debug!("Rejected room code from {}: {}", addr, e);
                let _ = sender.send(ServerMessage::error(ErrorCode::InvalidRoomCode)).await;
                return;
            }
        };

        let player = match admit_player(ctx.store.as_ref(), &code, &join.player_name, ctx.max_players).await {
            Ok(player) => player,
            Err(e) => {
                let reply = match e {
                    SessionError::RoomNotFound(_) => ErrorCode::RoomNotFound,
                    SessionError::RoomFull { .. } => ErrorCode::RoomFull,
                    other => {
                        warn!("Join failed for {}: {}", addr, other);
                        ErrorCode::InternalError
                    }
                };
                let _ = sender.send(ServerMessage::error(reply)).await;
                return;
            }
        };

        let subscription = match ctx.store.subscribe(&code).await {
            Ok(subscription) => subscription,
            Err(e) => {
                warn!("Subscribe failed for {}: {}", addr, e);
                ctx.remove_player(&code, &player.id).await;
                let _ = sender.send(ServerMessage::error(ErrorCode::InternalError)).await;
                return;
            }
        };

        let _ = sender
            .send(ServerMessage::Success {
                message: format!("Joined room {}", code),
                player_id: Some(player.id.clone()),
            })
            .await;
        let watcher = tokio::spawn(Self::forward_room_updates(subscription, sender.clone()));

        let mut clients = ctx.clients.write().await;
        if let Some(client) = clients.get_mut(&addr) {
            client.joined = Some((code, player.id));
            client.watcher = Some(watcher);
        } else {
            // Connection was reaped while joining.
            drop(clients);
            watcher.abort();
            ctx.remove_player(&code, &player.id).await;
        }
    }

    async fn handle_select_avatar(
        ctx: &RelayContext,
        addr: SocketAddr,
        select: SelectAvatar,
        sender: &mpsc::Sender<ServerMessage>,
    ) {
        let Some(code) = ctx.own_room(addr, &select.player_id).await else {
            let _ = sender.send(ServerMessage::error(ErrorCode::NotJoined)).await;
            return;
        };
        let path = FieldPath::player_field(&select.player_id, "avatarId");
        if let Err(e) = ctx.store.write_field(&code, &path, json!(select.avatar_id)).await {
            warn!(room = %code, player = %select.player_id, error = %e, "avatar write failed");
        }
    }

    async fn handle_tap(
        ctx: &RelayContext,
        addr: SocketAddr,
        tap: TapInput,
        sender: &mpsc::Sender<ServerMessage>,
    ) {
        let Some(code) = ctx.own_room(addr, &tap.player_id).await else {
            let _ = sender.send(ServerMessage::error(ErrorCode::NotJoined)).await;
            return;
        };
        let path = FieldPath::pending_taps(&tap.player_id);
        if let Err(e) = ctx.store.append_to_list(&code, &path, json!(tap.timestamp)).await {
            debug!(room = %code, player = %tap.player_id, error = %e, "tap dropped");
        }
    }

    async fn handle_leave(
        ctx: &RelayContext,
        addr: SocketAddr,
        player_id: PlayerId,
        sender: &mpsc::Sender<ServerMessage>,
    ) {
        let Some(code) = ctx.own_room(addr, &player_id).await else {
            let _ = sender.send(ServerMessage::error(ErrorCode::NotJoined)).await;
            return;
        };
        if let Some(client) = ctx.clients.write().await.get_mut(&addr) {
            client.joined = None;
            if let Some(watcher) = client.watcher.take() {
                watcher.abort();
            }
        }
        ctx.remove_player(&code, &player_id).await;
    }

    /// Translate room snapshots into client notifications.
    async fn forward_room_updates(mut subscription: RoomSubscription, sender: mpsc::Sender<ServerMessage>) {
        let mut known: Option<Vec<PlayerId>> = None;
        while let Some(snapshot) = subscription.next().await {
            let room = match snapshot {
                RoomSnapshot::Present(room) => room,
                RoomSnapshot::Deleted => {
                    let _ = sender
                        .send(ServerMessage::Shutdown {
                            reason: "Room closed".to_string(),
                        })
                        .await;
                    break;
                }
            };

            let mut outgoing = Vec::new();
            if let Some(previous) = &known {
                let diff = diff_roster(previous.iter(), &room.players);
                outgoing.extend(diff.joined.into_iter().map(|player| ServerMessage::PlayerJoined { player }));
                outgoing.extend(diff.left.into_iter().map(|player_id| ServerMessage::PlayerLeft { player_id }));
            }
            known = Some(room.players.keys().cloned().collect());
            outgoing.push(ServerMessage::RoomInfo(RoomInfo::from_room(&room)));

            for message in outgoing {
                if sender.send(message).await.is_err() {
                    return;
                }
            }
        }
    }

    /// Reap idle connections.
    async fn run_cleanup_loop(ctx: RelayContext, idle_timeout: Duration, every: Duration) {
        let mut interval = interval(every);

        loop {
            interval.tick().await;

            let now = Instant::now();
            let to_remove: Vec<_> = {
                let clients = ctx.clients.read().await;
                clients
                    .iter()
                    .filter(|(_, c)| now.duration_since(c.last_activity) > idle_timeout)
                    .map(|(addr, _)| *addr)
                    .collect()
            };

            for addr in to_remove {
                Self::disconnect(&ctx, addr).await;
                info!("Removed idle client {}", addr);
            }
        }
    }

    /// Shutdown the server.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Get connection count.
    pub async fn connection_count(&self) -> usize {
        self.ctx.clients.read().await.len()
    }
}
