//! Host Sessions
//!
//! A [`HostSession`] is one room as seen by the host device: the room
//! document, its [`RaceEngine`] and the [`RoomSynchronizer`] between them.
//! The [`RoomManager`] owns any number of them, keyed by room code.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{info, warn};

use crate::core::env;
use crate::core::rng::DeterministicRng;
use crate::core::room_code::RoomCode;
use crate::core::time::now_millis;
use crate::game::engine::{RaceConfig, RaceEngine, RaceStats, StartOutcome, TapOutcome};
use crate::game::events::RaceEvent;
use crate::game::state::{Player, PlayerId};
use crate::store::{to_value, FieldPath, RoomStore, StoreError};
use crate::sync::synchronizer::{create_room, RoomSynchronizer, SyncError};
use crate::MAX_PLAYERS_PER_ROOM;

/// Room limits.
#[derive(Debug, Clone)]
pub struct RoomConfig {
    /// Maximum players per room.
    pub max_players: usize,
    /// Room code candidates tried before giving up.
    pub max_code_attempts: u32,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            max_players: MAX_PLAYERS_PER_ROOM,
            max_code_attempts: 16,
        }
    }
}

impl RoomConfig {
    /// Load from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_players: env::parse_or("TAP_RACE_MAX_PLAYERS", defaults.max_players),
            max_code_attempts: env::parse_or("TAP_RACE_CODE_ATTEMPTS", defaults.max_code_attempts),
        }
    }
}

/// Session errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SessionError {
    /// No such room.
    #[error("room {0} not found")]
    RoomNotFound(RoomCode),

    /// Room is at capacity.
    #[error("room is full ({max_players} players)")]
    RoomFull {
        /// Capacity.
        max_players: usize,
    },

    /// Room creation failed.
    #[error(transparent)]
    Sync(#[from] SyncError),

    /// Store failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Add a new player record to a room, enforcing capacity.
///
/// Shared by the host (local player), the relay and direct store clients.
pub async fn admit_player(
    store: &dyn RoomStore,
    code: &RoomCode,
    name: &str,
    max_players: usize,
) -> Result<Player, SessionError> {
    let room = store
        .read_room(code)
        .await?
        .ok_or_else(|| SessionError::RoomNotFound(code.clone()))?;
    if room.is_full(max_players) {
        return Err(SessionError::RoomFull { max_players });
    }
    let player = Player::new(PlayerId::generate(), name, now_millis());
    store
        .write_field(code, &FieldPath::player(&player.id), to_value(&player)?)
        .await
        .map_err(|e| match e {
            StoreError::RoomNotFound(code) => SessionError::RoomNotFound(code),
            other => SessionError::Store(other),
        })?;
    info!(room = %code, player = %player.id, name, "player admitted");
    Ok(player)
}

// =============================================================================
// HOST SESSION
// =============================================================================

/// One hosted room.
pub struct HostSession {
    code: RoomCode,
    store: Arc<dyn RoomStore>,
    engine: Arc<RaceEngine>,
    sync: RoomSynchronizer,
    config: RoomConfig,
}

impl HostSession {
    /// Create a room under a fresh code and start syncing it.
    pub async fn open(
        store: Arc<dyn RoomStore>,
        race: RaceConfig,
        config: RoomConfig,
        rng: &mut DeterministicRng,
    ) -> Result<Self, SessionError> {
        let room = create_room(store.as_ref(), rng, config.max_code_attempts).await?;
        let engine = Arc::new(RaceEngine::new(race));
        let sync = RoomSynchronizer::new(room.code.clone(), Arc::clone(&store), Arc::clone(&engine));
        if let Err(e) = sync.start().await {
            sync.teardown().await;
            return Err(e.into());
        }
        info!(room = %room.code, "host session opened");
        Ok(Self {
            code: room.code,
            store,
            engine,
            sync,
            config,
        })
    }

    /// Room code to show on screen.
    pub fn code(&self) -> &RoomCode {
        &self.code
    }

    /// The authoritative engine.
    pub fn engine(&self) -> &Arc<RaceEngine> {
        &self.engine
    }

    /// Engine events, e.g. for the race display.
    pub fn subscribe(&self) -> broadcast::Receiver<RaceEvent> {
        self.engine.subscribe()
    }

    /// Register the host device itself as a racer.
    pub async fn add_local_player(&self, name: &str) -> Result<PlayerId, SessionError> {
        let player = admit_player(self.store.as_ref(), &self.code, name, self.config.max_players).await?;
        self.engine.add_player(player.id.clone());
        Ok(player.id)
    }

    /// Start a race with everyone currently in the room.
    pub fn start_game(&self) -> StartOutcome {
        self.engine.start_game(&self.engine.players())
    }

    /// Local tap (host player). Remote taps arrive through the store.
    pub fn tap(&self, player_id: &PlayerId) -> TapOutcome {
        self.engine.process_tap(player_id)
    }

    /// Pause a running race.
    pub fn pause(&self) -> bool {
        self.engine.pause_game()
    }

    /// Resume a paused race.
    pub fn resume(&self) -> bool {
        self.engine.resume_game()
    }

    /// Stop the race and zero everyone's progress.
    pub fn return_to_lobby(&self) {
        self.engine.stop_game();
        self.engine.reset_progress();
    }

    /// Engine stats.
    pub fn stats(&self) -> RaceStats {
        self.engine.stats()
    }

    /// End the session and delete the room.
    pub async fn close(&self) {
        self.sync.teardown().await;
        info!(room = %self.code, "host session closed");
    }
}

// =============================================================================
// ROOM MANAGER
// =============================================================================

/// Owns every hosted room in this process.
pub struct RoomManager {
    store: Arc<dyn RoomStore>,
    race: RaceConfig,
    config: RoomConfig,
    rng: Mutex<DeterministicRng>,
    rooms: RwLock<BTreeMap<RoomCode, Arc<HostSession>>>,
}

impl RoomManager {
    /// Create a manager drawing room codes from an entropy-seeded RNG.
    pub fn new(store: Arc<dyn RoomStore>, race: RaceConfig, config: RoomConfig) -> Self {
        Self::with_rng(store, race, config, DeterministicRng::from_entropy())
    }

    /// Create a manager with a specific RNG (reproducible codes).
    pub fn with_rng(store: Arc<dyn RoomStore>, race: RaceConfig, config: RoomConfig, rng: DeterministicRng) -> Self {
        Self {
            store,
            race,
            config,
            rng: Mutex::new(rng),
            rooms: RwLock::new(BTreeMap::new()),
        }
    }

    /// Room limits.
    pub fn config(&self) -> &RoomConfig {
        &self.config
    }

    /// Open a new room.
    pub async fn create_room(&self) -> Result<Arc<HostSession>, SessionError> {
        let session = {
            let mut rng = self.rng.lock().await;
            HostSession::open(Arc::clone(&self.store), self.race.clone(), self.config.clone(), &mut rng).await?
        };
        let session = Arc::new(session);
        self.rooms
            .write()
            .await
            .insert(session.code().clone(), Arc::clone(&session));
        Ok(session)
    }

    /// Get a room by code.
    pub async fn get_room(&self, code: &RoomCode) -> Option<Arc<HostSession>> {
        self.rooms.read().await.get(code).cloned()
    }

    /// Close and forget a room.
    pub async fn close_room(&self, code: &RoomCode) -> bool {
        let session = self.rooms.write().await.remove(code);
        match session {
            Some(session) => {
                session.close().await;
                true
            }
            None => false,
        }
    }

    /// Active room count.
    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Close every room.
    pub async fn close_all(&self) {
        let sessions: Vec<_> = std::mem::take(&mut *self.rooms.write().await).into_values().collect();
        if !sessions.is_empty() {
            warn!(rooms = sessions.len(), "closing all rooms");
        }
        for session in sessions {
            session.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::state::RacePhase;
    use crate::store::memory::InMemoryRoomStore;
    use std::time::Duration;

    fn manager(store: Arc<InMemoryRoomStore>) -> RoomManager {
        let race = RaceConfig {
            countdown_step: Duration::from_millis(10),
            go_hold: Duration::from_millis(5),
            ..RaceConfig::default()
        };
        RoomManager::with_rng(store, race, RoomConfig::default(), DeterministicRng::new(7))
    }

    #[tokio::test]
    async fn test_manager_create_and_close() {
        let store = Arc::new(InMemoryRoomStore::new());
        let manager = manager(store.clone());

        let a = manager.create_room().await.unwrap();
        let b = manager.create_room().await.unwrap();
        assert_ne!(a.code(), b.code());
        assert_eq!(manager.room_count().await, 2);
        assert!(manager.get_room(a.code()).await.is_some());

        assert!(manager.close_room(a.code()).await);
        assert!(!manager.close_room(a.code()).await);
        assert_eq!(store.read_room(a.code()).await.unwrap(), None);

        manager.close_all().await;
        assert_eq!(manager.room_count().await, 0);
        assert_eq!(store.room_count().await, 0);
    }

    #[tokio::test]
    async fn test_room_capacity() {
        let store = Arc::new(InMemoryRoomStore::new());
        let manager = manager(store.clone());
        let host = manager.create_room().await.unwrap();

        for i in 0..MAX_PLAYERS_PER_ROOM {
            admit_player(store.as_ref(), host.code(), &format!("p{i}"), MAX_PLAYERS_PER_ROOM)
                .await
                .unwrap();
        }
        let err = host.add_local_player("Host").await.unwrap_err();
        assert_eq!(err, SessionError::RoomFull { max_players: 8 });
    }

    #[tokio::test]
    async fn test_admit_unknown_room() {
        let store = InMemoryRoomStore::new();
        let code = RoomCode::parse("5555").unwrap();
        let err = admit_player(&store, &code, "Ana", 8).await.unwrap_err();
        assert_eq!(err, SessionError::RoomNotFound(code));
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_player_race_and_lobby() {
        let store = Arc::new(InMemoryRoomStore::new());
        let manager = manager(store.clone());
        let host = manager.create_room().await.unwrap();

        assert_eq!(host.start_game(), StartOutcome::NoPlayers);
        let me = host.add_local_player("Host").await.unwrap();
        assert_eq!(host.start_game(), StartOutcome::Started);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(host.engine().phase(), RacePhase::Racing);

        for _ in 0..10 {
            host.tap(&me);
        }
        assert!(host.pause());
        assert!(host.resume());
        assert_eq!(host.stats().racers[0].tap_count, 10);

        host.return_to_lobby();
        let stats = host.stats();
        assert_eq!(stats.phase, RacePhase::Waiting);
        assert_eq!(stats.racers[0].progress, 0.0);
        assert_eq!(stats.racers[0].tap_count, 0);
        host.close().await;
    }
}
