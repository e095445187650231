//! Room Synchronizer
//!
//! Bridges one host [`RaceEngine`] and its room document.
//!
//! ```text
//!              outbound (engine events -> field writes)
//!   ┌────────────┐ ──────────────────────────────> ┌────────────┐
//!   │ RaceEngine │                                 │ Room Store │
//!   └────────────┘ <────────────────────────────── └────────────┘
//!              inbound (snapshots -> joins, leaves, taps)
//! ```
//!
//! Tap ingestion is at-most-once. The ledger keeps, per player, how many
//! entries of `raceState/pendingTaps/<id>` were already fed to the engine.
//! Those counts are only meaningful for one `tapEpoch`: whenever the host
//! clears the tap lists it bumps the epoch first locally, then in the store,
//! and snapshots still carrying an older epoch are not mined for taps.
//! Replaying a snapshot therefore never applies a tap twice.
//!
//! A reset the store never accepted leaves the store on the old epoch. The
//! ledger remembers the old epoch with the watermarks valid for it and falls
//! back to them on the next snapshot, so taps keep flowing once the store is
//! reachable again.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::core::rng::DeterministicRng;
use crate::core::room_code::RoomCode;
use crate::core::time::now_millis;
use crate::game::engine::RaceEngine;
use crate::game::events::RaceEvent;
use crate::game::state::{diff_roster, PlayerId, RacePhase, Room};
use crate::store::{FieldPath, RoomSnapshot, RoomStore, StoreError};

/// Synchronizer errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SyncError {
    /// Every candidate room code was taken.
    #[error("no free room code after {attempts} attempts")]
    CodeSpaceExhausted {
        /// Candidates tried.
        attempts: u32,
    },

    /// Store failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What one snapshot changed on the host.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SnapshotReport {
    /// Players newly seen.
    pub joined: Vec<PlayerId>,
    /// Players no longer present.
    pub left: Vec<PlayerId>,
    /// Taps fed to the engine.
    pub taps_applied: usize,
    /// Snapshot predates the current tap epoch; taps were not read.
    pub stale: bool,
}

// =============================================================================
// TAP LEDGER
// =============================================================================

/// Host-side record of which players and taps have been consumed.
#[derive(Debug, Default)]
pub struct TapLedger {
    known_players: BTreeSet<PlayerId>,
    watermarks: BTreeMap<PlayerId, usize>,
    tap_epoch: u64,
    /// Epoch and watermarks before the last reset, until the store confirms it.
    previous: Option<(u64, BTreeMap<PlayerId, usize>)>,
    /// Where to fall back when the last reset never reached the store.
    fallback: Option<(u64, BTreeMap<PlayerId, usize>)>,
}

impl TapLedger {
    /// Current tap epoch.
    pub fn tap_epoch(&self) -> u64 {
        self.tap_epoch
    }

    /// Taps consumed for `player_id` in the current epoch.
    pub fn watermark(&self, player_id: &PlayerId) -> usize {
        self.watermarks.get(player_id).copied().unwrap_or(0)
    }

    /// Start a new epoch, forgetting all watermarks. Returns the new epoch.
    pub fn advance_epoch(&mut self) -> u64 {
        let watermarks = std::mem::take(&mut self.watermarks);
        self.previous = Some((self.tap_epoch, watermarks));
        self.fallback = None;
        self.tap_epoch = self.tap_epoch.wrapping_add(1);
        self.tap_epoch
    }

    /// The store now carries `epoch`.
    pub fn confirm_epoch(&mut self, epoch: u64) {
        if epoch == self.tap_epoch {
            self.previous = None;
        }
    }

    /// The store never received `epoch` and still carries the one before it.
    ///
    /// The next snapshot on that older epoch moves the ledger back to it.
    /// With `lists_cleared` the tap lists were emptied before the failure, so
    /// every entry found there afterwards is new; otherwise the old
    /// watermarks still hold.
    pub fn epoch_not_published(&mut self, epoch: u64, lists_cleared: bool) {
        if epoch != self.tap_epoch {
            return;
        }
        self.fallback = self.previous.take().map(|(previous, watermarks)| {
            let watermarks = if lists_cleared { BTreeMap::new() } else { watermarks };
            (previous, watermarks)
        });
    }

    /// Reconcile the engine with one room snapshot.
    pub fn ingest(&mut self, room: &Room, engine: &RaceEngine) -> SnapshotReport {
        let mut report = SnapshotReport::default();

        let roster = diff_roster(self.known_players.iter(), &room.players);
        if !roster.is_empty() {
            debug!(room = %room.code, players = room.player_count(), "roster changed");
        }
        for player in roster.joined {
            engine.add_player(player.id.clone());
            info!(room = %room.code, player = %player.id, name = %player.name, "player joined");
            self.known_players.insert(player.id.clone());
            report.joined.push(player.id);
        }
        for id in roster.left {
            engine.remove_player(&id);
            info!(room = %room.code, player = %id, "player left");
            self.known_players.remove(&id);
            self.watermarks.remove(&id);
            report.left.push(id);
        }

        let epoch = room.race_state.tap_epoch;
        if epoch < self.tap_epoch {
            match self.fallback.take() {
                Some((previous, watermarks)) if previous == epoch => {
                    warn!(
                        room = %room.code,
                        epoch,
                        abandoned = self.tap_epoch,
                        "store missed tap reset, falling back"
                    );
                    self.tap_epoch = epoch;
                    self.watermarks = watermarks;
                }
                fallback => {
                    self.fallback = fallback;
                    report.stale = true;
                    return report;
                }
            }
        } else {
            if epoch > self.tap_epoch {
                debug!(room = %room.code, from = self.tap_epoch, to = epoch, "adopting tap epoch");
                self.tap_epoch = epoch;
                self.watermarks.clear();
            }
            self.previous = None;
            self.fallback = None;
        }

        for (id, taps) in &room.race_state.pending_taps {
            if !self.known_players.contains(id) {
                continue;
            }
            let seen = self.watermarks.entry(id.clone()).or_insert(0);
            if taps.len() <= *seen {
                continue;
            }
            for _ in &taps[*seen..] {
                engine.process_tap(id);
                report.taps_applied += 1;
            }
            *seen = taps.len();
        }
        report
    }
}

// =============================================================================
// SYNCHRONIZER
// =============================================================================

struct SyncShared {
    code: RoomCode,
    store: Arc<dyn RoomStore>,
    engine: Arc<RaceEngine>,
    ledger: Mutex<TapLedger>,
}

impl SyncShared {
    fn ledger(&self) -> MutexGuard<'_, TapLedger> {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Field write. Failures are logged, never propagated; returns whether
    /// the write landed.
    async fn write(&self, path: FieldPath, value: Value) -> bool {
        match self.store.write_field(&self.code, &path, value).await {
            Ok(()) => true,
            Err(StoreError::PathNotFound(_)) => {
                debug!(room = %self.code, %path, "skipping write for removed field");
                false
            }
            Err(e) => {
                warn!(room = %self.code, %path, error = %e, "store write failed");
                false
            }
        }
    }

    /// Clear the store's tap lists under a new epoch.
    ///
    /// The epoch is only written once the lists are empty, so the store never
    /// pairs a new epoch with old taps.
    async fn reset_tap_log(&self) {
        let epoch = self.ledger().advance_epoch();
        let cleared = self.write(FieldPath::race("pendingTaps"), json!({})).await;
        if cleared && self.write(FieldPath::race("tapEpoch"), json!(epoch)).await {
            self.ledger().confirm_epoch(epoch);
        } else {
            warn!(room = %self.code, epoch, cleared, "tap epoch not published");
            self.ledger().epoch_not_published(epoch, cleared);
        }
    }

    async fn project(&self, event: RaceEvent) {
        if let Some(player) = event.player_id() {
            debug!(room = %self.code, %player, "projecting player event");
        }
        match event {
            RaceEvent::PhaseChanged { to, .. } => {
                match to {
                    RacePhase::Countdown => {
                        self.reset_tap_log().await;
                        self.write(FieldPath::race("winnerId"), Value::Null).await;
                        self.write(FieldPath::race("timedOut"), json!(false)).await;
                    }
                    RacePhase::Waiting => {
                        self.reset_tap_log().await;
                        self.write(FieldPath::race("winnerId"), Value::Null).await;
                        self.write(FieldPath::race("timedOut"), json!(false)).await;
                        self.write(FieldPath::race("startedAt"), Value::Null).await;
                        self.write(FieldPath::race("countdown"), json!(self.engine.countdown()))
                            .await;
                    }
                    RacePhase::Racing => {
                        if let Some(started_at) = self.engine.stats().started_at {
                            self.write(FieldPath::race("startedAt"), json!(started_at)).await;
                        }
                    }
                    RacePhase::Paused | RacePhase::Finished => {}
                }
                self.write(FieldPath::race("phase"), json!(to)).await;
            }
            RaceEvent::CountdownTick { value } => {
                self.write(FieldPath::race("countdown"), json!(value)).await;
            }
            RaceEvent::ProgressUpdated {
                player_id,
                progress,
                tap_count,
            } => {
                self.write(FieldPath::player_field(&player_id, "progress"), json!(progress))
                    .await;
                self.write(FieldPath::player_field(&player_id, "tapCount"), json!(tap_count))
                    .await;
            }
            RaceEvent::Finished { winner_id, .. } => {
                self.write(FieldPath::race("winnerId"), json!(winner_id)).await;
            }
            RaceEvent::TimedOut { .. } => {
                self.write(FieldPath::race("timedOut"), json!(true)).await;
            }
        }
    }

    /// Rewrite the whole race projection from engine state.
    async fn resync(&self) {
        let stats = self.engine.stats();
        warn!(room = %self.code, phase = %stats.phase, "outbound lagged, resyncing room");
        self.write(FieldPath::race("phase"), json!(stats.phase)).await;
        self.write(FieldPath::race("countdown"), json!(stats.countdown)).await;
        self.write(FieldPath::race("winnerId"), json!(stats.winner_id)).await;
        self.write(FieldPath::race("timedOut"), json!(stats.timed_out)).await;
        self.write(FieldPath::race("startedAt"), json!(stats.started_at)).await;
        for racer in stats.racers {
            self.write(FieldPath::player_field(&racer.player_id, "progress"), json!(racer.progress))
                .await;
            self.write(FieldPath::player_field(&racer.player_id, "tapCount"), json!(racer.tap_count))
                .await;
        }
    }
}

/// Keeps a host engine and its room document consistent.
pub struct RoomSynchronizer {
    shared: Arc<SyncShared>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RoomSynchronizer {
    /// Create a synchronizer for an existing room. Call [`start`](Self::start)
    /// to begin relaying.
    pub fn new(code: RoomCode, store: Arc<dyn RoomStore>, engine: Arc<RaceEngine>) -> Self {
        Self {
            shared: Arc::new(SyncShared {
                code,
                store,
                engine,
                ledger: Mutex::new(TapLedger::default()),
            }),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Room code.
    pub fn code(&self) -> &RoomCode {
        &self.shared.code
    }

    /// Current tap epoch.
    pub fn tap_epoch(&self) -> u64 {
        self.shared.ledger().tap_epoch()
    }

    /// Apply one snapshot: roster diff, then unconsumed taps.
    ///
    /// Holds the ledger lock across the engine calls so concurrent snapshots
    /// cannot both consume the same taps.
    pub fn apply_snapshot(&self, room: &Room) -> SnapshotReport {
        let mut ledger = self.shared.ledger();
        ledger.ingest(room, &self.shared.engine)
    }

    /// Spawn the outbound and inbound relay tasks.
    pub async fn start(&self) -> Result<(), SyncError> {
        let mut events = self.shared.engine.subscribe();
        let mut subscription = self.shared.store.subscribe(&self.shared.code).await?;

        let outbound = {
            let shared = Arc::clone(&self.shared);
            tokio::spawn(async move {
                loop {
                    match events.recv().await {
                        Ok(event) => shared.project(event).await,
                        Err(RecvError::Lagged(skipped)) => {
                            debug!(room = %shared.code, skipped, "engine events lagged");
                            shared.resync().await;
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            })
        };

        let inbound = {
            let shared = Arc::clone(&self.shared);
            tokio::spawn(async move {
                while let Some(snapshot) = subscription.next().await {
                    match snapshot {
                        RoomSnapshot::Present(room) => {
                            let report = shared.ledger().ingest(&room, &shared.engine);
                            if report.taps_applied > 0 {
                                debug!(room = %shared.code, taps = report.taps_applied, "taps applied");
                            }
                        }
                        RoomSnapshot::Deleted => {
                            warn!(room = %shared.code, "room deleted from store");
                            break;
                        }
                    }
                }
            })
        };

        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.push(outbound);
        tasks.push(inbound);
        info!(room = %self.shared.code, "room sync started");
        Ok(())
    }

    /// Stop relaying, stop the engine and delete the room. Best effort.
    pub async fn teardown(&self) {
        self.abort_tasks();
        self.shared.engine.stop_game();
        if let Err(e) = self.shared.store.delete_room(&self.shared.code).await {
            warn!(room = %self.shared.code, error = %e, "room delete failed");
        }
        info!(room = %self.shared.code, "room sync stopped");
    }

    fn abort_tasks(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for RoomSynchronizer {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}

/// Create a room under a fresh code, retrying on collisions.
pub async fn create_room(
    store: &dyn RoomStore,
    rng: &mut DeterministicRng,
    max_attempts: u32,
) -> Result<Room, SyncError> {
    for attempt in 1..=max_attempts {
        let room = Room::new(RoomCode::generate(rng), now_millis());
        match store.create_room(&room).await {
            Ok(()) => {
                info!(room = %room.code, attempt, "room created");
                return Ok(room);
            }
            Err(StoreError::RoomExists(code)) => {
                debug!(room = %code, attempt, "room code taken, retrying");
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(SyncError::CodeSpaceExhausted {
        attempts: max_attempts,
    })
}
