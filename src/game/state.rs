//! Room and Race State
//!
//! The document shape shared through the Room Store. Field names are
//! camelCase on the wire so mobile clients can read snapshots directly.
//! Uses BTreeMap for stable iteration order.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::room_code::RoomCode;
use crate::core::time::Timestamp;
use crate::COUNTDOWN_FROM;

// =============================================================================
// PLAYER ID
// =============================================================================

/// Player identifier, unique within a room.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlayerId(String);

impl PlayerId {
    /// Wrap an existing id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Allocate a fresh random id.
    pub fn generate() -> Self {
        Self(format!("player_{}", uuid::Uuid::new_v4().simple()))
    }

    /// Borrow as `&str`.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PlayerId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

// =============================================================================
// RACE PHASE
// =============================================================================

/// Race phase.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RacePhase {
    /// Lobby, accepting players.
    #[default]
    Waiting,
    /// 3, 2, 1, GO.
    Countdown,
    /// Taps count.
    Racing,
    /// Racing, suspended by the host.
    Paused,
    /// Someone won, or the clock ran out.
    Finished,
}

impl RacePhase {
    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            RacePhase::Waiting => "WAITING",
            RacePhase::Countdown => "COUNTDOWN",
            RacePhase::Racing => "RACING",
            RacePhase::Paused => "PAUSED",
            RacePhase::Finished => "FINISHED",
        }
    }

    /// Whether the engine may move from `self` to `next`.
    ///
    /// Any phase may return to `Waiting` (stop / return to lobby).
    pub fn can_transition_to(self, next: RacePhase) -> bool {
        use RacePhase::*;
        matches!(
            (self, next),
            (_, Waiting)
                | (Waiting, Countdown)
                | (Countdown, Racing)
                | (Racing, Finished)
                | (Racing, Paused)
                | (Paused, Racing)
        )
    }

    /// A race attempt is underway (countdown, racing or paused).
    pub fn is_active(self) -> bool {
        matches!(self, RacePhase::Countdown | RacePhase::Racing | RacePhase::Paused)
    }
}

impl fmt::Display for RacePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// PLAYER
// =============================================================================

/// A participant in a room.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Player {
    /// Identity within the room.
    pub id: PlayerId,
    /// Display name (not unique).
    pub name: String,
    /// Selected avatar.
    pub avatar_id: Option<String>,
    /// Transport is up.
    pub connected: bool,
    /// When the player joined.
    pub joined_at: Timestamp,
    /// Race progress in [0, 1], written by the host.
    pub progress: f32,
    /// Taps applied by the host this race.
    pub tap_count: u32,
}

impl Player {
    /// Create a freshly joined player.
    pub fn new(id: PlayerId, name: impl Into<String>, joined_at: Timestamp) -> Self {
        Self {
            id,
            name: name.into(),
            avatar_id: None,
            connected: true,
            joined_at,
            progress: 0.0,
            tap_count: 0,
        }
    }
}

// =============================================================================
// RACE STATE
// =============================================================================

/// Shared race state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RaceState {
    /// Current phase.
    pub phase: RacePhase,
    /// Countdown display value (meaningful during COUNTDOWN).
    pub countdown: u32,
    /// Set only when a player crossed the finish line.
    pub winner_id: Option<PlayerId>,
    /// The race ended because the clock ran out.
    pub timed_out: bool,
    /// When RACING began.
    pub started_at: Option<Timestamp>,
    /// Tap timestamps per player, append-only within one tap epoch.
    pub pending_taps: BTreeMap<PlayerId, Vec<Timestamp>>,
    /// Bumped by the host every time `pending_taps` is cleared.
    pub tap_epoch: u64,
}

impl Default for RaceState {
    fn default() -> Self {
        Self {
            phase: RacePhase::Waiting,
            countdown: COUNTDOWN_FROM,
            winner_id: None,
            timed_out: false,
            started_at: None,
            pending_taps: BTreeMap::new(),
            tap_epoch: 0,
        }
    }
}

// =============================================================================
// ROOM
// =============================================================================

/// One game session, addressed by a room code.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Room {
    /// Room code.
    pub code: RoomCode,
    /// Players by id.
    #[serde(default)]
    pub players: BTreeMap<PlayerId, Player>,
    /// Race state.
    #[serde(default)]
    pub race_state: RaceState,
    /// When the host created the room.
    #[serde(default)]
    pub created_at: Timestamp,
}

impl Room {
    /// Create an empty room.
    pub fn new(code: RoomCode, created_at: Timestamp) -> Self {
        Self {
            code,
            players: BTreeMap::new(),
            race_state: RaceState::default(),
            created_at,
        }
    }

    /// Players ordered by join time.
    pub fn player_list(&self) -> Vec<Player> {
        let mut players: Vec<Player> = self.players.values().cloned().collect();
        players.sort_by(|a, b| a.joined_at.cmp(&b.joined_at).then_with(|| a.id.cmp(&b.id)));
        players
    }

    /// Player count.
    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    /// Has the room reached `max_players`.
    pub fn is_full(&self, max_players: usize) -> bool {
        self.player_count() >= max_players
    }

    /// Number of taps submitted by `player_id` in the current tap epoch.
    pub fn pending_tap_count(&self, player_id: &PlayerId) -> usize {
        self.race_state
            .pending_taps
            .get(player_id)
            .map_or(0, Vec::len)
    }
}

/// Membership changes between two player maps.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RosterDiff {
    /// Present in `next` only.
    pub joined: Vec<Player>,
    /// Present in `previous` only.
    pub left: Vec<PlayerId>,
}

impl RosterDiff {
    /// No membership change.
    pub fn is_empty(&self) -> bool {
        self.joined.is_empty() && self.left.is_empty()
    }
}

/// Diff two player maps by id.
pub fn diff_roster<'a, I>(previous: I, next: &BTreeMap<PlayerId, Player>) -> RosterDiff
where
    I: IntoIterator<Item = &'a PlayerId> + Clone,
{
    let joined = next
        .values()
        .filter(|p| !previous.clone().into_iter().any(|id| *id == p.id))
        .cloned()
        .collect();
    let left = previous
        .into_iter()
        .filter(|id| !next.contains_key(*id))
        .cloned()
        .collect();
    RosterDiff { joined, left }
}
