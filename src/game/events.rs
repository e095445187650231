//! Race Events
//!
//! Notifications broadcast by the [`RaceEngine`](super::engine::RaceEngine).
//! Events for one engine are emitted in the order the state changed, so a
//! subscriber that applies them in order reproduces the engine's state.

use serde::{Deserialize, Serialize};

use crate::core::time::Timestamp;
use crate::game::state::{PlayerId, RacePhase};

/// Something changed in the race.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RaceEvent {
    /// Phase transition.
    PhaseChanged {
        /// Previous phase
        from: RacePhase,
        /// New phase
        to: RacePhase,
        /// When it happened
        at: Timestamp,
    },

    /// Countdown display value (3, 2, 1, then 0 for GO).
    CountdownTick {
        /// Value shown
        value: u32,
    },

    /// A racer's progress changed (tap, or reset at race start).
    ProgressUpdated {
        /// Racer
        player_id: PlayerId,
        /// Progress in [0, 1]
        progress: f32,
        /// Taps applied this race
        tap_count: u32,
    },

    /// A racer crossed the finish line. Always followed by no further
    /// progress until the next race.
    Finished {
        /// Winner
        winner_id: PlayerId,
        /// When the winning tap was applied
        at: Timestamp,
    },

    /// The race clock ran out with no winner.
    TimedOut {
        /// Time spent racing
        elapsed_ms: u64,
    },
}

impl RaceEvent {
    /// Create a phase change event.
    pub fn phase_changed(from: RacePhase, to: RacePhase, at: Timestamp) -> Self {
        Self::PhaseChanged { from, to, at }
    }

    /// Create a progress event.
    pub fn progress(player_id: PlayerId, progress: f32, tap_count: u32) -> Self {
        Self::ProgressUpdated {
            player_id,
            progress,
            tap_count,
        }
    }

    /// Player this event concerns, if any.
    pub fn player_id(&self) -> Option<&PlayerId> {
        match self {
            RaceEvent::ProgressUpdated { player_id, .. } => Some(player_id),
            RaceEvent::Finished { winner_id, .. } => Some(winner_id),
            _ => None,
        }
    }

    /// Does this event end the race.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RaceEvent::Finished { .. } | RaceEvent::TimedOut { .. })
    }
}
