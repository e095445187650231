//! Race Model and Engine
//!
//! Everything the host treats as authoritative.
//!
//! ## Module Structure
//!
//! - `state`: Room, Player, RaceState documents
//! - `events`: Engine notifications for the synchronizer, UI and tests
//! - `engine`: Countdown, tap processing, win detection, timeout

pub mod engine;
pub mod events;
pub mod state;

// Re-export key types
pub use engine::{RaceConfig, RaceEngine, RaceStats, StartOutcome, TapOutcome};
pub use events::RaceEvent;
pub use state::{Player, PlayerId, RacePhase, RaceState, Room};
