//! # Tap Race Room Engine
//!
//! Authoritative room and race synchronization for the Tap Race party game.
//! A host device owns one [`RaceEngine`] per room; mobile players reach it
//! only through a shared Room Store.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      TAP RACE ENGINE                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/           - Primitives                                │
//! │  ├── progress.rs - Fixed-point race progress                 │
//! │  ├── rng.rs      - Xorshift128+ PRNG (room codes)            │
//! │  ├── room_code.rs- 4-digit room codes                        │
//! │  ├── time.rs     - Millisecond timestamps                    │
//! │  └── env.rs      - Config from environment                   │
//! │                                                              │
//! │  game/           - Race model and engine (authoritative)     │
//! │  ├── state.rs    - Room, Player, RaceState                   │
//! │  ├── events.rs   - Engine notifications                      │
//! │  └── engine.rs   - Countdown, taps, win detection, timeout   │
//! │                                                              │
//! │  store/          - Room Store contract + in-memory backend   │
//! │  sync/           - Engine <-> store reconciliation           │
//! │                                                              │
//! │  network/        - Outer surfaces                            │
//! │  ├── protocol.rs - Wire messages                             │
//! │  ├── session.rs  - Host sessions and room manager            │
//! │  ├── server.rs   - WebSocket relay                           │
//! │  └── client.rs   - Mobile client session                     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Data Flow
//!
//! Client session -> store (join / tap) -> synchronizer (host) -> engine
//! -> synchronizer -> store -> every client session.
//!
//! The store is a relay, not a source of truth: only the engine decides
//! progress and winners.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod core;
pub mod game;
pub mod network;
pub mod store;
pub mod sync;

// Re-export commonly used types
pub use core::progress::{Progress, PROGRESS_SCALE};
pub use core::rng::DeterministicRng;
pub use core::room_code::RoomCode;
pub use core::time::Timestamp;
pub use game::engine::{RaceConfig, RaceEngine, StartOutcome, TapOutcome};
pub use game::events::RaceEvent;
pub use game::state::{Player, PlayerId, RacePhase, RaceState, Room};
pub use network::client::ClientSession;
pub use network::session::{HostSession, RoomConfig, RoomManager};
pub use store::{memory::InMemoryRoomStore, RoomStore};
pub use sync::RoomSynchronizer;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Number of digits in a room code.
pub const ROOM_CODE_LENGTH: usize = 4;

/// Maximum players per room.
pub const MAX_PLAYERS_PER_ROOM: usize = 8;

/// Progress added per tap (50 taps to finish).
pub const DEFAULT_TAP_INCREMENT: f32 = 0.02;

/// First value shown by the countdown.
pub const COUNTDOWN_FROM: u32 = 3;

/// Race duration before timeout (milliseconds).
pub const RACE_DURATION_MS: u64 = 90_000;
