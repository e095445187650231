//! Core primitives.
//!
//! Small, dependency-light building blocks shared by the engine, the store
//! and the network layer.

pub mod env;
pub mod progress;
pub mod rng;
pub mod room_code;
pub mod time;

// Re-export core types
pub use progress::{Progress, PROGRESS_SCALE};
pub use rng::DeterministicRng;
pub use room_code::{RoomCode, RoomCodeError};
pub use time::{now_millis, Timestamp};
