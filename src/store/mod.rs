//! Room Store
//!
//! Contract for the shared, eventually-consistent document store that relays
//! room state between the host and mobile clients. One JSON document per
//! room code, addressed by slash-separated field paths:
//!
//! ```text
//! <code>
//! ├── code, createdAt
//! ├── players/<playerId>/{name, avatarId, connected, joinedAt, progress, tapCount}
//! └── raceState/{phase, countdown, winnerId, timedOut, startedAt, tapEpoch}
//!     └── pendingTaps/<playerId>: [timestamp, ...]
//! ```
//!
//! The store holds no game logic. Writes never create missing parents, so a
//! late progress write for a player who already left fails with
//! [`StoreError::PathNotFound`] instead of resurrecting them.

pub mod memory;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use crate::core::room_code::RoomCode;
use crate::game::state::{PlayerId, Room};

// =============================================================================
// FIELD PATHS
// =============================================================================

/// Path to a field inside a room document.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FieldPath(Vec<String>);

impl FieldPath {
    /// Parse `"players/p1/progress"`. Empty segments are rejected.
    pub fn parse(raw: &str) -> Result<Self, StoreError> {
        let segments: Vec<String> = raw.split('/').map(str::to_string).collect();
        if segments.iter().any(String::is_empty) {
            return Err(StoreError::InvalidPath(raw.to_string()));
        }
        Ok(Self(segments))
    }

    /// `players/<id>`
    pub fn player(id: &PlayerId) -> Self {
        Self(vec!["players".into(), id.as_str().into()])
    }

    /// `players/<id>/<field>`
    pub fn player_field(id: &PlayerId, field: &str) -> Self {
        Self(vec!["players".into(), id.as_str().into(), field.into()])
    }

    /// `raceState/<field>`
    pub fn race(field: &str) -> Self {
        Self(vec!["raceState".into(), field.into()])
    }

    /// `raceState/pendingTaps/<id>`
    pub fn pending_taps(id: &PlayerId) -> Self {
        Self(vec!["raceState".into(), "pendingTaps".into(), id.as_str().into()])
    }

    /// Path segments.
    pub fn segments(&self) -> &[String] {
        &self.0
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("/"))
    }
}

// =============================================================================
// ERRORS
// =============================================================================

/// Room Store failures.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    /// `create_room` on a code that is taken.
    #[error("room {0} already exists")]
    RoomExists(RoomCode),

    /// No document for this code.
    #[error("room {0} not found")]
    RoomNotFound(RoomCode),

    /// Parent of the written path does not exist.
    #[error("path {0} does not exist")]
    PathNotFound(FieldPath),

    /// Malformed path string.
    #[error("invalid path: {0:?}")]
    InvalidPath(String),

    /// Append target exists but is not a list.
    #[error("value at {0} is not a list")]
    NotAList(FieldPath),

    /// Value could not be encoded.
    #[error("encode failed: {0}")]
    Encode(String),

    /// The write would leave a document that is not a valid room.
    #[error("document rejected: {0}")]
    Decode(String),

    /// Backend unreachable.
    #[error("store unavailable")]
    Unavailable,
}

/// Encode a value for `write_field` / `append_to_list`.
pub fn to_value<T: Serialize>(value: &T) -> Result<Value, StoreError> {
    serde_json::to_value(value).map_err(|e| StoreError::Encode(e.to_string()))
}

// =============================================================================
// SUBSCRIPTIONS
// =============================================================================

/// One change notification: the whole room after the change.
#[derive(Clone, Debug, PartialEq)]
pub enum RoomSnapshot {
    /// Room as it now stands.
    Present(Arc<Room>),
    /// Room was deleted. Last item of a subscription.
    Deleted,
}

/// Continuous snapshot stream for one room.
///
/// Yields the state at subscription time first, then one snapshot per change.
/// A slow reader skips straight to newer snapshots; since each one is the full
/// room, nothing is lost but intermediate states.
pub struct RoomSubscription {
    initial: Option<RoomSnapshot>,
    rx: broadcast::Receiver<RoomSnapshot>,
}

impl RoomSubscription {
    /// Create from the current state and a change feed.
    pub fn new(initial: RoomSnapshot, rx: broadcast::Receiver<RoomSnapshot>) -> Self {
        Self {
            initial: Some(initial),
            rx,
        }
    }

    /// Next snapshot, or `None` once the room is gone.
    pub async fn next(&mut self) -> Option<RoomSnapshot> {
        if let Some(initial) = self.initial.take() {
            return Some(initial);
        }
        loop {
            match self.rx.recv().await {
                Ok(snapshot) => return Some(snapshot),
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

// =============================================================================
// STORE CONTRACT
// =============================================================================

/// Shared room document store with change notification.
#[async_trait]
pub trait RoomStore: Send + Sync + 'static {
    /// Create a room. Fails with `RoomExists` rather than overwrite.
    async fn create_room(&self, room: &Room) -> Result<(), StoreError>;

    /// Point read of a whole room.
    async fn read_room(&self, code: &RoomCode) -> Result<Option<Room>, StoreError>;

    /// Set one field. The parent of `path` must exist.
    async fn write_field(&self, code: &RoomCode, path: &FieldPath, value: Value) -> Result<(), StoreError>;

    /// Atomically append `item` to the list at `path`, creating the list if
    /// needed. The parent of `path` must exist.
    async fn append_to_list(&self, code: &RoomCode, path: &FieldPath, item: Value) -> Result<(), StoreError>;

    /// Remove a field. Removing an absent field succeeds.
    async fn remove_field(&self, code: &RoomCode, path: &FieldPath) -> Result<(), StoreError>;

    /// Delete the room and end its subscriptions.
    async fn delete_room(&self, code: &RoomCode) -> Result<(), StoreError>;

    /// Subscribe to the room's snapshots.
    async fn subscribe(&self, code: &RoomCode) -> Result<RoomSubscription, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_path_parse() {
        let path = FieldPath::parse("players/p1/progress").unwrap();
        assert_eq!(path, FieldPath::player_field(&PlayerId::new("p1"), "progress"));
        assert_eq!(path.to_string(), "players/p1/progress");
        assert!(FieldPath::parse("players//progress").is_err());
        assert!(FieldPath::parse("").is_err());
    }

    #[test]
    fn test_pending_taps_path() {
        let path = FieldPath::pending_taps(&PlayerId::new("p9"));
        assert_eq!(path.to_string(), "raceState/pendingTaps/p9");
        assert_eq!(path.segments().len(), 3);
    }

    #[tokio::test]
    async fn test_subscription_yields_initial_then_changes() {
        let (tx, rx) = broadcast::channel(4);
        let mut sub = RoomSubscription::new(RoomSnapshot::Deleted, rx);
        tx.send(RoomSnapshot::Deleted).unwrap();
        drop(tx);

        assert_eq!(sub.next().await, Some(RoomSnapshot::Deleted));
        assert_eq!(sub.next().await, Some(RoomSnapshot::Deleted));
        assert_eq!(sub.next().await, None);
    }
}
