//! Engine <-> Room Store reconciliation.

pub mod synchronizer;

pub use synchronizer::{create_room, RoomSynchronizer, SnapshotReport, SyncError, TapLedger};
