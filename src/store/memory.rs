//! In-Memory Room Store
//!
//! Process-local [`RoomStore`] used by the relay server, the demo and tests.
//! Each room is a JSON document plus a broadcast channel of snapshots.
//! Mutations are applied to a copy and committed only if the result still
//! decodes as a [`Room`], so a bad write can never corrupt a room.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

use super::{to_value, FieldPath, RoomSnapshot, RoomStore, RoomSubscription, StoreError};
use crate::core::room_code::RoomCode;
use crate::game::state::Room;

/// Snapshot channel capacity per room.
const SNAPSHOT_CAPACITY: usize = 256;

struct RoomDoc {
    value: Value,
    snapshots: broadcast::Sender<RoomSnapshot>,
}

/// In-memory store.
pub struct InMemoryRoomStore {
    rooms: RwLock<BTreeMap<RoomCode, RoomDoc>>,
    available: AtomicBool,
}

impl InMemoryRoomStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            rooms: RwLock::new(BTreeMap::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate an outage: while unavailable every operation fails.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of rooms.
    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable)
        }
    }

    /// Apply `mutate` to a copy of the room document, validate, commit, publish.
    async fn mutate<F>(&self, code: &RoomCode, mutate: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut Value) -> Result<(), StoreError> + Send,
    {
        self.check_available()?;
        let mut rooms = self.rooms.write().await;
        let doc = rooms
            .get_mut(code)
            .ok_or_else(|| StoreError::RoomNotFound(code.clone()))?;

        let mut candidate = doc.value.clone();
        mutate(&mut candidate)?;
        let room: Room =
            serde_json::from_value(candidate.clone()).map_err(|e| StoreError::Decode(e.to_string()))?;

        doc.value = candidate;
        let _ = doc.snapshots.send(RoomSnapshot::Present(Arc::new(room)));
        Ok(())
    }
}

impl Default for InMemoryRoomStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Walk to the object that holds the last segment of `path`.
fn parent_object<'a, 'p>(
    root: &'a mut Value,
    path: &'p FieldPath,
) -> Result<(&'a mut Map<String, Value>, &'p str), StoreError> {
    let (last, parents) = path
        .segments()
        .split_last()
        .ok_or_else(|| StoreError::InvalidPath(String::new()))?;
    let mut node = root;
    for segment in parents {
        node = node
            .as_object_mut()
            .and_then(|object| object.get_mut(segment))
            .ok_or_else(|| StoreError::PathNotFound(path.clone()))?;
    }
    let object = node
        .as_object_mut()
        .ok_or_else(|| StoreError::PathNotFound(path.clone()))?;
    Ok((object, last.as_str()))
}

#[async_trait]
impl RoomStore for InMemoryRoomStore {
    async fn create_room(&self, room: &Room) -> Result<(), StoreError> {
        self.check_available()?;
        let value = to_value(room)?;
        let mut rooms = self.rooms.write().await;
        if rooms.contains_key(&room.code) {
            return Err(StoreError::RoomExists(room.code.clone()));
        }
        let (snapshots, _) = broadcast::channel(SNAPSHOT_CAPACITY);
        rooms.insert(room.code.clone(), RoomDoc { value, snapshots });
        debug!(room = %room.code, "room created");
        Ok(())
    }

    async fn read_room(&self, code: &RoomCode) -> Result<Option<Room>, StoreError> {
        self.check_available()?;
        let rooms = self.rooms.read().await;
        rooms
            .get(code)
            .map(|doc| serde_json::from_value(doc.value.clone()).map_err(|e| StoreError::Decode(e.to_string())))
            .transpose()
    }

    async fn write_field(&self, code: &RoomCode, path: &FieldPath, value: Value) -> Result<(), StoreError> {
        self.mutate(code, |doc| {
            let (parent, key) = parent_object(doc, path)?;
            parent.insert(key.to_string(), value);
            Ok(())
        })
        .await
    }

    async fn append_to_list(&self, code: &RoomCode, path: &FieldPath, item: Value) -> Result<(), StoreError> {
        self.mutate(code, |doc| {
            let (parent, key) = parent_object(doc, path)?;
            let list = parent
                .entry(key.to_string())
                .or_insert_with(|| Value::Array(Vec::new()));
            if list.is_null() {
                *list = Value::Array(Vec::new());
            }
            let items = list
                .as_array_mut()
                .ok_or_else(|| StoreError::NotAList(path.clone()))?;
            items.push(item);
            Ok(())
        })
        .await
    }

    async fn remove_field(&self, code: &RoomCode, path: &FieldPath) -> Result<(), StoreError> {
        self.mutate(code, |doc| {
            let (parent, key) = parent_object(doc, path)?;
            parent.remove(key);
            Ok(())
        })
        .await
    }

    async fn delete_room(&self, code: &RoomCode) -> Result<(), StoreError> {
        self.check_available()?;
        let doc = self
            .rooms
            .write()
            .await
            .remove(code)
            .ok_or_else(|| StoreError::RoomNotFound(code.clone()))?;
        let _ = doc.snapshots.send(RoomSnapshot::Deleted);
        debug!(room = %code, "room deleted");
        Ok(())
    }

    async fn subscribe(&self, code: &RoomCode) -> Result<RoomSubscription, StoreError> {
        self.check_available()?;
        let rooms = self.rooms.read().await;
        let doc = rooms
            .get(code)
            .ok_or_else(|| StoreError::RoomNotFound(code.clone()))?;
        let room: Room =
            serde_json::from_value(doc.value.clone()).map_err(|e| StoreError::Decode(e.to_string()))?;
        Ok(RoomSubscription::new(
            RoomSnapshot::Present(Arc::new(room)),
            doc.snapshots.subscribe(),
        ))
    }
}
