//! Protocol Messages
//!
//! Wire format between mobile clients and the relay server over WebSocket.
//! One JSON object per message, discriminated by a `"type"` field.
//! Taps may also be sent as bincode-encoded [`TapInput`] binary frames.

use serde::{Deserialize, Serialize};

use crate::core::time::Timestamp;
use crate::game::state::{Player, PlayerId, RaceState, Room};

// =============================================================================
// CLIENT -> SERVER MESSAGES
// =============================================================================

/// Messages sent from client to server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Join a room by code.
    JoinRoom(JoinRoom),

    /// Choose an avatar (may be repeated; last one wins).
    SelectAvatar(SelectAvatar),

    /// One tap.
    TapInput(TapInput),

    /// Leave the room.
    LeaveRoom {
        /// Leaving player.
        #[serde(rename = "playerId")]
        player_id: PlayerId,
    },

    /// Latency probe.
    Ping {
        /// Client timestamp, echoed back.
        timestamp: Timestamp,
    },
}

/// Join request. The code is validated by the server, not the decoder, so a
/// malformed code gets a specific error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRoom {
    /// Room code as typed by the user.
    pub room_code: String,
    /// Display name.
    pub player_name: String,
}

/// Avatar selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectAvatar {
    /// Selecting player.
    pub player_id: PlayerId,
    /// Avatar identifier.
    pub avatar_id: String,
}

/// A tap from one player.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TapInput {
    /// Tapping player.
    pub player_id: PlayerId,
    /// Client timestamp (ms).
    pub timestamp: Timestamp,
}

impl TapInput {
    /// Serialize to a binary frame.
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize from a binary frame.
    pub fn from_bytes(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }
}

// =============================================================================
// SERVER -> CLIENT MESSAGES
// =============================================================================

/// Messages sent from server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Join accepted.
    Success {
        /// Human-readable confirmation.
        message: String,
        /// Identity assigned to the joining player.
        #[serde(rename = "playerId", default, skip_serializing_if = "Option::is_none")]
        player_id: Option<PlayerId>,
    },

    /// Full room view.
    RoomInfo(RoomInfo),

    /// Someone joined.
    PlayerJoined {
        /// The new player.
        player: Player,
    },

    /// Someone left.
    PlayerLeft {
        /// Departed player.
        #[serde(rename = "playerId")]
        player_id: PlayerId,
    },

    /// Request failed.
    Error {
        /// Machine-readable code.
        code: ErrorCode,
        /// Human-readable message.
        message: String,
    },

    /// Ping reply.
    Pong {
        /// Echoed client timestamp.
        timestamp: Timestamp,
        /// Server wall clock (ms).
        #[serde(rename = "serverTime")]
        server_time: Timestamp,
    },

    /// Server is shutting down.
    Shutdown {
        /// Reason.
        reason: String,
    },
}

/// Room state as sent to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomInfo {
    /// Room code.
    pub room_code: String,
    /// Players ordered by join time.
    pub players: Vec<Player>,
    /// Race state, without the raw tap log.
    pub race: RaceState,
}

impl RoomInfo {
    /// Build from a room document.
    pub fn from_room(room: &Room) -> Self {
        let mut race = room.race_state.clone();
        race.pending_taps.clear();
        Self {
            room_code: room.code.to_string(),
            players: room.player_list(),
            race,
        }
    }
}

/// Error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Room code is not four digits.
    InvalidRoomCode,
    /// No active room with this code.
    RoomNotFound,
    /// Room is at capacity.
    RoomFull,
    /// Unparseable message.
    InvalidMessage,
    /// Message requires a joined player.
    NotJoined,
    /// Connection already joined a room.
    AlreadyJoined,
    /// Something went wrong on our side.
    InternalError,
}

impl ErrorCode {
    /// Default message for this code.
    pub fn message(self) -> &'static str {
        match self {
            ErrorCode::InvalidRoomCode => "Invalid room code",
            ErrorCode::RoomNotFound => "Room not found",
            ErrorCode::RoomFull => "Room is full",
            ErrorCode::InvalidMessage => "Invalid message format",
            ErrorCode::NotJoined => "Join a room first",
            ErrorCode::AlreadyJoined => "Already in a room",
            ErrorCode::InternalError => "Internal error",
        }
    }
}

impl ClientMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

impl ServerMessage {
    /// Error reply with the code's default message.
    pub fn error(code: ErrorCode) -> Self {
        Self::Error {
            code,
            message: code.message().to_string(),
        }
    }

    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}
