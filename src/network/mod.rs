//! Network Layer
//!
//! Host sessions, the WebSocket relay and the mobile client session.
//! This layer is **not authoritative** - all race decisions run through `game/`.

pub mod client;
pub mod protocol;
pub mod server;
pub mod session;

pub use client::{
    ClientConfig, ClientError, ClientSession, ClientTransport, ConnectionState, JoinAck, RelayTransport,
    StoreTransport, TransportEvent,
};
pub use protocol::{ClientMessage, ErrorCode, JoinRoom, RoomInfo, SelectAvatar, ServerMessage, TapInput};
pub use server::{RelayServer, ServerConfig, ServerError};
pub use session::{admit_player, HostSession, RoomConfig, RoomManager, SessionError};
