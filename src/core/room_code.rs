//! Room Codes
//!
//! A room is addressed by exactly four ASCII digits ("0000" to "9999").

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::rng::DeterministicRng;
use crate::ROOM_CODE_LENGTH;

/// Number of distinct room codes.
pub const ROOM_CODE_SPACE: u32 = 10_000;

/// A validated 4-digit room code.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoomCode(String);

/// Room code validation errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoomCodeError {
    /// Wrong number of characters.
    #[error("room code must be {expected} digits, got {actual} characters")]
    WrongLength {
        /// Required length.
        expected: usize,
        /// Length received.
        actual: usize,
    },
    /// Contains something other than 0-9.
    #[error("room code must contain only digits")]
    NotNumeric,
}

impl RoomCode {
    /// Validate a code received from a client.
    pub fn parse(raw: &str) -> Result<Self, RoomCodeError> {
        let actual = raw.chars().count();
        if actual != ROOM_CODE_LENGTH {
            return Err(RoomCodeError::WrongLength {
                expected: ROOM_CODE_LENGTH,
                actual,
            });
        }
        if !raw.bytes().all(|b| b.is_ascii_digit()) {
            return Err(RoomCodeError::NotNumeric);
        }
        Ok(Self(raw.to_string()))
    }

    /// Draw a random candidate code. Uniqueness is the store's job.
    pub fn generate(rng: &mut DeterministicRng) -> Self {
        Self(format!("{:04}", rng.next_int(ROOM_CODE_SPACE)))
    }

    /// Borrow as `&str`.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for RoomCode {
    type Err = RoomCodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for RoomCode {
    type Error = RoomCodeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<RoomCode> for String {
    fn from(code: RoomCode) -> Self {
        code.0
    }
}
