//! Room versions.
//!
//! A room version is fixed when the room is created. It decides how event IDs
//! are formed and which state resolution ordering applies to conflicts.

use crate::error::{EventError, EventResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A supported room version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum RoomVersion {
    /// Room version 1.
    V1,
    /// Room version 2.
    V2,
    /// Room version 3.
    V3,
    /// Room version 4.
    V4,
    /// Room version 5.
    V5,
    /// Room version 6.
    V6,
}

/// Conflict ordering used when merging divergent room state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateResAlgorithm {
    /// Depth first, then event ID.
    V1,
    /// Sender power level, then timestamp, then event ID.
    V2,
}

/// How the event ID of an event is formed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventIdFormat {
    /// Chosen by the origin server, `$localpart:server`.
    Origin,
    /// `$` followed by the unpadded standard base64 reference hash.
    ReferenceHash,
    /// `$` followed by the unpadded URL-safe base64 reference hash.
    UrlSafeReferenceHash,
}

impl RoomVersion {
    /// All supported versions, oldest first.
    pub const ALL: [RoomVersion; 6] = [
        RoomVersion::V1,
        RoomVersion::V2,
        RoomVersion::V3,
        RoomVersion::V4,
        RoomVersion::V5,
        RoomVersion::V6,
    ];

    /// Returns the wire identifier of this version.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::V1 => "1",
            Self::V2 => "2",
            Self::V3 => "3",
            Self::V4 => "4",
            Self::V5 => "5",
            Self::V6 => "6",
        }
    }

    /// Returns the state resolution ordering for this version.
    #[must_use]
    pub const fn state_res_algorithm(self) -> StateResAlgorithm {
        match self {
            Self::V1 => StateResAlgorithm::V1,
            _ => StateResAlgorithm::V2,
        }
    }

    /// Returns the event ID format for this version.
    #[must_use]
    pub const fn event_id_format(self) -> EventIdFormat {
        match self {
            Self::V1 | Self::V2 => EventIdFormat::Origin,
            Self::V3 => EventIdFormat::ReferenceHash,
            _ => EventIdFormat::UrlSafeReferenceHash,
        }
    }
}

impl Default for RoomVersion {
    fn default() -> Self {
        Self::V6
    }
}

impl FromStr for RoomVersion {
    type Err = EventError;

    fn from_str(s: &str) -> EventResult<Self> {
        Self::ALL
            .into_iter()
            .find(|v| v.as_str() == s)
            .ok_or_else(|| EventError::UnsupportedRoomVersion {
                version: s.to_string(),
            })
    }
}

impl TryFrom<String> for RoomVersion {
    type Error = EventError;

    fn try_from(value: String) -> EventResult<Self> {
        value.parse()
    }
}

impl From<RoomVersion> for String {
    fn from(version: RoomVersion) -> Self {
        version.as_str().to_string()
    }
}

impl fmt::Display for RoomVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
