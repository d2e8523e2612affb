use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::{fmt, str::FromStr};
use uuid::Uuid;

use crate::error::ChatError;

/// Opaque identity for sessions, messages and users.
///
/// Backed by a UUIDv7 so ids sort by creation time. Rendered externally as
/// 32 lowercase hex characters; the hyphenated form is accepted on input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordId(Uuid);

#[derive(Debug, thiserror::Error)]
#[error("malformed id: {0:?}")]
pub struct InvalidId(pub String);

impl RecordId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

impl FromStr for RecordId {
    type Err = InvalidId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::try_parse(s.trim())
            .map(Self)
            .map_err(|_| InvalidId(s.to_string()))
    }
}

impl Serialize for RecordId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for RecordId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Who sent a message, as stored and sent over the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SenderRole {
    #[serde(alias = "admin")]
    Admin,
    #[serde(alias = "guest")]
    Guest,
    #[serde(alias = "customer")]
    Customer,
}

#[derive(Debug, thiserror::Error)]
#[error("unknown role: {0:?}")]
pub struct InvalidRole(pub String);

/// Routing projection of a role. Fan-out only ever crosses parties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Party {
    Administrator,
    Counterparty,
}

impl SenderRole {
    pub fn party(self) -> Party {
        match self {
            SenderRole::Admin => Party::Administrator,
            SenderRole::Guest | SenderRole::Customer => Party::Counterparty,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SenderRole::Admin => "Admin",
            SenderRole::Guest => "Guest",
            SenderRole::Customer => "Customer",
        }
    }
}

impl fmt::Display for SenderRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SenderRole {
    type Err = InvalidRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "admin" => Ok(SenderRole::Admin),
            "guest" => Ok(SenderRole::Guest),
            "customer" => Ok(SenderRole::Customer),
            _ => Err(InvalidRole(s.to_string())),
        }
    }
}

/// Authenticated identity handed to us by the surrounding backend.
///
/// Guests never have one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller {
    pub id: RecordId,
    pub role: SenderRole,
}

impl Caller {
    pub fn new(id: RecordId, role: SenderRole) -> Self {
        Self { id, role }
    }

    pub fn is_admin(&self) -> bool {
        self.role.party() == Party::Administrator
    }

    pub fn require_admin(&self) -> Result<(), ChatError> {
        if self.is_admin() {
            Ok(())
        } else {
            Err(ChatError::Permission)
        }
    }
}
