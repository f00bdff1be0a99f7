use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Client-generated identifier of a queued mutation. Random 128-bit, so no
/// allocator is needed and ids stay unique across restarts and devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
#[serde(transparent)]
pub struct LocalId(Uuid);

impl LocalId {
    /// Generate a new random (UUIDv4) identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Access the underlying UUID value.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for LocalId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl From<Uuid> for LocalId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl From<LocalId> for Uuid {
    fn from(value: LocalId) -> Self {
        value.0
    }
}

impl Default for LocalId {
    fn default() -> Self {
        Self::new()
    }
}
