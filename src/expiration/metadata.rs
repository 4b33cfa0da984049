//! Expiration metadata of a cache entry.

use crate::expiration::marshaller::ProtoMarshaller;
use crate::expiration::DEFAULT_TIMEOUT;
use serde::de::Error as _;
use serde::ser::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// When an entry was last accessed and how long it may stay idle.
///
/// A `None` timeout is infinite: the entry is immortal and never scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpirationMetaData {
    timeout: Option<Duration>,
    last_access_time: SystemTime,
}

impl ExpirationMetaData {
    /// Create metadata.
    pub fn new(timeout: Option<Duration>, last_access_time: SystemTime) -> Self {
        Self {
            timeout,
            last_access_time,
        }
    }

    /// Metadata that never expires.
    pub fn immortal(last_access_time: SystemTime) -> Self {
        Self::new(None, last_access_time)
    }

    /// Replace the timeout.
    pub fn with_timeout(self, timeout: Option<Duration>) -> Self {
        Self { timeout, ..self }
    }

    /// Record an access at `at`.
    pub fn touched(self, at: SystemTime) -> Self {
        Self {
            last_access_time: at,
            ..self
        }
    }

    /// The idle timeout, or None if infinite.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// The last access time.
    pub fn last_access_time(&self) -> SystemTime {
        self.last_access_time
    }

    /// Whether the entry never expires.
    pub fn is_immortal(&self) -> bool {
        self.timeout.is_none()
    }

    /// `last_access_time + timeout`, or None if immortal.
    ///
    /// A deadline beyond what `SystemTime` can represent is treated as never.
    pub fn deadline(&self) -> Option<SystemTime> {
        self.timeout
            .and_then(|timeout| self.last_access_time.checked_add(timeout))
    }

    /// Whether the deadline has passed at `now`.
    pub fn is_expired(&self, now: SystemTime) -> bool {
        self.deadline().map_or(false, |deadline| deadline <= now)
    }
}

impl Default for ExpirationMetaData {
    fn default() -> Self {
        Self::new(Some(DEFAULT_TIMEOUT), UNIX_EPOCH)
    }
}

// Serde goes through the protobuf encoding, so that is what travels inside
// scheduler commands.
impl Serialize for ExpirationMetaData {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let bytes = self.to_bytes().map_err(S::Error::custom)?;
        bytes.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ExpirationMetaData {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bytes = Vec::<u8>::deserialize(deserializer)?;
        Self::from_bytes(&bytes).map_err(D::Error::custom)
    }
}
