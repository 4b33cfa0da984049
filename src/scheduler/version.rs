//! Per-identifier schedule versions.
//!
//! Every `schedule` and `cancel` issued through a clustered scheduler is
//! stamped by a hybrid logical clock. Members keep the newest stamp they have
//! seen for each identifier, which turns a cancel into a tombstone: a
//! `Schedule`, `Execute` or store re-arm stamped at or before it is dropped,
//! whatever order the messages arrive in.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::cmp::Ordering as CmpOrdering;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Newest known state of an identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    /// Scheduled at the given stamp.
    Live(u64),
    /// Cancelled at the given stamp.
    Cancelled(u64),
}

impl Version {
    pub fn stamp(&self) -> u64 {
        match self {
            Version::Live(stamp) | Version::Cancelled(stamp) => *stamp,
        }
    }

    /// Whether `self` is newer than `other`. A cancel wins a tie.
    pub fn supersedes(&self, other: &Version) -> bool {
        match self.stamp().cmp(&other.stamp()) {
            CmpOrdering::Greater => true,
            CmpOrdering::Less => false,
            CmpOrdering::Equal => {
                matches!((self, other), (Version::Cancelled(_), Version::Live(_)))
            }
        }
    }
}

/// Microseconds since the epoch, bumped past every stamp seen so far.
///
/// Stamps issued on one member are strictly increasing, and a stamp issued
/// after receiving a message is greater than the message's stamp.
#[derive(Debug, Default)]
struct HybridClock {
    last: AtomicU64,
}

impl HybridClock {
    fn tick(&self) -> u64 {
        let physical = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0);
        let previous = self
            .last
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(physical.max(last + 1))
            })
            .unwrap_or_else(|last| last);
        physical.max(previous + 1)
    }

    fn observe(&self, stamp: u64) {
        self.last.fetch_max(stamp, Ordering::SeqCst);
    }
}

/// Version register per identifier, plus the clock that stamps local writes.
pub struct VersionTable<I> {
    clock: HybridClock,
    versions: DashMap<I, Version>,
}

impl<I> std::fmt::Debug for VersionTable<I>
where
    I: Eq + Hash + std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VersionTable")
            .field("clock", &self.clock)
            .field("versions", &self.versions)
            .finish()
    }
}

impl<I> VersionTable<I>
where
    I: Clone + Eq + Hash,
{
    pub fn new() -> Self {
        Self {
            clock: HybridClock::default(),
            versions: DashMap::new(),
        }
    }

    /// A fresh stamp for a locally issued operation.
    pub fn tick(&self) -> u64 {
        self.clock.tick()
    }

    /// Advance the clock past a stamp received from another member.
    pub fn observe(&self, stamp: u64) {
        self.clock.observe(stamp);
    }

    /// Record `version` for `id` if it is newer than the known one.
    ///
    /// Returns the replaced version on success, or the newer version that
    /// made `version` stale.
    pub fn apply(&self, id: I, version: Version) -> Result<Option<Version>, Version> {
        match self.versions.entry(id) {
            Entry::Occupied(mut occupied) => {
                let current = *occupied.get();
                if version.supersedes(&current) {
                    occupied.insert(version);
                    Ok(Some(current))
                } else {
                    Err(current)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(version);
                Ok(None)
            }
        }
    }

    pub fn get(&self, id: &I) -> Option<Version> {
        self.versions.get(id).map(|version| *version)
    }

    pub fn is_cancelled(&self, id: &I) -> bool {
        matches!(self.get(id), Some(Version::Cancelled(_)))
    }

    /// Whether work stamped `stamp` may still run: no cancel at or after it.
    pub fn permits(&self, id: &I, stamp: u64) -> bool {
        !matches!(self.get(id), Some(Version::Cancelled(cancelled)) if cancelled >= stamp)
    }

    /// Drop a live register once the work it stamped has completed.
    pub fn complete(&self, id: &I, stamp: u64) {
        self.versions
            .remove_if(id, |_, version| matches!(version, Version::Live(live) if *live <= stamp));
    }

    /// Every tombstone, as `(id, stamp)`.
    pub fn cancelled(&self) -> Vec<(I, u64)> {
        self.versions
            .iter()
            .filter_map(|entry| match entry.value() {
                Version::Cancelled(stamp) => Some((entry.key().clone(), *stamp)),
                Version::Live(_) => None,
            })
            .collect()
    }

    pub fn retain(&self, mut keep: impl FnMut(&I, &Version) -> bool) {
        self.versions.retain(|id, version| keep(id, version));
    }

    pub fn len(&self) -> usize {
        self.versions.len()
    }
}

impl<I> Default for VersionTable<I>
where
    I: Clone + Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}
