//! Level gauges that remember their high-water mark.
//!
//! Pending calls and armed timers are both bounded resources, so the peak is
//! usually more telling than the instantaneous level.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

#[derive(Debug)]
pub struct Gauge {
    name: &'static str,
    help: &'static str,
    level: AtomicI64,
    peak: AtomicI64,
}

impl Gauge {
    pub const fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            name,
            help,
            level: AtomicI64::new(0),
            peak: AtomicI64::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Overwrite the level. The peak is raised if needed but never lowered.
    pub fn set(&self, level: i64) {
        self.level.store(level, Ordering::Relaxed);
        self.peak.fetch_max(level, Ordering::Relaxed);
    }

    pub fn inc(&self) {
        let level = self.level.fetch_add(1, Ordering::Relaxed) + 1;
        self.peak.fetch_max(level, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.level.fetch_sub(1, Ordering::Relaxed);
    }

    /// Current level.
    pub fn get(&self) -> i64 {
        self.level.load(Ordering::Relaxed)
    }

    /// Highest level observed since creation.
    pub fn peak(&self) -> i64 {
        self.peak.load(Ordering::Relaxed)
    }
}

impl fmt::Display for Gauge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "# HELP {} {}", self.name, self.help)?;
        writeln!(f, "{} {}", self.name, self.get())?;
        write!(f, "{}_peak {}", self.name, self.peak())
    }
}
