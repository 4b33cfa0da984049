//! Monotonic event counters.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counts events since the owning component was created.
///
/// Renders as one exposition line per counter, `name value`, preceded by a
/// `# HELP` comment.
#[derive(Debug)]
pub struct Counter {
    name: &'static str,
    help: &'static str,
    total: AtomicU64,
}

impl Counter {
    pub const fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            name,
            help,
            total: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn inc(&self) {
        self.inc_by(1);
    }

    pub fn inc_by(&self, n: u64) {
        self.total.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }
}

impl fmt::Display for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "# HELP {} {}", self.name, self.help)?;
        write!(f, "{} {}", self.name, self.get())
    }
}
