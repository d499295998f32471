//! Mock time.
//!
//! Every expiry and lock deadline in the store is an absolute unix timestamp
//! in seconds, read from a [`Clock`]. The cluster clock can be shifted with
//! the `TIME_TRAVEL` control command so tests can expire items without
//! sleeping.

use std::sync::atomic::{AtomicI64, Ordering};

use serde::{Deserialize, Serialize};

/// Expiry values above this are absolute timestamps, below are relative offsets.
pub const RELATIVE_EXPIRY_LIMIT: u32 = 60 * 60 * 24 * 30;

/// Seconds since the unix epoch as seen by the mock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UnixTime(pub u32);

impl UnixTime {
    pub const fn secs(self) -> u32 {
        self.0
    }

    /// Add seconds, saturating at the end of the u32 range.
    pub const fn add_secs(self, secs: u32) -> Self {
        Self(self.0.saturating_add(secs))
    }

    /// Check if this time is at or after the given deadline.
    pub const fn is_at_or_after(self, deadline: u32) -> bool {
        self.0 >= deadline
    }
}

impl std::fmt::Display for UnixTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}s", self.0)
    }
}

// ============================================================================
// Clock Trait and Implementations
// ============================================================================

/// Source of "now" for expiry and lock evaluation.
pub trait Clock: Send + Sync {
    /// Current mock time, including any time travel offset.
    fn now(&self) -> UnixTime;

    /// Accumulated time travel offset in seconds.
    fn offset_secs(&self) -> i64;
}

/// Wall clock with an adjustable offset.
#[derive(Debug, Default)]
pub struct SystemClock {
    offset: AtomicI64,
}

impl SystemClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shift the clock by `secs` (may be negative). Offsets accumulate.
    pub fn time_travel(&self, secs: i64) {
        let total = self.offset.fetch_add(secs, Ordering::AcqRel) + secs;
        tracing::debug!(offset = total, "clock shifted");
    }
}

impl Clock for SystemClock {
    fn now(&self) -> UnixTime {
        let wall = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;
        let shifted = wall + self.offset.load(Ordering::Acquire);
        UnixTime(shifted.clamp(0, u32::MAX as i64) as u32)
    }

    fn offset_secs(&self) -> i64 {
        self.offset.load(Ordering::Acquire)
    }
}

/// Convert a wire expiry into the absolute form kept by the store.
///
/// Zero means "never". Values up to thirty days are relative to now; larger
/// values are absolute wall-clock timestamps and get the clock offset applied
/// so they stay comparable with [`Clock::now`].
pub fn convert_expiry(clock: &dyn Clock, expiry: u32) -> u32 {
    if expiry == 0 {
        return 0;
    }
    if expiry > RELATIVE_EXPIRY_LIMIT {
        let shifted = expiry as i64 + clock.offset_secs();
        return shifted.clamp(1, u32::MAX as i64) as u32;
    }
    clock.now().add_secs(expiry).secs()
}
