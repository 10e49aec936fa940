//! Ambient clock seam
//!
//! All expiry comparisons go through a single `Clock` so tests can drive
//! time deterministically instead of sleeping past real expirations.

use std::time::{SystemTime, UNIX_EPOCH};

/// Source of "current UTC time" for expiry computations.
///
/// Implementations return fractional seconds since the unix epoch, matching
/// the unit used for stored expiries and JWT `exp` claims.
pub trait Clock: Send + Sync {
    /// Current time as fractional seconds since the unix epoch.
    fn now(&self) -> f64;
}

/// Wall-clock time from the operating system. The default for both stores.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64()
    }
}
