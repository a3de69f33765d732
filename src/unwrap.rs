//! Counter unwrapping
//!
//! Extends a modulo-N hardware counter into a monotone 64-bit value by
//! tracking a cumulative offset across wraps. Used for the 32-bit MAC
//! microsecond counter and for the 48-bit FTM picosecond timestamps.
//!
//! An optional secondary modulus handles counters that occasionally reset
//! early: when the previous observation was still below `wrap_value2`, a
//! backwards step is attributed to the short modulus instead of the full one.

use log::debug;

/// Stateful modulo-N → monotone 64-bit counter extension.
#[derive(Debug, Clone)]
pub struct Unwrapper {
    last_val: i64,
    offset: i64,
    wrap_count: u64,
    wrap_value: u64,
    wrap_value2: u64,
}

impl Unwrapper {
    /// Create an unwrapper with a single wrap modulus.
    pub fn new(wrap_value: u64) -> Self {
        Unwrapper::with_secondary(wrap_value, 0)
    }

    /// Create an unwrapper with a primary and a secondary wrap modulus.
    /// `wrap_value2 == 0` disables the secondary modulus.
    pub fn with_secondary(wrap_value: u64, wrap_value2: u64) -> Self {
        Unwrapper {
            last_val: 0,
            offset: 0,
            wrap_count: 0,
            wrap_value,
            wrap_value2,
        }
    }

    /// Feed one raw observation, returning the unwrapped value.
    ///
    /// A raw value strictly below the previous one registers a wrap. The
    /// `last_val == 0` sentinel disables wrap detection on the first call.
    pub fn apply(&mut self, raw: i64) -> i64 {
        if self.last_val != 0 && raw < self.last_val {
            // Short wrap: previous value never reached the secondary modulus
            if self.wrap_value2 > 0 && self.last_val < self.wrap_value2 as i64 {
                self.offset += self.wrap_value2 as i64;
            } else {
                self.offset += self.wrap_value as i64;
            }
            self.wrap_count += 1;
            debug!(
                "wrap #{}: raw {} < last {}, offset now {}",
                self.wrap_count, raw, self.last_val, self.offset
            );
        }
        self.last_val = raw;
        raw + self.offset
    }

    /// Cumulative offset added to raw observations so far.
    pub fn offset(&self) -> i64 {
        self.offset
    }

    /// Number of wraps registered so far.
    pub fn wrap_count(&self) -> u64 {
        self.wrap_count
    }
}

// ============================================================================
// TESTS
// ============================================================================
