//! FTM interface
//!
//! The radio stack delivers FTM sessions as batches of four raw timestamps
//! (t1, t2, t3, t4) per frame, in picoseconds, wrapped modulo 2^48. The
//! master-side stamps (t1, t4) additionally reset early whenever the MAC
//! microsecond counter wraps, at `(2^32 * 10^6) mod 2^48` picoseconds; the
//! unwrapping below carries one dual-modulus unwrapper per timestamp column
//! across the lifetime of the link.

use crate::config::FtmConfig;
use crate::crm::Crm;
use crate::traits::FtmResponder;
use crate::unwrap::Unwrapper;
use log::{info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// Primary wrap modulus of raw FTM timestamps (picoseconds).
pub const FTM_WRAP_PS: u64 = 1 << 48;

/// Secondary modulus for t1/t4: the master timestamps reset when its MAC
/// microsecond counter wraps.
pub const FTM_WRAP2_PS: u64 = ((1u64 << 32) * 1_000_000) % (1 << 48);

/// Session outcome as reported by the radio stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FtmStatus {
    Success,
    Timeout,
    Failed,
}

/// One raw FTM frame: wrapped picosecond timestamps.
#[derive(Debug, Clone, Copy)]
pub struct RawFtmEntry {
    pub t1_ps: u64, // Master TX
    pub t2_ps: u64, // Slave RX
    pub t3_ps: u64, // Slave TX
    pub t4_ps: u64, // Master RX
}

#[derive(Debug, Clone)]
pub struct RawFtmReport {
    pub session_number: u32,
    pub status: FtmStatus,
    pub entries: Vec<RawFtmEntry>,
}

/// One unwrapped FTM frame: monotone 64-bit picoseconds.
#[derive(Debug, Clone, Copy)]
pub struct FtmEntry {
    pub t1_ps: i64,
    pub t2_ps: i64,
    pub t3_ps: i64,
    pub t4_ps: i64,
}

/// Persistent unwrap state for the four timestamp columns.
pub struct FtmTimestampUnwrapper {
    t1: Unwrapper,
    t2: Unwrapper,
    t3: Unwrapper,
    t4: Unwrapper,
}

impl FtmTimestampUnwrapper {
    pub fn new() -> Self {
        FtmTimestampUnwrapper {
            t1: Unwrapper::with_secondary(FTM_WRAP_PS, FTM_WRAP2_PS),
            t2: Unwrapper::new(FTM_WRAP_PS),
            t3: Unwrapper::new(FTM_WRAP_PS),
            t4: Unwrapper::with_secondary(FTM_WRAP_PS, FTM_WRAP2_PS),
        }
    }

    pub fn unwrap_entry(&mut self, raw: &RawFtmEntry) -> FtmEntry {
        FtmEntry {
            t1_ps: self.t1.apply(raw.t1_ps as i64),
            t2_ps: self.t2.apply(raw.t2_ps as i64),
            t3_ps: self.t3.apply(raw.t3_ps as i64),
            t4_ps: self.t4.apply(raw.t4_ps as i64),
        }
    }

    pub fn unwrap_report(&mut self, raw: &RawFtmReport) -> Vec<FtmEntry> {
        raw.entries.iter().map(|e| self.unwrap_entry(e)).collect()
    }
}

impl Default for FtmTimestampUnwrapper {
    fn default() -> Self {
        Self::new()
    }
}

/// Session loop: request sessions at the configured cadence, unwrap
/// successful reports and feed them to the CRM; log failures and retry
/// after the fixed delay. Runs until `running` clears.
pub fn run_ftm_loop<R: FtmResponder>(
    mut responder: R,
    crm: Arc<Mutex<Crm>>,
    config: &FtmConfig,
    running: &AtomicBool,
) {
    let mut unwrapper = FtmTimestampUnwrapper::new();

    while running.load(Ordering::SeqCst) {
        match responder.run_session(config.frames_per_session) {
            Ok(report) if report.status == FtmStatus::Success => {
                let entries = unwrapper.unwrap_report(&report);
                info!(
                    "FTM session {}: {} entries",
                    report.session_number,
                    entries.len()
                );
                let mut crm = match crm.lock() {
                    Ok(g) => g,
                    Err(poisoned) => poisoned.into_inner(),
                };
                crm.process_ftm_report(report.session_number, &entries);
                drop(crm);
                thread::sleep(Duration::from_millis(config.period_ms));
            }
            Ok(report) => {
                warn!(
                    "FTM session {} failed: {:?}, retrying",
                    report.session_number, report.status
                );
                thread::sleep(Duration::from_millis(config.retry_delay_ms));
            }
            Err(e) => {
                warn!("FTM session error: {}, retrying", e);
                thread::sleep(Duration::from_millis(config.retry_delay_ms));
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unwrap_plain_entries() {
        let mut u = FtmTimestampUnwrapper::new();
        let e = u.unwrap_entry(&RawFtmEntry {
            t1_ps: 1_000,
            t2_ps: 2_000,
            t3_ps: 3_000,
            t4_ps: 4_000,
        });
        assert_eq!(e.t1_ps, 1_000);
        assert_eq!(e.t4_ps, 4_000);
    }

    #[test]
    fn test_t2_uses_primary_modulus_only() {
        let mut u = FtmTimestampUnwrapper::new();
        u.unwrap_entry(&RawFtmEntry {
            t1_ps: 10,
            t2_ps: FTM_WRAP2_PS - 1, // below the secondary modulus
            t3_ps: 10,
            t4_ps: 10,
        });
        let e = u.unwrap_entry(&RawFtmEntry {
            t1_ps: 20,
            t2_ps: 5,
            t3_ps: 20,
            t4_ps: 20,
        });
        // Slave-side column wraps by the full 2^48 regardless of magnitude
        assert_eq!(e.t2_ps, 5 + (1i64 << 48));
    }

    #[test]
    fn test_t1_short_wrap_on_mac_reset() {
        let mut u = FtmTimestampUnwrapper::new();
        u.unwrap_entry(&RawFtmEntry {
            t1_ps: FTM_WRAP2_PS - 1_000,
            t2_ps: 1,
            t3_ps: 1,
            t4_ps: FTM_WRAP2_PS - 1_000,
        });
        let e = u.unwrap_entry(&RawFtmEntry {
            t1_ps: 500,
            t2_ps: 2,
            t3_ps: 2,
            t4_ps: 700,
        });
        assert_eq!(e.t1_ps, 500 + FTM_WRAP2_PS as i64);
        assert_eq!(e.t4_ps, 700 + FTM_WRAP2_PS as i64);
    }

    #[test]
    fn test_columns_unwrap_independently() {
        let mut u = FtmTimestampUnwrapper::new();
        u.unwrap_entry(&RawFtmEntry {
            t1_ps: 100,
            t2_ps: 100,
            t3_ps: 100,
            t4_ps: 100,
        });
        let e = u.unwrap_entry(&RawFtmEntry {
            t1_ps: 200, // no wrap
            t2_ps: 50,  // wrap
            t3_ps: 300, // no wrap
            t4_ps: 150, // no wrap
        });
        assert_eq!(e.t1_ps, 200);
        assert_eq!(e.t2_ps, 50 + (1i64 << 48));
        assert_eq!(e.t3_ps, 300);
        assert_eq!(e.t4_ps, 150);
    }
}
