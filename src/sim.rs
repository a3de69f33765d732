//! Simulation rig
//!
//! A software model of the radio link for the slave demo path and the
//! integration tests: a remote (master) timebase drifting against the local
//! one, and an FTM responder synthesizing timestamp quadruples with
//! Gaussian jitter over that link.

use crate::ftm::{FtmStatus, RawFtmEntry, RawFtmReport, FTM_WRAP_PS};
use crate::traits::FtmResponder;
use anyhow::Result;
use std::f64::consts::PI;

/// Link physics: how the remote clock relates to the local one.
#[derive(Debug, Clone)]
pub struct LinkModel {
    /// Remote clock rate error relative to local (remote = local * (1 + ppm/1e6)).
    pub drift_ppm: f64,
    /// Remote epoch offset (picoseconds).
    pub offset_ps: i64,
    /// One-way propagation delay (picoseconds).
    pub prop_delay_ps: i64,
    /// Slave turnaround t3 - t2 (picoseconds).
    pub turnaround_ps: i64,
    /// Gaussian timestamp jitter, one sigma (picoseconds).
    pub jitter_sigma_ps: f64,
}

impl Default for LinkModel {
    fn default() -> Self {
        LinkModel {
            drift_ppm: 2.0,
            offset_ps: 7_777_000_000_000, // remote booted ~7.8 s earlier
            prop_delay_ps: 10_000_000,    // 10 us over the air
            turnaround_ps: 30_000_000,
            jitter_sigma_ps: 100_000.0, // 100 ns
        }
    }
}

impl LinkModel {
    /// Remote clock reading at a local instant.
    pub fn remote_of(&self, local_ps: i64) -> i64 {
        self.offset_ps + local_ps + (local_ps as f64 * self.drift_ppm * 1e-6) as i64
    }
}

/// Box-Muller Gaussian sample.
fn gauss(sigma: f64) -> f64 {
    let u1: f64 = rand::random::<f64>().max(f64::MIN_POSITIVE);
    let u2: f64 = rand::random();
    (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos() * sigma
}

/// Synthetic FTM responder over a simulated link.
///
/// `local_now_ps` supplies the slave's current MAC picosecond time so the
/// generated t2/t3 stamps live in the same timebase the rest of the
/// pipeline measures against.
pub struct SimFtmResponder {
    link: LinkModel,
    local_now_ps: Box<dyn Fn() -> i64 + Send>,
    frame_spacing_ps: i64,
    session: u32,
    /// Every Nth session reports a timeout instead of data (0 disables).
    fail_every: u32,
}

impl SimFtmResponder {
    pub fn new(link: LinkModel, local_now_ps: Box<dyn Fn() -> i64 + Send>) -> Self {
        SimFtmResponder {
            link,
            local_now_ps,
            frame_spacing_ps: 5_000_000_000, // 5 ms between frames
            session: 0,
            fail_every: 0,
        }
    }

    pub fn with_failures(mut self, fail_every: u32) -> Self {
        self.fail_every = fail_every;
        self
    }
}

impl FtmResponder for SimFtmResponder {
    fn run_session(&mut self, frames: u8) -> Result<RawFtmReport> {
        self.session += 1;

        if self.fail_every > 0 && self.session % self.fail_every == 0 {
            return Ok(RawFtmReport {
                session_number: self.session,
                status: FtmStatus::Timeout,
                entries: Vec::new(),
            });
        }

        let base_ps = (self.local_now_ps)();
        let entries = (0..frames)
            .map(|i| {
                let t2 = base_ps + i as i64 * self.frame_spacing_ps;
                let t3 = t2 + self.link.turnaround_ps;
                let t1 = self.link.remote_of(t2)
                    - self.link.prop_delay_ps
                    - gauss(self.link.jitter_sigma_ps) as i64;
                let t4 = self.link.remote_of(t3)
                    + self.link.prop_delay_ps
                    + gauss(self.link.jitter_sigma_ps) as i64;
                RawFtmEntry {
                    t1_ps: t1 as u64 % FTM_WRAP_PS,
                    t2_ps: t2 as u64 % FTM_WRAP_PS,
                    t3_ps: t3 as u64 % FTM_WRAP_PS,
                    t4_ps: t4 as u64 % FTM_WRAP_PS,
                }
            })
            .collect();

        Ok(RawFtmReport {
            session_number: self.session,
            status: FtmStatus::Success,
            entries,
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::Arc;

    fn responder(link: LinkModel) -> SimFtmResponder {
        let now = Arc::new(AtomicI64::new(1_000_000_000_000));
        SimFtmResponder::new(
            link,
            Box::new(move || now.fetch_add(1_000_000_000_000, Ordering::SeqCst)),
        )
    }

    #[test]
    fn test_quadruples_encode_link_geometry() {
        let link = LinkModel {
            jitter_sigma_ps: 0.0,
            ..LinkModel::default()
        };
        let mut sim = responder(link.clone());
        let report = sim.run_session(4).unwrap();
        assert_eq!(report.status, FtmStatus::Success);
        assert_eq!(report.entries.len(), 4);

        for e in &report.entries {
            let (t1, t2, t3, t4) = (
                e.t1_ps as i64,
                e.t2_ps as i64,
                e.t3_ps as i64,
                e.t4_ps as i64,
            );
            // Noise-free link: rtt recovers twice the propagation delay up
            // to the drift accrued over the turnaround (~60 ps at 2 ppm)
            let rtt = (t4 - t1) - (t3 - t2);
            assert!(
                (rtt - 2 * link.prop_delay_ps).abs() <= 100,
                "rtt {} vs {}",
                rtt,
                2 * link.prop_delay_ps
            );
            // And the derived remote instant matches the link model
            assert!((t1 + rtt / 2 - link.remote_of(t2)).abs() <= 100);
        }
    }

    #[test]
    fn test_failure_injection_cadence() {
        let mut sim = responder(LinkModel::default()).with_failures(3);
        let statuses: Vec<FtmStatus> = (0..6)
            .map(|_| sim.run_session(8).unwrap().status)
            .collect();
        assert_eq!(
            statuses,
            vec![
                FtmStatus::Success,
                FtmStatus::Success,
                FtmStatus::Timeout,
                FtmStatus::Success,
                FtmStatus::Success,
                FtmStatus::Timeout,
            ]
        );
    }
}
