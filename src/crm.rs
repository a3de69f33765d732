//! CRM - Clock Relationship Model
//!
//! Ingests FTM timestamp quadruples and maintains a linear model relating
//! the local and remote picosecond timebases.
//!
//! The fit works on deltas from a reference sample and carries both slopes
//! in "minus one" form: near-unit ratios like 1.000002 lose their entire
//! information content to f64 rounding when stored directly, but keep nine
//! significant digits as 2e-6.

use crate::config::{CrmConfig, FtmConfig};
use crate::ftm::FtmEntry;
use crate::status::SyncStatus;
use crate::trace::CsvTrace;
use log::{info, warn};
use std::sync::{Arc, RwLock};

/// Result of a successful regression over the sample ring.
#[derive(Debug, Clone, Default)]
pub struct CrmModel {
    /// True when r_squared exceeds the configured threshold.
    pub valid: bool,
    /// Forward slope minus one: local/remote - 1 (e.g. 2e-6 = +2 ppm).
    pub slope_lr_m1: f64,
    /// Inverse slope minus one: remote/local - 1.
    pub slope_rl_m1: f64,
    /// Centroid of the fitted line, local timebase (picoseconds).
    pub local_ref_ps: i64,
    /// Centroid of the fitted line, remote timebase (picoseconds).
    pub remote_ref_ps: i64,
    pub r_squared: f64,
    pub residual_std_ns: f64,
    pub sample_count: u32,
}

pub type CrmCallback = Box<dyn Fn(&CrmModel) + Send>;

pub struct Crm {
    // Circular sample buffer, oldest overwritten once full
    local_ps: Vec<i64>,
    remote_ps: Vec<i64>,
    count: usize,
    head: usize,

    max_samples: usize,
    min_samples: usize,
    r_squared_threshold: f64,

    model: CrmModel,
    callback: Option<CrmCallback>,

    trace: Option<Arc<CsvTrace>>,
    status: Option<Arc<RwLock<SyncStatus>>>,
}

impl Crm {
    pub fn new(crm_cfg: &CrmConfig, ftm_cfg: &FtmConfig) -> Self {
        let max = ftm_cfg.max_samples();
        Crm {
            local_ps: vec![0; max],
            remote_ps: vec![0; max],
            count: 0,
            head: 0,
            max_samples: max,
            min_samples: ftm_cfg.min_samples(),
            r_squared_threshold: crm_cfg.r_squared_threshold,
            model: CrmModel::default(),
            callback: None,
            trace: None,
            status: None,
        }
    }

    pub fn set_trace(&mut self, trace: Arc<CsvTrace>) {
        self.trace = Some(trace);
    }

    pub fn set_status(&mut self, status: Arc<RwLock<SyncStatus>>) {
        self.status = Some(status);
    }

    /// Register the model-update callback. Invoked synchronously from the
    /// caller's context after each successful regression.
    pub fn register_callback(&mut self, callback: CrmCallback) {
        info!("CRM callback registered");
        self.callback = Some(callback);
    }

    /// Snapshot of the current model.
    pub fn model(&self) -> CrmModel {
        self.model.clone()
    }

    /// Ingest one FTM report worth of unwrapped entries, then refit.
    ///
    /// Each entry contributes the pair (local at t2, remote at t2) where the
    /// remote instant is reconstructed from the round trip:
    /// rtt = (t4 - t1) - (t3 - t2), remote_at_t2 = t1 + rtt/2.
    pub fn process_ftm_report(&mut self, session_number: u32, entries: &[FtmEntry]) {
        if entries.is_empty() {
            warn!("FTM report {} carried no entries", session_number);
            return;
        }

        for e in entries {
            let rtt_ps = (e.t4_ps - e.t1_ps) - (e.t3_ps - e.t2_ps);
            let local_at_t2_ps = e.t2_ps;
            let remote_at_t2_ps = e.t1_ps + rtt_ps / 2;
            self.add_sample(local_at_t2_ps, remote_at_t2_ps);
        }

        if !self.perform_regression() {
            return;
        }

        if let Some(trace) = &self.trace {
            trace.regr(
                entries.len() as u8,
                session_number,
                self.model.sample_count,
                self.model.slope_lr_m1,
                self.model.residual_std_ns,
                self.model.r_squared,
                self.model.local_ref_ps,
                self.model.remote_ref_ps,
            );
        }

        info!(
            "Regression: samples={} (+{}), r_sq={:.6}, std={:.3} ns, ppm_lr_m1={:.6}, ppm_rl_m1={:.6}",
            self.model.sample_count,
            entries.len(),
            self.model.r_squared,
            self.model.residual_std_ns,
            self.model.slope_lr_m1 * 1e6,
            self.model.slope_rl_m1 * 1e6,
        );

        self.update_shared_status();

        if let Some(cb) = &self.callback {
            cb(&self.model);
        }
    }

    fn add_sample(&mut self, local_ps: i64, remote_ps: i64) {
        if self.count < self.max_samples {
            self.local_ps[self.count] = local_ps;
            self.remote_ps[self.count] = remote_ps;
            self.count += 1;
        } else {
            // Overwrite oldest; count stays pinned at max_samples
            self.local_ps[self.head] = local_ps;
            self.remote_ps[self.head] = remote_ps;
            self.head = (self.head + 1) % self.max_samples;
        }
    }

    /// Least-squares fit of local on remote. Returns false (leaving the
    /// previous model in place) when the ring is under-populated or the
    /// input is degenerate.
    fn perform_regression(&mut self) -> bool {
        if self.count < self.min_samples {
            warn!("Insufficient samples for regression: {}", self.count);
            return false;
        }

        let n = self.count;

        // Deltas from the first sample keep the sums small enough for f64
        let ref_x = self.remote_ps[0];
        let ref_y = self.local_ps[0];

        let mut sum_dx = 0.0;
        let mut sum_dy = 0.0;
        for i in 0..n {
            sum_dx += (self.remote_ps[i] - ref_x) as f64;
            sum_dy += (self.local_ps[i] - ref_y) as f64;
        }
        let mean_dx = sum_dx / n as f64;
        let mean_dy = sum_dy / n as f64;
        let mean_x = ref_x as f64 + mean_dx;
        let mean_y = ref_y as f64 + mean_dy;

        let mut num = 0.0;
        let mut den = 0.0;
        for i in 0..n {
            let dx = self.remote_ps[i] as f64 - mean_x;
            let dy = self.local_ps[i] as f64 - mean_y;
            num += dx * dy;
            den += dx * dx;
        }

        if den == 0.0 || num == 0.0 {
            warn!("Regression degenerate: num={}, den={}", num, den);
            return false;
        }

        let slope_lr_m1 = (num - den) / den;
        let slope_rl_m1 = (den - num) / num;

        // Centroid lies on the fitted line; truncation toward zero
        let local_ref_ps = mean_y as i64;
        let remote_ref_ps = mean_x as i64;

        let mut ss_res = 0.0;
        let mut ss_tot = 0.0;
        for i in 0..n {
            let delta_remote = self.remote_ps[i] as f64 - remote_ref_ps as f64;
            let y_pred = local_ref_ps as f64 + delta_remote + delta_remote * slope_lr_m1;
            let residual = self.local_ps[i] as f64 - y_pred;
            ss_res += residual * residual;
            let dy = self.local_ps[i] as f64 - mean_y;
            ss_tot += dy * dy;
        }

        let r_squared = if ss_tot > 0.0 { 1.0 - ss_res / ss_tot } else { 0.0 };
        let residual_std_ns = (ss_res / n as f64).sqrt() / 1e3;

        self.model = CrmModel {
            valid: r_squared > self.r_squared_threshold,
            slope_lr_m1,
            slope_rl_m1,
            local_ref_ps,
            remote_ref_ps,
            r_squared,
            residual_std_ns,
            sample_count: n as u32,
        };

        true
    }

    fn update_shared_status(&self) {
        if let Some(status) = &self.status {
            if let Ok(mut s) = status.write() {
                s.model_valid = self.model.valid;
                s.slope_ppm = self.model.slope_lr_m1 * 1e6;
                s.r_squared = self.model.r_squared;
                s.residual_std_ns = self.model.residual_std_ns;
                s.regression_samples = self.model.sample_count;
            }
        }
    }

    #[cfg(test)]
    fn samples(&self) -> Vec<(i64, i64)> {
        (0..self.count)
            .map(|i| (self.local_ps[i], self.remote_ps[i]))
            .collect()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SystemConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn new_crm() -> Crm {
        let cfg = SystemConfig::default();
        Crm::new(&cfg.crm, &cfg.ftm)
    }

    /// Build an entry contributing exactly (local, remote): zero turnaround
    /// and zero round trip collapse the derivation to (t2, t1).
    fn entry(local_ps: i64, remote_ps: i64) -> FtmEntry {
        FtmEntry {
            t1_ps: remote_ps,
            t2_ps: local_ps,
            t3_ps: local_ps,
            t4_ps: remote_ps,
        }
    }

    fn line_entries(n: usize, slope: f64, offset_ps: i64) -> Vec<FtmEntry> {
        (0..n)
            .map(|i| {
                let remote = 1_000_000_000_000i64 + i as i64 * 1_000_000_000;
                let local = (remote as f64 * slope) as i64 + offset_ps;
                entry(local, remote)
            })
            .collect()
    }

    #[test]
    fn test_rtt_sample_derivation() {
        let mut crm = new_crm();
        // t1=100, t2=1040, t3=1240, t4=500: rtt = 400 - 200 = 200
        crm.process_ftm_report(
            0,
            &[FtmEntry {
                t1_ps: 100,
                t2_ps: 1040,
                t3_ps: 1240,
                t4_ps: 500,
            }],
        );
        assert_eq!(crm.samples(), vec![(1040, 200)]);
    }

    #[test]
    fn test_exact_line_recovery() {
        let mut crm = new_crm();
        crm.process_ftm_report(1, &line_entries(32, 1.000002, 5_000_000_000));

        let model = crm.model();
        assert!(model.valid);
        assert!(
            (model.slope_lr_m1 - 2e-6).abs() < 1e-9,
            "slope_lr_m1 = {}",
            model.slope_lr_m1
        );
        assert!(model.r_squared > 0.9999);
        assert_eq!(model.sample_count, 32);
    }

    #[test]
    fn test_symmetric_inverse_slope() {
        let mut crm = new_crm();
        crm.process_ftm_report(1, &line_entries(32, 1.000002, 0));

        let model = crm.model();
        let product = (1.0 + model.slope_lr_m1) * (1.0 + model.slope_rl_m1);
        assert!((product - 1.0).abs() < 1e-12, "product = {}", product);
    }

    #[test]
    fn test_insufficient_samples_keep_prior_model() {
        let mut crm = new_crm();
        crm.process_ftm_report(1, &line_entries(31, 1.000002, 0));
        assert!(!crm.model().valid);
        assert_eq!(crm.model().sample_count, 0);
    }

    #[test]
    fn test_degenerate_input_skips_update_and_callback() {
        let mut crm = new_crm();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_cb = calls.clone();
        crm.register_callback(Box::new(move |_| {
            calls_cb.fetch_add(1, Ordering::SeqCst);
        }));

        // 32 identical points: den == 0
        let entries: Vec<FtmEntry> = (0..32).map(|_| entry(7_000, 5_000)).collect();
        crm.process_ftm_report(1, &entries);

        assert!(!crm.model().valid);
        assert_eq!(crm.model().sample_count, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_callback_invoked_on_successful_fit() {
        let mut crm = new_crm();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_cb = calls.clone();
        crm.register_callback(Box::new(move |model| {
            assert!(model.valid);
            calls_cb.fetch_add(1, Ordering::SeqCst);
        }));

        crm.process_ftm_report(1, &line_entries(64, 1.000001, 0));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_ring_keeps_most_recent_when_full() {
        let mut crm = new_crm();
        let max = SystemConfig::default().ftm.max_samples();

        // 2*max inserts; the ring must retain exactly the newest max pairs
        let all: Vec<FtmEntry> = (0..2 * max as i64)
            .map(|i| entry(1_000 + i, 2_000 + i))
            .collect();
        for chunk in all.chunks(64) {
            crm.process_ftm_report(0, chunk);
        }

        let mut kept = crm.samples();
        kept.sort();
        let expected: Vec<(i64, i64)> = (max as i64..2 * max as i64)
            .map(|i| (1_000 + i, 2_000 + i))
            .collect();
        assert_eq!(kept.len(), max);
        assert_eq!(kept, expected);
    }

    #[test]
    fn test_noisy_line_below_threshold_is_invalid() {
        let mut crm = new_crm();
        // Alternate huge residuals around a flat-ish line
        let entries: Vec<FtmEntry> = (0..64)
            .map(|i| {
                let remote = 1_000_000_000i64 + i * 1_000_000;
                let noise = if i % 2 == 0 { 500_000_000 } else { -500_000_000 };
                entry(remote + noise, remote)
            })
            .collect();
        crm.process_ftm_report(1, &entries);
        // Fit succeeds (model published) but fails the r_squared gate
        assert_eq!(crm.model().sample_count, 64);
        assert!(!crm.model().valid);
    }

    #[test]
    fn test_empty_report_ignored() {
        let mut crm = new_crm();
        crm.process_ftm_report(9, &[]);
        assert_eq!(crm.model().sample_count, 0);
    }
}
