//! DTC - Disciplined Timer Controller
//!
//! Task-context bridge from the CRM's linear model to a concrete hardware
//! re-alignment. On each valid model update it samples the live timer state
//! right after a TEZ, projects the local tick base into the remote timebase,
//! rounds up to the next remote-aligned cycle boundary, projects back, and
//! hands the result to the DTR as a single-slot request.

use crate::config::{CrmConfig, TimerConfig};
use crate::crm::CrmModel;
use crate::dtr::{Dtr, FP16_SCALE};
use crate::status::SyncStatus;
use crate::trace::CsvTrace;
use crate::traits::PulseTimer;
use log::{debug, error, info};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

/// A fully computed alignment, ready to publish to the DTR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlignmentPlan {
    pub cycle: i64,
    pub local_ticks: i64,
    pub base_period_fp16: i64,
}

/// Project a local tick value into the remote timebase through the model.
pub fn local_to_remote_ticks(
    local_ticks: i64,
    ref_local_ticks: i64,
    ref_remote_ticks: i64,
    slope_rl_m1: f64,
) -> i64 {
    let delta = local_ticks - ref_local_ticks;
    ref_remote_ticks + delta + (delta as f64 * slope_rl_m1).floor() as i64
}

/// Project a remote tick value into the local timebase through the model.
pub fn remote_to_local_ticks(
    remote_ticks: i64,
    ref_local_ticks: i64,
    ref_remote_ticks: i64,
    slope_lr_m1: f64,
) -> i64 {
    let delta = remote_ticks - ref_remote_ticks;
    ref_local_ticks + delta + (delta as f64 * slope_lr_m1).floor() as i64
}

/// Turn a model plus the just-sampled tick base into an alignment plan.
///
/// The +2 cycles cover the period already in progress and the one-cycle
/// shadow-register latency, guaranteeing the target lies in the future.
pub fn compute_alignment(
    model: &CrmModel,
    timer_base_ticks: i64,
    period_ticks: i64,
    ps_per_tick: i64,
    compensation_ticks: i64,
) -> AlignmentPlan {
    let ref_local_ticks = model.local_ref_ps / ps_per_tick;
    let ref_remote_ticks = model.remote_ref_ps / ps_per_tick;

    let remote_ticks = local_to_remote_ticks(
        timer_base_ticks,
        ref_local_ticks,
        ref_remote_ticks,
        model.slope_rl_m1,
    );

    let aligned_cycle = (remote_ticks + period_ticks / 2).div_euclid(period_ticks) + 2;
    let aligned_remote_ticks = aligned_cycle * period_ticks;

    let aligned_local_ticks = remote_to_local_ticks(
        aligned_remote_ticks,
        ref_local_ticks,
        ref_remote_ticks,
        model.slope_lr_m1,
    ) + compensation_ticks;

    // Steady-state period slightly off nominal to cancel the frequency offset
    let base_period_fp16 =
        (period_ticks as f64 * FP16_SCALE as f64 * (1.0 + model.slope_lr_m1)).floor() as i64;

    AlignmentPlan {
        cycle: aligned_cycle,
        local_ticks: aligned_local_ticks,
        base_period_fp16,
    }
}

pub struct Dtc<T: PulseTimer> {
    dtr: Arc<Dtr<T>>,
    period_ticks: i64,
    ps_per_tick: i64,
    compensation_ticks: i64,
    single_update: bool,
    updated_once: AtomicBool,
    listener_registered: AtomicBool,
    trace: Option<Arc<CsvTrace>>,
    status: Option<Arc<RwLock<SyncStatus>>>,
}

impl<T: PulseTimer + 'static> Dtc<T> {
    pub fn new(
        dtr: Arc<Dtr<T>>,
        timer_cfg: &TimerConfig,
        crm_cfg: &CrmConfig,
        trace: Option<Arc<CsvTrace>>,
        status: Option<Arc<RwLock<SyncStatus>>>,
    ) -> Self {
        info!("DTC initialized");
        Dtc {
            dtr,
            period_ticks: timer_cfg.period_ticks(),
            ps_per_tick: timer_cfg.ps_per_tick(),
            compensation_ticks: timer_cfg.compensation_ticks(),
            single_update: crm_cfg.single_update,
            updated_once: AtomicBool::new(false),
            listener_registered: AtomicBool::new(false),
            trace,
            status,
        }
    }

    /// CRM update callback: run the alignment protocol against the DTR.
    ///
    /// Runs in the FTM task's context. TEZ wait failures mean the timer is
    /// dead and there is no recovery path.
    pub fn on_crm_update(&self, model: &CrmModel) {
        if !model.valid {
            debug!(
                "model not valid (r_sq={:.6}), skipping alignment",
                model.r_squared
            );
            return;
        }
        if self.single_update && self.updated_once.load(Ordering::SeqCst) {
            debug!("single-update mode: alignment suppressed");
            return;
        }

        // Register once and stay registered
        if !self.listener_registered.swap(true, Ordering::SeqCst) {
            self.dtr.register_tez_listener();
        }

        // Wait out the current period so the tick base we sample is fresh
        if let Err(e) = self.dtr.wait_for_tez() {
            error!("FATAL: {}", e);
            std::process::abort();
        }
        let timer_base_ticks = self.dtr.get_timer_base_ticks();

        let plan = compute_alignment(
            model,
            timer_base_ticks,
            self.period_ticks,
            self.ps_per_tick,
            self.compensation_ticks,
        );

        self.dtr
            .set_align_request(plan.cycle, plan.local_ticks, plan.base_period_fp16);
        if let Some(trace) = &self.trace {
            trace.dtc(plan.cycle, plan.local_ticks, plan.base_period_fp16);
        }
        debug!(
            "alignment requested: cycle={}, local_ticks={}, base_period_fp16={}",
            plan.cycle, plan.local_ticks, plan.base_period_fp16
        );

        if let Err(e) = self.dtr.wait_for_tez() {
            error!("FATAL: {}", e);
            std::process::abort();
        }
        let feedback = self.dtr.grab_and_log_align_feedback();
        self.updated_once.store(true, Ordering::SeqCst);

        if let (Some(f), Some(status)) = (feedback, &self.status) {
            if let Ok(mut s) = status.write() {
                s.timer_state = "aligned".to_string();
                s.cycle_counter = f.cycle_counter;
                s.last_cycle_delta = f.cycle_delta;
                s.last_period_ticks = f.period_ticks;
                s.last_period_ticks_delta = f.period_ticks_delta;
                s.alignments_applied += 1;
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
