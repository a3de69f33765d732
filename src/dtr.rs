//! DTR - Disciplined Timer Realtime
//!
//! Owns the pulse timer hardware and its TEZ (timer-equals-zero) event.
//! The TEZ handler advances the 64-bit cycle counter and tick base, applies
//! pending alignment requests atomically at period boundaries, dithers the
//! fractional period, publishes feedback and fires the application callback.
//!
//! The handler runs in the hardware backend's interrupt context; everything
//! it touches lives behind the core mutex (the spinlock on the original
//! hardware). Tasks talk to it through two single-slot mailboxes: the
//! alignment request (task → TEZ, `pending` handoff) and the alignment
//! feedback (TEZ → task, presence-as-`ready` handoff).

use crate::config::{Role, TimerConfig};
use crate::mac_clock::MacClock;
use crate::trace::CsvTrace;
use crate::traits::{MacCounter, PulseTimer};
use anyhow::{anyhow, Result};
use log::{error, info};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

/// 16-bit fixed-point scale for fractional periods.
pub const FP16_SCALE: i64 = 65_536;

const TEZ_WAIT_TIMEOUT: Duration = Duration::from_secs(1);
const MEASURE_YIELD_INTERVAL: u32 = 65_536;

/// Timer state machine. Advances forward only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DtrState {
    NotStarted,
    Running,
    Aligned,
}

/// How the TEZ handler applied an alignment request.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlignFeedback {
    /// cycle_counter after the alignment.
    pub cycle_counter: i64,
    /// cycle_counter - old value (normally 1 or 2).
    pub cycle_delta: i32,
    /// The jump period written to hardware.
    pub period_ticks: i32,
    /// period_ticks - old value (normally near 0).
    pub period_ticks_delta: i32,
}

#[derive(Debug, Default)]
struct AlignRequest {
    pending: bool,
    target_cycle: i64,
    target_local_ticks: i64,
    target_base_period_fp16: i64,
}

struct DtrCore {
    state: DtrState,
    cycle_counter: i64,       // -1 so the first TEZ increments to 0
    timer_base_ticks: i64,    // sum of periods that have actually elapsed
    active_period_ticks: u16, // what the hardware is currently counting
    shadow_period_ticks: u16, // what the hardware loads at the next TEZ
    period_ticks: i64,
    base_period_fp16: u32,
    period_ticks_frac_acc: i32,
    align_request: AlignRequest,
    feedback: Option<AlignFeedback>,
    tez_seq: u64,
    listener_registered: bool,
}

/// Result of the one-shot MAC/timer offset measurement.
#[derive(Debug, Clone, Copy)]
pub struct OffsetMeasurement {
    pub offset_ticks: i64,
    pub min_ticks: i64,
    pub max_ticks: i64,
    pub runs: u32,
}

pub struct Dtr<T: PulseTimer> {
    role: Role,
    hw: T,
    core: Mutex<DtrCore>,
    tez_cond: Condvar,
    app_callback: Option<Arc<dyn Fn(i64) + Send + Sync>>,
    period_ticks_nominal: i64,
    min_period_ticks: i64,
    ticks_per_us: i64,
    mac_align_samples: u32,
    trace: Option<Arc<CsvTrace>>,
}

impl<T: PulseTimer + 'static> Dtr<T> {
    /// Configure the timer core. Does not start the hardware.
    ///
    /// The application callback runs in TEZ context at every period boundary
    /// once the state reaches Aligned: it must not allocate, block or take
    /// locks held by tasks.
    pub fn new(
        role: Role,
        hw: T,
        app_callback: Option<Arc<dyn Fn(i64) + Send + Sync>>,
        cfg: &TimerConfig,
        trace: Option<Arc<CsvTrace>>,
    ) -> Arc<Self> {
        let period = cfg.period_ticks();
        info!(
            "pulse timer: {} ticks/period at {} Hz, pulse width {} ticks",
            period,
            cfg.resolution_hz,
            cfg.pulse_width_ticks()
        );

        if role == Role::Slave {
            // No pulses until the first alignment lands
            hw.set_force_low(true);
        }

        Arc::new(Dtr {
            role,
            hw,
            core: Mutex::new(DtrCore {
                state: DtrState::NotStarted,
                cycle_counter: -1,
                timer_base_ticks: 0,
                active_period_ticks: 0, // first TEZ fires immediately on enable
                shadow_period_ticks: period as u16,
                period_ticks: period,
                base_period_fp16: (period * FP16_SCALE) as u32,
                period_ticks_frac_acc: 0,
                align_request: AlignRequest::default(),
                feedback: None,
                tez_seq: 0,
                listener_registered: false,
            }),
            tez_cond: Condvar::new(),
            app_callback,
            period_ticks_nominal: period,
            min_period_ticks: cfg.min_period_ticks(),
            ticks_per_us: cfg.ticks_per_us(),
            mac_align_samples: cfg.mac_align_samples,
            trace,
        })
    }

    fn lock_core(&self) -> MutexGuard<'_, DtrCore> {
        match self.core.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// TEZ handler. Invoked by the hardware backend at every period
    /// boundary; this call is the ISR.
    pub fn handle_tez(&self) {
        let mut core = self.lock_core();

        core.cycle_counter += 1;
        // The hardware just finished a period of the active length and has
        // loaded the shadow register
        core.timer_base_ticks += core.active_period_ticks as i64;
        core.active_period_ticks = core.shadow_period_ticks;

        let mut became_aligned = false;
        if core.align_request.pending {
            let old_cycle = core.cycle_counter;
            let old_period = core.period_ticks;

            core.cycle_counter = core.align_request.target_cycle;
            core.period_ticks = core.align_request.target_local_ticks - core.timer_base_ticks;
            core.base_period_fp16 = core.align_request.target_base_period_fp16 as u32;
            core.period_ticks_frac_acc = 0;

            // Roll forward while the jump period is too short to survive the
            // ISR + callback. Creates a discontinuity in cycle numbering;
            // only happens on the initial alignment.
            while core.period_ticks < self.min_period_ticks {
                core.period_ticks += (core.base_period_fp16 as i64) / FP16_SCALE;
                core.period_ticks_frac_acc += ((core.base_period_fp16 as i64) % FP16_SCALE) as i32;
                if core.period_ticks_frac_acc as i64 >= FP16_SCALE {
                    core.period_ticks += 1;
                    core.period_ticks_frac_acc -= FP16_SCALE as i32;
                }
                core.cycle_counter += 1;
            }

            core.align_request.pending = false;
            if core.feedback.is_some() {
                error!("FATAL: alignment feedback not consumed before next request");
                std::process::abort();
            }
            core.feedback = Some(AlignFeedback {
                cycle_counter: core.cycle_counter,
                cycle_delta: (core.cycle_counter - old_cycle) as i32,
                period_ticks: core.period_ticks as i32,
                period_ticks_delta: (core.period_ticks - old_period) as i32,
            });

            if core.state == DtrState::Running {
                core.state = DtrState::Aligned;
                became_aligned = true;
            }
        } else {
            // Fractional-period dithering: carry the sub-tick remainder so
            // the long-run average period hits base_period_fp16 / 65536
            core.period_ticks = (core.base_period_fp16 as i64) / FP16_SCALE;
            core.period_ticks_frac_acc += ((core.base_period_fp16 as i64) % FP16_SCALE) as i32;
            if core.period_ticks_frac_acc as i64 >= FP16_SCALE {
                core.period_ticks += 1;
                core.period_ticks_frac_acc -= FP16_SCALE as i32;
            }
        }

        let period_ticks = core.period_ticks;
        if !(1..=65_535).contains(&period_ticks) {
            // 16-bit hardware counter; this is a programming bug
            error!("FATAL: period_ticks={} out of range [1,65535]", period_ticks);
            std::process::abort();
        }
        core.shadow_period_ticks = period_ticks as u16;
        core.tez_seq += 1;
        let notify = core.listener_registered;
        let state = core.state;
        let cycle = core.cycle_counter;
        drop(core);

        if became_aligned && self.role == Role::Slave {
            self.hw.set_force_low(false);
        }

        // Becomes active at the next TEZ (shadow register)
        self.hw.set_period(period_ticks as u16);

        if notify {
            self.tez_cond.notify_all();
        }

        if state == DtrState::Aligned {
            if let Some(cb) = &self.app_callback {
                cb(cycle);
            }
        }
    }

    /// Zero the tick base and cycle counter, enable and start the timer,
    /// then measure the MAC/timer start offset and fold it into the base.
    pub fn start_timer<C: MacCounter + 'static>(
        self: &Arc<Self>,
        mac: &MacClock<C>,
    ) -> Result<()> {
        {
            let mut core = self.lock_core();
            core.timer_base_ticks = 0;
            core.cycle_counter = -1; // first TEZ increments to 0
            core.state = DtrState::Running;
        }

        let weak = Arc::downgrade(self);
        self.hw.start(Box::new(move || {
            if let Some(dtr) = weak.upgrade() {
                dtr.handle_tez();
            }
        }));
        info!("timer started ({:?})", self.role);

        let m = self.measure_mac_timer_offset(mac)?;
        {
            let mut core = self.lock_core();
            core.timer_base_ticks += m.offset_ticks;
        }
        if let Some(trace) = &self.trace {
            trace.mac_timer_align(m.runs, m.offset_ticks, m.min_ticks, m.max_ticks);
        }
        info!(
            "MAC/timer offset: {} ticks, interval [{}, {}] over {} runs",
            m.offset_ticks, m.min_ticks, m.max_ticks, m.runs
        );
        Ok(())
    }

    /// Master only: snap the cycle numbering onto MAC-anchored period
    /// boundaries, with the nominal period (no frequency correction).
    pub fn align_master_timer(&self) -> Result<AlignFeedback> {
        self.register_tez_listener();
        self.wait_for_tez()?;

        let ticks = self.get_timer_base_ticks();
        // +2: the cycle already in progress plus the shadow-register latency
        let aligned_cycle = ticks / self.period_ticks_nominal + 2;
        let aligned_local_ticks = aligned_cycle * self.period_ticks_nominal;
        self.set_align_request(
            aligned_cycle,
            aligned_local_ticks,
            self.period_ticks_nominal * FP16_SCALE,
        );

        self.wait_for_tez()?;
        let feedback = self.grab_and_log_align_feedback();
        self.unregister_tez_listener();
        feedback.ok_or_else(|| anyhow!("master alignment produced no feedback"))
    }

    /// Publish an alignment request; consumed at the next TEZ. Clears any
    /// unconsumed feedback atomically with the publish.
    pub fn set_align_request(
        &self,
        target_cycle: i64,
        target_local_ticks: i64,
        target_base_period_fp16: i64,
    ) {
        let mut core = self.lock_core();
        core.align_request = AlignRequest {
            pending: true,
            target_cycle,
            target_local_ticks,
            target_base_period_fp16,
        };
        core.feedback = None;
    }

    /// Fetch-and-clear the alignment feedback, logging and tracing it.
    pub fn grab_and_log_align_feedback(&self) -> Option<AlignFeedback> {
        let feedback = self.lock_core().feedback.take();
        match feedback {
            Some(f) => {
                info!(
                    "alignment applied: cycle={} (delta {}), period={} ticks (delta {})",
                    f.cycle_counter, f.cycle_delta, f.period_ticks, f.period_ticks_delta
                );
                if let Some(trace) = &self.trace {
                    trace.dtr(f.cycle_counter, f.cycle_delta, f.period_ticks, f.period_ticks_delta);
                }
                Some(f)
            }
            None => None,
        }
    }

    /// Enable TEZ notifications for the (single) waiter.
    pub fn register_tez_listener(&self) {
        self.lock_core().listener_registered = true;
    }

    pub fn unregister_tez_listener(&self) {
        self.lock_core().listener_registered = false;
    }

    /// Block until the next TEZ. Notifications delivered before the call
    /// are stale and ignored. Timing out means the timer died; callers
    /// treat this as fatal.
    pub fn wait_for_tez(&self) -> Result<()> {
        let deadline = Instant::now() + TEZ_WAIT_TIMEOUT;
        let mut core = self.lock_core();
        let seen = core.tez_seq;
        while core.tez_seq == seen {
            let now = Instant::now();
            if now >= deadline {
                return Err(anyhow!("timed out waiting for TEZ ({:?})", TEZ_WAIT_TIMEOUT));
            }
            core = match self.tez_cond.wait_timeout(core, deadline - now) {
                Ok((g, _)) => g,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        Ok(())
    }

    pub fn get_timer_base_ticks(&self) -> i64 {
        self.lock_core().timer_base_ticks
    }

    pub fn state(&self) -> DtrState {
        self.lock_core().state
    }

    pub fn cycle_counter(&self) -> i64 {
        self.lock_core().cycle_counter
    }

    /// Relate "ticks since timer start" to "MAC microseconds since MAC
    /// start" by bracketing a microsecond boundary between two counter
    /// reads, narrowing a [min, max] tick interval across iterations.
    ///
    /// Iterations where either counter wrapped are discarded; holding the
    /// core lock keeps TEZ processing out of the sampling window, so a
    /// backwards step is the only wrap signature.
    pub fn measure_mac_timer_offset<C: MacCounter + 'static>(
        &self,
        mac: &MacClock<C>,
    ) -> Result<OffsetMeasurement> {
        let mut min = i64::MIN;
        let mut max = i64::MAX;
        let mut runs = 0u32;
        let mut prev_base = i64::MIN;
        let mut prev_post_timer = i64::MIN;

        for i in 0..self.mac_align_samples {
            if i % MEASURE_YIELD_INTERVAL == 0 {
                thread::yield_now();
            }

            // Pre-samples outside the critical section let a pending TEZ drain
            let pre_timer = self.hw.count() as i64;
            let pre_mac = mac.raw_us() as i64;
            let mac_base = mac.base();

            let core = self.lock_core();
            let base_snapshot = core.timer_base_ticks;

            // Bracket a 1 us boundary of the MAC counter
            let (timer_before, mac_first, mac_after, timer_after) = loop {
                let t0 = self.hw.count() as i64;
                let m0 = mac.raw_us() as i64;
                let m1 = mac.raw_us() as i64;
                let t1 = self.hw.count() as i64;
                if m0 != m1 {
                    break (t0, m0, m1, t1);
                }
            };

            let post_timer = self.hw.count() as i64;
            let post_mac = mac.raw_us() as i64;
            drop(core);

            // A timer reset whose bookkeeping has not landed yet makes the
            // tick base stale; discard until the base moves
            let reset_pending = base_snapshot == prev_base && pre_timer < prev_post_timer;
            prev_base = base_snapshot;
            prev_post_timer = post_timer;
            if reset_pending {
                continue;
            }

            // Counter wrap anywhere in the window: discard
            if !(pre_timer <= timer_before
                && timer_before <= timer_after
                && timer_after <= post_timer)
            {
                continue;
            }
            if !(pre_mac <= mac_first && mac_first <= mac_after && mac_after <= post_mac) {
                continue;
            }

            let timer_abs_before = base_snapshot + timer_before;
            let timer_abs_after = base_snapshot + timer_after;
            let mac_at_transition_ticks = (mac_base + mac_after) * self.ticks_per_us;

            min = min.max(mac_at_transition_ticks - timer_abs_after);
            max = max.min(mac_at_transition_ticks - timer_abs_before);
            assert!(min <= max, "offset interval collapsed: [{}, {}]", min, max);
            assert!(timer_abs_after < mac_at_transition_ticks);
            runs += 1;
        }

        if runs == 0 {
            return Err(anyhow!("MAC/timer offset measurement rejected every sample"));
        }
        Ok(OffsetMeasurement {
            offset_ticks: (min + max) / 2,
            min_ticks: min,
            max_ticks: max,
            runs,
        })
    }

    #[cfg(test)]
    pub(crate) fn debug_period_ticks(&self) -> i64 {
        self.lock_core().period_ticks
    }
}

// ============================================================================
// TESTS
// ============================================================================
