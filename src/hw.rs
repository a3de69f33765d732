//! Host hardware backends
//!
//! Software stand-ins for the radio MAC counter and the PWM pulse timer,
//! both derived from the host monotonic clock. The thread-driven timer
//! honors the shadow-register semantics the DTR depends on: the period
//! written during a TEZ only takes effect at the following boundary, and
//! the first TEZ fires immediately on start.

use crate::traits::{MacCounter, PulseTimer};
use log::{debug, warn};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// MAC microsecond counter backed by the host monotonic clock.
pub struct InstantMacCounter {
    epoch: Instant,
}

impl InstantMacCounter {
    pub fn new() -> Self {
        InstantMacCounter {
            epoch: Instant::now(),
        }
    }
}

impl Default for InstantMacCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl MacCounter for InstantMacCounter {
    fn raw_us(&self) -> u32 {
        // Truncation to u32 reproduces the hardware wrap
        self.epoch.elapsed().as_micros() as u32
    }
}

/// Pulse timer driven by a dedicated thread.
pub struct ThreadPulseTimer {
    resolution_hz: u64,
    shadow: Arc<AtomicU16>,
    force_low: Arc<AtomicBool>,
    period_start_ns: Arc<AtomicU64>,
    stop: Arc<AtomicBool>,
    epoch: Instant,
}

impl ThreadPulseTimer {
    pub fn new(resolution_hz: u64, initial_period: u16) -> Self {
        ThreadPulseTimer {
            resolution_hz,
            shadow: Arc::new(AtomicU16::new(initial_period)),
            force_low: Arc::new(AtomicBool::new(false)),
            period_start_ns: Arc::new(AtomicU64::new(0)),
            stop: Arc::new(AtomicBool::new(false)),
            epoch: Instant::now(),
        }
    }

    /// Shared view of the output-force flag (the "is the GPIO gated" state),
    /// for observers that outlive the move into the DTR.
    pub fn force_low_handle(&self) -> Arc<AtomicBool> {
        self.force_low.clone()
    }
}

impl PulseTimer for ThreadPulseTimer {
    fn start(&self, on_tez: Box<dyn Fn() + Send>) {
        let shadow = self.shadow.clone();
        let period_start_ns = self.period_start_ns.clone();
        let stop = self.stop.clone();
        let epoch = self.epoch;
        let resolution_hz = self.resolution_hz;

        // The counter starts now, not when the thread gets scheduled:
        // publish the first boundary before spawning so count() readers and
        // the boundary loop agree on the origin.
        let start_ns = self.epoch.elapsed().as_nanos() as u64;
        self.period_start_ns.store(start_ns, Ordering::SeqCst);

        let spawned = thread::Builder::new()
            .name("pulse-timer".to_string())
            .spawn(move || {
                // Boundaries are scheduled arithmetically, not measured from
                // sleep returns: the cumulative period sum then equals the
                // elapsed tick count exactly, like a real hardware counter.
                // First TEZ fires immediately (enable-time period is zero).
                let mut boundary = epoch + Duration::from_nanos(start_ns);
                while !stop.load(Ordering::SeqCst) {
                    // Boundary: hardware latches the shadow register, then
                    // the handler runs and programs the next shadow value
                    let active = shadow.load(Ordering::SeqCst);
                    period_start_ns.store(
                        boundary.saturating_duration_since(epoch).as_nanos() as u64,
                        Ordering::SeqCst,
                    );
                    on_tez();
                    boundary += Duration::from_nanos(
                        active as u64 * 1_000_000_000 / resolution_hz,
                    );
                    let now = Instant::now();
                    if boundary > now {
                        thread::sleep(boundary - now);
                    }
                }
                debug!("pulse timer thread exiting");
            });
        if spawned.is_err() {
            warn!("failed to spawn pulse timer thread");
        }
    }

    fn set_period(&self, ticks: u16) {
        self.shadow.store(ticks, Ordering::SeqCst);
    }

    fn count(&self) -> u32 {
        let start_ns = self.period_start_ns.load(Ordering::SeqCst);
        let now_ns = self.epoch.elapsed().as_nanos() as u64;
        let elapsed_ns = now_ns.saturating_sub(start_ns) as u128;
        (elapsed_ns * self.resolution_hz as u128 / 1_000_000_000) as u32
    }

    fn set_force_low(&self, force: bool) {
        let was = self.force_low.swap(force, Ordering::SeqCst);
        if was != force {
            debug!("pulse output {}", if force { "forced low" } else { "released" });
        }
    }
}

impl Drop for ThreadPulseTimer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

// ============================================================================
// TESTS
// ============================================================================
