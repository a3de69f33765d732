//! CSV tracing
//!
//! One line format per subsystem, header printed once when the tracer is
//! created. Meant for offline analysis of lock behavior; disabled entirely
//! when no tracer is wired in.

use std::io::Write;
use std::sync::Mutex;

pub struct CsvTrace {
    out: Mutex<Box<dyn Write + Send>>,
}

impl CsvTrace {
    /// Create a tracer and emit all header lines.
    pub fn new(mut out: Box<dyn Write + Send>) -> Self {
        let _ = writeln!(
            out,
            "REGR,count,session,samples,slope_lr_m1,resid_std_ns,r_sq,local_ref_ps,remote_ref_ps"
        );
        let _ = writeln!(out, "DTC,cycle,local_ticks,base_period_fp16");
        let _ = writeln!(out, "DTR,cycle,cycle_delta,period_ticks,period_ticks_delta");
        let _ = writeln!(
            out,
            "MAC_TIMER_ALIGN,run,offset_ticks,offset_ticks_min,offset_ticks_max"
        );
        let _ = out.flush();
        CsvTrace {
            out: Mutex::new(out),
        }
    }

    /// Tracer writing to stdout.
    pub fn stdout() -> Self {
        Self::new(Box::new(std::io::stdout()))
    }

    fn line(&self, s: String) {
        let mut out = match self.out.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        let _ = writeln!(out, "{}", s);
        let _ = out.flush();
    }

    #[allow(clippy::too_many_arguments)]
    pub fn regr(
        &self,
        count: u8,
        session: u32,
        samples: u32,
        slope_lr_m1: f64,
        resid_std_ns: f64,
        r_sq: f64,
        local_ref_ps: i64,
        remote_ref_ps: i64,
    ) {
        self.line(format!(
            "REGR,{},{},{},{:.9e},{:.3},{:.12},{},{}",
            count, session, samples, slope_lr_m1, resid_std_ns, r_sq, local_ref_ps, remote_ref_ps
        ));
    }

    pub fn dtc(&self, cycle: i64, local_ticks: i64, base_period_fp16: i64) {
        self.line(format!("DTC,{},{},{}", cycle, local_ticks, base_period_fp16));
    }

    pub fn dtr(&self, cycle: i64, cycle_delta: i32, period_ticks: i32, period_ticks_delta: i32) {
        self.line(format!(
            "DTR,{},{},{},{}",
            cycle, cycle_delta, period_ticks, period_ticks_delta
        ));
    }

    pub fn mac_timer_align(&self, run: u32, offset: i64, min: i64, max: i64) {
        self.line(format!("MAC_TIMER_ALIGN,{},{},{},{}", run, offset, min, max));
    }
}

// ============================================================================
// TESTS
// ============================================================================
