use anyhow::Result;

/// Raw view of the radio MAC microsecond counter.
/// Wraps modulo 2^32; unwrapping is the MacClock's job.
#[cfg_attr(test, mockall::automock)]
pub trait MacCounter: Send + Sync {
    fn raw_us(&self) -> u32;
}

/// The PWM pulse timer hardware owned by the DTR.
///
/// The timer counts up at the configured resolution and reloads from a
/// shadow period register at each TEZ. The backend invokes the handler
/// passed to `start()` at every TEZ boundary; that call plays the ISR role.
pub type TezCallback = Box<dyn Fn() + Send>;

#[cfg_attr(test, mockall::automock)]
pub trait PulseTimer: Send + Sync {
    /// Enable and start the timer. `on_tez` fires at every period boundary.
    fn start(&self, on_tez: TezCallback);

    /// Write the shadow period register (loaded by hardware at the next TEZ).
    fn set_period(&self, ticks: u16);

    /// Current counter value within the running period.
    fn count(&self) -> u32;

    /// Force the pulse output low (true) or release it to hardware control
    /// (false). Slave output stays forced until the first alignment.
    fn set_force_low(&self, force: bool);
}

/// One FTM session against the remote responder.
///
/// Returns the raw report delivered by the radio stack: wrapped picosecond
/// timestamps and a per-session status.
#[cfg_attr(test, mockall::automock)]
pub trait FtmResponder: Send {
    fn run_session(&mut self, frames: u8) -> Result<crate::ftm::RawFtmReport>;
}
