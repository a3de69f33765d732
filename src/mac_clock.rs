//! MAC clock
//!
//! Thread-safe 64-bit microsecond view over the 32-bit radio MAC counter.
//! The raw counter wraps every 71.6 minutes; a low-priority keep-alive
//! thread reads the clock once per hour so no wrap can slip past the
//! unwrapper between observations.

use crate::traits::MacCounter;
use crate::unwrap::Unwrapper;
use anyhow::{anyhow, Result};
use log::{info, warn};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::Duration;

const MAC_WRAP_VALUE: u64 = 1 << 32; // microseconds
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(60 * 60);
const ADVANCE_CHECK_DELAY: Duration = Duration::from_millis(2);

pub struct MacClock<C: MacCounter> {
    counter: C,
    unwrap: Mutex<Unwrapper>,
}

impl<C: MacCounter + 'static> MacClock<C> {
    /// Probe the counter and start the keep-alive thread.
    ///
    /// Reads the raw counter twice across a short delay; identical readings
    /// mean the hardware is not advancing and startup fails.
    pub fn new(counter: C) -> Result<Arc<Self>> {
        Self::with_keepalive(counter, KEEPALIVE_INTERVAL)
    }

    /// As `new`, with an explicit keep-alive interval.
    pub fn with_keepalive(counter: C, keepalive: Duration) -> Result<Arc<Self>> {
        let first = counter.raw_us();
        thread::sleep(ADVANCE_CHECK_DELAY);
        let second = counter.raw_us();
        if first == second {
            return Err(anyhow!(
                "MAC clock not advancing: {} == {} across {:?}",
                first,
                second,
                ADVANCE_CHECK_DELAY
            ));
        }

        let mut unwrap = Unwrapper::new(MAC_WRAP_VALUE);
        unwrap.apply(second as i64);

        let clock = Arc::new(MacClock {
            counter,
            unwrap: Mutex::new(unwrap),
        });

        let weak: Weak<Self> = Arc::downgrade(&clock);
        thread::Builder::new()
            .name("mac-keepalive".to_string())
            .spawn(move || loop {
                thread::sleep(keepalive);
                match weak.upgrade() {
                    Some(clock) => {
                        clock.read();
                    }
                    None => break,
                }
            })
            .map_err(|e| anyhow!("failed to spawn MAC keep-alive thread: {}", e))?;

        info!("MAC clock started at {} us", second);
        Ok(clock)
    }

    /// Unwrapped 64-bit microsecond reading.
    pub fn read(&self) -> i64 {
        let mut unwrap = match self.unwrap.lock() {
            Ok(g) => g,
            Err(poisoned) => {
                warn!("MAC clock mutex poisoned, continuing");
                poisoned.into_inner()
            }
        };
        unwrap.apply(self.counter.raw_us() as i64)
    }

    /// Snapshot of the current unwrap offset ("base"). Adding the base to a
    /// raw reading captured elsewhere recomputes its absolute value, as long
    /// as no wrap intervened.
    pub fn base(&self) -> i64 {
        let unwrap = match self.unwrap.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        unwrap.offset()
    }

    /// Raw 32-bit counter read, bypassing the unwrapper. Used by the
    /// MAC/timer offset measurement, which does its own wrap rejection.
    pub fn raw_us(&self) -> u32 {
        self.counter.raw_us()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Counter stepping through a scripted sequence, repeating the last value.
    struct ScriptedCounter {
        values: Vec<u32>,
        pos: AtomicU32,
    }

    impl ScriptedCounter {
        fn new(values: Vec<u32>) -> Self {
            ScriptedCounter {
                values,
                pos: AtomicU32::new(0),
            }
        }
    }

    impl MacCounter for ScriptedCounter {
        fn raw_us(&self) -> u32 {
            let i = self.pos.fetch_add(1, Ordering::SeqCst) as usize;
            self.values[i.min(self.values.len() - 1)]
        }
    }

    struct StuckCounter;

    impl MacCounter for StuckCounter {
        fn raw_us(&self) -> u32 {
            42
        }
    }

    #[test]
    fn test_init_fails_on_stuck_counter() {
        assert!(MacClock::new(StuckCounter).is_err());
    }

    #[test]
    fn test_read_is_unwrapped_across_wrap() {
        // Advance check consumes the first two readings
        let counter = ScriptedCounter::new(vec![100, 200, u32::MAX - 5, 10]);
        let clock = MacClock::new(counter).expect("init");
        assert_eq!(clock.read(), (u32::MAX - 5) as i64);
        // Wrap: 10 after u32::MAX-5
        assert_eq!(clock.read(), 10 + (1i64 << 32));
        assert_eq!(clock.base(), 1i64 << 32);
    }

    #[test]
    fn test_base_zero_before_first_wrap() {
        let counter = ScriptedCounter::new(vec![1, 2, 3, 4]);
        let clock = MacClock::new(counter).expect("init");
        clock.read();
        assert_eq!(clock.base(), 0);
    }

    #[test]
    fn test_keepalive_reads_often_enough() {
        // Scripted counter wraps once; the keep-alive alone must observe it
        let counter = ScriptedCounter::new(vec![5, 6, u32::MAX - 1, 3]);
        let clock =
            MacClock::with_keepalive(counter, Duration::from_millis(10)).expect("init");
        // Two keep-alive periods: both post-init readings consumed by the thread
        thread::sleep(Duration::from_millis(35));
        assert_eq!(clock.base(), 1i64 << 32);
    }
}
