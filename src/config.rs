use serde::{Deserialize, Serialize};

/// Node role, fixed at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Master,
    Slave,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemConfig {
    pub timer: TimerConfig,
    pub ftm: FtmConfig,
    pub crm: CrmConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimerConfig {
    pub resolution_hz: u64,        // Pulse timer clock (ticks per second)
    pub period_us: u32,            // Nominal pulse period
    pub duty_percent: u32,         // GPIO pulse duty cycle
    pub compensation_ns: i64,      // Board-specific propagation-delay compensation
    pub min_period_cpu_cycles: u32, // Cycle budget for ISR + callback between TEZs
    pub cpu_freq_mhz: u32,
    pub mac_align_samples: u32,    // Iterations of the MAC/timer offset measurement
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FtmConfig {
    pub frames_per_session: u8,   // 8/16/24/32/64
    pub period_ms: u64,           // Delay between FTM sessions
    pub retry_delay_ms: u64,      // Delay after a failed session
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrmConfig {
    pub r_squared_threshold: f64, // Model is valid above this
    pub single_update: bool,      // Test mode: suppress DTC updates after the first
}

impl Default for SystemConfig {
    fn default() -> Self {
        SystemConfig {
            timer: TimerConfig {
                resolution_hz: 40_000_000, // 40 MHz, 25 ns ticks
                period_us: 500,            // 2 kHz pulse rate
                duty_percent: 5,
                compensation_ns: -200,
                min_period_cpu_cycles: 5_000,
                cpu_freq_mhz: 240,
                mac_align_samples: 100_000,
            },
            ftm: FtmConfig {
                frames_per_session: 64,
                period_ms: 1_000,
                retry_delay_ms: 1_000,
            },
            crm: CrmConfig {
                r_squared_threshold: 0.999,
                single_update: false,
            },
        }
    }
}

impl TimerConfig {
    pub fn ticks_per_us(&self) -> i64 {
        (self.resolution_hz / 1_000_000) as i64
    }

    /// Picoseconds per timer tick (25 000 at 40 MHz).
    pub fn ps_per_tick(&self) -> i64 {
        (1_000_000_000_000u64 / self.resolution_hz) as i64
    }

    pub fn period_ticks(&self) -> i64 {
        self.period_us as i64 * self.ticks_per_us()
    }

    pub fn pulse_width_ticks(&self) -> i64 {
        self.period_ticks() * self.duty_percent as i64 / 100
    }

    /// Shortest period the ISR + application callback can survive,
    /// derived from the CPU cycle budget.
    pub fn min_period_ticks(&self) -> i64 {
        (self.min_period_cpu_cycles as i64 * self.resolution_hz as i64)
            / (self.cpu_freq_mhz as i64 * 1_000_000)
    }

    pub fn compensation_ticks(&self) -> i64 {
        self.compensation_ns * self.ticks_per_us() / 1_000
    }
}

impl FtmConfig {
    pub fn max_samples(&self) -> usize {
        2 * self.frames_per_session as usize
    }

    pub fn min_samples(&self) -> usize {
        self.frames_per_session as usize / 2
    }
}

// ============================================================================
// TESTS
// ============================================================================
