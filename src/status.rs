use serde::{Deserialize, Serialize};

/// Shared sync status snapshot
///
/// Updated by the CRM after each regression and by the DTC after each
/// applied alignment; read by whatever observability surface the binary
/// wires up (periodic log line, JSON dump).
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct SyncStatus {
    /// Timer state: "not_started", "running", "aligned"
    pub timer_state: String,

    /// Last regression outcome
    pub model_valid: bool,
    pub slope_ppm: f64,
    pub r_squared: f64,
    pub residual_std_ns: f64,
    pub regression_samples: u32,

    /// Last alignment feedback
    pub cycle_counter: i64,
    pub last_cycle_delta: i32,
    pub last_period_ticks: i32,
    pub last_period_ticks_delta: i32,
    pub alignments_applied: u32,

    /// Master reboots observed on the broadcast channel (slave)
    pub master_reboots: u32,
}

impl Default for SyncStatus {
    fn default() -> Self {
        SyncStatus {
            timer_state: "not_started".to_string(),
            model_valid: false,
            slope_ppm: 0.0,
            r_squared: 0.0,
            residual_std_ns: 0.0,
            regression_samples: 0,
            cycle_counter: 0,
            last_cycle_delta: 0,
            last_period_ticks: 0,
            last_period_ticks_delta: 0,
            alignments_applied: 0,
            master_reboots: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_status_default() {
        let status = SyncStatus::default();
        assert_eq!(status.timer_state, "not_started");
        assert!(!status.model_valid);
        assert_eq!(status.alignments_applied, 0);
    }

    #[test]
    fn test_sync_status_serde_roundtrip() {
        let mut status = SyncStatus::default();
        status.timer_state = "aligned".to_string();
        status.slope_ppm = 1.75;
        status.cycle_counter = 123_456;
        status.master_reboots = 2;

        let json = serde_json::to_string(&status).expect("serialize failed");
        let restored: SyncStatus = serde_json::from_str(&json).expect("deserialize failed");

        assert_eq!(restored.timer_state, "aligned");
        assert!((restored.slope_ppm - 1.75).abs() < f64::EPSILON);
        assert_eq!(restored.cycle_counter, 123_456);
        assert_eq!(restored.master_reboots, 2);
    }
}
