use serde::{Deserialize, Serialize};

use crate::constants::{
    IN_COUNT_THRESHOLD, IN_TIME_WINDOW_SECS, OUT_MISS_THRESHOLD, OUT_TIMEOUT_SECS,
    PENDING_OUT_MISS_THRESHOLD, SIGNAL_HISTORY_LEN, SIGNAL_THRESHOLD_DBM,
};
use crate::error::{CoreError, CoreResult};

/// Hysteresis thresholds for the presence state machine.
///
/// Deserializes from the `[debounce]` table of `dock.toml`; omitted keys
/// keep their defaults.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DebounceConfig {
    pub signal_threshold_dbm: i32,
    pub in_count_threshold: u32,
    pub in_time_window_secs: u64,
    pub out_miss_threshold: u32,
    pub out_timeout_secs: u64,
    pub pending_out_miss_threshold: u32,
    pub signal_history_len: usize,
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self {
            signal_threshold_dbm: SIGNAL_THRESHOLD_DBM,
            in_count_threshold: IN_COUNT_THRESHOLD,
            in_time_window_secs: IN_TIME_WINDOW_SECS,
            out_miss_threshold: OUT_MISS_THRESHOLD,
            out_timeout_secs: OUT_TIMEOUT_SECS,
            pending_out_miss_threshold: PENDING_OUT_MISS_THRESHOLD,
            signal_history_len: SIGNAL_HISTORY_LEN,
        }
    }
}

impl DebounceConfig {
    pub fn validate(&self) -> CoreResult<()> {
        if self.in_count_threshold == 0 {
            return Err(CoreError::InvalidConfig(
                "in_count_threshold must be at least 1".to_string(),
            ));
        }
        if self.out_miss_threshold <= self.pending_out_miss_threshold {
            return Err(CoreError::InvalidConfig(format!(
                "out_miss_threshold ({}) must exceed pending_out_miss_threshold ({})",
                self.out_miss_threshold, self.pending_out_miss_threshold
            )));
        }
        if self.out_timeout_secs == 0 {
            return Err(CoreError::InvalidConfig(
                "out_timeout_secs must be positive".to_string(),
            ));
        }
        if self.signal_history_len == 0 {
            return Err(CoreError::InvalidConfig(
                "signal_history_len must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn is_valid_signal(&self, signal_dbm: i32) -> bool {
        signal_dbm >= self.signal_threshold_dbm
    }
}
