/// Minimum received signal strength (dBm) for a reading to count as valid.
pub const SIGNAL_THRESHOLD_DBM: i32 = -80;

/// Consecutive valid readings required to confirm entry.
pub const IN_COUNT_THRESHOLD: u32 = 3;

/// Window the entry readings are expected to fall within (informational).
pub const IN_TIME_WINDOW_SECS: u64 = 60;

/// Consecutive misses required to confirm exit.
pub const OUT_MISS_THRESHOLD: u32 = 8;

/// Silence since the last valid reading that alone confirms exit.
pub const OUT_TIMEOUT_SECS: u64 = 120;

/// Misses after which a confirmed tag is flagged as pending exit.
pub const PENDING_OUT_MISS_THRESHOLD: u32 = 2;

/// Ring buffer length for per-buffer signal history.
pub const SIGNAL_HISTORY_LEN: usize = 10;

/// Default row limit for ledger reads.
pub const DEFAULT_QUERY_LIMIT: usize = 50;
