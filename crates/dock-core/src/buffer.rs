//! Per-(organization, tag, location) hysteresis state.
//!
//! A buffer walks `TRACKING → CONFIRMED_IN → PENDING_OUT → CONFIRMED_OUT`,
//! with `PENDING_OUT → CONFIRMED_IN` as the recovery edge. A valid sighting
//! of a `CONFIRMED_OUT` buffer starts a new episode back in `TRACKING`.
//!
//! Movement events are produced only by status transitions, never by raw
//! readings, so replaying a snapshot against an already-confirmed buffer
//! cannot emit a duplicate. Each episode yields at most one `IN` and at most
//! one `OUT`.

use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::DebounceConfig;
use crate::error::{CoreError, CoreResult};
use crate::movement::MovementAction;
use crate::snapshot::{Reading, ScanOrigin, SourceKind};
use crate::time::elapsed_secs;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BufferKey {
    pub organization_id: String,
    pub tag_id: String,
    pub location_id: String,
}

impl BufferKey {
    pub fn new(
        organization_id: impl Into<String>,
        tag_id: impl Into<String>,
        location_id: impl Into<String>,
    ) -> Self {
        Self {
            organization_id: organization_id.into(),
            tag_id: tag_id.into(),
            location_id: location_id.into(),
        }
    }
}

impl fmt::Display for BufferKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.organization_id, self.tag_id, self.location_id)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BufferStatus {
    Tracking,
    ConfirmedIn,
    PendingOut,
    ConfirmedOut,
}

impl BufferStatus {
    pub const ALL: [BufferStatus; 4] = [
        BufferStatus::Tracking,
        BufferStatus::ConfirmedIn,
        BufferStatus::PendingOut,
        BufferStatus::ConfirmedOut,
    ];

    /// Statuses the missed pass visits.
    pub const ACTIVE: [BufferStatus; 3] = [
        BufferStatus::Tracking,
        BufferStatus::ConfirmedIn,
        BufferStatus::PendingOut,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            BufferStatus::Tracking => "TRACKING",
            BufferStatus::ConfirmedIn => "CONFIRMED_IN",
            BufferStatus::PendingOut => "PENDING_OUT",
            BufferStatus::ConfirmedOut => "CONFIRMED_OUT",
        }
    }

    /// The tag counts as currently at the location.
    pub fn is_present(self) -> bool {
        matches!(self, BufferStatus::ConfirmedIn | BufferStatus::PendingOut)
    }

    pub fn is_active(self) -> bool {
        self != BufferStatus::ConfirmedOut
    }
}

impl fmt::Display for BufferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for BufferStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> CoreResult<Self> {
        BufferStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| CoreError::UnknownVariant {
                kind: "buffer status",
                value: s.to_string(),
            })
    }
}

/// A status change that must be recorded in the ledger.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Transition {
    pub action: MovementAction,
    pub at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PresenceBuffer {
    pub key: BufferKey,
    pub location_name: String,
    /// Consecutive valid readings in the current episode.
    pub seen_count: u32,
    /// Consecutive snapshots at this location that did not include the tag.
    pub missed_count: u32,
    pub total_scans: u64,
    pub last_signal_dbm: Option<i32>,
    pub signal_history: VecDeque<i32>,
    pub average_signal: f64,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub last_scan_at: DateTime<Utc>,
    pub status: BufferStatus,
    pub confirmed_in_at: Option<DateTime<Utc>>,
    pub confirmed_out_at: Option<DateTime<Utc>>,
    pub source_id: String,
    pub source_kind: SourceKind,
}

impl PresenceBuffer {
    /// A fresh `TRACKING` buffer with no readings applied yet.
    pub fn new(key: BufferKey, origin: &ScanOrigin) -> Self {
        let at = origin.captured_at;
        Self {
            key,
            location_name: origin.location_name.clone(),
            seen_count: 0,
            missed_count: 0,
            total_scans: 0,
            last_signal_dbm: None,
            signal_history: VecDeque::new(),
            average_signal: 0.0,
            first_seen_at: at,
            last_seen_at: at,
            last_scan_at: at,
            status: BufferStatus::Tracking,
            confirmed_in_at: None,
            confirmed_out_at: None,
            source_id: origin.source_id.clone(),
            source_kind: origin.source_kind,
        }
    }

    pub fn is_present(&self) -> bool {
        self.status.is_present()
    }

    /// Seconds since the last valid reading, as of `at`.
    pub fn silence_secs(&self, at: DateTime<Utc>) -> u64 {
        elapsed_secs(self.last_seen_at, at)
    }

    /// Whether the current episode's first sighting is still inside the
    /// entry window. Informational only; confirmation does not depend on it.
    pub fn within_entry_window(&self, at: DateTime<Utc>, config: &DebounceConfig) -> bool {
        elapsed_secs(self.first_seen_at, at) <= config.in_time_window_secs
    }

    fn push_signal(&mut self, signal_dbm: i32, capacity: usize) {
        self.signal_history.push_back(signal_dbm);
        while self.signal_history.len() > capacity {
            self.signal_history.pop_front();
        }
        let sum: i64 = self.signal_history.iter().map(|s| *s as i64).sum();
        self.average_signal = sum as f64 / self.signal_history.len() as f64;
        self.last_signal_dbm = Some(signal_dbm);
    }

    /// Seen pass: apply one reading of this tag from a snapshot.
    ///
    /// Returns the `IN` transition when this reading confirms entry.
    pub fn observe_sighting(
        &mut self,
        reading: &Reading,
        origin: &ScanOrigin,
        config: &DebounceConfig,
    ) -> Option<Transition> {
        let at = origin.captured_at;
        // A late redelivery from before the confirmed exit must not reopen
        // the episode.
        let before_exit = self.status == BufferStatus::ConfirmedOut
            && self.confirmed_out_at.is_some_and(|out| at <= out);
        let valid = config.is_valid_signal(reading.signal_dbm) && !before_exit;

        self.push_signal(reading.signal_dbm, config.signal_history_len);
        self.total_scans += 1;
        self.last_scan_at = self.last_scan_at.max(at);
        self.location_name.clone_from(&origin.location_name);
        self.source_id.clone_from(&origin.source_id);
        self.source_kind = origin.source_kind;

        if valid {
            if self.status == BufferStatus::ConfirmedOut {
                // Reappearance after a confirmed exit opens a new episode.
                self.status = BufferStatus::Tracking;
                self.seen_count = 0;
                self.first_seen_at = at;
            }
            self.seen_count += 1;
            self.missed_count = 0;
            // Delivery is unordered; timestamps only move forward.
            self.last_seen_at = self.last_seen_at.max(at);
            if self.status == BufferStatus::PendingOut {
                self.status = BufferStatus::ConfirmedIn;
            }
        }

        if !self.status.is_present()
            && self.seen_count >= config.in_count_threshold
            && self.average_signal >= config.signal_threshold_dbm as f64
        {
            self.status = BufferStatus::ConfirmedIn;
            self.confirmed_in_at = Some(at);
            return Some(Transition {
                action: MovementAction::In,
                at,
            });
        }
        None
    }

    /// Missed pass: the tag was absent from a snapshot taken at its location.
    ///
    /// Returns the `OUT` transition when this miss confirms exit. Buffers
    /// already `CONFIRMED_OUT` are left untouched.
    pub fn observe_miss(&mut self, at: DateTime<Utc>, config: &DebounceConfig) -> Option<Transition> {
        if !self.status.is_active() {
            return None;
        }

        self.missed_count += 1;
        self.seen_count = 0;
        self.total_scans += 1;
        self.last_scan_at = self.last_scan_at.max(at);

        let silence = self.silence_secs(at);
        let exited =
            self.missed_count >= config.out_miss_threshold || silence >= config.out_timeout_secs;

        if exited && self.status.is_present() {
            self.status = BufferStatus::ConfirmedOut;
            self.confirmed_out_at = Some(at);
            return Some(Transition {
                action: MovementAction::Out,
                at,
            });
        }

        if self.status == BufferStatus::ConfirmedIn
            && self.missed_count >= config.pending_out_miss_threshold
        {
            self.status = BufferStatus::PendingOut;
        }
        None
    }
}

/// Per-location buffer counts for operational visibility.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BufferSummary {
    pub tracking: u64,
    pub confirmed_in: u64,
    pub pending_out: u64,
    pub confirmed_out: u64,
    pub present: u64,
}

impl BufferSummary {
    pub fn add(&mut self, status: BufferStatus, count: u64) {
        match status {
            BufferStatus::Tracking => self.tracking += count,
            BufferStatus::ConfirmedIn => self.confirmed_in += count,
            BufferStatus::PendingOut => self.pending_out += count,
            BufferStatus::ConfirmedOut => self.confirmed_out += count,
        }
        if status.is_present() {
            self.present += count;
        }
    }
}

/// A tag that is simultaneously present at more than one location.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceConflict {
    pub organization_id: String,
    pub tag_id: String,
    pub location_ids: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::from_epoch_secs;
    use approx::assert_relative_eq;

    fn origin_at(secs: i64) -> ScanOrigin {
        ScanOrigin {
            organization_id: "org-1".into(),
            location_id: "L1".into(),
            location_name: "Dock One".into(),
            source_id: "GW1".into(),
            source_kind: SourceKind::Tracker,
            captured_at: from_epoch_secs(secs).unwrap(),
        }
    }

    fn fresh() -> PresenceBuffer {
        PresenceBuffer::new(BufferKey::new("org-1", "A1", "L1"), &origin_at(0))
    }

    fn sight(buffer: &mut PresenceBuffer, secs: i64, dbm: i32) -> Option<Transition> {
        buffer.observe_sighting(
            &Reading::new("A1", dbm),
            &origin_at(secs),
            &DebounceConfig::default(),
        )
    }

    fn miss(buffer: &mut PresenceBuffer, secs: i64) -> Option<Transition> {
        buffer.observe_miss(from_epoch_secs(secs).unwrap(), &DebounceConfig::default())
    }

    fn confirmed() -> PresenceBuffer {
        let mut b = fresh();
        sight(&mut b, 0, -70);
        sight(&mut b, 10, -70);
        assert!(sight(&mut b, 20, -70).is_some());
        b
    }

    #[test]
    fn test_status_parse_roundtrip() {
        for status in BufferStatus::ALL {
            assert_eq!(status.as_str().parse::<BufferStatus>().unwrap(), status);
        }
        assert_eq!(
            "pending_out".parse::<BufferStatus>().unwrap(),
            BufferStatus::PendingOut
        );
        assert!("GONE".parse::<BufferStatus>().is_err());
    }

    #[test]
    fn test_third_valid_sighting_confirms_in() {
        let mut b = fresh();
        assert!(sight(&mut b, 0, -70).is_none());
        assert!(sight(&mut b, 10, -70).is_none());
        let t = sight(&mut b, 20, -70).expect("third sighting confirms");
        assert_eq!(t.action, MovementAction::In);
        assert_eq!(t.at.timestamp(), 20);
        assert_eq!(b.status, BufferStatus::ConfirmedIn);
        assert_eq!(b.confirmed_in_at, Some(t.at));
        assert!(sight(&mut b, 30, -70).is_none(), "no second IN");
    }

    #[test]
    fn test_invalid_reading_neither_counts_nor_resets() {
        let mut b = fresh();
        sight(&mut b, 0, -70);
        sight(&mut b, 10, -70);
        assert!(sight(&mut b, 20, -95).is_none());
        assert_eq!(b.seen_count, 2);
        assert_eq!(b.last_seen_at.timestamp(), 10);
        assert_eq!(b.last_scan_at.timestamp(), 20);
        assert_eq!(b.total_scans, 3);
    }

    #[test]
    fn test_weak_average_blocks_confirmation() {
        let mut b = fresh();
        // Three weak-but-invalid then valid readings drag the average down.
        for secs in [0, 10, 20] {
            sight(&mut b, secs, -100);
        }
        sight(&mut b, 30, -79);
        sight(&mut b, 40, -79);
        assert!(sight(&mut b, 50, -79).is_none());
        assert!(b.average_signal < -80.0);
        assert_eq!(b.status, BufferStatus::Tracking);
    }

    #[test]
    fn test_signal_history_is_bounded() {
        let mut b = fresh();
        for i in 0..15 {
            sight(&mut b, i * 10, -60 - i as i32);
        }
        assert_eq!(b.signal_history.len(), 10);
        assert_eq!(b.signal_history.front(), Some(&-65));
        assert_eq!(b.last_signal_dbm, Some(-74));
        assert_relative_eq!(b.average_signal, -69.5);
    }

    #[test]
    fn test_miss_resets_seen_count() {
        let mut b = fresh();
        sight(&mut b, 0, -70);
        sight(&mut b, 10, -70);
        assert!(miss(&mut b, 20).is_none());
        assert_eq!(b.seen_count, 0);
        assert_eq!(b.missed_count, 1);
        assert_eq!(b.status, BufferStatus::Tracking);
    }

    #[test]
    fn test_two_misses_pending_out_without_event() {
        let mut b = confirmed();
        assert!(miss(&mut b, 30).is_none());
        assert_eq!(b.status, BufferStatus::ConfirmedIn);
        assert!(miss(&mut b, 40).is_none());
        assert_eq!(b.status, BufferStatus::PendingOut);
    }

    #[test]
    fn test_recovery_from_pending_out() {
        let mut b = confirmed();
        miss(&mut b, 30);
        miss(&mut b, 40);
        assert!(sight(&mut b, 50, -70).is_none());
        assert_eq!(b.status, BufferStatus::ConfirmedIn);
        assert_eq!(b.missed_count, 0);
    }

    #[test]
    fn test_eight_misses_confirm_out() {
        let mut b = confirmed();
        let mut out = Vec::new();
        for i in 1..=8 {
            // 5s apart so the timeout never fires first
            if let Some(t) = miss(&mut b, 20 + i * 5) {
                out.push((i, t));
            }
        }
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0, 8);
        assert_eq!(out[0].1.action, MovementAction::Out);
        assert_eq!(b.status, BufferStatus::ConfirmedOut);
        assert!(miss(&mut b, 70).is_none(), "confirmed out ignores misses");
        assert_eq!(b.missed_count, 8);
    }

    #[test]
    fn test_timeout_confirms_out_before_miss_threshold() {
        let mut b = confirmed();
        // Last valid sighting at t=20, next snapshot without the tag at t=140.
        let t = miss(&mut b, 140).expect("timeout exit");
        assert_eq!(t.action, MovementAction::Out);
        assert_eq!(b.missed_count, 1);
        assert_eq!(b.confirmed_out_at.map(|d| d.timestamp()), Some(140));
    }

    #[test]
    fn test_tracking_buffer_never_emits_out() {
        let mut b = fresh();
        sight(&mut b, 0, -70);
        for i in 1..=10 {
            assert!(miss(&mut b, i * 60).is_none());
        }
        assert_eq!(b.status, BufferStatus::Tracking);
    }

    #[test]
    fn test_reappearance_starts_new_episode() {
        let mut b = confirmed();
        miss(&mut b, 200).expect("out");
        assert!(sight(&mut b, 300, -95).is_none());
        assert_eq!(b.status, BufferStatus::ConfirmedOut, "invalid reading is not a reappearance");

        assert!(sight(&mut b, 310, -70).is_none());
        assert_eq!(b.status, BufferStatus::Tracking);
        assert_eq!(b.seen_count, 1);
        sight(&mut b, 320, -70);
        let t = sight(&mut b, 330, -70).expect("second episode IN");
        assert_eq!(t.at.timestamp(), 330);
        assert_eq!(b.status, BufferStatus::ConfirmedIn);
    }

    #[test]
    fn test_out_of_order_snapshot_does_not_underflow_silence() {
        let mut b = confirmed();
        assert_eq!(b.silence_secs(from_epoch_secs(5).unwrap()), 0);
        assert!(miss(&mut b, 5).is_none());
    }

    #[test]
    fn test_late_redelivery_does_not_rewind_last_seen() {
        let mut b = confirmed();
        sight(&mut b, 100, -70);
        assert!(sight(&mut b, 10, -70).is_none());
        assert_eq!(b.last_seen_at.timestamp(), 100);
        assert_eq!(b.last_scan_at.timestamp(), 100);

        // 35s after the real last sighting: one miss, no timeout.
        assert!(miss(&mut b, 135).is_none());
        assert_eq!(b.status, BufferStatus::ConfirmedIn);
    }

    #[test]
    fn test_late_miss_does_not_rewind_last_scan() {
        let mut b = confirmed();
        sight(&mut b, 50, -70);
        assert!(miss(&mut b, 30).is_none());
        assert_eq!(b.last_scan_at.timestamp(), 50);
    }

    #[test]
    fn test_duplicate_delivery_after_exit_stays_out() {
        let mut b = confirmed();
        let out = miss(&mut b, 200).expect("timeout confirms OUT");
        assert_eq!(out.action, MovementAction::Out);

        // redelivered pre-exit snapshots
        for secs in [20, 200] {
            assert!(sight(&mut b, secs, -70).is_none());
            assert_eq!(b.status, BufferStatus::ConfirmedOut);
            assert_eq!(b.seen_count, 0);
        }
        sight(&mut b, 201, -70);
        assert_eq!(b.status, BufferStatus::Tracking);
        assert_eq!(b.seen_count, 1);
    }

    #[test]
    fn test_entry_window() {
        let b = fresh();
        let cfg = DebounceConfig::default();
        assert!(b.within_entry_window(from_epoch_secs(60).unwrap(), &cfg));
        assert!(!b.within_entry_window(from_epoch_secs(61).unwrap(), &cfg));
    }

    #[test]
    fn test_summary_counts_present() {
        let mut s = BufferSummary::default();
        s.add(BufferStatus::Tracking, 2);
        s.add(BufferStatus::ConfirmedIn, 3);
        s.add(BufferStatus::PendingOut, 1);
        s.add(BufferStatus::ConfirmedOut, 4);
        assert_eq!(s.present, 4);
        assert_eq!(s.tracking, 2);
        assert_eq!(s.confirmed_out, 4);
    }
}
