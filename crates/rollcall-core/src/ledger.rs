//! Daily attendance ledger state machine.
//!
//! One record per (staff, business date). States: Absent (no record) →
//! CheckedIn (check-out unset) → CheckedOut (terminal for that date).
//! A third scan on the same day is rejected, never re-applied.

use chrono::{NaiveDate, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Check-ins strictly after this hour are classified late when no
/// administrative override is stored.
pub const DEFAULT_LATE_THRESHOLD_HOUR: u32 = 9;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("attendance already completed today")]
    AlreadyCompleted,
    #[error("attendance record has no check-in timestamp")]
    MissingCheckIn,
}

/// Attendance classification for one business day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttendanceStatus {
    Present,
    Late,
    Absent,
}

impl AttendanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttendanceStatus::Present => "present",
            AttendanceStatus::Late => "late",
            AttendanceStatus::Absent => "absent",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "present" => Some(AttendanceStatus::Present),
            "late" => Some(AttendanceStatus::Late),
            "absent" => Some(AttendanceStatus::Absent),
            _ => None,
        }
    }
}

/// Which transition a scan performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanTransition {
    CheckIn,
    CheckOut,
}

/// Ledger state for one (staff, date) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DayState {
    Absent,
    CheckedIn,
    CheckedOut,
}

/// One staff member's presence on one business day.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub id: String,
    pub staff_id: String,
    /// Denormalized at creation; later staff renames do not rewrite
    /// historical records.
    pub staff_name: String,
    pub date: NaiveDate,
    pub check_in: Option<NaiveDateTime>,
    pub check_out: Option<NaiveDateTime>,
    pub status: AttendanceStatus,
    /// Hours between check-in and check-out, two decimals, set at
    /// check-out.
    pub working_hours: Option<f64>,
}

impl AttendanceRecord {
    /// First scan of the day: open a record in state CheckedIn.
    pub fn open(
        id: String,
        staff_id: &str,
        staff_name: &str,
        now: NaiveDateTime,
        late_threshold_hour: u32,
    ) -> Self {
        Self {
            id,
            staff_id: staff_id.to_string(),
            staff_name: staff_name.to_string(),
            date: now.date(),
            check_in: Some(now),
            check_out: None,
            status: classify_check_in(now, late_threshold_hour),
            working_hours: None,
        }
    }

    /// Second scan of the day: CheckedIn → CheckedOut.
    ///
    /// CheckedOut is terminal: closing an already-closed record returns
    /// [`LedgerError::AlreadyCompleted`] and mutates nothing.
    pub fn close(&mut self, now: NaiveDateTime) -> Result<(), LedgerError> {
        if self.check_out.is_some() {
            return Err(LedgerError::AlreadyCompleted);
        }
        let check_in = self.check_in.ok_or(LedgerError::MissingCheckIn)?;
        self.check_out = Some(now);
        self.working_hours = Some(working_hours(check_in, now));
        Ok(())
    }

    pub fn day_state(&self) -> DayState {
        match (self.check_in, self.check_out) {
            (None, _) => DayState::Absent,
            (Some(_), None) => DayState::CheckedIn,
            (Some(_), Some(_)) => DayState::CheckedOut,
        }
    }
}

/// Classify a check-in against the late threshold hour.
///
/// The check-in's minute offset from midnight is compared to
/// `late_threshold_hour * 60`; strictly greater is late, exactly on the
/// threshold is present.
pub fn classify_check_in(now: NaiveDateTime, late_threshold_hour: u32) -> AttendanceStatus {
    let minutes = now.hour() * 60 + now.minute();
    if minutes > late_threshold_hour * 60 {
        AttendanceStatus::Late
    } else {
        AttendanceStatus::Present
    }
}

/// Working duration in hours, rounded to two decimals.
pub fn working_hours(check_in: NaiveDateTime, check_out: NaiveDateTime) -> f64 {
    let ms = (check_out - check_in).num_milliseconds() as f64;
    (ms / 3_600_000.0 * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 8, 26)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    #[test]
    fn test_classify_before_threshold_present() {
        assert_eq!(classify_check_in(at(8, 45), 9), AttendanceStatus::Present);
    }

    #[test]
    fn test_classify_exactly_on_threshold_present() {
        assert_eq!(classify_check_in(at(9, 0), 9), AttendanceStatus::Present);
    }

    #[test]
    fn test_classify_after_threshold_late() {
        assert_eq!(classify_check_in(at(9, 15), 9), AttendanceStatus::Late);
        assert_eq!(classify_check_in(at(9, 1), 9), AttendanceStatus::Late);
    }

    #[test]
    fn test_classify_respects_configured_threshold() {
        assert_eq!(classify_check_in(at(9, 30), 10), AttendanceStatus::Present);
        assert_eq!(classify_check_in(at(10, 1), 10), AttendanceStatus::Late);
    }

    #[test]
    fn test_working_hours_rounds_two_decimals() {
        // 09:15 → 17:00 is 7h45m.
        assert_eq!(working_hours(at(9, 15), at(17, 0)), 7.75);
        // 20 minutes = 0.333... → 0.33.
        assert_eq!(working_hours(at(9, 0), at(9, 20)), 0.33);
    }

    #[test]
    fn test_open_sets_check_in_and_status() {
        let record = AttendanceRecord::open("r1".into(), "s1", "Alice", at(9, 15), 9);
        assert_eq!(record.date, NaiveDate::from_ymd_opt(2026, 8, 26).unwrap());
        assert_eq!(record.check_in, Some(at(9, 15)));
        assert_eq!(record.check_out, None);
        assert_eq!(record.status, AttendanceStatus::Late);
        assert_eq!(record.working_hours, None);
        assert_eq!(record.day_state(), DayState::CheckedIn);
    }

    #[test]
    fn test_close_sets_check_out_and_hours() {
        let mut record = AttendanceRecord::open("r1".into(), "s1", "Alice", at(9, 15), 9);
        record.close(at(17, 0)).unwrap();
        assert_eq!(record.check_out, Some(at(17, 0)));
        assert_eq!(record.working_hours, Some(7.75));
        assert_eq!(record.day_state(), DayState::CheckedOut);
        // Status reflects the check-in, not the check-out.
        assert_eq!(record.status, AttendanceStatus::Late);
    }

    #[test]
    fn test_third_scan_rejected_and_record_untouched() {
        let mut record = AttendanceRecord::open("r1".into(), "s1", "Alice", at(9, 0), 9);
        record.close(at(17, 0)).unwrap();
        let before = record.clone();
        let err = record.close(at(18, 0)).unwrap_err();
        assert!(matches!(err, LedgerError::AlreadyCompleted));
        assert_eq!(record.check_out, before.check_out);
        assert_eq!(record.working_hours, before.working_hours);
    }

    #[test]
    fn test_close_without_check_in_is_an_error() {
        let mut record = AttendanceRecord::open("r1".into(), "s1", "Alice", at(9, 0), 9);
        record.check_in = None;
        assert!(matches!(
            record.close(at(17, 0)).unwrap_err(),
            LedgerError::MissingCheckIn
        ));
    }
}
