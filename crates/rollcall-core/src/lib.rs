//! rollcall-core — Attendance domain logic.
//!
//! Face embedding matching, geofence math, and the daily attendance
//! ledger. Pure logic with no I/O; persistence and transport live in
//! rollcalld.

pub mod geo;
pub mod ledger;
pub mod types;

pub use geo::{distance_meters, Geofence, GeofenceDecision};
pub use ledger::{
    AttendanceRecord, AttendanceStatus, DayState, LedgerError, ScanTransition,
    DEFAULT_LATE_THRESHOLD_HOUR,
};
pub use types::{
    Embedding, EnrolledFace, EuclideanMatcher, MatchError, MatchResult, Matcher, EMBEDDING_DIM,
};
