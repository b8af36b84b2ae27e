//! Attendance orchestrator: composes the matcher, the store, and the
//! geofence into the operations exposed over D-Bus.

use crate::store::{FaceSummary, Store, StoreError};
use chrono::{Local, NaiveDate, NaiveDateTime};
use rollcall_core::{
    AttendanceRecord, AttendanceStatus, Embedding, EuclideanMatcher, Geofence, GeofenceDecision,
    MatchError, Matcher, ScanTransition,
};
use serde::Serialize;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// Read-only storage calls get this many extra attempts after a timeout.
const READ_RETRIES: u32 = 2;

const NOT_RECOGNIZED_MSG: &str = "Face not recognized. Please try again.";

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error(transparent)]
    Match(#[from] MatchError),
    #[error("office geofence is not configured")]
    GeofenceUnconfigured,
    #[error("late threshold hour must be 0-23, got {0}")]
    InvalidLateThreshold(u32),
    #[error("storage operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("another scan for the same staff is in flight, retry")]
    Conflict,
    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for ServiceError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict => ServiceError::Conflict,
            other => ServiceError::Store(other),
        }
    }
}

/// Result of one kiosk scan, serialized as-is onto the wire.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScanOutcome {
    #[serde(rename = "checkin")]
    CheckIn {
        record: AttendanceRecord,
        message: String,
    },
    #[serde(rename = "checkout")]
    CheckOut {
        record: AttendanceRecord,
        message: String,
    },
    NotRecognized { message: String },
}

/// Daemon status snapshot for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct StatusInfo {
    pub version: &'static str,
    pub enrolled_faces: u64,
    pub late_threshold_hour: u32,
    pub match_threshold: f32,
    pub geofence_configured: bool,
}

pub struct AttendanceService {
    store: Store,
    matcher: EuclideanMatcher,
    match_threshold: f32,
    geofence: Option<Geofence>,
    store_timeout: Duration,
}

impl AttendanceService {
    pub fn new(
        store: Store,
        match_threshold: f32,
        geofence: Option<Geofence>,
        store_timeout: Duration,
    ) -> Self {
        Self {
            store,
            matcher: EuclideanMatcher,
            match_threshold,
            geofence,
            store_timeout,
        }
    }

    /// End-to-end scan: resolve the probe against the enrolled gallery,
    /// then apply the attendance transition for the matched identity.
    /// An unmatched probe is a normal outcome and mutates nothing.
    pub async fn scan(&self, probe: Embedding) -> Result<ScanOutcome, ServiceError> {
        self.scan_at(probe, Local::now().naive_local()).await
    }

    pub async fn scan_at(
        &self,
        probe: Embedding,
        now: NaiveDateTime,
    ) -> Result<ScanOutcome, ServiceError> {
        let gallery = self.list_valid_with_retry().await?;
        let matched = self
            .matcher
            .find_match(&probe, &gallery, self.match_threshold)?;

        let Some(matched) = matched else {
            tracing::info!(candidates = gallery.len(), "no match under threshold");
            return Ok(ScanOutcome::NotRecognized {
                message: NOT_RECOGNIZED_MSG.to_string(),
            });
        };
        tracing::info!(
            staff_id = %matched.staff_id,
            distance = matched.distance,
            "face matched"
        );

        // Not retried on timeout: a scan is not idempotent across the
        // check-in/check-out transition, and the unique (staff_id, date)
        // constraint already closes the duplicate-record race. A
        // conflict or timeout surfaces as retryable to the kiosk loop.
        let (transition, record) = self
            .with_timeout(self.store.record_scan(&matched.staff_id, &matched.name, now))
            .await?;

        tracing::info!(
            staff_id = %record.staff_id,
            transition = ?transition,
            status = record.status.as_str(),
            "attendance recorded"
        );

        Ok(match transition {
            ScanTransition::CheckIn => {
                let late_marker = if record.status == AttendanceStatus::Late {
                    " (Late)"
                } else {
                    ""
                };
                let message = format!("Welcome, {}! Checked in{late_marker}.", record.staff_name);
                ScanOutcome::CheckIn { record, message }
            }
            ScanTransition::CheckOut => {
                let message = format!("Goodbye, {}! Checked out.", record.staff_name);
                ScanOutcome::CheckOut { record, message }
            }
        })
    }

    /// Geofence check for the protected kiosk route. Stateless; never
    /// touches the ledger.
    pub fn validate_location(
        &self,
        latitude: f64,
        longitude: f64,
    ) -> Result<GeofenceDecision, ServiceError> {
        let fence = self.geofence.ok_or(ServiceError::GeofenceUnconfigured)?;
        let decision = fence.validate(latitude, longitude);
        tracing::info!(
            allowed = decision.allowed,
            distance_m = ?decision.distance_m,
            "location validated"
        );
        Ok(decision)
    }

    pub async fn register_face(
        &self,
        staff_id: &str,
        name: &str,
        embedding: Embedding,
        reference_image: Option<Vec<u8>>,
    ) -> Result<(), ServiceError> {
        self.with_timeout(
            self.store
                .upsert_face(staff_id, name, &embedding, reference_image),
        )
        .await?;
        tracing::info!(staff_id, name, "face registered");
        Ok(())
    }

    pub async fn remove_face(&self, staff_id: &str) -> Result<bool, ServiceError> {
        let removed = self.with_timeout(self.store.remove_face(staff_id)).await?;
        tracing::info!(staff_id, removed, "face removal requested");
        Ok(removed)
    }

    pub async fn list_faces(&self) -> Result<Vec<FaceSummary>, ServiceError> {
        self.with_timeout(self.store.list_faces()).await
    }

    pub async fn list_attendance(
        &self,
        date: Option<NaiveDate>,
    ) -> Result<Vec<AttendanceRecord>, ServiceError> {
        self.with_timeout(self.store.list_attendance(date)).await
    }

    pub async fn late_threshold_hour(&self) -> Result<u32, ServiceError> {
        self.with_timeout(self.store.late_threshold_hour()).await
    }

    pub async fn set_late_threshold_hour(&self, hour: u32) -> Result<(), ServiceError> {
        if hour > 23 {
            return Err(ServiceError::InvalidLateThreshold(hour));
        }
        self.with_timeout(self.store.set_late_threshold_hour(hour))
            .await?;
        tracing::info!(hour, "late threshold updated");
        Ok(())
    }

    pub async fn status(&self) -> Result<StatusInfo, ServiceError> {
        Ok(StatusInfo {
            version: env!("CARGO_PKG_VERSION"),
            enrolled_faces: self.with_timeout(self.store.count_faces()).await?,
            late_threshold_hour: self.late_threshold_hour().await?,
            match_threshold: self.match_threshold,
            geofence_configured: self.geofence.is_some(),
        })
    }

    /// Gallery read with bounded retry: listing is idempotent, so a
    /// timed-out read is simply attempted again.
    async fn list_valid_with_retry(
        &self,
    ) -> Result<Vec<rollcall_core::EnrolledFace>, ServiceError> {
        let mut attempt = 0;
        loop {
            match self.with_timeout(self.store.list_valid_faces()).await {
                Ok(gallery) => return Ok(gallery),
                Err(ServiceError::Timeout(_)) if attempt < READ_RETRIES => {
                    attempt += 1;
                    tracing::warn!(attempt, "gallery read timed out, retrying");
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn with_timeout<T>(
        &self,
        fut: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, ServiceError> {
        match tokio::time::timeout(self.store_timeout, fut).await {
            Ok(result) => result.map_err(ServiceError::from),
            Err(_) => Err(ServiceError::Timeout(self.store_timeout)),
        }
    }
}
