//! D-Bus interface for the Rollcall attendance daemon.
//!
//! Bus name: org.rollcall.Attendance1
//! Object path: /org/rollcall/Attendance1
//!
//! Structured results (scan outcomes, records, decisions) are returned
//! as JSON strings so kiosk front-ends and the CLI share one schema.

use crate::service::{AttendanceService, ServiceError};
use crate::store::StoreError;
use chrono::NaiveDate;
use rollcall_core::Embedding;
use std::sync::Arc;
use zbus::interface;

pub struct AttendanceInterface {
    service: Arc<AttendanceService>,
}

impl AttendanceInterface {
    pub fn new(service: Arc<AttendanceService>) -> Self {
        Self { service }
    }
}

#[interface(name = "org.rollcall.Attendance1")]
impl AttendanceInterface {
    /// Resolve a live 128-dim embedding and apply the day's attendance
    /// transition. Returns the scan outcome as JSON.
    async fn scan(&self, embedding: Vec<f64>) -> zbus::fdo::Result<String> {
        tracing::info!(dims = embedding.len(), "scan requested");
        let probe = to_embedding(embedding);
        let outcome = self.service.scan(probe).await.map_err(to_fdo)?;
        to_json(&outcome)
    }

    /// Register (or replace) a staff member's face. An empty
    /// `reference_image` means none.
    async fn register_face(
        &self,
        staff_id: &str,
        name: &str,
        embedding: Vec<f64>,
        reference_image: Vec<u8>,
    ) -> zbus::fdo::Result<bool> {
        tracing::info!(staff_id, name, dims = embedding.len(), "register_face requested");
        if staff_id.is_empty() || name.is_empty() {
            return Err(zbus::fdo::Error::InvalidArgs(
                "staff id and name are required".into(),
            ));
        }
        let image = if reference_image.is_empty() {
            None
        } else {
            Some(reference_image)
        };
        self.service
            .register_face(staff_id, name, to_embedding(embedding), image)
            .await
            .map_err(to_fdo)?;
        Ok(true)
    }

    /// Remove a staff member's face data. Idempotent; returns whether
    /// anything was removed.
    async fn remove_face(&self, staff_id: &str) -> zbus::fdo::Result<bool> {
        tracing::info!(staff_id, "remove_face requested");
        self.service.remove_face(staff_id).await.map_err(to_fdo)
    }

    /// Enrollment summaries as JSON.
    async fn list_faces(&self) -> zbus::fdo::Result<String> {
        let faces = self.service.list_faces().await.map_err(to_fdo)?;
        to_json(&faces)
    }

    /// Validate a caller position against the office geofence. Returns
    /// `{allowed, distance_m, message}` as JSON.
    async fn validate_location(&self, latitude: f64, longitude: f64) -> zbus::fdo::Result<String> {
        let decision = self
            .service
            .validate_location(latitude, longitude)
            .map_err(to_fdo)?;
        to_json(&decision)
    }

    /// Attendance records as JSON; `date` filters to one business day
    /// (YYYY-MM-DD), empty string lists everything.
    async fn list_attendance(&self, date: &str) -> zbus::fdo::Result<String> {
        let filter = if date.is_empty() {
            None
        } else {
            Some(date.parse::<NaiveDate>().map_err(|e| {
                zbus::fdo::Error::InvalidArgs(format!("bad date {date:?}: {e}"))
            })?)
        };
        let records = self.service.list_attendance(filter).await.map_err(to_fdo)?;
        to_json(&records)
    }

    /// Current late threshold hour (0-23).
    async fn late_threshold(&self) -> zbus::fdo::Result<u32> {
        self.service.late_threshold_hour().await.map_err(to_fdo)
    }

    /// Set the late threshold hour; applies to the next check-in.
    async fn set_late_threshold(&self, hour: u32) -> zbus::fdo::Result<bool> {
        tracing::info!(hour, "set_late_threshold requested");
        self.service
            .set_late_threshold_hour(hour)
            .await
            .map_err(to_fdo)?;
        Ok(true)
    }

    /// Daemon status snapshot as JSON.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let status = self.service.status().await.map_err(to_fdo)?;
        to_json(&status)
    }
}

/// Wire embeddings travel as D-Bus doubles; the matcher works in f32,
/// the precision the upstream face pipeline produces.
fn to_embedding(values: Vec<f64>) -> Embedding {
    Embedding::new(values.into_iter().map(|v| v as f32).collect())
}

fn to_json<T: serde::Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| zbus::fdo::Error::Failed(format!("encode: {e}")))
}

fn to_fdo(err: ServiceError) -> zbus::fdo::Error {
    match &err {
        ServiceError::Match(_)
        | ServiceError::InvalidLateThreshold(_)
        | ServiceError::Store(StoreError::InvalidEmbedding(_)) => {
            zbus::fdo::Error::InvalidArgs(err.to_string())
        }
        ServiceError::Timeout(_) | ServiceError::Conflict => {
            // Retryable from the kiosk loop.
            zbus::fdo::Error::Failed(format!("{err} (retry)"))
        }
        _ => zbus::fdo::Error::Failed(err.to_string()),
    }
}
