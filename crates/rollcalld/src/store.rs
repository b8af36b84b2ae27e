//! SQLite persistence: enrolled faces, attendance records, settings.
//!
//! All access goes through one async connection (tokio-rusqlite). The
//! attendance table carries a `UNIQUE (staff_id, date)` constraint and
//! scans run inside an immediate transaction, so two concurrent scans
//! for the same staff and day can never both open a check-in record; a
//! lost race surfaces as [`StoreError::Conflict`].

use chrono::{NaiveDate, NaiveDateTime, Utc};
use rollcall_core::{
    AttendanceRecord, AttendanceStatus, Embedding, EnrolledFace, LedgerError, ScanTransition,
    DEFAULT_LATE_THRESHOLD_HOUR, EMBEDDING_DIM,
};
use rusqlite::{params, OptionalExtension, TransactionBehavior};
use serde::Serialize;
use std::path::Path;
use thiserror::Error;
use tokio_rusqlite::Connection;
use uuid::Uuid;

const TS_FMT: &str = "%Y-%m-%dT%H:%M:%S%.3f";
const LATE_THRESHOLD_KEY: &str = "late_threshold";

const SCHEMA: &str = "
PRAGMA journal_mode = WAL;
PRAGMA busy_timeout = 5000;

CREATE TABLE IF NOT EXISTS faces (
    staff_id        TEXT PRIMARY KEY,
    name            TEXT NOT NULL,
    embedding       TEXT NOT NULL,
    reference_image BLOB,
    enrolled_at     TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS attendance (
    id            TEXT PRIMARY KEY,
    staff_id      TEXT NOT NULL,
    staff_name    TEXT NOT NULL,
    date          TEXT NOT NULL,
    check_in      TEXT,
    check_out     TEXT,
    status        TEXT NOT NULL,
    working_hours REAL,
    UNIQUE (staff_id, date)
);

CREATE TABLE IF NOT EXISTS settings (
    key        TEXT PRIMARY KEY,
    value      TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("embedding has {0} values, expected {EMBEDDING_DIM}")]
    InvalidEmbedding(usize),
    #[error("attendance already completed today")]
    AlreadyCompleted,
    #[error("attendance record {0} has no check-in timestamp")]
    CorruptRecord(String),
    #[error("concurrent scan for the same staff and day")]
    Conflict,
    #[error("embedding encode failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("database error: {0}")]
    Db(#[from] tokio_rusqlite::Error),
}

/// Enrollment listing entry for admin surfaces; the embedding itself is
/// only handed to the matcher via [`Store::list_valid_faces`].
#[derive(Debug, Clone, Serialize)]
pub struct FaceSummary {
    pub staff_id: String,
    pub name: String,
    pub enrolled_at: String,
    pub has_reference_image: bool,
}

/// Outcome of the scan transaction, carried out of the blocking closure.
enum ScanCall {
    Done(ScanTransition, AttendanceRecord),
    Conflict,
    AlreadyCompleted,
    Corrupt(String),
}

#[derive(Clone)]
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (or create) the database at `path` and apply the schema.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                tracing::warn!(dir = %parent.display(), error = %e, "could not create data dir");
            }
        }
        let conn = Connection::open(path).await?;
        Self::init(conn).await
    }

    /// In-memory database for tests.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().await?;
        Self::init(conn).await
    }

    async fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.call(|conn| {
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await?;
        Ok(Self { conn })
    }

    /// Register (or wholesale replace) a staff member's face.
    pub async fn upsert_face(
        &self,
        staff_id: &str,
        name: &str,
        embedding: &Embedding,
        reference_image: Option<Vec<u8>>,
    ) -> Result<(), StoreError> {
        if embedding.values.len() != EMBEDDING_DIM {
            return Err(StoreError::InvalidEmbedding(embedding.values.len()));
        }
        let encoded = serde_json::to_string(&embedding.values)?;
        let staff_id = staff_id.to_string();
        let name = name.to_string();
        let enrolled_at = Utc::now().to_rfc3339();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO faces (staff_id, name, embedding, reference_image, enrolled_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT (staff_id) DO UPDATE SET
                         name = excluded.name,
                         embedding = excluded.embedding,
                         reference_image = excluded.reference_image,
                         enrolled_at = excluded.enrolled_at",
                    params![staff_id, name, encoded, reference_image, enrolled_at],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Remove a staff member's face data. Idempotent: removing an
    /// unknown staff id is not an error. Returns whether a row was
    /// deleted.
    pub async fn remove_face(&self, staff_id: &str) -> Result<bool, StoreError> {
        let staff_id = staff_id.to_string();
        let removed = self
            .conn
            .call(move |conn| {
                let n = conn.execute("DELETE FROM faces WHERE staff_id = ?1", params![staff_id])?;
                Ok(n > 0)
            })
            .await?;
        Ok(removed)
    }

    /// Faces usable for matching: exactly 128 finite values. Rows that
    /// fail the filter are logged and skipped, never fatal.
    pub async fn list_valid_faces(&self) -> Result<Vec<EnrolledFace>, StoreError> {
        let faces = self
            .conn
            .call(|conn| {
                let mut stmt =
                    conn.prepare("SELECT staff_id, name, embedding FROM faces ORDER BY staff_id")?;
                let rows = stmt.query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                })?;

                let mut faces = Vec::new();
                for row in rows {
                    let (staff_id, name, raw) = row?;
                    let values: Vec<f32> = match serde_json::from_str(&raw) {
                        Ok(v) => v,
                        Err(e) => {
                            tracing::warn!(staff_id = %staff_id, error = %e, "skipping unparseable embedding");
                            continue;
                        }
                    };
                    let embedding = Embedding::new(values);
                    if !embedding.is_valid() {
                        tracing::warn!(
                            staff_id = %staff_id,
                            len = embedding.values.len(),
                            "skipping malformed embedding"
                        );
                        continue;
                    }
                    faces.push(EnrolledFace {
                        staff_id,
                        name,
                        embedding,
                    });
                }
                Ok(faces)
            })
            .await?;
        Ok(faces)
    }

    /// Enrollment summaries for admin listing.
    pub async fn list_faces(&self) -> Result<Vec<FaceSummary>, StoreError> {
        let summaries = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT staff_id, name, enrolled_at, reference_image IS NOT NULL
                     FROM faces ORDER BY staff_id",
                )?;
                let rows = stmt.query_map([], |row| {
                    Ok(FaceSummary {
                        staff_id: row.get(0)?,
                        name: row.get(1)?,
                        enrolled_at: row.get(2)?,
                        has_reference_image: row.get(3)?,
                    })
                })?;
                rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
            })
            .await?;
        Ok(summaries)
    }

    pub async fn count_faces(&self) -> Result<u64, StoreError> {
        let n = self
            .conn
            .call(|conn| {
                let n: i64 = conn.query_row("SELECT COUNT(*) FROM faces", [], |row| row.get(0))?;
                Ok(n)
            })
            .await?;
        Ok(n as u64)
    }

    /// Apply one scan for a resolved identity: open today's record
    /// (check-in) or close it (check-out), atomically.
    ///
    /// The late threshold is read fresh inside the same transaction, so
    /// administrative changes take effect on the next check-in without a
    /// restart. A unique-constraint violation on insert means another
    /// scan won the race and surfaces as [`StoreError::Conflict`] for
    /// the caller to retry.
    pub async fn record_scan(
        &self,
        staff_id: &str,
        staff_name: &str,
        now: NaiveDateTime,
    ) -> Result<(ScanTransition, AttendanceRecord), StoreError> {
        let staff_id = staff_id.to_string();
        let staff_name = staff_name.to_string();
        let outcome = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let late_threshold = read_late_threshold(&tx);
                let date = now.date();

                let existing = tx
                    .query_row(
                        "SELECT id, staff_id, staff_name, date, check_in, check_out, status, working_hours
                         FROM attendance WHERE staff_id = ?1 AND date = ?2",
                        params![staff_id, date.to_string()],
                        row_to_record,
                    )
                    .optional()?;

                let result = match existing {
                    None => {
                        let record = AttendanceRecord::open(
                            Uuid::new_v4().to_string(),
                            &staff_id,
                            &staff_name,
                            now,
                            late_threshold,
                        );
                        let inserted = tx.execute(
                            "INSERT INTO attendance
                                 (id, staff_id, staff_name, date, check_in, check_out, status, working_hours)
                             VALUES (?1, ?2, ?3, ?4, ?5, NULL, ?6, NULL)",
                            params![
                                record.id,
                                record.staff_id,
                                record.staff_name,
                                record.date.to_string(),
                                now.format(TS_FMT).to_string(),
                                record.status.as_str(),
                            ],
                        );
                        match inserted {
                            Ok(_) => ScanCall::Done(ScanTransition::CheckIn, record),
                            Err(rusqlite::Error::SqliteFailure(e, _))
                                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
                            {
                                ScanCall::Conflict
                            }
                            Err(e) => return Err(e.into()),
                        }
                    }
                    Some(mut record) => match record.close(now) {
                        Ok(()) => {
                            tx.execute(
                                "UPDATE attendance SET check_out = ?1, working_hours = ?2 WHERE id = ?3",
                                params![
                                    now.format(TS_FMT).to_string(),
                                    record.working_hours,
                                    record.id,
                                ],
                            )?;
                            ScanCall::Done(ScanTransition::CheckOut, record)
                        }
                        Err(LedgerError::AlreadyCompleted) => ScanCall::AlreadyCompleted,
                        Err(LedgerError::MissingCheckIn) => ScanCall::Corrupt(record.id),
                    },
                };

                tx.commit()?;
                Ok(result)
            })
            .await?;

        match outcome {
            ScanCall::Done(transition, record) => Ok((transition, record)),
            ScanCall::Conflict => Err(StoreError::Conflict),
            ScanCall::AlreadyCompleted => Err(StoreError::AlreadyCompleted),
            ScanCall::Corrupt(id) => Err(StoreError::CorruptRecord(id)),
        }
    }

    /// Attendance records, optionally filtered to one business date.
    pub async fn list_attendance(
        &self,
        date: Option<NaiveDate>,
    ) -> Result<Vec<AttendanceRecord>, StoreError> {
        let records = self
            .conn
            .call(move |conn| {
                let mut records = Vec::new();
                match date {
                    Some(date) => {
                        let mut stmt = conn.prepare(
                            "SELECT id, staff_id, staff_name, date, check_in, check_out, status, working_hours
                             FROM attendance WHERE date = ?1 ORDER BY check_in",
                        )?;
                        let rows = stmt.query_map(params![date.to_string()], row_to_record)?;
                        for row in rows {
                            records.push(row?);
                        }
                    }
                    None => {
                        let mut stmt = conn.prepare(
                            "SELECT id, staff_id, staff_name, date, check_in, check_out, status, working_hours
                             FROM attendance ORDER BY date DESC, check_in",
                        )?;
                        let rows = stmt.query_map([], row_to_record)?;
                        for row in rows {
                            records.push(row?);
                        }
                    }
                }
                Ok(records)
            })
            .await?;
        Ok(records)
    }

    /// Current late threshold hour (0-23), default
    /// [`DEFAULT_LATE_THRESHOLD_HOUR`] when unset.
    pub async fn late_threshold_hour(&self) -> Result<u32, StoreError> {
        let hour = self
            .conn
            .call(|conn| Ok(read_late_threshold(conn)))
            .await?;
        Ok(hour)
    }

    pub async fn set_late_threshold_hour(&self, hour: u32) -> Result<(), StoreError> {
        self.set_setting(LATE_THRESHOLD_KEY, &hour.to_string()).await
    }

    /// Read a setting value by key.
    pub async fn get_setting(&self, key: &str) -> Result<Option<String>, StoreError> {
        let key = key.to_string();
        let value = self
            .conn
            .call(move |conn| {
                conn.query_row(
                    "SELECT value FROM settings WHERE key = ?1",
                    params![key],
                    |row| row.get(0),
                )
                .optional()
                .map_err(Into::into)
            })
            .await?;
        Ok(value)
    }

    /// Upsert a setting value, stamping `updated_at`.
    pub async fn set_setting(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let key = key.to_string();
        let value = value.to_string();
        let updated_at = Utc::now().to_rfc3339();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3)
                     ON CONFLICT (key) DO UPDATE SET
                         value = excluded.value,
                         updated_at = excluded.updated_at",
                    params![key, value, updated_at],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }
}

/// Late threshold from the settings table, read fresh on every call.
/// Missing or unparseable values fall back to the default.
fn read_late_threshold(conn: &rusqlite::Connection) -> u32 {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value FROM settings WHERE key = ?1",
            params![LATE_THRESHOLD_KEY],
            |row| row.get(0),
        )
        .optional()
        .ok()
        .flatten();
    match raw {
        None => DEFAULT_LATE_THRESHOLD_HOUR,
        Some(raw) => match raw.parse::<u32>() {
            Ok(hour) if hour <= 23 => hour,
            _ => {
                tracing::warn!(value = %raw, "invalid late threshold setting, using default");
                DEFAULT_LATE_THRESHOLD_HOUR
            }
        },
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<AttendanceRecord> {
    let date_raw: String = row.get(3)?;
    let date = date_raw.parse::<NaiveDate>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let check_in = parse_ts(row.get::<_, Option<String>>(4)?, 4)?;
    let check_out = parse_ts(row.get::<_, Option<String>>(5)?, 5)?;
    let status_raw: String = row.get(6)?;
    let status = AttendanceStatus::from_str(&status_raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            6,
            rusqlite::types::Type::Text,
            format!("unknown attendance status: {status_raw}").into(),
        )
    })?;
    Ok(AttendanceRecord {
        id: row.get(0)?,
        staff_id: row.get(1)?,
        staff_name: row.get(2)?,
        date,
        check_in,
        check_out,
        status,
        working_hours: row.get(7)?,
    })
}

fn parse_ts(raw: Option<String>, idx: usize) -> rusqlite::Result<Option<NaiveDateTime>> {
    match raw {
        None => Ok(None),
        Some(raw) => NaiveDateTime::parse_from_str(&raw, TS_FMT)
            .map(Some)
            .map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    idx,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use rollcall_core::DayState;

    fn embedding(fill: f32) -> Embedding {
        Embedding::new(vec![fill; EMBEDDING_DIM])
    }

    fn at(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 8, 26)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    #[tokio::test]
    async fn test_register_then_list_round_trips_bit_for_bit() {
        let store = Store::open_in_memory().await.unwrap();
        let values: Vec<f32> = (0..EMBEDDING_DIM)
            .map(|i| (i as f32) * 0.123_456_7 - 3.0)
            .collect();
        store
            .upsert_face("s1", "Alice", &Embedding::new(values.clone()), None)
            .await
            .unwrap();

        let faces = store.list_valid_faces().await.unwrap();
        assert_eq!(faces.len(), 1);
        assert_eq!(faces[0].staff_id, "s1");
        assert_eq!(faces[0].name, "Alice");
        assert_eq!(faces[0].embedding.values, values);
    }

    #[tokio::test]
    async fn test_upsert_replaces_wholesale() {
        let store = Store::open_in_memory().await.unwrap();
        store
            .upsert_face("s1", "Alice", &embedding(0.1), Some(vec![1, 2, 3]))
            .await
            .unwrap();
        store
            .upsert_face("s1", "Alice B", &embedding(0.9), None)
            .await
            .unwrap();

        let faces = store.list_valid_faces().await.unwrap();
        assert_eq!(faces.len(), 1);
        assert_eq!(faces[0].name, "Alice B");
        assert_eq!(faces[0].embedding.values[0], 0.9);

        let summaries = store.list_faces().await.unwrap();
        assert!(!summaries[0].has_reference_image);
    }

    #[tokio::test]
    async fn test_upsert_rejects_wrong_length() {
        let store = Store::open_in_memory().await.unwrap();
        let err = store
            .upsert_face("s1", "Alice", &Embedding::new(vec![0.0; 64]), None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidEmbedding(64)));
    }

    #[tokio::test]
    async fn test_remove_face_idempotent() {
        let store = Store::open_in_memory().await.unwrap();
        store
            .upsert_face("s1", "Alice", &embedding(0.1), None)
            .await
            .unwrap();
        assert!(store.remove_face("s1").await.unwrap());
        assert!(!store.remove_face("s1").await.unwrap());
        assert!(!store.remove_face("never-existed").await.unwrap());
        assert!(store.list_valid_faces().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_rows_excluded_from_matching() {
        let store = Store::open_in_memory().await.unwrap();
        store
            .upsert_face("ok", "Ok", &embedding(0.1), None)
            .await
            .unwrap();
        // Bypass validation to simulate legacy bad rows.
        store
            .conn
            .call(|conn| {
                conn.execute(
                    "INSERT INTO faces (staff_id, name, embedding, enrolled_at)
                     VALUES ('short', 'Short', '[1.0, 2.0]', ''),
                            ('junk', 'Junk', 'not json', '')",
                    [],
                )?;
                Ok(())
            })
            .await
            .unwrap();

        let faces = store.list_valid_faces().await.unwrap();
        assert_eq!(faces.len(), 1);
        assert_eq!(faces[0].staff_id, "ok");
        // Admin listing still shows every enrollment.
        assert_eq!(store.list_faces().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_scan_check_in_then_check_out() {
        let store = Store::open_in_memory().await.unwrap();

        let (transition, record) = store.record_scan("s1", "Alice", at(9, 15)).await.unwrap();
        assert_eq!(transition, ScanTransition::CheckIn);
        assert_eq!(record.status, AttendanceStatus::Late);
        assert_eq!(record.check_in, Some(at(9, 15)));
        assert_eq!(record.check_out, None);

        let (transition, record) = store.record_scan("s1", "Alice", at(17, 0)).await.unwrap();
        assert_eq!(transition, ScanTransition::CheckOut);
        assert_eq!(record.check_out, Some(at(17, 0)));
        assert_eq!(record.working_hours, Some(7.75));
        assert_eq!(record.day_state(), DayState::CheckedOut);

        // Round-trip through the table.
        let listed = store.list_attendance(Some(at(0, 0).date())).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].check_in, Some(at(9, 15)));
        assert_eq!(listed[0].check_out, Some(at(17, 0)));
        assert_eq!(listed[0].status, AttendanceStatus::Late);
        assert_eq!(listed[0].working_hours, Some(7.75));
    }

    #[tokio::test]
    async fn test_third_scan_same_day_rejected() {
        let store = Store::open_in_memory().await.unwrap();
        store.record_scan("s1", "Alice", at(9, 0)).await.unwrap();
        store.record_scan("s1", "Alice", at(17, 0)).await.unwrap();

        let err = store.record_scan("s1", "Alice", at(18, 0)).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyCompleted));

        let listed = store.list_attendance(None).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].check_out, Some(at(17, 0)));
    }

    #[tokio::test]
    async fn test_one_record_per_staff_per_day_under_parallel_scans() {
        let store = Store::open_in_memory().await.unwrap();
        let mut set = tokio::task::JoinSet::new();
        for _ in 0..8 {
            let store = store.clone();
            set.spawn(async move { store.record_scan("s1", "Alice", at(9, 0)).await });
        }

        let mut check_ins = 0;
        while let Some(joined) = set.join_next().await {
            if let Ok(Ok((ScanTransition::CheckIn, _))) = joined {
                check_ins += 1;
            }
        }
        assert_eq!(check_ins, 1, "exactly one scan may open the day's record");

        let listed = store.list_attendance(Some(at(0, 0).date())).await.unwrap();
        assert_eq!(listed.len(), 1);
    }

    #[tokio::test]
    async fn test_separate_days_get_separate_records() {
        let store = Store::open_in_memory().await.unwrap();
        store.record_scan("s1", "Alice", at(9, 0)).await.unwrap();
        let next_day = at(8, 30) + chrono::Duration::days(1);
        let (transition, record) = store.record_scan("s1", "Alice", next_day).await.unwrap();
        assert_eq!(transition, ScanTransition::CheckIn);
        assert_eq!(record.date, next_day.date());
        assert_eq!(store.list_attendance(None).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_late_threshold_read_fresh_per_check_in() {
        let store = Store::open_in_memory().await.unwrap();
        assert_eq!(
            store.late_threshold_hour().await.unwrap(),
            DEFAULT_LATE_THRESHOLD_HOUR
        );

        store.set_late_threshold_hour(10).await.unwrap();
        assert_eq!(store.late_threshold_hour().await.unwrap(), 10);

        // 09:30 is late under the default but present under hour 10.
        let (_, record) = store.record_scan("s1", "Alice", at(9, 30)).await.unwrap();
        assert_eq!(record.status, AttendanceStatus::Present);
    }

    #[tokio::test]
    async fn test_invalid_late_threshold_falls_back_to_default() {
        let store = Store::open_in_memory().await.unwrap();
        store.set_setting(LATE_THRESHOLD_KEY, "not a number").await.unwrap();
        assert_eq!(
            store.late_threshold_hour().await.unwrap(),
            DEFAULT_LATE_THRESHOLD_HOUR
        );
        store.set_setting(LATE_THRESHOLD_KEY, "99").await.unwrap();
        assert_eq!(
            store.late_threshold_hour().await.unwrap(),
            DEFAULT_LATE_THRESHOLD_HOUR
        );
    }

    #[tokio::test]
    async fn test_settings_upsert_and_read() {
        let store = Store::open_in_memory().await.unwrap();
        assert_eq!(store.get_setting("theme").await.unwrap(), None);
        store.set_setting("theme", "dark").await.unwrap();
        store.set_setting("theme", "light").await.unwrap();
        assert_eq!(
            store.get_setting("theme").await.unwrap().as_deref(),
            Some("light")
        );
    }
}
