use rollcall_core::Geofence;
use std::path::PathBuf;

/// Daemon configuration, loaded from environment variables.
pub struct Config {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Euclidean distance threshold for a positive face match.
    pub match_threshold: f32,
    /// Timeout in seconds for a single storage operation.
    pub store_timeout_secs: u64,
    /// Office geofence; `None` when the office coordinates are not
    /// configured, which disables location validation.
    pub geofence: Option<Geofence>,
}

impl Config {
    /// Load configuration from `ROLLCALL_*` environment variables with
    /// defaults.
    pub fn from_env() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("rollcall");

        let db_path = std::env::var("ROLLCALL_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("rollcall.db"));

        Self {
            db_path,
            match_threshold: env_f32("ROLLCALL_MATCH_THRESHOLD", 0.6),
            store_timeout_secs: env_u64("ROLLCALL_STORE_TIMEOUT_SECS", 5),
            geofence: read_geofence(),
        }
    }
}

/// Read the office geofence. All three values must be present and
/// parseable; otherwise the gate is unconfigured. A value of zero is
/// valid — an office on the equator or a center-only gate are
/// legitimate configurations.
fn read_geofence() -> Option<Geofence> {
    let latitude = env_opt_f64("ROLLCALL_OFFICE_LATITUDE")?;
    let longitude = env_opt_f64("ROLLCALL_OFFICE_LONGITUDE")?;
    let radius_m = env_opt_f64("ROLLCALL_OFFICE_RADIUS_M")?;
    Some(Geofence {
        latitude,
        longitude,
        radius_m,
    })
}

fn env_opt_f64(key: &str) -> Option<f64> {
    let raw = std::env::var(key).ok()?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "unparseable numeric setting, ignoring");
            None
        }
    }
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
