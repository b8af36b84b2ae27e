//! Great-circle distance and geofence validation.

use serde::{Deserialize, Serialize};

/// Spherical-Earth radius in meters.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Great-circle distance in meters between two coordinates, using the
/// haversine formula on a spherical Earth.
///
/// Inputs are degrees. Always non-negative for finite inputs; NaN inputs
/// propagate as NaN — validation is the caller's job.
pub fn distance_meters(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let d_phi = (lat2 - lat1).to_radians();
    let d_lambda = (lon2 - lon1).to_radians();

    let a = (d_phi / 2.0).sin().powi(2)
        + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_M * c
}

/// Circular office geofence: center coordinate plus allowed radius.
///
/// Loaded from configuration at startup and immutable for the process
/// lifetime. Zero is a valid latitude, longitude, and radius — a zero
/// radius admits only the exact center.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Geofence {
    pub latitude: f64,
    pub longitude: f64,
    pub radius_m: f64,
}

/// Outcome of a geofence check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeofenceDecision {
    pub allowed: bool,
    /// Measured distance in whole meters; `None` when the inputs were
    /// unusable and no distance was computed.
    pub distance_m: Option<f64>,
    pub message: String,
}

impl Geofence {
    /// Decide whether the caller's reported position lies inside the
    /// fence. Stateless and idempotent; safe to call repeatedly on
    /// "try again" retries.
    pub fn validate(&self, user_lat: f64, user_lon: f64) -> GeofenceDecision {
        if !user_lat.is_finite()
            || !user_lon.is_finite()
            || !self.latitude.is_finite()
            || !self.longitude.is_finite()
            || !self.radius_m.is_finite()
        {
            return GeofenceDecision {
                allowed: false,
                distance_m: None,
                message: "Invalid coordinates provided".to_string(),
            };
        }

        let distance = distance_meters(user_lat, user_lon, self.latitude, self.longitude);
        let rounded = distance.round();
        let allowed = distance <= self.radius_m;

        let message = if allowed {
            "Location verified - within office premises".to_string()
        } else {
            format!(
                "Access denied - You are {rounded:.0} meters from the office (allowed: {:.0}m)",
                self.radius_m
            )
        };

        GeofenceDecision {
            allowed,
            distance_m: Some(rounded),
            message,
        }
    }
}
