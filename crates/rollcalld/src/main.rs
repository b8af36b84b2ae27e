use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod service;
mod store;

use config::Config;
use dbus_interface::AttendanceInterface;
use service::AttendanceService;
use store::Store;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("rollcalld starting");

    let cfg = Config::from_env();
    tracing::info!(db = %cfg.db_path.display(), threshold = cfg.match_threshold, "configuration loaded");

    match &cfg.geofence {
        Some(fence) => tracing::info!(
            latitude = fence.latitude,
            longitude = fence.longitude,
            radius_m = fence.radius_m,
            "office geofence configured"
        ),
        None => tracing::warn!(
            "ROLLCALL_OFFICE_* not set; location validation disabled"
        ),
    }

    let store = Store::open(&cfg.db_path).await?;
    let service = Arc::new(AttendanceService::new(
        store,
        cfg.match_threshold,
        cfg.geofence,
        Duration::from_secs(cfg.store_timeout_secs),
    ));

    let _conn = zbus::connection::Builder::session()?
        .name("org.rollcall.Attendance1")?
        .serve_at(
            "/org/rollcall/Attendance1",
            AttendanceInterface::new(service),
        )?
        .build()
        .await?;

    tracing::info!("rollcalld ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");

    Ok(())
}
