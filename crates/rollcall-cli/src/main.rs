use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

const BUS_NAME: &str = "org.rollcall.Attendance1";
const OBJECT_PATH: &str = "/org/rollcall/Attendance1";
const INTERFACE: &str = "org.rollcall.Attendance1";

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall attendance CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan a live embedding and record attendance
    Scan {
        /// JSON file with a 128-number embedding array
        #[arg(short, long)]
        embedding: PathBuf,
    },
    /// Register (or replace) a staff member's face
    Register {
        /// Staff id
        id: String,
        /// Display name
        #[arg(short, long)]
        name: String,
        /// JSON file with a 128-number embedding array
        #[arg(short, long)]
        embedding: PathBuf,
        /// Optional reference image file
        #[arg(short, long)]
        image: Option<PathBuf>,
    },
    /// Remove a staff member's face data
    Remove {
        /// Staff id
        id: String,
    },
    /// List enrolled faces
    List,
    /// List attendance records
    Attendance {
        /// Business date (YYYY-MM-DD); omit for all records
        #[arg(short, long)]
        date: Option<String>,
    },
    /// Check coordinates against the office geofence
    ValidateLocation {
        #[arg(allow_negative_numbers = true)]
        latitude: f64,
        #[arg(allow_negative_numbers = true)]
        longitude: f64,
    },
    /// Show or set the late threshold hour
    LateThreshold {
        /// New threshold hour (0-23); omit to show the current value
        #[arg(long)]
        set: Option<u32>,
    },
    /// Show daemon status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let conn = zbus::Connection::session()
        .await
        .context("connecting to the session bus")?;
    let proxy = zbus::Proxy::new(&conn, BUS_NAME, OBJECT_PATH, INTERFACE)
        .await
        .context("rollcalld not reachable")?;

    match cli.command {
        Commands::Scan { embedding } => {
            let values = read_embedding(&embedding)?;
            let reply: String = proxy.call("Scan", &(values,)).await?;
            print_json(&reply)?;
        }
        Commands::Register {
            id,
            name,
            embedding,
            image,
        } => {
            let values = read_embedding(&embedding)?;
            let image_bytes = match image {
                Some(path) => std::fs::read(&path)
                    .with_context(|| format!("reading {}", path.display()))?,
                None => Vec::new(),
            };
            let _: bool = proxy
                .call("RegisterFace", &(id.as_str(), name.as_str(), values, image_bytes))
                .await?;
            println!("Registered face for {name} ({id})");
        }
        Commands::Remove { id } => {
            let removed: bool = proxy.call("RemoveFace", &(id.as_str(),)).await?;
            if removed {
                println!("Removed face data for {id}");
            } else {
                println!("No face data stored for {id}");
            }
        }
        Commands::List => {
            let reply: String = proxy.call("ListFaces", &()).await?;
            print_json(&reply)?;
        }
        Commands::Attendance { date } => {
            let date = date.unwrap_or_default();
            let reply: String = proxy.call("ListAttendance", &(date.as_str(),)).await?;
            print_json(&reply)?;
        }
        Commands::ValidateLocation {
            latitude,
            longitude,
        } => {
            let reply: String = proxy
                .call("ValidateLocation", &(latitude, longitude))
                .await?;
            print_json(&reply)?;
        }
        Commands::LateThreshold { set } => match set {
            Some(hour) => {
                let _: bool = proxy.call("SetLateThreshold", &(hour,)).await?;
                println!("Late threshold set to {hour}:00");
            }
            None => {
                let hour: u32 = proxy.call("LateThreshold", &()).await?;
                println!("Late threshold: {hour}:00");
            }
        },
        Commands::Status => {
            let reply: String = proxy.call("Status", &()).await?;
            print_json(&reply)?;
        }
    }

    Ok(())
}

/// Read an embedding file: a JSON array of 128 numbers, as produced by
/// the kiosk's face pipeline.
fn read_embedding(path: &PathBuf) -> Result<Vec<f64>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let values: Vec<f64> =
        serde_json::from_str(&raw).context("embedding file must be a JSON number array")?;
    Ok(values)
}

fn print_json(raw: &str) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(raw)?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}
