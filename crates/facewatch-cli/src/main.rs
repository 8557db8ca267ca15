use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use facewatch_hw::Camera;
use std::path::PathBuf;

#[zbus::proxy(
    interface = "org.facewatch.Facewatch1",
    default_service = "org.facewatch.Facewatch1",
    default_path = "/org/facewatch/Facewatch1"
)]
trait Facewatch {
    fn start(&self) -> zbus::Result<String>;
    fn stop(&self) -> zbus::Result<String>;
    fn status(&self) -> zbus::Result<String>;
    fn gallery(&self) -> zbus::Result<String>;
    fn annotations(&self) -> zbus::Result<String>;
    fn save_overlay(&self, path: &str) -> zbus::Result<bool>;
}

#[derive(Parser)]
#[command(name = "facewatch", about = "Live face identification control CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start capture and identification
    Start,
    /// Stop capture and clear the overlay
    Stop,
    /// Show daemon state and settings
    Status,
    /// List enrolled identities
    Gallery,
    /// Print the labelled boxes currently on the overlay
    Annotations,
    /// Save the overlay as a PNG
    Snapshot {
        /// Output file
        path: PathBuf,
    },
    /// List local V4L2 capture devices (does not need the daemon)
    Devices,
}

fn print_json(raw: &str) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(raw).context("daemon returned invalid JSON")?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

async fn proxy() -> Result<FacewatchProxy<'static>> {
    let connection = zbus::Connection::session()
        .await
        .context("connecting to the session bus")?;
    Ok(FacewatchProxy::new(&connection).await?)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Devices => {
            let devices = Camera::list_devices();
            if devices.is_empty() {
                println!("No capture devices found");
            }
            for d in devices {
                println!("{}\t{} ({}, {})", d.path, d.name, d.driver, d.bus);
            }
        }
        Commands::Start => println!("{}", proxy().await?.start().await?),
        Commands::Stop => println!("{}", proxy().await?.stop().await?),
        Commands::Status => print_json(&proxy().await?.status().await?)?,
        Commands::Gallery => print_json(&proxy().await?.gallery().await?)?,
        Commands::Annotations => print_json(&proxy().await?.annotations().await?)?,
        Commands::Snapshot { path } => {
            // The daemon resolves paths against its own working directory.
            let path = if path.is_absolute() {
                path
            } else {
                std::env::current_dir()?.join(path)
            };
            proxy().await?.save_overlay(&path.to_string_lossy()).await?;
            println!("Overlay saved to {}", path.display());
        }
    }

    Ok(())
}
