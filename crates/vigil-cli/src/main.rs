use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use futures::stream::StreamExt;
use std::path::{Path, PathBuf};

#[zbus::proxy(
    interface = "org.vigil.Presence1",
    default_service = "org.vigil.Presence1",
    default_path = "/org/vigil/Presence1"
)]
trait Presence {
    fn status(&self) -> zbus::Result<String>;
    fn list_functions(&self) -> zbus::Result<String>;
    fn start_preview(&self, source: &str) -> zbus::Result<String>;
    fn stop_preview(&self, id: &str) -> zbus::Result<bool>;

    #[zbus(signal)]
    fn preview_frame(&self, id: &str, json: &str) -> zbus::Result<()>;

    #[zbus(signal)]
    fn presence_notification(&self, function: &str, json: &str) -> zbus::Result<()>;
}

#[derive(Parser)]
#[command(name = "vigil", about = "Vigil presence monitoring CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show daemon status
    Status,
    /// List scheduled functions and their run state
    Functions,
    /// Stream live recognition results from a source
    Preview {
        /// Camera device, video file, RTSP/HTTP URL, or "0" for the daemon's default camera
        #[arg(default_value = "0")]
        source: String,
        /// Stop after this many frames
        #[arg(short = 'n', long)]
        frames: Option<usize>,
    },
    /// Print presence notifications as they arrive
    Watch,
    /// List local V4L2 cameras
    Cameras,
    /// Grab one frame from a source and save it as an image (bypasses the daemon)
    Snapshot {
        source: String,
        #[arg(short, long, default_value = "snapshot.png")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Status => {
            let proxy = proxy().await?;
            print_json(&proxy.status().await?)?;
        }
        Commands::Functions => {
            let proxy = proxy().await?;
            print_json(&proxy.list_functions().await?)?;
        }
        Commands::Preview { source, frames } => preview(&source, frames).await?,
        Commands::Watch => watch().await?,
        Commands::Cameras => {
            let devices = vigil_hw::Camera::list_devices();
            if devices.is_empty() {
                println!("No V4L2 capture devices found");
            }
            for d in devices {
                println!("{}  {} ({}, {})", d.path, d.name, d.driver, d.bus);
            }
        }
        Commands::Snapshot { source, output } => snapshot(&source, &output)?,
    }

    Ok(())
}

async fn proxy() -> Result<PresenceProxy<'static>> {
    let session = std::env::var("VIGIL_SESSION_BUS").is_ok_and(|v| v == "1");
    let conn = if session {
        zbus::Connection::session().await
    } else {
        zbus::Connection::system().await
    }
    .context("connecting to D-Bus")?;
    PresenceProxy::new(&conn)
        .await
        .context("vigild not reachable")
}

fn print_json(raw: &str) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(raw).context("daemon returned invalid JSON")?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

async fn preview(source: &str, limit: Option<usize>) -> Result<()> {
    let proxy = proxy().await?;
    // Subscribe before starting so the first frames are not lost.
    let mut frames = proxy.receive_preview_frame().await?;
    let id = proxy.start_preview(source).await?;
    println!("Preview {id} on {source} (Ctrl-C to stop)");

    let mut seen = 0usize;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            signal = frames.next() => {
                let Some(signal) = signal else { break };
                let args = signal.args()?;
                if *args.id() != id {
                    continue;
                }
                println!("{}", format_faces(args.json())?);
                seen += 1;
                if limit.is_some_and(|n| seen >= n) {
                    break;
                }
            }
        }
    }

    if !proxy.stop_preview(&id).await? {
        tracing::debug!(%id, "preview already ended");
    }
    Ok(())
}

async fn watch() -> Result<()> {
    let proxy = proxy().await?;
    let mut notifications = proxy.receive_presence_notification().await?;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            signal = notifications.next() => {
                let Some(signal) = signal else { break };
                let args = signal.args()?;
                println!("{}: {}", args.function(), args.json());
            }
        }
    }
    Ok(())
}

/// One line per preview frame: `name (value)` for each face.
fn format_faces(json: &str) -> Result<String> {
    let value: serde_json::Value = serde_json::from_str(json)?;
    let Some(faces) = value["detected_faces"].as_array() else {
        bail!("preview frame without detected_faces");
    };
    if faces.is_empty() {
        return Ok("(no faces)".into());
    }
    let parts: Vec<String> = faces
        .iter()
        .map(|f| {
            format!(
                "{} ({})",
                f["name"].as_str().unwrap_or("?"),
                f["value"].as_str().unwrap_or("?")
            )
        })
        .collect();
    Ok(parts.join(", "))
}

fn snapshot(source: &str, output: &Path) -> Result<()> {
    let mut src = vigil_hw::open_source(source)?;
    let frame = src
        .next_frame()?
        .with_context(|| format!("{} produced no frame", src.describe()))?;
    let (width, height) = (frame.width, frame.height);
    let img: image::DynamicImage = match frame.color {
        Some(rgb) => image::RgbImage::from_raw(width, height, rgb).map(Into::into),
        None => image::GrayImage::from_raw(width, height, frame.data).map(Into::into),
    }
    .context("frame size does not match its dimensions")?;
    img.save(output)
        .with_context(|| format!("writing {}", output.display()))?;
    println!("Saved {width}x{height} frame to {}", output.display());
    Ok(())
}
