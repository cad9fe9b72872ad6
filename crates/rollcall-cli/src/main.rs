use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rollcall_core::detector::{Detector, DetectorConfig, ScrfdDetector};
use rollcall_core::model_store::ModelStore;
use rollcall_core::{gallery, ClassifierService, RecognitionConfig, RecognitionPipeline};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall face attendance CLI")]
struct Cli {
    /// Gallery root used by offline commands
    #[arg(long, global = true)]
    gallery: Option<PathBuf>,
    /// Model directory used by offline commands
    #[arg(long, global = true)]
    models: Option<PathBuf>,
    /// SCRFD detector model used by offline commands
    #[arg(long, global = true)]
    detector: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List enrolled identities and their sample counts
    Gallery,
    /// Retrain the daemon's classifier from the gallery
    Train {
        /// Bypass the retrain debounce window
        #[arg(short, long)]
        force: bool,
    },
    /// Recognize faces in an image file without the daemon
    Recognize {
        image: PathBuf,
        /// Distance threshold (lower is stricter)
        #[arg(short, long)]
        threshold: Option<f64>,
    },
    /// Show daemon status
    Status,
    /// Start the camera stream, bound to a session if given
    Stream {
        #[arg(short, long)]
        session: Option<String>,
    },
    /// Stop the stream and release the camera
    StopCamera,
    /// Save the newest annotated frame as JPEG
    Snapshot { output: PathBuf },
    /// Capture enrollment samples from the camera, then retrain
    Enroll {
        identity: String,
        /// Display name for attendance notifications
        #[arg(short, long, default_value = "")]
        name: String,
        /// Samples to capture
        #[arg(short, long, default_value_t = 5)]
        samples: u32,
    },
    /// Remove an identity's samples and student record
    Remove { identity: String },
    /// Open (or reactivate) an attendance session
    OpenSession { token: String },
    /// Close an attendance session
    CloseSession { token: String },
    /// Submit an image file as an attendance frame for a session
    Submit { session: String, image: PathBuf },
    /// Print attendance recorded for a session
    Attendance { session: String },
    /// Print the pending recognition notification
    Last,
    /// Delete every sample, student and attendance record
    Reset {
        #[arg(long)]
        yes: bool,
    },
}

#[zbus::proxy(
    interface = "org.rollcall.Attendance1",
    default_service = "org.rollcall.Attendance1",
    default_path = "/org/rollcall/Attendance1"
)]
trait Attendance {
    async fn train(&self, force: bool) -> zbus::Result<String>;
    async fn status(&self) -> zbus::Result<String>;
    async fn open_session(&self, token: &str) -> zbus::Result<i64>;
    async fn close_session(&self, token: &str) -> zbus::Result<bool>;
    async fn start_stream(&self, session: &str) -> zbus::Result<()>;
    async fn stop_camera(&self) -> zbus::Result<()>;
    async fn latest_frame(&self) -> zbus::Result<Vec<u8>>;
    async fn last_recognition(&self) -> zbus::Result<String>;
    async fn process_frame(&self, session: &str, jpeg: &[u8]) -> zbus::Result<String>;
    async fn enroll(&self, identity: &str, name: &str) -> zbus::Result<String>;
    async fn remove_identity(&self, identity: &str) -> zbus::Result<String>;
    async fn attendance(&self, token: &str) -> zbus::Result<String>;
    async fn reset(&self) -> zbus::Result<String>;
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let gallery_root = cli.gallery.clone().unwrap_or_else(|| data_dir().join("gallery"));

    match cli.command {
        Commands::Gallery => list_gallery(&gallery_root)?,
        Commands::Recognize { image, threshold } => {
            let models = cli.models.unwrap_or_else(|| data_dir().join("models"));
            let detector = cli
                .detector
                .unwrap_or_else(|| data_dir().join("models").join("det_10g.onnx"));
            recognize_offline(gallery_root, models, detector, image, threshold)?;
        }
        command => {
            let conn = zbus::Connection::session()
                .await
                .context("cannot connect to the session bus")?;
            let proxy = AttendanceProxy::new(&conn)
                .await
                .context("rollcalld is not reachable")?;
            run_remote(&proxy, command).await?;
        }
    }

    Ok(())
}

async fn run_remote(proxy: &AttendanceProxy<'_>, command: Commands) -> Result<()> {
    match command {
        Commands::Train { force } => print_json(&proxy.train(force).await?),
        Commands::Status => print_json(&proxy.status().await?),
        Commands::Stream { session } => {
            proxy.start_stream(session.as_deref().unwrap_or("")).await?;
            match session {
                Some(token) => println!("Streaming for session {token}"),
                None => println!("Streaming in preview mode"),
            }
        }
        Commands::StopCamera => {
            proxy.stop_camera().await?;
            println!("Camera released");
        }
        Commands::Snapshot { output } => {
            let jpeg = proxy.latest_frame().await?;
            if jpeg.is_empty() {
                bail!("no frame available; start the stream first");
            }
            std::fs::write(&output, &jpeg)
                .with_context(|| format!("failed to write {}", output.display()))?;
            println!("Saved {} bytes to {}", jpeg.len(), output.display());
        }
        Commands::Enroll {
            identity,
            name,
            samples,
        } => {
            let mut saved = 0;
            for attempt in 1..=samples {
                let reply = proxy.enroll(&identity, &name).await?;
                let value: serde_json::Value = serde_json::from_str(&reply)?;
                println!("[{attempt}/{samples}] {}", value["status"].as_str().unwrap_or("?"));
                match value["status"].as_str() {
                    Some("saved") => saved += 1,
                    Some("duplicate") => bail!(
                        "face already enrolled as {}",
                        value["identity"].as_str().unwrap_or("another identity")
                    ),
                    _ => {}
                }
                tokio::time::sleep(Duration::from_millis(300)).await;
            }
            if saved == 0 {
                bail!("no samples captured for {identity}");
            }
            print_json(&proxy.train(true).await?);
        }
        Commands::Remove { identity } => print_json(&proxy.remove_identity(&identity).await?),
        Commands::OpenSession { token } => {
            let id = proxy.open_session(&token).await?;
            println!("Session {token} active (id {id})");
        }
        Commands::CloseSession { token } => {
            if proxy.close_session(&token).await? {
                println!("Session {token} closed");
            } else {
                println!("No active session {token}");
            }
        }
        Commands::Submit { session, image } => {
            let jpeg = std::fs::read(&image)
                .with_context(|| format!("failed to read {}", image.display()))?;
            print_json(&proxy.process_frame(&session, &jpeg).await?);
        }
        Commands::Attendance { session } => print_json(&proxy.attendance(&session).await?),
        Commands::Last => print_json(&proxy.last_recognition().await?),
        Commands::Reset { yes } => {
            if !yes {
                bail!("reset deletes every sample and attendance record; pass --yes to confirm");
            }
            print_json(&proxy.reset().await?);
        }
        Commands::Gallery | Commands::Recognize { .. } => bail!("offline command sent to the daemon"),
    }
    Ok(())
}

fn list_gallery(root: &std::path::Path) -> Result<()> {
    let entries = gallery::index(root)?;
    if entries.is_empty() {
        println!("No samples under {}", root.display());
        return Ok(());
    }
    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    for entry in &entries {
        *counts.entry(entry.identity.to_string()).or_default() += 1;
    }
    for (identity, count) in &counts {
        println!("{identity:<24} {count} samples");
    }
    println!("{} identities, {} samples", counts.len(), entries.len());
    Ok(())
}

fn recognize_offline(
    gallery_root: PathBuf,
    models: PathBuf,
    detector_model: PathBuf,
    image: PathBuf,
    threshold: Option<f64>,
) -> Result<()> {
    let config = RecognitionConfig::default();
    let threshold = threshold.unwrap_or(config.preview_threshold);

    let classifier = Arc::new(ClassifierService::open(
        gallery_root,
        ModelStore::new(models),
        config.train_debounce(),
    ));
    if !classifier.is_trained() {
        bail!("no trained model found; run `rollcall train` first");
    }

    let model_path = detector_model
        .to_str()
        .context("detector model path is not valid UTF-8")?;
    let backend = ScrfdDetector::load(model_path)?;
    let detector = Detector::new(
        backend,
        DetectorConfig {
            target_width: config.detect_width,
            min_face_size: config.min_face_size,
        },
    );
    let pipeline: RecognitionPipeline = RecognitionPipeline::new(classifier, detector);

    let bytes = std::fs::read(&image).with_context(|| format!("failed to read {}", image.display()))?;
    let matches = pipeline.recognize_bytes(&bytes, threshold)?;
    tracing::debug!(faces = matches.len(), threshold, "offline recognition");
    if matches.is_empty() {
        println!("No faces detected");
        return Ok(());
    }
    for m in &matches {
        let distance = m
            .distance
            .map(|d| format!("{d:.1}"))
            .unwrap_or_else(|| "-".into());
        println!(
            "{:<24} confidence {:>5.1}  distance {:>6}  box {}x{}+{}+{}",
            m.recognition.tag(),
            m.confidence,
            distance,
            m.bbox.width,
            m.bbox.height,
            m.bbox.x,
            m.bbox.y,
        );
    }
    Ok(())
}

fn print_json(text: &str) {
    match serde_json::from_str::<serde_json::Value>(text) {
        Ok(value) => println!(
            "{}",
            serde_json::to_string_pretty(&value).unwrap_or_else(|_| text.to_string())
        ),
        Err(_) => println!("{text}"),
    }
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall")
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_stream_and_train() {
        let cli = Cli::parse_from(["rollcall", "stream", "--session", "lecture"]);
        assert!(matches!(cli.command, Commands::Stream { session: Some(ref s) } if s == "lecture"));

        let cli = Cli::parse_from(["rollcall", "train", "--force"]);
        assert!(matches!(cli.command, Commands::Train { force: true }));
    }

    #[test]
    fn test_parse_recognize_with_global_paths() {
        let cli = Cli::parse_from([
            "rollcall",
            "recognize",
            "face.jpg",
            "--threshold",
            "40",
            "--gallery",
            "/tmp/g",
        ]);
        assert_eq!(cli.gallery, Some(PathBuf::from("/tmp/g")));
        assert!(matches!(cli.command, Commands::Recognize { threshold: Some(t), .. } if t == 40.0));
    }
}
