use rollcall_core::RecognitionConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Daemon configuration.
///
/// Built from defaults, then the TOML file named by `ROLLCALL_CONFIG` (if
/// set), then `ROLLCALL_*` environment overrides.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    pub camera_width: u32,
    pub camera_height: u32,
    /// Enrollment tree: one folder per identity.
    pub gallery_dir: PathBuf,
    /// Directory holding the trained classifier artifacts.
    pub model_dir: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// SCRFD ONNX model used for face detection.
    pub detector_model: PathBuf,
    /// Streaming frame-rate cap.
    pub fps: u32,
    /// Without a bound session, recognition runs on every Nth frame.
    pub detect_interval: u32,
    /// JPEG quality of streamed frames.
    pub jpeg_quality: u8,
    pub recognition: RecognitionConfig,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = data_dir();
        Self {
            camera_device: "/dev/video0".to_string(),
            camera_width: 640,
            camera_height: 480,
            gallery_dir: data_dir.join("gallery"),
            model_dir: data_dir.join("models"),
            db_path: data_dir.join("attendance.db"),
            detector_model: data_dir.join("models").join("det_10g.onnx"),
            fps: 15,
            detect_interval: 3,
            jpeg_quality: 70,
            recognition: RecognitionConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from the optional TOML file and the environment.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("ROLLCALL_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Apply `ROLLCALL_*` environment overrides.
    pub fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("ROLLCALL_CAMERA_DEVICE") {
            self.camera_device = v;
        }
        env_path("ROLLCALL_GALLERY_DIR", &mut self.gallery_dir);
        env_path("ROLLCALL_MODEL_DIR", &mut self.model_dir);
        env_path("ROLLCALL_DB_PATH", &mut self.db_path);
        env_path("ROLLCALL_DETECTOR_MODEL", &mut self.detector_model);
        self.camera_width = env_u32("ROLLCALL_CAMERA_WIDTH", self.camera_width);
        self.camera_height = env_u32("ROLLCALL_CAMERA_HEIGHT", self.camera_height);
        self.fps = env_u32("ROLLCALL_FPS", self.fps).max(1);
        self.detect_interval = env_u32("ROLLCALL_DETECT_INTERVAL", self.detect_interval).max(1);
        self.recognition.attendance_threshold =
            env_f64("ROLLCALL_ATTENDANCE_THRESHOLD", self.recognition.attendance_threshold);
        self.recognition.preview_threshold =
            env_f64("ROLLCALL_PREVIEW_THRESHOLD", self.recognition.preview_threshold);
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

fn env_path(key: &str, target: &mut PathBuf) {
    if let Ok(v) = std::env::var(key) {
        *target = PathBuf::from(v);
    }
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
