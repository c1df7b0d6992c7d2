use crate::session::SessionSettings;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
}

/// Station configuration: optional TOML file, then `ROLLCALL_*` overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// V4L2 device path.
    pub camera_device: String,
    pub frame_width: u32,
    pub frame_height: u32,
    /// Directory containing `det_10g.onnx` and `w600k_r50.onnx`.
    pub model_dir: PathBuf,
    /// SQLite database of registered signatures.
    pub identity_db: PathBuf,
    /// Where registration frames are archived.
    pub faces_dir: PathBuf,
    pub ledger_path: PathBuf,
    pub sheet_name: String,
    pub error_log: PathBuf,
    /// Signature distance below which a face matches.
    pub match_tolerance: f32,
    /// Run recognition on every Nth frame...
    pub recognize_every: u32,
    /// ...and no more often than this.
    pub recognize_interval_ms: u64,
    /// Try code decoding on every Nth frame.
    pub scan_every: u32,
    /// How long nobody is recognised before the operator is prompted.
    pub unrecognized_grace_ms: u64,
    /// Capture without waiting for the operator.
    pub auto_capture: bool,
    pub cycle_pause_ms: u64,
    pub retry_pause_ms: u64,
    /// Realtime Database root URL; unset disables mirroring.
    pub mirror_url: Option<String>,
    /// Database secret or ID token; read but never written back out.
    #[serde(skip_serializing)]
    pub mirror_auth: Option<String>,
    pub mirror_timeout_ms: u64,
    /// Text-to-speech command line, message appended as last argument.
    pub speech_command: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = data_dir();
        Self {
            camera_device: "/dev/video0".to_string(),
            frame_width: 640,
            frame_height: 480,
            model_dir: data_dir.join("models"),
            identity_db: data_dir.join("identities.db"),
            faces_dir: data_dir.join("registered_faces"),
            ledger_path: PathBuf::from("attendance.xlsx"),
            sheet_name: "Attendance".to_string(),
            error_log: PathBuf::from("error_log.txt"),
            match_tolerance: rollcall_core::DEFAULT_TOLERANCE,
            recognize_every: 10,
            recognize_interval_ms: 300,
            scan_every: 5,
            unrecognized_grace_ms: 2000,
            auto_capture: false,
            cycle_pause_ms: 1000,
            retry_pause_ms: 1000,
            mirror_url: None,
            mirror_auth: None,
            mirror_timeout_ms: 3000,
            speech_command: None,
        }
    }
}

impl Config {
    /// Load from `path` (if given), then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let var = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if let Some(v) = var("ROLLCALL_CAMERA_DEVICE") {
            self.camera_device = v;
        }
        set_parsed(&mut self.frame_width, var("ROLLCALL_FRAME_WIDTH"));
        set_parsed(&mut self.frame_height, var("ROLLCALL_FRAME_HEIGHT"));
        set_path(&mut self.model_dir, var("ROLLCALL_MODEL_DIR"));
        set_path(&mut self.identity_db, var("ROLLCALL_IDENTITY_DB"));
        set_path(&mut self.faces_dir, var("ROLLCALL_FACES_DIR"));
        set_path(&mut self.ledger_path, var("ROLLCALL_LEDGER_PATH"));
        if let Some(v) = var("ROLLCALL_SHEET_NAME") {
            self.sheet_name = v;
        }
        set_path(&mut self.error_log, var("ROLLCALL_ERROR_LOG"));
        set_parsed(&mut self.match_tolerance, var("ROLLCALL_MATCH_TOLERANCE"));
        set_parsed(&mut self.recognize_every, var("ROLLCALL_RECOGNIZE_EVERY"));
        set_parsed(&mut self.recognize_interval_ms, var("ROLLCALL_RECOGNIZE_INTERVAL_MS"));
        set_parsed(&mut self.scan_every, var("ROLLCALL_SCAN_EVERY"));
        set_parsed(&mut self.unrecognized_grace_ms, var("ROLLCALL_UNRECOGNIZED_GRACE_MS"));
        if let Some(v) = var("ROLLCALL_AUTO_CAPTURE") {
            self.auto_capture = v != "0" && !v.eq_ignore_ascii_case("false");
        }
        set_parsed(&mut self.cycle_pause_ms, var("ROLLCALL_CYCLE_PAUSE_MS"));
        set_parsed(&mut self.retry_pause_ms, var("ROLLCALL_RETRY_PAUSE_MS"));
        if let Some(v) = var("ROLLCALL_MIRROR_URL") {
            self.mirror_url = Some(v);
        }
        if let Some(v) = var("ROLLCALL_MIRROR_AUTH") {
            self.mirror_auth = Some(v);
        }
        set_parsed(&mut self.mirror_timeout_ms, var("ROLLCALL_MIRROR_TIMEOUT_MS"));
        if let Some(v) = var("ROLLCALL_SPEECH_COMMAND") {
            self.speech_command = Some(v);
        }
    }

    /// Path to the SCRFD detection model.
    pub fn detector_model_path(&self) -> PathBuf {
        self.model_dir.join("det_10g.onnx")
    }

    /// Path to the ArcFace embedding model.
    pub fn embedder_model_path(&self) -> PathBuf {
        self.model_dir.join("w600k_r50.onnx")
    }

    pub fn mirror_timeout(&self) -> Duration {
        Duration::from_millis(self.mirror_timeout_ms)
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            recognize_every: self.recognize_every.max(1),
            recognize_interval: Duration::from_millis(self.recognize_interval_ms),
            scan_every: self.scan_every.max(1),
            unrecognized_grace: Duration::from_millis(self.unrecognized_grace_ms),
            auto_capture: self.auto_capture,
            cycle_pause: Duration::from_millis(self.cycle_pause_ms),
            retry_pause: Duration::from_millis(self.retry_pause_ms),
        }
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

fn set_parsed<T: FromStr>(field: &mut T, value: Option<String>) {
    if let Some(parsed) = value.and_then(|v| v.trim().parse().ok()) {
        *field = parsed;
    }
}

fn set_path(field: &mut PathBuf, value: Option<String>) {
    if let Some(v) = value {
        *field = PathBuf::from(v);
    }
}
