use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid functions file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid time slot {0:?} (expected HH:MM-HH:MM)")]
    TimeSlot(String),
    #[error("function id {0} is defined more than once")]
    DuplicateId(i64),
}

/// How faces are keyed across frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotStrategy {
    /// Greedy IoU association with short-gap tolerance.
    Iou,
    /// Exact integer box coordinates.
    Exact,
}

impl SlotStrategy {
    fn parse(value: &str) -> Self {
        match value {
            "exact" => Self::Exact,
            _ => Self::Iou,
        }
    }
}

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Camera used when a preview asks for source "0".
    pub default_camera: String,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// JSON identity gallery.
    pub gallery_path: PathBuf,
    /// SQLite database for occupancy aggregates.
    pub db_path: PathBuf,
    pub recordings_dir: PathBuf,
    /// TOML file listing scheduled functions.
    pub functions_path: PathBuf,
    /// Only every n-th frame is analysed.
    pub frame_skip: u64,
    /// Cosine distance below which a face matches an identity.
    pub distance_threshold: f32,
    pub detector_score_threshold: f32,
    pub vote_window: usize,
    pub switch_threshold: usize,
    pub slot_strategy: SlotStrategy,
    /// Loop pacing for scheduled pipelines.
    pub scheduled_interval: Duration,
    /// Loop pacing for live previews.
    pub preview_interval: Duration,
    pub recording_fps: u32,
    /// Samples per occupancy aggregate.
    pub aggregate_samples: usize,
    /// Bound on queued presence notifications.
    pub notification_queue: usize,
    /// How often the scheduler re-evaluates time slots.
    pub schedule_poll: Duration,
    /// Use the session bus instead of the system bus.
    pub session_bus: bool,
}

impl Config {
    /// Load configuration from `VIGIL_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| home_dir().join(".local/share"))
            .join("vigil");
        let config_dir = std::env::var("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| home_dir().join(".config"))
            .join("vigil");

        Self {
            default_camera: std::env::var("VIGIL_CAMERA_DEVICE")
                .unwrap_or_else(|_| "/dev/video0".to_string()),
            model_dir: env_path("VIGIL_MODEL_DIR", data_dir.join("models")),
            gallery_path: env_path("VIGIL_GALLERY_PATH", data_dir.join("gallery.json")),
            db_path: env_path("VIGIL_DB_PATH", data_dir.join("occupancy.db")),
            recordings_dir: env_path("VIGIL_RECORDINGS_DIR", data_dir.join("recordings")),
            functions_path: env_path("VIGIL_FUNCTIONS_FILE", config_dir.join("functions.toml")),
            frame_skip: env_u64("VIGIL_FRAME_SKIP", 3).max(1),
            distance_threshold: env_f32("VIGIL_DISTANCE_THRESHOLD", 0.5),
            detector_score_threshold: env_f32("VIGIL_DETECTOR_THRESHOLD", 0.5),
            vote_window: env_usize("VIGIL_VOTE_WINDOW", 10).max(1),
            switch_threshold: env_usize("VIGIL_SWITCH_THRESHOLD", 35).max(1),
            slot_strategy: SlotStrategy::parse(
                &std::env::var("VIGIL_SLOT_STRATEGY").unwrap_or_default(),
            ),
            scheduled_interval: Duration::from_millis(env_u64("VIGIL_SCHEDULED_INTERVAL_MS", 100)),
            preview_interval: Duration::from_millis(env_u64("VIGIL_PREVIEW_INTERVAL_MS", 300)),
            recording_fps: env_u64("VIGIL_RECORDING_FPS", 10).clamp(1, 120) as u32,
            aggregate_samples: env_usize("VIGIL_AGGREGATE_SAMPLES", 120).max(1),
            notification_queue: env_usize("VIGIL_NOTIFICATION_QUEUE", 64).max(1),
            schedule_poll: Duration::from_secs(env_u64("VIGIL_SCHEDULE_POLL_SECS", 30).max(1)),
            session_bus: std::env::var("VIGIL_SESSION_BUS")
                .map(|v| v == "1")
                .unwrap_or(false),
        }
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> String {
        self.model_dir
            .join("det_10g.onnx")
            .to_string_lossy()
            .into_owned()
    }

    /// Path to the ArcFace recognition model.
    pub fn arcface_model_path(&self) -> String {
        self.model_dir
            .join("w600k_r50.onnx")
            .to_string_lossy()
            .into_owned()
    }

    /// Maps the preview shorthand "0" to the default camera.
    pub fn resolve_source<'a>(&'a self, source: &'a str) -> &'a str {
        if source.trim() == "0" {
            &self.default_camera
        } else {
            source
        }
    }
}

/// Daily time window; wraps past midnight when `end < start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TimeSlot {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl TimeSlot {
    /// Whether `t` falls inside the window (start inclusive, end exclusive).
    /// Equal endpoints cover the whole day.
    pub fn contains(&self, t: NaiveTime) -> bool {
        if self.start == self.end {
            true
        } else if self.start < self.end {
            self.start <= t && t < self.end
        } else {
            t >= self.start || t < self.end
        }
    }
}

impl std::str::FromStr for TimeSlot {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::TimeSlot(s.to_string());
        let (start, end) = s.split_once('-').ok_or_else(invalid)?;
        let parse = |part: &str| NaiveTime::parse_from_str(part.trim(), "%H:%M").map_err(|_| invalid());
        Ok(Self {
            start: parse(start)?,
            end: parse(end)?,
        })
    }
}

impl TryFrom<String> for TimeSlot {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TimeSlot> for String {
    fn from(slot: TimeSlot) -> Self {
        format!("{}-{}", slot.start.format("%H:%M"), slot.end.format("%H:%M"))
    }
}

/// One scheduled monitoring function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionConfig {
    pub id: i64,
    pub name: String,
    pub camera_source: String,
    #[serde(default)]
    pub save_recordings: bool,
    #[serde(default)]
    pub notify: bool,
    /// Absent means always active.
    #[serde(default)]
    pub time_slot: Option<TimeSlot>,
}

impl FunctionConfig {
    pub fn active_at(&self, t: NaiveTime) -> bool {
        self.time_slot.map_or(true, |slot| slot.contains(t))
    }
}

#[derive(Debug, Deserialize)]
struct FunctionsFile {
    #[serde(default, rename = "function")]
    functions: Vec<FunctionConfig>,
}

/// Parse `[[function]]` tables from TOML text.
pub fn parse_functions(text: &str) -> Result<Vec<FunctionConfig>, ConfigError> {
    let file: FunctionsFile = toml::from_str(text)?;
    let mut seen = HashSet::new();
    for f in &file.functions {
        if !seen.insert(f.id) {
            return Err(ConfigError::DuplicateId(f.id));
        }
    }
    Ok(file.functions)
}

/// Load the functions file. A missing file means no scheduled functions.
pub fn load_functions(path: &Path) -> Result<Vec<FunctionConfig>, ConfigError> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!(path = %path.display(), "no functions file; scheduler idle");
            return Ok(Vec::new());
        }
        Err(source) => {
            return Err(ConfigError::Io {
                path: path.display().to_string(),
                source,
            })
        }
    };
    let functions = parse_functions(&text)?;
    tracing::info!(path = %path.display(), count = functions.len(), "loaded scheduled functions");
    Ok(functions)
}

fn home_dir() -> PathBuf {
    PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string()))
}

fn env_path(key: &str, default: PathBuf) -> PathBuf {
    std::env::var(key).map(PathBuf::from).unwrap_or(default)
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

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn test_time_slot_same_day() {
        let slot: TimeSlot = "08:00-17:30".parse().unwrap();
        assert!(slot.contains(t(8, 0)));
        assert!(slot.contains(t(12, 0)));
        assert!(!slot.contains(t(17, 30)));
        assert!(!slot.contains(t(7, 59)));
    }

    #[test]
    fn test_time_slot_wraps_midnight() {
        let slot: TimeSlot = "22:00-06:00".parse().unwrap();
        assert!(slot.contains(t(23, 0)));
        assert!(slot.contains(t(2, 0)));
        assert!(!slot.contains(t(6, 0)));
        assert!(!slot.contains(t(12, 0)));
    }

    #[test]
    fn test_time_slot_equal_endpoints_all_day() {
        let slot: TimeSlot = "09:00-09:00".parse().unwrap();
        assert!(slot.contains(t(3, 0)));
    }

    #[test]
    fn test_time_slot_rejects_garbage() {
        assert!("9am-5pm".parse::<TimeSlot>().is_err());
        assert!("08:00".parse::<TimeSlot>().is_err());
        assert!("25:00-26:00".parse::<TimeSlot>().is_err());
    }

    #[test]
    fn test_parse_functions() {
        let text = r#"
            [[function]]
            id = 1
            name = "lobby"
            camera_source = "/dev/video0"
            save_recordings = true
            notify = true
            time_slot = "08:00-18:00"

            [[function]]
            id = 2
            name = "dock"
            camera_source = "/srv/clips/dock.mp4"
        "#;
        let fns = parse_functions(text).unwrap();
        assert_eq!(fns.len(), 2);
        assert!(fns[0].save_recordings && fns[0].notify);
        assert!(fns[0].active_at(t(9, 0)));
        assert!(!fns[0].active_at(t(19, 0)));
        assert!(!fns[1].notify);
        assert!(fns[1].active_at(t(3, 0)));
    }

    #[test]
    fn test_parse_functions_rejects_duplicate_ids() {
        let text = r#"
            [[function]]
            id = 1
            name = "a"
            camera_source = "x.mp4"
            [[function]]
            id = 1
            name = "b"
            camera_source = "y.mp4"
        "#;
        assert!(matches!(parse_functions(text), Err(ConfigError::DuplicateId(1))));
    }

    #[test]
    fn test_bad_time_slot_is_parse_error() {
        let text = r#"
            [[function]]
            id = 1
            name = "a"
            camera_source = "x.mp4"
            time_slot = "noon"
        "#;
        assert!(matches!(parse_functions(text), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_missing_functions_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_functions(&dir.path().join("none.toml")).unwrap().is_empty());
    }

    #[test]
    fn test_resolve_preview_source() {
        let mut cfg = Config::from_env();
        cfg.default_camera = "/dev/video4".into();
        assert_eq!(cfg.resolve_source("0"), "/dev/video4");
        assert_eq!(cfg.resolve_source("/srv/a.mp4"), "/srv/a.mp4");
    }

    #[test]
    fn test_time_slot_round_trips_through_string() {
        let slot: TimeSlot = "22:15-06:05".parse().unwrap();
        assert_eq!(String::from(slot), "22:15-06:05");
    }
}
