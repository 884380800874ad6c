use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::storage::CameraStorage;
use crate::supervisor::ReconnectPolicy;
use crate::transcode::{ClipSettings, TranscodeSettings};

const DEFAULT_STORAGE_ROOT: &str = "recordings";
const DEFAULT_DB_PATH: &str = "nvr.db";
const DEFAULT_RETENTION_DAYS: u32 = 30;
const DEFAULT_WORKER_THREADS: usize = 2;
const DEFAULT_QUEUE_CAPACITY: usize = 256;
const DEFAULT_STOP_TIMEOUT_SECS: u64 = 5;
pub const DEFAULT_CONTINUOUS_SEGMENT_SECS: u64 = 600;
const DEFAULT_MQTT_TOPIC_PREFIX: &str = "nvr";
const DEFAULT_MQTT_CLIENT_ID: &str = "nvrd";

// ----------------------------------------------------------------------------
// Per-camera configuration
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StreamKind {
    #[default]
    #[serde(alias = "rtsp")]
    TransportStream,
    #[serde(alias = "http-mjpeg")]
    PullMultipartImage,
    #[serde(alias = "http-snapshot")]
    PeriodicSnapshot,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportHint {
    #[default]
    Tcp,
    Udp,
}

impl TransportHint {
    pub fn as_str(self) -> &'static str {
        match self {
            TransportHint::Tcp => "tcp",
            TransportHint::Udp => "udp",
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MotionAlgorithm {
    #[default]
    Differencing,
    #[serde(alias = "mog2", alias = "knn")]
    BackgroundSubtraction,
}

/// Region of the frame, in source-frame pixel coordinates.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Zone {
    #[serde(alias = "rectangle")]
    Rect {
        x: f64,
        y: f64,
        width: f64,
        height: f64,
    },
    Polygon { points: Vec<[f64; 2]> },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionSettings {
    pub enabled: bool,
    pub algorithm: MotionAlgorithm,
    /// 0.0 (least sensitive) to 1.0 (most sensitive).
    pub sensitivity: f64,
    /// Minimum connected-component area in source pixels.
    pub min_area: u32,
    pub blur_kernel: u32,
    pub diff_threshold: u8,
    pub history: u32,
    pub var_threshold: f64,
    pub detect_shadows: bool,
    /// Inclusion zones. Empty means the whole frame.
    pub zones: Vec<Zone>,
    pub exclusion_zones: Vec<Zone>,
}

impl Default for MotionSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            algorithm: MotionAlgorithm::Differencing,
            sensitivity: 0.5,
            min_area: 500,
            blur_kernel: 21,
            diff_threshold: 25,
            history: 500,
            var_threshold: 16.0,
            detect_shadows: true,
            zones: Vec::new(),
            exclusion_zones: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifySettings {
    pub on_motion: bool,
    pub attach_clip: bool,
}

/// Immutable configuration of one camera. Replacing it means recreating the recorder.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CameraConfig {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub transport: TransportHint,
    #[serde(default)]
    pub stream_kind: StreamKind,
    #[serde(default = "default_snapshot_interval")]
    pub snapshot_interval_secs: f64,
    /// Frame rate assumed when the source does not report one.
    #[serde(default = "default_fps_hint")]
    pub fps_hint: f64,
    /// Transport kind only: decode one frame out of every N for analysis.
    #[serde(default = "default_decode_every_n")]
    pub decode_every_n: u32,
    #[serde(default = "default_true")]
    pub continuous_recording: bool,
    #[serde(default)]
    pub motion: MotionSettings,
    #[serde(default = "default_pre_roll")]
    pub pre_roll_secs: f64,
    #[serde(default = "default_post_roll")]
    pub post_roll_secs: f64,
    #[serde(default = "default_cooldown")]
    pub cooldown_secs: f64,
    #[serde(default = "default_min_motion_duration")]
    pub min_motion_duration_secs: f64,
    #[serde(default)]
    pub storage_path: Option<PathBuf>,
    #[serde(default)]
    pub notify: NotifySettings,
}

fn default_true() -> bool {
    true
}

fn default_snapshot_interval() -> f64 {
    1.0
}

fn default_fps_hint() -> f64 {
    20.0
}

fn default_decode_every_n() -> u32 {
    5
}

fn default_pre_roll() -> f64 {
    5.0
}

fn default_post_roll() -> f64 {
    5.0
}

fn default_cooldown() -> f64 {
    2.0
}

fn default_min_motion_duration() -> f64 {
    1.0
}

impl CameraConfig {
    /// Minimal config with every optional field at its default.
    pub fn new(id: impl Into<String>, url: impl Into<String>, stream_kind: StreamKind) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            url: url.into(),
            username: None,
            password: None,
            transport: TransportHint::default(),
            stream_kind,
            snapshot_interval_secs: default_snapshot_interval(),
            fps_hint: default_fps_hint(),
            decode_every_n: default_decode_every_n(),
            continuous_recording: true,
            motion: MotionSettings::default(),
            pre_roll_secs: default_pre_roll(),
            post_roll_secs: default_post_roll(),
            cooldown_secs: default_cooldown(),
            min_motion_duration_secs: default_min_motion_duration(),
            storage_path: None,
            notify: NotifySettings::default(),
        }
    }

    pub fn validate(&mut self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(anyhow!("camera id must not be empty"));
        }
        if self.id.contains(['/', '\\']) || self.id == "." || self.id == ".." {
            return Err(anyhow!("camera id '{}' is not a valid directory name", self.id));
        }
        if self.name.trim().is_empty() {
            self.name = self.id.clone();
        }
        let url = Url::parse(&self.url)
            .with_context(|| format!("camera {}: invalid url '{}'", self.id, self.url))?;
        let scheme_ok = match (self.stream_kind, url.scheme()) {
            (_, "stub") => true,
            (StreamKind::TransportStream, scheme) => {
                matches!(scheme, "rtsp" | "rtsps" | "rtmp" | "http" | "https" | "file")
            }
            (_, scheme) => matches!(scheme, "http" | "https"),
        };
        if !scheme_ok {
            return Err(anyhow!(
                "camera {}: scheme '{}' does not match stream kind {:?}",
                self.id,
                url.scheme(),
                self.stream_kind
            ));
        }
        for (name, value) in [
            ("pre_roll_secs", self.pre_roll_secs),
            ("post_roll_secs", self.post_roll_secs),
            ("cooldown_secs", self.cooldown_secs),
            ("min_motion_duration_secs", self.min_motion_duration_secs),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(anyhow!("camera {}: {} must be >= 0", self.id, name));
            }
        }
        if !(self.snapshot_interval_secs > 0.0) {
            return Err(anyhow!("camera {}: snapshot_interval_secs must be > 0", self.id));
        }
        if !(self.fps_hint > 0.0) {
            return Err(anyhow!("camera {}: fps_hint must be > 0", self.id));
        }
        if self.decode_every_n == 0 {
            return Err(anyhow!("camera {}: decode_every_n must be >= 1", self.id));
        }
        if !(0.0..=1.0).contains(&self.motion.sensitivity) {
            return Err(anyhow!("camera {}: sensitivity must be within 0..=1", self.id));
        }
        if self.motion.blur_kernel % 2 == 0 {
            return Err(anyhow!("camera {}: blur_kernel must be odd", self.id));
        }
        if self.motion.history == 0 {
            return Err(anyhow!("camera {}: history must be >= 1", self.id));
        }
        Ok(())
    }

    /// Endpoint URL with credentials injected into the authority.
    pub fn stream_url(&self) -> Result<String> {
        let mut url = Url::parse(&self.url)?;
        if let (Some(user), Some(pass)) = (self.username.as_deref(), self.password.as_deref()) {
            url.set_username(user)
                .map_err(|_| anyhow!("camera {}: url cannot carry credentials", self.id))?;
            url.set_password(Some(pass))
                .map_err(|_| anyhow!("camera {}: url cannot carry credentials", self.id))?;
        }
        Ok(url.to_string())
    }

    /// Nominal frame rate of the recordable stream.
    pub fn nominal_fps(&self) -> f64 {
        match self.stream_kind {
            StreamKind::PeriodicSnapshot => 1.0 / self.snapshot_interval_secs,
            _ => self.fps_hint,
        }
    }

    /// Pre-roll ring size: ceil(fps x pre_roll_secs).
    pub fn pre_roll_capacity(&self) -> usize {
        (self.nominal_fps() * self.pre_roll_secs).ceil() as usize
    }

    pub fn pre_roll(&self) -> Duration {
        Duration::from_secs_f64(self.pre_roll_secs)
    }

    pub fn post_roll(&self) -> Duration {
        Duration::from_secs_f64(self.post_roll_secs)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs_f64(self.cooldown_secs)
    }

    pub fn min_motion_duration(&self) -> Duration {
        Duration::from_secs_f64(self.min_motion_duration_secs)
    }

    pub fn storage_dir(&self, storage_root: &Path) -> PathBuf {
        self.storage_path
            .clone()
            .unwrap_or_else(|| storage_root.to_path_buf())
            .join(&self.id)
    }
}

// ----------------------------------------------------------------------------
// Settings shared by every recorder
// ----------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct RecorderSettings {
    pub storage_root: PathBuf,
    pub continuous_segment: Duration,
    pub stop_timeout: Duration,
    pub reconnect: ReconnectPolicy,
    pub transcode: TranscodeSettings,
    pub clip: ClipSettings,
}

impl Default for RecorderSettings {
    fn default() -> Self {
        Self {
            storage_root: PathBuf::from(DEFAULT_STORAGE_ROOT),
            continuous_segment: Duration::from_secs(DEFAULT_CONTINUOUS_SEGMENT_SECS),
            stop_timeout: Duration::from_secs(DEFAULT_STOP_TIMEOUT_SECS),
            reconnect: ReconnectPolicy::default(),
            transcode: TranscodeSettings::default(),
            clip: ClipSettings::default(),
        }
    }
}

// ----------------------------------------------------------------------------
// nvrd daemon configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Deserialize, Default)]
struct NvrdConfigFile {
    storage_root: Option<PathBuf>,
    db_path: Option<String>,
    retention_days: Option<u32>,
    continuous_segment_secs: Option<u64>,
    stop_timeout_secs: Option<u64>,
    workers: Option<WorkersConfigFile>,
    reconnect: Option<ReconnectPolicy>,
    transcode: Option<TranscodeSettings>,
    clip: Option<ClipSettings>,
    mqtt: Option<MqttConfigFile>,
    #[serde(default)]
    cameras: Vec<CameraConfig>,
}

#[derive(Debug, Deserialize, Default)]
struct WorkersConfigFile {
    threads: Option<usize>,
    queue_capacity: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct MqttConfigFile {
    broker: Option<String>,
    topic_prefix: Option<String>,
    client_id: Option<String>,
    username: Option<String>,
    password: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MqttSettings {
    pub broker: String,
    pub topic_prefix: String,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NvrdConfig {
    pub db_path: String,
    pub retention_days: u32,
    pub worker_threads: usize,
    pub queue_capacity: usize,
    pub recorder: RecorderSettings,
    pub mqtt: Option<MqttSettings>,
    pub cameras: Vec<CameraConfig>,
}

impl NvrdConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("NVR_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) => Some(read_config_file(Path::new(path))?),
            None => None,
        };
        Self::load_from(file_cfg.unwrap_or_default())
    }

    pub fn load_path(path: &Path) -> Result<Self> {
        Self::load_from(read_config_file(path)?)
    }

    fn load_from(file: NvrdConfigFile) -> Result<Self> {
        let mut cfg = Self::from_file(file);
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: NvrdConfigFile) -> Self {
        let defaults = RecorderSettings::default();
        let recorder = RecorderSettings {
            storage_root: file.storage_root.unwrap_or(defaults.storage_root),
            continuous_segment: file
                .continuous_segment_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.continuous_segment),
            stop_timeout: file
                .stop_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.stop_timeout),
            reconnect: file.reconnect.unwrap_or(defaults.reconnect),
            transcode: file.transcode.unwrap_or(defaults.transcode),
            clip: file.clip.unwrap_or(defaults.clip),
        };
        let mqtt = file.mqtt.and_then(|mqtt| {
            let broker = mqtt.broker?;
            Some(MqttSettings {
                broker,
                topic_prefix: mqtt
                    .topic_prefix
                    .unwrap_or_else(|| DEFAULT_MQTT_TOPIC_PREFIX.to_string()),
                client_id: mqtt
                    .client_id
                    .unwrap_or_else(|| DEFAULT_MQTT_CLIENT_ID.to_string()),
                username: mqtt.username,
                password: mqtt.password,
            })
        });
        Self {
            db_path: file.db_path.unwrap_or_else(|| DEFAULT_DB_PATH.to_string()),
            retention_days: file.retention_days.unwrap_or(DEFAULT_RETENTION_DAYS),
            worker_threads: file
                .workers
                .as_ref()
                .and_then(|workers| workers.threads)
                .unwrap_or(DEFAULT_WORKER_THREADS),
            queue_capacity: file
                .workers
                .and_then(|workers| workers.queue_capacity)
                .unwrap_or(DEFAULT_QUEUE_CAPACITY),
            recorder,
            mqtt,
            cameras: file.cameras,
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(root) = std::env::var("NVR_STORAGE_ROOT") {
            if !root.trim().is_empty() {
                self.recorder.storage_root = PathBuf::from(root);
            }
        }
        if let Ok(db_path) = std::env::var("NVR_DB_PATH") {
            if !db_path.trim().is_empty() {
                self.db_path = db_path;
            }
        }
        if let Ok(broker) = std::env::var("NVR_MQTT_BROKER") {
            if !broker.trim().is_empty() {
                match self.mqtt.as_mut() {
                    Some(mqtt) => mqtt.broker = broker,
                    None => {
                        self.mqtt = Some(MqttSettings {
                            broker,
                            topic_prefix: DEFAULT_MQTT_TOPIC_PREFIX.to_string(),
                            client_id: DEFAULT_MQTT_CLIENT_ID.to_string(),
                            username: None,
                            password: None,
                        })
                    }
                }
            }
        }
        if let Ok(days) = std::env::var("NVR_RETENTION_DAYS") {
            self.retention_days = days
                .parse()
                .map_err(|_| anyhow!("NVR_RETENTION_DAYS must be an integer number of days"))?;
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        if self.retention_days == 0 {
            return Err(anyhow!("retention_days must be greater than zero"));
        }
        if self.worker_threads == 0 {
            return Err(anyhow!("workers.threads must be greater than zero"));
        }
        if self.queue_capacity == 0 {
            return Err(anyhow!("workers.queue_capacity must be greater than zero"));
        }
        if self.recorder.continuous_segment.is_zero() {
            return Err(anyhow!("continuous_segment_secs must be greater than zero"));
        }
        self.recorder.reconnect.validate()?;
        let mut seen = std::collections::HashSet::new();
        for camera in &mut self.cameras {
            camera.validate()?;
            if !seen.insert(camera.id.clone()) {
                return Err(anyhow!("duplicate camera id '{}'", camera.id));
            }
        }
        Ok(())
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(u64::from(self.retention_days) * 24 * 60 * 60)
    }

    /// Recording directory of every configured camera, honoring per-camera
    /// `storage_path` overrides.
    pub fn camera_storage(&self) -> Vec<CameraStorage> {
        self.cameras
            .iter()
            .map(|camera| CameraStorage {
                camera_id: camera.id.clone(),
                dir: camera.storage_dir(&self.recorder.storage_root),
            })
            .collect()
    }
}

fn read_config_file(path: &Path) -> Result<NvrdConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}
