use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::{DateTime, Utc};
use tempfile::TempDir;

use nvr_kernel::{
    CameraConfig, InMemoryPersistence, MotionState, NotificationDispatcher, Pipeline,
    ProcessLauncher, Recorder, RecorderDeps, RecorderRegistry, RecorderSettings, ReconnectPolicy,
    SegmentKind, SqlitePersistence, StreamKind, SystemLauncher, TranscodePipeline, WorkerPool,
};

#[derive(Clone, Default)]
struct CapturingNotifier {
    alerts: Arc<Mutex<Vec<(String, Option<PathBuf>)>>>,
}

impl NotificationDispatcher for CapturingNotifier {
    fn notify(&self, camera_name: &str, _timestamp: DateTime<Utc>, clip: Option<&Path>) -> Result<()> {
        self.alerts
            .lock()
            .unwrap()
            .push((camera_name.to_string(), clip.map(Path::to_path_buf)));
        Ok(())
    }
}

fn settings(root: &Path) -> RecorderSettings {
    RecorderSettings {
        storage_root: root.to_path_buf(),
        stop_timeout: Duration::from_secs(5),
        reconnect: ReconnectPolicy {
            base_delay_secs: 0.05,
            max_delay_secs: 0.1,
            jitter: 0.0,
            max_consecutive_errors: 3,
            stall_timeout_secs: 5.0,
        },
        ..RecorderSettings::default()
    }
}

fn deps(
    root: &Path,
    persistence: Arc<dyn nvr_kernel::PersistenceGateway>,
    notifier: Arc<dyn NotificationDispatcher>,
) -> RecorderDeps {
    deps_with(settings(root), persistence, notifier)
}

fn deps_with(
    settings: RecorderSettings,
    persistence: Arc<dyn nvr_kernel::PersistenceGateway>,
    notifier: Arc<dyn NotificationDispatcher>,
) -> RecorderDeps {
    let launcher: Arc<dyn ProcessLauncher> = Arc::new(SystemLauncher);
    let pipeline = Pipeline {
        persistence,
        notifier,
        transcoder: TranscodePipeline::new(
            settings.transcode.clone(),
            settings.clip.clone(),
            launcher.clone(),
        ),
    };
    RecorderDeps {
        settings,
        pool: Arc::new(WorkerPool::new(pipeline, 2, 128).expect("worker pool")),
        launcher,
    }
}

/// 50 fps stub with one second of motion starting at frame 10.
fn motion_camera(id: &str) -> CameraConfig {
    let mut cam = CameraConfig::new(
        id,
        format!("stub://{}?fps=50&motion=10-60", id),
        StreamKind::PullMultipartImage,
    );
    cam.name = format!("{} camera", id);
    cam.continuous_recording = false;
    cam.motion.sensitivity = 0.8;
    cam.pre_roll_secs = 0.2;
    cam.min_motion_duration_secs = 0.1;
    cam.post_roll_secs = 0.3;
    cam.cooldown_secs = 0.2;
    cam.notify.on_motion = true;
    cam
}

fn wait_for(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    false
}

#[test]
fn motion_burst_produces_one_event_and_segment() {
    let tmp = TempDir::new().unwrap();
    let store = Arc::new(InMemoryPersistence::new());
    let notifier = CapturingNotifier::default();
    let deps = deps(tmp.path(), store.clone(), Arc::new(notifier.clone()));
    let pool = deps.pool.clone();

    let mut recorder = Recorder::new(motion_camera("porch"), deps).unwrap();
    recorder.start().unwrap();

    assert!(wait_for(Duration::from_secs(10), || {
        store
            .segments()
            .iter()
            .any(|s| s.kind == SegmentKind::Motion)
    }));
    assert!(wait_for(Duration::from_secs(5), || {
        recorder.status().motion_state == MotionState::Idle && !recorder.status().is_recording
    }));
    assert!(recorder.stop());
    assert!(pool.wait_idle(Duration::from_secs(5)));

    let events = store.events();
    assert_eq!(events.len(), 1, "one motion event per burst");
    let event = &events[0];
    assert_eq!(event.camera_id, "porch");
    assert_eq!(event.camera_name, "porch camera");

    let snapshot = event.snapshot_path.as_ref().expect("snapshot written");
    assert!(snapshot.starts_with(tmp.path().join("porch").join("snapshots")));
    assert_eq!(
        snapshot.file_name().unwrap().to_str().unwrap(),
        format!("motion_{}.jpg", event.timestamp.format("%Y%m%d_%H%M%S"))
    );
    let jpeg = std::fs::read(snapshot).unwrap();
    assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);

    let segments = store.segments();
    let first_motion = segments
        .iter()
        .find(|s| s.kind == SegmentKind::Motion)
        .unwrap();
    assert_eq!(event.segment_id.as_deref(), Some(first_motion.id.as_str()));
    assert!(first_motion.path.exists());
    assert!(first_motion.name.ends_with(".mjpeg"));
    assert!(first_motion.size_bytes > 0);
    assert!(!first_motion.abandoned);
    assert!(segments.iter().all(|s| s.kind != SegmentKind::Continuous));

    let alerts = notifier.alerts.lock().unwrap();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0], ("porch camera".to_string(), None));
}

#[test]
fn motion_resumed_in_cooldown_extends_one_event() {
    let tmp = TempDir::new().unwrap();
    let store = Arc::new(InMemoryPersistence::new());
    let notifier = CapturingNotifier::default();
    let deps = deps(tmp.path(), store.clone(), Arc::new(notifier.clone()));
    let pool = deps.pool.clone();

    let mut cam = motion_camera("yard");
    cam.url = "stub://yard?fps=50&motion=10-40,70-90".to_string();
    cam.cooldown_secs = 1.0;
    cam.notify.attach_clip = true;
    let mut recorder = Recorder::new(cam, deps).unwrap();
    recorder.start().unwrap();

    let motion_segments = || {
        store
            .segments()
            .into_iter()
            .filter(|s| s.kind == SegmentKind::Motion)
            .count()
    };
    assert!(wait_for(Duration::from_secs(15), || motion_segments() >= 2));
    assert!(wait_for(Duration::from_secs(5), || {
        recorder.status().motion_state == MotionState::Idle
    }));
    assert!(recorder.stop());
    assert!(pool.wait_idle(Duration::from_secs(30)));

    assert_eq!(motion_segments(), 2);
    let events = store.events();
    assert_eq!(events.len(), 1, "resumed motion continues the same event");
    let mut motion: Vec<_> = store
        .segments()
        .into_iter()
        .filter(|s| s.kind == SegmentKind::Motion)
        .collect();
    motion.sort_by_key(|s| s.started_at);
    assert_eq!(events[0].segment_id.as_deref(), Some(motion[0].id.as_str()));
    assert!(motion[1].started_at >= motion[0].ended_at);

    let alerts = notifier.alerts.lock().unwrap();
    assert_eq!(alerts.len(), 1, "one alert per event");
    assert_eq!(alerts[0].0, "yard camera");
}

#[test]
fn continuous_recording_rotates_into_adjacent_segments() {
    let tmp = TempDir::new().unwrap();
    let store = Arc::new(InMemoryPersistence::new());
    let settings = RecorderSettings {
        continuous_segment: Duration::from_millis(200),
        ..settings(tmp.path())
    };
    let deps = deps_with(settings, store.clone(), Arc::new(CapturingNotifier::default()));
    let pool = deps.pool.clone();

    let mut cam = CameraConfig::new("drive", "stub://drive?fps=50", StreamKind::TransportStream);
    cam.motion.enabled = false;
    let mut recorder = Recorder::new(cam, deps).unwrap();
    recorder.start().unwrap();
    assert!(wait_for(Duration::from_secs(10), || {
        store
            .segments()
            .iter()
            .filter(|s| s.kind == SegmentKind::Continuous)
            .count()
            >= 3
    }));
    assert!(recorder.stop());
    assert!(pool.wait_idle(Duration::from_secs(5)));

    let mut segments: Vec<_> = store
        .segments()
        .into_iter()
        .filter(|s| s.kind == SegmentKind::Continuous)
        .collect();
    segments.sort_by_key(|s| s.started_at);
    assert!(segments.len() >= 3);
    for pair in segments.windows(2) {
        assert!(
            pair[1].started_at >= pair[0].ended_at,
            "{} overlaps {}",
            pair[1].name,
            pair[0].name
        );
        assert_ne!(pair[0].path, pair[1].path);
    }
    for segment in &segments[..segments.len() - 1] {
        assert!(segment.name.ends_with(".ts"));
        assert!(segment.size_bytes > 0);
        assert!(segment.duration_secs < 1.0);
    }
}

#[test]
fn segments_and_events_land_in_sqlite() {
    let tmp = TempDir::new().unwrap();
    let db_path = tmp.path().join("nvr.db");
    let db = Arc::new(SqlitePersistence::open(db_path.to_str().unwrap()).unwrap());
    let deps = deps(
        &tmp.path().join("rec"),
        db.clone(),
        Arc::new(CapturingNotifier::default()),
    );
    let pool = deps.pool.clone();

    let registry = RecorderRegistry::new(deps);
    registry.start(motion_camera("drive")).unwrap();
    assert!(wait_for(Duration::from_secs(10), || {
        db.recordings("drive", 10).map(|r| !r.is_empty()).unwrap_or(false)
    }));
    registry.stop_all();
    assert!(registry.is_empty());
    assert!(pool.wait_idle(Duration::from_secs(5)));

    let recordings = db.recordings("drive", 10).unwrap();
    let events = db.motion_events("drive", 10).unwrap();
    assert_eq!(events.len(), 1);
    let segment_id = events[0].segment_id.clone().expect("event linked to segment");
    assert!(recordings.iter().any(|r| r.id == segment_id));
    assert_eq!(
        db.recording_path(&segment_id).unwrap(),
        recordings
            .iter()
            .find(|r| r.id == segment_id)
            .map(|r| r.path.clone())
    );
}

#[test]
fn unreachable_camera_halts_without_affecting_others() {
    let tmp = TempDir::new().unwrap();
    let store = Arc::new(InMemoryPersistence::new());
    let registry = RecorderRegistry::new(deps(
        tmp.path(),
        store.clone(),
        Arc::new(CapturingNotifier::default()),
    ));

    registry
        .start(CameraConfig::new(
            "dead",
            "stub://dead?fail=1",
            StreamKind::TransportStream,
        ))
        .unwrap();
    registry
        .start(CameraConfig::new(
            "alive",
            "stub://alive?fps=25",
            StreamKind::TransportStream,
        ))
        .unwrap();

    assert!(wait_for(Duration::from_secs(10), || {
        registry.status("dead").is_some_and(|s| s.halted)
    }));
    let dead = registry.status("dead").unwrap();
    assert!(!dead.is_active);
    assert_eq!(dead.consecutive_errors, 3);

    assert!(wait_for(Duration::from_secs(10), || {
        registry.latest_frame("alive").is_some()
    }));
    let alive = registry.status("alive").unwrap();
    assert!(alive.is_active);
    assert!(!alive.halted);

    assert!(registry.stop("alive").unwrap());
    assert!(registry.stop("alive").unwrap());
    registry.stop_all();

    // The transport-stream continuous segment was flushed on stop.
    assert!(wait_for(Duration::from_secs(5), || {
        store
            .segments()
            .iter()
            .any(|s| s.camera_id == "alive" && s.name.ends_with(".ts"))
    }));
}
