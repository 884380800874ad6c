//! Persistence of segments and motion events, plus on-disk retention.
//!
//! `PersistenceGateway` is called from the worker pool, never from a camera
//! worker, so implementations may block on I/O.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::writer::{RecordingSegment, SegmentKind};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MotionEvent {
    pub id: String,
    pub camera_id: String,
    pub camera_name: String,
    pub timestamp: DateTime<Utc>,
    pub snapshot_path: Option<PathBuf>,
    /// Motion segment that recorded this event.
    pub segment_id: Option<String>,
}

pub trait PersistenceGateway: Send + Sync {
    fn save_recording_segment(&self, segment: &RecordingSegment) -> Result<()>;

    fn save_motion_event(&self, event: &MotionEvent) -> Result<()>;

    /// Drop records of segments that ended before `cutoff`. Returns how many.
    fn prune_segments_before(&self, _cutoff: DateTime<Utc>) -> Result<usize> {
        Ok(0)
    }
}

// ----------------------------------------------------------------------------
// SQLite
// ----------------------------------------------------------------------------

pub struct SqlitePersistence {
    conn: Mutex<Connection>,
}

impl SqlitePersistence {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)
            .with_context(|| format!("open recordings database {}", db_path))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("recordings database lock poisoned"))
    }

    fn ensure_schema(&self) -> Result<()> {
        self.conn()?.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS recordings (
              id TEXT PRIMARY KEY,
              camera_id TEXT NOT NULL,
              camera_name TEXT NOT NULL,
              name TEXT NOT NULL,
              kind TEXT NOT NULL,
              path TEXT NOT NULL,
              started_at TEXT NOT NULL,
              ended_at TEXT NOT NULL,
              size_bytes INTEGER NOT NULL,
              duration_secs REAL NOT NULL,
              abandoned INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS motion_events (
              id TEXT PRIMARY KEY,
              camera_id TEXT NOT NULL,
              camera_name TEXT NOT NULL,
              timestamp TEXT NOT NULL,
              snapshot_path TEXT,
              segment_id TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_recordings_camera ON recordings(camera_id, started_at);
            CREATE INDEX IF NOT EXISTS idx_events_camera ON motion_events(camera_id, timestamp);
            "#,
        )?;
        Ok(())
    }

    pub fn recordings(&self, camera_id: &str, limit: usize) -> Result<Vec<RecordingSegment>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, camera_id, camera_name, name, kind, path, started_at, ended_at,
                   size_bytes, duration_secs, abandoned
            FROM recordings WHERE camera_id = ?1 ORDER BY started_at DESC LIMIT ?2
            "#,
        )?;
        let mut rows = stmt.query(params![camera_id, limit as i64])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let kind: String = row.get(4)?;
            let path: String = row.get(5)?;
            let started_at: String = row.get(6)?;
            let ended_at: String = row.get(7)?;
            let size_bytes: i64 = row.get(8)?;
            out.push(RecordingSegment {
                id: row.get(0)?,
                camera_id: row.get(1)?,
                camera_name: row.get(2)?,
                name: row.get(3)?,
                kind: parse_kind(&kind)?,
                path: PathBuf::from(path),
                started_at: parse_time(&started_at)?,
                ended_at: parse_time(&ended_at)?,
                size_bytes: u64::try_from(size_bytes).unwrap_or(0),
                duration_secs: row.get(9)?,
                abandoned: row.get::<_, i64>(10)? != 0,
            });
        }
        Ok(out)
    }

    pub fn motion_events(&self, camera_id: &str, limit: usize) -> Result<Vec<MotionEvent>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, camera_id, camera_name, timestamp, snapshot_path, segment_id
            FROM motion_events WHERE camera_id = ?1 ORDER BY timestamp DESC LIMIT ?2
            "#,
        )?;
        let mut rows = stmt.query(params![camera_id, limit as i64])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let timestamp: String = row.get(3)?;
            let snapshot: Option<String> = row.get(4)?;
            out.push(MotionEvent {
                id: row.get(0)?,
                camera_id: row.get(1)?,
                camera_name: row.get(2)?,
                timestamp: parse_time(&timestamp)?,
                snapshot_path: snapshot.map(PathBuf::from),
                segment_id: row.get(5)?,
            });
        }
        Ok(out)
    }

    pub fn recording_path(&self, id: &str) -> Result<Option<PathBuf>> {
        let conn = self.conn()?;
        let path: Option<String> = conn
            .query_row("SELECT path FROM recordings WHERE id = ?1", params![id], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(path.map(PathBuf::from))
    }
}

impl PersistenceGateway for SqlitePersistence {
    fn save_recording_segment(&self, segment: &RecordingSegment) -> Result<()> {
        let size = i64::try_from(segment.size_bytes)
            .map_err(|_| anyhow!("segment size exceeds i64 range"))?;
        self.conn()?.execute(
            r#"
            INSERT OR REPLACE INTO recordings(id, camera_id, camera_name, name, kind, path,
                started_at, ended_at, size_bytes, duration_secs, abandoned)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
            params![
                segment.id,
                segment.camera_id,
                segment.camera_name,
                segment.name,
                segment.kind.as_str(),
                segment.path.to_string_lossy(),
                segment.started_at.to_rfc3339(),
                segment.ended_at.to_rfc3339(),
                size,
                segment.duration_secs,
                segment.abandoned as i64
            ],
        )?;
        Ok(())
    }

    fn save_motion_event(&self, event: &MotionEvent) -> Result<()> {
        self.conn()?.execute(
            r#"
            INSERT OR REPLACE INTO motion_events(id, camera_id, camera_name, timestamp,
                snapshot_path, segment_id)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                event.id,
                event.camera_id,
                event.camera_name,
                event.timestamp.to_rfc3339(),
                event
                    .snapshot_path
                    .as_ref()
                    .map(|p| p.to_string_lossy().into_owned()),
                event.segment_id
            ],
        )?;
        Ok(())
    }

    fn prune_segments_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn()?;
        let cutoff = cutoff.to_rfc3339();
        let removed = conn.execute("DELETE FROM recordings WHERE ended_at < ?1", params![cutoff])?;
        conn.execute("DELETE FROM motion_events WHERE timestamp < ?1", params![cutoff])?;
        Ok(removed)
    }
}

fn parse_kind(raw: &str) -> Result<SegmentKind> {
    match raw {
        "continuous" => Ok(SegmentKind::Continuous),
        "motion" => Ok(SegmentKind::Motion),
        other => Err(anyhow!("unknown segment kind '{}'", other)),
    }
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("parse timestamp '{}'", raw))?
        .with_timezone(&Utc))
}

// ----------------------------------------------------------------------------
// In-memory
// ----------------------------------------------------------------------------

#[derive(Default)]
pub struct InMemoryPersistence {
    segments: Mutex<Vec<RecordingSegment>>,
    events: Mutex<Vec<MotionEvent>>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn segments(&self) -> Vec<RecordingSegment> {
        self.segments.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn events(&self) -> Vec<MotionEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

impl PersistenceGateway for InMemoryPersistence {
    fn save_recording_segment(&self, segment: &RecordingSegment) -> Result<()> {
        self.segments
            .lock()
            .map_err(|_| anyhow!("segment store lock poisoned"))?
            .push(segment.clone());
        Ok(())
    }

    fn save_motion_event(&self, event: &MotionEvent) -> Result<()> {
        self.events
            .lock()
            .map_err(|_| anyhow!("event store lock poisoned"))?
            .push(event.clone());
        Ok(())
    }

    fn prune_segments_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut segments = self
            .segments
            .lock()
            .map_err(|_| anyhow!("segment store lock poisoned"))?;
        let before = segments.len();
        segments.retain(|s| s.ended_at >= cutoff);
        Ok(before - segments.len())
    }
}

// ----------------------------------------------------------------------------
// Disk usage and retention
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CameraUsage {
    pub files: u64,
    pub bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StorageStats {
    pub total_files: u64,
    pub total_bytes: u64,
    pub cameras: BTreeMap<String, CameraUsage>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CleanupReport {
    pub removed_files: u64,
    pub freed_bytes: u64,
    pub pruned_records: usize,
}

/// One camera's recording directory, as resolved by `CameraConfig::storage_dir`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraStorage {
    pub camera_id: String,
    pub dir: PathBuf,
}

const SEGMENT_EXTENSIONS: [&str; 3] = ["ts", "mjpeg", "mp4"];

/// Files a recorder writes into its camera directory: segments at the top
/// level, `snapshots/motion_*.jpg` and `clips/*_clip.mp4`, plus `.part`
/// leftovers of interrupted renders. Everything else is left alone.
fn is_recorder_file(camera_dir: &Path, path: &Path) -> bool {
    let (Some(name), Some(parent)) = (path.file_name().and_then(|n| n.to_str()), path.parent())
    else {
        return false;
    };
    let name = name.strip_suffix(".part").unwrap_or(name);
    if parent == camera_dir {
        let is_segment = name.starts_with("continuous_") || name.starts_with("motion_");
        let ext = Path::new(name).extension().and_then(|e| e.to_str());
        return is_segment && ext.is_some_and(|e| SEGMENT_EXTENSIONS.contains(&e));
    }
    if parent == camera_dir.join("snapshots") {
        return name.starts_with("motion_") && name.ends_with(".jpg");
    }
    if parent == camera_dir.join("clips") {
        return name.ends_with("_clip.mp4");
    }
    false
}

/// Recorder files of one camera directory, with their metadata.
fn recorder_files(camera_dir: &Path) -> Result<Vec<(PathBuf, fs::Metadata)>> {
    let mut files = Vec::new();
    for dir in [
        camera_dir.to_path_buf(),
        camera_dir.join("snapshots"),
        camera_dir.join("clips"),
    ] {
        if !dir.is_dir() {
            continue;
        }
        for entry in fs::read_dir(&dir).with_context(|| format!("read {}", dir.display()))? {
            let entry = entry?;
            let meta = entry.metadata()?;
            let path = entry.path();
            if meta.is_file() && is_recorder_file(camera_dir, &path) {
                files.push((path, meta));
            }
        }
    }
    Ok(files)
}

/// Sum recorder file sizes per camera.
pub fn storage_stats(cameras: &[CameraStorage]) -> Result<StorageStats> {
    let mut stats = StorageStats::default();
    for camera in cameras {
        let mut usage = CameraUsage::default();
        for (_, meta) in recorder_files(&camera.dir)? {
            usage.files += 1;
            usage.bytes += meta.len();
        }
        stats.total_files += usage.files;
        stats.total_bytes += usage.bytes;
        stats.cameras.insert(camera.camera_id.clone(), usage);
    }
    Ok(stats)
}

/// Delete recorder files whose modification time is older than `retention`,
/// then prune the matching records. Only the listed camera directories are
/// visited.
pub fn cleanup_older_than(
    cameras: &[CameraStorage],
    retention: Duration,
    persistence: &dyn PersistenceGateway,
) -> Result<CleanupReport> {
    let mut report = CleanupReport::default();
    let cutoff = SystemTime::now()
        .checked_sub(retention)
        .ok_or_else(|| anyhow!("retention period too long"))?;
    for camera in cameras {
        for (path, meta) in recorder_files(&camera.dir)? {
            if !meta.modified().map(|m| m < cutoff).unwrap_or(false) {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => {
                    report.removed_files += 1;
                    report.freed_bytes += meta.len();
                }
                Err(e) => log::warn!("retention: could not remove {}: {}", path.display(), e),
            }
        }
    }
    let cutoff_utc: DateTime<Utc> = cutoff.into();
    report.pruned_records = persistence.prune_segments_before(cutoff_utc)?;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use tempfile::TempDir;

    fn segment(id: &str, kind: SegmentKind, ended_at: DateTime<Utc>) -> RecordingSegment {
        RecordingSegment {
            id: id.to_string(),
            camera_id: "garage".to_string(),
            camera_name: "Garage".to_string(),
            name: format!("{}_20240101_000000.ts", kind.as_str()),
            kind,
            path: PathBuf::from(format!("/rec/garage/{}.ts", id)),
            started_at: ended_at - ChronoDuration::seconds(600),
            ended_at,
            size_bytes: 1024,
            duration_secs: 600.0,
            abandoned: false,
        }
    }

    #[test]
    fn sqlite_roundtrips_segments_and_events() {
        let store = SqlitePersistence::open_in_memory().unwrap();
        let now = Utc::now();
        store
            .save_recording_segment(&segment("a1", SegmentKind::Motion, now))
            .unwrap();
        store
            .save_motion_event(&MotionEvent {
                id: "e1".into(),
                camera_id: "garage".into(),
                camera_name: "Garage".into(),
                timestamp: now,
                snapshot_path: Some(PathBuf::from("/rec/garage/snapshots/motion_1.jpg")),
                segment_id: Some("a1".into()),
            })
            .unwrap();

        let recordings = store.recordings("garage", 10).unwrap();
        assert_eq!(recordings.len(), 1);
        assert_eq!(recordings[0].kind, SegmentKind::Motion);
        assert_eq!(recordings[0].size_bytes, 1024);

        let events = store.motion_events("garage", 10).unwrap();
        assert_eq!(events[0].segment_id.as_deref(), Some("a1"));
        assert_eq!(
            store.recording_path("a1").unwrap(),
            Some(PathBuf::from("/rec/garage/a1.ts"))
        );
        assert_eq!(store.recording_path("missing").unwrap(), None);
    }

    #[test]
    fn sqlite_prunes_old_records() {
        let store = SqlitePersistence::open_in_memory().unwrap();
        let now = Utc::now();
        store
            .save_recording_segment(&segment("old", SegmentKind::Continuous, now - ChronoDuration::days(40)))
            .unwrap();
        store
            .save_recording_segment(&segment("new", SegmentKind::Continuous, now))
            .unwrap();
        let removed = store
            .prune_segments_before(now - ChronoDuration::days(30))
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.recordings("garage", 10).unwrap()[0].id, "new");
    }

    #[test]
    fn in_memory_store_keeps_order() {
        let store = InMemoryPersistence::new();
        let now = Utc::now();
        store.save_recording_segment(&segment("1", SegmentKind::Continuous, now)).unwrap();
        store.save_recording_segment(&segment("2", SegmentKind::Motion, now)).unwrap();
        let ids: Vec<String> = store.segments().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec!["1", "2"]);
    }

    fn camera(root: &Path, id: &str) -> CameraStorage {
        CameraStorage {
            camera_id: id.to_string(),
            dir: root.join(id),
        }
    }

    fn age(path: &Path, by: Duration) {
        let file = fs::File::options().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() - by).unwrap();
    }

    #[test]
    fn stats_sum_per_camera() {
        let tmp = TempDir::new().unwrap();
        let porch = tmp.path().join("porch");
        fs::create_dir_all(porch.join("snapshots")).unwrap();
        fs::write(porch.join("continuous_20240101_000000.ts"), vec![0u8; 300]).unwrap();
        fs::write(porch.join("snapshots/motion_20240101_000000.jpg"), vec![0u8; 20]).unwrap();
        fs::write(porch.join("notes.txt"), vec![0u8; 7]).unwrap();
        fs::create_dir_all(tmp.path().join("yard")).unwrap();

        let stats =
            storage_stats(&[camera(tmp.path(), "porch"), camera(tmp.path(), "yard")]).unwrap();
        assert_eq!(stats.total_files, 2);
        assert_eq!(stats.total_bytes, 320);
        assert_eq!(stats.cameras["porch"].files, 2);
        assert_eq!(stats.cameras["yard"], CameraUsage::default());
    }

    #[test]
    fn stats_follow_storage_path_override() {
        let root = TempDir::new().unwrap();
        let elsewhere = TempDir::new().unwrap();
        let gate = elsewhere.path().join("gate");
        fs::create_dir_all(&gate).unwrap();
        fs::write(gate.join("motion_20240101_000000.mjpeg"), vec![0u8; 50]).unwrap();

        let stats = storage_stats(&[
            camera(root.path(), "porch"),
            CameraStorage {
                camera_id: "gate".into(),
                dir: gate,
            },
        ])
        .unwrap();
        assert_eq!(stats.cameras["gate"].bytes, 50);
        assert_eq!(stats.cameras["porch"], CameraUsage::default());
    }

    #[test]
    fn cleanup_keeps_recent_files() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("porch");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("motion_20240101_000000.ts"), vec![0u8; 10]).unwrap();
        let store = InMemoryPersistence::new();
        let cameras = [camera(tmp.path(), "porch")];

        let report = cleanup_older_than(&cameras, Duration::from_secs(3600), &store).unwrap();
        assert_eq!(report.removed_files, 0);
        assert!(dir.join("motion_20240101_000000.ts").exists());

        age(&dir.join("motion_20240101_000000.ts"), Duration::from_secs(2 * 3600));
        let report = cleanup_older_than(&cameras, Duration::from_secs(3600), &store).unwrap();
        assert_eq!(report.removed_files, 1);
        assert_eq!(report.freed_bytes, 10);
    }

    #[test]
    fn cleanup_only_touches_recorder_files() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        let porch = root.join("porch");
        fs::create_dir_all(porch.join("snapshots")).unwrap();
        fs::create_dir_all(porch.join("clips")).unwrap();

        let db = root.join("nvr.db");
        let stale = [
            porch.join("continuous_20240101_000000.ts"),
            porch.join("motion_20240101_000000.mp4"),
            porch.join("motion_20240101_000100.mp4.part"),
            porch.join("snapshots/motion_20240101_000000.jpg"),
            porch.join("clips/motion_20240101_000000_clip.mp4"),
        ];
        let foreign = [
            db.clone(),
            porch.join("camera.conf"),
            porch.join("motion_notes.txt"),
            porch.join("snapshots/manual.jpg"),
        ];
        for path in stale.iter().chain(foreign.iter()) {
            fs::write(path, b"x").unwrap();
            age(path, Duration::from_secs(3 * 24 * 3600));
        }

        let store = InMemoryPersistence::new();
        let report = cleanup_older_than(
            &[camera(root, "porch")],
            Duration::from_secs(24 * 3600),
            &store,
        )
        .unwrap();
        assert_eq!(report.removed_files, stale.len() as u64);
        for path in &stale {
            assert!(!path.exists(), "{} should be removed", path.display());
        }
        for path in &foreign {
            assert!(path.exists(), "{} should be kept", path.display());
        }
    }
}
