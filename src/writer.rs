//! Segment files.
//!
//! A `SegmentWriter` owns one open recording file. Closing it produces the
//! `RecordingSegment` record that is handed to the pipeline.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::{RecorderError, RecorderResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SegmentKind {
    Continuous,
    Motion,
}

impl SegmentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SegmentKind::Continuous => "continuous",
            SegmentKind::Motion => "motion",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordingSegment {
    pub id: String,
    pub camera_id: String,
    pub camera_name: String,
    pub name: String,
    pub kind: SegmentKind,
    pub path: PathBuf,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub size_bytes: u64,
    pub duration_secs: f64,
    /// Set when a write failed and the file holds only part of the segment.
    #[serde(default)]
    pub abandoned: bool,
}

/// Random 128-bit identifier, hex encoded.
pub fn new_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Where a camera's segments go and how they are named.
#[derive(Debug, Clone)]
pub struct SegmentTarget {
    pub dir: PathBuf,
    pub camera_id: String,
    pub camera_name: String,
    pub extension: &'static str,
}

pub struct SegmentWriter {
    id: String,
    file: Option<BufWriter<File>>,
    path: PathBuf,
    kind: SegmentKind,
    camera_id: String,
    camera_name: String,
    started_at: DateTime<Utc>,
    opened_at: Instant,
    written: u64,
    failed: bool,
}

impl SegmentWriter {
    /// Create `<dir>/<kind>_<YYYYMMDD_HHMMSS>.<ext>` (UTC), adding a numeric suffix
    /// when a segment of the same kind was already opened in that second.
    pub fn open(target: &SegmentTarget, kind: SegmentKind) -> RecorderResult<Self> {
        fs::create_dir_all(&target.dir).map_err(|source| RecorderError::Write {
            path: target.dir.clone(),
            source,
        })?;
        let started_at = Utc::now();
        let stamp = started_at.format("%Y%m%d_%H%M%S").to_string();
        let (path, file) = create_unique(&target.dir, kind.as_str(), &stamp, target.extension)?;
        log::debug!("{}: opened {} segment {}", target.camera_id, kind.as_str(), path.display());
        Ok(Self {
            id: new_id(),
            file: Some(BufWriter::new(file)),
            path,
            kind,
            camera_id: target.camera_id.clone(),
            camera_name: target.camera_name.clone(),
            started_at,
            opened_at: Instant::now(),
            written: 0,
            failed: false,
        })
    }

    /// Append bytes. After the first failure the writer refuses further writes.
    pub fn write(&mut self, bytes: &[u8]) -> RecorderResult<()> {
        let Some(file) = self.file.as_mut() else {
            return Err(RecorderError::Write {
                path: self.path.clone(),
                source: io::Error::new(io::ErrorKind::Other, "segment already abandoned"),
            });
        };
        if let Err(source) = file.write_all(bytes) {
            self.failed = true;
            // Dropping the BufWriter retries the flush once; its error is ignored.
            self.file = None;
            return Err(RecorderError::Write {
                path: self.path.clone(),
                source,
            });
        }
        self.written += bytes.len() as u64;
        Ok(())
    }

    /// Segment id, fixed at open so events can reference the segment early.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> SegmentKind {
        self.kind
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    pub fn is_failed(&self) -> bool {
        self.failed
    }

    /// Continuous segments rotate on a fixed interval measured from open.
    pub fn due_for_rotation(&self, interval: Duration) -> bool {
        self.opened_at.elapsed() >= interval
    }

    /// Flush and close the file, returning the segment record.
    pub fn close(mut self) -> RecordingSegment {
        if let Some(mut file) = self.file.take() {
            if let Err(e) = file.flush().and_then(|_| file.get_ref().sync_data()) {
                log::warn!("{}: flush {} failed: {}", self.camera_id, self.path.display(), e);
                self.failed = true;
            }
        }
        let size_bytes = fs::metadata(&self.path)
            .map(|m| m.len())
            .unwrap_or(self.written);
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        RecordingSegment {
            id: self.id.clone(),
            camera_id: self.camera_id.clone(),
            camera_name: self.camera_name.clone(),
            name,
            kind: self.kind,
            path: self.path.clone(),
            started_at: self.started_at,
            ended_at: Utc::now(),
            size_bytes,
            duration_secs: self.opened_at.elapsed().as_secs_f64(),
            abandoned: self.failed,
        }
    }
}

fn create_unique(dir: &Path, prefix: &str, stamp: &str, ext: &str) -> RecorderResult<(PathBuf, File)> {
    let mut attempt = 0u32;
    loop {
        let name = if attempt == 0 {
            format!("{}_{}.{}", prefix, stamp, ext)
        } else {
            format!("{}_{}_{}.{}", prefix, stamp, attempt, ext)
        };
        let path = dir.join(name);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => return Ok((path, file)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists && attempt < 1000 => attempt += 1,
            Err(source) => return Err(RecorderError::Write { path, source }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn target(dir: &Path) -> SegmentTarget {
        SegmentTarget {
            dir: dir.join("porch"),
            camera_id: "porch".to_string(),
            camera_name: "Front Porch".to_string(),
            extension: "ts",
        }
    }

    #[test]
    fn writer_names_and_sizes_segment() {
        let tmp = TempDir::new().unwrap();
        let mut writer = SegmentWriter::open(&target(tmp.path()), SegmentKind::Motion).unwrap();
        writer.write(&[0x47; 188]).unwrap();
        writer.write(&[0x47; 188]).unwrap();
        let segment = writer.close();

        assert!(segment.name.starts_with("motion_"));
        assert!(segment.name.ends_with(".ts"));
        // motion_YYYYMMDD_HHMMSS.ts, stamped in UTC
        assert_eq!(
            segment.name,
            format!("motion_{}.ts", segment.started_at.format("%Y%m%d_%H%M%S"))
        );
        assert_eq!(segment.size_bytes, 376);
        assert_eq!(segment.camera_name, "Front Porch");
        assert_eq!(segment.path.parent().unwrap(), tmp.path().join("porch"));
        assert!(!segment.abandoned);
        assert_eq!(segment.id.len(), 32);
    }

    #[test]
    fn same_second_segments_get_distinct_paths() {
        let tmp = TempDir::new().unwrap();
        let t = target(tmp.path());
        let a = SegmentWriter::open(&t, SegmentKind::Continuous).unwrap();
        let b = SegmentWriter::open(&t, SegmentKind::Continuous).unwrap();
        assert_ne!(a.path(), b.path());
        assert_ne!(a.id(), b.id());
        assert_eq!(a.close().kind, SegmentKind::Continuous);
        b.close();
    }

    #[test]
    fn rotation_is_interval_based() {
        let tmp = TempDir::new().unwrap();
        let writer = SegmentWriter::open(&target(tmp.path()), SegmentKind::Continuous).unwrap();
        assert!(!writer.due_for_rotation(Duration::from_secs(600)));
        assert!(writer.due_for_rotation(Duration::ZERO));
    }

    #[test]
    fn unwritable_directory_is_a_write_error() {
        let tmp = TempDir::new().unwrap();
        let blocker = tmp.path().join("porch");
        fs::write(&blocker, b"not a directory").unwrap();
        let err = SegmentWriter::open(&target(tmp.path()), SegmentKind::Motion).err().unwrap();
        assert!(matches!(err, RecorderError::Write { .. }));
    }
}
