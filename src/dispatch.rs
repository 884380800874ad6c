//! Background work shared by every recorder.
//!
//! Camera workers never block on persistence, disk snapshots, transcoding or
//! notifications. They hand a `Job` to the `WorkerPool`, whose bounded queue
//! drops jobs (with a warning) rather than stall capture.

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use crossbeam::channel::{self, Receiver, Sender, TrySendError};

use crate::error::RecorderError;
use crate::notify::NotificationDispatcher;
use crate::storage::{MotionEvent, PersistenceGateway};
use crate::transcode::TranscodePipeline;
use crate::writer::{RecordingSegment, SegmentKind};

/// A closed segment on its way to transcode, persistence and notification.
#[derive(Debug, Clone)]
pub struct SegmentJob {
    pub segment: RecordingSegment,
    /// Frame rate of raw image segments, which carry no timing of their own.
    pub input_fps: Option<f64>,
    /// Render a clip of this segment and send it with an alert.
    pub notify_with_clip: bool,
}

/// A new motion event with the JPEG that triggered it.
#[derive(Debug, Clone)]
pub struct EventJob {
    pub event: MotionEvent,
    pub snapshot: Option<Arc<Vec<u8>>>,
    /// Send a text alert right away.
    pub notify: bool,
}

#[derive(Debug, Clone)]
pub enum Job {
    Segment(SegmentJob),
    Event(EventJob),
}

impl Job {
    fn describe(&self) -> String {
        match self {
            Job::Segment(job) => format!("{} segment {}", job.segment.camera_id, job.segment.name),
            Job::Event(job) => format!("{} motion event {}", job.event.camera_id, job.event.id),
        }
    }
}

/// Collaborators the pool hands every job to.
pub struct Pipeline {
    pub persistence: Arc<dyn PersistenceGateway>,
    pub notifier: Arc<dyn NotificationDispatcher>,
    pub transcoder: TranscodePipeline,
}

impl Pipeline {
    pub fn run(&self, job: Job) {
        match job {
            Job::Segment(job) => self.run_segment(job),
            Job::Event(job) => self.run_event(job),
        }
    }

    fn run_segment(&self, job: SegmentJob) {
        let SegmentJob {
            mut segment,
            mut input_fps,
            notify_with_clip,
        } = job;

        if !segment.abandoned && self.transcoder.enabled() {
            match self.transcoder.transcode(&mut segment, input_fps) {
                Ok(()) => input_fps = None,
                Err(e) => log::warn!("{}: {} (original kept)", segment.camera_id, e),
            }
        }

        if let Err(e) = self.persistence.save_recording_segment(&segment) {
            log::warn!("{}: failed to persist segment {}: {:#}", segment.camera_id, segment.name, e);
        }

        if !notify_with_clip || segment.kind != SegmentKind::Motion {
            return;
        }
        let clip = if segment.abandoned {
            None
        } else {
            match self.transcoder.make_clip(&segment, input_fps) {
                Ok(clip) => clip,
                Err(e) => {
                    log::warn!("{}: clip failed: {}", segment.camera_id, e);
                    None
                }
            }
        };
        if let Err(e) = self
            .notifier
            .notify(&segment.camera_name, segment.started_at, clip.as_deref())
        {
            log::warn!("{}: {}", segment.camera_id, notification_error(e));
        }
        if let Some(clip) = clip {
            let _ = fs::remove_file(clip);
        }
    }

    fn run_event(&self, job: EventJob) {
        let EventJob {
            mut event,
            snapshot,
            notify,
        } = job;

        match (snapshot, event.snapshot_path.clone()) {
            (Some(jpeg), Some(path)) => {
                if let Err(e) = write_snapshot(&path, &jpeg) {
                    log::warn!("{}: {:#}", event.camera_id, e);
                    event.snapshot_path = None;
                }
            }
            _ => event.snapshot_path = None,
        }

        if let Err(e) = self.persistence.save_motion_event(&event) {
            log::warn!("{}: failed to persist motion event: {:#}", event.camera_id, e);
        }

        if notify {
            if let Err(e) = self.notifier.notify(&event.camera_name, event.timestamp, None) {
                log::warn!("{}: {}", event.camera_id, notification_error(e));
            }
        }
    }
}

fn notification_error(e: anyhow::Error) -> RecorderError {
    RecorderError::Notification(format!("{:#}", e))
}

fn write_snapshot(path: &Path, jpeg: &[u8]) -> Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    }
    fs::write(path, jpeg).with_context(|| format!("write snapshot {}", path.display()))
}

// ----------------------------------------------------------------------------
// Pool
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub submitted: u64,
    pub dropped: u64,
    pub completed: u64,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    dropped: AtomicU64,
    completed: AtomicU64,
    pending: AtomicUsize,
}

pub struct WorkerPool {
    tx: Mutex<Option<Sender<Job>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    counters: Arc<Counters>,
}

impl WorkerPool {
    pub fn new(pipeline: Pipeline, threads: usize, queue_capacity: usize) -> Result<Self> {
        if threads == 0 || queue_capacity == 0 {
            return Err(anyhow!("worker pool needs at least one thread and one queue slot"));
        }
        let (tx, rx) = channel::bounded::<Job>(queue_capacity);
        let pipeline = Arc::new(pipeline);
        let counters = Arc::new(Counters::default());
        let mut handles = Vec::with_capacity(threads);
        for index in 0..threads {
            let rx: Receiver<Job> = rx.clone();
            let pipeline = pipeline.clone();
            let counters = counters.clone();
            let handle = thread::Builder::new()
                .name(format!("nvr-worker-{}", index))
                .spawn(move || {
                    for job in rx.iter() {
                        pipeline.run(job);
                        counters.completed.fetch_add(1, Ordering::SeqCst);
                        counters.pending.fetch_sub(1, Ordering::SeqCst);
                    }
                })
                .context("spawn worker thread")?;
            handles.push(handle);
        }
        log::info!("worker pool: {} threads, queue {}", threads, queue_capacity);
        Ok(Self {
            tx: Mutex::new(Some(tx)),
            handles: Mutex::new(handles),
            counters,
        })
    }

    /// Queue a job without blocking. Returns false if it was dropped.
    pub fn submit(&self, job: Job) -> bool {
        let Ok(guard) = self.tx.lock() else {
            return false;
        };
        let Some(tx) = guard.as_ref() else {
            log::warn!("worker pool stopped, dropping {}", job.describe());
            self.counters.dropped.fetch_add(1, Ordering::SeqCst);
            return false;
        };
        self.counters.pending.fetch_add(1, Ordering::SeqCst);
        match tx.try_send(job) {
            Ok(()) => {
                self.counters.submitted.fetch_add(1, Ordering::SeqCst);
                true
            }
            Err(TrySendError::Full(job)) | Err(TrySendError::Disconnected(job)) => {
                self.counters.pending.fetch_sub(1, Ordering::SeqCst);
                self.counters.dropped.fetch_add(1, Ordering::SeqCst);
                log::warn!("worker queue full, dropping {}", job.describe());
                false
            }
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            submitted: self.counters.submitted.load(Ordering::SeqCst),
            dropped: self.counters.dropped.load(Ordering::SeqCst),
            completed: self.counters.completed.load(Ordering::SeqCst),
        }
    }

    /// Wait until every queued job finished. Returns false on timeout.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.counters.pending.load(Ordering::SeqCst) > 0 {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(10));
        }
        true
    }

    /// Stop accepting jobs, drain the queue and join the threads. Idempotent.
    pub fn shutdown(&self) {
        if let Ok(mut tx) = self.tx.lock() {
            tx.take();
        }
        let handles = match self.handles.lock() {
            Ok(mut handles) => std::mem::take(&mut *handles),
            Err(_) => return,
        };
        for handle in handles {
            let _ = handle.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
