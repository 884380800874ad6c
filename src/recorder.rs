//! Per-camera recorder.
//!
//! A `Recorder` owns one long-lived worker thread. The worker exclusively owns
//! the runtime state (source, detector, state machine, writers, pre-roll) and
//! publishes a read-only `RecorderStatus` plus the latest preview JPEG.
//!
//! The worker is responsible for:
//! - Connecting through the supervisor's backoff and halting at the error budget
//! - Writing every chunk to the open writers and the pre-roll ring
//! - Feeding sampled frames to the detector and the state machine
//! - Handing closed segments and new motion events to the worker pool
//!
//! The worker MUST NOT:
//! - Block on persistence, transcoding or notification
//! - Leave a writer open on any exit path

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use serde::Serialize;

use crate::config::{CameraConfig, RecorderSettings, StreamKind};
use crate::detect::{build_detector, MotionDetector};
use crate::dispatch::{EventJob, Job, SegmentJob, WorkerPool};
use crate::error::RecorderError;
use crate::frame::{Chunk, Frame, FrameBuffer, LatestFrame};
use crate::ingest::{IngestUnit, ProcessLauncher, StreamSource};
use crate::state_machine::{MotionState, RecordingStateMachine, StateTimings, Transition};
use crate::storage::MotionEvent;
use crate::supervisor::{
    interruptible_sleep, FailureAction, QualityConfig, QualityController, QualityTier,
    ReconnectionSupervisor,
};
use crate::writer::{new_id, SegmentKind, SegmentTarget, SegmentWriter};

const UNIT_WAIT: Duration = Duration::from_millis(100);
const CONTINUOUS_REOPEN_DELAY: Duration = Duration::from_secs(10);

/// Shared handles every recorder needs.
#[derive(Clone)]
pub struct RecorderDeps {
    pub settings: RecorderSettings,
    pub pool: Arc<WorkerPool>,
    pub launcher: Arc<dyn ProcessLauncher>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecorderStatus {
    pub camera_id: String,
    pub is_active: bool,
    pub is_recording: bool,
    pub motion_state: MotionState,
    pub quality_tier: QualityTier,
    pub consecutive_errors: u32,
    /// Set once the error budget ran out.
    pub halted: bool,
    pub last_error: Option<String>,
}

impl RecorderStatus {
    fn idle(camera_id: &str) -> Self {
        Self {
            camera_id: camera_id.to_string(),
            is_active: false,
            is_recording: false,
            motion_state: MotionState::Idle,
            quality_tier: QualityTier::High,
            consecutive_errors: 0,
            halted: false,
            last_error: None,
        }
    }
}

struct WorkerHandle {
    handle: JoinHandle<()>,
    done: Receiver<()>,
}

pub struct Recorder {
    config: Arc<CameraConfig>,
    deps: RecorderDeps,
    stop: Arc<AtomicBool>,
    status: Arc<Mutex<RecorderStatus>>,
    latest: LatestFrame,
    worker: Option<WorkerHandle>,
}

impl Recorder {
    /// Validate `config` and build an idle recorder.
    pub fn new(mut config: CameraConfig, deps: RecorderDeps) -> Result<Self> {
        config.validate()?;
        let status = RecorderStatus::idle(&config.id);
        Ok(Self {
            config: Arc::new(config),
            deps,
            stop: Arc::new(AtomicBool::new(false)),
            status: Arc::new(Mutex::new(status)),
            latest: LatestFrame::new(),
            worker: None,
        })
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn config(&self) -> &CameraConfig {
        &self.config
    }

    /// Spawn the worker. A no-op while a worker is already running.
    pub fn start(&mut self) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }
        self.reap();

        let stop = Arc::new(AtomicBool::new(false));
        let worker = CameraWorker::new(
            self.config.clone(),
            &self.deps,
            stop.clone(),
            self.status.clone(),
            self.latest.clone(),
        )?;
        let (done_tx, done_rx) = channel::bounded(1);
        if let Ok(mut status) = self.status.lock() {
            *status = RecorderStatus::idle(&self.config.id);
            status.is_active = true;
        }
        let handle = thread::Builder::new()
            .name(format!("rec-{}", self.config.id))
            .spawn(move || {
                let _signal = ExitSignal(done_tx);
                worker.run();
            })
            .with_context(|| format!("spawn recorder thread for {}", self.config.id))?;

        self.stop = stop;
        self.worker = Some(WorkerHandle {
            handle,
            done: done_rx,
        });
        log::info!("{}: recorder started ({})", self.config.id, self.config.name);
        Ok(())
    }

    /// Signal the worker and wait up to the configured stop timeout.
    /// Returns false if the worker did not exit in time; it is then detached
    /// and still closes its writers when it gets there. Idempotent.
    pub fn stop(&mut self) -> bool {
        let Some(worker) = self.worker.take() else {
            return true;
        };
        self.stop.store(true, Ordering::SeqCst);
        let timeout = self.deps.settings.stop_timeout;
        let exited = match worker.done.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                let _ = worker.handle.join();
                true
            }
            Err(RecvTimeoutError::Timeout) => {
                log::warn!(
                    "{}: worker did not stop within {:?}, detaching",
                    self.config.id,
                    timeout
                );
                false
            }
        };
        if let Ok(mut status) = self.status.lock() {
            status.is_active = false;
            status.is_recording = false;
        }
        self.latest.clear();
        log::info!("{}: recorder stopped", self.config.id);
        exited
    }

    pub fn status(&self) -> RecorderStatus {
        self.status
            .lock()
            .map(|s| s.clone())
            .unwrap_or_else(|_| RecorderStatus::idle(&self.config.id))
    }

    /// Most recent preview JPEG.
    pub fn latest_frame(&self) -> Option<Arc<Vec<u8>>> {
        self.latest.get()
    }

    fn is_running(&self) -> bool {
        self.worker
            .as_ref()
            .is_some_and(|w| !w.handle.is_finished())
    }

    /// Join a worker that already exited on its own (halted).
    fn reap(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = worker.handle.join();
        }
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Sent when the worker thread exits, panics included.
struct ExitSignal(Sender<()>);

impl Drop for ExitSignal {
    fn drop(&mut self) {
        let _ = self.0.try_send(());
    }
}

// ----------------------------------------------------------------------------
// Worker
// ----------------------------------------------------------------------------

enum SessionEnd {
    Stopped,
    Failed(RecorderError),
    Exhausted(RecorderError),
}

struct CameraWorker {
    config: Arc<CameraConfig>,
    settings: RecorderSettings,
    pool: Arc<WorkerPool>,
    stop: Arc<AtomicBool>,
    status: Arc<Mutex<RecorderStatus>>,
    latest: LatestFrame,

    source: StreamSource,
    detector: Option<Box<dyn MotionDetector>>,
    machine: RecordingStateMachine,
    supervisor: ReconnectionSupervisor,
    quality: QualityController,
    pre_roll: FrameBuffer,

    target: SegmentTarget,
    continuous: Option<SegmentWriter>,
    continuous_retry_at: Option<Instant>,
    motion: Option<SegmentWriter>,
    /// Whether the current event already produced a clip notification.
    event_notified: bool,
    frame_index: u64,
    last_error: Option<String>,
    halted: bool,
}

impl CameraWorker {
    fn new(
        config: Arc<CameraConfig>,
        deps: &RecorderDeps,
        stop: Arc<AtomicBool>,
        status: Arc<Mutex<RecorderStatus>>,
        latest: LatestFrame,
    ) -> Result<Self> {
        let source = StreamSource::new(&config, deps.launcher.clone())?;
        let detector = config
            .motion
            .enabled
            .then(|| build_detector(&config.motion));
        let machine = RecordingStateMachine::new(StateTimings {
            min_motion_duration: config.min_motion_duration(),
            post_roll: config.post_roll(),
            cooldown: config.cooldown(),
        });
        let extension = match config.stream_kind {
            StreamKind::TransportStream => "ts",
            StreamKind::PullMultipartImage | StreamKind::PeriodicSnapshot => "mjpeg",
        };
        let target = SegmentTarget {
            dir: config.storage_dir(&deps.settings.storage_root),
            camera_id: config.id.clone(),
            camera_name: config.name.clone(),
            extension,
        };
        Ok(Self {
            pre_roll: FrameBuffer::new(config.pre_roll_capacity()),
            supervisor: ReconnectionSupervisor::new(deps.settings.reconnect.clone()),
            quality: QualityController::new(QualityConfig::default(), Instant::now()),
            settings: deps.settings.clone(),
            pool: deps.pool.clone(),
            config,
            stop,
            status,
            latest,
            source,
            detector,
            machine,
            target,
            continuous: None,
            continuous_retry_at: None,
            motion: None,
            event_notified: false,
            frame_index: 0,
            last_error: None,
            halted: false,
        })
    }

    fn id(&self) -> &str {
        &self.config.id
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    fn run(mut self) {
        if let Some(detector) = self.detector.as_ref() {
            log::info!(
                "{}: motion detection {} (sensitivity {:.2}), pre-roll {} units",
                self.id(),
                detector.name(),
                self.config.motion.sensitivity,
                self.pre_roll.capacity()
            );
        }
        while !self.stopped() {
            let end = match self.source.open() {
                Ok(()) => {
                    log::info!("{}: connected", self.id());
                    let end = self.session();
                    self.source.close();
                    self.end_session();
                    end
                }
                Err(e) => SessionEnd::Failed(e),
            };
            match end {
                SessionEnd::Stopped => break,
                SessionEnd::Exhausted(e) => {
                    self.halt(&e);
                    break;
                }
                SessionEnd::Failed(e) => {
                    if !self.retry_after(e) {
                        break;
                    }
                }
            }
        }
        self.source.close();
        self.close_writers();
        self.publish_status(false);
        log::info!("{}: worker exited", self.id());
    }

    /// Returns false when the recorder should stop retrying.
    fn retry_after(&mut self, error: RecorderError) -> bool {
        self.last_error = Some(error.to_string());
        match self.supervisor.record_failure() {
            FailureAction::Halt => {
                self.halt(&error);
                false
            }
            FailureAction::Retry(delay) => {
                log::warn!(
                    "{}: {} (attempt {}/{}), retrying in {:.1}s",
                    self.id(),
                    error,
                    self.supervisor.consecutive_errors(),
                    self.supervisor.policy().max_consecutive_errors,
                    delay.as_secs_f64()
                );
                self.publish_status(true);
                interruptible_sleep(delay, &self.stop)
            }
        }
    }

    fn halt(&mut self, error: &RecorderError) {
        self.halted = true;
        self.last_error = Some(error.to_string());
        log::error!(
            "{}: giving up after {} consecutive errors: {}",
            self.id(),
            self.supervisor.consecutive_errors(),
            error
        );
    }

    fn session(&mut self) -> SessionEnd {
        let stall_timeout = self.supervisor.policy().stall_timeout();
        let mut last_unit_at = Instant::now();
        loop {
            if self.stopped() {
                return SessionEnd::Stopped;
            }
            let now = Instant::now();
            if let Some(tier) = self.quality.evaluate(now) {
                log::info!("{}: quality tier now {}", self.id(), tier);
                self.publish_status(true);
            }
            match self.source.next_unit(UNIT_WAIT) {
                Ok(Some(unit)) => {
                    last_unit_at = Instant::now();
                    if self.supervisor.consecutive_errors() > 0 {
                        self.supervisor.record_success();
                        self.publish_status(true);
                    }
                    self.handle_unit(unit);
                }
                Ok(None) => {
                    if last_unit_at.elapsed() >= stall_timeout {
                        return SessionEnd::Failed(RecorderError::connect(
                            self.config.id.clone(),
                            format!("no data for {:.0}s", stall_timeout.as_secs_f64()),
                        ));
                    }
                }
                Err(RecorderError::Decode(reason)) => {
                    log::warn!("{}: skipping corrupt frame: {}", self.id(), reason);
                    if self.supervisor.record_decode_error() {
                        return SessionEnd::Exhausted(RecorderError::Decode(reason));
                    }
                    self.publish_status(true);
                }
                Err(e) => return SessionEnd::Failed(e),
            }
        }
    }

    /// Close writers and forget per-connection state after a session.
    fn end_session(&mut self) {
        self.close_writers();
        self.machine.reset();
        self.event_notified = false;
        if let Some(detector) = self.detector.as_mut() {
            detector.reset();
        }
        self.pre_roll.clear();
        self.publish_status(true);
    }

    fn handle_unit(&mut self, unit: IngestUnit) {
        if let Some(chunk) = unit.chunk {
            self.ensure_continuous();
            self.write_chunk(&chunk);
            self.pre_roll.push(chunk);
        }
        if let Some(frame) = unit.frame {
            self.handle_frame(frame);
        }
    }

    fn handle_frame(&mut self, frame: Frame) {
        let index = self.frame_index;
        self.frame_index += 1;
        self.quality.on_frame(Instant::now());
        let tier = self.quality.tier();

        if index % tier.preview_stride() == 0 {
            self.latest.publish(frame.jpeg.clone());
        }
        if index % tier.detector_stride() != 0 {
            return;
        }
        let Some(detector) = self.detector.as_mut() else {
            return;
        };
        let motion = detector.detect(&frame.luma);
        let Some(transition) = self.machine.step(motion, frame.captured_at) else {
            return;
        };
        match transition {
            Transition::Opened { resumed: false } => {
                self.event_notified = false;
                self.open_motion_writer();
                self.submit_event(&frame);
            }
            Transition::Opened { resumed: true } => {
                log::info!("{}: motion resumed during cooldown", self.id());
                self.open_motion_writer();
            }
            Transition::Closed => {
                log::info!("{}: motion ended, closing segment", self.id());
                self.close_motion_writer();
            }
            Transition::Settled => {
                log::info!("{}: cooldown over, idle", self.id());
            }
        }
        self.publish_status(true);
    }

    // ---- Writers ----

    fn ensure_continuous(&mut self) {
        if !self.config.continuous_recording {
            return;
        }
        let rotate = self
            .continuous
            .as_ref()
            .is_some_and(|w| w.due_for_rotation(self.settings.continuous_segment));
        if rotate {
            if let Some(writer) = self.continuous.take() {
                log::debug!("{}: rotating continuous segment", self.id());
                self.dispatch_segment(writer);
            }
        }
        if self.continuous.is_some() {
            return;
        }
        if self
            .continuous_retry_at
            .is_some_and(|at| Instant::now() < at)
        {
            return;
        }
        match SegmentWriter::open(&self.target, SegmentKind::Continuous) {
            Ok(writer) => {
                self.continuous_retry_at = None;
                self.continuous = Some(writer);
            }
            Err(e) => {
                log::warn!("{}: {}", self.id(), e);
                self.continuous_retry_at = Some(Instant::now() + CONTINUOUS_REOPEN_DELAY);
            }
        }
    }

    fn write_chunk(&mut self, chunk: &Chunk) {
        if let Some(writer) = self.continuous.as_mut() {
            if let Err(e) = writer.write(&chunk.bytes) {
                log::warn!("{}: abandoning continuous segment: {}", self.id(), e);
                if let Some(writer) = self.continuous.take() {
                    self.dispatch_segment(writer);
                }
                self.continuous_retry_at = Some(Instant::now() + CONTINUOUS_REOPEN_DELAY);
            }
        }
        if let Some(writer) = self.motion.as_mut() {
            if let Err(e) = writer.write(&chunk.bytes) {
                log::warn!("{}: abandoning motion segment: {}", self.id(), e);
                if let Some(writer) = self.motion.take() {
                    self.dispatch_segment(writer);
                }
            }
        }
    }

    /// Open a motion writer and flush the pre-roll into it.
    fn open_motion_writer(&mut self) {
        if let Some(previous) = self.motion.take() {
            self.dispatch_segment(previous);
        }
        let mut writer = match SegmentWriter::open(&self.target, SegmentKind::Motion) {
            Ok(writer) => writer,
            Err(e) => {
                log::warn!("{}: cannot open motion segment: {}", self.id(), e);
                return;
            }
        };
        let buffered = self.pre_roll.len();
        for chunk in self.pre_roll.drain() {
            if let Err(e) = writer.write(&chunk.bytes) {
                log::warn!("{}: abandoning motion segment: {}", self.config.id, e);
                break;
            }
        }
        log::info!(
            "{}: recording motion to {} ({} pre-roll units)",
            self.id(),
            writer.path().display(),
            buffered
        );
        if writer.is_failed() {
            self.dispatch_segment(writer);
        } else {
            self.motion = Some(writer);
        }
    }

    /// The pre-roll is emptied too: its chunks were already written to this
    /// segment, so a resumed event must not replay them.
    fn close_motion_writer(&mut self) {
        if let Some(writer) = self.motion.take() {
            self.dispatch_segment(writer);
            self.pre_roll.clear();
        }
    }

    fn close_writers(&mut self) {
        if let Some(writer) = self.continuous.take() {
            self.dispatch_segment(writer);
        }
        self.close_motion_writer();
    }

    fn dispatch_segment(&mut self, writer: SegmentWriter) {
        let segment = writer.close();
        log::info!(
            "{}: closed {} segment {} ({} bytes, {:.1}s{})",
            self.id(),
            segment.kind.as_str(),
            segment.name,
            segment.size_bytes,
            segment.duration_secs,
            if segment.abandoned { ", abandoned" } else { "" }
        );
        let notify_with_clip = segment.kind == SegmentKind::Motion
            && self.config.notify.on_motion
            && self.config.notify.attach_clip
            && !self.event_notified;
        if notify_with_clip {
            self.event_notified = true;
        }
        let input_fps = match self.config.stream_kind {
            StreamKind::TransportStream => None,
            _ => Some(self.config.nominal_fps()),
        };
        self.pool.submit(Job::Segment(SegmentJob {
            segment,
            input_fps,
            notify_with_clip,
        }));
    }

    fn submit_event(&mut self, frame: &Frame) {
        let stamp = frame.wall_time.format("%Y%m%d_%H%M%S");
        let snapshot_path: PathBuf = self
            .target
            .dir
            .join("snapshots")
            .join(format!("motion_{}.jpg", stamp));
        let event = MotionEvent {
            id: new_id(),
            camera_id: self.config.id.clone(),
            camera_name: self.config.name.clone(),
            timestamp: frame.wall_time,
            snapshot_path: Some(snapshot_path),
            segment_id: self.motion.as_ref().map(|w| w.id().to_string()),
        };
        log::info!("{}: motion detected, event {}", self.id(), event.id);
        let notify = self.config.notify.on_motion && !self.config.notify.attach_clip;
        self.pool.submit(Job::Event(EventJob {
            event,
            snapshot: Some(frame.jpeg.clone()),
            notify,
        }));
    }

    fn publish_status(&self, active: bool) {
        let Ok(mut status) = self.status.lock() else {
            return;
        };
        status.is_active = active && !self.halted;
        status.is_recording = self.motion.is_some();
        status.motion_state = self.machine.state();
        status.quality_tier = self.quality.tier();
        status.consecutive_errors = self.supervisor.consecutive_errors();
        status.halted = self.halted;
        status.last_error = self.last_error.clone();
    }
}
