//! NVR recorder kernel
//!
//! Per-camera recording engine: ingest a live stream, detect motion, and keep
//! a segmented archive with pre-roll and post-roll around every event.
//!
//! # Architecture
//!
//! Each camera runs one `Recorder` on its own thread. Data flows one way:
//!
//! 1. **Ingest**: a `StreamSource` delivers decoded frames and recordable chunks.
//! 2. **Buffer**: chunks enter the pre-roll `FrameBuffer` and any open writer.
//! 3. **Detect**: sampled frames go through a `MotionDetector`.
//! 4. **Gate**: the `RecordingStateMachine` opens and closes motion segments.
//! 5. **Hand off**: closed segments and motion events go to the `WorkerPool`
//!    for transcoding, persistence and notification.
//!
//! Control runs from the `RecorderRegistry` into each recorder's start/stop.
//! A recorder thread never blocks on disk-heavy post-processing.
//!
//! # Module Structure
//!
//! - `config`: camera and daemon configuration
//! - `frame`: frames, chunks, the pre-roll ring, the preview slot
//! - `ingest`: stream adapters and the subprocess abstraction
//! - `detect`: motion detectors and zone masks
//! - `state_machine`: idle / recording / cooldown gating
//! - `supervisor`: reconnect backoff and adaptive quality
//! - `writer`: segment files
//! - `transcode`, `notify`, `storage`, `dispatch`: post-close pipeline
//! - `recorder`, `registry`: per-camera orchestration

pub mod config;
pub mod detect;
pub mod dispatch;
pub mod error;
pub mod frame;
pub mod ingest;
pub mod notify;
pub mod recorder;
pub mod registry;
pub mod state_machine;
pub mod storage;
pub mod supervisor;
pub mod transcode;
pub mod writer;

pub use config::{
    CameraConfig, MotionSettings, MqttSettings, NvrdConfig, RecorderSettings, StreamKind, Zone,
};
pub use detect::{build_detector, MotionDetector};
pub use dispatch::{Job, Pipeline, PoolStats, WorkerPool};
pub use error::{RecorderError, RecorderResult};
pub use frame::{Chunk, Frame, FrameBuffer, LatestFrame};
pub use ingest::{IngestUnit, ProcessLauncher, StreamSource, SystemLauncher};
pub use notify::{LogNotifier, MqttNotifier, NotificationDispatcher};
pub use recorder::{Recorder, RecorderDeps, RecorderStatus};
pub use registry::RecorderRegistry;
pub use state_machine::{MotionState, RecordingStateMachine, StateTimings, Transition};
pub use storage::{
    cleanup_older_than, storage_stats, CameraStorage, InMemoryPersistence, MotionEvent,
    PersistenceGateway, SqlitePersistence,
};
pub use supervisor::{QualityTier, ReconnectPolicy, ReconnectionSupervisor};
pub use transcode::{ClipSettings, TranscodePipeline, TranscodeSettings};
pub use writer::{RecordingSegment, SegmentKind, SegmentWriter};
