//! Stream ingestion.
//!
//! `StreamSource` wraps one backend per stream kind, selected once at
//! construction:
//! - transport streams (RTSP and friends) via two `ffmpeg` subprocesses
//! - pull-based multipart JPEG over HTTP
//! - periodic single JPEG fetches over HTTP
//! - synthetic `stub://` frames (tests, demos)
//!
//! Every backend reads on its own thread(s) and hands `IngestUnit`s over a
//! bounded channel, so `next_unit` never blocks longer than the wait it is
//! given.
//!
//! The ingestion layer is responsible for:
//! - Connecting and reporting connect failures as `RecorderError::Connect`
//! - Decoding analysis frames and flagging corrupt ones as `RecorderError::Decode`
//! - Producing recordable chunks in arrival order
//!
//! The ingestion layer MUST NOT:
//! - Write anything to disk
//! - Retry on its own (reconnection belongs to the supervisor)

mod multipart;
pub mod process;
mod snapshot;
mod synthetic;
mod transport;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, SendTimeoutError, Sender};

use crate::config::{CameraConfig, StreamKind};
use crate::error::{RecorderError, RecorderResult};
use crate::frame::{Chunk, Frame};

pub use multipart::{find_jpeg_bounds, MjpegStream, MultipartSource};
pub use process::{CommandSpec, ProcessLauncher, ProcessPipe, SystemLauncher};
pub use snapshot::SnapshotSource;
pub use synthetic::{SyntheticSource, SyntheticSpec};
pub use transport::{TransportSource, TS_PACKET_SIZE};

const UNIT_QUEUE_DEPTH: usize = 64;
const SEND_POLL: Duration = Duration::from_millis(100);
pub(crate) const HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub(crate) const HTTP_READ_TIMEOUT: Duration = Duration::from_secs(15);

/// One unit delivered by a source: a decoded frame for analysis, recordable
/// bytes, or both.
#[derive(Clone, Debug, Default)]
pub struct IngestUnit {
    pub frame: Option<Frame>,
    pub chunk: Option<Chunk>,
}

impl IngestUnit {
    /// Image kinds: the JPEG is both the analysis frame and the recorded payload.
    pub fn image(frame: Frame) -> Self {
        let chunk = Chunk::new(frame.jpeg.clone(), frame.captured_at);
        Self {
            frame: Some(frame),
            chunk: Some(chunk),
        }
    }
}

/// Statistics for a stream source.
#[derive(Clone, Debug, Default)]
pub struct IngestStats {
    pub units: u64,
    pub frames_decoded: u64,
    pub bytes: u64,
}

/// Camera stream source.
pub struct StreamSource {
    backend: SourceBackend,
    stats: IngestStats,
    connected_at: Option<Instant>,
}

enum SourceBackend {
    Transport(TransportSource),
    Multipart(MultipartSource),
    Snapshot(SnapshotSource),
    Synthetic(SyntheticSource),
}

impl StreamSource {
    pub fn new(config: &CameraConfig, launcher: Arc<dyn ProcessLauncher>) -> anyhow::Result<Self> {
        let backend = if config.url.starts_with("stub://") {
            SourceBackend::Synthetic(SyntheticSource::new(config)?)
        } else {
            let url = config.stream_url()?;
            match config.stream_kind {
                StreamKind::TransportStream => {
                    SourceBackend::Transport(TransportSource::new(config, url, launcher))
                }
                StreamKind::PullMultipartImage => {
                    SourceBackend::Multipart(MultipartSource::new(url))
                }
                StreamKind::PeriodicSnapshot => SourceBackend::Snapshot(SnapshotSource::new(
                    url,
                    Duration::from_secs_f64(config.snapshot_interval_secs),
                )),
            }
        };
        Ok(Self {
            backend,
            stats: IngestStats::default(),
            connected_at: None,
        })
    }

    /// Connect to the stream and start the reader thread(s).
    pub fn open(&mut self) -> RecorderResult<()> {
        match &mut self.backend {
            SourceBackend::Transport(source) => source.open(),
            SourceBackend::Multipart(source) => source.open(),
            SourceBackend::Snapshot(source) => source.open(),
            SourceBackend::Synthetic(source) => source.open(),
        }?;
        self.connected_at = Some(Instant::now());
        Ok(())
    }

    /// Next unit, or `Ok(None)` when nothing arrived within `wait`.
    pub fn next_unit(&mut self, wait: Duration) -> RecorderResult<Option<IngestUnit>> {
        let reader = match &self.backend {
            SourceBackend::Transport(source) => source.reader(),
            SourceBackend::Multipart(source) => source.reader(),
            SourceBackend::Snapshot(source) => source.reader(),
            SourceBackend::Synthetic(source) => source.reader(),
        };
        let Some(reader) = reader else {
            return Err(RecorderError::connect(self.endpoint(), "source not opened"));
        };
        let unit = reader.recv(wait)?;
        if let Some(unit) = unit.as_ref() {
            self.stats.units += 1;
            if unit.frame.is_some() {
                self.stats.frames_decoded += 1;
            }
            if let Some(chunk) = unit.chunk.as_ref() {
                self.stats.bytes += chunk.len() as u64;
            }
        }
        Ok(unit)
    }

    /// Stop the reader thread(s) and release the connection. Idempotent.
    pub fn close(&mut self) {
        match &mut self.backend {
            SourceBackend::Transport(source) => source.close(),
            SourceBackend::Multipart(source) => source.close(),
            SourceBackend::Snapshot(source) => source.close(),
            SourceBackend::Synthetic(source) => source.close(),
        }
        self.connected_at = None;
    }

    pub fn is_open(&self) -> bool {
        self.connected_at.is_some()
    }

    pub fn stats(&self) -> IngestStats {
        self.stats.clone()
    }

    fn endpoint(&self) -> String {
        match &self.backend {
            SourceBackend::Transport(source) => source.endpoint(),
            SourceBackend::Multipart(source) => source.endpoint(),
            SourceBackend::Snapshot(source) => source.endpoint(),
            SourceBackend::Synthetic(source) => source.endpoint(),
        }
    }
}

impl Drop for StreamSource {
    fn drop(&mut self) {
        self.close();
    }
}

// ----------------------------------------------------------------------------
// Reader threads
// ----------------------------------------------------------------------------

type UnitMessage = RecorderResult<IngestUnit>;

/// Producer half handed to a reader thread.
#[derive(Clone)]
pub(crate) struct UnitSender {
    tx: Sender<UnitMessage>,
    stop: Arc<AtomicBool>,
}

impl UnitSender {
    /// Blocks while the queue is full. Returns false once the reader should exit.
    pub(crate) fn send(&self, message: UnitMessage) -> bool {
        let mut message = message;
        loop {
            if self.stopped() {
                return false;
            }
            match self.tx.send_timeout(message, SEND_POLL) {
                Ok(()) => return true,
                Err(SendTimeoutError::Timeout(back)) => message = back,
                Err(SendTimeoutError::Disconnected(_)) => return false,
            }
        }
    }

    pub(crate) fn stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Sleep for `duration`, waking early on stop. Returns false if stopped.
    pub(crate) fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        while !self.stopped() {
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep((deadline - now).min(SEND_POLL));
        }
        false
    }
}

/// Consumer half plus the reader threads feeding it.
pub(crate) struct UnitReader {
    rx: Receiver<UnitMessage>,
    stop: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

impl UnitReader {
    pub(crate) fn new() -> (Self, UnitSender) {
        let (tx, rx) = channel::bounded(UNIT_QUEUE_DEPTH);
        let stop = Arc::new(AtomicBool::new(false));
        (
            Self {
                rx,
                stop: stop.clone(),
                handles: Vec::new(),
            },
            UnitSender { tx, stop },
        )
    }

    pub(crate) fn spawn<F>(&mut self, name: String, body: F) -> RecorderResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(body)
            .map_err(|e| RecorderError::connect(name, format!("spawn reader thread: {}", e)))?;
        self.handles.push(handle);
        Ok(())
    }

    pub(crate) fn recv(&self, wait: Duration) -> RecorderResult<Option<IngestUnit>> {
        match self.rx.recv_timeout(wait) {
            Ok(Ok(unit)) => Ok(Some(unit)),
            Ok(Err(e)) => Err(e),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(RecorderError::EndOfStream),
        }
    }

    /// Signal the readers to stop. Threads blocked in network reads are
    /// detached and exit on their next wakeup.
    pub(crate) fn shutdown(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        for handle in self.handles.drain(..) {
            if handle.is_finished() {
                let _ = handle.join();
            }
        }
    }
}
