//! Transport-stream source (RTSP, RTMP, HTTP-TS, files).
//!
//! Two `ffmpeg` consumers read the same endpoint:
//! - the copy path remuxes the original encoded stream to MPEG-TS without
//!   re-encoding and is cut into 188-byte aligned chunks for recording
//! - the decode path samples every Nth frame as JPEG for analysis and preview

use std::io::Read;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::multipart::MjpegStream;
use super::process::{redact_url, CommandSpec, ProcessLauncher, ProcessPipe};
use super::{IngestUnit, UnitReader, UnitSender};
use crate::config::{CameraConfig, TransportHint};
use crate::error::{RecorderError, RecorderResult};
use crate::frame::{Chunk, Frame};

pub const TS_PACKET_SIZE: usize = 188;
const READ_PACKETS: usize = 64;
const FFMPEG: &str = "ffmpeg";

pub struct TransportSource {
    url: String,
    transport: TransportHint,
    decode_every_n: u32,
    chunk_interval: Duration,
    launcher: Arc<dyn ProcessLauncher>,
    copy: Option<Box<dyn ProcessPipe>>,
    decode: Option<Box<dyn ProcessPipe>>,
    reader: Option<UnitReader>,
}

impl TransportSource {
    pub fn new(config: &CameraConfig, url: String, launcher: Arc<dyn ProcessLauncher>) -> Self {
        Self {
            url,
            transport: config.transport,
            decode_every_n: config.decode_every_n.max(1),
            chunk_interval: Duration::from_secs_f64(1.0 / config.fps_hint),
            launcher,
            copy: None,
            decode: None,
            reader: None,
        }
    }

    fn input_args(&self) -> Vec<String> {
        let mut args = vec!["-hide_banner".to_string(), "-loglevel".into(), "error".into()];
        if self.url.starts_with("rtsp") {
            args.push("-rtsp_transport".into());
            args.push(self.transport.as_str().into());
        }
        args.push("-i".into());
        args.push(self.url.clone());
        args
    }

    pub fn copy_command(&self) -> CommandSpec {
        CommandSpec::new(FFMPEG)
            .args(self.input_args())
            .args(["-map", "0", "-c", "copy", "-f", "mpegts", "pipe:1"])
    }

    pub fn decode_command(&self) -> CommandSpec {
        CommandSpec::new(FFMPEG)
            .args(self.input_args())
            .args([
                "-an".to_string(),
                "-vf".to_string(),
                format!("select=not(mod(n\\,{}))", self.decode_every_n),
                "-vsync".to_string(),
                "vfr".to_string(),
                "-q:v".to_string(),
                "5".to_string(),
                "-f".to_string(),
                "image2pipe".to_string(),
                "-vcodec".to_string(),
                "mjpeg".to_string(),
                "pipe:1".to_string(),
            ])
    }

    pub(crate) fn open(&mut self) -> RecorderResult<()> {
        self.close();
        let endpoint = self.endpoint();

        let mut copy = self
            .launcher
            .spawn(&self.copy_command())
            .map_err(|e| RecorderError::connect(endpoint.clone(), format!("spawn copy path: {}", e)))?;
        let mut decode = match self.launcher.spawn(&self.decode_command()) {
            Ok(decode) => decode,
            Err(e) => {
                copy.kill();
                return Err(RecorderError::connect(
                    endpoint,
                    format!("spawn decode path: {}", e),
                ));
            }
        };
        let (Some(copy_out), Some(decode_out)) = (copy.take_stdout(), decode.take_stdout()) else {
            copy.kill();
            decode.kill();
            return Err(RecorderError::connect(endpoint, "ffmpeg stdout unavailable"));
        };

        let (mut reader, sender) = UnitReader::new();
        let interval = self.chunk_interval;
        let copy_sender = sender.clone();
        reader.spawn(format!("ts-copy-{}", endpoint), move || {
            pump_transport(copy_out, interval, copy_sender)
        })?;
        reader.spawn(format!("ts-decode-{}", endpoint), move || {
            pump_decoded(decode_out, sender)
        })?;

        self.copy = Some(copy);
        self.decode = Some(decode);
        self.reader = Some(reader);
        log::info!(
            "{}: transport copy + decode (every {}th frame) started",
            endpoint,
            self.decode_every_n
        );
        Ok(())
    }

    pub(crate) fn reader(&self) -> Option<&UnitReader> {
        self.reader.as_ref()
    }

    pub(crate) fn close(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.shutdown();
        }
        for mut pipe in [self.copy.take(), self.decode.take()].into_iter().flatten() {
            pipe.kill();
        }
    }

    pub(crate) fn endpoint(&self) -> String {
        redact_url(&self.url)
    }
}

/// Relay transport bytes, one aligned chunk per nominal frame interval.
fn pump_transport(mut out: Box<dyn Read + Send>, interval: Duration, sender: UnitSender) {
    let mut read_buf = vec![0u8; TS_PACKET_SIZE * READ_PACKETS];
    let mut pending: Vec<u8> = Vec::with_capacity(read_buf.len() * 2);
    let mut last_emit = Instant::now();

    loop {
        if sender.stopped() {
            return;
        }
        let read = match out.read(&mut read_buf) {
            Ok(0) => {
                flush_aligned(&mut pending, &sender);
                sender.send(Err(RecorderError::EndOfStream));
                return;
            }
            Ok(n) => n,
            Err(e) => {
                sender.send(Err(RecorderError::connect("transport copy", e)));
                return;
            }
        };
        pending.extend_from_slice(&read_buf[..read]);
        if last_emit.elapsed() >= interval && pending.len() >= TS_PACKET_SIZE {
            if !flush_aligned(&mut pending, &sender) {
                return;
            }
            last_emit = Instant::now();
        }
    }
}

/// Emit every whole packet in `pending`, keeping the unaligned tail.
fn flush_aligned(pending: &mut Vec<u8>, sender: &UnitSender) -> bool {
    let aligned = pending.len() - pending.len() % TS_PACKET_SIZE;
    if aligned == 0 {
        return true;
    }
    let bytes: Vec<u8> = pending.drain(..aligned).collect();
    sender.send(Ok(IngestUnit {
        frame: None,
        chunk: Some(Chunk::new(Arc::new(bytes), Instant::now())),
    }))
}

fn pump_decoded(out: Box<dyn Read + Send>, sender: UnitSender) {
    let mut stream = MjpegStream::new(out);
    loop {
        let message = match stream.read_next_jpeg() {
            Ok(jpeg) => Frame::decode(jpeg, Instant::now()).map(|frame| IngestUnit {
                frame: Some(frame),
                chunk: None,
            }),
            Err(e) => {
                sender.send(Err(e));
                return;
            }
        };
        if !sender.send(message) {
            return;
        }
    }
}
