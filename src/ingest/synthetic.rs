//! Synthetic source for `stub://` URLs.
//!
//! `stub://<name>?fps=30&motion=100-160,400-420&frames=300&width=160&height=120&realtime=1&fail=0`
//!
//! Frames are a flat dark background. Inside each motion window (inclusive
//! frame indices, comma separated) a large bright square steps across the picture through
//! seven positions, so consecutive frames sampled at any stride coprime with
//! seven differ. Capture instants are derived from the frame index, so the
//! timeline is exact even when `realtime=0` generates frames as fast as the
//! consumer takes them.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use image::{DynamicImage, GrayImage, Luma};
use url::Url;

use super::transport::TS_PACKET_SIZE;
use super::{IngestUnit, UnitReader, UnitSender};
use crate::config::{CameraConfig, StreamKind};
use crate::error::{RecorderError, RecorderResult};
use crate::frame::{encode_jpeg, Chunk, Frame};

const BACKGROUND_LUMA: u8 = 40;
const OBJECT_LUMA: u8 = 230;
const OBJECT_POSITIONS: u32 = 7;

#[derive(Clone, Debug, PartialEq)]
pub struct SyntheticSpec {
    pub name: String,
    pub fps: f64,
    pub motion: Vec<(u64, u64)>,
    pub frames: Option<u64>,
    pub width: u32,
    pub height: u32,
    pub realtime: bool,
    pub fail: bool,
}

impl SyntheticSpec {
    pub fn parse(raw: &str) -> Result<Self> {
        let url = Url::parse(raw).with_context(|| format!("parse stub url '{}'", raw))?;
        if url.scheme() != "stub" {
            return Err(anyhow!("not a stub url: {}", raw));
        }
        let mut spec = Self {
            name: url.host_str().unwrap_or("stub").to_string(),
            fps: 30.0,
            motion: Vec::new(),
            frames: None,
            width: 160,
            height: 120,
            realtime: true,
            fail: false,
        };
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "fps" => spec.fps = value.parse().context("stub fps")?,
                "motion" => {
                    for window in value.split(',') {
                        let (start, end) = window
                            .split_once('-')
                            .ok_or_else(|| anyhow!("stub motion must be <start>-<end>[,...]"))?;
                        spec.motion.push((
                            start.parse().context("stub motion start")?,
                            end.parse().context("stub motion end")?,
                        ));
                    }
                }
                "frames" => spec.frames = Some(value.parse().context("stub frames")?),
                "width" => spec.width = value.parse().context("stub width")?,
                "height" => spec.height = value.parse().context("stub height")?,
                "realtime" => spec.realtime = value != "0" && value != "false",
                "fail" => spec.fail = value == "1" || value == "true",
                other => log::warn!("stub url: ignoring unknown parameter '{}'", other),
            }
        }
        if !(spec.fps > 0.0) {
            return Err(anyhow!("stub fps must be > 0"));
        }
        if spec.width < 8 || spec.height < 8 {
            return Err(anyhow!("stub frames must be at least 8x8"));
        }
        Ok(spec)
    }

    pub fn in_motion(&self, index: u64) -> bool {
        self.motion
            .iter()
            .any(|&(start, end)| index >= start && index <= end)
    }
}

pub struct SyntheticSource {
    spec: SyntheticSpec,
    stream_kind: StreamKind,
    decode_every_n: u64,
    reader: Option<UnitReader>,
}

impl SyntheticSource {
    pub fn new(config: &CameraConfig) -> Result<Self> {
        Ok(Self {
            spec: SyntheticSpec::parse(&config.url)?,
            stream_kind: config.stream_kind,
            decode_every_n: u64::from(config.decode_every_n.max(1)),
            reader: None,
        })
    }

    pub(crate) fn open(&mut self) -> RecorderResult<()> {
        self.close();
        if self.spec.fail {
            return Err(RecorderError::connect(self.endpoint(), "synthetic connect failure"));
        }
        let templates = Templates::render(&self.spec)?;
        let (mut reader, sender) = UnitReader::new();
        let generator = Generator {
            spec: self.spec.clone(),
            stream_kind: self.stream_kind,
            decode_every_n: self.decode_every_n,
            templates,
        };
        reader.spawn(format!("stub-{}", self.spec.name), move || generator.run(sender))?;
        self.reader = Some(reader);
        log::info!("{}: connected (synthetic, {} fps)", self.endpoint(), self.spec.fps);
        Ok(())
    }

    pub(crate) fn reader(&self) -> Option<&UnitReader> {
        self.reader.as_ref()
    }

    pub(crate) fn close(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.shutdown();
        }
    }

    pub(crate) fn endpoint(&self) -> String {
        format!("stub://{}", self.spec.name)
    }
}

struct Templates {
    background: Frame,
    positions: Vec<Frame>,
}

impl Templates {
    fn render(spec: &SyntheticSpec) -> RecorderResult<Self> {
        let (w, h) = (spec.width, spec.height);
        let side = (w.min(h) / 2).max(4);
        let top = (h - side) / 2;
        let render = |x0: Option<u32>| -> RecorderResult<Frame> {
            let mut img = GrayImage::from_pixel(w, h, Luma([BACKGROUND_LUMA]));
            if let Some(x0) = x0 {
                for y in top..top + side {
                    for x in x0..(x0 + side).min(w) {
                        img.put_pixel(x, y, Luma([OBJECT_LUMA]));
                    }
                }
            }
            let jpeg = encode_jpeg(&DynamicImage::ImageLuma8(img), 85)?;
            Frame::decode(jpeg, Instant::now())
        };
        let travel = w.saturating_sub(side);
        let positions = (0..OBJECT_POSITIONS)
            .map(|k| render(Some(travel * k / (OBJECT_POSITIONS - 1))))
            .collect::<RecorderResult<Vec<_>>>()?;
        Ok(Self {
            background: render(None)?,
            positions,
        })
    }
}

struct Generator {
    spec: SyntheticSpec,
    stream_kind: StreamKind,
    decode_every_n: u64,
    templates: Templates,
}

impl Generator {
    fn run(self, sender: UnitSender) {
        let interval = Duration::from_secs_f64(1.0 / self.spec.fps);
        let origin = Instant::now();
        let mut index: u64 = 0;
        loop {
            if self.spec.frames.is_some_and(|limit| index >= limit) {
                sender.send(Err(RecorderError::EndOfStream));
                return;
            }
            let offset = Duration::from_secs_f64(index as f64 / self.spec.fps);
            let captured_at = origin + offset;
            if self.spec.realtime {
                let wait = captured_at.saturating_duration_since(Instant::now());
                if !wait.is_zero() && !sender.sleep(wait) {
                    return;
                }
            }
            if !sender.send(Ok(self.unit(index, captured_at, interval))) {
                return;
            }
            index += 1;
        }
    }

    fn unit(&self, index: u64, captured_at: Instant, interval: Duration) -> IngestUnit {
        let template = if self.spec.in_motion(index) {
            let slot = (index % u64::from(OBJECT_POSITIONS)) as usize;
            &self.templates.positions[slot]
        } else {
            &self.templates.background
        };
        let mut frame = template.clone();
        frame.captured_at = captured_at;
        frame.wall_time = Utc::now();

        match self.stream_kind {
            StreamKind::TransportStream => {
                // A null-packet payload sized like a small frame at this rate.
                let packets = ((interval.as_secs_f64() * 400.0).ceil() as usize).max(1);
                let mut bytes = Vec::with_capacity(packets * TS_PACKET_SIZE);
                for _ in 0..packets {
                    let mut packet = [0xFFu8; TS_PACKET_SIZE];
                    packet[..4].copy_from_slice(&[0x47, 0x1F, 0xFF, 0x10]);
                    bytes.extend_from_slice(&packet);
                }
                IngestUnit {
                    frame: (index % self.decode_every_n == 0).then_some(frame),
                    chunk: Some(Chunk::new(Arc::new(bytes), captured_at)),
                }
            }
            _ => IngestUnit::image(frame),
        }
    }
}
