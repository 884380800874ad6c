//! Frame containers and the pre-roll ring buffer.
//!
//! - `Frame`: one decoded image (JPEG bytes + greyscale plane) used for analysis and preview.
//! - `Chunk`: one recordable unit (transport bytes or a JPEG), the thing segments are made of.
//! - `FrameBuffer`: bounded FIFO of recent chunks, flushed into a motion segment on trigger.
//! - `LatestFrame`: shared slot holding the last decoded JPEG for `latest_frame()`.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Utc};
use image::GrayImage;

use crate::error::{RecorderError, RecorderResult};

// ----------------------------------------------------------------------------
// Frame: decoded image
// ----------------------------------------------------------------------------

#[derive(Clone)]
pub struct Frame {
    pub jpeg: Arc<Vec<u8>>,
    pub luma: Arc<GrayImage>,
    pub captured_at: Instant,
    pub wall_time: DateTime<Utc>,
}

impl Frame {
    /// Decode a JPEG into a frame. Corrupt images are `RecorderError::Decode`.
    pub fn decode(jpeg: Vec<u8>, captured_at: Instant) -> RecorderResult<Self> {
        let image = image::load_from_memory(&jpeg)
            .map_err(|e| RecorderError::Decode(format!("jpeg: {}", e)))?;
        Ok(Self {
            jpeg: Arc::new(jpeg),
            luma: Arc::new(image.to_luma8()),
            captured_at,
            wall_time: Utc::now(),
        })
    }

    pub fn width(&self) -> u32 {
        self.luma.width()
    }

    pub fn height(&self) -> u32 {
        self.luma.height()
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width())
            .field("height", &self.height())
            .field("jpeg_bytes", &self.jpeg.len())
            .finish()
    }
}

/// One recordable unit of the stream.
#[derive(Clone, Debug)]
pub struct Chunk {
    pub bytes: Arc<Vec<u8>>,
    pub captured_at: Instant,
}

impl Chunk {
    pub fn new(bytes: Arc<Vec<u8>>, captured_at: Instant) -> Self {
        Self { bytes, captured_at }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

// ----------------------------------------------------------------------------
// FrameBuffer: bounded ring for pre-roll
// ----------------------------------------------------------------------------

/// Bounded ring buffer of recent chunks.
///
/// Capacity is fixed at construction (`ceil(fps x pre_roll_secs)`); the oldest
/// chunk is evicted first. A zero-capacity buffer keeps nothing.
pub struct FrameBuffer {
    buffer: VecDeque<Chunk>,
    capacity: usize,
    bytes: usize,
}

impl FrameBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: VecDeque::with_capacity(capacity),
            capacity,
            bytes: 0,
        }
    }

    /// Push a chunk, evicting from the front while at capacity.
    pub fn push(&mut self, chunk: Chunk) {
        if self.capacity == 0 {
            return;
        }
        while self.buffer.len() >= self.capacity {
            if let Some(evicted) = self.buffer.pop_front() {
                self.bytes -= evicted.len();
            }
        }
        self.bytes += chunk.len();
        self.buffer.push_back(chunk);
    }

    /// Take every buffered chunk, oldest first. The buffer is empty afterwards.
    pub fn drain(&mut self) -> impl Iterator<Item = Chunk> + '_ {
        self.bytes = 0;
        self.buffer.drain(..)
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn memory_bytes(&self) -> usize {
        self.bytes
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
        self.bytes = 0;
    }
}

// ----------------------------------------------------------------------------
// LatestFrame: preview slot
// ----------------------------------------------------------------------------

/// Last decoded JPEG, shared between the worker (writer) and callers of `latest_frame()`.
#[derive(Clone, Default)]
pub struct LatestFrame {
    slot: Arc<Mutex<Option<Arc<Vec<u8>>>>>,
}

impl LatestFrame {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, jpeg: Arc<Vec<u8>>) {
        if let Ok(mut slot) = self.slot.lock() {
            *slot = Some(jpeg);
        }
    }

    pub fn get(&self) -> Option<Arc<Vec<u8>>> {
        self.slot.lock().ok().and_then(|slot| slot.clone())
    }

    pub fn clear(&self) {
        if let Ok(mut slot) = self.slot.lock() {
            *slot = None;
        }
    }
}

/// Encode a greyscale or RGB image to JPEG bytes.
pub fn encode_jpeg(image: &image::DynamicImage, quality: u8) -> RecorderResult<Vec<u8>> {
    let mut out = Vec::new();
    let mut encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, quality);
    encoder
        .encode_image(image)
        .map_err(|e| RecorderError::Decode(format!("jpeg encode: {}", e)))?;
    Ok(out)
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(byte: u8, len: usize) -> Chunk {
        Chunk::new(Arc::new(vec![byte; len]), Instant::now())
    }

    #[test]
    fn buffer_evicts_oldest_first() {
        let mut buffer = FrameBuffer::new(3);
        for i in 0..5u8 {
            buffer.push(chunk(i, 10));
            assert!(buffer.len() <= 3);
        }
        let drained: Vec<u8> = buffer.drain().map(|c| c.bytes[0]).collect();
        assert_eq!(drained, vec![2, 3, 4]);
        assert!(buffer.is_empty());
        assert_eq!(buffer.memory_bytes(), 0);
    }

    #[test]
    fn buffer_tracks_memory() {
        let mut buffer = FrameBuffer::new(2);
        buffer.push(chunk(0, 100));
        buffer.push(chunk(1, 50));
        buffer.push(chunk(2, 25));
        assert_eq!(buffer.memory_bytes(), 75);
    }

    #[test]
    fn zero_capacity_keeps_nothing() {
        let mut buffer = FrameBuffer::new(0);
        buffer.push(chunk(7, 4));
        assert!(buffer.is_empty());
    }

    #[test]
    fn decode_rejects_garbage() {
        let err = Frame::decode(vec![0xFF, 0xD8, 0x00, 0xFF, 0xD9], Instant::now()).unwrap_err();
        assert!(matches!(err, RecorderError::Decode(_)));
    }

    #[test]
    fn decode_roundtrips_encoded_image() {
        let img = image::DynamicImage::ImageLuma8(GrayImage::from_pixel(32, 24, image::Luma([90])));
        let jpeg = encode_jpeg(&img, 80).unwrap();
        let frame = Frame::decode(jpeg, Instant::now()).unwrap();
        assert_eq!((frame.width(), frame.height()), (32, 24));
    }

    #[test]
    fn latest_frame_publishes_and_clears() {
        let latest = LatestFrame::new();
        assert!(latest.get().is_none());
        latest.publish(Arc::new(vec![1, 2, 3]));
        assert_eq!(latest.get().unwrap().as_slice(), &[1, 2, 3]);
        latest.clear();
        assert!(latest.get().is_none());
    }
}
