//! Pull-based multipart JPEG source.
//!
//! The endpoint answers one HTTP request with a never-ending body of JPEG
//! images separated by multipart boundaries. Images are cut out of the byte
//! stream at SOI/EOI markers, so boundary headers are never parsed.

use std::io::Read;
use std::time::Instant;

use super::process::redact_url;
use super::{IngestUnit, UnitReader, UnitSender, HTTP_CONNECT_TIMEOUT, HTTP_READ_TIMEOUT};
use crate::error::{RecorderError, RecorderResult};
use crate::frame::Frame;

const MAX_JPEG_BYTES: usize = 5 * 1024 * 1024;
const READ_CHUNK: usize = 8192;

pub struct MultipartSource {
    url: String,
    reader: Option<UnitReader>,
}

impl MultipartSource {
    pub fn new(url: String) -> Self {
        Self { url, reader: None }
    }

    pub(crate) fn open(&mut self) -> RecorderResult<()> {
        self.close();
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(HTTP_CONNECT_TIMEOUT)
            .timeout_read(HTTP_READ_TIMEOUT)
            .build();
        let response = agent
            .get(&self.url)
            .call()
            .map_err(|e| RecorderError::connect(self.endpoint(), e))?;
        let content_type = response.header("Content-Type").unwrap_or("").to_lowercase();
        if !content_type.contains("multipart") && !content_type.contains("jpeg") {
            log::warn!(
                "{}: unexpected content type '{}', parsing as multipart anyway",
                self.endpoint(),
                content_type
            );
        }

        let (mut reader, sender) = UnitReader::new();
        let stream = MjpegStream::new(response.into_reader());
        reader.spawn(format!("mjpeg-{}", self.endpoint()), move || {
            pump_multipart(stream, sender)
        })?;
        self.reader = Some(reader);
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
        redact_url(&self.url)
    }
}

fn pump_multipart(mut stream: MjpegStream, sender: UnitSender) {
    while !sender.stopped() {
        let message = match stream.read_next_jpeg() {
            Ok(jpeg) => Frame::decode(jpeg, Instant::now()).map(IngestUnit::image),
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

/// Incremental JPEG extractor over any byte stream.
pub struct MjpegStream {
    reader: Box<dyn Read + Send>,
    buffer: Vec<u8>,
}

impl MjpegStream {
    pub fn new(reader: Box<dyn Read + Send>) -> Self {
        Self {
            reader,
            buffer: Vec::with_capacity(64 * 1024),
        }
    }

    /// Next complete JPEG. A closed stream is `EndOfStream`, a failed read `Connect`.
    pub fn read_next_jpeg(&mut self) -> RecorderResult<Vec<u8>> {
        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            if let Some((start, end)) = find_jpeg_bounds(&self.buffer) {
                let frame = self.buffer[start..end].to_vec();
                self.buffer.drain(..end);
                return Ok(frame);
            }

            let read = self
                .reader
                .read(&mut chunk)
                .map_err(|e| RecorderError::connect("mjpeg stream", e))?;
            if read == 0 {
                return Err(RecorderError::EndOfStream);
            }
            self.buffer.extend_from_slice(&chunk[..read]);

            if self.buffer.len() > MAX_JPEG_BYTES * 2 {
                let keep = 2.min(self.buffer.len());
                let drain_len = self.buffer.len() - keep;
                self.buffer.drain(..drain_len);
            }
        }
    }
}

/// Byte range of the first complete SOI..EOI image in `buffer`.
pub fn find_jpeg_bounds(buffer: &[u8]) -> Option<(usize, usize)> {
    let start = buffer.windows(2).position(|w| w == [0xFF, 0xD8])?;
    let end = buffer[start + 2..]
        .windows(2)
        .position(|w| w == [0xFF, 0xD9])?;
    Some((start, start + 2 + end + 2))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn fake_jpeg(fill: u8) -> Vec<u8> {
        let mut bytes = vec![0xFF, 0xD8];
        bytes.extend(std::iter::repeat(fill).take(16));
        bytes.extend([0xFF, 0xD9]);
        bytes
    }

    #[test]
    fn bounds_skip_boundary_headers() {
        let mut body = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n".to_vec();
        let start = body.len();
        body.extend(fake_jpeg(0x11));
        body.extend(b"\r\n--frame\r\n");
        assert_eq!(find_jpeg_bounds(&body), Some((start, start + 20)));
    }

    #[test]
    fn incomplete_image_has_no_bounds() {
        assert_eq!(find_jpeg_bounds(&[0xFF, 0xD8, 0x01, 0x02]), None);
        assert_eq!(find_jpeg_bounds(&[0x00, 0x01]), None);
    }

    #[test]
    fn stream_yields_images_in_order_then_end() {
        let mut body = Vec::new();
        for fill in [1u8, 2, 3] {
            body.extend(b"--frame\r\n\r\n");
            body.extend(fake_jpeg(fill));
        }
        let mut stream = MjpegStream::new(Box::new(Cursor::new(body)));
        for fill in [1u8, 2, 3] {
            let jpeg = stream.read_next_jpeg().unwrap();
            assert_eq!(jpeg[2], fill);
        }
        assert!(matches!(
            stream.read_next_jpeg(),
            Err(RecorderError::EndOfStream)
        ));
    }
}
