//! Periodic single-image source.

use std::io::Read;
use std::time::{Duration, Instant};

use super::process::redact_url;
use super::{IngestUnit, UnitReader, UnitSender, HTTP_CONNECT_TIMEOUT, HTTP_READ_TIMEOUT};
use crate::error::{RecorderError, RecorderResult};
use crate::frame::Frame;

pub struct SnapshotSource {
    url: String,
    interval: Duration,
    reader: Option<UnitReader>,
}

impl SnapshotSource {
    pub fn new(url: String, interval: Duration) -> Self {
        Self {
            url,
            interval,
            reader: None,
        }
    }

    /// The first fetch happens here so an unreachable camera fails `open`.
    pub(crate) fn open(&mut self) -> RecorderResult<()> {
        self.close();
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(HTTP_CONNECT_TIMEOUT)
            .timeout_read(HTTP_READ_TIMEOUT)
            .build();
        let first = fetch_single_jpeg(&agent, &self.url)?;

        let (mut reader, sender) = UnitReader::new();
        let url = self.url.clone();
        let interval = self.interval;
        reader.spawn(format!("snapshot-{}", self.endpoint()), move || {
            poll_snapshots(agent, url, interval, first, sender)
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

fn poll_snapshots(
    agent: ureq::Agent,
    url: String,
    interval: Duration,
    first: Vec<u8>,
    sender: UnitSender,
) {
    let mut next = Some(first);
    loop {
        let started = Instant::now();
        let message = match next.take() {
            Some(jpeg) => Frame::decode(jpeg, started).map(IngestUnit::image),
            None => match fetch_single_jpeg(&agent, &url) {
                Ok(jpeg) => Frame::decode(jpeg, started).map(IngestUnit::image),
                // An empty or corrupt snapshot costs one decode error; keep polling.
                Err(e) if !e.ends_session() => Err(e),
                Err(e) => {
                    sender.send(Err(e));
                    return;
                }
            },
        };
        if !sender.send(message) {
            return;
        }
        if !sender.sleep(interval.saturating_sub(started.elapsed())) {
            return;
        }
    }
}

fn fetch_single_jpeg(agent: &ureq::Agent, url: &str) -> RecorderResult<Vec<u8>> {
    let endpoint = redact_url(url);
    let response = agent
        .get(url)
        .call()
        .map_err(|e| RecorderError::connect(endpoint.clone(), e))?;
    let mut bytes = Vec::new();
    response
        .into_reader()
        .read_to_end(&mut bytes)
        .map_err(|e| RecorderError::connect(endpoint.clone(), format!("read snapshot: {}", e)))?;
    if bytes.is_empty() {
        return Err(RecorderError::Decode(format!("empty snapshot from {}", endpoint)));
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::TcpListener;

    /// Serves one snapshot per connection; the second response has an empty body.
    fn flaky_camera() -> String {
        let jpeg = crate::frame::encode_jpeg(&image::DynamicImage::new_luma8(16, 16), 80).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            for (n, stream) in listener.incoming().enumerate() {
                let Ok(mut stream) = stream else { return };
                let mut request = Vec::new();
                let mut byte = [0u8; 1];
                while !request.ends_with(b"\r\n\r\n") {
                    match stream.read(&mut byte) {
                        Ok(1) => request.push(byte[0]),
                        _ => break,
                    }
                }
                let body: &[u8] = if n == 1 { &[] } else { &jpeg };
                let head = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    body.len()
                );
                let _ = stream.write_all(head.as_bytes());
                let _ = stream.write_all(body);
            }
        });
        format!("http://{}/snapshot.jpg", addr)
    }

    #[test]
    fn empty_snapshot_is_one_decode_error_and_polling_continues() {
        let mut source = SnapshotSource::new(flaky_camera(), Duration::from_millis(10));
        source.open().unwrap();
        let reader = source.reader().unwrap();
        let wait = Duration::from_secs(5);

        assert!(reader.recv(wait).unwrap().is_some());
        match reader.recv(wait) {
            Err(RecorderError::Decode(reason)) => assert!(reason.contains("empty snapshot")),
            other => panic!("expected a decode error, got {:?}", other.map(|u| u.is_some())),
        }
        assert!(reader.recv(wait).unwrap().is_some());
        assert!(reader.recv(wait).unwrap().is_some());
        source.close();
    }

    #[test]
    fn unreachable_camera_fails_open_with_connect_error() {
        // Port 9 on localhost is the discard service; nothing listens there in CI.
        let mut source = SnapshotSource::new(
            "http://127.0.0.1:9/snapshot.jpg".to_string(),
            Duration::from_secs(1),
        );
        let err = source.open().unwrap_err();
        assert!(err.ends_session());
        assert!(source.reader().is_none());
    }

    #[test]
    fn endpoint_hides_password() {
        let source = SnapshotSource::new(
            "http://admin:pw@10.0.0.9/snap.jpg".to_string(),
            Duration::from_secs(1),
        );
        assert!(!source.endpoint().contains(":pw@"));
    }
}
