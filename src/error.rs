//! Recorder error taxonomy.
//!
//! Every failure inside a camera worker is classified so the supervisor can
//! decide between retrying, skipping, abandoning a segment, or halting.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RecorderError {
    /// Endpoint unreachable, auth failure, or a stream that stalled.
    #[error("connect failed for {endpoint}: {reason}")]
    Connect { endpoint: String, reason: String },

    /// A corrupt frame. The unit is skipped but counts toward the error budget.
    #[error("decode failed: {0}")]
    Decode(String),

    /// Disk full or permission problem while writing a segment.
    #[error("write failed for {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Re-encode or clip generation failed. The original file is retained.
    #[error("transcode failed for {}: {reason}", path.display())]
    Transcode { path: PathBuf, reason: String },

    /// Alert delivery failed. Never affects recording.
    #[error("notification failed: {0}")]
    Notification(String),

    /// The source closed the stream.
    #[error("end of stream")]
    EndOfStream,
}

impl RecorderError {
    pub fn connect(endpoint: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Connect {
            endpoint: endpoint.into(),
            reason: reason.to_string(),
        }
    }

    /// Errors that end the current ingestion attempt and trigger a reconnect.
    pub fn ends_session(&self) -> bool {
        matches!(self, Self::Connect { .. } | Self::EndOfStream)
    }
}

pub type RecorderResult<T> = std::result::Result<T, RecorderError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_and_eos_end_the_session() {
        assert!(RecorderError::connect("rtsp://cam", "refused").ends_session());
        assert!(RecorderError::EndOfStream.ends_session());
        assert!(!RecorderError::Decode("bad huffman table".into()).ends_session());
    }

    #[test]
    fn write_error_names_the_path() {
        let err = RecorderError::Write {
            path: PathBuf::from("/rec/cam/motion_20240101_000000.ts"),
            source: std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
        };
        let msg = err.to_string();
        assert!(msg.contains("motion_20240101_000000.ts"));
        assert!(msg.contains("disk full"));
    }
}
