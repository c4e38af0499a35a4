//! Submission boundary for finished captures.

use crate::error::SubmissionError;
use async_trait::async_trait;
use kosface_core::CapturePayload;
use std::path::{Path, PathBuf};

/// Receives the payload of a successful capture.
#[async_trait]
pub trait SubmissionSink: Send + Sync {
    async fn submit(&self, payload: &CapturePayload) -> Result<(), SubmissionError>;
}

/// Writes each payload as pretty-printed JSON to a fixed path.
pub struct JsonFileSink {
    path: PathBuf,
}

impl JsonFileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl SubmissionSink for JsonFileSink {
    async fn submit(&self, payload: &CapturePayload) -> Result<(), SubmissionError> {
        let json = serde_json::to_vec_pretty(payload)
            .map_err(|e| SubmissionError::Rejected(format!("serialize payload: {e}")))?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| SubmissionError::Io(format!("{}: {e}", parent.display())))?;
        }
        // Write-then-rename so readers never see a partial file.
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &json)
            .await
            .map_err(|e| SubmissionError::Io(format!("{}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| SubmissionError::Io(format!("{}: {e}", self.path.display())))?;

        tracing::info!(path = %self.path.display(), bytes = json.len(), mode = %payload.mode, "payload written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use kosface_core::CaptureMode;

    fn payload() -> CapturePayload {
        CapturePayload {
            mode: CaptureMode::Register,
            image_data: vec![1, 2, 3],
            timestamp: Utc::now(),
            face_detected: false,
            face_descriptor: None,
            liveness_score: None,
            quality_score: None,
            head_pose: None,
            blink_detected: false,
            anti_spoofing_passed: true,
        }
    }

    #[tokio::test]
    async fn test_json_sink_writes_payload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out/capture.json");
        let sink = JsonFileSink::new(&path);
        sink.submit(&payload()).await.unwrap();

        let written: CapturePayload =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(written, payload_with_timestamp(written.timestamp));
        assert!(!path.with_extension("json.tmp").exists());
    }

    fn payload_with_timestamp(timestamp: chrono::DateTime<Utc>) -> CapturePayload {
        CapturePayload { timestamp, ..payload() }
    }

    #[tokio::test]
    async fn test_json_sink_reports_io_error() {
        let dir = tempfile::tempdir().unwrap();
        // A regular file where a directory is expected.
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"x").unwrap();
        let sink = JsonFileSink::new(blocker.join("capture.json"));
        let err = sink.submit(&payload()).await.unwrap_err();
        assert!(matches!(err, SubmissionError::Io(_)), "got {err:?}");
    }
}
