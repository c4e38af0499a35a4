//! Face analysis boundary and its ONNX-backed implementation.
//!
//! The capture core only sees [`FaceAnalyzer`]. [`OnnxFaceAnalyzer`] runs the
//! model bundle on a dedicated inference thread: SCRFD detection, 68-point
//! landmark regression and, when the recognizer is installed, an ArcFace
//! descriptor from the five-point aligned crop.

use crate::detector::{DetectorError, FaceDetector};
use crate::frame::Frame;
use crate::landmarker::{Landmarker, LandmarkerError};
use crate::models::{self, ModelIntegrityError, ModelRole};
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::types::FrameAnalysis;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, OnceCell};

#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error("model bundle: {0}")]
    Model(#[from] ModelIntegrityError),
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("landmark error: {0}")]
    Landmarker(#[from] LandmarkerError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("failed to spawn inference thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("inference thread exited")]
    ChannelClosed,
    #[error("analysis failed: {0}")]
    Other(String),
}

/// Per-frame face analysis.
#[async_trait]
pub trait FaceAnalyzer: Send + Sync {
    /// Prepare the backend before the first frame. Default: nothing to load.
    async fn warm_up(&self) -> Result<(), AnalysisError> {
        Ok(())
    }

    /// Analyze one frame. `Ok(None)` means no face above the detection threshold.
    async fn analyze(&self, frame: Arc<Frame>) -> Result<Option<FrameAnalysis>, AnalysisError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    pub detection_threshold: f32,
    pub model_dir: PathBuf,
    pub verify_checksums: bool,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            detection_threshold: 0.5,
            model_dir: models::default_model_dir(),
            verify_checksums: true,
        }
    }
}

struct AnalyzeRequest {
    frame: Arc<Frame>,
    reply: oneshot::Sender<Result<Option<FrameAnalysis>, AnalysisError>>,
}

/// Model bundle owned by the inference thread.
struct Models {
    detector: FaceDetector,
    landmarker: Landmarker,
    recognizer: Option<FaceRecognizer>,
}

impl Models {
    fn load(config: &AnalyzerConfig) -> Result<Self, AnalysisError> {
        let dir = &config.model_dir;
        let verify = config.verify_checksums;

        let det_path = models::verify_model(dir, models::model_file(ModelRole::Detector), verify)?;
        let lmk_path = models::verify_model(dir, models::model_file(ModelRole::Landmarks), verify)?;
        let recognizer =
            match models::verify_model(dir, models::model_file(ModelRole::Recognizer), verify) {
                Ok(path) => Some(FaceRecognizer::load(&path)?),
                Err(ModelIntegrityError::MissingModel { name, .. }) => {
                    tracing::warn!(model = name, "recognizer not installed; descriptors disabled");
                    None
                }
                Err(e) => return Err(e.into()),
            };

        Ok(Self {
            detector: FaceDetector::load(&det_path)?,
            landmarker: Landmarker::load(&lmk_path)?,
            recognizer,
        })
    }

    fn analyze(&mut self, frame: &Frame, threshold: f32) -> Result<Option<FrameAnalysis>, AnalysisError> {
        let detections = self.detector.detect(frame, threshold)?;
        let count = detections.len();
        // Detector output is sorted by score; the first face wins.
        let Some(face) = detections.into_iter().next() else {
            return Ok(None);
        };
        if count > 1 {
            tracing::trace!(count, "multiple faces; using the first detection");
        }

        let landmarks = self.landmarker.landmarks(frame, &face.face_box)?;
        let descriptor = match self.recognizer.as_mut() {
            Some(recognizer) => {
                let keypoints = face.keypoints.unwrap_or_else(|| landmarks.five_point());
                Some(recognizer.extract(frame, &keypoints)?)
            }
            None => None,
        };

        Ok(Some(FrameAnalysis {
            face_box: face.face_box,
            landmarks,
            descriptor,
            detection_score: face.score,
        }))
    }
}

/// Clone-safe handle to the inference thread.
#[derive(Clone)]
struct InferenceHandle {
    tx: mpsc::Sender<AnalyzeRequest>,
}

/// Spawn the inference thread and wait until its models are loaded.
async fn spawn_inference(config: AnalyzerConfig) -> Result<InferenceHandle, AnalysisError> {
    let (tx, mut rx) = mpsc::channel::<AnalyzeRequest>(2);
    let (ready_tx, ready_rx) = oneshot::channel::<Result<(), AnalysisError>>();

    std::thread::Builder::new()
        .name("kosface-inference".into())
        .spawn(move || {
            let mut models = match Models::load(&config) {
                Ok(models) => {
                    let _ = ready_tx.send(Ok(()));
                    models
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            tracing::info!(
                dir = %config.model_dir.display(),
                recognizer = models.recognizer.is_some(),
                "inference thread started"
            );
            while let Some(req) = rx.blocking_recv() {
                let result = models.analyze(&req.frame, config.detection_threshold);
                // The caller may have abandoned the request.
                let _ = req.reply.send(result);
            }
            tracing::info!("inference thread exiting");
        })
        .map_err(AnalysisError::Spawn)?;

    ready_rx.await.map_err(|_| AnalysisError::ChannelClosed)??;
    Ok(InferenceHandle { tx })
}

/// ONNX Runtime analyzer over the InsightFace model bundle.
///
/// Models load lazily on [`FaceAnalyzer::warm_up`] (or the first `analyze`).
/// A failed load is retried on the next call.
pub struct OnnxFaceAnalyzer {
    config: AnalyzerConfig,
    handle: OnceCell<InferenceHandle>,
}

impl OnnxFaceAnalyzer {
    pub fn new(config: AnalyzerConfig) -> Self {
        Self {
            config,
            handle: OnceCell::new(),
        }
    }

    pub fn config(&self) -> &AnalyzerConfig {
        &self.config
    }

    async fn handle(&self) -> Result<&InferenceHandle, AnalysisError> {
        self.handle
            .get_or_try_init(|| spawn_inference(self.config.clone()))
            .await
    }
}

#[async_trait]
impl FaceAnalyzer for OnnxFaceAnalyzer {
    async fn warm_up(&self) -> Result<(), AnalysisError> {
        self.handle().await.map(|_| ())
    }

    async fn analyze(&self, frame: Arc<Frame>) -> Result<Option<FrameAnalysis>, AnalysisError> {
        let handle = self.handle().await?;
        let (reply, reply_rx) = oneshot::channel();
        handle
            .tx
            .send(AnalyzeRequest { frame, reply })
            .await
            .map_err(|_| AnalysisError::ChannelClosed)?;
        reply_rx.await.map_err(|_| AnalysisError::ChannelClosed)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::flat_frame;

    #[tokio::test]
    async fn test_warm_up_fails_without_models() {
        let dir = tempfile::tempdir().unwrap();
        let analyzer = OnnxFaceAnalyzer::new(AnalyzerConfig {
            model_dir: dir.path().to_path_buf(),
            ..Default::default()
        });
        let err = analyzer.warm_up().await.unwrap_err();
        assert!(
            matches!(err, AnalysisError::Model(ModelIntegrityError::MissingModel { name: "det_10g.onnx", .. })),
            "got {err:?}"
        );
    }

    #[tokio::test]
    async fn test_analyze_retries_load_and_reports_error() {
        let dir = tempfile::tempdir().unwrap();
        let analyzer = OnnxFaceAnalyzer::new(AnalyzerConfig {
            model_dir: dir.path().to_path_buf(),
            ..Default::default()
        });
        let frame = Arc::new(flat_frame(32, 32, 128));
        assert!(analyzer.analyze(frame.clone()).await.is_err());
        assert!(analyzer.analyze(frame).await.is_err());
    }

    #[test]
    fn test_default_config() {
        let config = AnalyzerConfig::default();
        assert_eq!(config.detection_threshold, 0.5);
        assert!(config.verify_checksums);
        assert!(config.model_dir.ends_with("kosface/models"));
    }
}
