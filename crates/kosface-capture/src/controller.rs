//! Capture session state machine.
//!
//! `Ready → Loading → Capturing → Processing → Success | Failed`, with
//! `Failed` returning to `Ready` after `failure_reset_ms`.
//!
//! One session owns the frame source at a time. A session is identified by
//! a generation number; every state change and snapshot publish checks the
//! generation under the state lock, so results from a cancelled or
//! superseded session are dropped. The polling task is tied to the session's
//! [`CancellationToken`] and analyzes one frame at a time.

use crate::config::{CaptureConfig, ConfigError, Gating};
use crate::error::CaptureError;
use crate::sink::SubmissionSink;
use chrono::{DateTime, Utc};
use kosface_core::liveness::head_pose;
use kosface_core::{
    AnalysisError, AntiSpoofChecker, CaptureMode, CapturePayload, FaceAnalyzer, FaceBox, Frame,
    FrameAnalysis, Landmarks68, LivenessEngine, LivenessState, SpoofSignal,
};
use kosface_hw::{CameraError, FrameSource};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureStep {
    Ready,
    Loading,
    Capturing,
    Processing,
    Success,
    Failed,
}

/// Face box and landmarks for drawing over the preview.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Overlay {
    pub face_box: FaceBox,
    pub landmarks: Landmarks68,
}

/// Merged session state published after every change.
#[derive(Debug, Clone)]
pub struct CaptureSnapshot {
    pub generation: u64,
    pub session_id: Option<Uuid>,
    pub mode: Option<CaptureMode>,
    pub started_at: Option<DateTime<Utc>>,
    pub step: CaptureStep,
    pub liveness: Option<LivenessState>,
    /// Latest anti-spoof signal; `None` when the check is disabled or has not run.
    pub spoof: Option<SpoofSignal>,
    pub face_detected: bool,
    /// False when the analyzer failed to load for this session.
    pub analysis_available: bool,
    pub overlay: Option<Overlay>,
    pub error: Option<CaptureError>,
    /// Localized text for `error`.
    pub message: Option<String>,
}

/// Most recent analyzed frame.
#[derive(Clone)]
struct Analyzed {
    frame: Arc<Frame>,
    analysis: Option<FrameAnalysis>,
}

struct Session {
    id: Uuid,
    mode: CaptureMode,
    started_at: DateTime<Utc>,
    cancel: CancellationToken,
    liveness: LivenessState,
    spoof: Option<SpoofSignal>,
    latest: Option<Analyzed>,
    consecutive_failures: u32,
    analysis_available: bool,
}

struct State {
    generation: u64,
    step: CaptureStep,
    session: Option<Session>,
    error: Option<CaptureError>,
}

struct Inner {
    config: CaptureConfig,
    source: Arc<dyn FrameSource>,
    analyzer: Arc<dyn FaceAnalyzer>,
    sink: Arc<dyn SubmissionSink>,
    engine: LivenessEngine,
    spoof: AntiSpoofChecker,
    state: Mutex<State>,
    snapshots: watch::Sender<CaptureSnapshot>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Callers hold the state lock.
    fn publish(&self, st: &State) {
        self.snapshots.send_replace(self.snapshot_of(st));
    }

    fn snapshot_of(&self, st: &State) -> CaptureSnapshot {
        let session = st.session.as_ref();
        let analysis = session
            .and_then(|s| s.latest.as_ref())
            .and_then(|l| l.analysis.as_ref());
        CaptureSnapshot {
            generation: st.generation,
            session_id: session.map(|s| s.id),
            mode: session.map(|s| s.mode),
            started_at: session.map(|s| s.started_at),
            step: st.step,
            liveness: session.map(|s| s.liveness.clone()),
            spoof: session.and_then(|s| s.spoof),
            face_detected: analysis.is_some(),
            analysis_available: session.is_some_and(|s| s.analysis_available),
            overlay: analysis.filter(|_| self.config.capture.overlay).map(|a| Overlay {
                face_box: a.face_box,
                landmarks: a.landmarks.clone(),
            }),
            message: st.error.as_ref().map(|e| e.user_message(self.config.capture.locale)),
            error: st.error.clone(),
        }
    }

    /// Drop the current session, release the camera and return to Ready.
    fn end_session(&self, reason: &str) {
        let mut st = self.lock();
        st.generation += 1;
        if let Some(session) = st.session.take() {
            session.cancel.cancel();
            tracing::info!(session = %session.id, reason, "capture session ended");
        }
        st.step = CaptureStep::Ready;
        st.error = None;
        self.source.stop();
        self.publish(&st);
    }

    /// Move session `gen` to Failed and schedule the return to Ready.
    fn fail(self: &Arc<Self>, gen: u64, err: CaptureError) -> bool {
        let mut st = self.lock();
        if st.generation != gen {
            return false;
        }
        if let Some(session) = &st.session {
            session.cancel.cancel();
            tracing::error!(session = %session.id, error = %err, "capture session failed");
        }
        st.step = CaptureStep::Failed;
        st.error = Some(err);
        self.source.stop();
        self.publish(&st);
        drop(st);

        let inner = Arc::clone(self);
        let delay = self.config.capture.failure_reset();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut st = inner.lock();
            if st.generation == gen && st.step == CaptureStep::Failed {
                st.session = None;
                st.step = CaptureStep::Ready;
                st.error = None;
                inner.publish(&st);
                tracing::debug!(generation = gen, "failed session reset to ready");
            }
        });
        true
    }

    /// Fold one tick into session `gen`. Returns false when polling should stop.
    fn fold_tick(
        self: &Arc<Self>,
        gen: u64,
        frame: Arc<Frame>,
        result: Result<Option<FrameAnalysis>, AnalysisError>,
        now: std::time::Instant,
    ) -> bool {
        let spoof = match &result {
            Ok(analysis) if self.spoof.enabled() => Some(self.spoof.check(&frame, analysis.as_ref())),
            _ => None,
        };

        let mut st = self.lock();
        if st.generation != gen || st.step != CaptureStep::Capturing {
            return false;
        }
        let Some(session) = st.session.as_mut() else {
            return false;
        };

        match result {
            Err(e) => {
                session.consecutive_failures += 1;
                let failures = session.consecutive_failures;
                tracing::warn!(session = %session.id, failures, error = %e, "frame analysis failed; skipping tick");
                let max = self.config.capture.max_consecutive_analysis_failures;
                if max > 0 && failures >= max {
                    drop(st);
                    self.fail(gen, CaptureError::AnalysisFailed { failures, last: e.to_string() });
                    return false;
                }
                return true;
            }
            Ok(analysis) => {
                session.consecutive_failures = 0;
                let before = session.liveness.current_step;
                session.liveness = self.engine.update(&session.liveness, analysis.as_ref(), now);
                if session.liveness.current_step != before {
                    tracing::info!(
                        session = %session.id,
                        completed = ?before,
                        next = ?session.liveness.current_step,
                        score = session.liveness.liveness_score,
                        "liveness step completed"
                    );
                }
                if let Some(signal) = spoof {
                    if signal.spoof_detected {
                        tracing::debug!(session = %session.id, deviation = signal.mean_deviation, "low-texture frame");
                    }
                    session.spoof = Some(signal);
                }
                tracing::trace!(session = %session.id, face = analysis.is_some(), seq = frame.sequence, "tick");
                session.latest = Some(Analyzed { frame, analysis });
            }
        }
        self.publish(&st);
        true
    }
}

/// Polling task for session `gen`. Runs until the token is cancelled.
async fn poll_loop(inner: Arc<Inner>, gen: u64, token: CancellationToken) {
    let analysis_available = inner
        .lock()
        .session
        .as_ref()
        .is_some_and(|s| s.analysis_available);

    let mut ticker = tokio::time::interval(inner.config.capture.poll_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_frame: Option<Arc<Frame>> = None;

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let Some(frame) = inner.source.latest_frame() else {
            tracing::trace!(generation = gen, "no frame yet");
            continue;
        };
        if last_frame.as_ref().is_some_and(|prev| Arc::ptr_eq(prev, &frame)) {
            continue;
        }
        last_frame = Some(Arc::clone(&frame));

        let result = if analysis_available {
            tokio::select! {
                _ = token.cancelled() => break,
                result = inner.analyzer.analyze(Arc::clone(&frame)) => result,
            }
        } else {
            Ok(None)
        };

        if !inner.fold_tick(gen, frame, result, Instant::now().into_std()) {
            break;
        }
    }
    tracing::debug!(generation = gen, "poll loop stopped");
}

fn build_payload(
    config: &CaptureConfig,
    mode: CaptureMode,
    image_data: Vec<u8>,
    liveness: &LivenessState,
    spoof: Option<SpoofSignal>,
    analysis: Option<&FrameAnalysis>,
) -> CapturePayload {
    let liveness_enabled = !config.liveness.steps.is_empty();
    CapturePayload {
        mode,
        image_data,
        timestamp: Utc::now(),
        face_detected: analysis.is_some(),
        face_descriptor: analysis
            .and_then(|a| a.descriptor.as_ref())
            .map(|d| d.values.clone()),
        liveness_score: liveness_enabled.then_some(liveness.liveness_score),
        quality_score: analysis.map(|a| (a.detection_score * 100.0).clamp(0.0, 100.0)),
        head_pose: analysis.map(|a| head_pose(&a.landmarks, config.liveness.pose_reference_distance)),
        blink_detected: liveness.blink_detected(),
        anti_spoofing_passed: spoof.map_or(true, |s| !s.spoof_detected),
    }
}

/// Drives capture sessions over a frame source, analyzer and sink.
pub struct CaptureController {
    inner: Arc<Inner>,
}

impl CaptureController {
    pub fn new(
        config: CaptureConfig,
        source: Arc<dyn FrameSource>,
        analyzer: Arc<dyn FaceAnalyzer>,
        sink: Arc<dyn SubmissionSink>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let engine = LivenessEngine::new(config.liveness.clone())?;
        let spoof = AntiSpoofChecker::new(config.anti_spoof.clone());
        let state = State {
            generation: 0,
            step: CaptureStep::Ready,
            session: None,
            error: None,
        };
        let (snapshots, _) = watch::channel(CaptureSnapshot {
            generation: 0,
            session_id: None,
            mode: None,
            started_at: None,
            step: CaptureStep::Ready,
            liveness: None,
            spoof: None,
            face_detected: false,
            analysis_available: false,
            overlay: None,
            error: None,
            message: None,
        });

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                source,
                analyzer,
                sink,
                engine,
                spoof,
                state: Mutex::new(state),
                snapshots,
            }),
        })
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.inner.config
    }

    pub fn subscribe(&self) -> watch::Receiver<CaptureSnapshot> {
        self.inner.snapshots.subscribe()
    }

    pub fn snapshot(&self) -> CaptureSnapshot {
        self.inner.snapshots.borrow().clone()
    }

    pub fn step(&self) -> CaptureStep {
        self.inner.lock().step
    }

    /// Start a session, stopping any previous one first.
    ///
    /// Resolves once the camera delivers frames and polling has begun. A
    /// camera failure leaves the controller in Failed.
    pub async fn start(&self, mode: CaptureMode) -> Result<Uuid, CaptureError> {
        let inner = &self.inner;
        inner.end_session("restarted");

        let id = Uuid::new_v4();
        let token = CancellationToken::new();
        let gen = {
            let mut st = inner.lock();
            st.generation += 1;
            st.step = CaptureStep::Loading;
            st.session = Some(Session {
                id,
                mode,
                started_at: Utc::now(),
                cancel: token.clone(),
                liveness: inner.engine.initial_state(),
                spoof: None,
                latest: None,
                consecutive_failures: 0,
                analysis_available: true,
            });
            inner.publish(&st);
            st.generation
        };
        tracing::info!(session = %id, %mode, "capture session starting");

        let warm_up = tokio::select! {
            _ = token.cancelled() => return Err(CaptureError::Cancelled),
            result = inner.analyzer.warm_up() => result,
        };
        if let Err(e) = warm_up {
            tracing::warn!(session = %id, error = %e, "face analyzer unavailable; capturing without analysis");
            let mut st = inner.lock();
            if st.generation != gen {
                return Err(CaptureError::Cancelled);
            }
            if let Some(session) = st.session.as_mut() {
                session.analysis_available = false;
            }
            inner.publish(&st);
        }

        let timeout = inner.config.capture.camera_timeout();
        let started = tokio::select! {
            _ = token.cancelled() => return Err(CaptureError::Cancelled),
            result = tokio::time::timeout(timeout, inner.source.start()) => result,
        };
        let info = match started {
            Ok(Ok(info)) => info,
            Ok(Err(e)) => {
                let err = CaptureError::Camera(e);
                inner.fail(gen, err.clone());
                return Err(err);
            }
            Err(_) => {
                let err = CaptureError::Camera(CameraError::Timeout(timeout));
                inner.fail(gen, err.clone());
                return Err(err);
            }
        };

        {
            let mut st = inner.lock();
            if st.generation != gen {
                return Err(CaptureError::Cancelled);
            }
            st.step = CaptureStep::Capturing;
            inner.publish(&st);
        }
        tracing::info!(
            session = %id,
            device = %info.device,
            width = info.width,
            height = info.height,
            format = ?info.format,
            "capturing"
        );

        tokio::spawn(poll_loop(Arc::clone(inner), gen, token));
        Ok(id)
    }

    /// Take the still, submit it and release the camera.
    ///
    /// Only honoured while capturing; strict gating also requires a
    /// completed liveness sequence.
    pub async fn capture(&self) -> Result<CapturePayload, CaptureError> {
        let inner = &self.inner;
        let (gen, id, mode, liveness, spoof, latest) = {
            let mut st = inner.lock();
            if st.step != CaptureStep::Capturing {
                return Err(CaptureError::NotCapturing(st.step));
            }
            let Some(session) = st.session.as_ref() else {
                return Err(CaptureError::NotCapturing(st.step));
            };
            let gating = inner.config.capture.gating.for_mode(session.mode);
            if gating == Gating::Strict && !session.liveness.is_complete() {
                tracing::debug!(session = %session.id, step = ?session.liveness.current_step, "capture rejected by strict gating");
                return Err(CaptureError::LivenessIncomplete(session.liveness.current_step));
            }
            // No more ticks once the still is chosen.
            session.cancel.cancel();
            let taken = (
                st.generation,
                session.id,
                session.mode,
                session.liveness.clone(),
                session.spoof,
                session.latest.clone(),
            );
            st.step = CaptureStep::Processing;
            inner.publish(&st);
            taken
        };

        let Some(latest) = latest else {
            inner.fail(gen, CaptureError::NoFrame);
            return Err(CaptureError::NoFrame);
        };

        let quality = inner.config.capture.jpeg_quality;
        let frame = Arc::clone(&latest.frame);
        let encoded = tokio::task::spawn_blocking(move || frame.encode_jpeg(quality))
            .await
            .map_err(|e| e.to_string())
            .and_then(|r| r.map_err(|e| e.to_string()));
        let image_data = match encoded {
            Ok(bytes) => bytes,
            Err(e) => {
                let err = CaptureError::Encode(e);
                inner.fail(gen, err.clone());
                return Err(err);
            }
        };

        let payload = build_payload(&inner.config, mode, image_data, &liveness, spoof, latest.analysis.as_ref());
        {
            let mut st = inner.lock();
            if st.generation != gen {
                return Err(CaptureError::Cancelled);
            }
            st.step = CaptureStep::Success;
            inner.publish(&st);
        }
        tracing::info!(
            session = %id,
            face = payload.face_detected,
            liveness = ?payload.liveness_score,
            spoof_passed = payload.anti_spoofing_passed,
            "capture taken; submitting"
        );

        let submitted = inner.sink.submit(&payload).await;

        let mut st = inner.lock();
        let current = st.generation == gen;
        if current {
            inner.source.stop();
        }
        match submitted {
            Ok(()) => {
                if current {
                    // The payload is out; liveness and frame state go with the session.
                    st.session = None;
                    inner.publish(&st);
                }
                tracing::info!(session = %id, "capture submitted");
                Ok(payload)
            }
            Err(e) => {
                tracing::error!(session = %id, error = %e, "submission failed");
                if current {
                    st.session = None;
                    st.step = CaptureStep::Ready;
                    st.error = Some(CaptureError::Submission(e.clone()));
                    inner.publish(&st);
                }
                Err(CaptureError::Submission(e))
            }
        }
    }

    /// Abandon the session: release the camera and discard liveness progress.
    pub fn cancel(&self) {
        self.inner.end_session("cancelled");
    }
}

impl Drop for CaptureController {
    fn drop(&mut self) {
        self.inner.end_session("controller dropped");
    }
}
