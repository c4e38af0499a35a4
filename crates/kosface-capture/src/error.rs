//! Capture error taxonomy and user-visible messages.

use crate::config::Locale;
use crate::controller::CaptureStep;
use kosface_core::LivenessStep;
use kosface_hw::CameraError;
use thiserror::Error;

/// Rejection from a submission sink.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubmissionError {
    #[error("submission rejected: {0}")]
    Rejected(String),
    #[error("failed to store payload: {0}")]
    Io(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CaptureError {
    #[error("camera: {0}")]
    Camera(#[from] CameraError),
    #[error("face analysis failed on {failures} consecutive frames: {last}")]
    AnalysisFailed { failures: u32, last: String },
    #[error("capture is only possible while capturing (current step: {0:?})")]
    NotCapturing(CaptureStep),
    #[error("liveness check incomplete (current step: {0:?})")]
    LivenessIncomplete(LivenessStep),
    #[error("no analyzed frame available")]
    NoFrame,
    #[error("failed to encode capture: {0}")]
    Encode(String),
    #[error(transparent)]
    Submission(#[from] SubmissionError),
    #[error("capture session was cancelled")]
    Cancelled,
}

impl CaptureError {
    /// Short actionable message for the person in front of the camera.
    pub fn user_message(&self, locale: Locale) -> String {
        use Locale::{En, Id};
        let text = match (self, locale) {
            (Self::Camera(CameraError::PermissionDenied(_)), En) => {
                "Camera access was denied. Allow camera access and try again."
            }
            (Self::Camera(CameraError::PermissionDenied(_)), Id) => {
                "Akses kamera ditolak. Izinkan akses kamera lalu coba lagi."
            }
            (Self::Camera(CameraError::NotFound(_)), En) => {
                "No camera was found. Connect a camera and try again."
            }
            (Self::Camera(CameraError::NotFound(_)), Id) => {
                "Kamera tidak ditemukan. Hubungkan kamera lalu coba lagi."
            }
            (Self::Camera(CameraError::Unavailable(_)), En) => {
                "The camera is busy or unavailable. Close other apps using it and try again."
            }
            (Self::Camera(CameraError::Unavailable(_)), Id) => {
                "Kamera sedang dipakai atau tidak tersedia. Tutup aplikasi lain yang memakai kamera lalu coba lagi."
            }
            (Self::Camera(CameraError::Timeout(_)), En) => "The camera took too long to start. Try again.",
            (Self::Camera(CameraError::Timeout(_)), Id) => "Kamera terlalu lama menyala. Silakan coba lagi.",
            (Self::AnalysisFailed { .. }, En) => {
                "Face detection keeps failing. Check the lighting and try again."
            }
            (Self::AnalysisFailed { .. }, Id) => {
                "Deteksi wajah terus gagal. Periksa pencahayaan lalu coba lagi."
            }
            (Self::NotCapturing(_), En) => "The camera is not ready to take a photo yet.",
            (Self::NotCapturing(_), Id) => "Kamera belum siap mengambil foto.",
            (Self::LivenessIncomplete(step), _) => {
                let prefix = match locale {
                    En => "Finish the liveness check first",
                    Id => "Selesaikan verifikasi wajah terlebih dahulu",
                };
                return format!("{prefix}: {}.", step_instruction(*step, locale));
            }
            (Self::NoFrame | Self::Encode(_), En) => "Could not take the photo. Try again.",
            (Self::NoFrame | Self::Encode(_), Id) => "Gagal mengambil foto. Silakan coba lagi.",
            (Self::Submission(_), En) => "Could not submit the photo. Try again.",
            (Self::Submission(_), Id) => "Gagal mengirim foto. Silakan coba lagi.",
            (Self::Cancelled, En) => "Capture was cancelled.",
            (Self::Cancelled, Id) => "Pengambilan foto dibatalkan.",
        };
        text.to_string()
    }
}

/// Prompt for the step the subject should perform next.
pub fn step_instruction(step: LivenessStep, locale: Locale) -> &'static str {
    match (step, locale) {
        (LivenessStep::Blink, Locale::En) => "blink twice",
        (LivenessStep::Blink, Locale::Id) => "kedipkan mata dua kali",
        (LivenessStep::TurnLeft, Locale::En) => "turn your head left",
        (LivenessStep::TurnLeft, Locale::Id) => "tolehkan kepala ke kiri",
        (LivenessStep::TurnRight, Locale::En) => "turn your head right",
        (LivenessStep::TurnRight, Locale::Id) => "tolehkan kepala ke kanan",
        (LivenessStep::Smile, Locale::En) => "smile",
        (LivenessStep::Smile, Locale::Id) => "tersenyum",
        (LivenessStep::Complete, Locale::En) => "all done",
        (LivenessStep::Complete, Locale::Id) => "selesai",
    }
}
