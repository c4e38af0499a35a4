//! Capture configuration: TOML file plus `KOSFACE_*` environment overrides.

use kosface_core::{AnalyzerConfig, AntiSpoofConfig, CaptureMode, LivenessConfig, LivenessConfigError, LivenessStep};
use kosface_hw::CameraConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("liveness: {0}")]
    Liveness(#[from] LivenessConfigError),
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Whether capture requires a completed liveness sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Gating {
    Strict,
    Lenient,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatingConfig {
    pub register: Gating,
    pub login: Gating,
}

impl Default for GatingConfig {
    fn default() -> Self {
        Self {
            register: Gating::Strict,
            login: Gating::Lenient,
        }
    }
}

impl GatingConfig {
    pub fn for_mode(&self, mode: CaptureMode) -> Gating {
        match mode {
            CaptureMode::Register => self.register,
            CaptureMode::Login => self.login,
        }
    }
}

/// Language of user-visible messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Locale {
    #[default]
    En,
    Id,
}

impl FromStr for Locale {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "en" => Ok(Self::En),
            "id" => Ok(Self::Id),
            other => Err(format!("unknown locale {other:?} (expected en or id)")),
        }
    }
}

/// Session timing and capture behaviour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub poll_interval_ms: u64,
    /// Delay before a failed session returns to ready.
    pub failure_reset_ms: u64,
    /// Bound on waiting for the first camera frame.
    pub camera_timeout_ms: u64,
    /// Consecutive analyzer errors that fail the session. 0 never escalates.
    pub max_consecutive_analysis_failures: u32,
    pub gating: GatingConfig,
    /// Publish face box and landmarks in snapshots.
    pub overlay: bool,
    pub jpeg_quality: u8,
    pub locale: Locale,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 200,
            failure_reset_ms: 2000,
            camera_timeout_ms: 10_000,
            max_consecutive_analysis_failures: 25,
            gating: GatingConfig::default(),
            overlay: true,
            jpeg_quality: 85,
            locale: Locale::En,
        }
    }
}

impl SessionConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn failure_reset(&self) -> Duration {
        Duration::from_millis(self.failure_reset_ms)
    }

    pub fn camera_timeout(&self) -> Duration {
        Duration::from_millis(self.camera_timeout_ms)
    }
}

/// Complete configuration for one capture controller.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub analysis: AnalyzerConfig,
    pub liveness: LivenessConfig,
    pub anti_spoof: AntiSpoofConfig,
    pub capture: SessionConfig,
    pub camera: CameraConfig,
}

impl CaptureConfig {
    /// Load from an optional TOML file, apply environment overrides, validate.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(toml::from_str(&text)?)
    }

    /// Override fields from `KOSFACE_*` variables looked up through `var`.
    ///
    /// Unparseable values are logged and ignored.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        let env = Env(&var);

        if let Some(device) = var("KOSFACE_CAMERA_DEVICE") {
            self.camera.device = device;
        }
        env.parse("KOSFACE_CAMERA_WIDTH", &mut self.camera.width);
        env.parse("KOSFACE_CAMERA_HEIGHT", &mut self.camera.height);

        if let Some(dir) = var("KOSFACE_MODEL_DIR") {
            self.analysis.model_dir = PathBuf::from(dir);
        }
        env.flag("KOSFACE_VERIFY_CHECKSUMS", &mut self.analysis.verify_checksums);
        env.parse("KOSFACE_DETECTION_THRESHOLD", &mut self.analysis.detection_threshold);

        env.parse("KOSFACE_EAR_THRESHOLD", &mut self.liveness.ear_threshold);
        env.parse("KOSFACE_BLINK_DEBOUNCE_MS", &mut self.liveness.blink_debounce_ms);
        env.parse("KOSFACE_YAW_THRESHOLD_DEG", &mut self.liveness.yaw_threshold_deg);
        if let Some(steps) = var("KOSFACE_LIVENESS_STEPS") {
            match parse_steps(&steps) {
                Ok(steps) => self.liveness.steps = steps,
                Err(e) => tracing::warn!(key = "KOSFACE_LIVENESS_STEPS", error = %e, "ignoring invalid value"),
            }
        }

        env.flag("KOSFACE_ANTI_SPOOF_ENABLED", &mut self.anti_spoof.enabled);

        env.parse("KOSFACE_POLL_INTERVAL_MS", &mut self.capture.poll_interval_ms);
        env.parse("KOSFACE_FAILURE_RESET_MS", &mut self.capture.failure_reset_ms);
        env.parse("KOSFACE_CAMERA_TIMEOUT_MS", &mut self.capture.camera_timeout_ms);
        env.parse("KOSFACE_LOCALE", &mut self.capture.locale);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.liveness.validate()?;

        let threshold = self.analysis.detection_threshold;
        if !(threshold > 0.0 && threshold < 1.0) {
            return invalid("analysis.detection_threshold", format!("{threshold} not in (0, 1)"));
        }
        if !self.anti_spoof.min_deviation.is_finite() || self.anti_spoof.min_deviation < 0.0 {
            return invalid("anti_spoof.min_deviation", self.anti_spoof.min_deviation.to_string());
        }

        let capture = &self.capture;
        if !(100..=500).contains(&capture.poll_interval_ms) {
            return invalid(
                "capture.poll_interval_ms",
                format!("{} not in 100..=500", capture.poll_interval_ms),
            );
        }
        if capture.camera_timeout_ms == 0 {
            return invalid("capture.camera_timeout_ms", "must be positive".into());
        }
        if !(1..=100).contains(&capture.jpeg_quality) {
            return invalid("capture.jpeg_quality", format!("{} not in 1..=100", capture.jpeg_quality));
        }

        if self.camera.width == 0 || self.camera.height == 0 {
            return invalid("camera.width/height", "must be positive".into());
        }
        if self.camera.buffers == 0 {
            return invalid("camera.buffers", "must be positive".into());
        }
        Ok(())
    }
}

fn invalid(field: &'static str, reason: String) -> Result<(), ConfigError> {
    Err(ConfigError::Invalid { field, reason })
}

/// Comma-separated step list; empty or `none` disables liveness.
pub fn parse_steps(s: &str) -> Result<Vec<LivenessStep>, String> {
    let s = s.trim();
    if s.is_empty() || s.eq_ignore_ascii_case("none") {
        return Ok(Vec::new());
    }
    s.split(',')
        .map(|name| match name.trim().to_ascii_lowercase().as_str() {
            "blink" => Ok(LivenessStep::Blink),
            "turn_left" => Ok(LivenessStep::TurnLeft),
            "turn_right" => Ok(LivenessStep::TurnRight),
            "smile" => Ok(LivenessStep::Smile),
            other => Err(format!("unknown liveness step {other:?}")),
        })
        .collect()
}

struct Env<'a, F: Fn(&str) -> Option<String>>(&'a F);

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    fn parse<T: FromStr>(&self, key: &str, slot: &mut T) {
        let Some(raw) = (self.0)(key) else {
            return;
        };
        match raw.trim().parse() {
            Ok(v) => *slot = v,
            Err(_) => tracing::warn!(key, value = %raw, "ignoring invalid value"),
        }
    }

    fn flag(&self, key: &str, slot: &mut bool) {
        if let Some(raw) = (self.0)(key) {
            *slot = raw != "0";
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kosface_core::SmileHeuristic;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = CaptureConfig::default();
        config.validate().unwrap();
        assert_eq!(config.capture.poll_interval_ms, 200);
        assert_eq!(config.capture.failure_reset_ms, 2000);
        assert_eq!(config.capture.camera_timeout_ms, 10_000);
        assert_eq!(config.capture.gating.for_mode(CaptureMode::Register), Gating::Strict);
        assert_eq!(config.capture.gating.for_mode(CaptureMode::Login), Gating::Lenient);
        assert_eq!(config.liveness.steps.len(), 4);
    }

    #[test]
    fn test_from_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kosface.toml");
        std::fs::write(
            &path,
            r#"
[liveness]
steps = ["blink", "smile"]
smile = { kind = "mouth_aspect", min_ratio = 2.5 }

[capture]
poll_interval_ms = 300
locale = "id"

[capture.gating]
login = "strict"

[camera]
device = "/dev/video2"
"#,
        )
        .unwrap();

        let config = CaptureConfig::from_file(&path).unwrap();
        config.validate().unwrap();
        assert_eq!(config.liveness.steps, vec![LivenessStep::Blink, LivenessStep::Smile]);
        assert_eq!(config.liveness.smile, SmileHeuristic::MouthAspect { min_ratio: 2.5 });
        assert_eq!(config.liveness.ear_threshold, 0.25);
        assert_eq!(config.capture.poll_interval_ms, 300);
        assert_eq!(config.capture.locale, Locale::Id);
        assert_eq!(config.capture.gating.login, Gating::Strict);
        assert_eq!(config.capture.gating.register, Gating::Strict);
        assert_eq!(config.camera.device, "/dev/video2");
        assert_eq!(config.camera.width, 640);
    }

    #[test]
    fn test_missing_file() {
        let err = CaptureConfig::from_file(Path::new("/nonexistent/kosface.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = CaptureConfig::default();
        config.apply_env(vars(&[
            ("KOSFACE_CAMERA_DEVICE", "/dev/video4"),
            ("KOSFACE_EAR_THRESHOLD", "0.2"),
            ("KOSFACE_POLL_INTERVAL_MS", "150"),
            ("KOSFACE_ANTI_SPOOF_ENABLED", "0"),
            ("KOSFACE_LIVENESS_STEPS", "none"),
            ("KOSFACE_LOCALE", "ID"),
            ("KOSFACE_MODEL_DIR", "/opt/models"),
        ]));
        assert_eq!(config.camera.device, "/dev/video4");
        assert_eq!(config.liveness.ear_threshold, 0.2);
        assert_eq!(config.capture.poll_interval_ms, 150);
        assert!(!config.anti_spoof.enabled);
        assert!(config.liveness.steps.is_empty());
        assert_eq!(config.capture.locale, Locale::Id);
        assert_eq!(config.analysis.model_dir, PathBuf::from("/opt/models"));
        config.validate().unwrap();
    }

    #[test]
    fn test_env_invalid_values_are_ignored() {
        let mut config = CaptureConfig::default();
        config.apply_env(vars(&[
            ("KOSFACE_EAR_THRESHOLD", "abc"),
            ("KOSFACE_LIVENESS_STEPS", "blink,wave"),
        ]));
        assert_eq!(config.liveness.ear_threshold, 0.25);
        assert_eq!(config.liveness.steps.len(), 4);
    }

    #[test]
    fn test_validate_rejects_out_of_order_steps() {
        let mut config = CaptureConfig::default();
        config.liveness.steps = vec![LivenessStep::Smile, LivenessStep::Blink];
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Liveness(LivenessConfigError::OutOfOrder(LivenessStep::Blink)))
        ));
    }

    #[test]
    fn test_validate_rejects_bad_timing() {
        let mut config = CaptureConfig::default();
        config.capture.poll_interval_ms = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "capture.poll_interval_ms", .. })
        ));

        let mut config = CaptureConfig::default();
        config.analysis.detection_threshold = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_steps() {
        assert_eq!(
            parse_steps(" blink , turn_right").unwrap(),
            vec![LivenessStep::Blink, LivenessStep::TurnRight]
        );
        assert!(parse_steps("").unwrap().is_empty());
        assert!(parse_steps("jump").is_err());
    }
}
