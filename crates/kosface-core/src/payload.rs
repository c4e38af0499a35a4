//! Capture payload handed to the submission sink.

use crate::types::HeadPose;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureMode {
    Register,
    Login,
}

impl fmt::Display for CaptureMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CaptureMode::Register => "register",
            CaptureMode::Login => "login",
        })
    }
}

/// One successful capture. Built once, never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapturePayload {
    pub mode: CaptureMode,
    /// JPEG bytes; a `data:image/jpeg;base64,` URL on the wire.
    #[serde(with = "jpeg_data_url")]
    pub image_data: Vec<u8>,
    pub timestamp: DateTime<Utc>,
    pub face_detected: bool,
    pub face_descriptor: Option<Vec<f32>>,
    pub liveness_score: Option<f32>,
    pub quality_score: Option<f32>,
    pub head_pose: Option<HeadPose>,
    pub blink_detected: bool,
    pub anti_spoofing_passed: bool,
}

mod jpeg_data_url {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{de, Deserialize, Deserializer, Serializer};

    const PREFIX: &str = "data:image/jpeg;base64,";

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("{PREFIX}{}", STANDARD.encode(bytes)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        // Bare base64 is accepted too.
        let encoded = s.strip_prefix(PREFIX).unwrap_or(&s);
        STANDARD.decode(encoded).map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload() -> CapturePayload {
        CapturePayload {
            mode: CaptureMode::Login,
            image_data: vec![0xff, 0xd8, 0xff, 0xd9],
            timestamp: DateTime::parse_from_rfc3339("2024-05-01T08:30:00Z")
                .unwrap()
                .with_timezone(&Utc),
            face_detected: true,
            face_descriptor: Some(vec![0.25, -0.5]),
            liveness_score: Some(25.0),
            quality_score: Some(90.0),
            head_pose: Some(HeadPose { yaw: 1.0, pitch: 2.0, roll: 0.0 }),
            blink_detected: true,
            anti_spoofing_passed: false,
        }
    }

    #[test]
    fn test_wire_field_names() {
        let json = serde_json::to_value(payload()).unwrap();
        assert_eq!(json["imageData"], "data:image/jpeg;base64,/9j/2Q==");
        assert_eq!(json["faceDetected"], true);
        assert_eq!(json["blinkDetected"], true);
        assert_eq!(json["antiSpoofingPassed"], false);
        assert_eq!(json["mode"], "login");
        assert_eq!(json["headPose"]["pitch"], 2.0);
        assert_eq!(json["timestamp"], "2024-05-01T08:30:00Z");
    }

    #[test]
    fn test_deserialize_accepts_data_url_and_bare_base64() {
        let original = payload();
        let json = serde_json::to_string(&original).unwrap();
        let back: CapturePayload = serde_json::from_str(&json).unwrap();
        assert_eq!(back, original);

        let bare = json.replace("data:image/jpeg;base64,", "");
        let back: CapturePayload = serde_json::from_str(&bare).unwrap();
        assert_eq!(back.image_data, original.image_data);
    }

    #[test]
    fn test_deserialize_rejects_invalid_base64() {
        let json = serde_json::to_string(&payload()).unwrap().replace("/9j/2Q==", "not base64!");
        assert!(serde_json::from_str::<CapturePayload>(&json).is_err());
    }
}
