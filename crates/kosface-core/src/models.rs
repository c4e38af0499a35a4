//! Model bundle manifest and integrity verification.

use sha2::{Digest, Sha256};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelRole {
    Detector,
    Landmarks,
    Recognizer,
}

/// One file in the model bundle.
pub struct ModelFile {
    pub role: ModelRole,
    pub name: &'static str,
    /// Expected SHA-256, when a pinned digest is known.
    pub sha256: Option<&'static str>,
    /// Whether face analysis can run without this file.
    pub required: bool,
}

// Digests from the InsightFace buffalo_l release (Git LFS oid).
pub const MODELS: &[ModelFile] = &[
    ModelFile {
        role: ModelRole::Detector,
        name: "det_10g.onnx",
        sha256: Some("5838f7fe053675b1c7a08b633df49e7af5495cee0493c7dcf6697200b85b5b91"),
        required: true,
    },
    ModelFile {
        role: ModelRole::Landmarks,
        name: "1k3d68.onnx",
        sha256: None,
        required: true,
    },
    ModelFile {
        role: ModelRole::Recognizer,
        name: "w600k_r50.onnx",
        sha256: Some("4c06341c33c2ca1f86781dab0e829f88ad5b64be9fba56e56bc9ebdefc619e43"),
        required: false,
    },
];

pub fn model_file(role: ModelRole) -> &'static ModelFile {
    match role {
        ModelRole::Detector => &MODELS[0],
        ModelRole::Landmarks => &MODELS[1],
        ModelRole::Recognizer => &MODELS[2],
    }
}

/// `$XDG_DATA_HOME/kosface/models`, falling back to `~/.local/share`.
pub fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("kosface")
        .join("models")
}

#[derive(Error, Debug)]
pub enum ModelIntegrityError {
    #[error("model file not found: {name} ({path})")]
    MissingModel { name: &'static str, path: PathBuf },

    #[error("failed to read model file: {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("model checksum mismatch for {name} ({path})\n  expected: {expected}\n  got:      {got}")]
    ChecksumMismatch {
        name: &'static str,
        path: PathBuf,
        expected: String,
        got: String,
    },
}

pub fn sha256_file_hex(path: &Path) -> Result<String, ModelIntegrityError> {
    let read_err = |source| ModelIntegrityError::Read {
        path: path.to_path_buf(),
        source,
    };
    let mut file = fs::File::open(path).map_err(read_err)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).map_err(read_err)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Check presence and, when `verify_checksums` is set, pinned digests.
pub fn verify_model(
    dir: &Path,
    model: &'static ModelFile,
    verify_checksums: bool,
) -> Result<PathBuf, ModelIntegrityError> {
    let path = dir.join(model.name);
    if !path.is_file() {
        return Err(ModelIntegrityError::MissingModel { name: model.name, path });
    }
    if let (true, Some(expected)) = (verify_checksums, model.sha256) {
        let got = sha256_file_hex(&path)?;
        if got != expected {
            return Err(ModelIntegrityError::ChecksumMismatch {
                name: model.name,
                path,
                expected: expected.to_string(),
                got,
            });
        }
    }
    Ok(path)
}

/// Per-file result for diagnostics output.
pub struct ModelStatus {
    pub model: &'static ModelFile,
    pub result: Result<PathBuf, ModelIntegrityError>,
}

pub fn bundle_report(dir: &Path, verify_checksums: bool) -> Vec<ModelStatus> {
    MODELS
        .iter()
        .map(|model| ModelStatus {
            model,
            result: verify_model(dir, model, verify_checksums),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    static PINNED: ModelFile = ModelFile {
        role: ModelRole::Detector,
        name: "model.onnx",
        // sha256("hello")
        sha256: Some("2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"),
        required: true,
    };

    static UNPINNED: ModelFile = ModelFile {
        role: ModelRole::Landmarks,
        name: "model.onnx",
        sha256: None,
        required: true,
    };

    #[test]
    fn test_missing_model() {
        let dir = tempfile::tempdir().unwrap();
        let err = verify_model(dir.path(), &PINNED, true).unwrap_err();
        assert!(matches!(err, ModelIntegrityError::MissingModel { name: "model.onnx", .. }));
    }

    #[test]
    fn test_checksum_match_and_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.onnx");
        fs::write(&path, b"hello").unwrap();
        assert_eq!(verify_model(dir.path(), &PINNED, true).unwrap(), path);

        fs::write(&path, b"tampered").unwrap();
        let err = verify_model(dir.path(), &PINNED, true).unwrap_err();
        assert!(matches!(err, ModelIntegrityError::ChecksumMismatch { .. }));
        // Skipped when verification is off or no digest is pinned.
        assert!(verify_model(dir.path(), &PINNED, false).is_ok());
        assert!(verify_model(dir.path(), &UNPINNED, true).is_ok());
    }

    #[test]
    fn test_model_file_lookup() {
        assert_eq!(model_file(ModelRole::Recognizer).name, "w600k_r50.onnx");
        assert!(!model_file(ModelRole::Recognizer).required);
        assert!(model_file(ModelRole::Detector).required);
    }

    #[test]
    fn test_bundle_report_covers_all_models() {
        let dir = tempfile::tempdir().unwrap();
        let report = bundle_report(dir.path(), false);
        assert_eq!(report.len(), MODELS.len());
        assert!(report.iter().all(|s| s.result.is_err()));
    }
}
