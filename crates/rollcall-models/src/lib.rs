//! Model manifest: which artifacts the pipeline needs, where to fetch them,
//! and how to verify the ones with published digests.

use sha2::{Digest, Sha256};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Model file descriptor.
pub struct ModelFile {
    pub name: &'static str,
    pub url: &'static str,
    /// SHA-256 hex digest, when upstream publishes a stable one.
    pub sha256: Option<&'static str>,
    pub size_display: &'static str,
    /// Whether the pipeline can start without this file (the embedding model
    /// is optional — its absence binds the histogram fallback strategy).
    pub required: bool,
}

/// All model artifacts, in provisioning order.
///
/// The ArcFace checksum is taken from the HuggingFace Git LFS pointer file
/// (`oid sha256:` field); the SeetaFace repository publishes no digest.
pub const MODELS: &[ModelFile] = &[
    ModelFile {
        name: "seeta_fd_frontal_v1.0.bin",
        url: "https://github.com/atomashpolskiy/rustface/raw/master/model/seeta_fd_frontal_v1.0.bin",
        sha256: None,
        size_display: "1.4 MB",
        required: true,
    },
    ModelFile {
        name: "w600k_r50.onnx",
        url: "https://huggingface.co/public-data/insightface/resolve/main/models/buffalo_l/w600k_r50.onnx",
        sha256: Some("4c06341c33c2ca1f86781dab0e829f88ad5b64be9fba56e56bc9ebdefc619e43"),
        size_display: "166 MB",
        required: false,
    },
];

/// The cascade detection model descriptor.
pub fn cascade_model() -> &'static ModelFile {
    &MODELS[0]
}

/// The embedding model descriptor.
pub fn embedding_model() -> &'static ModelFile {
    &MODELS[1]
}

/// Default model directory: `/var/lib/rollcall/models` system-wide, or
/// `$XDG_DATA_HOME/rollcall/models` for a user install.
pub fn default_model_dir() -> PathBuf {
    if Path::new("/var/lib/rollcall").is_dir() {
        return PathBuf::from("/var/lib/rollcall/models");
    }
    let data_home = std::env::var("XDG_DATA_HOME").unwrap_or_else(|_| {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
        format!("{home}/.local/share")
    });
    PathBuf::from(data_home).join("rollcall/models")
}

#[derive(Error, Debug)]
pub enum ModelIntegrityError {
    #[error("model file not found: {name} ({path})")]
    MissingModel { name: &'static str, path: PathBuf },

    #[error("failed to open model file: {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read model file: {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(
        "model checksum mismatch for {name} ({path})\n  expected: {expected}\n  got:      {got}"
    )]
    ChecksumMismatch {
        name: &'static str,
        path: PathBuf,
        expected: String,
        got: String,
    },
}

/// Compute the SHA-256 hex digest of a file.
pub fn sha256_file_hex(path: &Path) -> Result<String, ModelIntegrityError> {
    let mut file = fs::File::open(path).map_err(|source| ModelIntegrityError::Open {
        path: path.to_path_buf(),
        source,
    })?;

    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file
            .read(&mut buf)
            .map_err(|source| ModelIntegrityError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Verify one model file in `dir`: it must exist, and when a digest is
/// published it must match.
pub fn verify_model(model: &'static ModelFile, dir: &Path) -> Result<(), ModelIntegrityError> {
    let path = dir.join(model.name);
    if !path.exists() {
        return Err(ModelIntegrityError::MissingModel {
            name: model.name,
            path,
        });
    }

    if let Some(expected) = model.sha256 {
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

    Ok(())
}

/// Models missing from `dir`, in provisioning order.
pub fn missing_models(dir: &Path) -> Vec<&'static ModelFile> {
    MODELS
        .iter()
        .filter(|m| !dir.join(m.name).exists())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manifest_shape() {
        assert_eq!(MODELS.len(), 2);
        assert!(cascade_model().required);
        assert!(!embedding_model().required);
        assert!(embedding_model().sha256.is_some());
    }

    #[test]
    fn test_missing_models_on_empty_dir() {
        let dir = std::env::temp_dir().join("rollcall-models-test-empty");
        fs::create_dir_all(&dir).unwrap();
        let missing = missing_models(&dir);
        assert_eq!(missing.len(), 2);
    }

    #[test]
    fn test_sha256_of_known_content() {
        let dir = std::env::temp_dir().join("rollcall-models-test-digest");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("sample.bin");
        fs::write(&path, b"abc").unwrap();
        // SHA-256("abc")
        assert_eq!(
            sha256_file_hex(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_verify_model_missing() {
        let dir = std::env::temp_dir().join("rollcall-models-test-missing");
        fs::create_dir_all(&dir).unwrap();
        assert!(matches!(
            verify_model(cascade_model(), &dir),
            Err(ModelIntegrityError::MissingModel { .. })
        ));
    }
}
