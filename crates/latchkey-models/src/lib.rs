use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Required model file: expected filename and what it is for.
pub struct ModelFile {
    pub name: &'static str,
    pub role: &'static str,
}

pub const PNET: &str = "pnet.onnx";
pub const RNET: &str = "rnet.onnx";
pub const ONET: &str = "onet.onnx";
pub const FACENET: &str = "facenet.onnx";

/// Optional checksum list in the model directory, `sha256sum` format.
pub const CHECKSUM_FILE: &str = "SHA256SUMS";

pub const MODELS: &[ModelFile] = &[
    ModelFile {
        name: PNET,
        role: "MTCNN proposal network",
    },
    ModelFile {
        name: RNET,
        role: "MTCNN refinement network",
    },
    ModelFile {
        name: ONET,
        role: "MTCNN output network (landmarks)",
    },
    ModelFile {
        name: FACENET,
        role: "FaceNet 128-d identity encoder",
    },
];

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

    #[error("malformed line {line} in {path}")]
    MalformedChecksums { path: PathBuf, line: usize },

    #[error(
        "model checksum mismatch for {name} ({path})\n  expected: {expected}\n  got:      {got}"
    )]
    ChecksumMismatch {
        name: String,
        path: PathBuf,
        expected: String,
        got: String,
    },
}

/// Compute SHA-256 hex digest of a file.
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

pub fn verify_file_sha256(
    name: &str,
    path: &Path,
    expected_sha256: &str,
) -> Result<(), ModelIntegrityError> {
    let digest = sha256_file_hex(path)?;
    if !digest.eq_ignore_ascii_case(expected_sha256) {
        return Err(ModelIntegrityError::ChecksumMismatch {
            name: name.to_string(),
            path: path.to_path_buf(),
            expected: expected_sha256.to_string(),
            got: digest,
        });
    }

    Ok(())
}

/// Parse `<hex digest>  <file name>` lines. Blank lines and `#` comments are
/// skipped; a leading `*` (binary mode marker) on the name is dropped.
pub fn parse_checksums(path: &Path) -> Result<HashMap<String, String>, ModelIntegrityError> {
    let contents = fs::read_to_string(path).map_err(|source| ModelIntegrityError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    let mut sums = HashMap::new();
    for (i, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut parts = line.split_whitespace();
        let (Some(digest), Some(name), None) = (parts.next(), parts.next(), parts.next()) else {
            return Err(ModelIntegrityError::MalformedChecksums {
                path: path.to_path_buf(),
                line: i + 1,
            });
        };
        if digest.len() != 64 || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(ModelIntegrityError::MalformedChecksums {
                path: path.to_path_buf(),
                line: i + 1,
            });
        }
        sums.insert(name.trim_start_matches('*').to_string(), digest.to_string());
    }
    Ok(sums)
}

/// Check every required model is present; when the directory carries a
/// checksum list, every listed required model must also match it.
pub fn verify_models_dir(model_dir: &Path) -> Result<(), ModelIntegrityError> {
    for model in MODELS {
        let path = model_dir.join(model.name);
        if !path.is_file() {
            return Err(ModelIntegrityError::MissingModel {
                name: model.name,
                path,
            });
        }
    }

    let sums_path = model_dir.join(CHECKSUM_FILE);
    if !sums_path.is_file() {
        tracing::debug!(dir = %model_dir.display(), "no checksum list, presence check only");
        return Ok(());
    }

    let sums = parse_checksums(&sums_path)?;
    for model in MODELS {
        if let Some(expected) = sums.get(model.name) {
            verify_file_sha256(model.name, &model_dir.join(model.name), expected)?;
            tracing::debug!(model = model.name, "checksum ok");
        } else {
            tracing::warn!(model = model.name, "model not listed in checksum file");
        }
    }

    Ok(())
}
