//! latchkey-core: face pipeline for the latchkey gate controller.
//!
//! Turns raw detector output into aligned 160×160 crops, encodes them into
//! 128-dimensional identity vectors with FaceNet, and matches them against an
//! enrolled gallery by Euclidean distance. Detection (MTCNN) and encoding
//! both run via ONNX Runtime on the CPU.

pub mod alignment;
pub mod detector;
pub mod encoder;
pub mod gallery;
pub mod geometry;
pub mod matcher;
pub mod types;

use std::path::PathBuf;

pub use detector::{Detector, MtcnnDetector, StageThresholds};
pub use encoder::{Encoder, FacenetEncoder, TensorLayout};
pub use gallery::{Gallery, GalleryError};
pub use geometry::normalize;
pub use matcher::{EuclideanMatcher, Matcher, DEFAULT_TOLERANCE};
pub use types::{
    BoundingBox, DetectedFace, Encoding, GalleryEntry, Landmarks, MatchResult, NormalizedCrop,
    CROP_SIZE, ENCODING_DIM, UNKNOWN_NAME,
};

/// Default model directory.
///
/// Root gets the system-wide `/var/lib/latchkey/models`; everyone else gets
/// `$XDG_DATA_HOME/latchkey/models` (~/.local/share/latchkey/models).
pub fn default_model_dir() -> PathBuf {
    // SAFETY: geteuid is always safe to call.
    if unsafe { libc::geteuid() } == 0 {
        return PathBuf::from("/var/lib/latchkey/models");
    }
    let data_home = std::env::var("XDG_DATA_HOME").unwrap_or_else(|_| {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
        format!("{home}/.local/share")
    });
    PathBuf::from(data_home).join("latchkey/models")
}
