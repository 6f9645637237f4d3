//! `latchkey check-models` and model loading shared by the other commands.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use latchkey_core::{FacenetEncoder, MtcnnDetector};
use latchkey_models::{CHECKSUM_FILE, MODELS};

use crate::ModelArgs;

/// Run the integrity check and report per model.
pub fn check(dir: PathBuf) -> Result<()> {
    println!("Model directory: {}", dir.display());
    for model in MODELS {
        let status = if dir.join(model.name).is_file() {
            "present"
        } else {
            "MISSING"
        };
        println!("  {:<14} {:<8} {}", model.name, status, model.role);
    }
    if dir.join(CHECKSUM_FILE).is_file() {
        println!("  verifying against {CHECKSUM_FILE}");
    } else {
        println!("  no {CHECKSUM_FILE}, presence check only");
    }

    latchkey_models::verify_models_dir(&dir)
        .with_context(|| format!("model check failed in {}", dir.display()))?;
    println!("All models ok.");
    Ok(())
}

/// Verify, then load the detector and encoder.
pub fn load(args: &ModelArgs) -> Result<(MtcnnDetector, FacenetEncoder)> {
    let dir = args.dir();
    latchkey_models::verify_models_dir(&dir)
        .with_context(|| format!("model check failed in {}", dir.display()))?;

    let path = |name: &str| -> String { model_path(&dir, name) };
    let detector = MtcnnDetector::load(
        &path(latchkey_models::PNET),
        &path(latchkey_models::RNET),
        &path(latchkey_models::ONET),
        args.min_face_size,
    )
    .context("loading MTCNN detector")?;
    let encoder = FacenetEncoder::load(&path(latchkey_models::FACENET), args.layout)
        .context("loading FaceNet encoder")?;
    Ok((detector, encoder))
}

fn model_path(dir: &Path, name: &str) -> String {
    dir.join(name).to_string_lossy().into_owned()
}
