//! Replay a directory of still images as a frame stream.

use std::path::{Path, PathBuf};

use image::RgbImage;

use crate::camera::CameraError;
use crate::FrameSource;

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp", "webp"];

/// Yields every image in a directory once, in filename order.
pub struct ImageDirSource {
    paths: std::vec::IntoIter<PathBuf>,
}

impl ImageDirSource {
    pub fn open(dir: &Path) -> Result<Self, CameraError> {
        let mut paths = Vec::new();
        for entry in std::fs::read_dir(dir).map_err(|source| CameraError::Open {
            path: dir.display().to_string(),
            source,
        })? {
            let path = entry?.path();
            let is_image = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
                .unwrap_or(false);
            if path.is_file() && is_image {
                paths.push(path);
            }
        }
        paths.sort();
        tracing::info!(dir = %dir.display(), frames = paths.len(), "replaying image directory");
        Ok(Self {
            paths: paths.into_iter(),
        })
    }

    pub fn remaining(&self) -> usize {
        self.paths.len()
    }
}

impl FrameSource for ImageDirSource {
    fn next_frame(&mut self) -> Result<Option<RgbImage>, CameraError> {
        match self.paths.next() {
            Some(path) => {
                tracing::trace!(path = %path.display(), "replay frame");
                Ok(Some(image::open(&path)?.to_rgb8()))
            }
            None => Ok(None),
        }
    }
}
