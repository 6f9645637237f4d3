//! Enrolled identities, built once at startup from a directory of reference
//! images (one file per identity, file stem = name).

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use image::RgbImage;
use thiserror::Error;

use crate::detector::{Detector, DetectorError, StageThresholds};
use crate::encoder::{Encoder, EncoderError};
use crate::geometry;
use crate::types::{BoundingBox, Encoding, GalleryEntry};

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp", "webp"];

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("cannot read enrollment directory {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("enrollment directory {0} contains no reference images")]
    Empty(PathBuf),
    #[error("cannot decode reference image {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("no face detected in reference image {0}")]
    NoFace(PathBuf),
    #[error("face in reference image {0} lies outside the frame")]
    FaceOutOfFrame(PathBuf),
    #[error("identity '{0}' is enrolled more than once")]
    Duplicate(String),
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("encoder error: {0}")]
    Encoder(#[from] EncoderError),
}

/// Immutable name → encoding mapping. Iteration order is enrollment order,
/// which is also the matcher's tie-break order.
#[derive(Debug, Clone, Default)]
pub struct Gallery {
    entries: Vec<GalleryEntry>,
}

impl Gallery {
    /// Build a gallery from pre-computed entries. Names must be unique.
    pub fn from_entries(entries: Vec<GalleryEntry>) -> Result<Self, GalleryError> {
        let mut seen = HashSet::with_capacity(entries.len());
        for entry in &entries {
            if !seen.insert(entry.name.as_str()) {
                return Err(GalleryError::Duplicate(entry.name.clone()));
            }
        }
        Ok(Self { entries })
    }

    /// Enroll every reference image in `dir`, in filename order.
    ///
    /// Any unreadable image, image without a face, or duplicate name is a
    /// configuration error; so is a directory with no images at all.
    pub fn enroll_from_dir(
        dir: &Path,
        detector: &mut impl Detector,
        encoder: &mut impl Encoder,
        thresholds: StageThresholds,
    ) -> Result<Self, GalleryError> {
        let io_err = |source| GalleryError::Io {
            path: dir.to_path_buf(),
            source,
        };

        let mut paths = Vec::new();
        for entry in std::fs::read_dir(dir).map_err(io_err)? {
            let path = entry.map_err(io_err)?.path();
            if !path.is_file() {
                continue;
            }
            if is_image(&path) {
                paths.push(path);
            } else {
                tracing::warn!(path = %path.display(), "skipping non-image file in gallery");
            }
        }
        paths.sort();

        let mut entries = Vec::with_capacity(paths.len());
        for path in paths {
            let Some(name) = path.file_stem().map(|s| s.to_string_lossy().into_owned()) else {
                continue;
            };
            let image = image::open(&path)
                .map_err(|source| GalleryError::Image {
                    path: path.clone(),
                    source,
                })?
                .to_rgb8();
            let encoding = enroll_image(&image, &path, detector, encoder, thresholds)?;
            tracing::info!(name = %name, path = %path.display(), "enrolled identity");
            entries.push(GalleryEntry { name, encoding });
        }

        if entries.is_empty() {
            return Err(GalleryError::Empty(dir.to_path_buf()));
        }

        let gallery = Self::from_entries(entries)?;
        tracing::info!(identities = gallery.len(), "gallery ready");
        Ok(gallery)
    }

    pub fn entries(&self) -> &[GalleryEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.name.as_str())
    }
}

/// Encode the first detected face of a reference image.
fn enroll_image(
    image: &RgbImage,
    path: &Path,
    detector: &mut impl Detector,
    encoder: &mut impl Encoder,
    thresholds: StageThresholds,
) -> Result<Encoding, GalleryError> {
    let faces = detector.detect(image, thresholds)?;
    let face = faces
        .first()
        .ok_or_else(|| GalleryError::NoFace(path.to_path_buf()))?;
    if faces.len() > 1 {
        tracing::warn!(
            path = %path.display(),
            faces = faces.len(),
            "several faces in reference image, using the first"
        );
    }

    let crop = geometry::normalize(&BoundingBox::from(face), image)
        .ok_or_else(|| GalleryError::FaceOutOfFrame(path.to_path_buf()))?;
    Ok(encoder.encode(&crop)?)
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DetectedFace, NormalizedCrop, ENCODING_DIM};
    use image::Rgb;
    use std::fs;

    /// Reports one centred face unless the top-left pixel is pure black.
    struct FakeDetector;

    impl Detector for FakeDetector {
        fn detect(
            &mut self,
            image: &RgbImage,
            _thresholds: StageThresholds,
        ) -> Result<Vec<DetectedFace>, DetectorError> {
            if image.get_pixel(0, 0).0 == [0, 0, 0] {
                return Ok(Vec::new());
            }
            let (w, h) = (image.width() as f32, image.height() as f32);
            Ok(vec![DetectedFace {
                bbox: [w * 0.25, h * 0.25, w * 0.75, h * 0.75],
                landmarks: [
                    (w * 0.4, h * 0.4),
                    (w * 0.6, h * 0.4),
                    (w * 0.5, h * 0.5),
                    (w * 0.42, h * 0.6),
                    (w * 0.58, h * 0.6),
                ],
                score: 0.99,
            }])
        }
    }

    /// Encodes the crop's centre red value into the first component.
    struct FakeEncoder;

    impl Encoder for FakeEncoder {
        fn encode(&mut self, crop: &NormalizedCrop) -> Result<Encoding, EncoderError> {
            let mut values = vec![0.0; ENCODING_DIM];
            values[0] = crop.image.get_pixel(80, 80).0[0] as f32 / 255.0;
            Ok(Encoding::new(values)?)
        }
    }

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "latchkey-gallery-test-{tag}-{}",
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn write_face(dir: &Path, file: &str, red: u8) {
        RgbImage::from_pixel(64, 64, Rgb([red, 100, 100]))
            .save(dir.join(file))
            .unwrap();
    }

    fn enroll(dir: &Path) -> Result<Gallery, GalleryError> {
        Gallery::enroll_from_dir(
            dir,
            &mut FakeDetector,
            &mut FakeEncoder,
            StageThresholds::default(),
        )
    }

    #[test]
    fn test_enroll_names_from_file_stems_in_order() {
        let dir = temp_dir("order");
        write_face(&dir, "carol.png", 200);
        write_face(&dir, "alice.png", 50);
        write_face(&dir, "bob.jpg", 120);
        fs::write(dir.join("README.txt"), b"not a face").unwrap();

        let g = enroll(&dir).unwrap();
        assert_eq!(g.names().collect::<Vec<_>>(), ["alice", "bob", "carol"]);
        assert!((g.entries()[0].encoding.values()[0] - 50.0 / 255.0).abs() < 0.01);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_enroll_rejects_image_without_face() {
        let dir = temp_dir("noface");
        write_face(&dir, "alice.png", 50);
        RgbImage::new(64, 64).save(dir.join("ghost.png")).unwrap();

        let err = enroll(&dir).unwrap_err();
        assert!(matches!(err, GalleryError::NoFace(ref p) if p.ends_with("ghost.png")));

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_enroll_rejects_empty_dir() {
        let dir = temp_dir("empty");
        let err = enroll(&dir).unwrap_err();
        assert!(matches!(err, GalleryError::Empty(_)));
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_enroll_rejects_missing_dir() {
        let dir = temp_dir("missing").join("nope");
        assert!(matches!(enroll(&dir).unwrap_err(), GalleryError::Io { .. }));
    }

    #[test]
    fn test_enroll_rejects_duplicate_stem() {
        let dir = temp_dir("dup");
        write_face(&dir, "alice.png", 50);
        write_face(&dir, "alice.jpg", 60);
        let err = enroll(&dir).unwrap_err();
        assert!(matches!(err, GalleryError::Duplicate(ref n) if n == "alice"));
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_enroll_rejects_corrupt_image() {
        let dir = temp_dir("corrupt");
        fs::write(dir.join("mallory.png"), b"\x89PNG garbage").unwrap();
        assert!(matches!(enroll(&dir).unwrap_err(), GalleryError::Image { .. }));
        let _ = fs::remove_dir_all(&dir);
    }
}
