use image::RgbImage;
use serde::Serialize;
use thiserror::Error;

/// Side length of the aligned crop fed to the encoder.
pub const CROP_SIZE: u32 = 160;
/// Dimensionality of a FaceNet identity encoding.
pub const ENCODING_DIM: usize = 128;
/// Name reported for a rejected or gallery-less match.
pub const UNKNOWN_NAME: &str = "Unknown";

/// Five facial landmarks in MTCNN order:
/// left eye, right eye, nose, left mouth corner, right mouth corner.
pub type Landmarks = [(f32, f32); 5];

/// A face as reported by the detector, in source-frame pixel coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedFace {
    /// `[x1, y1, x2, y2]`.
    pub bbox: [f32; 4],
    pub landmarks: Landmarks,
    pub score: f32,
}

/// Integer face region used through normalization and annotation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
    pub landmarks: Landmarks,
}

impl BoundingBox {
    pub fn width(&self) -> i32 {
        self.right - self.left
    }

    pub fn height(&self) -> i32 {
        self.bottom - self.top
    }

    pub fn is_empty(&self) -> bool {
        self.width() <= 0 || self.height() <= 0
    }
}

impl From<&DetectedFace> for BoundingBox {
    /// Truncates toward zero, the same way the detector's float boxes are
    /// turned into pixel indices everywhere else.
    fn from(face: &DetectedFace) -> Self {
        Self {
            left: face.bbox[0] as i32,
            top: face.bbox[1] as i32,
            right: face.bbox[2] as i32,
            bottom: face.bbox[3] as i32,
            landmarks: face.landmarks,
        }
    }
}

/// Aligned 160×160 face crop plus its landmarks in crop-local coordinates.
#[derive(Debug, Clone)]
pub struct NormalizedCrop {
    pub image: RgbImage,
    pub landmarks: Landmarks,
}

#[derive(Error, Debug, PartialEq)]
pub enum EncodingError {
    #[error("invalid encoding dimension: {0} (expected 128)")]
    InvalidDim(usize),
    #[error("invalid encoding value (NaN/Inf)")]
    InvalidValue,
}

/// Immutable identity vector.
#[derive(Debug, Clone, PartialEq)]
pub struct Encoding {
    values: Box<[f32]>,
}

impl Encoding {
    /// Validate and wrap a raw encoder output.
    pub fn new(values: Vec<f32>) -> Result<Self, EncodingError> {
        if values.len() != ENCODING_DIM {
            return Err(EncodingError::InvalidDim(values.len()));
        }
        if values.iter().any(|v| !v.is_finite()) {
            return Err(EncodingError::InvalidValue);
        }
        Ok(Self {
            values: values.into_boxed_slice(),
        })
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn norm(&self) -> f32 {
        self.values.iter().map(|v| v * v).sum::<f32>().sqrt()
    }

    /// Euclidean distance to another encoding.
    pub fn distance(&self, other: &Encoding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b) * (a - b))
            .sum::<f32>()
            .sqrt()
    }
}

/// One enrolled identity.
#[derive(Debug, Clone)]
pub struct GalleryEntry {
    pub name: String,
    pub encoding: Encoding,
}

/// Outcome of matching one face against the gallery.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    /// Candidate name if accepted, otherwise [`UNKNOWN_NAME`].
    pub name: String,
    /// Distance to the nearest gallery entry; `+inf` for an empty gallery.
    pub distance: f32,
    pub accepted: bool,
}

impl MatchResult {
    pub fn unknown(distance: f32) -> Self {
        Self {
            name: UNKNOWN_NAME.to_string(),
            distance,
            accepted: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoding_rejects_wrong_dim() {
        let err = Encoding::new(vec![0.0; 64]).unwrap_err();
        assert_eq!(err, EncodingError::InvalidDim(64));
    }

    #[test]
    fn test_encoding_rejects_nan() {
        let mut values = vec![0.1; ENCODING_DIM];
        values[17] = f32::NAN;
        assert_eq!(Encoding::new(values).unwrap_err(), EncodingError::InvalidValue);
    }

    #[test]
    fn test_distance_known_geometry() {
        let mut a = vec![0.0; ENCODING_DIM];
        let mut b = vec![0.0; ENCODING_DIM];
        a[0] = 3.0;
        b[1] = 4.0;
        let a = Encoding::new(a).unwrap();
        let b = Encoding::new(b).unwrap();
        assert!((a.distance(&b) - 5.0).abs() < 1e-6);
        assert_eq!(a.distance(&a), 0.0);
    }

    #[test]
    fn test_bounding_box_truncates() {
        let face = DetectedFace {
            bbox: [10.9, 20.2, 50.7, 80.99],
            landmarks: [(0.0, 0.0); 5],
            score: 0.99,
        };
        let b = BoundingBox::from(&face);
        assert_eq!((b.left, b.top, b.right, b.bottom), (10, 20, 50, 80));
        assert_eq!(b.width(), 40);
        assert_eq!(b.height(), 60);
        assert!(!b.is_empty());
    }
}
