//! FaceNet identity encoder via ONNX Runtime.
//!
//! Maps an aligned 160×160 crop to a 128-dimensional L2-normalised vector
//! (InceptionResNetV1 weights).

use std::path::Path;
use std::str::FromStr;

use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use thiserror::Error;

use crate::types::{Encoding, EncodingError, NormalizedCrop, CROP_SIZE, ENCODING_DIM};

#[derive(Error, Debug)]
pub enum EncoderError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("crop is {0}x{1}, expected 160x160")]
    BadCrop(u32, u32),
    #[error("invalid encoding: {0}")]
    Encoding(#[from] EncodingError),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Produces an identity encoding from a normalized crop.
pub trait Encoder {
    fn encode(&mut self, crop: &NormalizedCrop) -> Result<Encoding, EncoderError>;
}

/// Input tensor layout of the exported encoder graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TensorLayout {
    /// `[1, 160, 160, 3]`, as exported from Keras.
    #[default]
    Nhwc,
    /// `[1, 3, 160, 160]`, as exported from PyTorch.
    Nchw,
}

impl FromStr for TensorLayout {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "nhwc" => Ok(Self::Nhwc),
            "nchw" => Ok(Self::Nchw),
            other => Err(format!("unknown tensor layout '{other}' (expected nhwc or nchw)")),
        }
    }
}

pub struct FacenetEncoder {
    session: Session,
    layout: TensorLayout,
}

impl FacenetEncoder {
    /// Load the FaceNet ONNX model from the given path.
    pub fn load(model_path: &str, layout: TensorLayout) -> Result<Self, EncoderError> {
        if !Path::new(model_path).exists() {
            return Err(EncoderError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            layout = ?layout,
            inputs = ?session.inputs().iter().map(|i| i.name()).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded FaceNet model"
        );

        Ok(Self { session, layout })
    }

    /// Prewhitened float tensor in the configured layout.
    fn preprocess(crop: &NormalizedCrop, layout: TensorLayout) -> Array4<f32> {
        let size = CROP_SIZE as usize;
        let raw = crop.image.as_raw();
        let n = raw.len() as f64;
        let mean = raw.iter().map(|&p| p as f64).sum::<f64>() / n;
        let var = raw
            .iter()
            .map(|&p| (p as f64 - mean) * (p as f64 - mean))
            .sum::<f64>()
            / n;
        // Floor the deviation so a flat crop does not divide by zero.
        let std = var.sqrt().max(1.0 / n.sqrt()) as f32;
        let mean = mean as f32;

        let mut tensor = match layout {
            TensorLayout::Nhwc => Array4::<f32>::zeros((1, size, size, 3)),
            TensorLayout::Nchw => Array4::<f32>::zeros((1, 3, size, size)),
        };
        for (x, y, pixel) in crop.image.enumerate_pixels() {
            let (x, y) = (x as usize, y as usize);
            for c in 0..3 {
                let v = (pixel.0[c] as f32 - mean) / std;
                match layout {
                    TensorLayout::Nhwc => tensor[[0, y, x, c]] = v,
                    TensorLayout::Nchw => tensor[[0, c, y, x]] = v,
                }
            }
        }
        tensor
    }
}

impl Encoder for FacenetEncoder {
    fn encode(&mut self, crop: &NormalizedCrop) -> Result<Encoding, EncoderError> {
        let (w, h) = crop.image.dimensions();
        if (w, h) != (CROP_SIZE, CROP_SIZE) {
            return Err(EncoderError::BadCrop(w, h));
        }

        let input = Self::preprocess(crop, self.layout);
        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw_data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EncoderError::InferenceFailed(format!("encoding extraction: {e}")))?;

        if raw_data.len() != ENCODING_DIM {
            return Err(EncoderError::InferenceFailed(format!(
                "expected {ENCODING_DIM}-dim encoding, got {}",
                raw_data.len()
            )));
        }

        Ok(Encoding::new(l2_normalize(raw_data))?)
    }
}

fn l2_normalize(raw: &[f32]) -> Vec<f32> {
    let norm = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        raw.iter().map(|x| x / norm).collect()
    } else {
        raw.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn crop_with(f: impl Fn(u32, u32) -> Rgb<u8>) -> NormalizedCrop {
        NormalizedCrop {
            image: RgbImage::from_fn(CROP_SIZE, CROP_SIZE, f),
            landmarks: [(0.0, 0.0); 5],
        }
    }

    #[test]
    fn test_preprocess_shapes() {
        let crop = crop_with(|_, _| Rgb([10, 20, 30]));
        let size = CROP_SIZE as usize;
        assert_eq!(
            FacenetEncoder::preprocess(&crop, TensorLayout::Nhwc).shape(),
            &[1, size, size, 3]
        );
        assert_eq!(
            FacenetEncoder::preprocess(&crop, TensorLayout::Nchw).shape(),
            &[1, 3, size, size]
        );
    }

    #[test]
    fn test_preprocess_prewhitens() {
        let crop = crop_with(|x, y| Rgb([((x + y) % 256) as u8, (x % 256) as u8, 200]));
        let t = FacenetEncoder::preprocess(&crop, TensorLayout::Nhwc);
        let n = t.len() as f64;
        let mean = t.iter().map(|&v| v as f64).sum::<f64>() / n;
        let var = t.iter().map(|&v| (v as f64 - mean).powi(2)).sum::<f64>() / n;
        assert!(mean.abs() < 1e-3, "mean {mean}");
        assert!((var - 1.0).abs() < 1e-2, "var {var}");
    }

    #[test]
    fn test_preprocess_flat_crop_is_finite() {
        let crop = crop_with(|_, _| Rgb([77, 77, 77]));
        let t = FacenetEncoder::preprocess(&crop, TensorLayout::Nchw);
        assert!(t.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_layouts_hold_same_values() {
        let crop = crop_with(|x, y| Rgb([x as u8, y as u8, 5]));
        let a = FacenetEncoder::preprocess(&crop, TensorLayout::Nhwc);
        let b = FacenetEncoder::preprocess(&crop, TensorLayout::Nchw);
        assert_eq!(a[[0, 7, 3, 1]], b[[0, 1, 7, 3]]);
    }

    #[test]
    fn test_l2_normalize() {
        let v = l2_normalize(&[3.0, 4.0]);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
        assert_eq!(l2_normalize(&[0.0, 0.0]), vec![0.0, 0.0]);
    }

    #[test]
    fn test_layout_parse() {
        assert_eq!("NHWC".parse::<TensorLayout>().unwrap(), TensorLayout::Nhwc);
        assert_eq!("nchw".parse::<TensorLayout>().unwrap(), TensorLayout::Nchw);
        assert!("chw".parse::<TensorLayout>().is_err());
    }
}
