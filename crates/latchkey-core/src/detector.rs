//! MTCNN face detector via ONNX Runtime.
//!
//! Three cascaded networks: P-Net proposes windows over an image pyramid,
//! R-Net refines them on 24×24 crops, O-Net scores 48×48 crops and predicts
//! the five landmarks. Each stage has its own confidence threshold.
//!
//! Tensor conventions: NCHW float RGB input normalised as
//! `(p - 127.5) * 0.0078125`; outputs in the order
//! P-Net `(regression [1,4,h,w], probability [1,2,h,w])`,
//! R-Net `(regression [1,4], probability [1,2])`,
//! O-Net `(regression [1,4], landmarks [1,10], probability [1,2])`.

use std::path::Path;
use std::str::FromStr;

use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use thiserror::Error;

use crate::types::{DetectedFace, Landmarks};

const PNET_STRIDE: f32 = 2.0;
const PNET_CELL: f32 = 12.0;
const RNET_INPUT: u32 = 24;
const ONET_INPUT: u32 = 48;
const PYRAMID_FACTOR: f32 = 0.709;
const PIXEL_MEAN: f32 = 127.5;
const PIXEL_SCALE: f32 = 0.0078125;
const NMS_PER_SCALE: f32 = 0.5;
const NMS_STAGE: f32 = 0.7;
const NMS_OUTPUT: f32 = 0.7;

/// Default smallest face side, in pixels, the pyramid searches for.
pub const DEFAULT_MIN_FACE_SIZE: u32 = 20;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("invalid stage thresholds: {0}")]
    InvalidThresholds(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Per-stage confidence thresholds (P-Net, R-Net, O-Net).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StageThresholds([f32; 3]);

impl StageThresholds {
    pub fn new(values: [f32; 3]) -> Result<Self, DetectorError> {
        if values.iter().any(|t| !(0.0..=1.0).contains(t)) {
            return Err(DetectorError::InvalidThresholds(format!(
                "{values:?} (each must lie in [0, 1])"
            )));
        }
        Ok(Self(values))
    }

    pub fn stage(&self, index: usize) -> f32 {
        self.0[index]
    }
}

impl Default for StageThresholds {
    fn default() -> Self {
        Self([0.5, 0.8, 0.9])
    }
}

impl FromStr for StageThresholds {
    type Err = DetectorError;

    /// Parse `"0.5,0.8,0.9"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts = s
            .split(',')
            .map(|p| p.trim().parse::<f32>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| DetectorError::InvalidThresholds(format!("{s}: {e}")))?;
        let values: [f32; 3] = parts.try_into().map_err(|_| {
            DetectorError::InvalidThresholds(format!("{s}: expected three values"))
        })?;
        Self::new(values)
    }
}

/// Locates faces and their landmarks in an RGB frame.
pub trait Detector {
    /// Faces in descending score order.
    fn detect(
        &mut self,
        image: &RgbImage,
        thresholds: StageThresholds,
    ) -> Result<Vec<DetectedFace>, DetectorError>;
}

/// A window travelling through the cascade.
#[derive(Debug, Clone, PartialEq)]
struct Candidate {
    bbox: [f32; 4],
    score: f32,
    reg: [f32; 4],
    landmarks: Landmarks,
}

impl Candidate {
    fn new(bbox: [f32; 4], score: f32, reg: [f32; 4]) -> Self {
        Self {
            bbox,
            score,
            reg,
            landmarks: [(0.0, 0.0); 5],
        }
    }

    fn area(&self) -> f32 {
        (self.bbox[2] - self.bbox[0]).max(0.0) * (self.bbox[3] - self.bbox[1]).max(0.0)
    }
}

#[derive(Debug, Clone, Copy)]
enum Overlap {
    Union,
    Min,
}

pub struct MtcnnDetector {
    pnet: Session,
    rnet: Session,
    onet: Session,
    min_face_size: u32,
}

impl MtcnnDetector {
    /// Load the three cascade stages.
    pub fn load(
        pnet_path: &str,
        rnet_path: &str,
        onet_path: &str,
        min_face_size: u32,
    ) -> Result<Self, DetectorError> {
        Ok(Self {
            pnet: load_session(pnet_path)?,
            rnet: load_session(rnet_path)?,
            onet: load_session(onet_path)?,
            min_face_size: min_face_size.max(PNET_CELL as u32),
        })
    }

    fn propose(&mut self, image: &RgbImage, threshold: f32) -> Result<Vec<Candidate>, DetectorError> {
        let (w, h) = (image.width() as f32, image.height() as f32);
        let mut all = Vec::new();

        for scale in pyramid_scales(w, h, self.min_face_size as f32) {
            let ws = (w * scale + 1.0) as u32;
            let hs = (h * scale + 1.0) as u32;
            let resized = imageops::resize(image, ws, hs, FilterType::Triangle);
            let outputs = run(&mut self.pnet, &to_tensor(&resized), 2)?;
            let (reg_shape, reg) = &outputs[0];
            let (_, prob) = &outputs[1];
            if reg_shape.len() != 4 {
                return Err(DetectorError::InferenceFailed(format!(
                    "P-Net regression has shape {reg_shape:?}, expected [1,4,h,w]"
                )));
            }
            let grid = (reg_shape[2] as usize, reg_shape[3] as usize);
            let level = pnet_candidates(reg, prob, grid, scale, threshold);
            all.extend(nms(level, NMS_PER_SCALE, Overlap::Union));
        }

        let mut all = nms(all, NMS_STAGE, Overlap::Union);
        for c in &mut all {
            let (w, h) = (c.bbox[2] - c.bbox[0], c.bbox[3] - c.bbox[1]);
            c.bbox = [
                c.bbox[0] + c.reg[0] * w,
                c.bbox[1] + c.reg[1] * h,
                c.bbox[2] + c.reg[2] * w,
                c.bbox[3] + c.reg[3] * h,
            ];
            c.bbox = rerec(c.bbox);
        }
        Ok(all)
    }

    fn refine(
        &mut self,
        image: &RgbImage,
        candidates: Vec<Candidate>,
        threshold: f32,
    ) -> Result<Vec<Candidate>, DetectorError> {
        let mut kept = Vec::with_capacity(candidates.len());
        for mut c in candidates {
            let Some(patch) = crop_resized(image, &c.bbox, RNET_INPUT) else {
                continue;
            };
            let outputs = run(&mut self.rnet, &to_tensor(&patch), 2)?;
            let score = second(&outputs[1].1)?;
            if score > threshold {
                c.score = score;
                c.reg = first_four(&outputs[0].1)?;
                kept.push(c);
            }
        }

        let mut kept = nms(kept, NMS_STAGE, Overlap::Union);
        for c in &mut kept {
            c.bbox = rerec(bbreg(c.bbox, c.reg));
        }
        Ok(kept)
    }

    fn output(
        &mut self,
        image: &RgbImage,
        candidates: Vec<Candidate>,
        threshold: f32,
    ) -> Result<Vec<Candidate>, DetectorError> {
        let mut kept = Vec::with_capacity(candidates.len());
        for mut c in candidates {
            let Some(patch) = crop_resized(image, &c.bbox, ONET_INPUT) else {
                continue;
            };
            let outputs = run(&mut self.onet, &to_tensor(&patch), 3)?;
            let score = second(&outputs[2].1)?;
            if score <= threshold {
                continue;
            }
            let points = &outputs[1].1;
            if points.len() < 10 {
                return Err(DetectorError::InferenceFailed(format!(
                    "O-Net produced {} landmark values, expected 10",
                    points.len()
                )));
            }
            let bw = c.bbox[2] - c.bbox[0] + 1.0;
            let bh = c.bbox[3] - c.bbox[1] + 1.0;
            for i in 0..5 {
                c.landmarks[i] = (
                    bw * points[i] + c.bbox[0] - 1.0,
                    bh * points[i + 5] + c.bbox[1] - 1.0,
                );
            }
            c.score = score;
            c.reg = first_four(&outputs[0].1)?;
            c.bbox = bbreg(c.bbox, c.reg);
            kept.push(c);
        }
        Ok(nms(kept, NMS_OUTPUT, Overlap::Min))
    }
}

impl Detector for MtcnnDetector {
    fn detect(
        &mut self,
        image: &RgbImage,
        thresholds: StageThresholds,
    ) -> Result<Vec<DetectedFace>, DetectorError> {
        let proposals = self.propose(image, thresholds.stage(0))?;
        tracing::trace!(count = proposals.len(), "P-Net proposals");
        if proposals.is_empty() {
            return Ok(Vec::new());
        }
        let refined = self.refine(image, proposals, thresholds.stage(1))?;
        tracing::trace!(count = refined.len(), "R-Net survivors");
        if refined.is_empty() {
            return Ok(Vec::new());
        }
        let faces = self.output(image, refined, thresholds.stage(2))?;
        tracing::trace!(count = faces.len(), "O-Net faces");

        Ok(faces
            .into_iter()
            .map(|c| DetectedFace {
                bbox: c.bbox,
                landmarks: c.landmarks,
                score: c.score,
            })
            .collect())
    }
}

fn load_session(path: &str) -> Result<Session, DetectorError> {
    if !Path::new(path).exists() {
        return Err(DetectorError::ModelNotFound(path.to_string()));
    }
    let session = Session::builder()?
        .with_intra_threads(2)?
        .commit_from_file(path)?;
    tracing::info!(
        path,
        outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
        "loaded MTCNN stage"
    );
    Ok(session)
}

/// Run a single-input session and copy out the first `expected` outputs.
fn run(
    session: &mut Session,
    input: &Array4<f32>,
    expected: usize,
) -> Result<Vec<(Vec<i64>, Vec<f32>)>, DetectorError> {
    let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
    if outputs.len() < expected {
        return Err(DetectorError::InferenceFailed(format!(
            "model produced {} outputs, expected {expected}",
            outputs.len()
        )));
    }
    let mut tensors = Vec::with_capacity(expected);
    for i in 0..expected {
        let (shape, data) = outputs[i]
            .try_extract_tensor::<f32>()
            .map_err(|e| DetectorError::InferenceFailed(format!("output {i}: {e}")))?;
        tensors.push((shape.to_vec(), data.to_vec()));
    }
    Ok(tensors)
}

fn second(prob: &[f32]) -> Result<f32, DetectorError> {
    prob.get(1).copied().ok_or_else(|| {
        DetectorError::InferenceFailed(format!("probability output has {} values", prob.len()))
    })
}

fn first_four(reg: &[f32]) -> Result<[f32; 4], DetectorError> {
    reg.get(..4)
        .and_then(|r| r.try_into().ok())
        .ok_or_else(|| {
            DetectorError::InferenceFailed(format!("regression output has {} values", reg.len()))
        })
}

/// NCHW float tensor, normalised the way the MTCNN weights expect.
fn to_tensor(image: &RgbImage) -> Array4<f32> {
    let (w, h) = (image.width() as usize, image.height() as usize);
    let mut tensor = Array4::<f32>::zeros((1, 3, h, w));
    for (x, y, pixel) in image.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = (pixel.0[c] as f32 - PIXEL_MEAN) * PIXEL_SCALE;
        }
    }
    tensor
}

/// Pyramid scales such that a `min_face` face maps to the 12 px P-Net cell
/// at the first level, shrinking by 0.709 until the short side is < 12 px.
fn pyramid_scales(width: f32, height: f32, min_face: f32) -> Vec<f32> {
    let mut scale = PNET_CELL / min_face;
    let mut min_side = width.min(height) * scale;
    let mut scales = Vec::new();
    while min_side >= PNET_CELL {
        scales.push(scale);
        scale *= PYRAMID_FACTOR;
        min_side *= PYRAMID_FACTOR;
    }
    scales
}

/// Map the P-Net probability grid back to source-frame windows.
fn pnet_candidates(
    reg: &[f32],
    prob: &[f32],
    (rows, cols): (usize, usize),
    scale: f32,
    threshold: f32,
) -> Vec<Candidate> {
    let plane = rows * cols;
    if reg.len() < 4 * plane || prob.len() < 2 * plane {
        return Vec::new();
    }
    let mut out = Vec::new();
    for y in 0..rows {
        for x in 0..cols {
            let i = y * cols + x;
            let score = prob[plane + i];
            if score < threshold {
                continue;
            }
            let (fx, fy) = (x as f32, y as f32);
            let bbox = [
                ((PNET_STRIDE * fx + 1.0) / scale).floor(),
                ((PNET_STRIDE * fy + 1.0) / scale).floor(),
                ((PNET_STRIDE * fx + PNET_CELL) / scale).floor(),
                ((PNET_STRIDE * fy + PNET_CELL) / scale).floor(),
            ];
            let r = [reg[i], reg[plane + i], reg[2 * plane + i], reg[3 * plane + i]];
            out.push(Candidate::new(bbox, score, r));
        }
    }
    out
}

/// Apply R-Net/O-Net box regression.
fn bbreg(b: [f32; 4], reg: [f32; 4]) -> [f32; 4] {
    let w = b[2] - b[0] + 1.0;
    let h = b[3] - b[1] + 1.0;
    [
        b[0] + reg[0] * w,
        b[1] + reg[1] * h,
        b[2] + reg[2] * w,
        b[3] + reg[3] * h,
    ]
}

/// Square a box about its centre.
fn rerec(b: [f32; 4]) -> [f32; 4] {
    let w = b[2] - b[0];
    let h = b[3] - b[1];
    let l = w.max(h);
    let x1 = b[0] + w * 0.5 - l * 0.5;
    let y1 = b[1] + h * 0.5 - l * 0.5;
    [x1, y1, x1 + l, y1 + l]
}

/// Greedy non-maximum suppression, highest score first.
fn nms(mut candidates: Vec<Candidate>, threshold: f32, overlap: Overlap) -> Vec<Candidate> {
    candidates.sort_by(|a, b| b.score.total_cmp(&a.score));
    let mut kept: Vec<Candidate> = Vec::with_capacity(candidates.len());
    'outer: for c in candidates {
        for k in &kept {
            if overlap_ratio(k, &c, overlap) > threshold {
                continue 'outer;
            }
        }
        kept.push(c);
    }
    kept
}

fn overlap_ratio(a: &Candidate, b: &Candidate, overlap: Overlap) -> f32 {
    let iw = (a.bbox[2].min(b.bbox[2]) - a.bbox[0].max(b.bbox[0])).max(0.0);
    let ih = (a.bbox[3].min(b.bbox[3]) - a.bbox[1].max(b.bbox[1])).max(0.0);
    let inter = iw * ih;
    let denom = match overlap {
        Overlap::Union => a.area() + b.area() - inter,
        Overlap::Min => a.area().min(b.area()),
    };
    if denom <= 0.0 {
        0.0
    } else {
        inter / denom
    }
}

/// Crop the in-frame part of `bbox` and resize it to `size`×`size`.
fn crop_resized(image: &RgbImage, bbox: &[f32; 4], size: u32) -> Option<RgbImage> {
    let (w, h) = (image.width() as i64, image.height() as i64);
    let x1 = (bbox[0] as i64).clamp(0, w);
    let y1 = (bbox[1] as i64).clamp(0, h);
    let x2 = (bbox[2] as i64).clamp(0, w);
    let y2 = (bbox[3] as i64).clamp(0, h);
    if x2 <= x1 || y2 <= y1 {
        return None;
    }
    let crop = imageops::crop_imm(
        image,
        x1 as u32,
        y1 as u32,
        (x2 - x1) as u32,
        (y2 - y1) as u32,
    )
    .to_image();
    Some(imageops::resize(&crop, size, size, FilterType::Triangle))
}
