//! Face localization seam and its SCRFD implementation.
//!
//! SCRFD runs through ONNX Runtime with three-stride anchor decoding and
//! greedy NMS. Frames are 8-bit luma; the single channel is replicated to
//! the RGB input the model expects.

use crate::types::BoundingBox;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const SCRFD_INPUT_SIZE: usize = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;
const DEFAULT_SCORE_THRESHOLD: f32 = 0.5;
const DEFAULT_NMS_THRESHOLD: f32 = 0.4;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("frame buffer holds {got} bytes, expected {expected}")]
    BadFrame { expected: usize, got: usize },
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Returns the faces present in one luma frame.
pub trait FaceLocalizer: Send {
    fn locate(&mut self, frame: &[u8], width: u32, height: u32)
        -> Result<Vec<BoundingBox>, DetectorError>;
}

/// Scale and padding applied when fitting a frame into the square model input.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

impl Letterbox {
    fn fit(width: usize, height: usize, target: usize) -> Self {
        let scale = (target as f32 / width as f32).min(target as f32 / height as f32);
        let new_w = (width as f32 * scale).round();
        let new_h = (height as f32 * scale).round();
        Self {
            scale,
            pad_x: ((target as f32 - new_w) / 2.0).floor(),
            pad_y: ((target as f32 - new_h) / 2.0).floor(),
        }
    }

    /// Model-space point back to frame pixels.
    fn unmap(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// Output tensor positions for one stride.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StrideOutputs {
    score: usize,
    bbox: usize,
    kps: usize,
}

/// SCRFD-based face localizer.
pub struct FaceDetector {
    session: Session,
    outputs: [StrideOutputs; 3],
    score_threshold: f32,
    nms_threshold: f32,
}

impl FaceDetector {
    /// Load the SCRFD ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        if names.len() < 9 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD needs 9 outputs (score/bbox/kps per stride), model has {}",
                names.len()
            )));
        }
        let outputs = map_outputs(&names);

        tracing::info!(path = model_path, outputs = ?names, ?outputs, "loaded SCRFD model");

        Ok(Self {
            session,
            outputs,
            score_threshold: DEFAULT_SCORE_THRESHOLD,
            nms_threshold: DEFAULT_NMS_THRESHOLD,
        })
    }

    pub fn with_score_threshold(mut self, threshold: f32) -> Self {
        self.score_threshold = threshold;
        self
    }

    fn preprocess(frame: &[u8], width: usize, height: usize) -> (Array4<f32>, Letterbox) {
        let lb = Letterbox::fit(width, height, SCRFD_INPUT_SIZE);
        let mut tensor = Array4::<f32>::zeros((1, 3, SCRFD_INPUT_SIZE, SCRFD_INPUT_SIZE));

        for y in 0..SCRFD_INPUT_SIZE {
            for x in 0..SCRFD_INPUT_SIZE {
                let (sx, sy) = lb.unmap(x as f32 + 0.5, y as f32 + 0.5);
                // Padding area keeps the mean so it normalizes to zero.
                let pixel = if sx >= 0.0 && sy >= 0.0 && (sx as usize) < width && (sy as usize) < height {
                    frame[sy as usize * width + sx as usize] as f32
                } else {
                    SCRFD_MEAN
                };
                let v = (pixel - SCRFD_MEAN) / SCRFD_STD;
                tensor[[0, 0, y, x]] = v;
                tensor[[0, 1, y, x]] = v;
                tensor[[0, 2, y, x]] = v;
            }
        }

        (tensor, lb)
    }
}

impl FaceLocalizer for FaceDetector {
    fn locate(
        &mut self,
        frame: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Vec<BoundingBox>, DetectorError> {
        let expected = width as usize * height as usize;
        if expected == 0 || frame.len() < expected {
            return Err(DetectorError::BadFrame { expected, got: frame.len() });
        }

        let (input, lb) = Self::preprocess(frame, width as usize, height as usize);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (slot, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let idx = self.outputs[slot];
            let extract = |i: usize, what: &str| {
                outputs[i]
                    .try_extract_tensor::<f32>()
                    .map(|(_, data)| data)
                    .map_err(|e| DetectorError::InferenceFailed(format!("{what} stride {stride}: {e}")))
            };
            let scores = extract(idx.score, "scores")?;
            let boxes = extract(idx.bbox, "boxes")?;
            let kps = extract(idx.kps, "landmarks")?;

            candidates.extend(decode_stride(scores, boxes, kps, stride, &lb, self.score_threshold));
        }

        Ok(nms(candidates, self.nms_threshold))
    }
}

/// Resolve output tensor positions by name (`score_8`, `bbox_16`, ...),
/// falling back to the conventional positional export order.
fn map_outputs(names: &[String]) -> [StrideOutputs; 3] {
    let find = |kind: &str, stride: usize| {
        let want = format!("{kind}_{stride}");
        names.iter().position(|n| *n == want)
    };

    let named: Option<Vec<StrideOutputs>> = SCRFD_STRIDES
        .iter()
        .map(|&s| {
            Some(StrideOutputs {
                score: find("score", s)?,
                bbox: find("bbox", s)?,
                kps: find("kps", s)?,
            })
        })
        .collect();

    match named {
        Some(v) => [v[0], v[1], v[2]],
        None => std::array::from_fn(|i| StrideOutputs {
            score: i,
            bbox: i + 3,
            kps: i + 6,
        }),
    }
}

fn decode_stride(
    scores: &[f32],
    boxes: &[f32],
    kps: &[f32],
    stride: usize,
    lb: &Letterbox,
    threshold: f32,
) -> Vec<BoundingBox> {
    let grid = SCRFD_INPUT_SIZE / stride;
    let anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;
    let s = stride as f32;
    let mut out = Vec::new();

    for idx in 0..anchors {
        let score = scores.get(idx).copied().unwrap_or(0.0);
        if score <= threshold {
            continue;
        }
        let Some(d) = boxes.get(idx * 4..idx * 4 + 4) else {
            continue;
        };

        let cell = idx / SCRFD_ANCHORS_PER_CELL;
        let ax = (cell % grid) as f32 * s;
        let ay = (cell / grid) as f32 * s;

        let (x1, y1) = lb.unmap(ax - d[0] * s, ay - d[1] * s);
        let (x2, y2) = lb.unmap(ax + d[2] * s, ay + d[3] * s);

        let landmarks = kps.get(idx * 10..idx * 10 + 10).map(|k| {
            std::array::from_fn(|i| lb.unmap(ax + k[i * 2] * s, ay + k[i * 2 + 1] * s))
        });

        out.push(BoundingBox {
            x1,
            y1,
            x2,
            y2,
            confidence: score,
            landmarks,
        });
    }

    out
}

/// Greedy non-maximum suppression; output is sorted by confidence.
fn nms(mut candidates: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut keep: Vec<BoundingBox> = Vec::new();
    for cand in candidates {
        if keep.iter().all(|k| k.iou(&cand) <= iou_threshold) {
            keep.push(cand);
        }
    }
    keep
}
