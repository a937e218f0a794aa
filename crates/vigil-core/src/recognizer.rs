//! Face embedding seam and its ArcFace implementation.

use crate::alignment::{self, ALIGNED_SIZE};
use crate::types::{BoundingBox, Embedding};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5;
pub const ARCFACE_EMBEDDING_DIM: usize = 512;

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("face box {0:?} is empty")]
    EmptyFace(BoundingBox),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Turns one detected face into an embedding.
pub trait FaceEmbedder: Send {
    fn embed(
        &mut self,
        frame: &[u8],
        width: u32,
        height: u32,
        face: &BoundingBox,
    ) -> Result<Embedding, RecognizerError>;
}

/// ArcFace-based embedder.
pub struct FaceRecognizer {
    session: Session,
}

impl FaceRecognizer {
    /// Load the ArcFace ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, RecognizerError> {
        if !Path::new(model_path).exists() {
            return Err(RecognizerError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(path = model_path, "loaded ArcFace model");
        Ok(Self { session })
    }

    /// 112×112 luma crop → NCHW tensor with the gray value in all three channels.
    fn preprocess(aligned: &[u8]) -> Array4<f32> {
        Array4::from_shape_fn((1, 3, ALIGNED_SIZE, ALIGNED_SIZE), |(_, _, y, x)| {
            let p = aligned.get(y * ALIGNED_SIZE + x).copied().unwrap_or(0) as f32;
            (p - ARCFACE_MEAN) / ARCFACE_STD
        })
    }
}

/// Scale a raw embedding to unit length; zero vectors are returned unchanged.
pub fn l2_normalize(raw: Vec<f32>) -> Vec<f32> {
    let norm = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        raw.into_iter().map(|x| x / norm).collect()
    } else {
        raw
    }
}

impl FaceEmbedder for FaceRecognizer {
    fn embed(
        &mut self,
        frame: &[u8],
        width: u32,
        height: u32,
        face: &BoundingBox,
    ) -> Result<Embedding, RecognizerError> {
        if face.area() <= 0.0 {
            return Err(RecognizerError::EmptyFace(face.clone()));
        }

        let aligned = alignment::align_face(frame, width, height, face);
        let input = Self::preprocess(&aligned);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(format!("embedding: {e}")))?;

        if raw.len() != ARCFACE_EMBEDDING_DIM {
            return Err(RecognizerError::InferenceFailed(format!(
                "expected {ARCFACE_EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }

        Ok(Embedding::new(l2_normalize(raw.to_vec())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_preprocess_shape_and_scale() {
        let aligned = vec![255u8; ALIGNED_SIZE * ALIGNED_SIZE];
        let t = FaceRecognizer::preprocess(&aligned);
        assert_eq!(t.shape(), &[1, 3, ALIGNED_SIZE, ALIGNED_SIZE]);
        assert_relative_eq!(t[[0, 2, 5, 7]], 1.0);
    }

    #[test]
    fn test_preprocess_channels_match() {
        let aligned: Vec<u8> = (0..ALIGNED_SIZE * ALIGNED_SIZE).map(|i| (i % 251) as u8).collect();
        let t = FaceRecognizer::preprocess(&aligned);
        assert_eq!(t[[0, 0, 40, 9]], t[[0, 1, 40, 9]]);
        assert_eq!(t[[0, 1, 40, 9]], t[[0, 2, 40, 9]]);
    }

    #[test]
    fn test_l2_normalize() {
        let v = l2_normalize(vec![3.0, 4.0]);
        assert_relative_eq!(v[0], 0.6);
        assert_relative_eq!(v[1], 0.8);
        assert_eq!(l2_normalize(vec![0.0, 0.0]), vec![0.0, 0.0]);
    }
}
