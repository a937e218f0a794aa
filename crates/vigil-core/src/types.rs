use serde::{Deserialize, Serialize};

/// Label reported for a face that matches no gallery identity.
pub const UNDETECTED: &str = "Undetected";

/// Axis-aligned face box in frame pixel coordinates, with optional landmarks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl BoundingBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self {
            x1,
            y1,
            x2,
            y2,
            confidence: 1.0,
            landmarks: None,
        }
    }

    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.0)
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    /// Box corners truncated to whole pixels.
    pub fn pixel_corners(&self) -> (i32, i32, i32, i32) {
        (self.x1 as i32, self.y1 as i32, self.x2 as i32, self.y2 as i32)
    }

    /// Intersection-over-Union with another box.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let ix1 = self.x1.max(other.x1);
        let iy1 = self.y1.max(other.y1);
        let ix2 = self.x2.min(other.x2);
        let iy2 = self.y2.min(other.y2);

        let inter = (ix2 - ix1).max(0.0) * (iy2 - iy1).max(0.0);
        let union = self.area() + other.area() - inter;

        if union > 0.0 {
            inter / union
        } else {
            0.0
        }
    }
}

/// L2-normalized face embedding vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn dimension(&self) -> usize {
        self.values.len()
    }

    /// Cosine similarity in [-1, 1]. Zero-norm vectors compare as 0.
    ///
    /// Both vectors must have the same dimension; [`CosineMatcher`] checks
    /// this before comparing.
    ///
    /// [`CosineMatcher`]: crate::gallery::CosineMatcher
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 {
            dot / denom
        } else {
            0.0
        }
    }

    /// Cosine distance in [0, 2]: `1 - similarity`.
    pub fn cosine_distance(&self, other: &Embedding) -> f32 {
        1.0 - self.similarity(other)
    }
}

/// Identity resolved for one face in one frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    pub label: String,
    pub image_url: Option<String>,
    pub value: Option<String>,
    /// Cosine distance to the winning reference; `f32::INFINITY` for an empty gallery.
    pub distance: f32,
}

impl MatchResult {
    pub fn undetected(distance: f32) -> Self {
        Self {
            label: UNDETECTED.to_string(),
            image_url: None,
            value: None,
            distance,
        }
    }

    pub fn is_undetected(&self) -> bool {
        self.label == UNDETECTED
    }
}
