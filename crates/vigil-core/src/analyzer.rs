//! Per-frame face chain: localize → embed → match → stabilize.

use crate::detector::{DetectorError, FaceLocalizer};
use crate::gallery::{Gallery, IdentityMatcher};
use crate::recognizer::{FaceEmbedder, RecognizerError};
use crate::slots::{SlotAssigner, SlotId};
use crate::stabilizer::IdentityStabilizer;
use crate::types::{BoundingBox, MatchResult, UNDETECTED};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

/// Image URL shown for a face with no stable identity.
pub const NO_IMAGE_URL: &str = "N/A";
/// Display value shown when an identity carries none.
pub const NO_VALUE: &str = "0.00";

#[derive(Error, Debug)]
pub enum AnalyzeError {
    #[error("localization failed: {0}")]
    Localize(#[from] DetectorError),
    #[error("embedding failed: {0}")]
    Embed(#[from] RecognizerError),
}

/// Displayed result for one face, as published to preview clients.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectedFace {
    pub name: String,
    pub image_url: String,
    pub value: String,
}

/// Everything known about one face in one frame.
#[derive(Debug, Clone)]
pub struct FaceObservation {
    pub bbox: BoundingBox,
    pub slot: SlotId,
    /// Raw per-frame match before stabilization.
    pub matched: MatchResult,
    pub display: DetectedFace,
}

/// Owns the per-feed face state. One instance per pipeline.
pub struct FaceAnalyzer {
    localizer: Box<dyn FaceLocalizer>,
    embedder: Box<dyn FaceEmbedder>,
    matcher: Arc<dyn IdentityMatcher>,
    gallery: Arc<Gallery>,
    slots: Box<dyn SlotAssigner>,
    stabilizer: IdentityStabilizer,
}

impl FaceAnalyzer {
    pub fn new(
        localizer: Box<dyn FaceLocalizer>,
        embedder: Box<dyn FaceEmbedder>,
        matcher: Arc<dyn IdentityMatcher>,
        gallery: Arc<Gallery>,
        slots: Box<dyn SlotAssigner>,
        stabilizer: IdentityStabilizer,
    ) -> Self {
        Self {
            localizer,
            embedder,
            matcher,
            gallery,
            slots,
            stabilizer,
        }
    }

    pub fn stabilizer(&self) -> &IdentityStabilizer {
        &self.stabilizer
    }

    /// Run the whole chain on one luma frame.
    ///
    /// Every detected face is counted and reported, recognized or not.
    pub fn analyze(
        &mut self,
        frame: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Vec<FaceObservation>, AnalyzeError> {
        let boxes = self.localizer.locate(frame, width, height)?;

        let mut matches = Vec::with_capacity(boxes.len());
        for bbox in &boxes {
            let embedding = self.embedder.embed(frame, width, height, bbox)?;
            matches.push(self.matcher.resolve(&embedding, &self.gallery));
        }

        let ids = self.slots.assign(&boxes);
        let retired = self.slots.drain_retired();
        if !retired.is_empty() {
            self.stabilizer.forget(&retired);
        }

        let observations = boxes
            .into_iter()
            .zip(ids)
            .zip(matches)
            .map(|((bbox, slot), matched)| {
                let label = self.stabilizer.observe(slot, &matched.label);
                let display = self.display_for(label);
                FaceObservation {
                    bbox,
                    slot,
                    matched,
                    display,
                }
            })
            .collect();

        Ok(observations)
    }

    fn display_for(&self, label: String) -> DetectedFace {
        let entry = (label != UNDETECTED)
            .then(|| self.gallery.find(&label))
            .flatten();
        match entry {
            Some(e) => DetectedFace {
                image_url: e.image_url.clone().unwrap_or_else(|| NO_IMAGE_URL.to_string()),
                value: e.value.clone().unwrap_or_else(|| NO_VALUE.to_string()),
                name: label,
            },
            None => DetectedFace {
                name: label,
                image_url: NO_IMAGE_URL.to_string(),
                value: NO_VALUE.to_string(),
            },
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::gallery::{CosineMatcher, GalleryEntry};
    use crate::slots::IouSlots;
    use crate::stabilizer::StabilizerConfig;

    fn gallery() -> Arc<Gallery> {
        Arc::new(
            Gallery::new(vec![GalleryEntry {
                label: "alice".into(),
                embeddings: vec![vec![1.0, 0.0]],
                image_url: Some("/img/alice.jpg".into()),
                value: Some("12.50".into()),
            }])
            .unwrap(),
        )
    }

    fn analyzer(frames: Vec<Vec<BoundingBox>>, threshold: usize) -> FaceAnalyzer {
        FaceAnalyzer::new(
            Box::new(ScriptedLocalizer::new(frames)),
            Box::new(PositionEmbedder),
            Arc::new(CosineMatcher::default()),
            gallery(),
            Box::new(IouSlots::default()),
            IdentityStabilizer::new(StabilizerConfig {
                vote_window: 3,
                switch_threshold: threshold,
            }),
        )
    }

    #[test]
    fn test_known_face_shown_from_first_frame_with_gallery_display() {
        let face = BoundingBox::new(10.0, 10.0, 60.0, 60.0);
        let mut a = analyzer(vec![vec![face.clone()], vec![face]], 35);

        let alice = DetectedFace {
            name: "alice".into(),
            image_url: "/img/alice.jpg".into(),
            value: "12.50".into(),
        };
        let first = a.analyze(&[], 0, 0).unwrap();
        assert_eq!(first[0].matched.label, "alice");
        assert_eq!(first[0].display, alice);

        let second = a.analyze(&[], 0, 0).unwrap();
        assert_eq!(second[0].display, alice);
    }

    #[test]
    fn test_unknown_face_counted_but_undetected() {
        let stranger = BoundingBox::new(200.0, 10.0, 260.0, 60.0);
        let mut a = analyzer(vec![vec![stranger]], 1);
        let out = a.analyze(&[], 0, 0).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].display.name, UNDETECTED);
        assert_eq!(out[0].display.value, NO_VALUE);
    }

    #[test]
    fn test_no_faces() {
        let mut a = analyzer(vec![], 1);
        assert!(a.analyze(&[], 0, 0).unwrap().is_empty());
        assert!(a.stabilizer().is_empty());
    }

    #[test]
    fn test_display_serializes_for_preview() {
        let face = DetectedFace {
            name: UNDETECTED.into(),
            image_url: NO_IMAGE_URL.into(),
            value: NO_VALUE.into(),
        };
        let json = serde_json::to_value(&face).unwrap();
        assert_eq!(json["name"], "Undetected");
        assert_eq!(json["image_url"], "N/A");
        assert_eq!(json["value"], "0.00");
    }
}
