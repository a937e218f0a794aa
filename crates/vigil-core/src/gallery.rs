//! Identity gallery and nearest-identity matching.
//!
//! The gallery is loaded once at startup and shared read-only (`Arc<Gallery>`)
//! by every pipeline.

use crate::types::{Embedding, MatchResult};
use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

/// Default cosine-distance cut-off for a positive identification.
pub const DEFAULT_DISTANCE_THRESHOLD: f32 = 0.5;

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("gallery file not found: {0}")]
    NotFound(String),
    #[error("failed to read gallery: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed gallery: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("identity {label:?} has embedding of dimension {got}, expected {expected}")]
    DimensionMismatch {
        label: String,
        expected: usize,
        got: usize,
    },
}

/// One enrolled identity with its reference embeddings.
#[derive(Debug, Clone, Deserialize)]
pub struct GalleryEntry {
    pub label: String,
    #[serde(default)]
    pub embeddings: Vec<Vec<f32>>,
    pub image_url: Option<String>,
    /// Free-form display value shown next to the identity.
    pub value: Option<String>,
}

/// Immutable label → reference-embedding mapping, in file order.
#[derive(Debug, Clone, Default)]
pub struct Gallery {
    entries: Vec<(GalleryEntry, Vec<Embedding>)>,
    /// Shared dimension of every reference; `None` without references.
    dimension: Option<usize>,
}

impl Gallery {
    pub fn new(entries: Vec<GalleryEntry>) -> Result<Self, GalleryError> {
        let mut dim: Option<usize> = None;
        let mut built = Vec::with_capacity(entries.len());

        for entry in entries {
            for values in &entry.embeddings {
                let expected = *dim.get_or_insert(values.len());
                if values.len() != expected {
                    return Err(GalleryError::DimensionMismatch {
                        label: entry.label.clone(),
                        expected,
                        got: values.len(),
                    });
                }
            }
            let refs = entry
                .embeddings
                .iter()
                .map(|v| Embedding::new(v.clone()))
                .collect();
            built.push((entry, refs));
        }

        Ok(Self {
            entries: built,
            dimension: dim,
        })
    }

    /// Load a gallery from a JSON array of entries.
    pub fn load(path: &Path) -> Result<Self, GalleryError> {
        if !path.exists() {
            return Err(GalleryError::NotFound(path.display().to_string()));
        }
        let raw = std::fs::read_to_string(path)?;
        let entries: Vec<GalleryEntry> = serde_json::from_str(&raw)?;
        let gallery = Self::new(entries)?;

        tracing::info!(
            path = %path.display(),
            identities = gallery.len(),
            references = gallery.reference_count(),
            "loaded identity gallery"
        );

        Ok(gallery)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn dimension(&self) -> Option<usize> {
        self.dimension
    }

    pub fn reference_count(&self) -> usize {
        self.entries.iter().map(|(_, refs)| refs.len()).sum()
    }

    /// First entry carrying `label`.
    pub fn find(&self, label: &str) -> Option<&GalleryEntry> {
        self.entries.iter().map(|(e, _)| e).find(|e| e.label == label)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&GalleryEntry, &[Embedding])> {
        self.entries.iter().map(|(e, refs)| (e, refs.as_slice()))
    }
}

/// Strategy for resolving a query embedding to a gallery identity.
pub trait IdentityMatcher: Send + Sync {
    fn resolve(&self, query: &Embedding, gallery: &Gallery) -> MatchResult;
}

/// Minimum-cosine-distance matcher.
///
/// Each identity scores the smallest distance over its references; the
/// globally smallest score wins unless it reaches `threshold`. A query whose
/// dimension differs from the gallery's matches nothing.
pub struct CosineMatcher {
    pub threshold: f32,
}

impl Default for CosineMatcher {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_DISTANCE_THRESHOLD,
        }
    }
}

impl IdentityMatcher for CosineMatcher {
    fn resolve(&self, query: &Embedding, gallery: &Gallery) -> MatchResult {
        if let Some(expected) = gallery.dimension().filter(|d| *d != query.dimension()) {
            tracing::warn!(expected, got = query.dimension(), "embedding dimension does not match gallery");
            return MatchResult::undetected(f32::INFINITY);
        }

        let mut best: Option<(&GalleryEntry, f32)> = None;

        for (entry, refs) in gallery.entries() {
            let Some(min_dist) = refs
                .iter()
                .map(|r| query.cosine_distance(r))
                .min_by(|a, b| a.total_cmp(b))
            else {
                continue;
            };

            // Strict `<` keeps the earlier entry on ties.
            if best.map_or(true, |(_, d)| min_dist < d) {
                best = Some((entry, min_dist));
            }
        }

        match best {
            Some((entry, dist)) if dist < self.threshold => MatchResult {
                label: entry.label.clone(),
                image_url: entry.image_url.clone(),
                value: entry.value.clone(),
                distance: dist,
            },
            Some((_, dist)) => MatchResult::undetected(dist),
            None => MatchResult::undetected(f32::INFINITY),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::UNDETECTED;
    use std::io::Write;

    fn entry(label: &str, embeddings: Vec<Vec<f32>>) -> GalleryEntry {
        GalleryEntry {
            label: label.into(),
            embeddings,
            image_url: Some(format!("/img/{label}.jpg")),
            value: None,
        }
    }

    fn sample_gallery() -> Gallery {
        Gallery::new(vec![
            entry("alice", vec![vec![1.0, 0.0, 0.0], vec![0.9, 0.1, 0.0]]),
            entry("bob", vec![vec![0.0, 1.0, 0.0]]),
            entry("carol", vec![]),
        ])
        .unwrap()
    }

    #[test]
    fn test_identical_embedding_resolves_with_zero_distance() {
        let gallery = sample_gallery();
        let query = Embedding::new(vec![0.0, 1.0, 0.0]);
        let result = CosineMatcher::default().resolve(&query, &gallery);
        assert_eq!(result.label, "bob");
        assert_eq!(result.image_url.as_deref(), Some("/img/bob.jpg"));
        assert!(result.distance.abs() < 1e-6);
    }

    #[test]
    fn test_minimum_over_references() {
        let gallery = sample_gallery();
        // Closer to alice's second reference than her first.
        let query = Embedding::new(vec![0.9, 0.1, 0.0]);
        let result = CosineMatcher::default().resolve(&query, &gallery);
        assert_eq!(result.label, "alice");
        assert!(result.distance.abs() < 1e-6);
    }

    #[test]
    fn test_dissimilar_embedding_is_undetected() {
        let gallery = sample_gallery();
        let query = Embedding::new(vec![0.0, 0.0, 1.0]);
        let result = CosineMatcher::default().resolve(&query, &gallery);
        assert_eq!(result.label, UNDETECTED);
        assert!(result.image_url.is_none());
        assert!(result.distance >= DEFAULT_DISTANCE_THRESHOLD);
    }

    #[test]
    fn test_distance_equal_to_threshold_is_undetected() {
        let gallery = Gallery::new(vec![entry("alice", vec![vec![1.0, 0.0]])]).unwrap();
        let query = Embedding::new(vec![0.0, 1.0]);
        let matcher = CosineMatcher { threshold: 1.0 };
        assert!(matcher.resolve(&query, &gallery).is_undetected());
    }

    #[test]
    fn test_empty_gallery_is_undetected() {
        let query = Embedding::new(vec![1.0, 0.0]);
        let result = CosineMatcher::default().resolve(&query, &Gallery::default());
        assert!(result.is_undetected());
        assert!(result.distance.is_infinite());
    }

    #[test]
    fn test_gallery_without_references_is_undetected() {
        let gallery = Gallery::new(vec![entry("carol", vec![])]).unwrap();
        let query = Embedding::new(vec![1.0, 0.0]);
        assert!(CosineMatcher::default().resolve(&query, &gallery).is_undetected());
    }

    #[test]
    fn test_tie_prefers_first_entry() {
        let gallery = Gallery::new(vec![
            entry("first", vec![vec![1.0, 0.0]]),
            entry("second", vec![vec![1.0, 0.0]]),
        ])
        .unwrap();
        let query = Embedding::new(vec![1.0, 0.0]);
        assert_eq!(CosineMatcher::default().resolve(&query, &gallery).label, "first");
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let err = Gallery::new(vec![
            entry("a", vec![vec![1.0, 0.0]]),
            entry("b", vec![vec![1.0, 0.0, 0.0]]),
        ])
        .unwrap_err();
        assert!(matches!(err, GalleryError::DimensionMismatch { .. }));
    }

    #[test]
    fn test_query_of_other_dimension_matches_nothing() {
        let gallery = Gallery::new(vec![entry("alice", vec![vec![1.0, 0.0]])]).unwrap();
        assert_eq!(gallery.dimension(), Some(2));
        // Truncated to two components this would be identical to alice.
        let query = Embedding::new(vec![1.0, 0.0, 0.7]);
        let m = CosineMatcher::default().resolve(&query, &gallery);
        assert_eq!(m.label, UNDETECTED);
        assert!(m.distance.is_infinite());
    }

    #[test]
    fn test_load_from_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[{{"label":"alice","embeddings":[[1.0,0.0]],"image_url":"/a.jpg","value":"12.50"}},
               {{"label":"bob","embeddings":[]}}]"#
        )
        .unwrap();

        let gallery = Gallery::load(file.path()).unwrap();
        assert_eq!(gallery.len(), 2);
        assert_eq!(gallery.reference_count(), 1);

        let result = CosineMatcher::default().resolve(&Embedding::new(vec![1.0, 0.0]), &gallery);
        assert_eq!(result.value.as_deref(), Some("12.50"));
    }

    #[test]
    fn test_load_missing_file() {
        let err = Gallery::load(Path::new("/nonexistent/gallery.json")).unwrap_err();
        assert!(matches!(err, GalleryError::NotFound(_)));
    }
}
