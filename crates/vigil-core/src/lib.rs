//! vigil-core — Face identity stabilization and presence logic.
//!
//! SCRFD detection and ArcFace embedding run via ONNX Runtime; everything
//! downstream of the embedding (matching, slot voting, presence debouncing,
//! recording lifecycle, occupancy aggregation) is plain state machines.

pub mod aggregator;
pub mod alignment;
pub mod analyzer;
pub mod detector;
pub mod gallery;
pub mod presence;
pub mod recognizer;
pub mod recording;
pub mod slots;
pub mod stabilizer;
pub mod types;

pub use aggregator::{Aggregator, OccupancyAggregate, OccupancySink, SinkError};
pub use analyzer::{AnalyzeError, DetectedFace, FaceAnalyzer, FaceObservation};
pub use detector::{DetectorError, FaceDetector, FaceLocalizer};
pub use gallery::{CosineMatcher, Gallery, GalleryEntry, GalleryError, IdentityMatcher};
pub use presence::{PresenceDecision, PresencePolicy, PresenceTracker};
pub use recognizer::{FaceEmbedder, FaceRecognizer, RecognizerError};
pub use recording::{RecordingError, RecordingManager, StartOutcome, VideoWriter, WriterFactory};
pub use slots::{ExactBoxSlots, IouSlots, SlotAssigner, SlotId};
pub use stabilizer::{IdentityStabilizer, StabilizerConfig};
pub use types::{BoundingBox, Embedding, MatchResult, UNDETECTED};
