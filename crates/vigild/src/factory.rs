//! Assembles runnable pipelines from configuration and shared state.

use crate::config::{Config, SlotStrategy};
use crate::pipeline::{Pipeline, PipelineError, PipelineMode, PipelineOutputs, PipelineSettings};
use std::sync::Arc;
use vigil_core::analyzer::FaceAnalyzer;
use vigil_core::detector::{FaceDetector, FaceLocalizer};
use vigil_core::gallery::{Gallery, IdentityMatcher};
use vigil_core::recognizer::{FaceEmbedder, FaceRecognizer};
use vigil_core::slots::{ExactBoxSlots, IouSlots, SlotAssigner};
use vigil_core::stabilizer::IdentityStabilizer;
use vigil_hw::{FrameSource, SourceError};

/// Loads a fresh localizer/embedder pair for each pipeline.
pub trait FaceModels: Send + Sync {
    fn load(&self) -> Result<(Box<dyn FaceLocalizer>, Box<dyn FaceEmbedder>), PipelineError>;
}

/// SCRFD + ArcFace from the configured model directory.
pub struct OnnxModels {
    pub scrfd_path: String,
    pub arcface_path: String,
    pub score_threshold: f32,
}

impl OnnxModels {
    pub fn from_config(config: &Config) -> Self {
        Self {
            scrfd_path: config.scrfd_model_path(),
            arcface_path: config.arcface_model_path(),
            score_threshold: config.detector_score_threshold,
        }
    }
}

impl FaceModels for OnnxModels {
    fn load(&self) -> Result<(Box<dyn FaceLocalizer>, Box<dyn FaceEmbedder>), PipelineError> {
        let detector = FaceDetector::load(&self.scrfd_path)?.with_score_threshold(self.score_threshold);
        let recognizer = FaceRecognizer::load(&self.arcface_path)?;
        Ok((Box::new(detector), Box::new(recognizer)))
    }
}

pub type SourceOpener = dyn Fn(&str) -> Result<Box<dyn FrameSource>, SourceError> + Send + Sync;

/// Everything needed to start a pipeline; cheap to clone.
#[derive(Clone)]
pub struct PipelineFactory {
    pub config: Arc<Config>,
    pub gallery: Arc<Gallery>,
    pub matcher: Arc<dyn IdentityMatcher>,
    pub models: Arc<dyn FaceModels>,
    pub open_source: Arc<SourceOpener>,
    pub outputs: PipelineOutputs,
}

impl PipelineFactory {
    /// Open `source` and build a pipeline for `mode`. Fails if the source
    /// cannot be opened or the models cannot be loaded.
    pub fn build(&self, mode: PipelineMode, source: &str) -> Result<Pipeline, PipelineError> {
        let settings = match &mode {
            PipelineMode::Scheduled(_) => PipelineSettings::scheduled(&self.config),
            PipelineMode::Preview { .. } => PipelineSettings::preview(&self.config),
        };

        let source = (self.open_source)(self.config.resolve_source(source))?;
        let (localizer, embedder) = self.models.load()?;

        let analyzer = FaceAnalyzer::new(
            localizer,
            embedder,
            self.matcher.clone(),
            self.gallery.clone(),
            self.slot_assigner(),
            IdentityStabilizer::new(settings.stabilizer),
        );

        Ok(Pipeline::new(mode, &settings, source, analyzer, self.outputs.clone()))
    }

    /// [`build`](Self::build) on the blocking pool: opening a device and
    /// loading models block for a noticeable time.
    pub async fn spawn_build(&self, mode: PipelineMode, source: String) -> Result<Pipeline, PipelineError> {
        let factory = self.clone();
        tokio::task::spawn_blocking(move || factory.build(mode, &source)).await?
    }

    fn slot_assigner(&self) -> Box<dyn SlotAssigner> {
        match self.config.slot_strategy {
            SlotStrategy::Iou => Box::new(IouSlots::default()),
            SlotStrategy::Exact => Box::new(ExactBoxSlots::default()),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::pipeline::testing::function;
    use std::sync::Mutex;

    #[test]
    fn test_missing_models_fail_to_load() {
        let models = OnnxModels {
            scrfd_path: "/nonexistent/det.onnx".into(),
            arcface_path: "/nonexistent/rec.onnx".into(),
            score_threshold: 0.5,
        };
        assert!(matches!(models.load(), Err(PipelineError::Detector(_))));
    }

    #[tokio::test]
    async fn test_build_resolves_default_camera() {
        let opened = Arc::new(Mutex::new(Vec::new()));
        let mut config = Config::from_env();
        config.default_camera = "/dev/video7".into();
        let (factory, _rx) = factory(config, opened.clone());

        let (frames, _frames_rx) = tokio::sync::mpsc::channel(1);
        factory
            .build(PipelineMode::Preview { id: "p".into(), frames }, "0")
            .unwrap();
        assert_eq!(opened.lock().unwrap().as_slice(), ["/dev/video7".to_string()]);
    }

    #[tokio::test]
    async fn test_build_propagates_source_failure() {
        let opened = Arc::new(Mutex::new(Vec::new()));
        let (factory, _rx) = factory(Config::from_env(), opened);
        let err = factory
            .spawn_build(PipelineMode::Scheduled(function(true, true)), "missing.mp4".into())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, PipelineError::Source(_)));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_spawn_build_leaves_runtime_thread_free() {
        // Models that take a while to load must not stall other tasks on a
        // single-threaded runtime.
        struct SlowModels;
        impl FaceModels for SlowModels {
            fn load(&self) -> Result<(Box<dyn FaceLocalizer>, Box<dyn FaceEmbedder>), PipelineError> {
                std::thread::sleep(std::time::Duration::from_millis(300));
                FakeModels.load()
            }
        }

        let (mut factory, _rx) = factory(Config::from_env(), Arc::default());
        factory.models = Arc::new(SlowModels);
        let ticks = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = ticks.clone();
        let ticker = tokio::spawn(async move {
            loop {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                counter.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            }
        });

        let (frames, _frames_rx) = tokio::sync::mpsc::channel(1);
        factory
            .spawn_build(PipelineMode::Preview { id: "p".into(), frames }, "cam.mp4".into())
            .await
            .unwrap();
        ticker.abort();
        assert!(ticks.load(std::sync::atomic::Ordering::Relaxed) >= 5);
    }
}
