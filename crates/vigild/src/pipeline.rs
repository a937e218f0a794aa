//! Per-feed control loop.
//!
//! One `Pipeline` owns a frame source and all per-feed state. `run` reads,
//! samples, analyses and paces until end of stream, a source failure or
//! cancellation, and always closes the recording before returning.
//!
//! Frame reads, inference and video encoding block, so they run on tokio's
//! blocking pool. The async side only waits on them, which keeps the loop
//! cancellable while a read is stuck.

use crate::config::{Config, FunctionConfig};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use vigil_core::aggregator::{Aggregator, OccupancySink};
use vigil_core::analyzer::{DetectedFace, FaceAnalyzer, FaceObservation};
use vigil_core::detector::DetectorError;
use vigil_core::presence::{PresenceDecision, PresencePolicy, PresenceTracker};
use vigil_core::recognizer::RecognizerError;
use vigil_core::recording::{RecordingManager, StartOutcome, WriterFactory};
use vigil_core::stabilizer::StabilizerConfig;
use vigil_hw::{Frame, FrameSource, SourceError};

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("source: {0}")]
    Source(#[from] SourceError),
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("startup task failed: {0}")]
    Startup(#[from] tokio::task::JoinError),
}

/// Debounced presence alert, published once per sustained-presence period.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PresenceNotification {
    /// Function name or preview id that raised it.
    #[serde(skip)]
    pub origin: String,
    /// Epoch seconds.
    pub timestamp: i64,
    pub people_count: usize,
}

/// Displayed faces of one processed preview frame.
#[derive(Debug, Clone, Serialize)]
pub struct PreviewFrame {
    #[serde(skip)]
    pub preview_id: String,
    pub detected_faces: Vec<DetectedFace>,
}

pub enum PipelineMode {
    /// Background monitoring for one configured function.
    Scheduled(FunctionConfig),
    /// Live preview streaming per-frame results.
    Preview {
        id: String,
        frames: mpsc::Sender<PreviewFrame>,
    },
}

impl PipelineMode {
    pub fn name(&self) -> &str {
        match self {
            Self::Scheduled(f) => &f.name,
            Self::Preview { id, .. } => id,
        }
    }
}

/// Tunables shared by all pipelines of one mode.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub frame_skip: u64,
    /// Sleep after each processed frame.
    pub interval: Duration,
    pub recordings_dir: PathBuf,
    pub recording_fps: u32,
    pub aggregate_samples: usize,
    pub stabilizer: StabilizerConfig,
}

impl PipelineSettings {
    pub fn scheduled(config: &Config) -> Self {
        Self::with_interval(config, config.scheduled_interval)
    }

    pub fn preview(config: &Config) -> Self {
        Self::with_interval(config, config.preview_interval)
    }

    fn with_interval(config: &Config, interval: Duration) -> Self {
        Self {
            frame_skip: config.frame_skip,
            interval,
            recordings_dir: config.recordings_dir.clone(),
            recording_fps: config.recording_fps,
            aggregate_samples: config.aggregate_samples,
            stabilizer: StabilizerConfig {
                vote_window: config.vote_window,
                switch_threshold: config.switch_threshold,
            },
        }
    }
}

/// Shared destinations for pipeline output.
#[derive(Clone)]
pub struct PipelineOutputs {
    pub notifications: mpsc::Sender<PresenceNotification>,
    pub writers: Arc<dyn WriterFactory>,
    pub sink: Arc<dyn OccupancySink>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    Cancelled,
    EndOfStream,
    SourceFailed(String),
}

/// Summary returned once a pipeline has fully shut down.
#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub name: String,
    pub frames_read: u64,
    pub frames_processed: u64,
    pub notifications: u64,
    pub recordings: Vec<PathBuf>,
    pub stop: StopReason,
}

/// Blocking half of a pipeline: the source and the face chain.
struct FrameReader {
    name: String,
    source: Box<dyn FrameSource>,
    analyzer: FaceAnalyzer,
    frame_skip: u64,
    frames_read: u64,
}

enum ReadOutcome {
    /// A sampled frame and its faces; `None` when analysis failed.
    Sampled(Frame, Option<Vec<FaceObservation>>),
    Stopped(StopReason),
}

impl FrameReader {
    /// Read up to the next sampled frame and analyse it. Blocks the caller.
    fn next_sampled(&mut self, cancel: &CancellationToken) -> ReadOutcome {
        loop {
            if cancel.is_cancelled() {
                return ReadOutcome::Stopped(StopReason::Cancelled);
            }

            let frame = match self.source.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => return ReadOutcome::Stopped(StopReason::EndOfStream),
                Err(e) => {
                    tracing::warn!(pipeline = %self.name, error = %e, "frame read failed; stopping");
                    return ReadOutcome::Stopped(StopReason::SourceFailed(e.to_string()));
                }
            };
            self.frames_read += 1;

            if frame.sequence % self.frame_skip != 0 {
                continue;
            }
            if cancel.is_cancelled() {
                return ReadOutcome::Stopped(StopReason::Cancelled);
            }

            let faces = match self.analyzer.analyze(&frame.data, frame.width, frame.height) {
                Ok(faces) => Some(faces),
                Err(e) => {
                    tracing::warn!(pipeline = %self.name, seq = frame.sequence, error = %e, "frame analysis failed; skipping");
                    None
                }
            };
            return ReadOutcome::Sampled(frame, faces);
        }
    }
}

pub struct Pipeline {
    name: String,
    function_id: Option<i64>,
    preview_frames: Option<mpsc::Sender<PreviewFrame>>,
    /// Lent to the blocking pool for each read; `None` once abandoned.
    reader: Option<FrameReader>,
    source_label: String,
    tracker: PresenceTracker,
    recorder: Option<RecordingManager>,
    aggregator: Option<Aggregator>,
    outputs: PipelineOutputs,
    interval: Duration,
    report: PipelineReport,
}

impl Pipeline {
    pub fn new(
        mode: PipelineMode,
        settings: &PipelineSettings,
        source: Box<dyn FrameSource>,
        analyzer: FaceAnalyzer,
        outputs: PipelineOutputs,
    ) -> Self {
        let name = mode.name().to_string();

        let (policy, function_id, preview_frames, recorder, aggregator) = match mode {
            PipelineMode::Scheduled(function) => {
                let recorder = function.save_recordings.then(|| {
                    RecordingManager::new(
                        settings.recordings_dir.clone(),
                        function.name.clone(),
                        settings.recording_fps,
                        outputs.writers.clone(),
                    )
                });
                (
                    PresencePolicy::scheduled(function.notify, function.save_recordings),
                    Some(function.id),
                    None,
                    recorder,
                    Some(Aggregator::new(function.id, settings.aggregate_samples)),
                )
            }
            PipelineMode::Preview { frames, .. } => {
                (PresencePolicy::preview(), None, Some(frames), None, None)
            }
        };

        Self {
            report: PipelineReport {
                name: name.clone(),
                frames_read: 0,
                frames_processed: 0,
                notifications: 0,
                recordings: Vec::new(),
                stop: StopReason::Cancelled,
            },
            source_label: source.describe(),
            reader: Some(FrameReader {
                name: name.clone(),
                source,
                analyzer,
                frame_skip: settings.frame_skip.max(1),
                frames_read: 0,
            }),
            name,
            function_id,
            preview_frames,
            tracker: PresenceTracker::new(policy),
            recorder,
            aggregator,
            outputs,
            interval: settings.interval,
        }
    }

    /// Drive the loop until end of stream, source failure or `cancel`.
    pub async fn run(mut self, cancel: CancellationToken) -> PipelineReport {
        tracing::info!(
            pipeline = %self.name,
            source = %self.source_label,
            function_id = ?self.function_id,
            "pipeline started"
        );

        let stop = loop {
            let (frame, faces) = match self.read_next(&cancel).await {
                ReadOutcome::Sampled(frame, faces) => (frame, faces),
                ReadOutcome::Stopped(reason) => break reason,
            };
            if let Some(faces) = faces {
                self.process(frame, &faces).await;
            }

            tokio::select! {
                _ = cancel.cancelled() => break StopReason::Cancelled,
                _ = tokio::time::sleep(self.interval) => {}
            }
        };

        self.shutdown(stop).await
    }

    /// One blocking read+analyse step, abandoned if `cancel` fires first.
    async fn read_next(&mut self, cancel: &CancellationToken) -> ReadOutcome {
        let Some(mut reader) = self.reader.take() else {
            return ReadOutcome::Stopped(StopReason::Cancelled);
        };
        let token = cancel.clone();
        let mut step = tokio::task::spawn_blocking(move || {
            let outcome = reader.next_sampled(&token);
            (reader, outcome)
        });

        tokio::select! {
            biased;
            // The detached step drops the reader (and closes the source)
            // on the blocking pool once the stuck read returns.
            _ = cancel.cancelled() => ReadOutcome::Stopped(StopReason::Cancelled),
            joined = &mut step => match joined {
                Ok((reader, outcome)) => {
                    self.report.frames_read = reader.frames_read;
                    self.reader = Some(reader);
                    outcome
                }
                Err(e) => {
                    tracing::error!(pipeline = %self.name, error = %e, "frame reader task failed");
                    ReadOutcome::Stopped(StopReason::SourceFailed(format!("reader task failed: {e}")))
                }
            },
        }
    }

    async fn process(&mut self, frame: Frame, faces: &[FaceObservation]) {
        self.report.frames_processed += 1;

        let people_count = faces.len();
        let now = tokio::time::Instant::now().into_std();
        let unix_ts = chrono::Utc::now().timestamp();
        let decision = self.tracker.update(people_count, now);

        tracing::trace!(pipeline = %self.name, seq = frame.sequence, people_count, "frame processed");

        if let Some(tx) = &self.preview_frames {
            let update = PreviewFrame {
                preview_id: self.name.clone(),
                detected_faces: faces.iter().map(|f| f.display.clone()).collect(),
            };
            if let Err(e) = tx.try_send(update) {
                tracing::debug!(pipeline = %self.name, error = %e, "preview frame dropped");
            }
        }

        if decision.notify {
            self.report.notifications += 1;
            let notification = PresenceNotification {
                origin: self.name.clone(),
                timestamp: unix_ts,
                people_count,
            };
            match self.outputs.notifications.try_send(notification) {
                Ok(()) => tracing::info!(pipeline = %self.name, people_count, "presence notification queued"),
                Err(e) => tracing::warn!(pipeline = %self.name, error = %e, "presence notification not delivered"),
            }
        }

        self.record(frame, decision, now, unix_ts).await;

        if let Some(aggregator) = self.aggregator.as_mut() {
            aggregator.record(people_count, unix_ts, self.outputs.sink.as_ref());
        }
    }

    /// Apply the recording decision and append the frame, off the async workers.
    async fn record(&mut self, frame: Frame, decision: PresenceDecision, now: std::time::Instant, unix_ts: i64) {
        let Some(mut recorder) = self.recorder.take() else {
            return;
        };
        let name = self.name.clone();
        let joined = tokio::task::spawn_blocking(move || {
            let closed = if decision.stop_recording { recorder.stop() } else { None };
            if decision.start_recording {
                if let StartOutcome::Started(path) = recorder.start(frame.width, frame.height, now, unix_ts) {
                    tracing::debug!(pipeline = %name, path = %path.display(), "recording session opened");
                }
            }
            recorder.append(frame.pixels());
            (recorder, closed)
        })
        .await;

        match joined {
            Ok((recorder, closed)) => {
                self.report.recordings.extend(closed);
                self.recorder = Some(recorder);
            }
            Err(e) => tracing::error!(pipeline = %self.name, error = %e, "recording task failed; recording disabled"),
        }
    }

    async fn shutdown(mut self, stop: StopReason) -> PipelineReport {
        if let Some(mut recorder) = self.recorder.take() {
            match tokio::task::spawn_blocking(move || recorder.stop()).await {
                Ok(closed) => self.report.recordings.extend(closed),
                Err(e) => tracing::error!(pipeline = %self.name, error = %e, "recording did not close"),
            }
        }
        self.report.stop = stop;
        tracing::info!(
            pipeline = %self.name,
            stop = ?self.report.stop,
            frames_read = self.report.frames_read,
            frames_processed = self.report.frames_processed,
            notifications = self.report.notifications,
            "pipeline stopped"
        );
        // A reader still held here is dropped with `self`, after the recording is closed.
        self.report
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::VecDeque;
    use std::path::Path;
    use std::sync::Mutex;
    use vigil_core::aggregator::{OccupancyAggregate, SinkError};
    use vigil_core::detector::FaceLocalizer;
    use vigil_core::gallery::{CosineMatcher, Gallery, GalleryEntry};
    use vigil_core::recognizer::FaceEmbedder;
    use vigil_core::recording::{FramePixels, RecordingError, VideoWriter};
    use vigil_core::slots::IouSlots;
    use vigil_core::stabilizer::IdentityStabilizer;
    use vigil_core::types::{BoundingBox, Embedding};

    /// Endless (or `limit`-long) 4x2 gray frames; fails after `fail_after` reads if set.
    pub struct SyntheticSource {
        pub next: u64,
        pub limit: Option<u64>,
        pub fail_after: Option<u64>,
    }

    impl SyntheticSource {
        pub fn endless() -> Self {
            Self { next: 0, limit: None, fail_after: None }
        }

        pub fn frames(limit: u64) -> Self {
            Self { next: 0, limit: Some(limit), fail_after: None }
        }
    }

    impl FrameSource for SyntheticSource {
        fn next_frame(&mut self) -> Result<Option<Frame>, SourceError> {
            if self.fail_after == Some(self.next) {
                return Err(SourceError::Unsupported("device unplugged".into()));
            }
            if self.limit == Some(self.next) {
                return Ok(None);
            }
            let frame = Frame::new(vec![128; 8], 4, 2, self.next);
            self.next += 1;
            Ok(Some(frame))
        }

        fn describe(&self) -> String {
            "synthetic".into()
        }
    }

    /// Blocks inside `next_frame` until the paired sender is dropped, like a
    /// camera that stopped delivering buffers.
    pub struct StalledSource {
        pub release: std::sync::mpsc::Receiver<()>,
    }

    impl FrameSource for StalledSource {
        fn next_frame(&mut self) -> Result<Option<Frame>, SourceError> {
            let _ = self.release.recv();
            Ok(None)
        }

        fn describe(&self) -> String {
            "stalled".into()
        }
    }

    /// Number of faces as a function of virtual time since construction.
    pub struct TimedLocalizer {
        start: tokio::time::Instant,
        faces_at: Box<dyn Fn(Duration) -> usize + Send>,
    }

    impl TimedLocalizer {
        pub fn new(faces_at: impl Fn(Duration) -> usize + Send + 'static) -> Self {
            Self {
                start: tokio::time::Instant::now(),
                faces_at: Box::new(faces_at),
            }
        }
    }

    impl FaceLocalizer for TimedLocalizer {
        fn locate(&mut self, _: &[u8], _: u32, _: u32) -> Result<Vec<BoundingBox>, DetectorError> {
            let n = (self.faces_at)(self.start.elapsed());
            Ok((0..n)
                .map(|i| {
                    let x = i as f32 * 200.0;
                    BoundingBox::new(x, 0.0, x + 50.0, 50.0)
                })
                .collect())
        }
    }

    pub struct ConstantEmbedder;

    impl FaceEmbedder for ConstantEmbedder {
        fn embed(&mut self, _: &[u8], _: u32, _: u32, _: &BoundingBox) -> Result<Embedding, RecognizerError> {
            Ok(Embedding::new(vec![1.0, 0.0]))
        }
    }

    pub fn analyzer(localizer: TimedLocalizer) -> FaceAnalyzer {
        let gallery = Gallery::new(vec![GalleryEntry {
            label: "alice".into(),
            embeddings: vec![vec![1.0, 0.0]],
            image_url: Some("/img/alice.jpg".into()),
            value: None,
        }])
        .unwrap();
        FaceAnalyzer::new(
            Box::new(localizer),
            Box::new(ConstantEmbedder),
            Arc::new(CosineMatcher::default()),
            Arc::new(gallery),
            Box::new(IouSlots::default()),
            IdentityStabilizer::new(StabilizerConfig {
                vote_window: 3,
                switch_threshold: 2,
            }),
        )
    }

    #[derive(Debug, Default)]
    pub struct WriterLog {
        pub opened: Vec<(PathBuf, Duration)>,
        pub frames: usize,
        pub finished: Vec<Duration>,
    }

    /// Records writer activity with virtual timestamps.
    pub struct RecordingLog {
        pub log: Arc<Mutex<WriterLog>>,
        start: tokio::time::Instant,
    }

    impl RecordingLog {
        pub fn new() -> Self {
            Self {
                log: Arc::default(),
                start: tokio::time::Instant::now(),
            }
        }
    }

    struct LoggedWriter {
        log: Arc<Mutex<WriterLog>>,
        start: tokio::time::Instant,
    }

    impl VideoWriter for LoggedWriter {
        fn write_frame(&mut self, _: FramePixels<'_>) -> Result<(), RecordingError> {
            self.log.lock().unwrap().frames += 1;
            Ok(())
        }

        fn finish(self: Box<Self>) -> Result<(), RecordingError> {
            self.log.lock().unwrap().finished.push(self.start.elapsed());
            Ok(())
        }
    }

    impl WriterFactory for RecordingLog {
        fn extension(&self) -> &str {
            "mp4"
        }

        fn open(&self, path: &Path, _: u32, _: u32, _: u32) -> Result<Box<dyn VideoWriter>, RecordingError> {
            self.log.lock().unwrap().opened.push((path.to_path_buf(), self.start.elapsed()));
            Ok(Box::new(LoggedWriter {
                log: self.log.clone(),
                start: self.start,
            }))
        }
    }

    #[derive(Default)]
    pub struct MemorySink {
        pub rows: Mutex<Vec<OccupancyAggregate>>,
    }

    impl OccupancySink for MemorySink {
        fn persist(&self, aggregate: &OccupancyAggregate) -> Result<(), SinkError> {
            self.rows.lock().unwrap().push(aggregate.clone());
            Ok(())
        }
    }

    pub fn settings(dir: &Path) -> PipelineSettings {
        PipelineSettings {
            frame_skip: 1,
            interval: Duration::from_millis(100),
            recordings_dir: dir.to_path_buf(),
            recording_fps: 10,
            aggregate_samples: 120,
            stabilizer: StabilizerConfig::default(),
        }
    }

    pub fn function(notify: bool, save_recordings: bool) -> FunctionConfig {
        FunctionConfig {
            id: 9,
            name: "lobby".into(),
            camera_source: "synthetic".into(),
            save_recordings,
            notify,
            time_slot: None,
        }
    }

    pub fn drain<T>(rx: &mut mpsc::Receiver<T>) -> VecDeque<T> {
        let mut out = VecDeque::new();
        while let Ok(item) = rx.try_recv() {
            out.push_back(item);
        }
        out
    }
}
