//! Recording session lifecycle: at most one open video artifact per feed.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

/// Target frame rate written into recordings.
pub const DEFAULT_RECORDING_FPS: u32 = 10;

#[derive(Error, Debug)]
pub enum RecordingError {
    #[error("degenerate frame size {width}x{height}")]
    BadDimensions { width: u32, height: u32 },
    #[error("frame has {got} bytes, writer expects {expected}")]
    FrameSize { expected: usize, got: usize },
    #[error("recording I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("encoder: {0}")]
    Encode(String),
}

/// Pixel payload of one frame handed to a writer.
#[derive(Debug, Clone, Copy)]
pub enum FramePixels<'a> {
    /// 8-bit luma, width * height bytes.
    Gray(&'a [u8]),
    /// Packed RGB24, width * height * 3 bytes.
    Rgb(&'a [u8]),
}

/// An open output video.
pub trait VideoWriter: Send {
    fn write_frame(&mut self, pixels: FramePixels<'_>) -> Result<(), RecordingError>;

    /// Flush and close the artifact.
    fn finish(self: Box<Self>) -> Result<(), RecordingError>;
}

/// Opens writers for new recording sessions.
pub trait WriterFactory: Send + Sync {
    /// File extension of produced artifacts, without the dot.
    fn extension(&self) -> &str;

    fn open(
        &self,
        path: &Path,
        width: u32,
        height: u32,
        fps: u32,
    ) -> Result<Box<dyn VideoWriter>, RecordingError>;
}

/// The live session, if any.
pub struct RecordingSession {
    pub file_path: PathBuf,
    pub started_at: Instant,
    pub frames_written: u64,
    writer: Box<dyn VideoWriter>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    Started(PathBuf),
    AlreadyLive,
    /// Nothing opened this time; a later trigger may retry.
    Skipped,
}

/// Owns the recording session of one scheduled pipeline.
pub struct RecordingManager {
    root: PathBuf,
    function_name: String,
    fps: u32,
    factory: Arc<dyn WriterFactory>,
    session: Option<RecordingSession>,
}

impl RecordingManager {
    pub fn new(
        root: impl Into<PathBuf>,
        function_name: impl Into<String>,
        fps: u32,
        factory: Arc<dyn WriterFactory>,
    ) -> Self {
        Self {
            root: root.into(),
            function_name: function_name.into(),
            fps,
            factory,
            session: None,
        }
    }

    pub fn is_live(&self) -> bool {
        self.session.is_some()
    }

    pub fn session(&self) -> Option<&RecordingSession> {
        self.session.as_ref()
    }

    /// `{root}/{function_name}_{unix_ts}.{ext}`
    pub fn path_for(&self, unix_ts: i64) -> PathBuf {
        self.root.join(format!(
            "{}_{}.{}",
            self.function_name,
            unix_ts,
            self.factory.extension()
        ))
    }

    /// Open a session sized to the current frame unless one is already live.
    pub fn start(&mut self, width: u32, height: u32, now: Instant, unix_ts: i64) -> StartOutcome {
        if self.session.is_some() {
            return StartOutcome::AlreadyLive;
        }
        if width == 0 || height == 0 {
            tracing::warn!(function = %self.function_name, width, height, "frame size invalid; recording not started");
            return StartOutcome::Skipped;
        }

        let path = self.path_for(unix_ts);
        let opened = std::fs::create_dir_all(&self.root)
            .map_err(RecordingError::from)
            .and_then(|()| self.factory.open(&path, width, height, self.fps));

        match opened {
            Ok(writer) => {
                tracing::info!(function = %self.function_name, path = %path.display(), width, height, "recording started");
                self.session = Some(RecordingSession {
                    file_path: path.clone(),
                    started_at: now,
                    frames_written: 0,
                    writer,
                });
                StartOutcome::Started(path)
            }
            Err(e) => {
                tracing::warn!(function = %self.function_name, path = %path.display(), error = %e, "failed to open recording");
                StartOutcome::Skipped
            }
        }
    }

    /// Append a frame to the live session; no-op when idle.
    ///
    /// A write failure closes the session.
    pub fn append(&mut self, pixels: FramePixels<'_>) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        match session.writer.write_frame(pixels) {
            Ok(()) => session.frames_written += 1,
            Err(e) => {
                tracing::warn!(path = %session.file_path.display(), error = %e, "recording write failed; closing");
                self.stop();
            }
        }
    }

    /// Flush and close the live session. Safe to call when idle.
    pub fn stop(&mut self) -> Option<PathBuf> {
        let session = self.session.take()?;
        let path = session.file_path;
        let frames = session.frames_written;
        match session.writer.finish() {
            Ok(()) => tracing::info!(path = %path.display(), frames, "recording stopped"),
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "recording did not close cleanly"),
        }
        Some(path)
    }
}

impl Drop for RecordingManager {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Shared log of what the mock writers did.
    #[derive(Debug, Default)]
    pub struct WriterLog {
        pub opened: Vec<PathBuf>,
        pub frames: usize,
        pub finished: usize,
    }

    pub struct MockFactory {
        pub log: Arc<Mutex<WriterLog>>,
        pub fail_open: bool,
    }

    struct MockWriter {
        log: Arc<Mutex<WriterLog>>,
    }

    impl VideoWriter for MockWriter {
        fn write_frame(&mut self, _: FramePixels<'_>) -> Result<(), RecordingError> {
            self.log.lock().unwrap().frames += 1;
            Ok(())
        }

        fn finish(self: Box<Self>) -> Result<(), RecordingError> {
            self.log.lock().unwrap().finished += 1;
            Ok(())
        }
    }

    impl WriterFactory for MockFactory {
        fn extension(&self) -> &str {
            "mock"
        }

        fn open(&self, path: &Path, _w: u32, _h: u32, _fps: u32) -> Result<Box<dyn VideoWriter>, RecordingError> {
            if self.fail_open {
                return Err(RecordingError::Io(std::io::Error::other("disk full")));
            }
            self.log.lock().unwrap().opened.push(path.to_path_buf());
            Ok(Box::new(MockWriter { log: self.log.clone() }))
        }
    }
}
