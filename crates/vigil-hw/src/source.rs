//! The frame source seam and source selection by name.

use crate::camera::{Camera, CameraError};
use crate::frame::Frame;
use crate::video::{VideoError, VideoSource};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("unsupported source {0:?}")]
    Unsupported(String),
    #[error("camera: {0}")]
    Camera(#[from] CameraError),
    #[error("video: {0}")]
    Video(#[from] VideoError),
}

/// Sequential frames from one feed.
///
/// `next_frame` may block for up to a frame period (or a device timeout);
/// callers keep it off async worker threads.
pub trait FrameSource: Send {
    /// Next frame, or `None` at end of stream.
    fn next_frame(&mut self) -> Result<Option<Frame>, SourceError>;

    /// Human-readable origin for logs.
    fn describe(&self) -> String;
}

/// Open a source from its configured name: `/dev/video*` is a V4L2 camera,
/// anything else (file path, `rtsp://`, `http://`) goes through ffmpeg.
pub fn open_source(name: &str) -> Result<Box<dyn FrameSource>, SourceError> {
    if name.trim().is_empty() {
        return Err(SourceError::Unsupported(name.to_string()));
    }
    if name.starts_with("/dev/video") {
        return Ok(Box::new(Camera::open(name)?));
    }
    Ok(Box::new(VideoSource::open(name)?))
}
