//! vigil-hw — Frame acquisition and video file I/O.
//!
//! V4L2 cameras and ffmpeg inputs (files, RTSP/HTTP streams) both surface as
//! [`FrameSource`]s producing luma frames, with color when the input has it.
//! Recordings are encoded back out through ffmpeg.

pub mod camera;
pub mod frame;
pub mod source;
pub mod video;

pub use camera::{Camera, CameraError, DeviceInfo, PixelFormat};
pub use frame::Frame;
pub use source::{open_source, FrameSource, SourceError};
pub use video::{Mp4WriterFactory, VideoError, VideoFileWriter, VideoSource};
