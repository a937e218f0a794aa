//! V4L2 camera capture via the `v4l` crate.
//!
//! The mmap stream is created once at open and kept for the camera's
//! lifetime, so continuous capture does not re-queue buffers per frame.
//! Dequeues are bounded by [`DEQUEUE_TIMEOUT`] so a stalled device surfaces
//! as an error instead of a hung reader.

use crate::frame::{self, Frame};
use crate::source::{FrameSource, SourceError};
use ouroboros::self_referencing;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;
const STREAM_BUFFERS: u32 = 4;
/// Longest wait for one buffer before the capture is reported as failed.
pub const DEQUEUE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("no frame within {0:?}")]
    Timeout(Duration),
    #[error("device busy")]
    DeviceBusy,
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
}

/// Info about a discovered V4L2 device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// Negotiated pixel format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed, Y channel extracted.
    Yuyv,
    Grey,
    /// 16-bit little-endian gray.
    Y16,
}

impl PixelFormat {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        if fourcc == FourCC::new(b"YUYV") {
            Some(Self::Yuyv)
        } else if fourcc == FourCC::new(b"GREY") {
            Some(Self::Grey)
        } else if fourcc == FourCC::new(b"Y16 ") || fourcc == FourCC::new(b"Y16\0") {
            Some(Self::Y16)
        } else {
            None
        }
    }

    fn to_luma(self, buf: &[u8], width: u32, height: u32) -> Result<Vec<u8>, frame::FrameError> {
        match self {
            Self::Yuyv => frame::yuyv_to_grayscale(buf, width, height),
            Self::Grey => frame::grey_to_grayscale(buf, width, height),
            Self::Y16 => frame::y16_to_grayscale(buf, width, height),
        }
    }

    /// RGB for formats that carry chroma.
    fn to_color(self, buf: &[u8], width: u32, height: u32) -> Option<Vec<u8>> {
        match self {
            Self::Yuyv => frame::yuyv_to_rgb(buf, width, height).ok(),
            Self::Grey | Self::Y16 => None,
        }
    }
}

#[self_referencing]
struct Capturing {
    device: Device,
    #[borrows(device)]
    #[covariant]
    stream: MmapStream<'this>,
}

/// Open V4L2 capture device with a live mmap stream.
pub struct Camera {
    capturing: Capturing,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pub fourcc: FourCC,
    pixel_format: PixelFormat,
    next_sequence: u64,
}

impl Camera {
    /// Open a device by path (e.g. "/dev/video0") at the default 640x480.
    pub fn open(device_path: &str) -> Result<Self, CameraError> {
        Self::open_with_size(device_path, DEFAULT_WIDTH, DEFAULT_HEIGHT)
    }

    /// Open a device requesting `width`x`height`; the driver may pick another size.
    pub fn open_with_size(device_path: &str, width: u32, height: u32) -> Result<Self, CameraError> {
        if !Path::new(device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path.to_string()));
        }

        let device = Device::with_path(device_path).map_err(|e| {
            if e.to_string().contains("busy") || e.to_string().contains("EBUSY") {
                CameraError::DeviceBusy
            } else {
                CameraError::DeviceNotFound(format!("{device_path}: {e}"))
            }
        })?;

        let caps = device.query_caps().map_err(|e| {
            CameraError::CaptureFailed(format!("failed to query capabilities: {e}"))
        })?;
        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CameraError::StreamingNotSupported);
        }

        tracing::info!(
            device = device_path,
            driver = %caps.driver,
            card = %caps.card,
            "opened camera"
        );

        let mut fmt = device.format().map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to get format: {e}"))
        })?;
        fmt.fourcc = FourCC::new(b"YUYV");
        fmt.width = width;
        fmt.height = height;

        let negotiated = device.set_format(&fmt).map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to set format: {e}"))
        })?;

        let fourcc = negotiated.fourcc;
        let pixel_format = PixelFormat::from_fourcc(fourcc).ok_or_else(|| {
            CameraError::FormatNegotiationFailed(format!(
                "unsupported pixel format: {fourcc:?} (need YUYV, GREY, or Y16)"
            ))
        })?;

        tracing::info!(
            width = negotiated.width,
            height = negotiated.height,
            fourcc = ?fourcc,
            "negotiated format"
        );

        let capturing = CapturingTryBuilder {
            device,
            stream_builder: |device| {
                let mut stream = MmapStream::with_buffers(device, BufType::VideoCapture, STREAM_BUFFERS)
                    .map_err(|e| CameraError::CaptureFailed(format!("failed to create mmap stream: {e}")))?;
                stream.set_timeout(DEQUEUE_TIMEOUT);
                Ok(stream)
            },
        }
        .try_build()?;

        Ok(Self {
            capturing,
            width: negotiated.width,
            height: negotiated.height,
            device_path: device_path.to_string(),
            fourcc,
            pixel_format,
            next_sequence: 0,
        })
    }

    /// Dequeue one buffer and convert it to luma (plus RGB for YUYV).
    pub fn capture_frame(&mut self) -> Result<Frame, CameraError> {
        let (width, height, format) = (self.width, self.height, self.pixel_format);

        let (luma, color) = self.capturing.with_stream_mut(|stream| {
            let (buf, _meta) = stream.next().map_err(|e| match e.kind() {
                std::io::ErrorKind::TimedOut => CameraError::Timeout(DEQUEUE_TIMEOUT),
                _ => CameraError::CaptureFailed(format!("failed to dequeue buffer: {e}")),
            })?;
            let luma = format
                .to_luma(buf, width, height)
                .map_err(|e| CameraError::CaptureFailed(e.to_string()))?;
            Ok::<_, CameraError>((luma, format.to_color(buf, width, height)))
        })?;

        let sequence = self.next_sequence;
        self.next_sequence += 1;
        let frame = Frame::new(luma, width, height, sequence);
        Ok(match color {
            Some(rgb) => frame.with_color(rgb),
            None => frame,
        })
    }

    /// List available V4L2 video capture devices.
    pub fn list_devices() -> Vec<DeviceInfo> {
        let mut devices = Vec::new();

        for i in 0..16 {
            let path = format!("/dev/video{i}");
            if !Path::new(&path).exists() {
                continue;
            }
            let Ok(dev) = Device::with_path(&path) else {
                continue;
            };
            let Ok(caps) = dev.query_caps() else {
                continue;
            };
            if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
                continue;
            }
            devices.push(DeviceInfo {
                path,
                name: caps.card,
                driver: caps.driver,
                bus: caps.bus,
            });
        }

        devices
    }
}

impl FrameSource for Camera {
    fn next_frame(&mut self) -> Result<Option<Frame>, SourceError> {
        Ok(Some(self.capture_frame()?))
    }

    fn describe(&self) -> String {
        format!("camera {} ({}x{})", self.device_path, self.width, self.height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pixel_format_from_fourcc() {
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"YUYV")), Some(PixelFormat::Yuyv));
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"GREY")), Some(PixelFormat::Grey));
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"Y16 ")), Some(PixelFormat::Y16));
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"MJPG")), None);
    }

    #[test]
    fn test_to_luma_dispatch() {
        let yuyv = [10, 0, 20, 0];
        assert_eq!(PixelFormat::Yuyv.to_luma(&yuyv, 2, 1).unwrap(), vec![10, 20]);
        assert_eq!(PixelFormat::Grey.to_luma(&yuyv, 2, 1).unwrap(), vec![10, 0]);
        assert_eq!(PixelFormat::Y16.to_luma(&yuyv, 2, 1).unwrap(), vec![0, 0]);
    }

    #[test]
    fn test_only_yuyv_carries_color() {
        let yuyv = [16, 128, 235, 128];
        assert_eq!(PixelFormat::Yuyv.to_color(&yuyv, 2, 1).unwrap().len(), 6);
        assert!(PixelFormat::Grey.to_color(&yuyv, 2, 1).is_none());
        assert!(PixelFormat::Y16.to_color(&yuyv, 2, 1).is_none());
    }

    #[test]
    fn test_open_missing_device() {
        assert!(matches!(
            Camera::open("/dev/video-missing"),
            Err(CameraError::DeviceNotFound(_))
        ));
    }
}
