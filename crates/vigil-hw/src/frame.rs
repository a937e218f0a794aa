//! Frame type and raw pixel format conversion to 8-bit luma.

use std::time::Instant;
use vigil_core::recording::FramePixels;

/// One decoded frame: 8-bit luma for analysis, plus color when the source has it.
#[derive(Clone)]
pub struct Frame {
    /// Luma pixel data (width * height bytes).
    pub data: Vec<u8>,
    /// Packed RGB24 (width * height * 3 bytes).
    pub color: Option<Vec<u8>>,
    pub width: u32,
    pub height: u32,
    pub timestamp: Instant,
    /// Monotonic per-source counter starting at 0.
    pub sequence: u64,
}

impl Frame {
    pub fn new(data: Vec<u8>, width: u32, height: u32, sequence: u64) -> Self {
        Self {
            data,
            color: None,
            width,
            height,
            timestamp: Instant::now(),
            sequence,
        }
    }

    pub fn with_color(mut self, rgb: Vec<u8>) -> Self {
        self.color = Some(rgb);
        self
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// What a recording should store: color if present, luma otherwise.
    pub fn pixels(&self) -> FramePixels<'_> {
        match &self.color {
            Some(rgb) => FramePixels::Rgb(rgb),
            None => FramePixels::Gray(&self.data),
        }
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("sequence", &self.sequence)
            .field("bytes", &self.data.len())
            .field("color", &self.color.is_some())
            .finish()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid {format} length: expected {expected}, got {actual}")]
    InvalidLength {
        format: &'static str,
        expected: usize,
        actual: usize,
    },
}

/// Packed YUYV (4:2:2) to luma: every even byte is a Y sample.
pub fn yuyv_to_grayscale(yuyv: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = width as usize * height as usize * 2;
    if yuyv.len() < expected {
        return Err(FrameError::InvalidLength {
            format: "YUYV",
            expected,
            actual: yuyv.len(),
        });
    }
    Ok(yuyv[..expected].iter().step_by(2).copied().collect())
}

/// Packed YUYV (4:2:2) to RGB24, BT.601 limited range.
pub fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = width as usize * height as usize * 2;
    if yuyv.len() < expected {
        return Err(FrameError::InvalidLength {
            format: "YUYV",
            expected,
            actual: yuyv.len(),
        });
    }
    let mut rgb = Vec::with_capacity(expected / 2 * 3);
    for px in yuyv[..expected].chunks_exact(4) {
        let (u, v) = (i32::from(px[1]) - 128, i32::from(px[3]) - 128);
        for y in [px[0], px[2]] {
            let c = 298 * (i32::from(y) - 16);
            rgb.push(clamp_u8((c + 409 * v + 128) >> 8));
            rgb.push(clamp_u8((c - 100 * u - 208 * v + 128) >> 8));
            rgb.push(clamp_u8((c + 516 * u + 128) >> 8));
        }
    }
    Ok(rgb)
}

fn clamp_u8(v: i32) -> u8 {
    v.clamp(0, 255) as u8
}

/// 16-bit little-endian gray to 8-bit by keeping the high byte.
pub fn y16_to_grayscale(y16: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let pixels = width as usize * height as usize;
    if y16.len() < pixels * 2 {
        return Err(FrameError::InvalidLength {
            format: "Y16",
            expected: pixels * 2,
            actual: y16.len(),
        });
    }
    Ok(y16[..pixels * 2].chunks_exact(2).map(|px| px[1]).collect())
}

/// 8-bit gray, truncated to exactly one frame.
pub fn grey_to_grayscale(grey: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let pixels = width as usize * height as usize;
    if grey.len() < pixels {
        return Err(FrameError::InvalidLength {
            format: "GREY",
            expected: pixels,
            actual: grey.len(),
        });
    }
    Ok(grey[..pixels].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yuyv_to_grayscale() {
        // 2x1: [Y0, U, Y1, V]
        let gray = yuyv_to_grayscale(&[100, 128, 200, 128], 2, 1).unwrap();
        assert_eq!(gray, vec![100, 200]);
    }

    #[test]
    fn test_yuyv_ignores_trailing_padding() {
        let mut yuyv: Vec<u8> = (0..16).collect();
        yuyv.extend([9, 9, 9, 9]);
        let gray = yuyv_to_grayscale(&yuyv, 4, 2).unwrap();
        assert_eq!(gray, vec![0, 2, 4, 6, 8, 10, 12, 14]);
    }

    #[test]
    fn test_yuyv_invalid_length() {
        assert!(yuyv_to_grayscale(&[100, 128], 2, 1).is_err());
    }

    #[test]
    fn test_yuyv_to_rgb_gray_and_red() {
        // Neutral chroma: black and white stay gray.
        let rgb = yuyv_to_rgb(&[16, 128, 235, 128], 2, 1).unwrap();
        assert_eq!(rgb, vec![0, 0, 0, 255, 255, 255]);

        // BT.601 red is roughly Y=81 U=90 V=240.
        let red = yuyv_to_rgb(&[81, 90, 81, 240], 2, 1).unwrap();
        assert!(red[0] > 240 && red[1] < 10 && red[2] < 10, "{red:?}");
    }

    #[test]
    fn test_pixels_prefers_color() {
        let gray = Frame::new(vec![1, 2], 2, 1, 0);
        assert!(matches!(gray.pixels(), FramePixels::Gray(d) if d == [1, 2]));
        let color = gray.with_color(vec![9; 6]);
        assert!(matches!(color.pixels(), FramePixels::Rgb(d) if d.len() == 6));
    }

    #[test]
    fn test_y16_keeps_high_byte() {
        let gray = y16_to_grayscale(&[0xff, 0x12, 0x00, 0x80], 2, 1).unwrap();
        assert_eq!(gray, vec![0x12, 0x80]);
    }

    #[test]
    fn test_grey_short_buffer() {
        let err = grey_to_grayscale(&[1, 2, 3], 2, 2).unwrap_err();
        assert!(err.to_string().contains("GREY"));
    }
}
