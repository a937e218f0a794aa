//! Video files and network streams via ffmpeg-next (libavformat + libavcodec).
//!
//! [`VideoSource`] decodes anything libavformat can open (files, `rtsp://`,
//! `http://`) into luma + RGB frames. [`VideoFileWriter`] encodes recordings
//! as MPEG-4 in whatever container the path extension names.

use crate::frame::Frame;
use crate::source::{FrameSource, SourceError};
use ffmpeg_next::format::Pixel;
use ffmpeg_next::software::scaling;
use ffmpeg_next::util::frame::video::Video;
use std::path::{Path, PathBuf};
use thiserror::Error;
use vigil_core::recording::{FramePixels, RecordingError, VideoWriter, WriterFactory};

/// Socket read/connect timeout for network inputs, in microseconds.
const NETWORK_TIMEOUT_US: &str = "5000000";

#[derive(Error, Debug)]
pub enum VideoError {
    #[error("ffmpeg: {0}")]
    Ffmpeg(#[from] ffmpeg_next::Error),
    #[error("no video stream in {0}")]
    NoVideoStream(String),
    #[error("{0} encoder not available")]
    EncoderMissing(&'static str),
}

impl From<VideoError> for RecordingError {
    fn from(e: VideoError) -> Self {
        RecordingError::Encode(e.to_string())
    }
}

fn is_network(location: &str) -> bool {
    location.contains("://") && !location.starts_with("file://")
}

/// Pack one plane into a tight buffer, dropping row padding.
fn packed_plane(frame: &Video, row_bytes: usize, rows: usize) -> Vec<u8> {
    let stride = frame.stride(0);
    let data = frame.data(0);
    let mut out = Vec::with_capacity(row_bytes * rows);
    for row in 0..rows {
        let start = row * stride;
        out.extend_from_slice(&data[start..start + row_bytes]);
    }
    out
}

/// Conversions from the decoder's native format, rebuilt if the stream
/// changes size or format mid-way.
struct Converters {
    format: Pixel,
    width: u32,
    height: u32,
    luma: scaling::Context,
    rgb: scaling::Context,
}

impl Converters {
    fn new(format: Pixel, width: u32, height: u32) -> Result<Self, VideoError> {
        let to = |dst| scaling::Context::get(format, width, height, dst, width, height, scaling::Flags::BILINEAR);
        Ok(Self {
            format,
            width,
            height,
            luma: to(Pixel::GRAY8)?,
            rgb: to(Pixel::RGB24)?,
        })
    }

    fn matches(&self, frame: &Video) -> bool {
        self.format == frame.format() && self.width == frame.width() && self.height == frame.height()
    }
}

/// Decoding input opened by URL or path.
pub struct VideoSource {
    location: String,
    input: ffmpeg_next::format::context::Input,
    decoder: ffmpeg_next::decoder::Video,
    stream_index: usize,
    converters: Option<Converters>,
    flushing: bool,
    next_sequence: u64,
}

// Safety: VideoSource is owned by one pipeline and used from one thread at a
// time. The raw pointers inside ffmpeg types are never shared.
unsafe impl Send for VideoSource {}

impl VideoSource {
    pub fn open(location: &str) -> Result<Self, VideoError> {
        ffmpeg_next::init()?;

        let mut options = ffmpeg_next::Dictionary::new();
        if is_network(location) {
            ffmpeg_next::format::network::init();
            options.set("rw_timeout", NETWORK_TIMEOUT_US);
            if location.starts_with("rtsp://") {
                options.set("rtsp_transport", "tcp");
            }
        }
        let input = ffmpeg_next::format::input_with_dictionary(location, options)?;

        let stream = input
            .streams()
            .best(ffmpeg_next::media::Type::Video)
            .ok_or_else(|| VideoError::NoVideoStream(location.to_string()))?;
        let stream_index = stream.index();
        let codec_ctx = ffmpeg_next::codec::context::Context::from_parameters(stream.parameters())?;
        let decoder = codec_ctx.decoder().video()?;

        tracing::info!(
            source = location,
            width = decoder.width(),
            height = decoder.height(),
            codec = decoder.codec().map(|c| c.name().to_string()).unwrap_or_default(),
            "opened video input"
        );

        Ok(Self {
            location: location.to_string(),
            input,
            decoder,
            stream_index,
            converters: None,
            flushing: false,
            next_sequence: 0,
        })
    }

    /// Next decoded picture in the stream's native format.
    fn decode_next(&mut self) -> Result<Option<Video>, VideoError> {
        let mut decoded = Video::empty();
        loop {
            if self.decoder.receive_frame(&mut decoded).is_ok() {
                return Ok(Some(decoded));
            }
            if self.flushing {
                return Ok(None);
            }
            match self.input.packets().next() {
                Some((stream, packet)) => {
                    if stream.index() != self.stream_index {
                        continue;
                    }
                    if let Err(e) = self.decoder.send_packet(&packet) {
                        tracing::debug!(source = %self.location, error = %e, "packet rejected by decoder");
                    }
                }
                None => {
                    self.decoder.send_eof()?;
                    self.flushing = true;
                }
            }
        }
    }

    fn convert(&mut self, decoded: &Video) -> Result<Frame, VideoError> {
        let conv = match self.converters.take() {
            Some(c) if c.matches(decoded) => c,
            _ => Converters::new(decoded.format(), decoded.width(), decoded.height())?,
        };
        let conv = self.converters.insert(conv);

        let mut luma = Video::empty();
        conv.luma.run(decoded, &mut luma)?;
        let mut rgb = Video::empty();
        conv.rgb.run(decoded, &mut rgb)?;

        let (width, height) = (conv.width, conv.height);
        let (w, h) = (width as usize, height as usize);
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        Ok(Frame::new(packed_plane(&luma, w, h), width, height, sequence).with_color(packed_plane(&rgb, w * 3, h)))
    }
}

impl FrameSource for VideoSource {
    fn next_frame(&mut self) -> Result<Option<Frame>, SourceError> {
        match self.decode_next()? {
            Some(decoded) => Ok(Some(self.convert(&decoded)?)),
            None => Ok(None),
        }
    }

    fn describe(&self) -> String {
        format!("video {}", self.location)
    }
}

/// MPEG-4 encoder writing one recording.
pub struct VideoFileWriter {
    path: PathBuf,
    output: ffmpeg_next::format::context::Output,
    encoder: ffmpeg_next::codec::encoder::video::Encoder,
    stream_index: usize,
    /// Scaler into the encoder's YUV420P, keyed by input format.
    scaler: Option<(Pixel, scaling::Context)>,
    width: u32,
    height: u32,
    encoded_width: u32,
    encoded_height: u32,
    fps: i32,
    stream_time_base: ffmpeg_next::Rational,
    next_pts: i64,
}

// Safety: see VideoSource.
unsafe impl Send for VideoFileWriter {}

impl VideoFileWriter {
    /// Open `path` for `width`x`height` input frames. YUV 4:2:0 needs even
    /// dimensions, so odd sizes are encoded one pixel smaller.
    pub fn create(path: &Path, width: u32, height: u32, fps: u32) -> Result<Self, RecordingError> {
        let (encoded_width, encoded_height) = (width & !1, height & !1);
        if encoded_width == 0 || encoded_height == 0 {
            return Err(RecordingError::BadDimensions { width, height });
        }
        let fps = i32::try_from(fps).ok().filter(|f| *f > 0).unwrap_or(30);
        Ok(Self::open(path, width, height, encoded_width, encoded_height, fps)?)
    }

    fn open(
        path: &Path,
        width: u32,
        height: u32,
        encoded_width: u32,
        encoded_height: u32,
        fps: i32,
    ) -> Result<Self, VideoError> {
        ffmpeg_next::init()?;

        let mut output = ffmpeg_next::format::output(path)?;
        let global_header = output
            .format()
            .flags()
            .contains(ffmpeg_next::format::Flags::GLOBAL_HEADER);

        let codec = ffmpeg_next::encoder::find(ffmpeg_next::codec::Id::MPEG4)
            .ok_or(VideoError::EncoderMissing("MPEG-4"))?;
        let mut stream = output.add_stream(Some(codec))?;
        let stream_index = stream.index();

        let mut encoder_ctx = ffmpeg_next::codec::context::Context::new_with_codec(codec)
            .encoder()
            .video()?;
        encoder_ctx.set_width(encoded_width);
        encoder_ctx.set_height(encoded_height);
        encoder_ctx.set_format(Pixel::YUV420P);
        encoder_ctx.set_time_base(ffmpeg_next::Rational(1, fps));
        encoder_ctx.set_frame_rate(Some(ffmpeg_next::Rational(fps, 1)));
        if global_header {
            encoder_ctx.set_flags(ffmpeg_next::codec::Flags::GLOBAL_HEADER);
        }

        let encoder = encoder_ctx.open_with(ffmpeg_next::Dictionary::new())?;
        stream.set_parameters(&encoder);

        output.write_header()?;
        // The muxer may pick its own time base during write_header.
        let stream_time_base = output
            .stream(stream_index)
            .map(|s| s.time_base())
            .unwrap_or(ffmpeg_next::Rational(1, fps));

        Ok(Self {
            path: path.to_path_buf(),
            output,
            encoder,
            stream_index,
            scaler: None,
            width,
            height,
            encoded_width,
            encoded_height,
            fps,
            stream_time_base,
            next_pts: 0,
        })
    }

    fn scaler_for(&mut self, format: Pixel) -> Result<&mut scaling::Context, VideoError> {
        let ctx = match self.scaler.take() {
            Some((f, ctx)) if f == format => ctx,
            _ => scaling::Context::get(
                format,
                self.width,
                self.height,
                Pixel::YUV420P,
                self.encoded_width,
                self.encoded_height,
                scaling::Flags::BILINEAR,
            )?,
        };
        Ok(&mut self.scaler.insert((format, ctx)).1)
    }

    fn write_packets(&mut self) -> Result<(), VideoError> {
        let mut packet = ffmpeg_next::Packet::empty();
        while self.encoder.receive_packet(&mut packet).is_ok() {
            packet.set_stream(self.stream_index);
            packet.rescale_ts(ffmpeg_next::Rational(1, self.fps), self.stream_time_base);
            packet.write_interleaved(&mut self.output)?;
        }
        Ok(())
    }

    fn encode(&mut self, format: Pixel, bytes_per_pixel: usize, data: &[u8]) -> Result<(), RecordingError> {
        let row_bytes = self.width as usize * bytes_per_pixel;
        let expected = row_bytes * self.height as usize;
        if data.len() < expected {
            return Err(RecordingError::FrameSize {
                expected,
                got: data.len(),
            });
        }

        let mut input = Video::new(format, self.width, self.height);
        let stride = input.stride(0);
        let plane = input.data_mut(0);
        for (row, src) in data[..expected].chunks_exact(row_bytes).enumerate() {
            let start = row * stride;
            plane[start..start + row_bytes].copy_from_slice(src);
        }

        let mut yuv = Video::empty();
        self.scaler_for(format)?
            .run(&input, &mut yuv)
            .map_err(VideoError::from)?;
        yuv.set_pts(Some(self.next_pts));
        self.next_pts += 1;

        self.encoder.send_frame(&yuv).map_err(VideoError::from)?;
        Ok(self.write_packets()?)
    }

    fn close(mut self) -> Result<(), VideoError> {
        self.encoder.send_eof()?;
        self.write_packets()?;
        self.output.write_trailer()?;
        tracing::debug!(path = %self.path.display(), frames = self.next_pts, "video encoder flushed");
        Ok(())
    }
}

impl VideoWriter for VideoFileWriter {
    fn write_frame(&mut self, pixels: FramePixels<'_>) -> Result<(), RecordingError> {
        match pixels {
            FramePixels::Gray(luma) => self.encode(Pixel::GRAY8, 1, luma),
            FramePixels::Rgb(rgb) => self.encode(Pixel::RGB24, 3, rgb),
        }
    }

    fn finish(self: Box<Self>) -> Result<(), RecordingError> {
        Ok((*self).close()?)
    }
}

/// Recordings as MPEG-4 video in an `.mp4` container.
#[derive(Debug, Clone, Copy, Default)]
pub struct Mp4WriterFactory;

impl WriterFactory for Mp4WriterFactory {
    fn extension(&self) -> &str {
        "mp4"
    }

    fn open(&self, path: &Path, width: u32, height: u32, fps: u32) -> Result<Box<dyn VideoWriter>, RecordingError> {
        Ok(Box::new(VideoFileWriter::create(path, width, height, fps)?))
    }
}


#[cfg(test)]
mod tests {
    use super::testing::solid_clip;
    use super::*;

    fn mean(data: &[u8]) -> f64 {
        data.iter().map(|&b| f64::from(b)).sum::<f64>() / data.len() as f64
    }

    #[test]
    fn test_decodes_written_clip_with_color() {
        let dir = tempfile::tempdir().unwrap();
        let path = solid_clip(dir.path(), 64, 48, 5, 128);

        let mut src = VideoSource::open(path.to_str().unwrap()).unwrap();
        let mut frames = Vec::new();
        while let Some(frame) = src.next_frame().unwrap() {
            frames.push(frame);
        }

        assert_eq!(frames.len(), 5);
        let first = &frames[0];
        assert_eq!((first.width, first.height), (64, 48));
        assert_eq!(first.data.len(), 64 * 48);
        assert_eq!(first.color.as_ref().unwrap().len(), 64 * 48 * 3);
        // Lossy codec: mid-gray stays near mid-gray.
        assert!((mean(&first.data) - 128.0).abs() < 12.0);
        assert_eq!(frames[4].sequence, 4);
    }

    #[test]
    fn test_gray_input_encodes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gray.mp4");
        let mut writer = Box::new(VideoFileWriter::create(&path, 32, 32, 10).unwrap());
        writer.write_frame(FramePixels::Gray(&[200; 32 * 32])).unwrap();
        writer.finish().unwrap();
        assert!(std::fs::metadata(&path).unwrap().len() > 0);
    }

    #[test]
    fn test_odd_size_encodes_even() {
        let dir = tempfile::tempdir().unwrap();
        let path = solid_clip(dir.path(), 33, 25, 2, 60);
        let src = VideoSource::open(path.to_str().unwrap()).unwrap();
        assert_eq!((src.decoder.width(), src.decoder.height()), (32, 24));
    }

    #[test]
    fn test_short_frame_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = VideoFileWriter::create(&dir.path().join("x.mp4"), 16, 16, 10).unwrap();
        let err = writer.write_frame(FramePixels::Rgb(&[0; 10])).unwrap_err();
        assert!(matches!(err, RecordingError::FrameSize { expected: 768, got: 10 }));
    }

    #[test]
    fn test_degenerate_size_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = VideoFileWriter::create(&dir.path().join("x.mp4"), 1, 480, 10).err().unwrap();
        assert!(matches!(err, RecordingError::BadDimensions { .. }));
    }

    #[test]
    fn test_missing_file_fails() {
        assert!(matches!(VideoSource::open("/nonexistent/clip.mp4"), Err(VideoError::Ffmpeg(_))));
    }

    #[test]
    fn test_factory_extension() {
        assert_eq!(Mp4WriterFactory.extension(), "mp4");
    }

    #[test]
    fn test_network_detection() {
        assert!(is_network("rtsp://10.0.0.5/stream"));
        assert!(is_network("http://cam.local/mjpg"));
        assert!(!is_network("file:///tmp/a.mp4"));
        assert!(!is_network("/tmp/a.mp4"));
    }
}
