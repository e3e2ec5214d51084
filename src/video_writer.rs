//! Video Writer Module
//!
//! Sinks for the frames that survive the filters: an MJPEG video encoder
//! built on ffmpeg-next, and a plain directory of still images.

use crate::frame::{Frame, RgbFrame};
use anyhow::{Context, Result, anyhow};
use ffmpeg::format::Pixel;
use ffmpeg::software::scaling::{Context as ScalingContext, flag::Flags};
use ffmpeg::util::frame::video::Video;
use ffmpeg_next as ffmpeg;
use log::{debug, info, warn};
use std::fs;
use std::path::{Path, PathBuf};

/// Placeholder in output paths that expands to the current input's name.
pub const INPUT_PLACEHOLDER: &str = "{input}";

pub const DEFAULT_FPS: i32 = 25;

pub trait FrameSink {
    fn write_frame(&mut self, frame: &Frame) -> Result<()>;

    /// Flushes and releases whatever the sink holds open.
    fn finish(&mut self) -> Result<()>;

    fn frames_written(&self) -> u64;
}

/// Expands `{input}` with the basename (sans extension) of the frame's source.
pub fn resolve_output_path(template: &str, source_id: &str) -> PathBuf {
    if !template.contains(INPUT_PLACEHOLDER) {
        return PathBuf::from(template);
    }
    let input_name = Path::new(source_id)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| source_id.to_string());
    PathBuf::from(template.replace(INPUT_PLACEHOLDER, &input_name))
}

/// Encodes frames as MJPEG at a fixed frame rate.
///
/// The container is opened on the first frame and sized after it. When the
/// resolved output path changes, the current file is finalized and a new
/// one started.
pub struct VideoSink {
    template: String,
    fps: i32,
    current: Option<Encoding>,
    frames_written: u64,
}

impl VideoSink {
    pub fn new(template: &str, fps: i32) -> Self {
        VideoSink {
            template: template.to_string(),
            fps,
            current: None,
            frames_written: 0,
        }
    }

    fn finish_current(&mut self) {
        if let Some(encoding) = self.current.take() {
            let path = encoding.path.clone();
            let frames = encoding.frames;
            match encoding.finish() {
                Ok(()) => info!("Wrote {} frames to {:?}", frames, path),
                Err(e) => warn!("Failed to finalize video {:?}: {:#}", path, e),
            }
        }
    }
}

impl FrameSink for VideoSink {
    fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        let path = resolve_output_path(&self.template, &frame.source_id);

        if self.current.as_ref().is_some_and(|enc| enc.path != path) {
            self.finish_current();
        }
        if self.current.is_none() {
            info!(
                "Opening video {:?} ({}x{} @ {} fps)",
                path,
                frame.width(),
                frame.height(),
                self.fps
            );
            self.current = Some(Encoding::open(path, frame.width(), frame.height(), self.fps)?);
        }

        if let Some(encoding) = self.current.as_mut() {
            encoding
                .encode(&frame.image)
                .with_context(|| format!("Failed to encode frame {}", frame.name))?;
            self.frames_written += 1;
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.finish_current();
        Ok(())
    }

    fn frames_written(&self) -> u64 {
        self.frames_written
    }
}

impl Drop for VideoSink {
    fn drop(&mut self) {
        self.finish_current();
    }
}

struct Encoding {
    path: PathBuf,
    octx: ffmpeg::format::context::Output,
    encoder: ffmpeg::encoder::video::Encoder,
    scaler: Option<(ScalingContext, u32, u32)>,
    stream_index: usize,
    time_base: ffmpeg::Rational,
    stream_time_base: ffmpeg::Rational,
    width: u32,
    height: u32,
    frames: u64,
}

impl Encoding {
    fn open(path: PathBuf, width: u32, height: u32, fps: i32) -> Result<Self> {
        ffmpeg::init().context("Failed to initialize FFmpeg")?;

        if let Some(parent_dir) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent_dir).context("Failed to create video parent directory")?;
        }

        let mut octx = ffmpeg::format::output(&path)
            .with_context(|| format!("Failed to create output file {:?}", path))?;
        let codec = ffmpeg::encoder::find(ffmpeg::codec::Id::MJPEG)
            .ok_or_else(|| anyhow!("MJPEG encoder is not available"))?;
        let global_header = octx
            .format()
            .flags()
            .contains(ffmpeg::format::Flags::GLOBAL_HEADER);

        let time_base = ffmpeg::Rational(1, fps);
        let mut encoder = ffmpeg::codec::context::Context::new_with_codec(codec)
            .encoder()
            .video()
            .context("Failed to create video encoder")?;
        encoder.set_width(width);
        encoder.set_height(height);
        encoder.set_format(Pixel::YUVJ420P);
        encoder.set_time_base(time_base);
        encoder.set_frame_rate(Some(ffmpeg::Rational(fps, 1)));
        if global_header {
            encoder.set_flags(ffmpeg::codec::Flags::GLOBAL_HEADER);
        }
        let encoder = encoder
            .open_as(codec)
            .context("Failed to open MJPEG encoder")?;

        let stream_index = {
            let mut ost = octx.add_stream(codec).context("Failed to add video stream")?;
            ost.set_parameters(&encoder);
            ost.set_time_base(time_base);
            ost.index()
        };

        octx.write_header().context("Failed to write container header")?;
        let stream_time_base = octx
            .stream(stream_index)
            .context("Output stream disappeared")?
            .time_base();

        Ok(Encoding {
            path,
            octx,
            encoder,
            scaler: None,
            stream_index,
            time_base,
            stream_time_base,
            width,
            height,
            frames: 0,
        })
    }

    fn encode(&mut self, image: &RgbFrame) -> Result<()> {
        let (src_width, src_height) = image.dimensions();

        // Frames of a different size are rescaled to the size the file was opened with.
        if !matches!(&self.scaler, Some((_, w, h)) if *w == src_width && *h == src_height) {
            if (src_width, src_height) != (self.width, self.height) {
                debug!(
                    "Rescaling {}x{} frame to {}x{}",
                    src_width, src_height, self.width, self.height
                );
            }
            let scaler = ScalingContext::get(
                Pixel::RGB24,
                src_width,
                src_height,
                Pixel::YUVJ420P,
                self.width,
                self.height,
                Flags::BILINEAR,
            )
            .context("Failed to create scaler")?;
            self.scaler = Some((scaler, src_width, src_height));
        }

        let mut rgb_frame = Video::new(Pixel::RGB24, src_width, src_height);
        let stride = rgb_frame.stride(0);
        let row_len = src_width as usize * 3;
        let raw = image.as_raw();
        let plane = rgb_frame.data_mut(0);
        for (y, row) in raw.chunks_exact(row_len).enumerate() {
            plane[y * stride..y * stride + row_len].copy_from_slice(row);
        }

        let mut yuv_frame = Video::empty();
        if let Some((scaler, ..)) = self.scaler.as_mut() {
            scaler.run(&rgb_frame, &mut yuv_frame).context("Scaler failed")?;
        }
        yuv_frame.set_pts(Some(self.frames as i64));

        self.encoder
            .send_frame(&yuv_frame)
            .context("Failed to send frame to encoder")?;
        self.write_packets()?;
        self.frames += 1;
        Ok(())
    }

    fn write_packets(&mut self) -> Result<()> {
        let mut packet = ffmpeg::Packet::empty();
        while self.encoder.receive_packet(&mut packet).is_ok() {
            packet.set_stream(self.stream_index);
            packet.rescale_ts(self.time_base, self.stream_time_base);
            packet
                .write_interleaved(&mut self.octx)
                .context("Failed to write packet")?;
        }
        Ok(())
    }

    fn finish(mut self) -> Result<()> {
        self.encoder.send_eof().context("Failed to flush encoder")?;
        self.write_packets()?;
        self.octx
            .write_trailer()
            .context("Failed to write container trailer")?;
        Ok(())
    }
}

/// Still image format used by `ImageSink`.
#[derive(clap::ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ImageFormat {
    #[default]
    Jpg,
    Png,
}

impl ImageFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ImageFormat::Jpg => "jpg",
            ImageFormat::Png => "png",
        }
    }
}

/// Saves every frame as `<dir>/<frame name>.<ext>`.
pub struct ImageSink {
    output_dir: PathBuf,
    format: ImageFormat,
    frames_written: u64,
}

impl ImageSink {
    pub fn new(output_dir: &Path, format: ImageFormat) -> Self {
        ImageSink {
            output_dir: output_dir.to_path_buf(),
            format,
            frames_written: 0,
        }
    }
}

impl FrameSink for ImageSink {
    fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        if self.frames_written == 0 {
            fs::create_dir_all(&self.output_dir).context("Failed to create output directory")?;
        }
        let frame_path = self
            .output_dir
            .join(format!("{}.{}", frame.name, self.format.extension()));
        frame
            .image
            .save(&frame_path)
            .with_context(|| format!("Failed to save frame to {:?}", frame_path))?;
        self.frames_written += 1;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        if self.frames_written > 0 {
            info!(
                "Saved {} frames to {:?}",
                self.frames_written, self.output_dir
            );
        }
        Ok(())
    }

    fn frames_written(&self) -> u64 {
        self.frames_written
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_path_without_placeholder_is_fixed() {
        assert_eq!(
            resolve_output_path("out/all.avi", "/videos/a.mp4"),
            PathBuf::from("out/all.avi")
        );
    }

    #[test]
    fn placeholder_expands_to_input_name() {
        assert_eq!(
            resolve_output_path("out/{input}-sifted.avi", "/videos/lecture.mp4"),
            PathBuf::from("out/lecture-sifted.avi")
        );
        assert_eq!(
            resolve_output_path("{input}.avi", "webcam-0"),
            PathBuf::from("webcam-0.avi")
        );
    }

    #[test]
    fn image_formats_have_extensions() {
        assert_eq!(ImageFormat::Jpg.extension(), "jpg");
        assert_eq!(ImageFormat::Png.extension(), "png");
    }
}
