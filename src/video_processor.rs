//! Video Processing Module
//!
//! Turns one input (a video file, a webcam or a live stream URL) into a lazy
//! sequence of RGB frames using the ffmpeg-next crate.

use crate::error::ConfigError;
use crate::frame::{Frame, RgbFrame};
use anyhow::{Context, Result, anyhow};
use ffmpeg::format::{Pixel, input};
use ffmpeg::media::Type;
use ffmpeg::software::scaling::{Context as ScalingContext, flag::Flags};
use ffmpeg::util::frame::video::Video;
use ffmpeg_next as ffmpeg;
use image::ImageBuffer;
use log::{info, warn};
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};

/// A lazy cursor over the frames of a single input.
///
/// The native handle is acquired on the first call to `next_frame` and
/// released once the sequence ends or `close` is called.
pub trait FrameSource {
    fn source_id(&self) -> &str;

    /// Native frames-per-second of the input, if known.
    fn fps(&self) -> Option<f64>;

    /// Returns the next frame, or `None` once the input is exhausted.
    fn next_frame(&mut self) -> Option<Frame>;

    fn close(&mut self);

    /// Why the input could not be opened, if it could not.
    fn failure(&self) -> Option<&str> {
        None
    }
}

/// What to read frames from.
#[derive(Debug, Clone, PartialEq)]
pub enum InputSpec {
    File(PathBuf),
    Webcam(u32),
    LiveStream { url: String, resolution: String },
}

impl InputSpec {
    pub fn source_id(&self) -> String {
        match self {
            InputSpec::File(path) => path.display().to_string(),
            InputSpec::Webcam(id) => format!("webcam-{}", id),
            InputSpec::LiveStream { url, .. } => url.clone(),
        }
    }

    /// Basename without extension for files, a fixed word otherwise.
    pub fn input_name(&self) -> String {
        match self {
            InputSpec::File(path) => path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "frame".to_string()),
            InputSpec::Webcam(_) => "webcam".to_string(),
            InputSpec::LiveStream { .. } => "live".to_string(),
        }
    }

    pub fn default_prefix(&self) -> String {
        format!("{}-", self.input_name())
    }
}

/// Expands glob patterns and list files into the video files to read.
///
/// Plain paths are kept even if they do not exist; opening them fails later
/// and only affects that one input.
pub fn locate_inputs(patterns: &[String], list_files: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut inputs = Vec::new();

    for pattern in patterns {
        if pattern.contains(['*', '?', '[']) {
            let matches = glob::glob(pattern)
                .with_context(|| format!("Invalid glob pattern: {}", pattern))?;
            let mut found: Vec<PathBuf> = matches.filter_map(|entry| entry.ok()).collect();
            found.sort();
            if found.is_empty() {
                warn!("Glob pattern matched no files: {}", pattern);
            }
            inputs.extend(found);
        } else {
            inputs.push(PathBuf::from(pattern));
        }
    }

    for list in list_files {
        let content = fs::read_to_string(list)
            .with_context(|| format!("Failed to read input list {:?}", list))?;
        inputs.extend(
            content
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(PathBuf::from),
        );
    }

    if inputs.is_empty() {
        let mut described: Vec<String> = patterns.to_vec();
        described.extend(list_files.iter().map(|p| p.display().to_string()));
        return Err(ConfigError::NoInputs(described.join(", ")).into());
    }
    Ok(inputs)
}

/// Attempts to get the total number of frames from video metadata.
///
/// This function is much faster than decoding the whole video, but the
/// result can be an estimate for variable frame rate (VFR) videos.
pub fn get_frame_count(path: &Path) -> Result<u64> {
    ffmpeg::init().context("Failed to initialize FFmpeg")?;
    let ictx = input(path).context("Failed to open input file for frame count")?;
    let stream = ictx
        .streams()
        .best(Type::Video)
        .ok_or_else(|| anyhow!("Could not find video stream in file"))?;

    let frame_count = stream.frames();
    if frame_count > 0 {
        return Ok(frame_count as u64);
    }

    // Fallback: Calculate from duration and average frame rate
    let duration = ictx.duration();
    match rational_fps(stream.avg_frame_rate()) {
        Some(fps) if duration > 0 => {
            // Duration is in AV_TIME_BASE units (microseconds)
            let duration_secs = duration as f64 / 1_000_000.0;
            Ok((duration_secs * fps).round() as u64)
        }
        _ => Err(anyhow!("Could not determine frame count from video metadata")),
    }
}

fn rational_fps(rate: ffmpeg::Rational) -> Option<f64> {
    if rate.0 > 0 && rate.1 > 0 {
        Some(rate.0 as f64 / rate.1 as f64)
    } else {
        None
    }
}

enum SourceState {
    Pending,
    Open(Box<Decoding>),
    Closed,
}

/// Frame source backed by libavformat/libavcodec.
pub struct FfmpegSource {
    spec: InputSpec,
    source_id: String,
    state: SourceState,
    fps: Option<f64>,
    frame_no: u64,
    failure: Option<String>,
}

impl FfmpegSource {
    pub fn new(spec: InputSpec) -> Self {
        FfmpegSource {
            source_id: spec.source_id(),
            spec,
            state: SourceState::Pending,
            fps: None,
            frame_no: 0,
            failure: None,
        }
    }

    fn open(&mut self) -> Result<Decoding> {
        ffmpeg::init().context("Failed to initialize FFmpeg")?;

        let ictx = match &self.spec {
            InputSpec::File(path) => {
                input(path).with_context(|| format!("Failed to open input file {:?}", path))?
            }
            InputSpec::Webcam(id) => open_webcam(*id)?,
            InputSpec::LiveStream { url, .. } => {
                input(url).with_context(|| format!("Failed to open live stream {}", url))?
            }
        };

        let stream_index = match &self.spec {
            InputSpec::LiveStream { resolution, .. } => select_stream(&ictx, resolution)?,
            _ => ictx
                .streams()
                .best(Type::Video)
                .context("Could not find video stream")?
                .index(),
        };
        let stream = ictx
            .stream(stream_index)
            .context("Selected video stream disappeared")?;

        self.fps = rational_fps(stream.avg_frame_rate());
        match self.fps {
            Some(fps) => info!("fps: {:.3}", fps),
            None => info!("fps: unknown"),
        }

        let context_decoder = ffmpeg::codec::context::Context::from_parameters(stream.parameters())
            .context("Failed to create decoder context")?;
        let decoder = context_decoder
            .decoder()
            .video()
            .context("Failed to create video decoder")?;

        Ok(Decoding {
            ictx,
            decoder,
            scaler: None,
            stream_index,
            eof_sent: false,
        })
    }
}

impl FrameSource for FfmpegSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn fps(&self) -> Option<f64> {
        self.fps
    }

    fn next_frame(&mut self) -> Option<Frame> {
        if let SourceState::Pending = self.state {
            info!("Reading from: {}", self.source_id);
            match self.open() {
                Ok(decoding) => self.state = SourceState::Open(Box::new(decoding)),
                Err(e) => {
                    warn!("Could not open {}: {:#}", self.source_id, e);
                    self.failure = Some(format!("{:#}", e));
                    self.state = SourceState::Closed;
                    return None;
                }
            }
        }

        let next = match &mut self.state {
            SourceState::Open(decoding) => decoding.next_image(),
            _ => return None,
        };

        match next {
            Ok(Some(img)) => {
                self.frame_no += 1;
                Some(Frame::new(self.frame_no, img, &self.source_id))
            }
            Ok(None) => {
                info!("Finished reading {} frames from {}.", self.frame_no, self.source_id);
                self.close();
                None
            }
            Err(e) => {
                info!(
                    "Failed to read frame {} from {}, ending input: {:#}",
                    self.frame_no + 1,
                    self.source_id,
                    e
                );
                self.close();
                None
            }
        }
    }

    fn close(&mut self) {
        // Dropping the decoding state releases the demuxer and decoder.
        self.state = SourceState::Closed;
    }

    fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }
}

struct Decoding {
    ictx: ffmpeg::format::context::Input,
    decoder: ffmpeg::decoder::Video,
    scaler: Option<(ScalingContext, Pixel, u32, u32)>,
    stream_index: usize,
    eof_sent: bool,
}

impl Decoding {
    /// Pulls packets until the decoder yields a frame or the input ends.
    fn next_image(&mut self) -> Result<Option<RgbFrame>> {
        let mut decoded = Video::empty();
        loop {
            if self.decoder.receive_frame(&mut decoded).is_ok() {
                return self.to_rgb(&decoded).map(Some);
            }
            if self.eof_sent {
                return Ok(None);
            }

            let mut packet = ffmpeg::Packet::empty();
            match packet.read(&mut self.ictx) {
                Ok(()) => {
                    if packet.stream() == self.stream_index {
                        self.decoder
                            .send_packet(&packet)
                            .context("Failed to send packet to decoder")?;
                    }
                }
                Err(ffmpeg::Error::Eof) => {
                    self.decoder.send_eof().context("Failed to flush decoder")?;
                    self.eof_sent = true;
                }
                Err(e) => return Err(e).context("Failed to read packet"),
            }
        }
    }

    fn to_rgb(&mut self, decoded: &Video) -> Result<RgbFrame> {
        let (format, width, height) = (decoded.format(), decoded.width(), decoded.height());

        // Live streams may switch resolution mid-stream.
        let stale = match &self.scaler {
            Some((_, f, w, h)) => *f != format || *w != width || *h != height,
            None => true,
        };
        if stale {
            let scaler = ScalingContext::get(
                format,
                width,
                height,
                Pixel::RGB24,
                width,
                height,
                Flags::BILINEAR,
            )
            .context("Failed to create scaler")?;
            self.scaler = Some((scaler, format, width, height));
        }

        let mut rgb_frame = Video::empty();
        if let Some((scaler, ..)) = self.scaler.as_mut() {
            scaler.run(decoded, &mut rgb_frame).context("Scaler failed")?;
        }
        copy_rgb_plane(&rgb_frame)
    }
}

/// Copies a packed RGB24 plane into an image buffer, dropping row padding.
pub(crate) fn copy_rgb_plane(rgb_frame: &Video) -> Result<RgbFrame> {
    let frame_data = rgb_frame.data(0);
    let width = rgb_frame.width() as usize;
    let height = rgb_frame.height() as usize;
    let stride = rgb_frame.stride(0);

    if stride == 0 {
        return Err(anyhow!("Invalid frame stride"));
    }

    let mut pixels = Vec::with_capacity(width * height * 3);
    for y in 0..height {
        let start_index = y * stride;
        let end_index = start_index + (width * 3);
        if end_index > frame_data.len() {
            return Err(anyhow!("Frame data is smaller than expected"));
        }
        pixels.extend_from_slice(&frame_data[start_index..end_index]);
    }

    ImageBuffer::from_vec(width as u32, height as u32, pixels)
        .context("Failed to create image buffer from frame data")
}

/// Picks the video stream matching a resolution label such as `480p` or `best`.
fn select_stream(ictx: &ffmpeg::format::context::Input, resolution: &str) -> Result<usize> {
    let mut candidates: Vec<(usize, u32)> = Vec::new();
    for stream in ictx.streams() {
        if stream.parameters().medium() != Type::Video {
            continue;
        }
        let height = ffmpeg::codec::context::Context::from_parameters(stream.parameters())
            .ok()
            .and_then(|ctx| ctx.decoder().video().ok())
            .map(|decoder| decoder.height())
            .unwrap_or(0);
        candidates.push((stream.index(), height));
    }

    let best = candidates
        .iter()
        .max_by_key(|(_, height)| *height)
        .map(|(index, _)| *index)
        .context("Could not find video stream")?;

    if resolution.eq_ignore_ascii_case("best") {
        return Ok(best);
    }

    let wanted = resolution
        .trim_end_matches(['p', 'P'])
        .parse::<u32>()
        .ok();
    match wanted.and_then(|h| candidates.iter().find(|(_, height)| *height == h)) {
        Some((index, _)) => Ok(*index),
        None => {
            warn!("Resolution '{}' not available, using best instead.", resolution);
            Ok(best)
        }
    }
}

fn open_webcam(id: u32) -> Result<ffmpeg::format::context::Input> {
    ffmpeg::device::register_all();

    let (format_name, device) = if cfg!(target_os = "macos") {
        ("avfoundation", id.to_string())
    } else if cfg!(target_os = "windows") {
        ("dshow", format!("video={}", id))
    } else {
        ("video4linux2", format!("/dev/video{}", id))
    };

    let format = ffmpeg::device::input::video()
        .find(|f| f.name().split(',').any(|name| name == format_name))
        .ok_or_else(|| anyhow!("Capture device format '{}' is not available", format_name))?;

    let ctx = ffmpeg::format::open_with(&device, &format, ffmpeg::Dictionary::new())
        .with_context(|| format!("Failed to open webcam {}", device))?;

    match ctx {
        ffmpeg::format::context::Context::Input(ictx) => Ok(ictx),
        ffmpeg::format::context::Context::Output(_) => {
            Err(anyhow!("Webcam {} did not open as an input", device))
        }
    }
}

/// In-memory frame source, for frames that are already decoded.
pub struct MemorySource {
    source_id: String,
    fps: Option<f64>,
    images: VecDeque<RgbFrame>,
    frame_no: u64,
    opened: bool,
    closed: bool,
}

impl MemorySource {
    pub fn new(source_id: &str, fps: Option<f64>, images: Vec<RgbFrame>) -> Self {
        MemorySource {
            source_id: source_id.to_string(),
            fps,
            images: images.into(),
            frame_no: 0,
            opened: false,
            closed: false,
        }
    }

    pub fn is_opened(&self) -> bool {
        self.opened
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl FrameSource for MemorySource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn fps(&self) -> Option<f64> {
        self.fps
    }

    fn next_frame(&mut self) -> Option<Frame> {
        if self.closed {
            return None;
        }
        self.opened = true;
        match self.images.pop_front() {
            Some(img) => {
                self.frame_no += 1;
                Some(Frame::new(self.frame_no, img, &self.source_id))
            }
            None => {
                self.close();
                None
            }
        }
    }

    fn close(&mut self) {
        self.closed = true;
        self.images.clear();
    }
}
