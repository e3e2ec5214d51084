//! FrameSift - Core Library
//!
//! Reads video from files, webcams or live streams, samples the frames,
//! drops the ones that barely differ from what was already kept, and hands
//! the rest to a video encoder, an image directory or a change histogram.

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub mod change_detector;
pub mod change_stats;
pub mod error;
pub mod frame;
pub mod label_filter;
pub mod sampler;
pub mod video_processor;
pub mod video_writer;

use change_detector::{ChangeDetectionConfig, SkipSimilarFrames};
use change_stats::{ChangeStatsAggregator, ReportFormat};
use error::ConfigError;
use label_filter::{AnnotatedFrame, LabelFilter, LabelFilterConfig};
use sampler::{DropFrames, FrameSampler, SamplingPolicy};
use video_processor::{FfmpegSource, FrameSource, InputSpec, locate_inputs};
use video_writer::{FrameSink, ImageFormat, ImageSink, VideoSink};

/// Where frames come from. Exactly one kind of source must be selected.
#[derive(Debug, Clone, Default)]
pub struct SourceConfig {
    /// Video file paths or glob patterns.
    pub inputs: Vec<String>,
    /// Text files listing one video file per line.
    pub input_lists: Vec<PathBuf>,
    pub webcam: Option<u32>,
    pub url: Option<String>,
    /// Live stream resolution, e.g. `480p` or `best`.
    pub resolution: String,
    /// Frame name prefix; derived from the input when absent.
    pub prefix: Option<String>,
}

impl SourceConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let has_files = !self.inputs.is_empty() || !self.input_lists.is_empty();
        let kinds = [has_files, self.webcam.is_some(), self.url.is_some()]
            .iter()
            .filter(|k| **k)
            .count();
        match kinds {
            0 => Err(ConfigError::MissingSource),
            1 => match &self.url {
                Some(url) if url.trim().is_empty() => Err(ConfigError::MissingUrl),
                _ => Ok(()),
            },
            _ => Err(ConfigError::ConflictingSources),
        }
    }

    /// Turns the selection into the list of inputs to read, in order.
    pub fn resolve_inputs(&self) -> Result<Vec<InputSpec>> {
        self.validate()?;
        if let Some(id) = self.webcam {
            return Ok(vec![InputSpec::Webcam(id)]);
        }
        if let Some(url) = &self.url {
            let resolution = if self.resolution.is_empty() {
                "best".to_string()
            } else {
                self.resolution.clone()
            };
            return Ok(vec![InputSpec::LiveStream {
                url: url.trim().to_string(),
                resolution,
            }]);
        }
        Ok(locate_inputs(&self.inputs, &self.input_lists)?
            .into_iter()
            .map(InputSpec::File)
            .collect())
    }
}

/// What happens to the frames that make it through the filters.
#[derive(Debug, Clone)]
pub enum OutputConfig {
    Video {
        /// May contain `{input}`, which starts a new file per input.
        path: String,
        fps: i32,
    },
    Images {
        dir: PathBuf,
        format: ImageFormat,
    },
    Stats {
        change: ChangeDetectionConfig,
        num_bins: usize,
        /// stdout when absent
        path: Option<PathBuf>,
        format: ReportFormat,
    },
}

/// Application configuration structure.
#[derive(Debug, Clone)]
pub struct Config {
    pub source: SourceConfig,
    pub sampling: SamplingPolicy,
    /// Drop every nth frame after sampling.
    pub drop_nth: Option<i64>,
    /// Skip frames too similar to the last kept one.
    pub skip_similar: Option<ChangeDetectionConfig>,
    pub output: OutputConfig,
}

impl Config {
    /// Checks everything that can be checked before reading any frame.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.source.validate()?;
        self.sampling.validate()?;
        if let Some(change) = &self.skip_similar {
            change.validate()?;
        }
        match &self.output {
            OutputConfig::Video { fps, .. } if *fps < 1 => Err(ConfigError::InvalidFps(*fps)),
            OutputConfig::Stats { change, num_bins, .. } => {
                if *num_bins < 1 {
                    return Err(ConfigError::InvalidBinCount(*num_bins));
                }
                change.validate()
            }
            _ => Ok(()),
        }
    }
}

/// Totals of a run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    pub inputs_processed: usize,
    pub inputs_failed: usize,
    /// Frames that passed the sampler.
    pub frames_sampled: u64,
    /// Frames that reached the sink or the statistics.
    pub frames_kept: u64,
}

enum Target {
    Sink(Box<dyn FrameSink>),
    Stats(ChangeStatsAggregator, Option<PathBuf>, ReportFormat),
}

/// The main function that orchestrates the frame processing.
pub fn run(config: Config) -> Result<RunSummary> {
    info!("Initializing processing with config: {:?}", config);
    config.validate()?;

    let inputs = config.source.resolve_inputs()?;
    let mut sampler = FrameSampler::new(config.sampling.clone())?;
    let mut dropper = config.drop_nth.map(DropFrames::new);
    let mut skipper = config
        .skip_similar
        .clone()
        .map(SkipSimilarFrames::new)
        .transpose()?;

    let mut target = match &config.output {
        OutputConfig::Video { path, fps } => Target::Sink(Box::new(VideoSink::new(path, *fps))),
        OutputConfig::Images { dir, format } => Target::Sink(Box::new(ImageSink::new(dir, *format))),
        OutputConfig::Stats {
            change,
            num_bins,
            path,
            format,
        } => Target::Stats(
            ChangeStatsAggregator::new(change.clone(), *num_bins)?,
            path.clone(),
            *format,
        ),
    };

    let mut summary = RunSummary::default();
    info!("Processing {} input(s).", inputs.len());

    for spec in inputs {
        let prefix = config
            .source
            .prefix
            .clone()
            .unwrap_or_else(|| spec.default_prefix());
        let pb = progress_bar(&spec);
        let mut source = FfmpegSource::new(spec);

        let mut kept_here = 0u64;
        for frame in sampler.sample_from(&mut source, &prefix) {
            pb.set_position(frame.index);
            summary.frames_sampled += 1;

            if let Some(dropper) = dropper.as_mut() {
                if !dropper.accept(&frame) {
                    continue;
                }
            }
            if let Some(skipper) = skipper.as_mut() {
                if !skipper.accept(&frame) {
                    continue;
                }
            }

            match &mut target {
                Target::Sink(sink) => sink.write_frame(&frame)?,
                Target::Stats(stats, ..) => stats.add(&frame),
            }
            kept_here += 1;
        }
        pb.finish_with_message(format!("Kept {} frames", kept_here));
        summary.frames_kept += kept_here;

        match source.failure() {
            Some(reason) => {
                warn!("Skipped unreadable input {}: {}", source.source_id(), reason);
                summary.inputs_failed += 1;
            }
            None => summary.inputs_processed += 1,
        }
    }

    match target {
        Target::Sink(mut sink) => {
            sink.finish()?;
            info!("Wrote {} frames.", sink.frames_written());
        }
        Target::Stats(stats, path, format) => stats.report(format, path.as_deref())?,
    }

    info!(
        "Processed {} input(s), {} failed; sampled {} frames, kept {}.",
        summary.inputs_processed,
        summary.inputs_failed,
        summary.frames_sampled,
        summary.frames_kept
    );
    Ok(summary)
}

fn progress_bar(spec: &InputSpec) -> ProgressBar {
    let count = match spec {
        InputSpec::File(path) => video_processor::get_frame_count(path).ok(),
        _ => None,
    };
    let pb = match count {
        Some(count) if count > 0 => {
            let bar = ProgressBar::new(count);
            if let Ok(style) = ProgressStyle::default_bar()
                .template("{spinner:.green} Reading frames [{bar:40.cyan/blue}] {pos}/{len} ({percent}%) [{elapsed_precise}<{eta}]")
            {
                bar.set_style(style.progress_chars("##-"));
            }
            bar
        }
        _ => {
            let bar = ProgressBar::new_spinner();
            if let Ok(style) = ProgressStyle::default_spinner()
                .template("{spinner:.green} Reading frames... [{elapsed_precise}] at frame {pos}")
            {
                bar.set_style(style);
            }
            bar
        }
    };
    pb.enable_steady_tick(std::time::Duration::from_millis(100));
    pb
}

/// Filters a JSON array of annotated frames by label.
///
/// Returns how many frames were read and how many were kept.
pub fn filter_labels(
    input: &Path,
    output: Option<&Path>,
    config: LabelFilterConfig,
) -> Result<(usize, usize)> {
    let content = fs::read_to_string(input)
        .with_context(|| format!("Failed to read annotations from {:?}", input))?;
    let frames: Vec<AnnotatedFrame> = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse annotations in {:?}", input))?;
    let total = frames.len();

    let kept = LabelFilter::new(config).filter(frames);
    info!("Kept {} of {} annotated frames.", kept.len(), total);

    match output {
        Some(path) => {
            if let Some(parent_dir) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent_dir).context("Failed to create output directory")?;
            }
            fs::write(path, serde_json::to_string_pretty(&kept)?)
                .with_context(|| format!("Failed to write {:?}", path))?;
        }
        None => {
            serde_json::to_writer_pretty(io::stdout().lock(), &kept)?;
            println!();
        }
    }
    Ok((total, kept.len()))
}
