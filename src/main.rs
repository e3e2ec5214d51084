//! FrameSift - Main Application Entrypoint
//!
//! This file is responsible for parsing command-line arguments, initializing
//! the application environment (like logging), and dispatching the core
//! processing logic.

use clap::{Args, Parser, Subcommand};
use framesift::change_detector::{ChangeDetectionConfig, Conversion};
use framesift::change_stats::{DEFAULT_NUM_BINS, ReportFormat};
use framesift::error::ConfigError;
use framesift::label_filter::{
    DEFAULT_LABEL_KEY, DEFAULT_SCORE_KEY, LabelFilterConfig, parse_label_list,
};
use framesift::sampler::SamplingPolicy;
use framesift::video_writer::{DEFAULT_FPS, ImageFormat};
use framesift::{Config, OutputConfig, SourceConfig, filter_labels, run};
use log::{error, info};
use std::path::PathBuf;

/// Samples frames from videos, webcams or live streams, skips near-duplicates
/// and writes what is left to a video, to images or to a change histogram.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Logging verbosity level
    #[arg(long, value_enum, default_value_t = LogLevel::Info, global = true)]
    log_level: LogLevel,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Re-encode the selected frames into an MJPEG video
    ToVideo {
        #[command(flatten)]
        source: SourceArgs,
        #[command(flatten)]
        sampling: SamplingArgs,
        #[command(flatten)]
        skip: SkipArgs,
        /// Output video file; '{input}' expands to the input's name
        #[arg(short, long)]
        output: String,
        /// Frames-per-second of the output video
        #[arg(long, default_value_t = DEFAULT_FPS)]
        fps: i32,
    },
    /// Save the selected frames as images
    ToImages {
        #[command(flatten)]
        source: SourceArgs,
        #[command(flatten)]
        sampling: SamplingArgs,
        #[command(flatten)]
        skip: SkipArgs,
        /// Directory to save the images to
        #[arg(short, long)]
        output: PathBuf,
        #[arg(long, value_enum, default_value_t = ImageFormat::Jpg)]
        image_format: ImageFormat,
    },
    /// Report how much consecutive kept frames change, as a histogram
    CalcChanges {
        #[command(flatten)]
        source: SourceArgs,
        #[command(flatten)]
        sampling: SamplingArgs,
        #[command(flatten)]
        change: ChangeArgs,
        /// Number of histogram bins
        #[arg(short = 'B', long, default_value_t = DEFAULT_NUM_BINS)]
        num_bins: usize,
        /// File to write the statistics to, stdout if not provided
        #[arg(short, long)]
        output: Option<PathBuf>,
        #[arg(long, value_enum, default_value_t = ReportFormat::Text)]
        output_format: ReportFormat,
    },
    /// Keep or drop annotated frames based on their object labels
    FilterLabels {
        /// JSON file with an array of annotated frames
        #[arg(short, long)]
        input: PathBuf,
        /// File to write the kept frames to, stdout if not provided
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Metadata key holding the label
        #[arg(long, default_value_t = String::from(DEFAULT_LABEL_KEY))]
        label_key: String,
        /// Comma-separated labels of which at least one must be present
        #[arg(long)]
        required_labels: Option<String>,
        /// Comma-separated labels that drop the frame when present
        #[arg(long)]
        excluded_labels: Option<String>,
        /// Metadata key holding the prediction score
        #[arg(long, default_value_t = String::from(DEFAULT_SCORE_KEY))]
        score_key: String,
        /// Minimum score for an annotation to take part in the label checks
        #[arg(long)]
        min_score: Option<f64>,
    },
}

#[derive(Args, Debug)]
struct SourceArgs {
    /// Video file(s) to read; glob syntax is supported
    #[arg(short, long, num_args = 1..)]
    input: Vec<String>,

    /// Text file(s) listing the video files to read
    #[arg(short = 'I', long, num_args = 1..)]
    input_list: Vec<PathBuf>,

    /// ID of the webcam to read from
    #[arg(long)]
    webcam: Option<u32>,

    /// Live stream URL to read from
    #[arg(long)]
    url: Option<String>,

    /// Live stream resolution, e.g. '480p' or 'best'
    #[arg(short, long, default_value_t = String::from("best"))]
    resolution: String,

    /// Prefix for the frame names (default: derived from the input)
    #[arg(short, long)]
    prefix: Option<String>,
}

#[derive(Args, Debug)]
struct SamplingArgs {
    /// First frame of the stream to use (1-based)
    #[arg(short = 'F', long, default_value_t = 1, allow_negative_numbers = true)]
    from_frame: i64,

    /// Frame at which to stop (1-based, exclusive); ignored if <=0
    #[arg(short = 'T', long, default_value_t = -1, allow_negative_numbers = true)]
    to_frame: i64,

    /// Only forward every nth frame
    #[arg(short, long, default_value_t = 1, allow_negative_numbers = true)]
    nth_frame: i64,

    /// Multiplied with the video's fps and rounded up to get the nth frame; overrides --nth-frame
    #[arg(short, long, allow_negative_numbers = true)]
    fps_factor: Option<f64>,

    /// Maximum number of frames to forward per input; ignored if <=0
    #[arg(short, long, default_value_t = -1, allow_negative_numbers = true)]
    max_frames: i64,

    /// Drop every nth of the sampled frames
    #[arg(long)]
    drop_nth: Option<i64>,
}

#[derive(Args, Debug)]
struct ChangeArgs {
    /// How to reduce the RGB frames to a single channel
    #[arg(short, long, value_enum, default_value_t = Conversion::Gray)]
    conversion: Conversion,

    /// Threshold for turning the single channel into black and white (0-255)
    #[arg(short, long, default_value_t = 128)]
    bw_threshold: u8,

    /// Ratio of pixels that must change relative to the image size (0-1)
    #[arg(short = 't', long, default_value_t = 0.01)]
    change_threshold: f64,
}

#[derive(Args, Debug)]
struct SkipArgs {
    /// Skip frames that are too similar to the last kept one
    #[arg(long)]
    skip_similar: bool,

    #[command(flatten)]
    change: ChangeArgs,
}

#[derive(clap::ValueEnum, Clone, Debug)]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
}

impl From<SourceArgs> for SourceConfig {
    fn from(args: SourceArgs) -> Self {
        SourceConfig {
            inputs: args.input,
            input_lists: args.input_list,
            webcam: args.webcam,
            url: args.url,
            resolution: args.resolution,
            prefix: args.prefix,
        }
    }
}

impl From<ChangeArgs> for ChangeDetectionConfig {
    fn from(args: ChangeArgs) -> Self {
        ChangeDetectionConfig {
            conversion: args.conversion,
            bw_threshold: args.bw_threshold,
            change_threshold: args.change_threshold,
        }
    }
}

impl SamplingArgs {
    fn split(self) -> (SamplingPolicy, Option<i64>) {
        let policy = SamplingPolicy {
            from_frame: self.from_frame,
            to_frame: self.to_frame,
            stride_frames: self.nth_frame,
            fps_factor: self.fps_factor,
            max_output_frames: self.max_frames,
        };
        (policy, self.drop_nth)
    }
}

fn frame_config(
    source: SourceArgs,
    sampling: SamplingArgs,
    skip_similar: Option<ChangeDetectionConfig>,
    output: OutputConfig,
) -> Config {
    let (sampling, drop_nth) = sampling.split();
    Config {
        source: source.into(),
        sampling,
        drop_nth,
        skip_similar,
        output,
    }
}

fn skip_config(skip: SkipArgs) -> Option<ChangeDetectionConfig> {
    skip.skip_similar.then(|| skip.change.into())
}

fn dispatch(command: Command) -> anyhow::Result<()> {
    let config = match command {
        Command::ToVideo {
            source,
            sampling,
            skip,
            output,
            fps,
        } => frame_config(
            source,
            sampling,
            skip_config(skip),
            OutputConfig::Video { path: output, fps },
        ),
        Command::ToImages {
            source,
            sampling,
            skip,
            output,
            image_format,
        } => frame_config(
            source,
            sampling,
            skip_config(skip),
            OutputConfig::Images {
                dir: output,
                format: image_format,
            },
        ),
        Command::CalcChanges {
            source,
            sampling,
            change,
            num_bins,
            output,
            output_format,
        } => frame_config(
            source,
            sampling,
            None,
            OutputConfig::Stats {
                change: change.into(),
                num_bins,
                path: output,
                format: output_format,
            },
        ),
        Command::FilterLabels {
            input,
            output,
            label_key,
            required_labels,
            excluded_labels,
            score_key,
            min_score,
        } => {
            let config = LabelFilterConfig {
                label_key,
                required_labels: parse_label_list(required_labels.as_deref()),
                excluded_labels: parse_label_list(excluded_labels.as_deref()),
                score_key,
                min_score,
            };
            filter_labels(&input, output.as_deref(), config)?;
            return Ok(());
        }
    };

    run(config)?;
    Ok(())
}

fn main() {
    let cli = Cli::parse();

    // 1. Initialize Logger
    let log_level = match cli.log_level {
        LogLevel::Error => "error",
        LogLevel::Warn => "warn",
        LogLevel::Info => "info",
        LogLevel::Debug => "debug",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    info!("Starting FrameSift...");

    // 2. Run the selected command
    if let Err(e) = dispatch(cli.command) {
        error!("Application failed: {:#}", e);
        let code = if e.downcast_ref::<ConfigError>().is_some() { 1 } else { 2 };
        std::process::exit(code);
    }

    info!("Processing completed successfully.");
}
