use thiserror::Error;

/// Fatal problems with the run configuration, raised before any frame is read.
#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("No input source defined (use --input, --input-list, --webcam or --url)")]
    MissingSource,

    #[error("Only one kind of input source can be used at a time")]
    ConflictingSources,

    #[error("No live stream URL defined")]
    MissingUrl,

    #[error("No input files found matching: {0}")]
    NoInputs(String),

    #[error("nth_frame must be at least 1, provided: {0}")]
    InvalidStride(i64),

    #[error("fps_factor must be a number, provided: {0}")]
    InvalidFpsFactor(f64),

    #[error("change_threshold must be within [0, 1], provided: {0}")]
    InvalidChangeThreshold(f64),

    #[error("num_bins must be at least 1, provided: {0}")]
    InvalidBinCount(usize),

    #[error("fps must be at least 1, provided: {0}")]
    InvalidFps(i32),
}
