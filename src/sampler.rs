//! Frame Sampling Module
//!
//! Decides which decoded frames are forwarded at all: a frame window, a
//! stride (fixed or derived from the video's fps) and a cap on the number
//! of frames emitted per input.

use crate::error::ConfigError;
use crate::frame::Frame;
use crate::video_processor::FrameSource;
use log::{info, warn};

/// Window, stride and cap settings for one run.
#[derive(Debug, Clone, PartialEq)]
pub struct SamplingPolicy {
    /// First frame to use (1-based).
    pub from_frame: i64,
    /// Exclusive upper bound; `<= 0` means unbounded.
    pub to_frame: i64,
    pub stride_frames: i64,
    /// Multiplied with the source fps and rounded up; overrides `stride_frames`.
    pub fps_factor: Option<f64>,
    /// `<= 0` means unbounded.
    pub max_output_frames: i64,
}

impl Default for SamplingPolicy {
    fn default() -> Self {
        SamplingPolicy {
            from_frame: 1,
            to_frame: -1,
            stride_frames: 1,
            fps_factor: None,
            max_output_frames: -1,
        }
    }
}

impl SamplingPolicy {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stride_frames < 1 {
            return Err(ConfigError::InvalidStride(self.stride_frames));
        }
        if let Some(factor) = self.fps_factor {
            if factor.is_nan() {
                return Err(ConfigError::InvalidFpsFactor(factor));
            }
        }
        Ok(())
    }
}

/// Outcome of offering one frame to the sampler.
#[derive(Debug)]
pub enum Decision {
    Emit(Frame),
    Skip,
    /// Window end or output cap reached, no further frames will be accepted.
    Stop,
}

/// Stateful window/stride/cap filter. Counters reset with every `begin`.
#[derive(Debug)]
pub struct FrameSampler {
    policy: SamplingPolicy,
    prefix: String,
    effective_stride: i64,
    stride_counter: i64,
    emitted: u64,
}

impl FrameSampler {
    pub fn new(policy: SamplingPolicy) -> Result<Self, ConfigError> {
        policy.validate()?;
        Ok(FrameSampler {
            effective_stride: policy.stride_frames,
            policy,
            prefix: String::new(),
            stride_counter: 0,
            emitted: 0,
        })
    }

    /// Starts a new input: resets counters and works out the stride to use.
    pub fn begin(&mut self, fps: Option<f64>, prefix: &str) {
        self.prefix = prefix.to_string();
        self.stride_counter = 0;
        self.emitted = 0;

        self.effective_stride = match (self.policy.fps_factor, fps) {
            (Some(factor), Some(fps)) => {
                let stride = (fps * factor).ceil() as i64;
                info!("nth frame calculated from fps factor: {}", stride);
                if stride < 1 {
                    warn!(
                        "fps {} * factor {} gives a stride of {}, using every frame",
                        fps, factor, stride
                    );
                    1
                } else {
                    stride
                }
            }
            _ => {
                if self.policy.stride_frames > 1 {
                    info!("nth frame: {}", self.policy.stride_frames);
                }
                self.policy.stride_frames
            }
        };
    }

    pub fn sample(&mut self, frame: Frame) -> Decision {
        if frame.index < self.policy.from_frame.max(1) as u64 {
            return Decision::Skip;
        }
        if self.policy.to_frame > 0 && frame.index >= self.policy.to_frame as u64 {
            return Decision::Stop;
        }

        self.stride_counter += 1;
        if self.stride_counter < self.effective_stride {
            return Decision::Skip;
        }

        if self.policy.max_output_frames > 0 && self.emitted >= self.policy.max_output_frames as u64 {
            return Decision::Stop;
        }

        self.stride_counter = 0;
        self.emitted += 1;
        Decision::Emit(frame.with_output_name(&self.prefix))
    }

    pub fn effective_stride(&self) -> i64 {
        self.effective_stride
    }

    /// Frames emitted since the last `begin`.
    pub fn emitted(&self) -> u64 {
        self.emitted
    }

    /// Wraps a source so that only sampled frames come out of it.
    pub fn sample_from<'a>(
        &'a mut self,
        source: &'a mut dyn FrameSource,
        prefix: &str,
    ) -> Sampled<'a> {
        Sampled {
            source,
            sampler: self,
            prefix: prefix.to_string(),
            started: false,
            done: false,
        }
    }
}

/// Iterator over the frames of one input that pass the sampler.
pub struct Sampled<'a> {
    source: &'a mut dyn FrameSource,
    sampler: &'a mut FrameSampler,
    prefix: String,
    started: bool,
    done: bool,
}

impl Iterator for Sampled<'_> {
    type Item = Frame;

    fn next(&mut self) -> Option<Frame> {
        if self.done {
            return None;
        }
        loop {
            let Some(frame) = self.source.next_frame() else {
                self.done = true;
                return None;
            };
            // fps is only known once the source has been opened by the first pull
            if !self.started {
                self.sampler.begin(self.source.fps(), &self.prefix);
                self.started = true;
            }
            match self.sampler.sample(frame) {
                Decision::Emit(frame) => return Some(frame),
                Decision::Skip => continue,
                Decision::Stop => {
                    self.source.close();
                    self.done = true;
                    return None;
                }
            }
        }
    }
}

/// Drops every nth frame it sees; passes everything through if `nth <= 1`.
#[derive(Debug)]
pub struct DropFrames {
    nth: i64,
    count: i64,
}

impl DropFrames {
    pub fn new(nth: i64) -> Self {
        DropFrames { nth, count: 0 }
    }

    pub fn accept(&mut self, _frame: &Frame) -> bool {
        self.count += 1;
        self.nth <= 1 || self.count % self.nth != 0
    }
}
