//! Change Detection Module
//!
//! Compares frames against a retained baseline after reducing them to a
//! black/white mask, and reports which share of the pixels flipped.

use crate::error::ConfigError;
use crate::frame::{Frame, RgbFrame};
use image::{GrayImage, ImageBuffer, Luma, Rgb};
use log::debug;
use serde::Serialize;

/// How an RGB pixel is reduced to a single channel before thresholding.
#[derive(clap::ValueEnum, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Conversion {
    /// Luma (ITU-R BT.601 weights).
    #[default]
    Gray,
    Red,
    Green,
    Blue,
    /// HSV value, i.e. the brightest channel.
    Value,
}

impl Conversion {
    pub fn channel(self, pixel: &Rgb<u8>) -> u8 {
        let [r, g, b] = pixel.0;
        match self {
            Conversion::Gray => {
                ((r as u32 * 299 + g as u32 * 587 + b as u32 * 114 + 500) / 1000) as u8
            }
            Conversion::Red => r,
            Conversion::Green => g,
            Conversion::Blue => b,
            Conversion::Value => r.max(g).max(b),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChangeDetectionConfig {
    pub conversion: Conversion,
    /// Channel values above this become white.
    pub bw_threshold: u8,
    /// Ratio of changed pixels (0-1) above which a frame counts as changed.
    pub change_threshold: f64,
}

impl Default for ChangeDetectionConfig {
    fn default() -> Self {
        ChangeDetectionConfig {
            conversion: Conversion::Gray,
            bw_threshold: 128,
            change_threshold: 0.01,
        }
    }
}

impl ChangeDetectionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.change_threshold) {
            return Err(ConfigError::InvalidChangeThreshold(self.change_threshold));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChangeResult {
    /// Share of pixels whose black/white value differs, in `[0, 1]`.
    pub ratio: f64,
    pub changed: bool,
}

struct Baseline {
    index: u64,
    mask: GrayImage,
}

/// Stateful detector holding the last frame judged different enough.
pub struct ChangeDetector {
    config: ChangeDetectionConfig,
    baseline: Option<Baseline>,
}

impl ChangeDetector {
    pub fn new(config: ChangeDetectionConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(ChangeDetector {
            config,
            baseline: None,
        })
    }

    /// Compares `candidate` with the baseline.
    ///
    /// Returns `None` for the very first frame, which becomes the baseline.
    /// Afterwards the baseline is only replaced when the candidate counts as
    /// changed, so slow drift keeps accumulating against the same frame.
    pub fn evaluate(&mut self, candidate: &Frame) -> Option<ChangeResult> {
        let mask = binarize(&candidate.image, self.config.conversion, self.config.bw_threshold);

        let Some(baseline) = &self.baseline else {
            self.baseline = Some(Baseline {
                index: candidate.index,
                mask,
            });
            return None;
        };

        let ratio = change_ratio(&baseline.mask, &mask);
        let changed = ratio > self.config.change_threshold;
        if changed {
            self.baseline = Some(Baseline {
                index: candidate.index,
                mask,
            });
        }
        Some(ChangeResult { ratio, changed })
    }

    /// Index of the frame currently used as baseline.
    pub fn baseline_index(&self) -> Option<u64> {
        self.baseline.as_ref().map(|b| b.index)
    }

    /// Forgets the baseline; the next frame is treated as the first one.
    pub fn reset(&mut self) {
        self.baseline = None;
    }
}

/// Reduces an RGB frame to a two-level mask (0 or 255).
pub fn binarize(image: &RgbFrame, conversion: Conversion, threshold: u8) -> GrayImage {
    ImageBuffer::from_fn(image.width(), image.height(), |x, y| {
        if conversion.channel(image.get_pixel(x, y)) > threshold {
            Luma([255u8])
        } else {
            Luma([0u8])
        }
    })
}

/// Share of differing pixels between two masks.
///
/// Masks of different sizes count as completely changed.
pub fn change_ratio(a: &GrayImage, b: &GrayImage) -> f64 {
    if a.dimensions() != b.dimensions() {
        return 1.0;
    }
    let total = a.as_raw().len();
    if total == 0 {
        return 0.0;
    }
    let differing = a
        .as_raw()
        .iter()
        .zip(b.as_raw())
        .filter(|(x, y)| x != y)
        .count();
    differing as f64 / total as f64
}

/// Filter stage that drops frames too similar to the last retained one.
pub struct SkipSimilarFrames {
    detector: ChangeDetector,
}

impl SkipSimilarFrames {
    pub fn new(config: ChangeDetectionConfig) -> Result<Self, ConfigError> {
        Ok(SkipSimilarFrames {
            detector: ChangeDetector::new(config)?,
        })
    }

    /// The first frame is always kept; later ones only when changed.
    pub fn accept(&mut self, frame: &Frame) -> bool {
        match self.detector.evaluate(frame) {
            None => {
                debug!("{}: first frame, kept", frame.name);
                true
            }
            Some(result) => {
                debug!(
                    "{} (ratio/changed): {:.6} -> {}",
                    frame.name, result.ratio, result.changed
                );
                result.changed
            }
        }
    }
}
