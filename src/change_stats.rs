//! Change Statistics Module
//!
//! Collects the change ratios of frames judged "changed" and reports them
//! as a histogram, to help pick a threshold for skipping similar frames.

use crate::change_detector::{ChangeDetectionConfig, ChangeDetector};
use crate::error::ConfigError;
use crate::frame::Frame;
use anyhow::{Context, Result};
use log::{debug, info};
use serde::Serialize;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

pub const DEFAULT_NUM_BINS: usize = 20;

const BAR_WIDTH: usize = 50;

#[derive(clap::ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ReportFormat {
    /// ASCII histogram
    #[default]
    Text,
    Csv,
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistogramBin {
    #[serde(rename = "bin")]
    pub index: usize,
    #[serde(rename = "from")]
    pub lower_bound: f64,
    #[serde(rename = "to")]
    pub upper_bound: f64,
    pub count: usize,
}

/// Partitions `ratios` into `num_bins` equal-width bins over `[min, max]`.
///
/// The last bin includes its upper bound. A degenerate range is widened to
/// `[v - 0.5, v + 0.5]`. No ratios yield no bins.
pub fn histogram(ratios: &[f64], num_bins: usize) -> Vec<HistogramBin> {
    if ratios.is_empty() || num_bins == 0 {
        return Vec::new();
    }

    let mut min = ratios.iter().copied().fold(f64::INFINITY, f64::min);
    let mut max = ratios.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if min == max {
        min -= 0.5;
        max += 0.5;
    }
    let width = (max - min) / num_bins as f64;

    let mut bins: Vec<HistogramBin> = (0..num_bins)
        .map(|i| HistogramBin {
            index: i,
            lower_bound: min + width * i as f64,
            upper_bound: if i + 1 == num_bins { max } else { min + width * (i + 1) as f64 },
            count: 0,
        })
        .collect();

    // Slot by the stored bounds so counts agree with the printed edges.
    for &ratio in ratios {
        let slot = bins
            .partition_point(|bin| bin.upper_bound <= ratio)
            .min(num_bins - 1);
        bins[slot].count += 1;
    }
    bins
}

/// Feeds frames through a change detector and keeps the "changed" ratios.
pub struct ChangeStatsAggregator {
    detector: ChangeDetector,
    num_bins: usize,
    ratios: Vec<f64>,
    frames_seen: u64,
}

impl ChangeStatsAggregator {
    pub fn new(config: ChangeDetectionConfig, num_bins: usize) -> Result<Self, ConfigError> {
        if num_bins < 1 {
            return Err(ConfigError::InvalidBinCount(num_bins));
        }
        Ok(ChangeStatsAggregator {
            detector: ChangeDetector::new(config)?,
            num_bins,
            ratios: Vec::new(),
            frames_seen: 0,
        })
    }

    pub fn add(&mut self, frame: &Frame) {
        self.frames_seen += 1;
        if let Some(result) = self.detector.evaluate(frame) {
            debug!(
                "{} (ratio/changed): {:.6} -> {}",
                frame.name, result.ratio, result.changed
            );
            if result.changed {
                self.ratios.push(result.ratio);
            }
        }
    }

    pub fn ratios(&self) -> &[f64] {
        &self.ratios
    }

    pub fn frames_seen(&self) -> u64 {
        self.frames_seen
    }

    pub fn histogram(&self) -> Vec<HistogramBin> {
        histogram(&self.ratios, self.num_bins)
    }

    /// Writes the report to `output`, or stdout when `None`.
    pub fn report(self, format: ReportFormat, output: Option<&Path>) -> Result<()> {
        info!(
            "Collected {} change ratios from {} frames.",
            self.ratios.len(),
            self.frames_seen
        );
        let bins = self.histogram();
        match output {
            Some(path) => {
                info!("Writing stats to: {:?}", path);
                let file = File::create(path)
                    .with_context(|| format!("Failed to create stats file {:?}", path))?;
                let mut writer = BufWriter::new(file);
                render(&bins, format, &mut writer)?;
                writer.flush().context("Failed to write stats file")?;
            }
            None => {
                let stdout = io::stdout();
                let mut handle = stdout.lock();
                render(&bins, format, &mut handle)?;
            }
        }
        Ok(())
    }
}

pub fn render(bins: &[HistogramBin], format: ReportFormat, out: &mut dyn Write) -> Result<()> {
    match format {
        ReportFormat::Text => render_text(bins, out)?,
        ReportFormat::Csv => {
            writeln!(out, "bin,from,to,count")?;
            for bin in bins {
                writeln!(
                    out,
                    "{},{},{},{}",
                    bin.index, bin.lower_bound, bin.upper_bound, bin.count
                )?;
            }
        }
        ReportFormat::Json => {
            serde_json::to_writer_pretty(&mut *out, bins)?;
            writeln!(out)?;
        }
    }
    Ok(())
}

fn render_text(bins: &[HistogramBin], out: &mut dyn Write) -> io::Result<()> {
    if bins.is_empty() {
        return writeln!(out, "No frame changes collected.");
    }
    let max_count = bins.iter().map(|b| b.count).max().unwrap_or(0).max(1);
    let count_width = max_count.to_string().len();
    for bin in bins {
        let bar = "#".repeat(bin.count * BAR_WIDTH / max_count);
        writeln!(
            out,
            "{:.6} - {:.6}  [{:>width$}]  {}",
            bin.lower_bound,
            bin.upper_bound,
            bin.count,
            bar,
            width = count_width
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::RgbFrame;
    use image::Rgb;

    fn frame(index: u64, white: usize) -> Frame {
        let img = RgbFrame::from_fn(10, 10, |x, y| {
            if ((y * 10 + x) as usize) < white {
                Rgb([255, 255, 255])
            } else {
                Rgb([0, 0, 0])
            }
        });
        Frame::new(index, img, "stats")
    }

    #[test]
    fn bin_counts_sum_to_ratio_count() {
        let ratios = [0.01, 0.02, 0.5, 0.75, 0.99, 0.3, 0.3];
        for num_bins in [1, 3, 7, 20] {
            let bins = histogram(&ratios, num_bins);
            assert_eq!(bins.len(), num_bins);
            assert_eq!(bins.iter().map(|b| b.count).sum::<usize>(), ratios.len());
        }
    }

    #[test]
    fn bins_span_min_to_max() {
        let bins = histogram(&[0.2, 0.4, 0.6], 2);
        assert_eq!(bins[0].lower_bound, 0.2);
        assert_eq!(bins[1].upper_bound, 0.6);
        assert_eq!(bins[0].count, 1);
        // upper edge is inclusive on the last bin
        assert_eq!(bins[1].count, 2);
    }

    #[test]
    fn values_on_edges_land_inside_printed_bounds() {
        let ratios: Vec<f64> = (0..=10).map(|i| i as f64 / 10.0).collect();
        let bins = histogram(&ratios, 10);
        let last = bins.len() - 1;
        for (i, bin) in bins.iter().enumerate() {
            let inside = ratios
                .iter()
                .filter(|&&r| {
                    r >= bin.lower_bound
                        && (r < bin.upper_bound || (i == last && r <= bin.upper_bound))
                })
                .count();
            assert_eq!(bin.count, inside, "bin {}", i);
        }
        assert_eq!(bins.iter().map(|b| b.count).sum::<usize>(), ratios.len());
    }

    #[test]
    fn single_value_gets_widened_range() {
        let bins = histogram(&[0.3, 0.3], 4);
        assert!((bins[0].lower_bound - -0.2).abs() < 1e-9);
        assert!((bins[3].upper_bound - 0.8).abs() < 1e-9);
        assert_eq!(bins.iter().map(|b| b.count).sum::<usize>(), 2);
    }

    #[test]
    fn no_ratios_is_an_empty_report() {
        assert!(histogram(&[], 20).is_empty());
        let mut out = Vec::new();
        render(&[], ReportFormat::Json, &mut out).unwrap();
        assert_eq!(String::from_utf8(out).unwrap().trim(), "[]");
        let mut out = Vec::new();
        render(&[], ReportFormat::Csv, &mut out).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "bin,from,to,count\n");
    }

    #[test]
    fn only_changed_ratios_are_recorded() {
        let config = ChangeDetectionConfig {
            change_threshold: 0.05,
            ..Default::default()
        };
        let mut stats = ChangeStatsAggregator::new(config, 5).unwrap();
        // first frame, unchanged, changed (0.2), unchanged against new baseline
        for f in [frame(1, 0), frame(2, 3), frame(3, 20), frame(4, 22)] {
            stats.add(&f);
        }
        assert_eq!(stats.ratios(), &[0.2]);
        assert_eq!(stats.frames_seen(), 4);
    }

    #[test]
    fn json_uses_bin_from_to_count_keys() {
        let bins = histogram(&[0.1, 0.9], 2);
        let mut out = Vec::new();
        render(&bins, ReportFormat::Json, &mut out).unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(parsed[0]["bin"], 0);
        assert_eq!(parsed[1]["to"], 0.9);
        assert_eq!(parsed[1]["count"], 1);
    }

    #[test]
    fn text_draws_one_line_per_bin() {
        let bins = histogram(&[0.1, 0.2, 0.2, 0.9], 3);
        let mut out = Vec::new();
        render(&bins, ReportFormat::Text, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text.lines().count(), 3);
        assert!(text.lines().next().unwrap().ends_with(&"#".repeat(BAR_WIDTH)));
    }

    #[test]
    fn zero_bins_is_rejected() {
        assert!(matches!(
            ChangeStatsAggregator::new(ChangeDetectionConfig::default(), 0),
            Err(ConfigError::InvalidBinCount(0))
        ));
    }
}
