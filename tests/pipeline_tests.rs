//! End-to-end tests of the stages wired together, using in-memory sources.

use framesift::change_detector::{ChangeDetectionConfig, SkipSimilarFrames};
use framesift::change_stats::{ChangeStatsAggregator, ReportFormat};
use framesift::error::ConfigError;
use framesift::frame::RgbFrame;
use framesift::label_filter::{LabelFilterConfig, parse_label_list};
use framesift::sampler::{FrameSampler, SamplingPolicy};
use framesift::video_processor::{FfmpegSource, FrameSource, InputSpec, MemorySource};
use framesift::video_writer::{FrameSink, ImageFormat, ImageSink, VideoSink};
use framesift::{Config, OutputConfig, SourceConfig, filter_labels, run};
use image::Rgb;
use serde_json::json;
use std::fs;
use tempfile::TempDir;

/// 8x8 frames whose first `white[i]` pixels are white.
fn clip(white: &[usize]) -> Vec<RgbFrame> {
    white
        .iter()
        .map(|&n| {
            RgbFrame::from_fn(8, 8, |x, y| {
                if ((y * 8 + x) as usize) < n {
                    Rgb([250, 250, 250])
                } else {
                    Rgb([5, 5, 5])
                }
            })
        })
        .collect()
}

fn stats_config(source: SourceConfig, path: std::path::PathBuf, format: ReportFormat) -> Config {
    Config {
        source,
        sampling: SamplingPolicy::default(),
        drop_nth: None,
        skip_similar: None,
        output: OutputConfig::Stats {
            change: ChangeDetectionConfig::default(),
            num_bins: 10,
            path: Some(path),
            format,
        },
    }
}

#[test]
fn sampled_and_deduplicated_frames_are_saved_as_images() {
    let dir = TempDir::new().unwrap();
    // frames 2, 4, 6, 8 survive the stride; 4 barely differs from 2
    let mut source = MemorySource::new("demo.mp4", Some(30.0), clip(&[0, 0, 0, 1, 0, 40, 0, 64]));
    let mut sampler = FrameSampler::new(SamplingPolicy {
        stride_frames: 2,
        ..Default::default()
    })
    .unwrap();
    let mut skipper = SkipSimilarFrames::new(ChangeDetectionConfig {
        change_threshold: 0.05,
        ..Default::default()
    })
    .unwrap();
    let mut sink = ImageSink::new(dir.path(), ImageFormat::Png);

    for frame in sampler.sample_from(&mut source, "demo-") {
        if skipper.accept(&frame) {
            sink.write_frame(&frame).unwrap();
        }
    }
    sink.finish().unwrap();

    let mut names: Vec<String> = fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    assert_eq!(
        names,
        vec!["demo-00000002.png", "demo-00000006.png", "demo-00000008.png"]
    );
    assert_eq!(sink.frames_written(), 3);
    assert!(source.is_closed());
}

/// Solid frames alternating between two colours.
fn solid(count: usize, width: u32, height: u32) -> Vec<RgbFrame> {
    (0..count)
        .map(|i| {
            let level = if i % 2 == 0 { 30 } else { 220 };
            RgbFrame::from_pixel(width, height, Rgb([level, level, level]))
        })
        .collect()
}

fn decoded_sizes(path: &std::path::Path) -> Vec<(u32, u32)> {
    let mut source = FfmpegSource::new(InputSpec::File(path.to_path_buf()));
    let sizes = std::iter::from_fn(|| source.next_frame())
        .map(|f| (f.width(), f.height()))
        .collect();
    assert!(source.failure().is_none(), "{:?}", source.failure());
    sizes
}

#[test]
fn video_sink_starts_a_new_file_per_input() {
    let dir = TempDir::new().unwrap();
    let template = format!("{}/{{input}}-sifted.avi", dir.path().join("videos").display());
    let mut sink = VideoSink::new(&template, 10);
    let mut sampler = FrameSampler::new(SamplingPolicy::default()).unwrap();

    // the last frame of the first clip is larger and gets rescaled
    let mut first_frames = solid(3, 32, 24);
    first_frames.extend(solid(1, 64, 48));
    let mut first = MemorySource::new("/clips/first.mp4", Some(25.0), first_frames);
    let mut second = MemorySource::new("/clips/second.mp4", Some(25.0), solid(2, 16, 16));

    for source in [&mut first, &mut second] {
        for frame in sampler.sample_from(source, "clip-") {
            sink.write_frame(&frame).unwrap();
        }
    }
    assert!(
        dir.path().join("videos").join("first-sifted.avi").exists(),
        "switching inputs should leave the first video behind"
    );
    sink.finish().unwrap();
    assert_eq!(sink.frames_written(), 6);

    let first_sizes = decoded_sizes(&dir.path().join("videos").join("first-sifted.avi"));
    assert_eq!(first_sizes, vec![(32, 24); 4]);
    let second_sizes = decoded_sizes(&dir.path().join("videos").join("second-sifted.avi"));
    assert_eq!(second_sizes, vec![(16, 16); 2]);
}

#[test]
fn video_sink_without_frames_writes_nothing() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("empty.avi");
    let mut sink = VideoSink::new(&path.display().to_string(), 25);
    sink.finish().unwrap();
    assert_eq!(sink.frames_written(), 0);
    assert!(!path.exists());
}

#[test]
fn stats_report_is_written_as_csv() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("stats.csv");
    let mut stats = ChangeStatsAggregator::new(ChangeDetectionConfig::default(), 4).unwrap();
    let mut source = MemorySource::new("demo.mp4", None, clip(&[0, 16, 16, 48, 0]));
    let mut sampler = FrameSampler::new(SamplingPolicy::default()).unwrap();
    for frame in sampler.sample_from(&mut source, "demo-") {
        stats.add(&frame);
    }
    assert_eq!(stats.ratios().len(), 3);
    stats.report(ReportFormat::Csv, Some(&path)).unwrap();

    let csv = fs::read_to_string(&path).unwrap();
    let mut lines = csv.lines();
    assert_eq!(lines.next(), Some("bin,from,to,count"));
    let total: usize = lines
        .map(|line| line.rsplit(',').next().unwrap().parse::<usize>().unwrap())
        .sum();
    assert_eq!(total, 3);
}

#[test]
fn unreadable_inputs_do_not_abort_the_run() {
    let dir = TempDir::new().unwrap();
    let report = dir.path().join("report.txt");
    let source = SourceConfig {
        inputs: vec![
            dir.path().join("missing-1.mp4").display().to_string(),
            dir.path().join("missing-2.mp4").display().to_string(),
        ],
        resolution: "best".to_string(),
        ..Default::default()
    };

    let summary = run(stats_config(source, report.clone(), ReportFormat::Text)).unwrap();
    assert_eq!(summary.inputs_failed, 2);
    assert_eq!(summary.inputs_processed, 0);
    assert_eq!(summary.frames_kept, 0);
    assert_eq!(
        fs::read_to_string(&report).unwrap().trim(),
        "No frame changes collected."
    );
}

#[test]
fn invalid_stride_fails_before_reading() {
    let dir = TempDir::new().unwrap();
    let report = dir.path().join("report.json");
    let mut config = stats_config(
        SourceConfig {
            inputs: vec!["whatever.mp4".to_string()],
            ..Default::default()
        },
        report.clone(),
        ReportFormat::Json,
    );
    config.sampling.stride_frames = 0;

    let err = run(config).unwrap_err();
    assert_eq!(
        err.downcast_ref::<ConfigError>(),
        Some(&ConfigError::InvalidStride(0))
    );
    assert!(!report.exists());
}

#[test]
fn missing_source_is_a_config_error() {
    let dir = TempDir::new().unwrap();
    let config = stats_config(SourceConfig::default(), dir.path().join("r.txt"), ReportFormat::Text);
    let err = run(config).unwrap_err();
    assert_eq!(
        err.downcast_ref::<ConfigError>(),
        Some(&ConfigError::MissingSource)
    );
}

#[test]
fn annotated_frames_are_filtered_from_json() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("annotations.json");
    let output = dir.path().join("out").join("kept.json");
    let frames = json!([
        {"name": "a-00000001", "objects": [{"metadata": {"type": "cat", "score": 0.9}}]},
        {"name": "a-00000002", "objects": [{"metadata": {"type": "dog", "score": 0.9}}]},
        {"name": "a-00000003", "objects": [
            {"metadata": {"type": "cat", "score": 0.8}},
            {"metadata": {"type": "dog", "score": 0.1}}
        ]}
    ]);
    fs::write(&input, serde_json::to_string(&frames).unwrap()).unwrap();

    let config = LabelFilterConfig {
        required_labels: parse_label_list(Some("cat")),
        excluded_labels: parse_label_list(Some("dog")),
        min_score: Some(0.5),
        ..Default::default()
    };
    let (total, kept) = filter_labels(&input, Some(&output), config).unwrap();
    assert_eq!((total, kept), (3, 2));

    let written: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&output).unwrap()).unwrap();
    let names: Vec<&str> = written
        .as_array()
        .unwrap()
        .iter()
        .map(|f| f["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["a-00000001", "a-00000003"]);
}
