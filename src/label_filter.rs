//! Label Filter Module
//!
//! Keeps or drops annotated frames depending on the labels (and optionally
//! the scores) of the objects annotated in them.

use log::info;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;

pub const DEFAULT_LABEL_KEY: &str = "type";
pub const DEFAULT_SCORE_KEY: &str = "score";

/// One annotated object; only its metadata is inspected.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectAnnotation {
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

impl ObjectAnnotation {
    pub fn with_metadata(pairs: &[(&str, Value)]) -> Self {
        ObjectAnnotation {
            metadata: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
            other: Map::new(),
        }
    }

    fn label(&self, key: &str) -> Option<String> {
        self.metadata.get(key).map(|value| match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }

    fn score(&self, key: &str) -> Option<f64> {
        match self.metadata.get(key)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

/// A frame together with its object annotations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnnotatedFrame {
    pub name: String,
    #[serde(default)]
    pub objects: Vec<ObjectAnnotation>,
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LabelFilterConfig {
    pub label_key: String,
    pub required_labels: BTreeSet<String>,
    pub excluded_labels: BTreeSet<String>,
    pub score_key: String,
    /// Objects below this score are left out of the label checks.
    pub min_score: Option<f64>,
}

impl Default for LabelFilterConfig {
    fn default() -> Self {
        LabelFilterConfig {
            label_key: DEFAULT_LABEL_KEY.to_string(),
            required_labels: BTreeSet::new(),
            excluded_labels: BTreeSet::new(),
            score_key: DEFAULT_SCORE_KEY.to_string(),
            min_score: None,
        }
    }
}

/// Splits a comma-separated label list, ignoring empty entries.
pub fn parse_label_list(labels: Option<&str>) -> BTreeSet<String> {
    labels
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|label| !label.is_empty())
        .map(str::to_string)
        .collect()
}

pub struct LabelFilter {
    config: LabelFilterConfig,
}

impl LabelFilter {
    pub fn new(config: LabelFilterConfig) -> Self {
        LabelFilter { config }
    }

    /// Decides whether the frame is retained. The frame itself is never modified.
    pub fn keep(&self, frame: &AnnotatedFrame) -> bool {
        let cfg = &self.config;

        let ignored: Vec<bool> = frame
            .objects
            .iter()
            .map(|obj| match cfg.min_score {
                Some(min) if min > 0.0 => obj.score(&cfg.score_key).is_none_or(|s| s < min),
                _ => false,
            })
            .collect();
        let ignored_count = ignored.iter().filter(|i| **i).count();
        if ignored_count > 0 {
            info!(
                "{}: ignoring {} annotation(s) due to min_score of {}",
                frame.name,
                ignored_count,
                cfg.min_score.unwrap_or_default()
            );
        }

        let considered = || {
            frame
                .objects
                .iter()
                .zip(&ignored)
                .filter(|(_, ignored)| !**ignored)
                .map(|(obj, _)| obj.label(&cfg.label_key))
        };

        let mut keep = false;
        let mut skip = false;

        if !cfg.required_labels.is_empty() {
            for label in considered() {
                match label {
                    Some(label) if cfg.required_labels.contains(&label) => keep = true,
                    Some(_) => {}
                    None => skip = true,
                }
            }
        }

        if !cfg.excluded_labels.is_empty() {
            for label in considered() {
                match label {
                    Some(label) if cfg.excluded_labels.contains(&label) => skip = true,
                    Some(_) => {}
                    None => skip = true,
                }
            }
        }

        // Without required labels, frames are kept unless excluded.
        if skip {
            return false;
        }
        cfg.required_labels.is_empty() || keep
    }

    pub fn filter(&self, frames: Vec<AnnotatedFrame>) -> Vec<AnnotatedFrame> {
        frames.into_iter().filter(|f| self.keep(f)).collect()
    }
}
