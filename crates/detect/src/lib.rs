//! Object detector collaborator and the merge of its output into a frame.
//!
//! The detector itself is opaque: anything implementing [`Detector`] can
//! produce detections for an image. [`merge`] decides which of those become
//! boxes in the open frame and which track each one joins.

use annotations::ClassId;
use geometry::Rect;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

pub mod command;
pub mod merge;

pub use command::CommandDetector;
pub use merge::{apply_plan, merge_detections, plan_merge, MergeConfig, MergeOutcome, MergePlan, PlannedBox};

#[derive(Debug, Error)]
pub enum DetectorError {
    /// The detector is missing or misconfigured. Reported before any merge.
    #[error("detector unavailable: {0}")]
    Unavailable(String),
    #[error("detector failed: {0}")]
    Failed(String),
    #[error("detector output is not valid: {0}")]
    InvalidOutput(#[from] serde_json::Error),
}

/// A detection in the editor's class space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    pub geometry: Rect,
    pub class_id: ClassId,
}

impl Detection {
    pub fn new(geometry: Rect, class_id: ClassId) -> Self { Self { geometry, class_id } }
}

/// A detection as reported by the model, in the model's class space.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RawDetection {
    #[serde(rename = "box")]
    pub geometry: Rect,
    pub class: i64,
    #[serde(default = "full_confidence")]
    pub confidence: f32,
}

fn full_confidence() -> f32 { 1.0 }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Model reference handed to the detector, typically a weights path.
    pub model: String,
    pub confidence: f32,
    /// Model class id to editor class id. Model classes without an entry are
    /// dropped.
    pub class_map: BTreeMap<i64, ClassId>,
}

impl Default for DetectorConfig {
    fn default() -> Self { Self { model: String::new(), confidence: 0.25, class_map: BTreeMap::new() } }
}

impl DetectorConfig {
    /// Maps raw detections into editor classes, dropping unmapped classes and
    /// anything below the confidence threshold.
    pub fn remap(&self, raw: impl IntoIterator<Item = RawDetection>) -> Vec<Detection> {
        raw.into_iter()
            .filter(|d| d.confidence >= self.confidence)
            .filter_map(|d| self.class_map.get(&d.class).map(|class| Detection::new(d.geometry, *class)))
            .collect()
    }
}

/// Finds objects in one image. Implementations may be slow; callers run them
/// off the editing thread.
pub trait Detector: Send + Sync {
    fn detect(&self, image: &Path) -> Result<Vec<Detection>, DetectorError>;
}
