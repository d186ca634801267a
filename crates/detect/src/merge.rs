//! Turning detector output into boxes of the open frame.
//!
//! In order: detections too small to be boxes are dropped; detections that
//! repeat a box already in the frame (same class, overlapping) are dropped;
//! the rest are thinned out by non-max suppression in detector order; each
//! survivor then either continues a track from the previous frame or starts
//! a new one.

use annotations::{ClassId, FrameStore, LocalId, RecordSet, StoreError, TrackId, TrackIndex};
use geometry::Rect;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::Detection;

/// IoU thresholds of the merge. A pair counts as overlapping when its IoU is
/// strictly greater than the threshold.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    /// Overlap with an existing box of the same class that marks a detection
    /// as a duplicate of it.
    pub duplicate_iou: f64,
    /// Overlap between two detections above which the later one is dropped.
    pub nms_iou: f64,
    /// Overlap with a previous-frame box needed to continue its track.
    pub inherit_iou: f64,
}

impl Default for MergeConfig {
    fn default() -> Self { Self { duplicate_iou: 0.5, nms_iou: 0.5, inherit_iou: 0.3 } }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlannedBox {
    pub geometry: Rect,
    pub class_id: ClassId,
    /// Track continued from the previous frame, `None` for a new track.
    pub inherited: Option<TrackId>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergePlan {
    pub boxes: Vec<PlannedBox>,
    pub degenerate: usize,
    pub duplicates: usize,
    pub suppressed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    pub added: Vec<LocalId>,
    pub inherited: usize,
    pub new_tracks: usize,
    pub degenerate: usize,
    pub duplicates: usize,
    pub suppressed: usize,
}

/// Decides what to add without touching any state.
///
/// `existing` holds the boxes already in the frame, `previous` the records of
/// the frame before it, if there is one.
pub fn plan_merge(
    detections: &[Detection],
    existing: &RecordSet,
    previous: Option<&RecordSet>,
    config: &MergeConfig,
) -> MergePlan {
    let mut plan = MergePlan::default();

    let mut candidates: Vec<Detection> = Vec::with_capacity(detections.len());
    for d in detections {
        match d.geometry.validated() {
            Ok(geometry) => candidates.push(Detection::new(geometry, d.class_id)),
            Err(e) => {
                debug!("dropping detection: {e}");
                plan.degenerate += 1;
            }
        }
    }

    candidates.retain(|d| {
        let duplicate = existing
            .values()
            .any(|r| r.class_id == d.class_id && r.geometry.iou(&d.geometry) > config.duplicate_iou);
        plan.duplicates += usize::from(duplicate);
        !duplicate
    });

    let mut alive = vec![true; candidates.len()];
    for i in 0..candidates.len() {
        if !alive[i] {
            continue;
        }
        for j in (i + 1)..candidates.len() {
            if alive[j] && candidates[i].geometry.iou(&candidates[j].geometry) > config.nms_iou {
                alive[j] = false;
                plan.suppressed += 1;
            }
        }
    }

    for (d, _) in candidates.iter().zip(&alive).filter(|(_, keep)| **keep) {
        let best = previous.and_then(|prev| {
            prev.values()
                .filter(|r| r.is_tracked())
                .map(|r| (r.geometry.iou(&d.geometry), r))
                .fold(None, |best: Option<(f64, _)>, (iou, r)| match best {
                    Some((b, _)) if b >= iou => best,
                    _ => Some((iou, r)),
                })
        });
        let planned = match best {
            // the previous frame's class wins over the detector's label
            Some((iou, r)) if iou > config.inherit_iou => {
                PlannedBox { geometry: d.geometry, class_id: r.class_id, inherited: Some(r.track_id) }
            }
            _ => PlannedBox { geometry: d.geometry, class_id: d.class_id, inherited: None },
        };
        plan.boxes.push(planned);
    }
    plan
}

/// Adds the planned boxes to the open frame, handing out fresh track ids from
/// the index for boxes that did not inherit one.
pub fn apply_plan(plan: &MergePlan, store: &mut FrameStore, index: &mut TrackIndex) -> Result<MergeOutcome, StoreError> {
    let mut outcome = MergeOutcome {
        degenerate: plan.degenerate,
        duplicates: plan.duplicates,
        suppressed: plan.suppressed,
        ..MergeOutcome::default()
    };
    for planned in &plan.boxes {
        let track = match planned.inherited {
            Some(track) => {
                outcome.inherited += 1;
                track
            }
            None => {
                outcome.new_tracks += 1;
                index.take_suggestion()
            }
        };
        outcome.added.push(store.add(index, planned.geometry, planned.class_id, track)?);
    }
    Ok(outcome)
}

/// Plans and applies a merge of `detections` into the open frame.
pub fn merge_detections(
    detections: &[Detection],
    store: &mut FrameStore,
    index: &mut TrackIndex,
    previous: Option<&RecordSet>,
    config: &MergeConfig,
) -> Result<MergeOutcome, StoreError> {
    let plan = plan_merge(detections, store.boxes(), previous, config);
    let outcome = apply_plan(&plan, store, index)?;
    info!(
        detections = detections.len(),
        added = outcome.added.len(),
        inherited = outcome.inherited,
        duplicates = outcome.duplicates,
        suppressed = outcome.suppressed,
        "merged detections"
    );
    Ok(outcome)
}
