//! Per-frame annotation records and the folder-wide track engine.
//!
//! One JSON record file per image frame holds that frame's boxes. Everything
//! that spans frames (the track index, keyframe interpolation, identity
//! rename/swap/reclassify) works by scanning and rewriting those files.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub use geometry::Rect;

pub mod cancel;
pub mod classes;
pub mod codec;
pub mod error;
pub mod folder;
pub mod identity;
pub mod index;
pub mod interpolate;
pub mod palette;
pub mod sequence;
pub mod store;

pub use cancel::CancelToken;
pub use classes::ClassTable;
pub use codec::RecordFile;
pub use error::StoreError;
pub use folder::{RecordFolder, ScanFailure, ScanReport};
pub use identity::{CollisionPolicy, MutationReport};
pub use index::TrackIndex;
pub use interpolate::{InterpolationReport, Keyframe};
pub use sequence::{FrameId, FrameSequence};
pub use store::FrameStore;

pub type ClassId = i64;
pub type TrackId = i64;
pub type LocalId = u64;

/// Class value of a box that has not been classified yet. Never persisted.
pub const UNCLASSIFIED: ClassId = -1;

/// Track value of a box that does not belong to any track.
pub const UNTRACKED: TrackId = 0;

/// One annotated object in one frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoxRecord {
    #[serde(rename = "box")]
    pub geometry: Rect,
    #[serde(rename = "class", default = "unclassified")]
    pub class_id: ClassId,
    #[serde(default)]
    pub track_id: TrackId,
}

fn unclassified() -> ClassId { UNCLASSIFIED }

impl BoxRecord {
    pub fn new(geometry: Rect, class_id: ClassId, track_id: TrackId) -> Self {
        Self { geometry, class_id, track_id }
    }

    pub fn is_classified(&self) -> bool { self.class_id >= 0 }

    pub fn is_tracked(&self) -> bool { self.track_id > 0 }
}

/// All boxes of one frame, keyed by local id.
pub type RecordSet = BTreeMap<LocalId, BoxRecord>;

/// Next free local id of a record set: `max + 1`, or 0 when empty.
pub fn next_local_id(set: &RecordSet) -> LocalId {
    set.keys().next_back().map_or(0, |max| max + 1)
}

/// First record of `track` in `set`, in local id order.
pub fn find_track(set: &RecordSet, track: TrackId) -> Option<(LocalId, &BoxRecord)> {
    set.iter().find(|(_, r)| r.track_id == track).map(|(id, r)| (*id, r))
}
