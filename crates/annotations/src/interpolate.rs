//! Keyframe interpolation of a single track across the frame sequence.
//!
//! Frames where the track has a classified record are keyframes. Gaps between
//! consecutive keyframes are filled with linearly interpolated boxes that
//! keep the class of the earlier keyframe. A record stored without a class
//! is not a keyframe, but its frame is still never filled.
//!
//! A record file that cannot be parsed is treated as not containing the
//! track. That file can therefore hide a real keyframe, and the gap around
//! it gets filled from the neighbouring keyframes instead. The file itself
//! is never rewritten, and it shows up in [`InterpolationReport::failures`].

use tracing::{debug, info, warn};

use crate::folder::ScanFailure;
use crate::{
    find_track, BoxRecord, CancelToken, ClassId, FrameSequence, RecordFile, RecordFolder, Rect, StoreError, TrackId,
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Keyframe {
    pub index: usize,
    pub geometry: Rect,
    pub class_id: ClassId,
}

#[derive(Debug, Default)]
pub struct InterpolationReport {
    pub keyframes: usize,
    pub inserted: usize,
    /// Intermediate frames left alone because they already hold the track.
    pub skipped_existing: usize,
    pub failures: Vec<ScanFailure>,
    pub cancelled: bool,
}

impl InterpolationReport {
    /// Fewer than two keyframes: nothing could be interpolated.
    pub fn insufficient_keyframes(&self) -> bool { self.keyframes < 2 }
}

/// Keyframes of `track` in sequence order, one per frame. When a frame holds
/// the track more than once, the classified record with the lowest local id
/// is used.
pub fn collect_keyframes(
    folder: &RecordFolder,
    sequence: &FrameSequence,
    track: TrackId,
    failures: &mut Vec<ScanFailure>,
) -> Vec<Keyframe> {
    let mut keyframes = Vec::new();
    for (index, frame) in sequence.iter().enumerate() {
        let path = folder.path_for(frame);
        match folder.read(&path) {
            Ok(Some(set)) => {
                if let Some(record) = set.values().find(|r| r.track_id == track && r.is_classified()) {
                    keyframes.push(Keyframe { index, geometry: record.geometry, class_id: record.class_id });
                }
            }
            Ok(None) => {}
            Err(error) => {
                warn!("keyframe scan skipping {}: {}", path.display(), error);
                failures.push(ScanFailure { path, error });
            }
        }
    }
    keyframes
}

/// Fills every gap between consecutive keyframes of `track`, writing each new
/// box to its frame file right away. Returns how many boxes were inserted.
pub fn interpolate_track(
    folder: &RecordFolder,
    sequence: &FrameSequence,
    track: TrackId,
    cancel: &CancelToken,
) -> Result<InterpolationReport, StoreError> {
    if track <= 0 {
        return Err(StoreError::InvalidTrack(track));
    }
    let mut report = InterpolationReport::default();
    let mut keyframes = collect_keyframes(folder, sequence, track, &mut report.failures);
    keyframes.sort_by_key(|k| k.index);
    report.keyframes = keyframes.len();
    if report.insufficient_keyframes() {
        debug!(track, keyframes = report.keyframes, "not enough keyframes to interpolate");
        return Ok(report);
    }

    for pair in keyframes.windows(2) {
        let (a, b) = (&pair[0], &pair[1]);
        let steps = b.index - a.index;
        if steps <= 1 {
            continue;
        }
        for k in 1..steps {
            if cancel.is_cancelled() {
                report.cancelled = true;
                info!(track, inserted = report.inserted, "interpolation cancelled");
                return Ok(report);
            }
            let Some(frame) = sequence.get(a.index + k) else { continue };
            let path = folder.path_for(frame);
            let file = match folder.read_file(&path) {
                Ok(file) => file.unwrap_or_default(),
                Err(error) => {
                    // never overwrite a file we could not read
                    report.failures.push(ScanFailure { path, error });
                    continue;
                }
            };
            if find_track(&file.records, track).is_some() {
                report.skipped_existing += 1;
                continue;
            }
            let geometry = a.geometry.step_towards(&b.geometry, k, steps);
            let mut records = file.records.clone();
            records.insert(file.next_local_id(), BoxRecord::new(geometry, a.class_id, track));
            folder.rewrite(&path, &file, &records)?;
            report.inserted += 1;
        }
    }
    info!(track, keyframes = report.keyframes, inserted = report.inserted, "interpolated track");
    Ok(report)
}
