//! Folder-wide rewrites of track identities.
//!
//! Each operation walks every record file once, edits matching records in
//! place and rewrites only the files that changed. While walking, it also
//! notes the class of every affected track in the same order a full index
//! rebuild would, so the index can be patched to exactly the rebuilt state.

use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use crate::folder::ScanFailure;
use crate::index::observe;
use crate::{BoxRecord, CancelToken, ClassId, RecordFolder, StoreError, TrackId, TrackIndex};

/// What to do when a rename targets a track that already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollisionPolicy {
    /// Fail with [`StoreError::IdentityCollision`].
    Reject,
    /// Merge both tracks into one. This cannot be undone: the two objects
    /// become indistinguishable.
    Merge,
}

#[derive(Debug, Default)]
pub struct MutationReport {
    pub records_changed: usize,
    pub files_rewritten: usize,
    pub failures: Vec<ScanFailure>,
    pub cancelled: bool,
}

/// Gives every record of track `old` the id `new`.
pub fn rename_track(
    folder: &RecordFolder,
    index: &mut TrackIndex,
    old: TrackId,
    new: TrackId,
    policy: CollisionPolicy,
    cancel: &CancelToken,
) -> Result<MutationReport, StoreError> {
    check_track(old)?;
    check_track(new)?;
    if old == new {
        return Ok(MutationReport::default());
    }
    if policy == CollisionPolicy::Reject && TrackIndex::exists_anywhere(folder, new) {
        return Err(StoreError::IdentityCollision(new));
    }
    let report = rewrite_folder(folder, index, &[old, new], cancel, |r| {
        if r.track_id == old {
            r.track_id = new;
            true
        } else {
            false
        }
    })?;
    info!(old, new, changed = report.records_changed, "renamed track");
    Ok(report)
}

/// Sets the class of every record of `track`.
pub fn reclassify_track(
    folder: &RecordFolder,
    index: &mut TrackIndex,
    track: TrackId,
    class: ClassId,
    cancel: &CancelToken,
) -> Result<MutationReport, StoreError> {
    check_track(track)?;
    if class < 0 {
        return Err(StoreError::InvalidClass(class));
    }
    let report = rewrite_folder(folder, index, &[track], cancel, |r| {
        if r.track_id == track && r.class_id != class {
            r.class_id = class;
            true
        } else {
            false
        }
    })?;
    info!(track, class, changed = report.records_changed, "reclassified track");
    Ok(report)
}

/// Exchanges the ids of tracks `a` and `b` everywhere.
pub fn swap_tracks(
    folder: &RecordFolder,
    index: &mut TrackIndex,
    a: TrackId,
    b: TrackId,
    cancel: &CancelToken,
) -> Result<MutationReport, StoreError> {
    check_track(a)?;
    check_track(b)?;
    if a == b {
        return Ok(MutationReport::default());
    }
    let report = rewrite_folder(folder, index, &[a, b], cancel, |r| {
        // one decision per record, so a record moved to `b` is not moved back
        if r.track_id == a {
            r.track_id = b;
            true
        } else if r.track_id == b {
            r.track_id = a;
            true
        } else {
            false
        }
    })?;
    info!(a, b, changed = report.records_changed, "swapped tracks");
    Ok(report)
}

fn check_track(track: TrackId) -> Result<(), StoreError> {
    if track <= 0 {
        return Err(StoreError::InvalidTrack(track));
    }
    Ok(())
}

fn rewrite_folder(
    folder: &RecordFolder,
    index: &mut TrackIndex,
    touched: &[TrackId],
    cancel: &CancelToken,
    mut edit: impl FnMut(&mut BoxRecord) -> bool,
) -> Result<MutationReport, StoreError> {
    let mut report = MutationReport::default();
    let mut observed: BTreeMap<TrackId, ClassId> = BTreeMap::new();

    for path in folder.record_files() {
        if cancel.is_cancelled() {
            report.cancelled = true;
            break;
        }
        let file = match folder.read_file(&path) {
            Ok(Some(file)) => file,
            Ok(None) => continue,
            Err(error) => {
                warn!("leaving {} untouched: {}", path.display(), error);
                report.failures.push(ScanFailure { path, error });
                continue;
            }
        };
        let mut records = file.records.clone();
        let changed = records.values_mut().fold(0, |n, r| n + usize::from(edit(r)));
        if changed > 0 {
            if let Err(e) = folder.rewrite(&path, &file, &records) {
                // files before this one are already rewritten
                index.rebuild(folder);
                return Err(e);
            }
            report.records_changed += changed;
            report.files_rewritten += 1;
            debug!(path = %path.display(), changed, "rewrote record file");
        }
        let mut seen = BTreeMap::new();
        observe(&records, &mut seen);
        observed.extend(seen.into_iter().filter(|(t, _)| touched.contains(t)));
    }

    if report.cancelled {
        // the walk stopped partway, so only a full scan knows the real state
        index.rebuild(folder);
    } else {
        index.apply_observed(touched, &observed);
    }
    Ok(report)
}
