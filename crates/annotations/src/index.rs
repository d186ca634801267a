use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info};

use crate::{ClassId, RecordFolder, RecordSet, ScanReport, TrackId};

/// Folder-wide map of track id to class.
///
/// Incremental updates keep the index responsive while editing, but the file
/// scan is the source of truth: [`TrackIndex::rebuild`] can be called at any
/// time and must agree with the incrementally maintained state. When frames
/// disagree on a track's class, the record read last (file-name order, then
/// local id order) wins. Only classified records define entries; a track held
/// only by records stored without a class has none, though its id is still
/// never suggested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackIndex {
    entries: BTreeMap<TrackId, ClassId>,
    next_suggested: TrackId,
}

impl Default for TrackIndex {
    fn default() -> Self { Self { entries: BTreeMap::new(), next_suggested: 1 } }
}

impl TrackIndex {
    pub fn new() -> Self { Self::default() }

    pub fn entries(&self) -> &BTreeMap<TrackId, ClassId> { &self.entries }

    pub fn class_of(&self, track: TrackId) -> Option<ClassId> { self.entries.get(&track).copied() }

    pub fn contains(&self, track: TrackId) -> bool { self.entries.contains_key(&track) }

    pub fn len(&self) -> usize { self.entries.len() }

    pub fn is_empty(&self) -> bool { self.entries.is_empty() }

    /// Track id offered for the next new object.
    pub fn next_suggested(&self) -> TrackId { self.next_suggested }

    /// Hands out the suggested track id and moves the suggestion past it.
    pub fn take_suggestion(&mut self) -> TrackId {
        let id = self.next_suggested;
        self.next_suggested += 1;
        id
    }

    /// Full rescan of the folder. The suggestion only moves forward here; use
    /// [`TrackIndex::scan_with_suggestion`] to recompute it.
    pub fn rebuild(&mut self, folder: &RecordFolder) -> ScanReport {
        let (report, max) = self.rescan(folder);
        if let Some(max) = max {
            self.next_suggested = self.next_suggested.max(max + 1);
        }
        report
    }

    /// Rescan used when a sequence is opened: rebuilds the entries and resets
    /// the suggestion to one past the highest track id seen, or 1.
    pub fn scan_with_suggestion(&mut self, folder: &RecordFolder) -> ScanReport {
        let (report, max) = self.rescan(folder);
        self.next_suggested = max.map_or(1, |max| max + 1);
        report
    }

    /// Replaces the entries from the folder and returns the highest track id
    /// found on any record.
    fn rescan(&mut self, folder: &RecordFolder) -> (ScanReport, Option<TrackId>) {
        let mut entries = BTreeMap::new();
        let mut max = None;
        let report = folder.scan(|_, set| {
            max = set.values().map(|r| r.track_id).filter(|t| *t > 0).chain(max).max();
            observe(&set, &mut entries);
        });
        self.entries = entries;
        info!(tracks = self.entries.len(), files = report.files_read, "rebuilt track index");
        (report, max)
    }

    /// Whether any record file in the folder references `track`. Stops at the
    /// first match; unreadable files are skipped.
    pub fn exists_anywhere(folder: &RecordFolder, track: TrackId) -> bool {
        folder.record_files().iter().any(|path| match folder.read(path) {
            Ok(Some(set)) => set.values().any(|r| r.track_id == track),
            _ => false,
        })
    }

    /// Records that `track` has `class`, as done when a box is added or
    /// retracked in the open frame. An unclassified box reserves the id but
    /// adds no entry, since it is never written.
    pub fn upsert(&mut self, track: TrackId, class: ClassId) {
        if track <= 0 {
            return;
        }
        if class >= 0 {
            self.entries.insert(track, class);
        }
        if track >= self.next_suggested {
            self.next_suggested = track + 1;
        }
    }

    /// Drops `track` if no record references it anymore. The open frame is
    /// checked through its in-memory set `open` instead of its file, since it
    /// may hold unsaved edits. Returns true when the entry was removed.
    pub fn release(&mut self, folder: &RecordFolder, track: TrackId, open: Option<(&Path, &RecordSet)>) -> bool {
        if !self.entries.contains_key(&track) {
            return false;
        }
        if let Some((_, set)) = open {
            if set.values().any(|r| r.track_id == track && r.is_classified()) {
                return false;
            }
        }
        let open_path = open.map(|(p, _)| p);
        let referenced = folder.record_files().iter().filter(|p| Some(p.as_path()) != open_path).any(|path| {
            match folder.read(path) {
                Ok(Some(set)) => set.values().any(|r| r.track_id == track && r.is_classified()),
                _ => false,
            }
        });
        if referenced {
            return false;
        }
        debug!(track, "track no longer referenced, dropping from index");
        self.entries.remove(&track).is_some()
    }

    /// Applies the outcome of a folder-wide rewrite: each id in `touched` now
    /// has the class found in `observed`, or no entry when it was not seen.
    pub fn apply_observed(&mut self, touched: &[TrackId], observed: &BTreeMap<TrackId, ClassId>) {
        for track in touched.iter().copied().filter(|t| *t > 0) {
            match observed.get(&track) {
                Some(class) => self.upsert(track, *class),
                None => {
                    self.entries.remove(&track);
                }
            }
        }
    }
}

/// Folds the classified records of one set into a track map, last record
/// winning.
pub(crate) fn observe(set: &RecordSet, into: &mut BTreeMap<TrackId, ClassId>) {
    for record in set.values().filter(|r| r.is_tracked() && r.is_classified()) {
        into.insert(record.track_id, record.class_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BoxRecord, FrameId, Rect};

    fn rec(class: ClassId, track: TrackId) -> BoxRecord {
        BoxRecord::new(Rect::new(0.0, 0.0, 10.0, 10.0), class, track)
    }

    fn write(folder: &RecordFolder, name: &str, records: &[BoxRecord]) {
        let set: RecordSet = records.iter().enumerate().map(|(i, r)| (i as u64, *r)).collect();
        folder.write_frame(&FrameId::new(name), &set).unwrap();
    }

    #[test]
    fn scan_with_suggestion_uses_highest_positive_track() {
        let dir = tempfile::tempdir().unwrap();
        let folder = RecordFolder::new(dir.path());
        write(&folder, "a.jpg", &[rec(1, 3), rec(2, 0)]);
        write(&folder, "b.jpg", &[rec(4, 9)]);
        let mut index = TrackIndex::new();
        let report = index.scan_with_suggestion(&folder);
        assert!(report.is_clean());
        assert_eq!(index.entries().iter().map(|(t, c)| (*t, *c)).collect::<Vec<_>>(), vec![(3, 1), (9, 4)]);
        assert_eq!(index.next_suggested(), 10);
    }

    #[test]
    fn empty_folder_suggests_one() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = TrackIndex::new();
        index.upsert(40, 1);
        index.scan_with_suggestion(&RecordFolder::new(dir.path()));
        assert!(index.is_empty());
        assert_eq!(index.next_suggested(), 1);
    }

    #[test]
    fn last_file_wins_on_class_disagreement() {
        let dir = tempfile::tempdir().unwrap();
        let folder = RecordFolder::new(dir.path());
        write(&folder, "a.jpg", &[rec(1, 5)]);
        write(&folder, "b.jpg", &[rec(2, 5)]);
        let mut index = TrackIndex::new();
        index.rebuild(&folder);
        assert_eq!(index.class_of(5), Some(2));
    }

    #[test]
    fn upsert_advances_suggestion_only_forward() {
        let mut index = TrackIndex::new();
        index.upsert(4, 1);
        assert_eq!(index.next_suggested(), 5);
        index.upsert(2, 1);
        assert_eq!(index.next_suggested(), 5);
        index.upsert(0, 1);
        assert!(!index.contains(0));
        assert_eq!(index.take_suggestion(), 5);
        assert_eq!(index.next_suggested(), 6);
    }

    #[test]
    fn exists_anywhere_finds_tracks_in_any_file() {
        let dir = tempfile::tempdir().unwrap();
        let folder = RecordFolder::new(dir.path());
        write(&folder, "a.jpg", &[rec(1, 3)]);
        std::fs::write(dir.path().join("b.json"), "broken").unwrap();
        write(&folder, "c.jpg", &[rec(1, 8)]);
        assert!(TrackIndex::exists_anywhere(&folder, 8));
        assert!(!TrackIndex::exists_anywhere(&folder, 4));
    }

    #[test]
    fn release_respects_other_frames_and_open_set() {
        let dir = tempfile::tempdir().unwrap();
        let folder = RecordFolder::new(dir.path());
        write(&folder, "a.jpg", &[rec(1, 12)]);
        write(&folder, "b.jpg", &[rec(1, 12)]);
        let mut index = TrackIndex::new();
        index.rebuild(&folder);

        // frame a is open and its box was deleted in memory; b still has 12
        let open_path = folder.path_for(&FrameId::new("a.jpg"));
        let empty = RecordSet::new();
        assert!(!index.release(&folder, 12, Some((open_path.as_path(), &empty))));
        assert!(index.contains(12));

        write(&folder, "b.jpg", &[]);
        assert!(index.release(&folder, 12, Some((open_path.as_path(), &empty))));
        assert!(!index.contains(12));
    }

    #[test]
    fn unclassified_records_reserve_ids_without_entries() {
        let dir = tempfile::tempdir().unwrap();
        let folder = RecordFolder::new(dir.path());
        write(&folder, "a.jpg", &[rec(2, 3)]);
        std::fs::write(dir.path().join("b.json"), r#"{"0": {"box": [0, 0, 10, 10], "track_id": 14}}"#).unwrap();
        let mut index = TrackIndex::new();
        index.scan_with_suggestion(&folder);
        assert_eq!(index.entries().keys().copied().collect::<Vec<_>>(), vec![3]);
        assert_eq!(index.next_suggested(), 15);

        let mut incremental = TrackIndex::new();
        incremental.upsert(20, crate::UNCLASSIFIED);
        assert!(!incremental.contains(20));
        assert_eq!(incremental.next_suggested(), 21);
    }
}
