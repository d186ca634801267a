use std::path::PathBuf;
use tracing::{debug, warn};

use crate::{
    BoxRecord, ClassId, FrameId, LocalId, RecordFile, RecordFolder, RecordSet, Rect, StoreError, TrackId,
    TrackIndex,
};

/// In-memory boxes of the frame currently open for editing.
///
/// Local ids are handed out from `max(existing) + 1` at load time and keep
/// counting up for the rest of the session, so a deleted id is never given to
/// a new box while the frame stays open.
#[derive(Debug)]
pub struct FrameStore {
    folder: RecordFolder,
    frame: Option<FrameId>,
    boxes: RecordSet,
    /// The record file as last read or written, for lossless saves.
    file: RecordFile,
    next_local: LocalId,
    load_failed: bool,
    dirty: bool,
}

impl FrameStore {
    pub fn new(folder: RecordFolder) -> Self {
        Self {
            folder,
            frame: None,
            boxes: RecordSet::new(),
            file: RecordFile::default(),
            next_local: 0,
            load_failed: false,
            dirty: false,
        }
    }

    pub fn folder(&self) -> &RecordFolder { &self.folder }

    pub fn frame(&self) -> Option<&FrameId> { self.frame.as_ref() }

    /// Record file backing the open frame.
    pub fn record_path(&self) -> Option<PathBuf> { self.frame.as_ref().map(|f| self.folder.path_for(f)) }

    pub fn boxes(&self) -> &RecordSet { &self.boxes }

    pub fn get(&self, id: LocalId) -> Option<&BoxRecord> { self.boxes.get(&id) }

    pub fn next_local_id(&self) -> LocalId { self.next_local }

    /// Whether the open frame has edits that are not on disk yet.
    pub fn is_dirty(&self) -> bool { self.dirty }

    /// Opens `frame`. A missing record file opens an empty frame. A malformed
    /// one also opens an empty frame, but the error is returned so the editor
    /// can tell the user before anything overwrites the file.
    pub fn load(&mut self, frame: &FrameId) -> Result<(), StoreError> {
        self.frame = Some(frame.clone());
        self.boxes.clear();
        self.file = RecordFile::default();
        self.next_local = 0;
        self.load_failed = false;
        self.dirty = false;
        match self.folder.read_file(&self.folder.path_for(frame)) {
            Ok(file) => {
                self.file = file.unwrap_or_default();
                self.boxes = self.file.records.clone();
                self.next_local = self.file.next_local_id();
                debug!(frame = %frame, boxes = self.boxes.len(), "loaded frame");
                Ok(())
            }
            Err(e) => {
                self.load_failed = true;
                Err(e)
            }
        }
    }

    /// Reloads the open frame from disk, picking up changes made by
    /// folder-wide operations.
    pub fn reload(&mut self) -> Result<(), StoreError> {
        let frame = self.frame.clone().ok_or(StoreError::NoFrameOpen)?;
        self.load(&frame)
    }

    /// Adds a box to the open frame. Tracked boxes are registered in `index`,
    /// which also moves its suggestion past `track_id`.
    pub fn add(
        &mut self,
        index: &mut TrackIndex,
        geometry: Rect,
        class_id: ClassId,
        track_id: TrackId,
    ) -> Result<LocalId, StoreError> {
        if self.frame.is_none() {
            return Err(StoreError::NoFrameOpen);
        }
        if track_id < 0 {
            return Err(StoreError::InvalidTrack(track_id));
        }
        let geometry = geometry.validated()?;
        let id = self.next_local;
        self.next_local += 1;
        self.boxes.insert(id, BoxRecord::new(geometry, class_id, track_id));
        self.dirty = true;
        index.upsert(track_id, class_id);
        Ok(id)
    }

    /// Moves or resizes a box. Returns false when `id` is not in the frame.
    pub fn update_geometry(&mut self, id: LocalId, geometry: Rect) -> bool {
        match self.boxes.get_mut(&id) {
            Some(record) => {
                record.geometry = geometry.normalized();
                self.dirty = true;
                true
            }
            None => false,
        }
    }

    pub fn set_class(&mut self, index: &mut TrackIndex, id: LocalId, class_id: ClassId) -> bool {
        match self.boxes.get_mut(&id) {
            Some(record) => {
                record.class_id = class_id;
                index.upsert(record.track_id, class_id);
                self.dirty = true;
                true
            }
            None => false,
        }
    }

    /// Moves a box to another track. Returns the track it left, so the caller
    /// can release it from the index when it became empty.
    pub fn set_track(&mut self, index: &mut TrackIndex, id: LocalId, track_id: TrackId) -> Option<TrackId> {
        if track_id < 0 {
            return None;
        }
        let record = self.boxes.get_mut(&id)?;
        let previous = record.track_id;
        record.track_id = track_id;
        index.upsert(track_id, record.class_id);
        self.dirty = true;
        Some(previous)
    }

    /// Removes a box and returns the track it belonged to.
    pub fn delete(&mut self, id: LocalId) -> Option<TrackId> {
        let removed = self.boxes.remove(&id)?;
        self.dirty = true;
        Some(removed.track_id)
    }

    /// Writes the open frame. Boxes left unclassified in memory are not
    /// written; entries of the file the store does not edit are kept.
    pub fn save(&mut self) -> Result<(), StoreError> {
        let frame = self.frame.as_ref().ok_or(StoreError::NoFrameOpen)?;
        if self.load_failed {
            warn!(frame = %frame, "replacing a record file that failed to load");
        }
        self.file = self.folder.rewrite(&self.folder.path_for(frame), &self.file, &self.boxes)?;
        self.load_failed = false;
        self.dirty = false;
        Ok(())
    }

    /// Saves only when the open frame has unsaved edits.
    pub fn flush(&mut self) -> Result<(), StoreError> {
        if self.dirty {
            self.save()?;
        }
        Ok(())
    }
}
