//! Headless editing session over one image sequence.
//!
//! A [`Session`] owns the open frame, the track index and the cursor into the
//! frame sequence. Every mutation goes through it so the index stays in step
//! with the record files, and so nothing changes under a running detection.

use annotations::identity::{reclassify_track, rename_track, swap_tracks};
use annotations::interpolate::interpolate_track;
use annotations::sequence::record_dir_for;
use annotations::{
    CancelToken, ClassId, CollisionPolicy, FrameId, FrameSequence, FrameStore, InterpolationReport, LocalId,
    MutationReport, RecordFolder, RecordSet, Rect, ScanReport, StoreError, TrackId, TrackIndex,
};
use detect::{merge_detections, Detection, Detector, MergeConfig, MergeOutcome};
use jobs::{DetectionRequest, JobError, JobEvent, JobId, JobStatus, JobsHandle, JobsRuntime};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("a detection is still running")]
    Busy,
    #[error("no detector is configured")]
    DetectorUnavailable,
    #[error("the image folder has no frames")]
    NoFrames,
    #[error("frame {index} is out of range (sequence has {len} frames)")]
    FrameOutOfRange { index: usize, len: usize },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Job(#[from] JobError),
}

#[derive(Debug, Clone)]
struct InFlight {
    id: JobId,
    frame: FrameId,
}

#[derive(Debug)]
pub struct Session {
    image_dir: PathBuf,
    sequence: FrameSequence,
    store: FrameStore,
    index: TrackIndex,
    cursor: usize,
    merge: MergeConfig,
    jobs: Option<JobsHandle>,
    in_flight: Option<InFlight>,
}

impl Session {
    /// Opens the image folder `image_dir`. Records live in `records`, or in
    /// the folder derived from the image folder when `None`; the folder is
    /// created if missing.
    pub fn open(image_dir: &Path, records: Option<&Path>, merge: MergeConfig) -> Result<(Self, ScanReport), SessionError> {
        let sequence = FrameSequence::from_image_dir(image_dir)?;
        let folder = RecordFolder::new(records.map_or_else(|| record_dir_for(image_dir), Path::to_path_buf));
        folder.ensure_exists()?;
        Self::with_sequence(image_dir, sequence, folder, merge)
    }

    /// Opens a session over an explicit frame list. The first frame is loaded.
    pub fn with_sequence(
        image_dir: &Path,
        sequence: FrameSequence,
        folder: RecordFolder,
        merge: MergeConfig,
    ) -> Result<(Self, ScanReport), SessionError> {
        let first = sequence.get(0).cloned().ok_or(SessionError::NoFrames)?;
        let mut index = TrackIndex::new();
        let report = index.scan_with_suggestion(&folder);
        let mut store = FrameStore::new(folder);
        if let Err(e) = store.load(&first) {
            warn!(frame = %first, "opening first frame: {e}");
        }
        info!(frames = sequence.len(), tracks = index.len(), dir = %image_dir.display(), "opened sequence");
        let session = Self {
            image_dir: image_dir.to_path_buf(),
            sequence,
            store,
            index,
            cursor: 0,
            merge,
            jobs: None,
            in_flight: None,
        };
        Ok((session, report))
    }

    /// Starts a background worker running `detector`.
    pub fn attach_detector(&mut self, detector: Arc<dyn Detector>) {
        self.jobs = Some(JobsRuntime::start(detector, 1));
    }

    pub fn sequence(&self) -> &FrameSequence { &self.sequence }

    pub fn folder(&self) -> &RecordFolder { self.store.folder() }

    pub fn index(&self) -> &TrackIndex { &self.index }

    pub fn boxes(&self) -> &RecordSet { self.store.boxes() }

    pub fn cursor(&self) -> usize { self.cursor }

    pub fn current_frame(&self) -> Option<&FrameId> { self.store.frame() }

    pub fn image_path(&self) -> Option<PathBuf> { self.current_frame().map(|f| self.image_dir.join(f.as_str())) }

    pub fn merge_config(&self) -> &MergeConfig { &self.merge }

    pub fn is_busy(&self) -> bool { self.in_flight.is_some() }

    fn ensure_idle(&self) -> Result<(), SessionError> {
        if self.is_busy() {
            return Err(SessionError::Busy);
        }
        Ok(())
    }

    /// Saves pending edits and opens frame `index`. A malformed record file
    /// still moves the cursor; the error is returned so it can be shown.
    pub fn goto(&mut self, index: usize) -> Result<(), SessionError> {
        self.ensure_idle()?;
        let frame = self
            .sequence
            .get(index)
            .cloned()
            .ok_or(SessionError::FrameOutOfRange { index, len: self.sequence.len() })?;
        self.store.flush()?;
        self.cursor = index;
        self.store.load(&frame)?;
        Ok(())
    }

    /// Moves to the next frame. Returns false on the last frame.
    pub fn next(&mut self) -> Result<bool, SessionError> {
        if self.cursor + 1 >= self.sequence.len() {
            self.ensure_idle()?;
            return Ok(false);
        }
        self.goto(self.cursor + 1).map(|_| true)
    }

    /// Moves to the previous frame. Returns false on the first frame.
    pub fn prev(&mut self) -> Result<bool, SessionError> {
        if self.cursor == 0 {
            self.ensure_idle()?;
            return Ok(false);
        }
        self.goto(self.cursor - 1).map(|_| true)
    }

    /// Adds a box to the open frame. Without an explicit track the box starts
    /// a new one using the index suggestion.
    pub fn add_box(&mut self, geometry: Rect, class_id: ClassId, track: Option<TrackId>) -> Result<LocalId, SessionError> {
        self.ensure_idle()?;
        let track = match track {
            Some(track) => track,
            None => self.index.next_suggested(),
        };
        let id = self.store.add(&mut self.index, geometry, class_id, track)?;
        Ok(id)
    }

    pub fn update_box(&mut self, id: LocalId, geometry: Rect) -> Result<bool, SessionError> {
        self.ensure_idle()?;
        Ok(self.store.update_geometry(id, geometry))
    }

    /// Removes a box, dropping its track from the index when nothing else
    /// references it.
    pub fn delete_box(&mut self, id: LocalId) -> Result<bool, SessionError> {
        self.ensure_idle()?;
        let Some(track) = self.store.delete(id) else { return Ok(false) };
        self.release(track);
        Ok(true)
    }

    /// Changes the class of a box. A box made unclassified is no longer
    /// saved, so its track is released if nothing else holds it.
    pub fn set_class(&mut self, id: LocalId, class_id: ClassId) -> Result<bool, SessionError> {
        self.ensure_idle()?;
        let Some(track) = self.store.boxes().get(&id).map(|r| r.track_id) else { return Ok(false) };
        self.store.set_class(&mut self.index, id, class_id);
        if class_id < 0 {
            self.release(track);
        }
        Ok(true)
    }

    /// Moves a box to `track`. The track it left is released if it became
    /// empty.
    pub fn set_track(&mut self, id: LocalId, track: TrackId) -> Result<bool, SessionError> {
        self.ensure_idle()?;
        if track < 0 {
            return Err(StoreError::InvalidTrack(track).into());
        }
        let Some(previous) = self.store.set_track(&mut self.index, id, track) else { return Ok(false) };
        if previous != track {
            self.release(previous);
        }
        Ok(true)
    }

    fn release(&mut self, track: TrackId) {
        let path = self.store.record_path();
        let open = path.as_deref().map(|p| (p, self.store.boxes()));
        self.index.release(self.store.folder(), track, open);
    }

    pub fn save(&mut self) -> Result<(), SessionError> {
        self.store.save()?;
        Ok(())
    }

    /// Fills the gaps between the keyframes of `track`. Pending edits are
    /// saved first and the open frame is reloaded afterwards, since it may
    /// have gained a box.
    pub fn interpolate(&mut self, track: TrackId, cancel: &CancelToken) -> Result<InterpolationReport, SessionError> {
        self.ensure_idle()?;
        self.store.flush()?;
        let report = match interpolate_track(self.store.folder(), &self.sequence, track, cancel) {
            Ok(report) => report,
            Err(e) => return Err(self.resync(e)),
        };
        self.index.rebuild(self.store.folder());
        self.store.reload()?;
        Ok(report)
    }

    pub fn rename_track(
        &mut self,
        old: TrackId,
        new: TrackId,
        policy: CollisionPolicy,
        cancel: &CancelToken,
    ) -> Result<MutationReport, SessionError> {
        self.folder_edit(|folder, index| rename_track(folder, index, old, new, policy, cancel))
    }

    pub fn reclassify_track(
        &mut self,
        track: TrackId,
        class_id: ClassId,
        cancel: &CancelToken,
    ) -> Result<MutationReport, SessionError> {
        self.folder_edit(|folder, index| reclassify_track(folder, index, track, class_id, cancel))
    }

    pub fn swap_tracks(&mut self, a: TrackId, b: TrackId, cancel: &CancelToken) -> Result<MutationReport, SessionError> {
        self.folder_edit(|folder, index| swap_tracks(folder, index, a, b, cancel))
    }

    fn folder_edit(
        &mut self,
        edit: impl FnOnce(&RecordFolder, &mut TrackIndex) -> Result<MutationReport, StoreError>,
    ) -> Result<MutationReport, SessionError> {
        self.ensure_idle()?;
        self.store.flush()?;
        let report = match edit(self.store.folder(), &mut self.index) {
            Ok(report) => report,
            Err(e) => return Err(self.resync(e)),
        };
        self.store.reload()?;
        Ok(report)
    }

    /// Called when a folder operation failed partway: some files may already
    /// be rewritten, so the index and the open frame are read back from disk.
    fn resync(&mut self, error: StoreError) -> SessionError {
        warn!("folder operation failed, rereading records: {error}");
        self.index.rebuild(self.store.folder());
        if let Err(e) = self.store.reload() {
            warn!("reloading open frame: {e}");
        }
        error.into()
    }

    /// Saves pending edits and rebuilds the index from every record file.
    pub fn reconcile(&mut self) -> Result<ScanReport, SessionError> {
        self.ensure_idle()?;
        self.store.flush()?;
        Ok(self.index.rebuild(self.store.folder()))
    }

    /// Starts detection on the open frame in the background.
    pub fn request_detection(&mut self) -> Result<JobId, SessionError> {
        self.ensure_idle()?;
        let jobs = self.jobs.as_ref().ok_or(SessionError::DetectorUnavailable)?;
        let frame = self.store.frame().cloned().ok_or(SessionError::NoFrames)?;
        let image = self.image_dir.join(frame.as_str());
        let id = jobs.enqueue(DetectionRequest { frame: frame.clone(), image })?;
        debug!(job = %id, frame = %frame, "detection requested");
        self.in_flight = Some(InFlight { id: id.clone(), frame });
        Ok(id)
    }

    /// Asks the running detection to stop. The session stays busy until the
    /// worker reports back.
    pub fn cancel_detection(&self) {
        if let (Some(jobs), Some(job)) = (&self.jobs, &self.in_flight) {
            jobs.cancel_job(&job.id);
        }
    }

    /// Applies a finished detection if one is ready. Returns the merge outcome
    /// when boxes were merged into the open frame.
    pub fn poll_detection(&mut self) -> Result<Option<MergeOutcome>, SessionError> {
        let Some(jobs) = self.jobs.clone() else { return Ok(None) };
        while let Some(ev) = jobs.try_next_event() {
            if let Some(outcome) = self.handle_event(ev)? {
                return Ok(Some(outcome));
            }
        }
        Ok(None)
    }

    /// Blocks until the running detection finishes or `timeout` passes.
    pub fn wait_detection(&mut self, timeout: Duration) -> Result<Option<MergeOutcome>, SessionError> {
        let Some(jobs) = self.jobs.clone() else { return Ok(None) };
        let deadline = Instant::now() + timeout;
        while self.is_busy() {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                break;
            }
            if let Some(ev) = jobs.next_event_timeout(left)? {
                if let Some(outcome) = self.handle_event(ev)? {
                    return Ok(Some(outcome));
                }
            }
        }
        Ok(None)
    }

    fn handle_event(&mut self, ev: JobEvent) -> Result<Option<MergeOutcome>, SessionError> {
        let Some(job) = self.in_flight.as_ref() else { return Ok(None) };
        if ev.id != job.id || !ev.status.is_terminal() {
            return Ok(None);
        }
        self.in_flight = None;
        let detections: Vec<Detection> = match ev.status {
            JobStatus::Done(found) => found,
            JobStatus::Failed(msg) => {
                warn!(frame = %ev.frame, "detection failed, nothing to merge: {msg}");
                Vec::new()
            }
            _ => {
                debug!(frame = %ev.frame, "detection canceled");
                return Ok(None);
            }
        };
        if self.store.frame() != Some(&ev.frame) {
            warn!(frame = %ev.frame, "discarding detections for a frame that is no longer open");
            return Ok(None);
        }
        let previous = self.previous_records();
        let outcome = merge_detections(&detections, &mut self.store, &mut self.index, previous.as_ref(), &self.merge)?;
        Ok(Some(outcome))
    }

    /// Records of the frame before the cursor. An unreadable file counts as
    /// no previous frame.
    fn previous_records(&self) -> Option<RecordSet> {
        let frame = self.sequence.get(self.cursor.checked_sub(1)?)?;
        match self.store.folder().read_frame(frame) {
            Ok(set) => set,
            Err(e) => {
                warn!(frame = %frame, "previous frame unreadable, not inheriting tracks: {e}");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use annotations::UNCLASSIFIED;
    use assert_matches::assert_matches;
    use crossbeam_channel::{unbounded, Receiver, Sender};
    use detect::DetectorError;
    use parking_lot::Mutex;

    struct Fixed(Vec<Detection>);

    impl Detector for Fixed {
        fn detect(&self, _image: &Path) -> Result<Vec<Detection>, DetectorError> { Ok(self.0.clone()) }
    }

    /// Holds every run until the test releases it.
    struct Gate {
        release: Mutex<Receiver<()>>,
        found: Vec<Detection>,
    }

    impl Detector for Gate {
        fn detect(&self, _image: &Path) -> Result<Vec<Detection>, DetectorError> {
            let _ = self.release.lock().recv();
            Ok(self.found.clone())
        }
    }

    fn gate(found: Vec<Detection>) -> (Arc<Gate>, Sender<()>) {
        let (tx, rx) = unbounded();
        (Arc::new(Gate { release: Mutex::new(rx), found }), tx)
    }

    fn session(dir: &Path, frames: usize) -> Session {
        let sequence = FrameSequence::from_names((0..frames).map(|i| format!("{i:04}.jpg")));
        let folder = RecordFolder::new(dir.join("records"));
        Session::with_sequence(&dir.join("images"), sequence, folder, MergeConfig::default()).unwrap().0
    }

    fn rect(x: f64) -> Rect { Rect::new(x, 0.0, x + 10.0, 10.0) }

    const WAIT: Duration = Duration::from_secs(5);

    #[test]
    fn empty_sequence_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let result = Session::with_sequence(
            dir.path(),
            FrameSequence::from_names(Vec::<String>::new()),
            RecordFolder::new(dir.path()),
            MergeConfig::default(),
        );
        assert_matches!(result, Err(SessionError::NoFrames));
    }

    #[test]
    fn navigation_saves_before_leaving() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = session(dir.path(), 3);
        s.add_box(rect(0.0), 1, None).unwrap();
        assert!(s.next().unwrap());
        assert!(s.boxes().is_empty());
        assert!(s.prev().unwrap());
        assert_eq!(s.boxes().len(), 1);
        assert!(!s.prev().unwrap());
        assert_matches!(s.goto(7), Err(SessionError::FrameOutOfRange { index: 7, len: 3 }));
    }

    #[test]
    fn new_boxes_take_fresh_tracks() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = session(dir.path(), 1);
        let a = s.add_box(rect(0.0), 1, None).unwrap();
        let b = s.add_box(rect(20.0), 2, None).unwrap();
        assert_eq!(s.boxes()[&a].track_id, 1);
        assert_eq!(s.boxes()[&b].track_id, 2);
        assert_eq!(s.index().next_suggested(), 3);
    }

    #[test]
    fn retracking_last_box_releases_old_track() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = session(dir.path(), 1);
        let id = s.add_box(rect(0.0), 1, Some(4)).unwrap();
        assert!(s.set_track(id, 9).unwrap());
        assert!(!s.index().contains(4));
        assert_eq!(s.index().class_of(9), Some(1));
        assert!(s.delete_box(id).unwrap());
        assert!(s.index().is_empty());
    }

    #[test]
    fn folder_operations_reload_the_open_frame() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = session(dir.path(), 4);
        s.add_box(rect(0.0), 1, Some(5)).unwrap();
        s.goto(3).unwrap();
        s.add_box(rect(30.0), 1, Some(5)).unwrap();
        s.goto(1).unwrap();

        let report = s.interpolate(5, &CancelToken::new()).unwrap();
        assert_eq!(report.inserted, 2);
        assert_eq!(s.boxes().len(), 1);

        s.rename_track(5, 8, CollisionPolicy::Reject, &CancelToken::new()).unwrap();
        assert!(s.boxes().values().all(|r| r.track_id == 8));
        assert_eq!(s.index().entries().keys().copied().collect::<Vec<_>>(), vec![8]);

        let report = s.reconcile().unwrap();
        assert!(report.is_clean());
        assert_eq!(report.files_read, 4);
    }

    #[test]
    fn unclassified_boxes_leave_no_index_entry() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = session(dir.path(), 1);
        let id = s.add_box(rect(0.0), UNCLASSIFIED, None).unwrap();
        assert_eq!(s.boxes()[&id].track_id, 1);
        assert!(s.index().is_empty());
        assert_eq!(s.index().next_suggested(), 2);

        let other = s.add_box(rect(20.0), 3, Some(4)).unwrap();
        assert!(s.set_class(other, UNCLASSIFIED).unwrap());
        assert!(!s.index().contains(4));
        assert!(!s.set_class(other + 1, 2).unwrap());

        s.save().unwrap();
        let mut rebuilt = TrackIndex::new();
        rebuilt.rebuild(s.folder());
        assert_eq!(s.index().entries(), rebuilt.entries());
    }

    #[cfg(unix)]
    #[test]
    fn failed_folder_operation_rereads_disk() {
        use std::fs;
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let records = dir.path().join("records");
        let mut s = session(dir.path(), 3);
        s.add_box(rect(0.0), 1, Some(5)).unwrap();
        s.goto(2).unwrap();
        s.add_box(rect(20.0), 1, Some(5)).unwrap();
        s.goto(0).unwrap();

        fs::set_permissions(&records, fs::Permissions::from_mode(0o555)).unwrap();
        if fs::write(records.join("check.tmp"), b"").is_ok() {
            // permissions are not enforced for this user
            fs::set_permissions(&records, fs::Permissions::from_mode(0o755)).unwrap();
            return;
        }
        // existing files stay writable; only new files in the folder fail
        let first = records.join("0000.json");
        let with_class = |class: ClassId| {
            format!(
                r#"{{"0": {{"box": [0, 0, 10, 10], "class": 1, "track_id": 5}}, "1": {{"box": [40, 0, 50, 10], "class": {class}, "track_id": 9}}}}"#
            )
        };
        fs::write(&first, with_class(3)).unwrap();
        let interpolated = s.interpolate(5, &CancelToken::new());
        let after_interpolate = (s.boxes().len(), s.index().class_of(9));

        fs::write(&first, with_class(6)).unwrap();
        let reclassified = s.reclassify_track(5, 2, &CancelToken::new());
        let after_reclassify = (s.boxes()[&1].class_id, s.index().class_of(9), s.index().class_of(5));
        fs::set_permissions(&records, fs::Permissions::from_mode(0o755)).unwrap();

        assert_matches!(interpolated, Err(SessionError::Store(StoreError::Io { .. })));
        assert_eq!(after_interpolate, (2, Some(3)));
        assert_matches!(reclassified, Err(SessionError::Store(StoreError::Io { .. })));
        assert_eq!(after_reclassify, (6, Some(6), Some(1)));
    }

    #[test]
    fn detection_without_detector_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = session(dir.path(), 1);
        assert_matches!(s.request_detection(), Err(SessionError::DetectorUnavailable));
        assert!(!s.is_busy());
    }

    #[test]
    fn detection_result_is_merged_with_previous_frame_tracks() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = session(dir.path(), 2);
        s.add_box(rect(0.0), 2, Some(7)).unwrap();
        s.next().unwrap();
        s.attach_detector(Arc::new(Fixed(vec![
            Detection::new(Rect::new(1.0, 0.0, 11.0, 10.0), 9),
            Detection::new(Rect::new(50.0, 50.0, 80.0, 80.0), 4),
        ])));

        s.request_detection().unwrap();
        let outcome = s.wait_detection(WAIT).unwrap().expect("detection finished");
        assert_eq!((outcome.inherited, outcome.new_tracks), (1, 1));
        let tracks: Vec<_> = s.boxes().values().map(|r| (r.track_id, r.class_id)).collect();
        assert_eq!(tracks, vec![(7, 2), (8, 4)]);
        assert!(!s.is_busy());
    }

    #[test]
    fn mutations_are_refused_while_detecting() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = session(dir.path(), 2);
        let (detector, release) = gate(vec![Detection::new(rect(0.0), 1)]);
        s.attach_detector(detector);

        s.request_detection().unwrap();
        assert!(s.is_busy());
        assert_matches!(s.next(), Err(SessionError::Busy));
        assert_matches!(s.add_box(rect(40.0), 1, None), Err(SessionError::Busy));
        assert_matches!(s.swap_tracks(1, 2, &CancelToken::new()), Err(SessionError::Busy));
        assert_matches!(s.request_detection(), Err(SessionError::Busy));
        assert_eq!(s.cursor(), 0);

        release.send(()).unwrap();
        assert!(s.wait_detection(WAIT).unwrap().is_some());
        assert_eq!(s.boxes().len(), 1);
        assert!(s.next().unwrap());
    }

    #[test]
    fn canceled_detection_merges_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = session(dir.path(), 1);
        let (detector, release) = gate(vec![Detection::new(rect(0.0), 1)]);
        s.attach_detector(detector);

        s.request_detection().unwrap();
        s.cancel_detection();
        release.send(()).unwrap();
        assert!(s.wait_detection(WAIT).unwrap().is_none());
        assert!(!s.is_busy());
        assert!(s.boxes().is_empty());
    }

    #[test]
    fn result_for_another_frame_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = session(dir.path(), 2);
        s.in_flight = Some(InFlight { id: "job-1".into(), frame: FrameId::new("0001.jpg") });
        let ev = JobEvent {
            id: "job-1".into(),
            frame: FrameId::new("0001.jpg"),
            status: JobStatus::Done(vec![Detection::new(rect(0.0), 1)]),
        };
        assert!(s.handle_event(ev).unwrap().is_none());
        assert!(!s.is_busy());
        assert!(s.boxes().is_empty());
    }

    #[test]
    fn failed_detection_merges_an_empty_result() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = session(dir.path(), 1);
        s.in_flight = Some(InFlight { id: "job-2".into(), frame: FrameId::new("0000.jpg") });
        let ev = JobEvent { id: "job-2".into(), frame: FrameId::new("0000.jpg"), status: JobStatus::Failed("boom".into()) };
        let outcome = s.handle_event(ev).unwrap().expect("empty merge");
        assert!(outcome.added.is_empty());
        assert!(!s.is_busy());
    }
}
