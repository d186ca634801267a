use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::codec::RecordFile;
use crate::{FrameId, RecordSet, StoreError};

pub const RECORD_EXTENSION: &str = "json";

/// Files starting with this prefix (class tables) live next to the records
/// but are never treated as frame records.
pub const RESERVED_PREFIX: &str = "classes";

/// A file that could not be read during a tolerant scan.
#[derive(Debug)]
pub struct ScanFailure {
    pub path: PathBuf,
    pub error: StoreError,
}

#[derive(Debug, Default)]
pub struct ScanReport {
    pub files_read: usize,
    pub failures: Vec<ScanFailure>,
}

impl ScanReport {
    pub fn is_clean(&self) -> bool { self.failures.is_empty() }

    pub(crate) fn absorb(&mut self, path: PathBuf, error: StoreError) {
        warn!("skipping {}: {}", path.display(), error);
        self.failures.push(ScanFailure { path, error });
    }
}

/// Directory holding one record file per frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordFolder {
    dir: PathBuf,
}

impl RecordFolder {
    pub fn new(dir: impl Into<PathBuf>) -> Self { Self { dir: dir.into() } }

    pub fn dir(&self) -> &Path { &self.dir }

    pub fn path_for(&self, frame: &FrameId) -> PathBuf { self.dir.join(frame.record_file_name()) }

    pub fn ensure_exists(&self) -> Result<(), StoreError> {
        fs::create_dir_all(&self.dir).map_err(|e| StoreError::io(&self.dir, e))
    }

    /// Reads one record file. `Ok(None)` means the file does not exist, which
    /// is an empty frame rather than an error.
    pub fn read(&self, path: &Path) -> Result<Option<RecordSet>, StoreError> {
        Ok(self.read_file(path)?.map(|file| file.records))
    }

    /// Like [`RecordFolder::read`], keeping the raw entries so the file can be
    /// rewritten without losing what the edit did not touch.
    pub fn read_file(&self, path: &Path) -> Result<Option<RecordFile>, StoreError> {
        let bytes = match fs::read(path) {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::io(path, e)),
        };
        RecordFile::decode(&bytes)
            .map(Some)
            .map_err(|source| StoreError::MalformedRecord { path: path.to_path_buf(), source })
    }

    pub fn read_frame(&self, frame: &FrameId) -> Result<Option<RecordSet>, StoreError> {
        self.read(&self.path_for(frame))
    }

    /// Writes `set` as a fresh file, replacing whatever was there.
    pub fn write(&self, path: &Path, set: &RecordSet) -> Result<(), StoreError> {
        self.rewrite(path, &RecordFile::default(), set).map(|_| ())
    }

    /// Writes `records` over `file`, which was read from `path`, and returns
    /// the file as now stored.
    pub fn rewrite(&self, path: &Path, file: &RecordFile, records: &RecordSet) -> Result<RecordFile, StoreError> {
        let malformed = |source| StoreError::MalformedRecord { path: path.to_path_buf(), source };
        let bytes = file.encode(records).map_err(malformed)?;
        self.replace(path, &bytes)?;
        debug!(path = %path.display(), records = records.len(), "wrote record file");
        RecordFile::decode(&bytes).map_err(malformed)
    }

    /// The new content goes to a temporary file in the same directory which
    /// is then renamed over the target.
    fn replace(&self, path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
        let dir = path.parent().unwrap_or(&self.dir);
        fs::create_dir_all(dir).map_err(|e| StoreError::io(dir, e))?;
        let mut tmp = NamedTempFile::new_in(dir).map_err(|e| StoreError::io(dir, e))?;
        tmp.write_all(bytes).map_err(|e| StoreError::io(tmp.path(), e))?;
        tmp.as_file().sync_all().map_err(|e| StoreError::io(tmp.path(), e))?;
        tmp.persist(path).map_err(|e| StoreError::io(path, e.error))?;
        Ok(())
    }

    pub fn write_frame(&self, frame: &FrameId, set: &RecordSet) -> Result<(), StoreError> {
        self.write(&self.path_for(frame), set)
    }

    /// Record files of the folder in file-name order. Class tables and
    /// anything without the record extension are left out. A missing folder
    /// has no records.
    pub fn record_files(&self) -> Vec<PathBuf> {
        if !self.dir.is_dir() {
            return Vec::new();
        }
        WalkDir::new(&self.dir)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|entry| match entry {
                Ok(e) => Some(e),
                Err(e) => {
                    warn!("cannot list record folder entry: {e}");
                    None
                }
            })
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .filter(|p| is_record_file(p))
            .collect()
    }

    /// Reads every record file, handing each parsed set to `visit`. Files that
    /// fail to read are collected in the report and skipped.
    pub fn scan(&self, mut visit: impl FnMut(&Path, RecordSet)) -> ScanReport {
        let mut report = ScanReport::default();
        for path in self.record_files() {
            match self.read(&path) {
                Ok(Some(set)) => {
                    report.files_read += 1;
                    visit(&path, set);
                }
                // removed between listing and reading
                Ok(None) => {}
                Err(e) => report.absorb(path, e),
            }
        }
        report
    }
}

fn is_record_file(path: &Path) -> bool {
    let ext_ok = path.extension().and_then(|e| e.to_str()) == Some(RECORD_EXTENSION);
    let name_ok = path
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| !n.starts_with(RESERVED_PREFIX));
    ext_ok && name_ok
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BoxRecord, Rect};

    #[test]
    fn missing_file_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let folder = RecordFolder::new(dir.path());
        assert!(folder.read(&dir.path().join("nope.json")).unwrap().is_none());
        assert!(RecordFolder::new(dir.path().join("absent")).record_files().is_empty());
    }

    #[test]
    fn malformed_file_is_distinguishable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.json");
        fs::write(&path, "{ truncated").unwrap();
        let err = RecordFolder::new(dir.path()).read(&path).unwrap_err();
        assert!(err.is_malformed());
    }

    #[test]
    fn write_creates_folder_and_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let folder = RecordFolder::new(dir.path().join("seq_json"));
        let mut set = RecordSet::new();
        set.insert(0, BoxRecord::new(Rect::new(0.0, 0.0, 10.0, 10.0), 1, 1));
        let frame = FrameId::new("000001.jpg");
        folder.write_frame(&frame, &set).unwrap();
        assert_eq!(folder.read_frame(&frame).unwrap(), Some(set));
        let names: Vec<_> = fs::read_dir(folder.dir()).unwrap().map(|e| e.unwrap().file_name()).collect();
        assert_eq!(names, vec![std::ffi::OsString::from("000001.json")]);
    }

    #[test]
    fn listing_skips_class_tables_and_other_files() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.json", "a.json", "classes.json", "notes.txt"] {
            fs::write(dir.path().join(name), "{}").unwrap();
        }
        let files = RecordFolder::new(dir.path()).record_files();
        let names: Vec<_> = files.iter().map(|p| p.file_name().unwrap().to_str().unwrap()).collect();
        assert_eq!(names, ["a.json", "b.json"]);
    }

    #[test]
    fn scan_collects_failures_and_continues() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.json"), "garbage").unwrap();
        fs::write(dir.path().join("b.json"), r#"{"0": {"box": [0,0,9,9], "class": 1, "track_id": 2}}"#).unwrap();
        let mut seen = 0;
        let report = RecordFolder::new(dir.path()).scan(|_, set| seen += set.len());
        assert_eq!(seen, 1);
        assert_eq!(report.files_read, 1);
        assert_eq!(report.failures.len(), 1);
        assert!(report.failures[0].path.ends_with("a.json"));
    }
}
