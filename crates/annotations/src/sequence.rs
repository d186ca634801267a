use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::folder::RECORD_EXTENSION;
use crate::StoreError;

pub const IMAGE_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

/// Name of the directory, next to the image folder's parent, that holds the
/// record folders of all sequences.
pub const ANNOTATIONS_DIR: &str = "annotations";

/// Suffix appended to the sequence name to form its record folder.
pub const RECORD_DIR_SUFFIX: &str = "_json";

/// Identifies a frame by its image file name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FrameId(String);

impl FrameId {
    pub fn new(name: impl Into<String>) -> Self { Self(name.into()) }

    pub fn as_str(&self) -> &str { &self.0 }

    /// File name without its extension.
    pub fn stem(&self) -> &str {
        Path::new(&self.0).file_stem().and_then(|s| s.to_str()).unwrap_or(&self.0)
    }

    pub fn record_file_name(&self) -> String { format!("{}.{}", self.stem(), RECORD_EXTENSION) }
}

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

/// Frames of one image sequence in sorted file-name order. The position of a
/// frame in this list is its time coordinate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameSequence {
    frames: Vec<FrameId>,
}

impl FrameSequence {
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut frames: Vec<FrameId> = names.into_iter().map(|n| FrameId::new(n)).collect();
        frames.sort();
        frames.dedup();
        Self { frames }
    }

    /// Lists the image files directly inside `dir`.
    pub fn from_image_dir(dir: &Path) -> Result<Self, StoreError> {
        let mut names = Vec::new();
        for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
            let entry = entry.map_err(|e| {
                let path = e.path().unwrap_or(dir).to_path_buf();
                StoreError::io(path, e.into())
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if is_image_name(name) {
                    names.push(name.to_string());
                }
            }
        }
        Ok(Self::from_names(names))
    }

    pub fn len(&self) -> usize { self.frames.len() }

    pub fn is_empty(&self) -> bool { self.frames.is_empty() }

    pub fn get(&self, index: usize) -> Option<&FrameId> { self.frames.get(index) }

    pub fn position(&self, frame: &FrameId) -> Option<usize> { self.frames.binary_search(frame).ok() }

    pub fn iter(&self) -> impl Iterator<Item = &FrameId> { self.frames.iter() }
}

fn is_image_name(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    IMAGE_EXTENSIONS.iter().any(|ext| lower.ends_with(&format!(".{ext}")))
}

/// Record folder of an image sequence folder `<root>/<seq>`:
/// `<root>/annotations/<seq>_json`.
pub fn record_dir_for(image_dir: &Path) -> PathBuf {
    let root = image_dir.parent().unwrap_or_else(|| Path::new("."));
    let name = image_dir.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    root.join(ANNOTATIONS_DIR).join(format!("{name}{RECORD_DIR_SUFFIX}"))
}
