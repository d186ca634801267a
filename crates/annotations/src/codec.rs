//! On-disk schema of a frame record file.
//!
//! ```json
//! {
//!     "0": { "box": [x1, y1, x2, y2], "class": 3, "track_id": 7 }
//! }
//! ```
//!
//! Keys are local ids written as decimal strings. Entries without a `box`
//! are not boxes; a missing `track_id` means untracked and a missing `class`
//! means unclassified.

use serde::Serialize;
use serde_json::ser::PrettyFormatter;
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

use crate::{next_local_id, BoxRecord, LocalId, RecordSet};

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("invalid json: {0}")]
    Syntax(#[from] serde_json::Error),
    #[error("record key {0:?} is not a non-negative integer")]
    BadKey(String),
    #[error("record {key:?}: {source}")]
    Entry {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Entries of a record file exactly as stored, keyed by local id.
pub type RawEntries = BTreeMap<LocalId, Value>;

/// A record file as read: the boxes it holds plus the raw entries they were
/// decoded from.
///
/// Re-encoding through [`RecordFile::encode`] writes entries that did not
/// change back as they were read. That keeps entries without a `box`, records
/// stored without a class, and fields this schema does not know about.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordFile {
    pub records: RecordSet,
    raw: RawEntries,
}

impl RecordFile {
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let entries: BTreeMap<String, Value> = serde_json::from_slice(bytes)?;
        let mut file = RecordFile::default();
        for (key, value) in entries {
            let id: LocalId = key.trim().parse().map_err(|_| CodecError::BadKey(key.clone()))?;
            if !value.as_object().is_some_and(|o| !o.contains_key("box")) {
                let record: BoxRecord =
                    serde_json::from_value(value.clone()).map_err(|source| CodecError::Entry { key, source })?;
                file.records.insert(id, record);
            }
            file.raw.insert(id, value);
        }
        Ok(file)
    }

    /// First local id above every entry of the file, boxes or not.
    pub fn next_local_id(&self) -> LocalId {
        let raw = self.raw.keys().next_back().map_or(0, |max| max + 1);
        raw.max(next_local_id(&self.records))
    }

    /// Encodes `records` as the new content of this file.
    ///
    /// Unchanged records and entries without a box are copied verbatim. A
    /// changed record only has its changed fields rewritten. Records that are
    /// new or became unclassified are written only when classified.
    pub fn encode(&self, records: &RecordSet) -> Result<Vec<u8>, CodecError> {
        let mut out: RawEntries =
            self.raw.iter().filter(|(id, _)| !self.records.contains_key(id)).map(|(id, v)| (*id, v.clone())).collect();
        for (id, record) in records {
            let value = match (self.records.get(id), self.raw.get(id)) {
                (Some(before), Some(raw)) if before == record => raw.clone(),
                (Some(before), Some(raw)) if record.is_classified() || !before.is_classified() => {
                    patch(raw.clone(), before, record)?
                }
                _ if record.is_classified() => serde_json::to_value(record)?,
                _ => continue,
            };
            out.insert(*id, value);
        }
        let mut bytes = Vec::with_capacity(64 + out.len() * 96);
        let mut ser = serde_json::Serializer::with_formatter(&mut bytes, PrettyFormatter::with_indent(b"    "));
        out.serialize(&mut ser)?;
        Ok(bytes)
    }
}

fn patch(mut raw: Value, before: &BoxRecord, after: &BoxRecord) -> Result<Value, CodecError> {
    let Some(entry) = raw.as_object_mut() else { return Ok(serde_json::to_value(after)?) };
    if before.geometry != after.geometry {
        entry.insert("box".into(), serde_json::to_value(after.geometry)?);
    }
    if before.class_id != after.class_id {
        entry.insert("class".into(), after.class_id.into());
    }
    if before.track_id != after.track_id {
        entry.insert("track_id".into(), after.track_id.into());
    }
    Ok(raw)
}

pub fn decode(bytes: &[u8]) -> Result<RecordSet, CodecError> { RecordFile::decode(bytes).map(|f| f.records) }

/// Deterministic encoding of a fresh set: keys in ascending numeric order,
/// four-space indentation, unclassified records left out.
pub fn encode(set: &RecordSet) -> Result<Vec<u8>, CodecError> { RecordFile::default().encode(set) }
