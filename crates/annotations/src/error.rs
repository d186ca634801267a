use geometry::GeometryError;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::codec::CodecError;
use crate::{ClassId, TrackId};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("malformed record file {}: {source}", .path.display())]
    MalformedRecord {
        path: PathBuf,
        #[source]
        source: CodecError,
    },
    #[error("i/o error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("track {0} already exists in this sequence; confirm a merge to proceed")]
    IdentityCollision(TrackId),
    #[error("invalid track id {0}")]
    InvalidTrack(TrackId),
    #[error("invalid class id {0}")]
    InvalidClass(ClassId),
    #[error("no frame is open")]
    NoFrameOpen,
    #[error(transparent)]
    Geometry(#[from] GeometryError),
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        StoreError::Io { path: path.into(), source }
    }

    pub fn is_malformed(&self) -> bool { matches!(self, StoreError::MalformedRecord { .. }) }
}
