//! The error taxonomy shared by every component. One [`VefsError`] kind per
//! failure class named in the archive's on-disk contract; callers match on
//! `.kind()` rather than the wrapped source, since the source varies by
//! platform (`io::Error`) or cause (a CBOR decode failure, a bad MAC, ...).

use std::fmt;
use std::io;

/// Structured detail attached to an error, filled in opportunistically by
/// whichever layer first notices the failure. Not every field applies to
/// every [`ErrorKind`].
#[derive(Debug, Default, Clone)]
pub struct ErrorDetail {
    pub sector_idx: Option<u64>,
    pub archive_file_id: Option<uuid::Uuid>,
    pub path: Option<String>,
}

impl ErrorDetail {
    pub fn with_sector(mut self, sector_idx: u64) -> Self {
        self.sector_idx = Some(sector_idx);
        self
    }

    pub fn with_file_id(mut self, id: uuid::Uuid) -> Self {
        self.archive_file_id = Some(id);
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum VefsError {
    #[error("invalid argument")]
    InvalidArgument,

    #[error("the host file does not start with the vefs magic")]
    InvalidPrefix,

    #[error("static header exceeds the space reserved for it")]
    OversizedStaticHeader,

    #[error("the supplied user PRK does not open this archive")]
    WrongUserPrk,

    #[error("authentication tag did not verify")]
    TagMismatch,

    #[error("both archive header slots carry the same secret counter")]
    IdenticalHeaderVersion,

    #[error("neither archive header slot decrypts")]
    NoArchiveHeader,

    #[error("tree position is outside the file's current extent")]
    SectorReferenceOutOfRange,

    #[error("index entry is malformed")]
    CorruptIndexEntry,

    #[error("index entry spans a sector boundary")]
    IndexEntrySpanningBlocks,

    #[error("no such file")]
    NoSuchFile,

    #[error("a file already exists at this path")]
    KeyAlreadyExists,

    #[error("resource is still referenced")]
    StillInUse,

    #[error("page is not loaded")]
    NotLoaded,

    #[error("no free sectors remain")]
    ResourceExhausted,

    #[error("allocation failed")]
    NotEnoughMemory,

    #[error("i/o or crypto provider failure: {0}")]
    Bad(#[source] io::Error),

    /// Internal retry sentinel: a reader observed a tree depth/MAC that was
    /// concurrently superseded by a grower. Never returned from a public API
    /// — every public entry point that can observe it retries instead.
    #[error("internal: retry (stale tree generation)")]
    DeviceBusy,
}

/// A [`VefsError`] together with whatever structured detail was available
/// where it was raised.
#[derive(Debug)]
pub struct Error {
    pub kind: VefsError,
    pub detail: ErrorDetail,
}

impl Error {
    pub fn new(kind: VefsError) -> Self {
        Self { kind, detail: ErrorDetail::default() }
    }

    pub fn with_detail(kind: VefsError, detail: ErrorDetail) -> Self {
        Self { kind, detail }
    }

    pub fn is_device_busy(&self) -> bool {
        matches!(self.kind, VefsError::DeviceBusy)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(idx) = self.detail.sector_idx {
            write!(f, " (sector {idx})")?;
        }
        if let Some(id) = self.detail.archive_file_id {
            write!(f, " (file {id})")?;
        }
        if let Some(path) = &self.detail.path {
            write!(f, " (path {path})")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.kind)
    }
}

impl From<VefsError> for Error {
    fn from(kind: VefsError) -> Self {
        Error::new(kind)
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::new(VefsError::Bad(e))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
