//! Error classification shared by every component.
//!
//! The orchestrator never matches on strings: every fallible operation resolves to one
//! of the [`Kind`] variants below, which it counts and reacts to categorically.

use std::fmt;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// The category of a failure, independent of which component raised it.
///
/// Per-file and per-class kinds are recoverable (the orchestrator drops the offending
/// member and continues); `StoreError` and an unmet `Unsupported` on a required feature
/// are fatal to the whole pass.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    /// The ioctl used is not available on this kernel.
    #[error("unsupported")]
    Unsupported,
    /// The calling process lacks the privilege to perform the operation.
    #[error("permission")]
    Permission,
    /// The file disappeared between indexing and locking.
    #[error("vanished")]
    Vanished,
    /// The file was already immutable at lock-acquisition time, left over from an
    /// interrupted prior run rather than set by this one.
    #[error("already immutable")]
    AlreadyImmutable,
    /// A writer was found during the `/proc` sweep.
    #[error("busy")]
    Busy,
    /// The stability recheck found the file changed since it was indexed.
    #[error("changed")]
    Changed,
    /// The byte comparison found the candidate differs from the reference.
    #[error("mismatch")]
    Mismatch,
    /// A read or ioctl I/O error occurred during compare or clone.
    #[error("io error")]
    IoError,
    /// The state store failed to commit.
    #[error("store error")]
    StoreError,
}

impl Kind {
    /// Whether a failure of this kind is recoverable at file/class granularity.
    ///
    /// `false` means the failure is fatal to the whole pass.
    pub fn is_recoverable(self) -> bool {
        !matches!(self, Kind::StoreError)
    }
}

/// A classified error, carrying enough context for logging and `Display` without ever
/// surfacing a raw string as the reason callers branch on.
#[derive(Debug)]
pub struct DedupError {
    kind: Kind,
    /// The path this error concerns, if any.
    path: Option<PathBuf>,
    /// Human-readable detail, used only for `Display`/logging, never matched on.
    detail: String,
    source: Option<io::Error>,
}

impl DedupError {
    pub fn new(kind: Kind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            path: None,
            detail: detail.into(),
            source: None,
        }
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_source(mut self, source: io::Error) -> Self {
        self.source = Some(source);
        self
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn path(&self) -> Option<&std::path::Path> {
        self.path.as_deref()
    }

    /// Prefixes the detail message with the name of the operation that failed, e.g.
    /// the ioctl name. Cheap enough to call unconditionally at every call site.
    pub fn context(mut self, op: &str) -> Self {
        self.detail = format!("{op}: {}", self.detail);
        self
    }

    /// Builds a classified error directly from an `io::Error`'s errno, for call sites that
    /// only need the generic mapping (permission denied / not found / everything else).
    pub fn from_io(kind_hint: Kind, err: io::Error, path: Option<PathBuf>) -> Self {
        let kind = match err.kind() {
            io::ErrorKind::PermissionDenied => Kind::Permission,
            io::ErrorKind::NotFound => Kind::Vanished,
            _ => kind_hint,
        };
        Self {
            kind,
            path,
            detail: err.to_string(),
            source: Some(err),
        }
    }
}

impl fmt::Display for DedupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.path {
            Some(p) => write!(f, "{}: {}: {}", p.display(), self.kind, self.detail),
            None => write!(f, "{}: {}", self.kind, self.detail),
        }
    }
}

impl std::error::Error for DedupError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e as &(dyn std::error::Error + 'static))
    }
}

impl From<io::Error> for DedupError {
    fn from(err: io::Error) -> Self {
        DedupError::from_io(Kind::IoError, err, None)
    }
}

pub type Result<T> = std::result::Result<T, DedupError>;
