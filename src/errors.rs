use thiserror::Error;

use crate::oid::OidParseError;
use crate::store::StoreError;

/// What went wrong while parsing a patch stream. Parse errors are
/// fatal for the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseErrorKind {
    BadHeader,
    BadHunkHeader,
    BadHunkBody,
    BadBase85,
    BadDeflate,
    InconsistentHeader,
    MissingFilename,
    CorruptBinary,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ParseError {
    pub line: usize,
    pub kind: ParseErrorKind,
    pub message: String,
}

impl ParseError {
    pub fn new(line: usize, kind: ParseErrorKind, message: impl Into<String>) -> ParseError {
        ParseError {
            line,
            kind,
            message: message.into(),
        }
    }
}

/// Where a to-be-created path already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExistsWhere {
    Index,
    Worktree,
    IndexAsIntentToAdd,
}

/// Why a record could not be applied. Apply errors are recoverable at
/// the batch level: they fail the record (or divert it to a reject
/// file) rather than the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyErrorKind {
    DoesNotMatch,
    PathNotFound,
    PathAlreadyExists(ExistsWhere),
    BeyondSymlink,
    TypeMismatch,
    WhitespaceFatal,
    PreimageHashMismatch,
    PostimageHashMismatch,
    InvalidPath,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ApplyError {
    pub path: String,
    pub kind: ApplyErrorKind,
    pub message: String,
}

impl ApplyError {
    pub fn new(path: impl Into<String>, kind: ApplyErrorKind, message: impl Into<String>) -> ApplyError {
        ApplyError {
            path: path.into(),
            kind,
            message: message.into(),
        }
    }
}

/// Top-level error type of the engine.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Apply(#[from] ApplyError),
    #[error(transparent)]
    Oid(#[from] OidParseError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
