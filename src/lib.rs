//! Patch application engine.
//!
//! `applique` parses unified diff streams -- including the git-style
//! extensions for renames, copies, mode changes, and binary deltas --
//! validates them against the working tree, staging index, or object
//! store, applies hunks with configurable fuzz and whitespace
//! tolerance, and optionally falls back to a three-way merge. Results
//! are written to the working tree and index, or diverted into `.rej`
//! reject files; new objects land in a quarantine directory that is
//! promoted into the object store only when the whole apply succeeds.

pub mod apply;
pub mod binary;
pub mod coremap;
pub mod errors;
pub mod image;
pub mod matcher;
pub mod oid;
pub mod oidset;
pub mod parse;
pub mod quarantine;
pub mod store;
pub mod strbuf;
pub mod threeway;
pub mod util;
pub mod ws;

pub use apply::{Applier, ApplyOptions, ApplySummary, Workspace};
pub use errors::{ApplyError, ApplyErrorKind, Error, ParseError, ParseErrorKind, Result};
pub use oid::{HashAlgo, ObjectId, OidPrefix};
pub use parse::{Fragment, Patch};
