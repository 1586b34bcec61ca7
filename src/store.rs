//! Content-addressed object storage, the staging index, and worktree
//! access helpers.
//!
//! Objects are stored loose: zlib-deflated `"<kind> <len>\0"` header
//! plus payload, fanned out under two-hex-digit subdirectories. The
//! index persists as a bincode stream behind a magic header, the same
//! shape as any other on-disk artifact of this crate.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::oid::{HashAlgo, ObjectId};

/// Regular-file mode bits used when a patch does not say otherwise.
pub const MODE_REGULAR: u32 = 0o100644;
pub const MODE_EXECUTABLE: u32 = 0o100755;
pub const MODE_SYMLINK: u32 = 0o120000;
/// Submodule (gitlink) mode; such entries are never merged textually.
pub const MODE_GITLINK: u32 = 0o160000;
const MODE_TYPE_MASK: u32 = 0o170000;

pub fn mode_type_bits(mode: u32) -> u32 {
    mode & MODE_TYPE_MASK
}

pub fn is_symlink_mode(mode: u32) -> bool {
    mode_type_bits(mode) == MODE_SYMLINK
}

pub fn is_gitlink_mode(mode: u32) -> bool {
    mode_type_bits(mode) == MODE_GITLINK
}

/// The object types the engine reads and writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Blob,
    Tree,
    Commit,
    Tag,
}

impl ObjectKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ObjectKind::Blob => "blob",
            ObjectKind::Tree => "tree",
            ObjectKind::Commit => "commit",
            ObjectKind::Tag => "tag",
        }
    }

    pub fn parse(s: &[u8]) -> Option<ObjectKind> {
        match s {
            b"blob" => Some(ObjectKind::Blob),
            b"tree" => Some(ObjectKind::Tree),
            b"commit" => Some(ObjectKind::Commit),
            b"tag" => Some(ObjectKind::Tag),
            _ => None,
        }
    }
}

/// Hash an object: the `"<kind> <len>\0"` header followed by the
/// payload, under `algo`.
pub fn hash_object(algo: HashAlgo, kind: ObjectKind, data: &[u8]) -> ObjectId {
    let header = format!("{} {}\0", kind.as_str(), data.len());
    match algo {
        HashAlgo::Sha1 => {
            use sha1::{Digest, Sha1};
            let mut hasher = Sha1::new();
            hasher.update(header.as_bytes());
            hasher.update(data);
            ObjectId::from_raw(algo, &hasher.finalize())
        }
        HashAlgo::Blake3 => {
            let mut hasher = blake3::Hasher::new();
            hasher.update(header.as_bytes());
            hasher.update(data);
            ObjectId::from_raw(algo, hasher.finalize().as_bytes())
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object {0} not found")]
    NotFound(ObjectId),
    #[error("object {oid} already exists with different content")]
    Collision { oid: ObjectId },
    #[error("corrupt object {oid}: {reason}")]
    Corrupt { oid: ObjectId, reason: String },
    #[error("index file is corrupt: {0}")]
    CorruptIndex(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Minimal object-store interface the engine consumes.
pub trait ObjectStore {
    fn algo(&self) -> HashAlgo;
    fn read(&self, oid: &ObjectId) -> Result<(ObjectKind, Vec<u8>), StoreError>;
    /// Hash and persist atomically. Idempotent on repeated hashes;
    /// rejects a write whose hash collides with different bytes.
    fn write(&mut self, kind: ObjectKind, data: &[u8]) -> Result<ObjectId, StoreError>;
    fn has(&self, oid: &ObjectId) -> bool;
}

/// Loose-object store rooted at an object directory. Writes can be
/// redirected into a quarantine directory; reads consult the
/// quarantine first, then the main directory.
pub struct LooseStore {
    objdir: PathBuf,
    write_dir: Option<PathBuf>,
    algo: HashAlgo,
}

impl LooseStore {
    pub fn new(objdir: impl Into<PathBuf>, algo: HashAlgo) -> LooseStore {
        LooseStore {
            objdir: objdir.into(),
            write_dir: None,
            algo,
        }
    }

    pub fn objdir(&self) -> &Path {
        &self.objdir
    }

    /// Redirect subsequent writes into `dir` (a quarantine), or back to
    /// the main directory with `None`.
    pub fn set_write_dir(&mut self, dir: Option<PathBuf>) {
        self.write_dir = dir;
    }

    fn loose_path(dir: &Path, oid: &ObjectId) -> PathBuf {
        let hex = oid.to_hex();
        dir.join(&hex[..2]).join(&hex[2..])
    }

    fn locate(&self, oid: &ObjectId) -> Option<PathBuf> {
        if let Some(dir) = &self.write_dir {
            let p = Self::loose_path(dir, oid);
            if p.exists() {
                return Some(p);
            }
        }
        let p = Self::loose_path(&self.objdir, oid);
        p.exists().then_some(p)
    }

    fn read_loose(path: &Path, oid: &ObjectId) -> Result<(ObjectKind, Vec<u8>), StoreError> {
        let file = fs::File::open(path)?;
        let mut decoder = ZlibDecoder::new(file);
        let mut raw = Vec::new();
        decoder.read_to_end(&mut raw)?;

        let corrupt = |reason: &str| StoreError::Corrupt {
            oid: *oid,
            reason: reason.to_string(),
        };
        let nul = raw
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| corrupt("missing header terminator"))?;
        let header = &raw[..nul];
        let space = header
            .iter()
            .position(|&b| b == b' ')
            .ok_or_else(|| corrupt("malformed header"))?;
        let kind =
            ObjectKind::parse(&header[..space]).ok_or_else(|| corrupt("unknown object kind"))?;
        let len: usize = std::str::from_utf8(&header[space + 1..])
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| corrupt("bad length in header"))?;
        let payload = raw[nul + 1..].to_vec();
        if payload.len() != len {
            return Err(corrupt("payload length does not match header"));
        }
        Ok((kind, payload))
    }
}

impl ObjectStore for LooseStore {
    fn algo(&self) -> HashAlgo {
        self.algo
    }

    fn read(&self, oid: &ObjectId) -> Result<(ObjectKind, Vec<u8>), StoreError> {
        let path = self.locate(oid).ok_or(StoreError::NotFound(*oid))?;
        Self::read_loose(&path, oid)
    }

    fn write(&mut self, kind: ObjectKind, data: &[u8]) -> Result<ObjectId, StoreError> {
        let oid = hash_object(self.algo, kind, data);

        if let Some(existing) = self.locate(&oid) {
            let (old_kind, old_data) = Self::read_loose(&existing, &oid)?;
            if old_kind != kind || old_data != data {
                return Err(StoreError::Collision { oid });
            }
            return Ok(oid);
        }

        let dir = self.write_dir.as_ref().unwrap_or(&self.objdir);
        let target = Self::loose_path(dir, &oid);
        let parent = target.parent().expect("loose path has a parent");
        fs::create_dir_all(parent)?;

        let tmp = tempfile::NamedTempFile::new_in(parent)?;
        let mut encoder = ZlibEncoder::new(tmp, Compression::default());
        encoder.write_all(format!("{} {}\0", kind.as_str(), data.len()).as_bytes())?;
        encoder.write_all(data)?;
        let tmp = encoder.finish()?;
        tmp.persist(&target).map_err(|e| e.error)?;
        Ok(oid)
    }

    fn has(&self, oid: &ObjectId) -> bool {
        self.locate(oid).is_some()
    }
}

const INDEX_MAGIC: &[u8; 8] = b"APLQIDX\x01";
const INDEX_VERSION: u32 = 1;

/// One index entry. Stage 0 is a normal entry; stages 1..=3 record
/// base/ours/theirs of an unresolved three-way conflict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexEntry {
    pub mode: u32,
    pub oid: ObjectId,
    pub stage: u8,
    /// Marked by "intent to add": the path is announced but its content
    /// is not staged yet.
    pub intent_to_add: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct IndexFile {
    version: u32,
    entries: BTreeMap<String, Vec<IndexEntry>>,
}

/// The staging index: path -> entries (one per stage).
#[derive(Debug, Default)]
pub struct Index {
    entries: BTreeMap<String, Vec<IndexEntry>>,
}

impl Index {
    /// Load from `path`; a missing file yields an empty index.
    pub fn load(path: &Path) -> Result<Index, StoreError> {
        let raw = match fs::read(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Index::default()),
            Err(e) => return Err(e.into()),
        };
        if raw.len() < INDEX_MAGIC.len() || &raw[..INDEX_MAGIC.len()] != INDEX_MAGIC {
            return Err(StoreError::CorruptIndex("missing magic header".into()));
        }
        let file: IndexFile = bincode::deserialize(&raw[INDEX_MAGIC.len()..])
            .map_err(|e| StoreError::CorruptIndex(e.to_string()))?;
        if file.version != INDEX_VERSION {
            return Err(StoreError::CorruptIndex(format!(
                "unsupported version {}",
                file.version
            )));
        }
        Ok(Index {
            entries: file.entries,
        })
    }

    pub fn serialize(&self) -> Result<Vec<u8>, StoreError> {
        let file = IndexFile {
            version: INDEX_VERSION,
            entries: self.entries.clone(),
        };
        let mut out = INDEX_MAGIC.to_vec();
        let body =
            bincode::serialize(&file).map_err(|e| StoreError::CorruptIndex(e.to_string()))?;
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// The stage-0 entry for `path`, if any.
    pub fn lookup(&self, path: &str) -> Option<&IndexEntry> {
        self.entries
            .get(path)
            .and_then(|v| v.iter().find(|e| e.stage == 0))
    }

    /// Any entry for `path`, conflicted or not.
    pub fn lookup_any(&self, path: &str) -> Option<&IndexEntry> {
        self.entries.get(path).and_then(|v| v.first())
    }

    pub fn update(&mut self, path: &str, mode: u32, oid: ObjectId) {
        self.entries.insert(
            path.to_string(),
            vec![IndexEntry {
                mode,
                oid,
                stage: 0,
                intent_to_add: false,
            }],
        );
    }

    pub fn add_intent_to_add(&mut self, path: &str, mode: u32, algo: HashAlgo) {
        self.entries.insert(
            path.to_string(),
            vec![IndexEntry {
                mode,
                oid: ObjectId::null(algo),
                stage: 0,
                intent_to_add: true,
            }],
        );
    }

    /// Record an unresolved conflict as stages 1..=3; absent sides are
    /// skipped (a creation conflict has no base stage).
    pub fn set_conflict(&mut self, path: &str, mode: u32, stages: [Option<ObjectId>; 3]) {
        let mut v = Vec::new();
        for (i, stage_oid) in stages.iter().enumerate() {
            if let Some(oid) = stage_oid {
                v.push(IndexEntry {
                    mode,
                    oid: *oid,
                    stage: (i + 1) as u8,
                    intent_to_add: false,
                });
            }
        }
        self.entries.insert(path.to_string(), v);
    }

    pub fn remove(&mut self, path: &str) -> bool {
        self.entries.remove(path).is_some()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Vec<IndexEntry>)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// An exclusively held `<target>.lock` file. Dropping without
/// committing rolls back.
pub struct Lockfile {
    target: PathBuf,
    lock_path: PathBuf,
    committed: bool,
}

impl Lockfile {
    pub fn acquire(target: impl Into<PathBuf>) -> io::Result<Lockfile> {
        let target = target.into();
        let mut lock_path = target.clone().into_os_string();
        lock_path.push(".lock");
        let lock_path = PathBuf::from(lock_path);
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock_path)
        {
            Ok(_) => Ok(Lockfile {
                target,
                lock_path,
                committed: false,
            }),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("lock file {} already exists", lock_path.display()),
            )),
            Err(e) => Err(e),
        }
    }

    /// Write the new content and atomically replace the target.
    pub fn commit(mut self, content: &[u8]) -> io::Result<()> {
        fs::write(&self.lock_path, content)?;
        fs::rename(&self.lock_path, &self.target)?;
        self.committed = true;
        Ok(())
    }

    pub fn rollback(self) {
        // Drop does the work.
    }
}

impl Drop for Lockfile {
    fn drop(&mut self) {
        if !self.committed {
            let _ = fs::remove_file(&self.lock_path);
        }
    }
}

/// Is any directory component of `path` (under `root`) a symlink?
pub fn has_symlink_leading_path(root: &Path, path: &str) -> bool {
    let mut cur = root.to_path_buf();
    let components: Vec<&str> = path.split('/').collect();
    for comp in &components[..components.len().saturating_sub(1)] {
        cur.push(comp);
        match fs::symlink_metadata(&cur) {
            Ok(md) if md.file_type().is_symlink() => return true,
            Ok(_) => {}
            Err(_) => return false,
        }
    }
    false
}

/// Read `path` from the working tree rooted at `root`. A symlink as
/// the final component yields its target as the content; callers must
/// reject symlinks in directory position via
/// [`has_symlink_leading_path`] first.
pub fn worktree_read(root: &Path, path: &str) -> io::Result<(fs::Metadata, Vec<u8>)> {
    let full = root.join(path);
    let md = fs::symlink_metadata(&full)?;
    let bytes = if md.file_type().is_symlink() {
        fs::read_link(&full)?
            .into_os_string()
            .as_encoded_bytes()
            .to_vec()
    } else {
        fs::read(&full)?
    };
    Ok((md, bytes))
}

/// POSIX mode bits for a worktree entry's metadata.
pub fn mode_from_metadata(md: &fs::Metadata) -> u32 {
    if md.file_type().is_symlink() {
        return MODE_SYMLINK;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if md.permissions().mode() & 0o111 != 0 {
            return MODE_EXECUTABLE;
        }
    }
    MODE_REGULAR
}
