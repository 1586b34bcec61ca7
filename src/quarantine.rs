//! Quarantine: a temporary object directory new objects are written
//! into. On success it is promoted (migrated) into the parent object
//! directory; on failure it is discarded wholesale, so aborted applies
//! leave no stray objects behind.

use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use walkdir::WalkDir;

/// Environment advertised to child processes so their object writes
/// land in the quarantine.
pub const OBJECT_DIR_ENV: &str = "APPLIQUE_OBJECT_DIRECTORY";
pub const ALTERNATE_ENV: &str = "APPLIQUE_ALTERNATE_OBJECT_DIRECTORIES";
pub const QUARANTINE_ENV: &str = "APPLIQUE_QUARANTINE_PATH";

// At most one quarantine may be active per process; this keeps the
// cleanup story trivial.
static ACTIVE: AtomicBool = AtomicBool::new(false);

/// A temporary object directory under the parent store.
///
/// Dropping an unpromoted quarantine removes the directory and releases
/// the process-wide active slot. Stale directories from killed
/// processes are recognizable by the `tmp_objdir-` name prefix.
pub struct Quarantine {
    dir: Option<tempfile::TempDir>,
    parent: PathBuf,
    env: Vec<(String, String)>,
    will_destroy: bool,
}

impl Quarantine {
    /// Create a fresh quarantine under `parent_objdir`, with a `pack/`
    /// subdirectory ready for pack writers.
    pub fn create(parent_objdir: &Path, purpose: &str) -> io::Result<Quarantine> {
        if ACTIVE.swap(true, Ordering::SeqCst) {
            return Err(io::Error::other(
                "only one quarantine can be active at a time",
            ));
        }
        let result = Self::create_inner(parent_objdir, purpose);
        if result.is_err() {
            ACTIVE.store(false, Ordering::SeqCst);
        }
        result
    }

    fn create_inner(parent_objdir: &Path, purpose: &str) -> io::Result<Quarantine> {
        fs::create_dir_all(parent_objdir)?;
        let dir = tempfile::Builder::new()
            .prefix(&format!("tmp_objdir-{purpose}-"))
            .tempdir_in(parent_objdir)?;
        fs::create_dir(dir.path().join("pack"))?;

        let quarantine_path = dir.path().to_string_lossy().into_owned();
        let parent_path = parent_objdir.to_string_lossy().into_owned();
        let alternates = match std::env::var(ALTERNATE_ENV) {
            Ok(old) if !old.is_empty() => format!("{old}:{parent_path}"),
            _ => parent_path,
        };
        let env = vec![
            (ALTERNATE_ENV.to_string(), alternates),
            (OBJECT_DIR_ENV.to_string(), quarantine_path.clone()),
            (QUARANTINE_ENV.to_string(), quarantine_path),
        ];

        Ok(Quarantine {
            dir: Some(dir),
            parent: parent_objdir.to_path_buf(),
            env,
            will_destroy: true,
        })
    }

    pub fn path(&self) -> &Path {
        self.dir.as_ref().expect("quarantine already finished").path()
    }

    /// Environment a child process should inherit.
    pub fn env(&self) -> &[(String, String)] {
        &self.env
    }

    /// Migrate every file into the parent object directory, then remove
    /// the (now empty) temporary directory.
    ///
    /// Within each directory, pack metadata is ordered after the data
    /// it describes: `.keep` first, then `.pack`, `.rev`, `.idx`.
    /// Loose-object shard directories (two hex digits) are promoted
    /// without byte comparison; their names already encode the content
    /// hash.
    pub fn promote(mut self) -> io::Result<()> {
        let dir = self.dir.take().expect("quarantine already finished");
        let src_root = dir.path().to_path_buf();

        let walker = WalkDir::new(&src_root).min_depth(1).sort_by(|a, b| {
            let pa = pack_copy_priority(&a.file_name().to_string_lossy());
            let pb = pack_copy_priority(&b.file_name().to_string_lossy());
            pa.cmp(&pb).then_with(|| a.file_name().cmp(b.file_name()))
        });

        for entry in walker {
            let entry = entry.map_err(io::Error::other)?;
            let rel = entry
                .path()
                .strip_prefix(&src_root)
                .map_err(io::Error::other)?;
            let dst = self.parent.join(rel);
            if entry.file_type().is_dir() {
                fs::create_dir_all(&dst)?;
                continue;
            }
            let skip_collision_check = rel
                .components()
                .next()
                .map(|c| is_loose_shard(&c.as_os_str().to_string_lossy()))
                .unwrap_or(false);
            finalize_file(entry.path(), &dst, skip_collision_check)?;
        }

        self.will_destroy = false;
        dir.close()?;
        Ok(())
        // Drop releases the active slot.
    }

    /// Remove the quarantine and everything in it.
    pub fn discard(self) {
        // Drop does the work.
    }
}

impl Drop for Quarantine {
    fn drop(&mut self) {
        if self.will_destroy {
            // TempDir removes the directory tree when dropped.
            if let Some(dir) = self.dir.take() {
                log::debug!("discarding quarantine {}", dir.path().display());
            }
        }
        ACTIVE.store(false, Ordering::SeqCst);
    }
}

// Copy order within a directory. Loose objects exit early; packfile
// metadata must land after the data it describes.
fn pack_copy_priority(name: &str) -> u8 {
    if !name.starts_with("pack") {
        return 0;
    }
    if name.ends_with(".keep") {
        return 1;
    }
    if name.ends_with(".pack") {
        return 2;
    }
    if name.ends_with(".rev") {
        return 3;
    }
    if name.ends_with(".idx") {
        return 4;
    }
    5
}

fn is_loose_shard(name: &str) -> bool {
    name.len() == 2 && name.bytes().all(|b| b.is_ascii_hexdigit())
}

fn files_identical(a: &Path, b: &Path) -> io::Result<bool> {
    let (ma, mb) = (fs::metadata(a)?, fs::metadata(b)?);
    if ma.len() != mb.len() {
        return Ok(false);
    }
    let mut fa = io::BufReader::new(fs::File::open(a)?);
    let mut fb = io::BufReader::new(fs::File::open(b)?);
    let mut ba = [0u8; 8192];
    let mut bb = [0u8; 8192];
    loop {
        let na = fa.read(&mut ba)?;
        let nb = fb.read(&mut bb)?;
        if na != nb || ba[..na] != bb[..nb] {
            return Ok(false);
        }
        if na == 0 {
            return Ok(true);
        }
    }
}

// Move one file into place. An existing destination is a collision
// unless the caller vouched for content-addressed names or the bytes
// agree; promotion never clobbers.
fn finalize_file(src: &Path, dst: &Path, skip_collision_check: bool) -> io::Result<()> {
    if dst.exists() {
        if !skip_collision_check && !files_identical(src, dst)? {
            return Err(io::Error::other(format!(
                "collision promoting {}: destination exists with different content",
                dst.display()
            )));
        }
        fs::remove_file(src)?;
        return Ok(());
    }
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(_) => {
            fs::copy(src, dst)?;
            fs::remove_file(src)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Quarantines are one-per-process; serialize the tests that hold one.
    static TEST_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn test_create_and_promote() {
        let _guard = TEST_LOCK.lock().unwrap();
        let parent = tempfile::tempdir().unwrap();
        let q = Quarantine::create(parent.path(), "apply").unwrap();

        let shard = q.path().join("ab");
        fs::create_dir(&shard).unwrap();
        fs::write(shard.join("cdef"), b"loose object").unwrap();
        fs::write(q.path().join("pack").join("pack-1.pack"), b"pack data").unwrap();
        fs::write(q.path().join("pack").join("pack-1.idx"), b"pack index").unwrap();

        q.promote().unwrap();

        assert_eq!(
            fs::read(parent.path().join("ab/cdef")).unwrap(),
            b"loose object"
        );
        assert_eq!(
            fs::read(parent.path().join("pack/pack-1.pack")).unwrap(),
            b"pack data"
        );
        // The temporary directory itself is gone.
        let leftovers: Vec<_> = fs::read_dir(parent.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("tmp_objdir-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_discard_removes_everything() {
        let _guard = TEST_LOCK.lock().unwrap();
        let parent = tempfile::tempdir().unwrap();
        let q = Quarantine::create(parent.path(), "apply").unwrap();
        let path = q.path().to_path_buf();
        fs::write(path.join("stray"), b"x").unwrap();
        q.discard();
        assert!(!path.exists());
    }

    #[test]
    fn test_only_one_active() {
        let _guard = TEST_LOCK.lock().unwrap();
        let parent = tempfile::tempdir().unwrap();
        let q = Quarantine::create(parent.path(), "apply").unwrap();
        assert!(Quarantine::create(parent.path(), "apply").is_err());
        drop(q);
        assert!(Quarantine::create(parent.path(), "apply").is_ok());
    }

    #[test]
    fn test_promote_detects_collision() {
        let _guard = TEST_LOCK.lock().unwrap();
        let parent = tempfile::tempdir().unwrap();
        fs::create_dir_all(parent.path().join("pack")).unwrap();
        fs::write(parent.path().join("pack/pack-9.pack"), b"old bytes").unwrap();

        let q = Quarantine::create(parent.path(), "apply").unwrap();
        fs::write(q.path().join("pack/pack-9.pack"), b"new bytes").unwrap();
        assert!(q.promote().is_err());
        // The pre-existing file is untouched.
        assert_eq!(
            fs::read(parent.path().join("pack/pack-9.pack")).unwrap(),
            b"old bytes"
        );
    }

    #[test]
    fn test_env_advertises_quarantine() {
        let _guard = TEST_LOCK.lock().unwrap();
        let parent = tempfile::tempdir().unwrap();
        let q = Quarantine::create(parent.path(), "apply").unwrap();
        let env = q.env();
        let objdir = env.iter().find(|(k, _)| k == OBJECT_DIR_ENV).unwrap();
        assert_eq!(Path::new(&objdir.1), q.path());
        assert!(env.iter().any(|(k, _)| k == ALTERNATE_ENV));
    }
}
