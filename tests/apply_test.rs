use std::fs;
use std::io::Write as _;
use std::path::Path;
use std::sync::Mutex;

use applique::apply::{Applier, ApplyOptions, Workspace};
use applique::binary::encode_base85;
use applique::errors::{ApplyErrorKind, Error, ExistsWhere};
use applique::oid::HashAlgo;
use applique::store::{hash_object, Index, ObjectKind, ObjectStore, MODE_REGULAR};
use applique::ws::{WsErrorAction, WsIgnoreAction};

// The engine allows one quarantine per process; applies are serialized.
static APPLY_LOCK: Mutex<()> = Mutex::new(());

fn create_dir_tree(root: &Path, files: &[(&str, &[u8])]) {
    for (rel_path, content) in files {
        let full = root.join(rel_path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&full, content).unwrap();
    }
}

fn stage_file(ws: &Workspace, index: &mut Index, path: &str, content: &[u8]) {
    create_dir_tree(ws.root(), &[(path, content)]);
    let mut store = ws.store();
    let oid = store.write(ObjectKind::Blob, content).unwrap();
    index.update(path, MODE_REGULAR, oid);
}

fn save_index(ws: &Workspace, index: &Index) {
    fs::create_dir_all(ws.index_path().parent().unwrap()).unwrap();
    fs::write(ws.index_path(), index.serialize().unwrap()).unwrap();
}

fn run_apply(
    ws: &Workspace,
    opts: ApplyOptions,
    patch: &str,
) -> applique::Result<applique::ApplySummary> {
    let _guard = APPLY_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let mut applier = Applier::new(ws, opts)?;
    applier.apply_patch(patch.as_bytes())
}

const SINGLE_HUNK: &str = "\
--- a/f
+++ b/f
@@ -1,3 +1,3 @@
 a
-b
+B
 c
";

#[test]
fn test_exact_apply_single_hunk() {
    let temp = tempfile::tempdir().unwrap();
    create_dir_tree(temp.path(), &[("f", b"a\nb\nc\n")]);
    let ws = Workspace::open(temp.path(), HashAlgo::Sha1);

    let summary = run_apply(&ws, ApplyOptions::default(), SINGLE_HUNK).unwrap();
    assert!(summary.is_clean());
    assert_eq!(summary.files_modified, 1);
    assert_eq!(summary.hunks_applied, 1);
    assert_eq!(fs::read(temp.path().join("f")).unwrap(), b"a\nB\nc\n");
    assert!(!temp.path().join("f.rej").exists());
}

#[test]
fn test_fuzzy_apply_with_offset() {
    let temp = tempfile::tempdir().unwrap();
    create_dir_tree(temp.path(), &[("f", b"x\ny\na\nb\nc\nz\n")]);
    let ws = Workspace::open(temp.path(), HashAlgo::Sha1);

    let summary = run_apply(&ws, ApplyOptions::default(), SINGLE_HUNK).unwrap();
    assert!(summary.is_clean());
    assert_eq!(fs::read(temp.path().join("f")).unwrap(), b"x\ny\na\nB\nc\nz\n");
}

#[test]
fn test_ignore_whitespace_match() {
    let temp = tempfile::tempdir().unwrap();
    create_dir_tree(temp.path(), &[("f", b"foo\tbar\n")]);
    let ws = Workspace::open(temp.path(), HashAlgo::Sha1);

    let patch = "\
--- a/f
+++ b/f
@@ -1,1 +1,1 @@
- foo   bar
+FOO bar
";
    let opts = ApplyOptions {
        ws_ignore_action: WsIgnoreAction::Change,
        ..ApplyOptions::default()
    };
    let summary = run_apply(&ws, opts, patch).unwrap();
    assert!(summary.is_clean());
    assert_eq!(fs::read(temp.path().join("f")).unwrap(), b"FOO bar\n");
}

#[test]
fn test_rename_without_body() {
    let temp = tempfile::tempdir().unwrap();
    let ws = Workspace::open(temp.path(), HashAlgo::Sha1);
    let mut index = Index::default();
    stage_file(&ws, &mut index, "old", b"payload\n");
    save_index(&ws, &index);
    let oid = index.lookup("old").unwrap().oid;

    let patch = "\
diff --git a/old b/new
similarity index 100%
rename from old
rename to new
";
    let opts = ApplyOptions {
        check_index: true,
        ..ApplyOptions::default()
    };
    let summary = run_apply(&ws, opts, patch).unwrap();
    assert!(summary.is_clean());
    assert_eq!(summary.files_renamed, 1);

    let index = ws.load_index().unwrap();
    assert!(index.lookup("old").is_none());
    let entry = index.lookup("new").unwrap();
    assert_eq!(entry.oid, oid);
    assert_eq!(entry.mode, MODE_REGULAR);
    assert!(!temp.path().join("old").exists());
    assert_eq!(fs::read(temp.path().join("new")).unwrap(), b"payload\n");
}

#[test]
fn test_creation_conflict() {
    let temp = tempfile::tempdir().unwrap();
    let ws = Workspace::open(temp.path(), HashAlgo::Sha1);
    let mut index = Index::default();
    stage_file(&ws, &mut index, "p", b"already here\n");
    save_index(&ws, &index);

    let patch = "\
diff --git a/p b/p
new file mode 100644
--- /dev/null
+++ b/p
@@ -0,0 +1,1 @@
+x
";
    let opts = ApplyOptions {
        check_index: true,
        ..ApplyOptions::default()
    };
    let err = run_apply(&ws, opts, patch).unwrap_err();
    match err {
        Error::Apply(e) => {
            assert_eq!(e.path, "p");
            assert_eq!(
                e.kind,
                ApplyErrorKind::PathAlreadyExists(ExistsWhere::Index)
            );
        }
        other => panic!("expected an apply error, got {other:?}"),
    }
    // Nothing changed.
    assert_eq!(fs::read(temp.path().join("p")).unwrap(), b"already here\n");
}

#[test]
fn test_binary_literal() {
    let temp = tempfile::tempdir().unwrap();
    let ws = Workspace::open(temp.path(), HashAlgo::Sha1);

    let content = b"hello";
    let new_oid = hash_object(HashAlgo::Sha1, ObjectKind::Blob, content);

    let mut deflater =
        flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
    deflater.write_all(content).unwrap();
    let deflated = deflater.finish().unwrap();

    let mut data_lines = String::new();
    for chunk in deflated.chunks(52) {
        let len_byte = if chunk.len() <= 26 {
            b'A' + chunk.len() as u8 - 1
        } else {
            b'a' + chunk.len() as u8 - 27
        };
        data_lines.push(len_byte as char);
        data_lines.push_str(std::str::from_utf8(&encode_base85(chunk)).unwrap());
        data_lines.push('\n');
    }

    let patch = format!(
        "diff --git a/blob.bin b/blob.bin\n\
         new file mode 100644\n\
         index {}..{}\n\
         GIT binary patch\n\
         literal {}\n\
         {}\n",
        "0".repeat(40),
        new_oid.to_hex(),
        content.len(),
        data_lines,
    );

    let opts = ApplyOptions {
        check_index: true,
        ..ApplyOptions::default()
    };
    let summary = run_apply(&ws, opts, &patch).unwrap();
    assert!(summary.is_clean());
    assert_eq!(summary.files_created, 1);
    assert_eq!(fs::read(temp.path().join("blob.bin")).unwrap(), content);

    // The staged blob carries exactly the declared hash, promoted out
    // of the quarantine into the store.
    let index = ws.load_index().unwrap();
    assert_eq!(index.lookup("blob.bin").unwrap().oid, new_oid);
    assert!(ws.store().has(&new_oid));
}

#[test]
fn test_reject_file_written() {
    let temp = tempfile::tempdir().unwrap();
    create_dir_tree(temp.path(), &[("f", b"a\nX\nc\n")]);
    let ws = Workspace::open(temp.path(), HashAlgo::Sha1);

    let opts = ApplyOptions {
        with_reject: true,
        ..ApplyOptions::default()
    };
    let summary = run_apply(&ws, opts, SINGLE_HUNK).unwrap();
    assert!(!summary.is_clean());
    assert_eq!(summary.hunks_rejected, 1);
    assert_eq!(summary.reject_files_written, 1);

    let rej = fs::read_to_string(temp.path().join("f.rej")).unwrap();
    assert_eq!(
        rej,
        "diff a/f b/f\t(rejected hunks)\n@@ -1,3 +1,3 @@\n a\n-b\n+B\n c\n"
    );
    // The file itself is untouched.
    assert_eq!(fs::read(temp.path().join("f")).unwrap(), b"a\nX\nc\n");
}

#[test]
fn test_failed_apply_aborts_without_reject() {
    let temp = tempfile::tempdir().unwrap();
    create_dir_tree(temp.path(), &[("f", b"a\nX\nc\n")]);
    let ws = Workspace::open(temp.path(), HashAlgo::Sha1);

    let err = run_apply(&ws, ApplyOptions::default(), SINGLE_HUNK).unwrap_err();
    match err {
        Error::Apply(e) => assert_eq!(e.kind, ApplyErrorKind::DoesNotMatch),
        other => panic!("expected an apply error, got {other:?}"),
    }
    assert_eq!(fs::read(temp.path().join("f")).unwrap(), b"a\nX\nc\n");
    assert!(!temp.path().join("f.rej").exists());
}

#[test]
fn test_reverse_apply() {
    let temp = tempfile::tempdir().unwrap();
    create_dir_tree(temp.path(), &[("f", b"a\nB\nc\n")]);
    let ws = Workspace::open(temp.path(), HashAlgo::Sha1);

    let opts = ApplyOptions {
        reverse: true,
        ..ApplyOptions::default()
    };
    let summary = run_apply(&ws, opts, SINGLE_HUNK).unwrap();
    assert!(summary.is_clean());
    assert_eq!(fs::read(temp.path().join("f")).unwrap(), b"a\nb\nc\n");
}

#[test]
fn test_creation_and_deletion() {
    let temp = tempfile::tempdir().unwrap();
    create_dir_tree(temp.path(), &[("doomed", b"bye\n")]);
    let ws = Workspace::open(temp.path(), HashAlgo::Sha1);

    let patch = "\
diff --git a/fresh b/fresh
new file mode 100644
--- /dev/null
+++ b/fresh
@@ -0,0 +1,2 @@
+line one
+line two
diff --git a/doomed b/doomed
deleted file mode 100644
--- a/doomed
+++ /dev/null
@@ -1,1 +0,0 @@
-bye
";
    let summary = run_apply(&ws, ApplyOptions::default(), patch).unwrap();
    assert!(summary.is_clean());
    assert_eq!(summary.files_created, 1);
    assert_eq!(summary.files_deleted, 1);
    assert_eq!(
        fs::read(temp.path().join("fresh")).unwrap(),
        b"line one\nline two\n"
    );
    assert!(!temp.path().join("doomed").exists());
}

#[test]
fn test_swap_rename() {
    let temp = tempfile::tempdir().unwrap();
    let ws = Workspace::open(temp.path(), HashAlgo::Sha1);
    let mut index = Index::default();
    stage_file(&ws, &mut index, "a", b"content of a\n");
    stage_file(&ws, &mut index, "b", b"content of b\n");
    save_index(&ws, &index);

    let patch = "\
diff --git a/a b/b
similarity index 100%
rename from a
rename to b
diff --git a/b b/a
similarity index 100%
rename from b
rename to a
";
    let opts = ApplyOptions {
        check_index: true,
        ..ApplyOptions::default()
    };
    let summary = run_apply(&ws, opts, patch).unwrap();
    assert!(summary.is_clean());
    assert_eq!(summary.files_renamed, 2);
    assert_eq!(fs::read(temp.path().join("a")).unwrap(), b"content of b\n");
    assert_eq!(fs::read(temp.path().join("b")).unwrap(), b"content of a\n");
}

#[test]
fn test_threeway_clean_merge() {
    let temp = tempfile::tempdir().unwrap();
    let ws = Workspace::open(temp.path(), HashAlgo::Sha1);

    let base = b"a\nb\nc\n";
    let ours = b"A\nb\nc\n";
    let theirs = b"a\nb\nC\n";

    let mut store = ws.store();
    let base_oid = store.write(ObjectKind::Blob, base).unwrap();
    let theirs_oid = hash_object(HashAlgo::Sha1, ObjectKind::Blob, theirs);

    let mut index = Index::default();
    stage_file(&ws, &mut index, "f", ours);
    save_index(&ws, &index);

    let patch = format!(
        "diff --git a/f b/f\n\
         index {}..{} 100644\n\
         --- a/f\n\
         +++ b/f\n\
         @@ -1,3 +1,3 @@\n \
         a\n \
         b\n\
         -c\n\
         +C\n",
        base_oid.to_hex(),
        theirs_oid.to_hex(),
    );

    let opts = ApplyOptions {
        threeway: true,
        ..ApplyOptions::default()
    };
    let summary = run_apply(&ws, opts, &patch).unwrap();
    assert!(summary.is_clean());
    assert_eq!(fs::read(temp.path().join("f")).unwrap(), b"A\nb\nC\n");
}

#[test]
fn test_threeway_conflict_records_stages() {
    let temp = tempfile::tempdir().unwrap();
    let ws = Workspace::open(temp.path(), HashAlgo::Sha1);

    let base = b"a\nb\n";
    let ours = b"A\nb\n";
    let theirs = b"Z\nb\n";

    let mut store = ws.store();
    let base_oid = store.write(ObjectKind::Blob, base).unwrap();
    let theirs_oid = hash_object(HashAlgo::Sha1, ObjectKind::Blob, theirs);

    let mut index = Index::default();
    stage_file(&ws, &mut index, "f", ours);
    save_index(&ws, &index);

    let patch = format!(
        "diff --git a/f b/f\n\
         index {}..{} 100644\n\
         --- a/f\n\
         +++ b/f\n\
         @@ -1,2 +1,2 @@\n\
         -a\n\
         +Z\n \
         b\n",
        base_oid.to_hex(),
        theirs_oid.to_hex(),
    );

    let opts = ApplyOptions {
        threeway: true,
        ..ApplyOptions::default()
    };
    let summary = run_apply(&ws, opts, &patch).unwrap();
    assert_eq!(summary.conflicted_files, 1);
    assert!(!summary.is_clean());

    let merged = fs::read_to_string(temp.path().join("f")).unwrap();
    assert!(merged.contains("<<<<<<< ours"));
    assert!(merged.contains(">>>>>>> theirs"));

    let index = ws.load_index().unwrap();
    assert!(index.lookup("f").is_none());
    let stages = index.lookup_any("f").unwrap();
    assert_eq!(stages.stage, 1);
    assert_eq!(stages.oid, base_oid);
}

#[test]
fn test_index_rolls_back_on_failure() {
    let temp = tempfile::tempdir().unwrap();
    let ws = Workspace::open(temp.path(), HashAlgo::Sha1);
    let mut index = Index::default();
    stage_file(&ws, &mut index, "f", b"a\nb\nc\n");
    save_index(&ws, &index);
    let before = fs::read(ws.index_path()).unwrap();

    // A patch whose context cannot match.
    let patch = "\
--- a/f
+++ b/f
@@ -1,3 +1,3 @@
 q
-r
+R
 s
";
    let opts = ApplyOptions {
        check_index: true,
        ..ApplyOptions::default()
    };
    assert!(run_apply(&ws, opts.clone(), patch).is_err());

    // Index content unchanged and the lock released.
    assert_eq!(fs::read(ws.index_path()).unwrap(), before);
    let summary = run_apply(&ws, opts, SINGLE_HUNK).unwrap();
    assert!(summary.is_clean());
}

#[test]
fn test_mode_change_only() {
    let temp = tempfile::tempdir().unwrap();
    let ws = Workspace::open(temp.path(), HashAlgo::Sha1);
    let mut index = Index::default();
    stage_file(&ws, &mut index, "run.sh", b"#!/bin/sh\n");
    save_index(&ws, &index);

    let patch = "\
diff --git a/run.sh b/run.sh
old mode 100644
new mode 100755
";
    let opts = ApplyOptions {
        check_index: true,
        ..ApplyOptions::default()
    };
    let summary = run_apply(&ws, opts, patch).unwrap();
    assert!(summary.is_clean());

    let index = ws.load_index().unwrap();
    assert_eq!(index.lookup("run.sh").unwrap().mode, 0o100755);
    assert_eq!(fs::read(temp.path().join("run.sh")).unwrap(), b"#!/bin/sh\n");
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = fs::metadata(temp.path().join("run.sh")).unwrap().permissions().mode();
        assert_ne!(mode & 0o111, 0);
    }
}

#[test]
fn test_locked_index_refuses_second_apply() {
    let temp = tempfile::tempdir().unwrap();
    let ws = Workspace::open(temp.path(), HashAlgo::Sha1);
    let mut index = Index::default();
    stage_file(&ws, &mut index, "f", b"a\nb\nc\n");
    save_index(&ws, &index);

    let lock_path = ws.index_path().with_extension("lock");
    fs::write(&lock_path, b"").unwrap();

    let opts = ApplyOptions {
        check_index: true,
        ..ApplyOptions::default()
    };
    assert!(run_apply(&ws, opts, SINGLE_HUNK).is_err());
    fs::remove_file(&lock_path).unwrap();
}

#[test]
fn test_include_exclude_filters() {
    let temp = tempfile::tempdir().unwrap();
    create_dir_tree(
        temp.path(),
        &[("keep/f", b"a\nb\nc\n"), ("skip/f", b"a\nb\nc\n")],
    );
    let ws = Workspace::open(temp.path(), HashAlgo::Sha1);

    let patch = "\
--- a/keep/f
+++ b/keep/f
@@ -1,3 +1,3 @@
 a
-b
+B
 c
--- a/skip/f
+++ b/skip/f
@@ -1,3 +1,3 @@
 a
-b
+B
 c
";
    let opts = ApplyOptions {
        exclude: vec![glob::Pattern::new("skip/*").unwrap()],
        ..ApplyOptions::default()
    };
    let summary = run_apply(&ws, opts, patch).unwrap();
    assert!(summary.is_clean());
    assert_eq!(summary.files_modified, 1);
    assert_eq!(fs::read(temp.path().join("keep/f")).unwrap(), b"a\nB\nc\n");
    assert_eq!(fs::read(temp.path().join("skip/f")).unwrap(), b"a\nb\nc\n");
}

#[test]
fn test_whitespace_error_action_fatal() {
    let temp = tempfile::tempdir().unwrap();
    create_dir_tree(temp.path(), &[("f", b"a\nb\nc\n")]);
    let ws = Workspace::open(temp.path(), HashAlgo::Sha1);

    // The added line carries trailing whitespace.
    let patch = "--- a/f\n+++ b/f\n@@ -1,3 +1,3 @@\n a\n-b\n+B  \n c\n";
    let opts = ApplyOptions {
        ws_error_action: WsErrorAction::Error,
        ..ApplyOptions::default()
    };
    let err = run_apply(&ws, opts, patch).unwrap_err();
    match err {
        Error::Apply(e) => assert_eq!(e.kind, ApplyErrorKind::WhitespaceFatal),
        other => panic!("expected whitespace failure, got {other:?}"),
    }
    assert_eq!(fs::read(temp.path().join("f")).unwrap(), b"a\nb\nc\n");

    // With fix, the line is corrected while applying.
    let opts = ApplyOptions {
        ws_error_action: WsErrorAction::Fix,
        ..ApplyOptions::default()
    };
    let summary = run_apply(&ws, opts, patch).unwrap();
    assert!(summary.is_clean());
    assert_eq!(fs::read(temp.path().join("f")).unwrap(), b"a\nB\nc\n");
}

#[test]
fn test_cached_apply_leaves_worktree() {
    let temp = tempfile::tempdir().unwrap();
    let ws = Workspace::open(temp.path(), HashAlgo::Sha1);
    let mut index = Index::default();
    stage_file(&ws, &mut index, "f", b"a\nb\nc\n");
    save_index(&ws, &index);

    let opts = ApplyOptions {
        cached: true,
        ..ApplyOptions::default()
    };
    let summary = run_apply(&ws, opts, SINGLE_HUNK).unwrap();
    assert!(summary.is_clean());

    // Worktree untouched, index updated.
    assert_eq!(fs::read(temp.path().join("f")).unwrap(), b"a\nb\nc\n");
    let index = ws.load_index().unwrap();
    let expected = hash_object(HashAlgo::Sha1, ObjectKind::Blob, b"a\nB\nc\n");
    assert_eq!(index.lookup("f").unwrap().oid, expected);
}
