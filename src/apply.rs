//! The apply driver: parse a patch stream, resolve each record to its
//! pre-image, apply hunks (falling back to three-way merge when asked),
//! validate the results, and write them out in two phases -- removals
//! first, then creations -- so swap-renames sequence correctly.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::binary;
use crate::errors::{
    ApplyError, ApplyErrorKind, Error, ExistsWhere, ParseError, ParseErrorKind, Result,
};
use crate::image::Image;
use crate::matcher::{apply_one_fragment, FragmentOutcome, MatchOptions};
use crate::oid::{HashAlgo, ObjectId};
use crate::parse::{parse_patch_stream, reverse_patches, ParseConfig, Patch};
use crate::quarantine::Quarantine;
use crate::store::{
    has_symlink_leading_path, hash_object, is_gitlink_mode, is_symlink_mode, mode_from_metadata,
    mode_type_bits, worktree_read, Index, Lockfile, LooseStore, ObjectKind, ObjectStore,
    MODE_REGULAR,
};
use crate::threeway;
use crate::ws::{WsAttributes, WsErrorAction, WsIgnoreAction, WsStats};

/// Driver options. The defaults apply a patch to the working tree with
/// one leading path component stripped and warnings on whitespace
/// errors.
#[derive(Debug, Clone)]
pub struct ApplyOptions {
    /// Leading path components to strip (`-p`); inferred per patch for
    /// traditional diffs when unset.
    pub p_value: Option<usize>,
    pub reverse: bool,
    /// Leave rejected hunks in `.rej` files instead of failing.
    pub with_reject: bool,
    /// Fall back to three-way merge when a record does not apply.
    pub threeway: bool,
    pub unidiff_zero: bool,
    pub allow_overlap: bool,
    /// Guaranteed context lines (`-C`); matching may shrink hunk
    /// context down to this many lines.
    pub context_limit: usize,
    pub ws_error_action: WsErrorAction,
    pub ws_ignore_action: WsIgnoreAction,
    /// Report the first N whitespace errors in full, summarise the
    /// rest. 0 reports everything.
    pub squelch_whitespace_errors: usize,
    /// Check applicability only; write nothing.
    pub check: bool,
    /// Make sure the patch applies to the index, and update it.
    pub check_index: bool,
    /// Apply to the index only, leaving the working tree alone.
    pub cached: bool,
    /// Register new files as intent-to-add instead of staging content.
    pub intent_to_add: bool,
    pub allow_empty: bool,
    pub unsafe_paths: bool,
    pub recount: bool,
    pub inaccurate_eof: bool,
    /// Prepended to every path in the patch (`--directory`).
    pub root: Option<String>,
    pub include: Vec<glob::Pattern>,
    pub exclude: Vec<glob::Pattern>,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        ApplyOptions {
            p_value: None,
            reverse: false,
            with_reject: false,
            threeway: false,
            unidiff_zero: false,
            allow_overlap: false,
            context_limit: usize::MAX,
            ws_error_action: WsErrorAction::Warn,
            ws_ignore_action: WsIgnoreAction::None,
            squelch_whitespace_errors: 5,
            check: false,
            check_index: false,
            cached: false,
            intent_to_add: false,
            allow_empty: false,
            unsafe_paths: false,
            recount: false,
            inaccurate_eof: false,
            root: None,
            include: Vec::new(),
            exclude: Vec::new(),
        }
    }
}

/// What happened to the records of one apply run.
#[derive(Debug, Default, Clone)]
pub struct ApplySummary {
    pub files_created: usize,
    pub files_deleted: usize,
    pub files_modified: usize,
    pub files_renamed: usize,
    pub hunks_applied: usize,
    pub hunks_rejected: usize,
    pub reject_files_written: usize,
    pub conflicted_files: usize,
    /// Records that failed outright (no `.rej` is written for those).
    pub records_failed: usize,
}

impl ApplySummary {
    /// Did every record apply without rejects or conflicts?
    pub fn is_clean(&self) -> bool {
        self.hunks_rejected == 0
            && self.reject_files_written == 0
            && self.conflicted_files == 0
            && self.records_failed == 0
    }
}

/// A repository-ish target: a working tree with an object directory
/// and a staging index tucked under `.applique/`.
pub struct Workspace {
    root: PathBuf,
    objdir: PathBuf,
    index_path: PathBuf,
    algo: HashAlgo,
}

impl Workspace {
    pub fn open(root: impl Into<PathBuf>, algo: HashAlgo) -> Workspace {
        let root = root.into();
        let meta = root.join(".applique");
        Workspace {
            objdir: meta.join("objects"),
            index_path: meta.join("index"),
            root,
            algo,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn objdir(&self) -> &Path {
        &self.objdir
    }

    pub fn index_path(&self) -> &Path {
        &self.index_path
    }

    pub fn algo(&self) -> HashAlgo {
        self.algo
    }

    pub fn store(&self) -> LooseStore {
        LooseStore::new(&self.objdir, self.algo)
    }

    pub fn load_index(&self) -> Result<Index> {
        Ok(Index::load(&self.index_path)?)
    }
}

/// Status of a path while sequencing multiple records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PatchStatus {
    /// This record's result is the current content of the path.
    Done(usize),
    /// A prior record removed the path.
    WasDeleted,
    /// A later record in this series will remove the path; needed for
    /// swap-renames A<->B.
    WillBeDeleted,
}

/// One apply run over a workspace.
pub struct Applier<'a> {
    ws: &'a Workspace,
    opts: ApplyOptions,
    attrs: WsAttributes,
    store: LooseStore,
    index: Index,
    fn_table: HashMap<String, PatchStatus>,
    removed_symlinks: HashSet<String>,
    kept_symlinks: HashSet<String>,
    stats: WsStats,
    update_index: bool,
}

impl<'a> Applier<'a> {
    pub fn new(ws: &'a Workspace, mut opts: ApplyOptions) -> Result<Applier<'a>> {
        if opts.with_reject && opts.threeway {
            return Err(Error::Apply(ApplyError::new(
                "",
                ApplyErrorKind::DoesNotMatch,
                "reject mode and three-way fall-back cannot be used together",
            )));
        }
        if opts.threeway || opts.cached {
            opts.check_index = true;
        }
        let update_index = opts.check_index && !opts.check;
        let stats = WsStats {
            squelch_limit: opts.squelch_whitespace_errors,
            ..WsStats::default()
        };
        Ok(Applier {
            store: ws.store(),
            ws,
            opts,
            attrs: WsAttributes::default(),
            index: Index::default(),
            fn_table: HashMap::new(),
            removed_symlinks: HashSet::new(),
            kept_symlinks: HashSet::new(),
            stats,
            update_index,
        })
    }

    /// Override the per-path whitespace rules.
    pub fn set_ws_attributes(&mut self, attrs: WsAttributes) {
        self.attrs = attrs;
    }

    /// Apply one patch stream. On success the quarantine is promoted
    /// and the index lock committed; on failure both are rolled back
    /// (the working tree may still be partially modified if the write
    /// phase had begun).
    pub fn apply_patch(&mut self, patch: &[u8]) -> Result<ApplySummary> {
        let mut records = self.parse_records(patch)?;

        if self.opts.ws_error_action == WsErrorAction::Error && self.stats.errors > 0 {
            return Err(Error::Apply(ApplyError::new(
                "",
                ApplyErrorKind::WhitespaceFatal,
                format!("{} lines add whitespace errors", self.stats.errors),
            )));
        }

        let lock = if self.update_index {
            fs::create_dir_all(
                self.ws
                    .index_path
                    .parent()
                    .expect("index path has a parent"),
            )?;
            Some(Lockfile::acquire(&self.ws.index_path)?)
        } else {
            None
        };
        if self.opts.check_index {
            self.index = Index::load(&self.ws.index_path)?;
        }

        let quarantine = Quarantine::create(&self.ws.objdir, "apply")?;
        self.store
            .set_write_dir(Some(quarantine.path().to_path_buf()));

        let result = self.apply_records(&mut records);

        self.store.set_write_dir(None);
        match result {
            Ok(summary) => {
                if self.opts.check {
                    quarantine.discard();
                } else {
                    quarantine.promote()?;
                }
                if let Some(lock) = lock {
                    lock.commit(&self.index.serialize()?)?;
                }
                self.stats.summarize();
                Ok(summary)
            }
            Err(e) => {
                quarantine.discard();
                drop(lock); // rolls the index back
                Err(e)
            }
        }
    }

    fn parse_records(&mut self, patch: &[u8]) -> Result<Vec<Patch>> {
        let config = ParseConfig {
            p_value: self.opts.p_value,
            root: self.opts.root.clone(),
            prefix: None,
            recount: self.opts.recount,
            inaccurate_eof: self.opts.inaccurate_eof,
            apply_in_reverse: self.opts.reverse,
            ws_error_action: self.opts.ws_error_action,
            hexsz: self.ws.algo.hexsz(),
        };
        let mut records = parse_patch_stream(patch, &config, &self.attrs, &mut self.stats)?;
        if self.opts.reverse {
            reverse_patches(&mut records);
        }

        let before = records.len();
        records.retain(|p| self.use_patch(p));
        let skipped = before - records.len();
        if records.is_empty() && skipped == 0 && !self.opts.allow_empty {
            return Err(Error::Parse(ParseError::new(
                0,
                ParseErrorKind::BadHeader,
                "no valid patches in input",
            )));
        }
        Ok(records)
    }

    fn use_patch(&self, patch: &Patch) -> bool {
        let pathname = patch.best_name();
        for pat in &self.opts.exclude {
            if pat.matches(pathname) {
                return false;
            }
        }
        if self.opts.include.is_empty() {
            return true;
        }
        self.opts.include.iter().any(|p| p.matches(pathname))
    }

    fn apply_records(&mut self, records: &mut Vec<Patch>) -> Result<ApplySummary> {
        self.fn_table.clear();
        self.removed_symlinks.clear();
        self.kept_symlinks.clear();

        self.prepare_symlink_changes(records);
        self.prepare_fn_table(records);

        let mut first_error: Option<ApplyError> = None;
        for idx in 0..records.len() {
            log::debug!("checking patch {}...", records[idx].best_name());
            if let Err(e) = self.check_patch(records, idx) {
                log::error!("{e}");
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
        if let Some(e) = first_error {
            if !self.opts.with_reject {
                return Err(Error::Apply(e));
            }
        }

        if self.opts.check {
            return Ok(self.summarize(records));
        }
        self.write_out_results(records)?;
        Ok(self.summarize(records))
    }

    fn summarize(&self, records: &[Patch]) -> ApplySummary {
        let mut summary = ApplySummary::default();
        for p in records {
            if p.rejected {
                // The whole record failed; no .rej is written for it.
                summary.records_failed += 1;
                summary.hunks_rejected += p.fragments.len();
                continue;
            }
            if p.is_deletion() {
                summary.files_deleted += 1;
            } else if p.is_creation() {
                summary.files_created += 1;
            } else if p.is_rename {
                summary.files_renamed += 1;
            } else {
                summary.files_modified += 1;
            }
            if p.conflicted_threeway {
                summary.conflicted_files += 1;
            }
            for f in &p.fragments {
                if f.binary.is_some() {
                    continue;
                }
                if f.rejected {
                    summary.hunks_rejected += 1;
                } else {
                    summary.hunks_applied += 1;
                }
            }
            if p.fragments.iter().any(|f| f.rejected) {
                summary.reject_files_written += 1;
            }
        }
        summary
    }

    fn prepare_symlink_changes(&mut self, records: &[Patch]) {
        for p in records {
            if let Some(old) = &p.old_name {
                if is_symlink_mode(p.old_mode) && (p.is_rename || p.is_deletion()) {
                    self.removed_symlinks.insert(old.clone());
                }
            }
            if let Some(new) = &p.new_name {
                if is_symlink_mode(p.new_mode) {
                    self.kept_symlinks.insert(new.clone());
                }
            }
        }
    }

    fn prepare_fn_table(&mut self, records: &[Patch]) {
        for p in records {
            if p.new_name.is_none() || p.is_rename {
                if let Some(old) = &p.old_name {
                    self.fn_table
                        .insert(old.clone(), PatchStatus::WillBeDeleted);
                }
            }
        }
    }

    fn add_to_fn_table(&mut self, records: &[Patch], idx: usize) {
        let p = &records[idx];
        if let Some(new) = &p.new_name {
            self.fn_table.insert(new.clone(), PatchStatus::Done(idx));
        }
        if p.new_name.is_none() || p.is_rename {
            if let Some(old) = &p.old_name {
                self.fn_table.insert(old.clone(), PatchStatus::WasDeleted);
            }
        }
    }

    /// The record, if any, whose in-memory result is the current
    /// content of this record's old path. Renames and copies read
    /// their source directly; git patches do not depend on apply order
    /// for those.
    fn previous_patch(&self, patch: &Patch) -> std::result::Result<Option<usize>, ApplyError> {
        if patch.is_copy || patch.is_rename {
            return Ok(None);
        }
        let Some(old_name) = &patch.old_name else {
            return Ok(None);
        };
        match self.fn_table.get(old_name) {
            None | Some(PatchStatus::WillBeDeleted) => Ok(None),
            Some(PatchStatus::WasDeleted) => Err(ApplyError::new(
                old_name.clone(),
                ApplyErrorKind::PathNotFound,
                format!("path {old_name} has been renamed/deleted"),
            )),
            Some(PatchStatus::Done(i)) => Ok(Some(*i)),
        }
    }

    fn path_is_beyond_symlink(&self, name: &str) -> bool {
        let mut prefix = name;
        while let Some(slash) = prefix.rfind('/') {
            prefix = &prefix[..slash];
            if self.kept_symlinks.contains(prefix) {
                return true;
            }
            if self.removed_symlinks.contains(prefix) {
                // A new symlink may still appear at a higher level.
                continue;
            }
            if self.opts.check_index {
                if let Some(entry) = self.index.lookup(prefix) {
                    if is_symlink_mode(entry.mode) {
                        return true;
                    }
                }
            } else {
                let full = self.ws.root.join(prefix);
                if let Ok(md) = fs::symlink_metadata(&full) {
                    if md.file_type().is_symlink() {
                        return true;
                    }
                }
            }
        }
        false
    }

    fn verify_path(name: &str) -> bool {
        !name.is_empty()
            && !name.starts_with('/')
            && !name.contains('\0')
            && !name.split('/').any(|c| c.is_empty() || c == "." || c == "..")
    }

    fn check_unsafe_path(&self, patch: &Patch) -> std::result::Result<(), ApplyError> {
        let mut to_check: Vec<&str> = Vec::new();
        if patch.is_deletion() || (!patch.is_creation() && !patch.is_copy) {
            to_check.extend(patch.old_name.as_deref());
        }
        if !patch.is_deletion() {
            to_check.extend(patch.new_name.as_deref());
        }
        for name in to_check {
            if !Self::verify_path(name) {
                return Err(ApplyError::new(
                    name,
                    ApplyErrorKind::InvalidPath,
                    format!("invalid path '{name}'"),
                ));
            }
        }
        Ok(())
    }

    /// Check one record and apply it in-core, leaving the result in
    /// `patch.result` for the write phase.
    fn check_patch(
        &mut self,
        records: &mut Vec<Patch>,
        idx: usize,
    ) -> std::result::Result<(), ApplyError> {
        records[idx].rejected = true; // dropped again on success

        self.check_preimage(records, idx)?;

        let new_name = records[idx].new_name.clone();
        let old_name = records[idx].old_name.clone();

        // A type-change is split into delete-then-create, and a
        // swap-rename first moves A onto B while B only goes away later
        // in the series; in both cases the existing path must not stop
        // us.
        let ok_if_exists = new_name
            .as_deref()
            .and_then(|n| self.fn_table.get(n))
            .map(|s| matches!(s, PatchStatus::WasDeleted | PatchStatus::WillBeDeleted))
            .unwrap_or(false);

        if let Some(new_name) = &new_name {
            if records[idx].is_creation() || records[idx].is_rename || records[idx].is_copy {
                if let Some(exists) = self.check_to_create(new_name, ok_if_exists)? {
                    if self.opts.threeway {
                        records[idx].direct_to_threeway = true;
                    } else {
                        let message = match exists {
                            ExistsWhere::Index => format!("{new_name}: already exists in index"),
                            ExistsWhere::IndexAsIntentToAdd => {
                                format!("{new_name}: does not match index")
                            }
                            ExistsWhere::Worktree => {
                                format!("{new_name}: already exists in working directory")
                            }
                        };
                        return Err(ApplyError::new(
                            new_name.clone(),
                            ApplyErrorKind::PathAlreadyExists(exists),
                            message,
                        ));
                    }
                }
                if records[idx].new_mode == 0 {
                    records[idx].new_mode = if records[idx].is_creation() {
                        MODE_REGULAR
                    } else {
                        records[idx].old_mode
                    };
                }
            }
        }

        if let (Some(new_name), Some(old_name)) = (&new_name, &old_name) {
            if records[idx].new_mode == 0 {
                records[idx].new_mode = records[idx].old_mode;
            }
            let (old_mode, new_mode) = (records[idx].old_mode, records[idx].new_mode);
            if old_mode != 0 && mode_type_bits(old_mode) != mode_type_bits(new_mode) {
                let message = if new_name == old_name {
                    format!(
                        "new mode ({new_mode:o}) of {new_name} does not match old mode ({old_mode:o})"
                    )
                } else {
                    format!(
                        "new mode ({new_mode:o}) of {new_name} does not match old mode ({old_mode:o}) of {old_name}"
                    )
                };
                return Err(ApplyError::new(
                    new_name.clone(),
                    ApplyErrorKind::TypeMismatch,
                    message,
                ));
            }
        }

        if !self.opts.unsafe_paths {
            self.check_unsafe_path(&records[idx])?;
        }

        // The result must not be deposited beyond a symbolic link.
        if !records[idx].is_deletion() {
            if let Some(new_name) = &new_name {
                if self.path_is_beyond_symlink(new_name) {
                    return Err(ApplyError::new(
                        new_name.clone(),
                        ApplyErrorKind::BeyondSymlink,
                        format!("affected file '{new_name}' is beyond a symbolic link"),
                    ));
                }
            }
        }

        self.apply_data(records, idx)?;
        records[idx].rejected = false;
        Ok(())
    }

    /// Resolve and sanity-check the pre-image side of a record,
    /// settling tri-state creation flags and missing modes.
    fn check_preimage(
        &mut self,
        records: &mut Vec<Patch>,
        idx: usize,
    ) -> std::result::Result<(), ApplyError> {
        let Some(old_name) = records[idx].old_name.clone() else {
            return Ok(());
        };

        debug_assert!(records[idx].is_new != Some(true));
        let previous = self.previous_patch(&records[idx])?;

        let mut st_mode = 0u32;
        let mut stat_md: Option<fs::Metadata> = None;
        let mut stat_missing = false;

        if let Some(prev) = previous {
            st_mode = records[prev].new_mode;
        } else if !self.opts.cached {
            match fs::symlink_metadata(self.ws.root.join(&old_name)) {
                Ok(md) => stat_md = Some(md),
                Err(e) if e.kind() == io::ErrorKind::NotFound => stat_missing = true,
                Err(e) => {
                    return Err(ApplyError::new(
                        old_name,
                        ApplyErrorKind::PathNotFound,
                        format!("cannot stat: {e}"),
                    ))
                }
            }
        }

        if self.opts.check_index && previous.is_none() {
            match self.index.lookup(&old_name) {
                None => {
                    if records[idx].is_new.is_none() {
                        return self.mark_as_creation(records, idx);
                    }
                    return Err(ApplyError::new(
                        old_name.clone(),
                        ApplyErrorKind::PathNotFound,
                        format!("{old_name}: does not exist in index"),
                    ));
                }
                Some(entry) => {
                    let entry_mode = entry.mode;
                    let entry_oid = entry.oid;
                    let entry_ita = entry.intent_to_add;
                    if stat_missing && !self.opts.cached {
                        // Materialise the entry so the worktree-side
                        // checks and reads can proceed.
                        self.checkout_entry(&old_name, entry_mode, &entry_oid)?;
                        stat_md = fs::symlink_metadata(self.ws.root.join(&old_name)).ok();
                        stat_missing = stat_md.is_none();
                    }
                    if !self.opts.cached && !entry_ita && !stat_missing {
                        self.verify_index_match(&old_name, &entry_oid)?;
                    }
                    if self.opts.cached {
                        st_mode = entry_mode;
                    }
                }
            }
        } else if stat_missing && previous.is_none() && !self.opts.cached {
            if records[idx].is_new.is_none() {
                return self.mark_as_creation(records, idx);
            }
            return Err(ApplyError::new(
                old_name.clone(),
                ApplyErrorKind::PathNotFound,
                format!("{old_name}: no such file"),
            ));
        }

        if !self.opts.cached && previous.is_none() {
            if let Some(md) = &stat_md {
                st_mode = mode_from_metadata(md);
            }
        }

        if records[idx].is_new.is_none() {
            records[idx].is_new = Some(false);
        }
        if records[idx].old_mode == 0 {
            records[idx].old_mode = st_mode;
        }
        if st_mode != 0 && mode_type_bits(st_mode) != mode_type_bits(records[idx].old_mode) {
            return Err(ApplyError::new(
                old_name.clone(),
                ApplyErrorKind::TypeMismatch,
                format!("{old_name}: wrong type"),
            ));
        }
        if st_mode != 0 && st_mode != records[idx].old_mode {
            log::warn!(
                "{old_name} has type {st_mode:o}, expected {:o}",
                records[idx].old_mode
            );
        }
        if records[idx].new_mode == 0 && !records[idx].is_deletion() {
            records[idx].new_mode = st_mode;
        }
        Ok(())
    }

    // A traditional patch against a missing file turns out to be a
    // creation after all.
    fn mark_as_creation(
        &self,
        records: &mut [Patch],
        idx: usize,
    ) -> std::result::Result<(), ApplyError> {
        records[idx].is_new = Some(true);
        records[idx].is_delete = Some(false);
        records[idx].old_name = None;
        Ok(())
    }

    fn checkout_entry(
        &mut self,
        path: &str,
        mode: u32,
        oid: &ObjectId,
    ) -> std::result::Result<(), ApplyError> {
        let (kind, bytes) = self.store.read(oid).map_err(|e| {
            ApplyError::new(
                path,
                ApplyErrorKind::PathNotFound,
                format!("cannot checkout {path}: {e}"),
            )
        })?;
        if kind != ObjectKind::Blob {
            return Err(ApplyError::new(
                path,
                ApplyErrorKind::TypeMismatch,
                format!("cannot checkout {path}: not a blob"),
            ));
        }
        self.write_worktree_file(path, mode, &bytes).map_err(|e| {
            ApplyError::new(
                path,
                ApplyErrorKind::PathNotFound,
                format!("cannot checkout {path}: {e}"),
            )
        })
    }

    // The worktree copy must agree with the index before we patch it.
    fn verify_index_match(
        &self,
        path: &str,
        oid: &ObjectId,
    ) -> std::result::Result<(), ApplyError> {
        let (_, bytes) = worktree_read(&self.ws.root, path).map_err(|e| {
            ApplyError::new(path, ApplyErrorKind::PathNotFound, format!("{path}: {e}"))
        })?;
        let actual = hash_object(self.ws.algo, ObjectKind::Blob, &bytes);
        if actual != *oid {
            return Err(ApplyError::new(
                path,
                ApplyErrorKind::DoesNotMatch,
                format!("{path}: does not match index"),
            ));
        }
        Ok(())
    }

    /// Distinguish the ways a to-be-created path may already exist.
    fn check_to_create(
        &self,
        new_name: &str,
        ok_if_exists: bool,
    ) -> std::result::Result<Option<ExistsWhere>, ApplyError> {
        if self.opts.check_index && (!ok_if_exists || !self.opts.cached) {
            if let Some(entry) = self.index.lookup_any(new_name) {
                // Intent-to-add entries do not yet exist in the index
                // for this purpose, but can never match a worktree file
                // either.
                if !ok_if_exists && !entry.intent_to_add {
                    return Ok(Some(ExistsWhere::Index));
                }
                if !self.opts.cached && entry.intent_to_add {
                    return Ok(Some(ExistsWhere::IndexAsIntentToAdd));
                }
            }
        }
        if self.opts.cached {
            return Ok(None);
        }
        match fs::symlink_metadata(self.ws.root.join(new_name)) {
            Ok(md) => {
                if md.is_dir() || ok_if_exists {
                    return Ok(None);
                }
                // A leading symlink this patch removes may still point
                // somewhere that has the path; as far as we are
                // concerned, the path does not exist.
                if has_symlink_leading_path(&self.ws.root, new_name) {
                    return Ok(None);
                }
                Ok(Some(ExistsWhere::Worktree))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ApplyError::new(
                new_name,
                ApplyErrorKind::PathNotFound,
                format!("{new_name}: {e}"),
            )),
        }
    }

    /// Populate an image with the current content of the record's old
    /// path: a previous record's result, the index, or the worktree.
    fn load_preimage(
        &mut self,
        records: &[Patch],
        idx: usize,
    ) -> std::result::Result<Image, ApplyError> {
        let patch = &records[idx];
        let previous = self.previous_patch(patch)?;

        let bytes = if let Some(prev) = previous {
            records[prev].result.clone().unwrap_or_default()
        } else if let Some(old_name) = &patch.old_name {
            if is_gitlink_mode(patch.old_mode) {
                return Err(ApplyError::new(
                    old_name.clone(),
                    ApplyErrorKind::TypeMismatch,
                    format!("{old_name}: submodule entries cannot be patched"),
                ));
            }
            if self.opts.cached || self.opts.check_index {
                match self.index.lookup(old_name) {
                    Some(entry) if !entry.intent_to_add => {
                        let oid = entry.oid;
                        let (kind, bytes) = self.store.read(&oid).map_err(|e| {
                            ApplyError::new(
                                old_name.clone(),
                                ApplyErrorKind::PathNotFound,
                                format!("failed to read {old_name}: {e}"),
                            )
                        })?;
                        if kind != ObjectKind::Blob {
                            return Err(ApplyError::new(
                                old_name.clone(),
                                ApplyErrorKind::TypeMismatch,
                                format!("{old_name}: not a blob"),
                            ));
                        }
                        bytes
                    }
                    _ => Vec::new(),
                }
            } else {
                if has_symlink_leading_path(&self.ws.root, old_name) {
                    return Err(ApplyError::new(
                        old_name.clone(),
                        ApplyErrorKind::BeyondSymlink,
                        format!("reading from '{old_name}' beyond a symbolic link"),
                    ));
                }
                let (_, bytes) = worktree_read(&self.ws.root, old_name).map_err(|e| {
                    ApplyError::new(
                        old_name.clone(),
                        ApplyErrorKind::PathNotFound,
                        format!("failed to read {old_name}: {e}"),
                    )
                })?;
                bytes
            }
        } else {
            Vec::new()
        };

        Ok(Image::new(bytes, !patch.is_binary))
    }

    /// Current content of the new path, for the creation-conflict
    /// three-way fall-back.
    fn load_current(&mut self, patch: &Patch) -> std::result::Result<Vec<u8>, ApplyError> {
        let name = patch.new_name.as_deref().unwrap_or_default();
        let Some(entry) = self.index.lookup(name) else {
            return Err(ApplyError::new(
                name,
                ApplyErrorKind::PathNotFound,
                format!("{name}: does not exist in index"),
            ));
        };
        let entry_oid = entry.oid;
        if self.opts.cached {
            let (_, bytes) = self.store.read(&entry_oid).map_err(|e| {
                ApplyError::new(
                    name,
                    ApplyErrorKind::PathNotFound,
                    format!("failed to read {name}: {e}"),
                )
            })?;
            Ok(bytes)
        } else {
            self.verify_index_match(name, &entry_oid)?;
            let (_, bytes) = worktree_read(&self.ws.root, name).map_err(|e| {
                ApplyError::new(
                    name,
                    ApplyErrorKind::PathNotFound,
                    format!("failed to read {name}: {e}"),
                )
            })?;
            Ok(bytes)
        }
    }

    fn match_options(&self, strict: bool) -> MatchOptions {
        if strict {
            // Strict mode for synthesizing the three-way post-image:
            // no whitespace tolerance, no context shrinking.
            MatchOptions {
                ws_error_action: WsErrorAction::Nowarn,
                ws_ignore_action: WsIgnoreAction::None,
                apply_in_reverse: self.opts.reverse,
                unidiff_zero: self.opts.unidiff_zero,
                allow_overlap: false,
                context_limit: usize::MAX,
            }
        } else {
            MatchOptions {
                ws_error_action: self.opts.ws_error_action,
                ws_ignore_action: self.opts.ws_ignore_action,
                apply_in_reverse: self.opts.reverse,
                unidiff_zero: self.opts.unidiff_zero,
                allow_overlap: self.opts.allow_overlap,
                context_limit: self.opts.context_limit,
            }
        }
    }

    /// Apply every fragment of a record to the image. With reject mode
    /// on, failed fragments are marked instead of failing the record.
    fn apply_fragments(
        &mut self,
        img: &mut Image,
        patch: &mut Patch,
        strict: bool,
        allow_reject: bool,
    ) -> std::result::Result<(), ApplyError> {
        if patch.is_binary {
            return binary::apply_binary(patch, img, &mut self.store, self.opts.reverse);
        }

        let opts = self.match_options(strict);
        let name = patch.old_best_name().to_string();
        let ws_rule = patch.ws_rule;
        let inaccurate_eof = patch.inaccurate_eof;
        for (nth, frag) in patch.fragments.iter_mut().enumerate() {
            let outcome = apply_one_fragment(
                img,
                frag,
                inaccurate_eof,
                ws_rule,
                nth + 1,
                &opts,
                &mut self.stats,
            );
            if outcome == FragmentOutcome::Rejected {
                if !allow_reject {
                    return Err(ApplyError::new(
                        name.clone(),
                        ApplyErrorKind::DoesNotMatch,
                        format!("patch failed: {name}:{}", frag.oldpos),
                    ));
                }
                frag.rejected = true;
            }
        }
        Ok(())
    }

    /// Reconstruct base/ours/theirs and merge. Returns Err when the
    /// fall-back is not applicable or the merge could not be set up.
    fn try_threeway(
        &mut self,
        records: &mut [Patch],
        idx: usize,
        image: &mut Image,
    ) -> std::result::Result<(), ApplyError> {
        let cannot = {
            let p = &records[idx];
            p.is_deletion()
                || is_gitlink_mode(p.old_mode)
                || is_gitlink_mode(p.new_mode)
                || (p.is_creation() && !p.direct_to_threeway)
                || (p.is_rename && p.lines_added == 0 && p.lines_deleted == 0)
        };
        let fail =
            |name: &str, message: String| ApplyError::new(name, ApplyErrorKind::DoesNotMatch, message);
        if cannot {
            return Err(fail(
                records[idx].best_name(),
                "three-way merge not applicable".into(),
            ));
        }

        // The pre-image the patch was prepared for. The hash must be
        // known exactly; abbreviations are not resolved here.
        let pre_oid = if records[idx].is_creation() {
            self.store
                .write(ObjectKind::Blob, b"")
                .map_err(|e| fail(records[idx].best_name(), e.to_string()))?
        } else {
            let name = records[idx].best_name().to_string();
            let oid = ObjectId::from_hex(&records[idx].old_oid_hex, self.ws.algo).map_err(|_| {
                fail(
                    &name,
                    "repository lacks the necessary blob to perform 3-way merge".into(),
                )
            })?;
            if !self.store.has(&oid) {
                return Err(fail(
                    &name,
                    "repository lacks the necessary blob to perform 3-way merge".into(),
                ));
            }
            oid
        };

        if records[idx].direct_to_threeway {
            log::info!("performing three-way merge...");
        }

        // Synthesize "theirs": the pre-image with the patch applied
        // strictly.
        let (_, pre_bytes) = self
            .store
            .read(&pre_oid)
            .map_err(|e| fail(records[idx].best_name(), e.to_string()))?;
        let mut tmp_image = Image::new(pre_bytes, true);
        {
            // Work on a scratch copy so reject flags from the strict
            // application do not leak into the real record.
            let mut scratch = Patch::default();
            scratch.fragments = records[idx].fragments.clone();
            scratch.is_binary = records[idx].is_binary;
            scratch.old_oid_hex = records[idx].old_oid_hex.clone();
            scratch.new_oid_hex = records[idx].new_oid_hex.clone();
            scratch.old_name = records[idx].old_name.clone();
            scratch.new_name = records[idx].new_name.clone();
            scratch.ws_rule = records[idx].ws_rule;
            self.apply_fragments(&mut tmp_image, &mut scratch, true, false)?;
        }
        let post_oid = self
            .store
            .write(ObjectKind::Blob, &tmp_image.bytes)
            .map_err(|e| fail(records[idx].best_name(), e.to_string()))?;

        // "ours" is what we currently have at the path.
        let our_bytes = if records[idx].is_creation() {
            self.load_current(&records[idx])?
        } else {
            self.load_preimage(records, idx)?.bytes
        };
        let our_oid = self
            .store
            .write(ObjectKind::Blob, &our_bytes)
            .map_err(|e| fail(records[idx].best_name(), e.to_string()))?;

        let merged = threeway::three_way_merge(&self.store, &pre_oid, &our_oid, &post_oid)
            .map_err(|e| fail(records[idx].best_name(), e.to_string()))?;

        *image = Image::new(merged.bytes, false);
        let name = records[idx].best_name().to_string();
        if merged.conflicted {
            records[idx].conflicted_threeway = true;
            records[idx].threeway_stages = [
                (!records[idx].is_creation()).then_some(pre_oid),
                Some(our_oid),
                Some(post_oid),
            ];
            log::warn!("applied patch to '{name}' with conflicts");
        } else {
            log::info!("applied patch to '{name}' cleanly");
        }
        Ok(())
    }

    fn apply_data(
        &mut self,
        records: &mut Vec<Patch>,
        idx: usize,
    ) -> std::result::Result<(), ApplyError> {
        let mut image = self.load_preimage(records, idx)?;

        if records[idx].direct_to_threeway {
            // The up-front checks already decided exact application
            // cannot work (e.g. the creation target exists).
            self.try_threeway(records, idx, &mut image)?;
        } else {
            let mut patch = std::mem::take(&mut records[idx]);
            let res = self.apply_fragments(&mut image, &mut patch, false, self.opts.with_reject);
            records[idx] = patch;
            if let Err(e) = res {
                if !self.opts.threeway {
                    return Err(e);
                }
                // Exact application failed; reload the pristine
                // pre-image and fall back to the three-way merge.
                log::info!("falling back to three-way merge...");
                let mut merged = self.load_preimage(records, idx)?;
                if self.try_threeway(records, idx, &mut merged).is_err() {
                    return Err(e);
                }
                image = merged;
            }
        }

        records[idx].result = Some(std::mem::take(&mut image.bytes));
        self.add_to_fn_table(records, idx);

        if records[idx].is_deletion()
            && !records[idx]
                .result
                .as_ref()
                .map(Vec::is_empty)
                .unwrap_or(true)
        {
            return Err(ApplyError::new(
                records[idx].old_best_name(),
                ApplyErrorKind::DoesNotMatch,
                "removal patch leaves file contents",
            ));
        }
        Ok(())
    }

    // ---- write-out phase ----

    fn write_out_results(&mut self, records: &mut [Patch]) -> Result<()> {
        // Phase 0 removes old files, phase 1 creates new ones; this
        // ordering is what makes swap-renames work.
        for phase in 0..2 {
            for idx in 0..records.len() {
                if records[idx].rejected {
                    continue;
                }
                self.write_out_one_result(&records[idx], phase)?;
                if phase == 1 {
                    self.write_out_one_reject(&records[idx])?;
                }
            }
        }
        Ok(())
    }

    fn write_out_one_result(&mut self, patch: &Patch, phase: usize) -> Result<()> {
        if patch.is_deletion() {
            if phase == 0 {
                self.remove_file(patch, true)?;
            }
            return Ok(());
        }
        if patch.is_creation() || patch.is_copy {
            if phase == 1 {
                self.create_file(patch)?;
            }
            return Ok(());
        }
        // Rename or modification: remove the old, write the new.
        if phase == 0 {
            self.remove_file(patch, patch.is_rename)?;
        }
        if phase == 1 {
            self.create_file(patch)?;
        }
        Ok(())
    }

    fn remove_file(&mut self, patch: &Patch, rmdir_empty: bool) -> Result<()> {
        let Some(old_name) = &patch.old_name else {
            return Ok(());
        };
        if self.update_index && !self.opts.intent_to_add {
            self.index.remove(old_name);
        }
        if !self.opts.cached {
            let full = self.ws.root.join(old_name);
            match fs::remove_file(&full) {
                Ok(()) => {
                    if rmdir_empty {
                        self.remove_empty_parents(old_name);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => log::warn!("unable to remove {old_name}: {e}"),
            }
        }
        Ok(())
    }

    fn remove_empty_parents(&self, path: &str) {
        let mut prefix = path;
        while let Some(slash) = prefix.rfind('/') {
            prefix = &prefix[..slash];
            if fs::remove_dir(self.ws.root.join(prefix)).is_err() {
                break;
            }
        }
    }

    fn write_worktree_file(&self, path: &str, mode: u32, content: &[u8]) -> io::Result<()> {
        let full = self.ws.root.join(path);

        #[cfg(unix)]
        if is_symlink_mode(mode) {
            let target = std::str::from_utf8(content).map_err(|_| {
                io::Error::new(io::ErrorKind::InvalidData, "non-UTF-8 symlink target")
            })?;
            if let Some(parent) = full.parent() {
                fs::create_dir_all(parent)?;
            }
            let _ = fs::remove_file(&full);
            return std::os::unix::fs::symlink(target, &full);
        }

        let write = |full: &Path| -> io::Result<()> {
            fs::write(full, content)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let bits = if mode & 0o100 != 0 { 0o755 } else { 0o644 };
                fs::set_permissions(full, fs::Permissions::from_mode(bits))?;
            }
            #[cfg(not(unix))]
            let _ = mode;
            Ok(())
        };

        match write(&full) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                if let Some(parent) = full.parent() {
                    fs::create_dir_all(parent)?;
                }
                write(&full)
            }
            Err(e) => Err(e),
        }
    }

    fn create_file(&mut self, patch: &Patch) -> Result<()> {
        let Some(new_name) = &patch.new_name else {
            return Ok(());
        };
        let mode = if patch.new_mode != 0 {
            patch.new_mode
        } else {
            MODE_REGULAR
        };
        let empty = Vec::new();
        let content = patch.result.as_ref().unwrap_or(&empty);

        if !self.opts.cached {
            // A symlink created by an earlier record may not have been
            // visible to the up-front check; re-verify before writing.
            if self.path_is_beyond_symlink(new_name) {
                return Err(Error::Apply(ApplyError::new(
                    new_name.clone(),
                    ApplyErrorKind::BeyondSymlink,
                    format!("affected file '{new_name}' is beyond a symbolic link"),
                )));
            }
            self.write_worktree_file(new_name, mode, content)?;
        }

        if patch.conflicted_threeway {
            self.index
                .set_conflict(new_name, mode, patch.threeway_stages);
        } else if self.update_index {
            if self.opts.intent_to_add && patch.is_creation() {
                self.index.add_intent_to_add(new_name, mode, self.ws.algo);
            } else {
                let oid = self.store.write(ObjectKind::Blob, content)?;
                self.index.update(new_name, mode, oid);
            }
        }
        Ok(())
    }

    /// Emit the `.rej` file for a record whose fragments were rejected:
    /// a synthetic mini-header followed by each rejected hunk verbatim.
    fn write_out_one_reject(&mut self, patch: &Patch) -> Result<()> {
        let rejects = patch.fragments.iter().filter(|f| f.rejected).count();
        if rejects == 0 {
            log::info!("applied patch {} cleanly", patch.best_name());
            return Ok(());
        }
        let Some(new_name) = &patch.new_name else {
            log::error!("rejected record without a destination path");
            return Ok(());
        };

        log::warn!("applying patch {new_name} with {rejects} rejects...");
        let reject_path = self.ws.root.join(format!("{new_name}.rej"));
        let mut out = Vec::new();
        out.extend_from_slice(
            format!("diff a/{new_name} b/{new_name}\t(rejected hunks)\n").as_bytes(),
        );
        for (nr, frag) in patch.fragments.iter().enumerate() {
            if !frag.rejected {
                log::info!("hunk #{} applied cleanly.", nr + 1);
                continue;
            }
            log::warn!("rejected hunk #{}.", nr + 1);
            out.extend_from_slice(&frag.body);
            if !frag.body.ends_with(b"\n") {
                out.push(b'\n');
            }
        }
        if let Some(parent) = reject_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&reject_path, out)?;
        Ok(())
    }
}
