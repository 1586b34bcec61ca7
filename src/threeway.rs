//! Three-way text merge used as a fall-back when exact application
//! fails: merge `ours` and `theirs` against their common ancestor,
//! emitting conflict markers when both sides touch the same region.

use similar::{DiffTag, TextDiff};

use crate::oid::ObjectId;
use crate::store::{ObjectKind, ObjectStore, StoreError};

/// Outcome of a blob-level merge.
pub struct MergeResult {
    pub bytes: Vec<u8>,
    pub conflicted: bool,
}

#[derive(Debug, Clone, Copy)]
struct Region {
    base_start: usize,
    base_end: usize,
    other_start: usize,
    other_end: usize,
}

fn split_lines(bytes: &[u8]) -> Vec<&[u8]> {
    let mut lines = Vec::new();
    let mut start = 0;
    while start < bytes.len() {
        let end = bytes[start..]
            .iter()
            .position(|&b| b == b'\n')
            .map(|p| start + p + 1)
            .unwrap_or(bytes.len());
        lines.push(&bytes[start..end]);
        start = end;
    }
    lines
}

// Changed line ranges of `other` relative to `base`, merged when
// adjacent.
fn changed_regions(base: &[u8], other: &[u8]) -> Vec<Region> {
    let diff = TextDiff::from_lines(base, other);
    let mut regions: Vec<Region> = Vec::new();
    for op in diff.ops() {
        if op.tag() == DiffTag::Equal {
            continue;
        }
        let old = op.old_range();
        let new = op.new_range();
        if let Some(last) = regions.last_mut() {
            if last.base_end == old.start && last.other_end == new.start {
                last.base_end = old.end;
                last.other_end = new.end;
                continue;
            }
        }
        regions.push(Region {
            base_start: old.start,
            base_end: old.end,
            other_start: new.start,
            other_end: new.end,
        });
    }
    regions
}

// The span of `other` lines corresponding to base lines [cs, ce),
// given the cluster's regions from that side.
fn side_span(regions: &[Region], cs: usize, ce: usize) -> (usize, usize) {
    debug_assert!(!regions.is_empty());
    let first = regions[0];
    let last = regions[regions.len() - 1];
    let start = first.other_start - (first.base_start - cs);
    let end = last.other_end + (ce - last.base_end);
    (start, end)
}

fn push_lines(out: &mut Vec<u8>, lines: &[&[u8]]) {
    for line in lines {
        out.extend_from_slice(line);
    }
}

/// Merge `ours` and `theirs` against `base`. Overlapping changes
/// produce conflict markers and set `conflicted`.
pub fn merge_blobs(
    base: &[u8],
    ours: &[u8],
    theirs: &[u8],
    ours_label: &str,
    theirs_label: &str,
) -> MergeResult {
    let base_lines = split_lines(base);
    let ours_lines = split_lines(ours);
    let theirs_lines = split_lines(theirs);

    let a = changed_regions(base, ours);
    let b = changed_regions(base, theirs);

    let mut out = Vec::with_capacity(ours.len().max(theirs.len()));
    let mut conflicted = false;
    let mut base_pos = 0usize;
    let (mut i, mut j) = (0usize, 0usize);

    while i < a.len() || j < b.len() {
        let a_start = a.get(i).map(|r| r.base_start).unwrap_or(usize::MAX);
        let b_start = b.get(j).map(|r| r.base_start).unwrap_or(usize::MAX);
        let cluster_start = a_start.min(b_start);
        let mut cluster_end = cluster_start;
        let (mut ci, mut cj) = (i, j);

        // Grow the cluster while regions from either side overlap it;
        // insertions at the cluster start join it too.
        loop {
            let mut progressed = false;
            while ci < a.len()
                && (a[ci].base_start < cluster_end || a[ci].base_start == cluster_start)
            {
                cluster_end = cluster_end.max(a[ci].base_end);
                ci += 1;
                progressed = true;
            }
            while cj < b.len()
                && (b[cj].base_start < cluster_end || b[cj].base_start == cluster_start)
            {
                cluster_end = cluster_end.max(b[cj].base_end);
                cj += 1;
                progressed = true;
            }
            if !progressed {
                break;
            }
        }

        push_lines(&mut out, &base_lines[base_pos..cluster_start]);

        let ours_touched = ci > i;
        let theirs_touched = cj > j;
        if ours_touched && !theirs_touched {
            let (s, e) = side_span(&a[i..ci], cluster_start, cluster_end);
            push_lines(&mut out, &ours_lines[s..e]);
        } else if theirs_touched && !ours_touched {
            let (s, e) = side_span(&b[j..cj], cluster_start, cluster_end);
            push_lines(&mut out, &theirs_lines[s..e]);
        } else {
            let (os, oe) = side_span(&a[i..ci], cluster_start, cluster_end);
            let (ts, te) = side_span(&b[j..cj], cluster_start, cluster_end);
            if ours_lines[os..oe] == theirs_lines[ts..te] {
                // Both sides made the same change.
                push_lines(&mut out, &ours_lines[os..oe]);
            } else {
                conflicted = true;
                out.extend_from_slice(format!("<<<<<<< {ours_label}\n").as_bytes());
                push_lines(&mut out, &ours_lines[os..oe]);
                out.extend_from_slice(b"=======\n");
                push_lines(&mut out, &theirs_lines[ts..te]);
                out.extend_from_slice(format!(">>>>>>> {theirs_label}\n").as_bytes());
            }
        }

        base_pos = cluster_end;
        i = ci;
        j = cj;
    }
    push_lines(&mut out, &base_lines[base_pos..]);

    MergeResult {
        bytes: out,
        conflicted,
    }
}

fn read_blob(store: &dyn ObjectStore, oid: &ObjectId) -> Result<Vec<u8>, StoreError> {
    let (kind, bytes) = store.read(oid)?;
    if kind != ObjectKind::Blob {
        return Err(StoreError::Corrupt {
            oid: *oid,
            reason: format!("expected a blob, found {}", kind.as_str()),
        });
    }
    Ok(bytes)
}

/// Merge three blobs by id, resolving the trivial cases without
/// running the text merge: if ours did not change, take theirs; if
/// theirs did not change or both agree, take ours.
pub fn three_way_merge(
    store: &dyn ObjectStore,
    base: &ObjectId,
    ours: &ObjectId,
    theirs: &ObjectId,
) -> Result<MergeResult, StoreError> {
    if base == ours {
        return Ok(MergeResult {
            bytes: read_blob(store, theirs)?,
            conflicted: false,
        });
    }
    if base == theirs || ours == theirs {
        return Ok(MergeResult {
            bytes: read_blob(store, ours)?,
            conflicted: false,
        });
    }
    let base_bytes = read_blob(store, base)?;
    let ours_bytes = read_blob(store, ours)?;
    let theirs_bytes = read_blob(store, theirs)?;
    Ok(merge_blobs(
        &base_bytes,
        &ours_bytes,
        &theirs_bytes,
        "ours",
        "theirs",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disjoint_changes_merge_cleanly() {
        let base = b"one\ntwo\nthree\nfour\nfive\n";
        let ours = b"ONE\ntwo\nthree\nfour\nfive\n";
        let theirs = b"one\ntwo\nthree\nfour\nFIVE\n";
        let m = merge_blobs(base, ours, theirs, "ours", "theirs");
        assert!(!m.conflicted);
        assert_eq!(m.bytes, b"ONE\ntwo\nthree\nfour\nFIVE\n");
    }

    #[test]
    fn test_same_change_both_sides() {
        let base = b"a\nb\nc\n";
        let both = b"a\nB\nc\n";
        let m = merge_blobs(base, both, both, "ours", "theirs");
        assert!(!m.conflicted);
        assert_eq!(m.bytes, b"a\nB\nc\n");
    }

    #[test]
    fn test_overlap_conflicts() {
        let base = b"a\nb\nc\n";
        let ours = b"a\nOURS\nc\n";
        let theirs = b"a\nTHEIRS\nc\n";
        let m = merge_blobs(base, ours, theirs, "ours", "theirs");
        assert!(m.conflicted);
        let text = String::from_utf8(m.bytes).unwrap();
        assert_eq!(
            text,
            "a\n<<<<<<< ours\nOURS\n=======\nTHEIRS\n>>>>>>> theirs\nc\n"
        );
    }

    #[test]
    fn test_ours_only_change() {
        let base = b"x\ny\n";
        let ours = b"x\ny\nz\n";
        let m = merge_blobs(base, ours, base, "ours", "theirs");
        assert!(!m.conflicted);
        assert_eq!(m.bytes, b"x\ny\nz\n");
    }

    #[test]
    fn test_insertions_at_same_point_conflict() {
        let base = b"a\nz\n";
        let ours = b"a\nfrom-ours\nz\n";
        let theirs = b"a\nfrom-theirs\nz\n";
        let m = merge_blobs(base, ours, theirs, "ours", "theirs");
        assert!(m.conflicted);
    }

    #[test]
    fn test_deletion_vs_unchanged() {
        let base = b"a\nb\nc\n";
        let ours = b"a\nc\n";
        let m = merge_blobs(base, ours, base, "ours", "theirs");
        assert!(!m.conflicted);
        assert_eq!(m.bytes, b"a\nc\n");
    }
}
