//! Patch parser: turns a byte stream of concatenated per-file patches
//! into [`Patch`] records owning their [`Fragment`]s.
//!
//! Three dialects are recognised per file, in priority order: the
//! `diff --git` dialect with extended headers (and optionally a binary
//! payload), the traditional `--- / +++` dialect, and header-only
//! diffs that change no content (mode changes, empty creations, pure
//! renames).

use crate::binary::{decode_base85, inflate};
use crate::errors::{ParseError, ParseErrorKind};
use crate::oid::ObjectId;
use crate::strbuf::unquote_c_style;
use crate::ws::{self, WsAttributes, WsErrorAction, WsStats};

const TERM_SPACE: u32 = 1;
const TERM_TAB: u32 = 2;

/// How a binary hunk's payload is encoded (after inflation).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryMethod {
    LiteralDeflated,
    DeltaDeflated,
}

/// The decoded payload of one binary hunk.
#[derive(Debug, Clone)]
pub struct BinaryHunk {
    pub method: BinaryMethod,
    pub data: Vec<u8>,
}

/// One hunk. `body` holds the hunk text verbatim, including the `@@`
/// header line, so rejected hunks can be emitted exactly as seen.
#[derive(Debug, Default, Clone)]
pub struct Fragment {
    pub oldpos: usize,
    pub oldlines: usize,
    pub newpos: usize,
    pub newlines: usize,
    /// Leading and trailing runs of context lines.
    pub leading: usize,
    pub trailing: usize,
    /// Line number of the hunk header, for diagnostics.
    pub linenr: usize,
    pub body: Vec<u8>,
    pub rejected: bool,
    pub binary: Option<BinaryHunk>,
}

/// One file's parsed changes.
#[derive(Debug, Default)]
pub struct Patch {
    /// Name recovered from the `diff --git` line itself; used when no
    /// other header carries it (mode-only changes, empty files).
    pub def_name: Option<String>,
    pub old_name: Option<String>,
    pub new_name: Option<String>,
    pub old_mode: u32,
    pub new_mode: u32,
    /// Tri-state during parsing: `None` means "not known yet", which
    /// only traditional patches leave undecided.
    pub is_new: Option<bool>,
    pub is_delete: Option<bool>,
    pub is_rename: bool,
    pub is_copy: bool,
    pub is_binary: bool,
    /// Similarity (or dissimilarity) score, 0..=100.
    pub score: u32,
    /// Hex object ids from the `index` line; possibly abbreviated.
    pub old_oid_hex: String,
    pub new_oid_hex: String,
    pub fragments: Vec<Fragment>,
    pub ws_rule: u32,
    pub crlf_in_old: bool,
    pub lines_added: usize,
    pub lines_deleted: usize,
    pub is_toplevel_relative: bool,
    pub recount: bool,
    pub inaccurate_eof: bool,
    extension_linenr: usize,

    // Driver state, filled during application.
    pub rejected: bool,
    pub result: Option<Vec<u8>>,
    pub direct_to_threeway: bool,
    pub conflicted_threeway: bool,
    pub threeway_stages: [Option<ObjectId>; 3],
}

impl Patch {
    pub fn is_creation(&self) -> bool {
        self.is_new == Some(true)
    }

    pub fn is_deletion(&self) -> bool {
        self.is_delete == Some(true)
    }

    /// The name to report for this patch.
    pub fn best_name(&self) -> &str {
        self.new_name
            .as_deref()
            .or(self.old_name.as_deref())
            .or(self.def_name.as_deref())
            .unwrap_or("")
    }

    pub fn old_best_name(&self) -> &str {
        self.old_name
            .as_deref()
            .or(self.new_name.as_deref())
            .unwrap_or("")
    }

    /// Does this patch change anything beyond file content?
    pub fn metadata_changes(&self) -> bool {
        self.is_rename
            || self.is_copy
            || self.is_creation()
            || self.is_deletion()
            || (self.old_mode != 0 && self.new_mode != 0 && self.old_mode != self.new_mode)
    }
}

/// Parser knobs; the driver fills this from its options.
#[derive(Debug, Clone)]
pub struct ParseConfig {
    /// Leading path components to strip; `None` means "infer per
    /// patch, defaulting to 1".
    pub p_value: Option<usize>,
    /// Prepended to every parsed path (`--directory`); must end in `/`
    /// if non-empty.
    pub root: Option<String>,
    /// Subdirectory the caller is operating from; biases p-value
    /// guessing for traditional patches.
    pub prefix: Option<String>,
    /// Recompute hunk line counts from the body.
    pub recount: bool,
    pub inaccurate_eof: bool,
    pub apply_in_reverse: bool,
    pub ws_error_action: WsErrorAction,
    /// Hex width of a full object id under the active hash algorithm.
    pub hexsz: usize,
}

impl Default for ParseConfig {
    fn default() -> Self {
        ParseConfig {
            p_value: None,
            root: None,
            prefix: None,
            recount: false,
            inaccurate_eof: false,
            apply_in_reverse: false,
            ws_error_action: WsErrorAction::Warn,
            hexsz: 40,
        }
    }
}

/// Parse a whole patch stream into records.
pub fn parse_patch_stream(
    buf: &[u8],
    config: &ParseConfig,
    ws_attrs: &WsAttributes,
    stats: &mut WsStats,
) -> Result<Vec<Patch>, ParseError> {
    let mut parser = Parser {
        linenr: 1,
        p_value: config.p_value.unwrap_or(1),
        p_value_known: config.p_value.is_some(),
        root: config.root.clone(),
        prefix: config.prefix.clone(),
        apply_in_reverse: config.apply_in_reverse,
        ws_error_action: config.ws_error_action,
        hexsz: config.hexsz,
    };
    let mut patches = Vec::new();
    let mut offset = 0;
    while offset < buf.len() {
        let mut patch = Patch {
            recount: config.recount,
            inaccurate_eof: config.inaccurate_eof,
            ..Patch::default()
        };
        match parser.parse_chunk(&buf[offset..], &mut patch, ws_attrs, stats)? {
            Some(used) => {
                patches.push(patch);
                offset += used;
            }
            None => break,
        }
    }
    Ok(patches)
}

/// Swap the two sides of every record, for `--reverse`. Fragment body
/// prefixes are swapped later, while building sub-images.
pub fn reverse_patches(patches: &mut [Patch]) {
    for p in patches {
        std::mem::swap(&mut p.old_name, &mut p.new_name);
        std::mem::swap(&mut p.old_mode, &mut p.new_mode);
        std::mem::swap(&mut p.is_new, &mut p.is_delete);
        std::mem::swap(&mut p.lines_added, &mut p.lines_deleted);
        std::mem::swap(&mut p.old_oid_hex, &mut p.new_oid_hex);
        for frag in &mut p.fragments {
            std::mem::swap(&mut frag.oldpos, &mut frag.newpos);
            std::mem::swap(&mut frag.oldlines, &mut frag.newlines);
        }
    }
}

pub(crate) fn linelen(buf: &[u8]) -> usize {
    buf.iter()
        .position(|&b| b == b'\n')
        .map(|p| p + 1)
        .unwrap_or(buf.len())
}

fn is_dev_null(rest: &[u8]) -> bool {
    rest.strip_prefix(b"/dev/null")
        .and_then(|r| r.first())
        .map(|b| b.is_ascii_whitespace())
        .unwrap_or(false)
}

fn count_slashes(s: &str) -> usize {
    s.bytes().filter(|&b| b == b'/').count()
}

// Collapse runs of slashes so --index style lookups see one form.
fn squash_slash(mut name: String) -> String {
    if name.contains("//") {
        let mut out = String::with_capacity(name.len());
        let mut prev_slash = false;
        for c in name.chars() {
            if c == '/' {
                if prev_slash {
                    continue;
                }
                prev_slash = true;
            } else {
                prev_slash = false;
            }
            out.push(c);
        }
        name = out;
    }
    name
}

/// Skip `p_value` leading components; absolute paths are refused.
fn skip_tree_prefix(p_value: usize, line: &[u8]) -> Option<&[u8]> {
    if p_value == 0 {
        return if line.first() == Some(&b'/') {
            None
        } else {
            Some(line)
        };
    }
    let mut nslash = p_value;
    for (i, &b) in line.iter().enumerate() {
        if b == b'/' {
            nslash -= 1;
            if nslash == 0 {
                return if i == 0 { None } else { Some(&line[i + 1..]) };
            }
        }
    }
    None
}

fn name_terminate(c: u8, terminate: u32) -> bool {
    if c == b' ' && terminate & TERM_SPACE == 0 {
        return false;
    }
    if c == b'\t' && terminate & TERM_TAB == 0 {
        return false;
    }
    true
}

fn parse_usize_prefix(buf: &[u8]) -> Option<(usize, usize)> {
    let digits = buf.iter().take_while(|b| b.is_ascii_digit()).count();
    if digits == 0 {
        return None;
    }
    std::str::from_utf8(&buf[..digits])
        .ok()?
        .parse()
        .ok()
        .map(|v| (v, digits))
}

// "--- deleted/file\t2010-07-05 19:41:17.620000023 -0500" -- the
// timestamp tail length, or 0 when the line carries none.

fn sane_tz_len(line: &[u8]) -> usize {
    let n = " +0500".len();
    if line.len() < n || line[line.len() - n] != b' ' {
        return 0;
    }
    let tz = &line[line.len() - n..];
    if tz[1] != b'+' && tz[1] != b'-' {
        return 0;
    }
    if tz[2..].iter().all(|b| b.is_ascii_digit()) {
        n
    } else {
        0
    }
}

fn tz_with_colon_len(line: &[u8]) -> usize {
    let n = " +08:00".len();
    if line.len() < n || line[line.len() - ":00".len()] != b':' {
        return 0;
    }
    let tz = &line[line.len() - n..];
    if tz[0] != b' ' || (tz[1] != b'+' && tz[1] != b'-') {
        return 0;
    }
    let p = &tz[2..];
    if p[0].is_ascii_digit() && p[1].is_ascii_digit() && p[2] == b':' && p[3].is_ascii_digit() && p[4].is_ascii_digit()
    {
        n
    } else {
        0
    }
}

fn date_len(line: &[u8]) -> usize {
    let n = "72-02-05".len();
    if line.len() < n || line[line.len() - "-05".len()] != b'-' {
        return 0;
    }
    let mut date = line.len() - n;
    let p = &line[date..];
    if !(p[0].is_ascii_digit()
        && p[1].is_ascii_digit()
        && p[2] == b'-'
        && p[3].is_ascii_digit()
        && p[4].is_ascii_digit()
        && p[5] == b'-'
        && p[6].is_ascii_digit()
        && p[7].is_ascii_digit())
    {
        return 0;
    }
    if date >= 2 && line[date - 1].is_ascii_digit() && line[date - 2].is_ascii_digit() {
        date -= 2; // 4-digit year
    }
    line.len() - date
}

fn short_time_len(line: &[u8]) -> usize {
    let n = " 07:01:32".len();
    if line.len() < n || line[line.len() - ":32".len()] != b':' {
        return 0;
    }
    let p = &line[line.len() - n..];
    if p[0] == b' '
        && p[1].is_ascii_digit()
        && p[2].is_ascii_digit()
        && p[3] == b':'
        && p[4].is_ascii_digit()
        && p[5].is_ascii_digit()
        && p[6] == b':'
        && p[7].is_ascii_digit()
        && p[8].is_ascii_digit()
    {
        n
    } else {
        0
    }
}

fn fractional_time_len(line: &[u8]) -> usize {
    // Expected format: 19:41:17.620000023
    if line.is_empty() || !line[line.len() - 1].is_ascii_digit() {
        return 0;
    }
    let mut p = line.len() - 1;
    while p > 0 && line[p].is_ascii_digit() {
        p -= 1;
    }
    if line[p] != b'.' {
        return 0;
    }
    let n = short_time_len(&line[..p]);
    if n == 0 {
        return 0;
    }
    line.len() - p + n
}

fn trailing_spaces_len(line: &[u8]) -> usize {
    line.len() - line.iter().rposition(|&b| b != b' ').map(|p| p + 1).unwrap_or(0)
}

fn diff_timestamp_len(line: &[u8]) -> usize {
    let len = line.len();
    if len == 0 || !line[len - 1].is_ascii_digit() {
        return 0;
    }
    let mut end = len;

    let mut n = sane_tz_len(&line[..end]);
    if n == 0 {
        n = tz_with_colon_len(&line[..end]);
    }
    end -= n;

    let mut n = short_time_len(&line[..end]);
    if n == 0 {
        n = fractional_time_len(&line[..end]);
    }
    end -= n;

    let n = date_len(&line[..end]);
    if n == 0 {
        return 0;
    }
    end -= n;

    if end == 0 {
        return 0;
    }
    if line[end - 1] == b'\t' {
        return len - (end - 1);
    }
    if line[end - 1] != b' ' {
        return 0;
    }
    end -= trailing_spaces_len(&line[..end]);
    len - end
}

/// Does the `---`/`+++` line carry a GNU-diff epoch timestamp after
/// the last HT? GNU diff puts the epoch there to signal a
/// creation/deletion event.
fn has_epoch_timestamp(nameline: &[u8]) -> bool {
    let eol = nameline
        .iter()
        .position(|&b| b == b'\n')
        .unwrap_or(nameline.len());
    let Some(tab) = nameline[..eol].iter().rposition(|&b| b == b'\t') else {
        return false;
    };
    let ts = &nameline[tab + 1..eol];

    // The date must be 1969-12-31 (west of GMT) or 1970-01-01.
    let (epoch_hour, rest) = if let Some(rest) = ts.strip_prefix(b"1969-12-31 ") {
        (24i64, rest)
    } else if let Some(rest) = ts.strip_prefix(b"1970-01-01 ") {
        (0i64, rest)
    } else {
        return false;
    };

    // HH:MM:00(.0+)? [+-]HH[:]MM
    let d = |b: u8| b.is_ascii_digit();
    if rest.len() < 8 || !d(rest[0]) || !d(rest[1]) || rest[0] > b'2' {
        return false;
    }
    if rest[2] != b':' || !d(rest[3]) || !d(rest[4]) || rest[3] > b'5' {
        return false;
    }
    if rest[5] != b':' || rest[6] != b'0' || rest[7] != b'0' {
        return false;
    }
    let hour = i64::from(rest[0] - b'0') * 10 + i64::from(rest[1] - b'0');
    let minute = i64::from(rest[3] - b'0') * 10 + i64::from(rest[4] - b'0');

    let mut i = 8;
    if rest.get(i) == Some(&b'.') {
        i += 1;
        let zeros = rest[i..].iter().take_while(|&&b| b == b'0').count();
        if zeros == 0 {
            return false;
        }
        i += zeros;
    }
    if rest.get(i) != Some(&b' ') {
        return false;
    }
    i += 1;
    let sign = match rest.get(i) {
        Some(&b'+') => 1i64,
        Some(&b'-') => -1i64,
        _ => return false,
    };
    i += 1;
    if rest.len() < i + 2 || !d(rest[i]) || !d(rest[i + 1]) {
        return false;
    }
    let zh = i64::from(rest[i] - b'0') * 10 + i64::from(rest[i + 1] - b'0');
    i += 2;
    if rest.get(i) == Some(&b':') {
        i += 1;
    }
    if rest.len() < i + 2 || !d(rest[i]) || !d(rest[i + 1]) {
        return false;
    }
    let zm = i64::from(rest[i] - b'0') * 10 + i64::from(rest[i + 1] - b'0');
    if rest.len() != i + 2 {
        return false;
    }
    let zoneoffset = sign * (zh * 60 + zm);

    hour * 60 + minute - zoneoffset == epoch_hour * 60
}

/// Parse "@@ -o[,ol] +n[,nl] @@" into the fragment's positions.
/// Returns the offset just past " @@" on success.
fn parse_fragment_header(line: &[u8], frag: &mut Fragment) -> Option<usize> {
    if line.is_empty() || line[line.len() - 1] != b'\n' {
        return None;
    }
    let offset = parse_range(line, 4, b" +", &mut frag.oldpos, &mut frag.oldlines)?;
    parse_range(line, offset, b" @@", &mut frag.newpos, &mut frag.newlines)
}

fn parse_range(
    line: &[u8],
    offset: usize,
    expect: &[u8],
    p1: &mut usize,
    p2: &mut usize,
) -> Option<usize> {
    if offset >= line.len() {
        return None;
    }
    let rest = &line[offset..];
    let (v1, d1) = parse_usize_prefix(rest)?;
    *p1 = v1;
    let mut used = d1;
    *p2 = 1;
    if rest.get(used) == Some(&b',') {
        let (v2, d2) = parse_usize_prefix(&rest[used + 1..])?;
        *p2 = v2;
        used += d2 + 1;
    }
    if !rest[used..].starts_with(expect) {
        return None;
    }
    Some(offset + used + expect.len())
}

struct Parser {
    linenr: usize,
    p_value: usize,
    p_value_known: bool,
    root: Option<String>,
    prefix: Option<String>,
    apply_in_reverse: bool,
    ws_error_action: WsErrorAction,
    hexsz: usize,
}

impl Parser {
    fn err(&self, kind: ParseErrorKind, message: impl Into<String>) -> ParseError {
        ParseError::new(self.linenr, kind, message)
    }

    fn add_root(&self, name: String) -> String {
        match &self.root {
            Some(root) => squash_slash(format!("{root}{name}")),
            None => squash_slash(name),
        }
    }

    /// Parse one per-file section. `Ok(None)` means no further header
    /// was found in the stream.
    fn parse_chunk(
        &mut self,
        buf: &[u8],
        patch: &mut Patch,
        ws_attrs: &WsAttributes,
        stats: &mut WsStats,
    ) -> Result<Option<usize>, ParseError> {
        let Some((skip, hdrsize)) = self.find_header(buf, patch)? else {
            return Ok(None);
        };

        patch.ws_rule = ws_attrs.rule_for(
            patch
                .new_name
                .as_deref()
                .or(patch.old_name.as_deref())
                .unwrap_or(""),
        );

        let body_start = skip + hdrsize;
        let mut patchsize = self.parse_single_patch(&buf[body_start..], patch, stats)?;

        if patchsize == 0 {
            const GIT_BINARY: &[u8] = b"GIT binary patch\n";
            let rest = &buf[body_start..];
            let llen = linelen(rest);
            if rest.starts_with(GIT_BINARY) {
                self.linenr += 1;
                let used = self.parse_binary(&rest[GIT_BINARY.len()..], patch)?;
                patchsize = GIT_BINARY.len() + used;
            } else if llen >= 8 && rest[..llen].ends_with(b" differ\n") {
                for binhdr in [&b"Binary files "[..], &b"Files "[..]] {
                    if rest.starts_with(binhdr) {
                        self.linenr += 1;
                        patch.is_binary = true;
                        patchsize = llen;
                        break;
                    }
                }
            }

            // A text patch without hunks must at least change metadata.
            if !patch.is_binary && !patch.metadata_changes() {
                return Err(self.err(
                    ParseErrorKind::BadHeader,
                    format!("patch with only garbage at line {}", self.linenr),
                ));
            }
        }

        Ok(Some(body_start + patchsize))
    }

    /// Find the next per-file header. Returns (bytes skipped before the
    /// header, header size in bytes).
    fn find_header(
        &mut self,
        buf: &[u8],
        patch: &mut Patch,
    ) -> Result<Option<(usize, usize)>, ParseError> {
        patch.is_toplevel_relative = false;
        patch.is_rename = false;
        patch.is_copy = false;
        patch.is_new = None;
        patch.is_delete = None;
        patch.old_mode = 0;
        patch.new_mode = 0;
        patch.old_name = None;
        patch.new_name = None;

        let mut offset = 0;
        while offset < buf.len() {
            let rest = &buf[offset..];
            let len = linelen(rest);
            let line = &rest[..len];

            if len < 6 {
                offset += len;
                self.linenr += 1;
                continue;
            }

            // A stray fragment without a preceding header means the
            // patch got corrupted or truncated upstream.
            if line.starts_with(b"@@ -") {
                let mut dummy = Fragment::default();
                if parse_fragment_header(line, &mut dummy).is_some() {
                    return Err(self.err(
                        ParseErrorKind::BadHeader,
                        format!(
                            "patch fragment without header at line {}: {}",
                            self.linenr,
                            String::from_utf8_lossy(line.strip_suffix(b"\n").unwrap_or(line))
                        ),
                    ));
                }
                offset += len;
                self.linenr += 1;
                continue;
            }

            if rest.len() < len + 6 {
                break;
            }

            // Git header? It might carry no hunks at all (pure rename
            // or mode change), so it is handled specially.
            if line.starts_with(b"diff --git ") {
                let linenr_before = self.linenr;
                let git_hdr_len = self.parse_git_diff_header(rest, len, patch)?;
                if git_hdr_len <= len {
                    self.linenr = linenr_before + 1;
                    offset += len;
                    continue;
                }
                return Ok(Some((offset, git_hdr_len)));
            }

            // Traditional "---" followed by "+++", then a hunk.
            if line.starts_with(b"--- ") && rest[len..].starts_with(b"+++ ") {
                let nextlen = linelen(&rest[len..]);
                let after = &rest[len + nextlen..];
                if rest.len() >= len + nextlen + 14 && after.starts_with(b"@@ -") {
                    self.parse_traditional_patch(&line[4..], &rest[len + 4..len + nextlen], patch)?;
                    self.linenr += 2;
                    return Ok(Some((offset, len + nextlen)));
                }
            }

            offset += len;
            self.linenr += 1;
        }
        Ok(None)
    }

    fn parse_traditional_patch(
        &mut self,
        first: &[u8],
        second: &[u8],
        patch: &mut Patch,
    ) -> Result<(), ParseError> {
        if !self.p_value_known {
            let p = self.guess_p_value(first);
            let q = self.guess_p_value(second);
            let p = if p < 0 { q } else { p };
            if p >= 0 && p == q {
                self.p_value = p as usize;
                self.p_value_known = true;
            }
        }

        let name;
        if is_dev_null(first) {
            patch.is_new = Some(true);
            patch.is_delete = Some(false);
            name = self.find_name_traditional(second, None, self.p_value);
            patch.new_name = name.clone();
        } else if is_dev_null(second) {
            patch.is_new = Some(false);
            patch.is_delete = Some(true);
            name = self.find_name_traditional(first, None, self.p_value);
            patch.old_name = name.clone();
        } else {
            let first_name = self.find_name_traditional(first, None, self.p_value);
            name = self.find_name_traditional(second, first_name.as_deref(), self.p_value);
            if has_epoch_timestamp(first) {
                patch.is_new = Some(true);
                patch.is_delete = Some(false);
                patch.new_name = name.clone();
            } else if has_epoch_timestamp(second) {
                patch.is_new = Some(false);
                patch.is_delete = Some(true);
                patch.old_name = name.clone();
            } else {
                patch.old_name = name.clone();
                patch.new_name = name.clone();
            }
        }
        if name.is_none() {
            return Err(self.err(
                ParseErrorKind::MissingFilename,
                format!("unable to find filename in patch at line {}", self.linenr),
            ));
        }
        Ok(())
    }

    /// Guess the p value from a `---`/`+++` path: the count that maps
    /// the path under the invocation prefix, or 0 for bare names.
    fn guess_p_value(&self, nameline: &[u8]) -> isize {
        if is_dev_null(nameline) {
            return -1;
        }
        let Some(name) = self.find_name_traditional(nameline, None, 0) else {
            return -1;
        };
        match name.find('/') {
            None => 0,
            Some(slash) => {
                if let Some(prefix) = &self.prefix {
                    if name.starts_with(prefix.as_str()) {
                        count_slashes(prefix) as isize
                    } else if name[slash + 1..].starts_with(prefix.as_str()) {
                        count_slashes(prefix) as isize + 1
                    } else {
                        -1
                    }
                } else {
                    -1
                }
            }
        }
    }

    fn find_name(
        &self,
        line: &[u8],
        def: Option<&str>,
        p_value: usize,
        terminate: u32,
    ) -> Option<String> {
        if line.first() == Some(&b'"') {
            if let Some(name) = self.find_name_gnu(line, p_value) {
                return Some(name);
            }
        }
        self.find_name_common(line, def, p_value, None, terminate)
    }

    fn find_name_gnu(&self, line: &[u8], p_value: usize) -> Option<String> {
        let (name, _) = unquote_c_style(line)?;
        let mut idx = 0;
        for _ in 0..p_value {
            idx += name[idx..].iter().position(|&b| b == b'/')? + 1;
        }
        let tail = String::from_utf8(name[idx..].to_vec()).ok()?;
        Some(self.add_root(tail))
    }

    fn find_name_common(
        &self,
        line: &[u8],
        def: Option<&str>,
        p_value: usize,
        end: Option<usize>,
        terminate: u32,
    ) -> Option<String> {
        let stop = end.unwrap_or(line.len());
        let mut start: Option<usize> = (p_value == 0).then_some(0);
        let mut p = p_value as isize;
        let mut i = 0;
        while i < stop {
            let c = line[i];
            if end.is_none() && c.is_ascii_whitespace() {
                if c == b'\n' {
                    break;
                }
                if name_terminate(c, terminate) {
                    break;
                }
            }
            i += 1;
            if c == b'/' {
                p -= 1;
                if p == 0 {
                    start = Some(i);
                }
            }
        }
        let start = match start {
            Some(s) => s,
            None => return def.map(|d| squash_slash(d.to_string())),
        };
        let len = i - start;
        if len == 0 {
            return def.map(|d| squash_slash(d.to_string()));
        }
        let name = &line[start..i];

        // Prefer the shorter name when the found one is just a
        // variation with something tacked on ("file.orig", "file~").
        if let Some(def) = def {
            if def.len() < len && name.starts_with(def.as_bytes()) {
                return Some(squash_slash(def.to_string()));
            }
        }

        let name = String::from_utf8(name.to_vec()).ok()?;
        Some(self.add_root(name))
    }

    fn find_name_traditional(
        &self,
        line: &[u8],
        def: Option<&str>,
        p_value: usize,
    ) -> Option<String> {
        if line.first() == Some(&b'"') {
            if let Some(name) = self.find_name_gnu(line, p_value) {
                return Some(name);
            }
        }
        let len = line.iter().position(|&b| b == b'\n').unwrap_or(line.len());
        let date_len = diff_timestamp_len(&line[..len]);
        if date_len == 0 {
            return self.find_name_common(line, def, p_value, None, TERM_TAB);
        }
        self.find_name_common(line, def, p_value, Some(len - date_len), 0)
    }

    /// Extract the name from the `diff --git a/P b/P` line itself. Only
    /// reliable when both sides are the same name, which is exactly the
    /// mode-change / empty-creation / empty-deletion case it serves.
    fn git_header_name(&self, line: &[u8]) -> Option<String> {
        let line = line.strip_prefix(b"diff --git ")?;
        let line = line.strip_suffix(b"\n").unwrap_or(line);

        if line.first() == Some(&b'"') {
            let (first, consumed) = unquote_c_style(line)?;
            let first = skip_tree_prefix(self.p_value, &first)?.to_vec();

            let mut second = consumed;
            while second < line.len() && line[second].is_ascii_whitespace() {
                second += 1;
            }
            if second >= line.len() {
                return None;
            }
            if line[second] == b'"' {
                let (sp, _) = unquote_c_style(&line[second..])?;
                let cp = skip_tree_prefix(self.p_value, &sp)?;
                if cp != first.as_slice() {
                    return None;
                }
                return String::from_utf8(first).ok();
            }
            let cp = skip_tree_prefix(self.p_value, &line[second..])?;
            if cp != first.as_slice() {
                return None;
            }
            return String::from_utf8(first).ok();
        }

        let name = skip_tree_prefix(self.p_value, line)?;

        // An unquoted first name means a double quote, if any, starts
        // the second name.
        if let Some(dq) = name.iter().position(|&b| b == b'"') {
            let (sp, _) = unquote_c_style(&name[dq..])?;
            let np = skip_tree_prefix(self.p_value, &sp)?;
            if np.len() < dq
                && name.starts_with(np)
                && name[np.len()].is_ascii_whitespace()
            {
                return String::from_utf8(np.to_vec()).ok();
            }
            return None;
        }

        // Accept a name only if it shows up twice, exactly the same
        // form, separated by one SP or HT.
        for len in 0..name.len() {
            match name[len] {
                b'\t' | b' ' => {
                    if len + 1 >= name.len() {
                        return None;
                    }
                    let second = skip_tree_prefix(self.p_value, &name[len + 1..])?;
                    if second.len() == len && second == &name[..len] {
                        return String::from_utf8(second.to_vec()).ok();
                    }
                }
                _ => {}
            }
        }
        None
    }

    /// Parse the extended-header block after a `diff --git` line.
    /// Returns the total header size in bytes (at least the first
    /// line's length).
    fn parse_git_diff_header(
        &mut self,
        rest: &[u8],
        first_len: usize,
        patch: &mut Patch,
    ) -> Result<usize, ParseError> {
        // A git diff has explicit new/delete information; don't guess.
        patch.is_new = Some(false);
        patch.is_delete = Some(false);

        patch.def_name = self
            .git_header_name(&rest[..first_len])
            .map(|n| self.add_root(n));

        self.linenr += 1;
        let mut offset = first_len;
        while offset < rest.len() {
            let len = linelen(&rest[offset..]);
            if len == 0 || rest[offset + len - 1] != b'\n' {
                break;
            }
            let line = &rest[offset..offset + len];

            let consumed = self.git_header_line(line, patch)?;
            if !consumed {
                break;
            }
            self.check_header_line(patch)?;
            offset += len;
            self.linenr += 1;
        }

        if patch.old_name.is_none() && patch.new_name.is_none() {
            let Some(def) = patch.def_name.clone() else {
                return Err(self.err(
                    ParseErrorKind::MissingFilename,
                    format!(
                        "git diff header lacks filename information when removing {} leading pathname components (line {})",
                        self.p_value, self.linenr
                    ),
                ));
            };
            patch.old_name = Some(def.clone());
            patch.new_name = Some(def);
        }
        if (patch.new_name.is_none() && patch.is_delete != Some(true))
            || (patch.old_name.is_none() && patch.is_new != Some(true))
        {
            return Err(self.err(
                ParseErrorKind::MissingFilename,
                format!("git diff header lacks filename information (line {})", self.linenr),
            ));
        }
        patch.is_toplevel_relative = true;
        Ok(offset)
    }

    /// Handle one extended header line. Returns false when the line is
    /// not part of the header (hunk start or unrecognized).
    fn git_header_line(&mut self, line: &[u8], patch: &mut Patch) -> Result<bool, ParseError> {
        if line.starts_with(b"@@ -") {
            return Ok(false);
        }
        if let Some(rest) = line.strip_prefix(b"--- ") {
            self.gitdiff_verify_name(rest, patch, Side::Old)?;
        } else if let Some(rest) = line.strip_prefix(b"+++ ") {
            self.gitdiff_verify_name(rest, patch, Side::New)?;
        } else if let Some(rest) = line.strip_prefix(b"old mode ") {
            patch.old_mode = self.parse_mode_line(rest)?;
        } else if let Some(rest) = line.strip_prefix(b"new mode ") {
            patch.new_mode = self.parse_mode_line(rest)?;
        } else if let Some(rest) = line.strip_prefix(b"deleted file mode ") {
            patch.is_delete = Some(true);
            patch.old_name = patch.def_name.clone();
            patch.old_mode = self.parse_mode_line(rest)?;
        } else if let Some(rest) = line.strip_prefix(b"new file mode ") {
            patch.is_new = Some(true);
            patch.new_name = patch.def_name.clone();
            patch.new_mode = self.parse_mode_line(rest)?;
        } else if let Some(rest) = line.strip_prefix(b"copy from ") {
            patch.is_copy = true;
            patch.old_name = self.find_name_sub_p(rest);
        } else if let Some(rest) = line.strip_prefix(b"copy to ") {
            patch.is_copy = true;
            patch.new_name = self.find_name_sub_p(rest);
        } else if let Some(rest) = line
            .strip_prefix(b"rename old ")
            .or_else(|| line.strip_prefix(b"rename from "))
        {
            patch.is_rename = true;
            patch.old_name = self.find_name_sub_p(rest);
        } else if let Some(rest) = line
            .strip_prefix(b"rename new ")
            .or_else(|| line.strip_prefix(b"rename to "))
        {
            patch.is_rename = true;
            patch.new_name = self.find_name_sub_p(rest);
        } else if let Some(rest) = line.strip_prefix(b"similarity index ") {
            if let Some((val, _)) = parse_usize_prefix(rest) {
                if val <= 100 {
                    patch.score = val as u32;
                }
            }
        } else if let Some(rest) = line.strip_prefix(b"dissimilarity index ") {
            if let Some((val, _)) = parse_usize_prefix(rest) {
                if val <= 100 {
                    patch.score = val as u32;
                }
            }
        } else if let Some(rest) = line.strip_prefix(b"index ") {
            self.gitdiff_index(rest, patch)?;
        } else {
            // Normal for a diff that changes nothing: fall through to
            // the next diff.
            return Ok(false);
        }
        Ok(true)
    }

    // Paths in copy/rename headers never carry the a/ b/ prefix.
    fn find_name_sub_p(&self, rest: &[u8]) -> Option<String> {
        let p = if self.p_value > 0 { self.p_value - 1 } else { 0 };
        self.find_name(rest, None, p, 0)
    }

    fn parse_mode_line(&self, rest: &[u8]) -> Result<u32, ParseError> {
        let digits = rest
            .iter()
            .take_while(|&&b| (b'0'..=b'7').contains(&b))
            .count();
        let followed_by_space = rest.get(digits).map(|b| b.is_ascii_whitespace());
        if digits == 0 || followed_by_space != Some(true) {
            return Err(self.err(
                ParseErrorKind::BadHeader,
                format!(
                    "invalid mode on line {}: {}",
                    self.linenr,
                    String::from_utf8_lossy(rest.strip_suffix(b"\n").unwrap_or(rest))
                ),
            ));
        }
        let mut mode = 0u32;
        for &b in &rest[..digits] {
            mode = mode * 8 + u32::from(b - b'0');
        }
        Ok(mode)
    }

    fn gitdiff_verify_name(
        &self,
        rest: &[u8],
        patch: &mut Patch,
        side: Side,
    ) -> Result<(), ParseError> {
        let (slot_is_some, isnull) = match side {
            Side::Old => (patch.old_name.is_some(), patch.is_new == Some(true)),
            Side::New => (patch.new_name.is_some(), patch.is_delete == Some(true)),
        };

        if !slot_is_some && !isnull {
            let name = self.find_name(rest, None, self.p_value, TERM_TAB);
            match side {
                Side::Old => patch.old_name = name,
                Side::New => patch.new_name = name,
            }
            return Ok(());
        }

        if slot_is_some {
            let current = match side {
                Side::Old => patch.old_name.as_deref().unwrap_or(""),
                Side::New => patch.new_name.as_deref().unwrap_or(""),
            };
            if isnull {
                return Err(self.err(
                    ParseErrorKind::InconsistentHeader,
                    format!(
                        "bad git diff: expected /dev/null, got {} on line {}",
                        current, self.linenr
                    ),
                ));
            }
            let another = self.find_name(rest, None, self.p_value, TERM_TAB);
            if another.as_deref() != Some(current) {
                return Err(self.err(
                    ParseErrorKind::InconsistentHeader,
                    format!(
                        "bad git diff: inconsistent {} filename on line {}",
                        match side {
                            Side::Old => "old",
                            Side::New => "new",
                        },
                        self.linenr
                    ),
                ));
            }
        } else if !is_dev_null(rest) {
            return Err(self.err(
                ParseErrorKind::InconsistentHeader,
                format!("bad git diff: expected /dev/null on line {}", self.linenr),
            ));
        }
        Ok(())
    }

    /// "index H1..H2[ mode]" with possibly-abbreviated hex ids.
    fn gitdiff_index(&self, rest: &[u8], patch: &mut Patch) -> Result<(), ParseError> {
        let Some(dot) = rest.iter().position(|&b| b == b'.') else {
            return Ok(());
        };
        if rest.get(dot + 1) != Some(&b'.') || dot > self.hexsz {
            return Ok(());
        }
        let old_hex = &rest[..dot];
        if !old_hex.iter().all(u8::is_ascii_hexdigit) {
            return Ok(());
        }

        let after = &rest[dot + 2..];
        let eol = after.iter().position(|&b| b == b'\n').unwrap_or(after.len());
        let space = after[..eol].iter().position(|&b| b == b' ');
        let new_len = space.unwrap_or(eol);
        if new_len > self.hexsz {
            return Ok(());
        }
        let new_hex = &after[..new_len];
        if !new_hex.iter().all(u8::is_ascii_hexdigit) {
            return Ok(());
        }

        patch.old_oid_hex = String::from_utf8_lossy(old_hex).into_owned();
        patch.new_oid_hex = String::from_utf8_lossy(new_hex).into_owned();
        if let Some(space) = space {
            patch.old_mode = self.parse_mode_line(&after[space + 1..])?;
        }
        Ok(())
    }

    fn check_header_line(&mut self, patch: &mut Patch) -> Result<(), ParseError> {
        let extensions = usize::from(patch.is_delete == Some(true))
            + usize::from(patch.is_new == Some(true))
            + usize::from(patch.is_rename)
            + usize::from(patch.is_copy);
        if extensions > 1 {
            return Err(self.err(
                ParseErrorKind::InconsistentHeader,
                format!(
                    "inconsistent header lines {} and {}",
                    patch.extension_linenr, self.linenr
                ),
            ));
        }
        if extensions == 1 && patch.extension_linenr == 0 {
            patch.extension_linenr = self.linenr;
        }
        Ok(())
    }

    /// Parse consecutive hunks belonging to one patch. Returns bytes
    /// consumed; 0 means the patch has no text hunks (it may still be
    /// binary or metadata-only).
    fn parse_single_patch(
        &mut self,
        buf: &[u8],
        patch: &mut Patch,
        stats: &mut WsStats,
    ) -> Result<usize, ParseError> {
        let mut offset = 0;
        let mut oldlines = 0usize;
        let mut newlines = 0usize;
        let mut context = 0usize;

        while buf.len() > offset + 4 && buf[offset..].starts_with(b"@@ -") {
            let mut frag = Fragment {
                linenr: self.linenr,
                ..Fragment::default()
            };
            let len = self.parse_fragment(&buf[offset..], patch, &mut frag, stats)?;
            frag.body = buf[offset..offset + len].to_vec();
            oldlines += frag.oldlines;
            newlines += frag.newlines;
            context += frag.leading + frag.trailing;
            patch.fragments.push(frag);
            offset += len;
        }

        // Lines removed rule out creation; lines added rule out
        // deletion. A --unified=0 patch with a single hunk stays
        // undecided until the driver consults the filesystem.
        if patch.is_new.is_none() && (oldlines > 0 || patch.fragments.len() > 1) {
            patch.is_new = Some(false);
        }
        if patch.is_delete.is_none() && (newlines > 0 || patch.fragments.len() > 1) {
            patch.is_delete = Some(false);
        }

        if patch.is_creation() && oldlines > 0 {
            return Err(self.err(
                ParseErrorKind::BadHunkBody,
                format!("new file {} depends on old contents", patch.best_name()),
            ));
        }
        if patch.is_deletion() && newlines > 0 {
            return Err(self.err(
                ParseErrorKind::BadHunkBody,
                format!("deleted file {} still has contents", patch.old_best_name()),
            ));
        }
        if !patch.is_deletion() && newlines == 0 && context > 0 {
            log::warn!(
                "file {} becomes empty but is not deleted",
                patch.best_name()
            );
        }

        Ok(offset)
    }

    fn parse_fragment(
        &mut self,
        buf: &[u8],
        patch: &mut Patch,
        frag: &mut Fragment,
        stats: &mut WsStats,
    ) -> Result<usize, ParseError> {
        let hdr_len = linelen(buf);
        if parse_fragment_header(&buf[..hdr_len], frag).is_none() {
            return Err(self.err(
                ParseErrorKind::BadHunkHeader,
                format!("corrupt patch at line {}", self.linenr),
            ));
        }
        if patch.recount {
            recount_diff(&buf[hdr_len..], frag);
        }
        let mut oldlines = frag.oldlines;
        let mut newlines = frag.newlines;
        let mut leading = 0usize;
        let mut trailing = 0usize;
        let mut added = 0usize;
        let mut deleted = 0usize;

        self.linenr += 1;
        let mut offset = hdr_len;
        while offset < buf.len() {
            if oldlines == 0 && newlines == 0 {
                break;
            }
            let len = linelen(&buf[offset..]);
            if len == 0 || buf[offset + len - 1] != b'\n' {
                return Err(self.corrupt_patch());
            }
            let line = &buf[offset..offset + len];
            match line[0] {
                b'\n' | b' ' => {
                    // An empty line is an empty context line from a
                    // newer GNU diff.
                    if oldlines == 0 || newlines == 0 {
                        return Err(self.corrupt_patch());
                    }
                    oldlines -= 1;
                    newlines -= 1;
                    if added == 0 && deleted == 0 {
                        leading += 1;
                    }
                    trailing += 1;
                    check_old_for_crlf(patch, line);
                    if !self.apply_in_reverse && self.ws_error_action == WsErrorAction::Fix {
                        self.check_whitespace(line, patch.ws_rule, stats);
                    }
                }
                b'-' => {
                    if oldlines == 0 {
                        return Err(self.corrupt_patch());
                    }
                    if !self.apply_in_reverse {
                        check_old_for_crlf(patch, line);
                    }
                    if self.apply_in_reverse && self.ws_error_action != WsErrorAction::Nowarn {
                        self.check_whitespace(line, patch.ws_rule, stats);
                    }
                    deleted += 1;
                    oldlines -= 1;
                    trailing = 0;
                }
                b'+' => {
                    if newlines == 0 {
                        return Err(self.corrupt_patch());
                    }
                    if self.apply_in_reverse {
                        check_old_for_crlf(patch, line);
                    }
                    if !self.apply_in_reverse && self.ws_error_action != WsErrorAction::Nowarn {
                        self.check_whitespace(line, patch.ws_rule, stats);
                    }
                    added += 1;
                    newlines -= 1;
                    trailing = 0;
                }
                // "\ No newline at end of file"; any localisation is at
                // least 12 bytes long.
                b'\\' => {
                    if len < 12 || !line.starts_with(b"\\ ") {
                        return Err(self.corrupt_patch());
                    }
                }
                _ => return Err(self.corrupt_patch()),
            }
            offset += len;
            self.linenr += 1;
        }
        if oldlines != 0 || newlines != 0 {
            return Err(self.corrupt_patch());
        }
        if !patch.recount && added == 0 && deleted == 0 {
            return Err(self.corrupt_patch());
        }

        frag.leading = leading;
        frag.trailing = trailing;

        // A trailing "\ No newline" marker belongs to this hunk even
        // though the line counts were already exhausted.
        if buf.len() > offset + 12 && buf[offset..].starts_with(b"\\ ") {
            offset += linelen(&buf[offset..]);
        }

        patch.lines_added += added;
        patch.lines_deleted += deleted;
        Ok(offset)
    }

    fn corrupt_patch(&self) -> ParseError {
        self.err(
            ParseErrorKind::BadHunkBody,
            format!("corrupt patch at line {}", self.linenr),
        )
    }

    fn check_whitespace(&self, line: &[u8], rule: u32, stats: &mut WsStats) {
        let result = ws::ws_check(&line[1..], rule);
        stats.record(result, self.linenr, &line[1..]);
    }

    /// Parse one binary hunk: a `literal LEN` or `delta LEN` line, then
    /// length-byte + base85 lines, terminated by a blank line.
    fn parse_binary_hunk(&mut self, buf: &[u8]) -> Result<Option<(BinaryHunk, usize)>, ParseError> {
        let llen = linelen(buf);
        let line = &buf[..llen];
        let (method, size_part) = if let Some(rest) = line.strip_prefix(b"delta ") {
            (BinaryMethod::DeltaDeflated, rest)
        } else if let Some(rest) = line.strip_prefix(b"literal ") {
            (BinaryMethod::LiteralDeflated, rest)
        } else {
            return Ok(None);
        };
        let Some((origlen, _)) = parse_usize_prefix(size_part) else {
            return Ok(None);
        };

        self.linenr += 1;
        let mut offset = llen;
        let mut data = Vec::new();
        loop {
            if offset >= buf.len() {
                return Err(self.err(
                    ParseErrorKind::CorruptBinary,
                    format!("unterminated binary patch at line {}", self.linenr),
                ));
            }
            let llen = linelen(&buf[offset..]);
            let line = &buf[offset..offset + llen];
            self.linenr += 1;
            if llen == 1 {
                offset += 1;
                break;
            }
            // Minimum line is "A00000\n"; the length must be a
            // multiple of 5 plus the length byte and the newline.
            if llen < 7 || (llen - 2) % 5 != 0 {
                return Err(self.corrupt_binary(line));
            }
            let max_byte_length = (llen - 2) / 5 * 4;
            let byte_length = match line[0] {
                c @ b'A'..=b'Z' => (c - b'A') as usize + 1,
                c @ b'a'..=b'z' => (c - b'a') as usize + 27,
                _ => return Err(self.corrupt_binary(line)),
            };
            // Filler never exceeds 3 bytes.
            if max_byte_length < byte_length || byte_length + 4 <= max_byte_length {
                return Err(self.corrupt_binary(line));
            }
            let decoded = decode_base85(&line[1..llen - 1], byte_length).map_err(|e| {
                self.err(
                    ParseErrorKind::BadBase85,
                    format!("corrupt binary patch at line {}: {e}", self.linenr - 1),
                )
            })?;
            data.extend_from_slice(&decoded);
            offset += llen;
        }

        let inflated = inflate(&data, origlen).map_err(|e| {
            self.err(
                ParseErrorKind::BadDeflate,
                format!("corrupt binary patch at line {}: {e}", self.linenr - 1),
            )
        })?;
        Ok(Some((
            BinaryHunk {
                method,
                data: inflated,
            },
            offset,
        )))
    }

    fn corrupt_binary(&self, line: &[u8]) -> ParseError {
        self.err(
            ParseErrorKind::CorruptBinary,
            format!(
                "corrupt binary patch at line {}: {}",
                self.linenr - 1,
                String::from_utf8_lossy(line.strip_suffix(b"\n").unwrap_or(line))
            ),
        )
    }

    /// Parse the hunks after a `GIT binary patch` marker: a mandatory
    /// forward hunk, optionally followed by the reverse hunk.
    fn parse_binary(&mut self, buf: &[u8], patch: &mut Patch) -> Result<usize, ParseError> {
        let Some((forward, mut used)) = self.parse_binary_hunk(buf)? else {
            return Err(self.err(
                ParseErrorKind::CorruptBinary,
                format!("unrecognized binary patch at line {}", self.linenr),
            ));
        };
        patch.fragments.push(Fragment {
            binary: Some(forward),
            ..Fragment::default()
        });
        if let Some((reverse, used2)) = self.parse_binary_hunk(&buf[used..])? {
            patch.fragments.push(Fragment {
                binary: Some(reverse),
                ..Fragment::default()
            });
            used += used2;
        }
        patch.is_binary = true;
        Ok(used)
    }
}

#[derive(Clone, Copy)]
enum Side {
    Old,
    New,
}

fn check_old_for_crlf(patch: &mut Patch, line: &[u8]) {
    if line.len() >= 2 && line.ends_with(b"\r\n") {
        patch.ws_rule |= ws::WS_CR_AT_EOL;
        patch.crlf_in_old = true;
    }
}

/// Recompute a hunk's line counts from its body (`--recount`).
fn recount_diff(body: &[u8], frag: &mut Fragment) {
    if body.is_empty() {
        log::warn!("recount: ignore empty hunk");
        return;
    }
    let mut oldlines = 0usize;
    let mut newlines = 0usize;
    let mut offset = 0;
    while offset < body.len() {
        let len = linelen(&body[offset..]);
        let line = &body[offset..offset + len];
        offset += len;
        match line[0] {
            b' ' | b'\n' => {
                newlines += 1;
                oldlines += 1;
            }
            b'-' => oldlines += 1,
            b'+' => newlines += 1,
            b'\\' => continue,
            b'@' => {
                if len < 3 || !line.starts_with(b"@@ ") {
                    log::warn!(
                        "recount: unexpected line: {}",
                        String::from_utf8_lossy(line.strip_suffix(b"\n").unwrap_or(line))
                    );
                    return;
                }
                break;
            }
            b'd' => {
                if len < 5 || !line.starts_with(b"diff ") {
                    log::warn!(
                        "recount: unexpected line: {}",
                        String::from_utf8_lossy(line.strip_suffix(b"\n").unwrap_or(line))
                    );
                    return;
                }
                break;
            }
            _ => {
                log::warn!(
                    "recount: unexpected line: {}",
                    String::from_utf8_lossy(line.strip_suffix(b"\n").unwrap_or(line))
                );
                return;
            }
        }
    }
    frag.oldlines = oldlines;
    frag.newlines = newlines;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(input: &str) -> Result<Vec<Patch>, ParseError> {
        let config = ParseConfig::default();
        let attrs = WsAttributes::default();
        let mut stats = WsStats::default();
        parse_patch_stream(input.as_bytes(), &config, &attrs, &mut stats)
    }

    const SIMPLE: &str = "\
--- a/f
+++ b/f
@@ -1,3 +1,3 @@
 a
-b
+B
 c
";

    #[test]
    fn test_traditional_patch() {
        let patches = parse(SIMPLE).unwrap();
        assert_eq!(patches.len(), 1);
        let p = &patches[0];
        assert_eq!(p.old_name.as_deref(), Some("f"));
        assert_eq!(p.new_name.as_deref(), Some("f"));
        assert_eq!(p.fragments.len(), 1);
        let f = &p.fragments[0];
        assert_eq!((f.oldpos, f.oldlines, f.newpos, f.newlines), (1, 3, 1, 3));
        assert_eq!(f.leading, 1);
        assert_eq!(f.trailing, 1);
        assert_eq!(p.lines_added, 1);
        assert_eq!(p.lines_deleted, 1);
    }

    #[test]
    fn test_git_diff_with_index() {
        let input = "\
diff --git a/src/main.rs b/src/main.rs
index 0123456..89abcde 100644
--- a/src/main.rs
+++ b/src/main.rs
@@ -1,2 +1,2 @@
 fn main() {
-    old();
+    new();
";
        let patches = parse(input).unwrap();
        let p = &patches[0];
        assert_eq!(p.old_name.as_deref(), Some("src/main.rs"));
        assert_eq!(p.old_oid_hex, "0123456");
        assert_eq!(p.new_oid_hex, "89abcde");
        assert_eq!(p.old_mode, 0o100644);
        assert!(!p.is_creation());
    }

    #[test]
    fn test_pure_rename() {
        let input = "\
diff --git a/old b/new
similarity index 100%
rename from old
rename to new
";
        let patches = parse(input).unwrap();
        let p = &patches[0];
        assert!(p.is_rename);
        assert_eq!(p.score, 100);
        assert_eq!(p.old_name.as_deref(), Some("old"));
        assert_eq!(p.new_name.as_deref(), Some("new"));
        assert!(p.fragments.is_empty());
    }

    #[test]
    fn test_new_file() {
        let input = "\
diff --git a/created b/created
new file mode 100644
--- /dev/null
+++ b/created
@@ -0,0 +1,2 @@
+one
+two
";
        let patches = parse(input).unwrap();
        let p = &patches[0];
        assert!(p.is_creation());
        assert_eq!(p.new_mode, 0o100644);
        assert!(p.old_name.is_none());
        assert_eq!(p.fragments[0].oldpos, 0);
    }

    #[test]
    fn test_deleted_file() {
        let input = "\
diff --git a/gone b/gone
deleted file mode 100755
--- a/gone
+++ /dev/null
@@ -1,1 +0,0 @@
-bye
";
        let patches = parse(input).unwrap();
        let p = &patches[0];
        assert!(p.is_deletion());
        assert_eq!(p.old_mode, 0o100755);
        assert!(p.new_name.is_none());
    }

    #[test]
    fn test_mode_change_only() {
        let input = "\
diff --git a/script.sh b/script.sh
old mode 100644
new mode 100755
";
        let patches = parse(input).unwrap();
        let p = &patches[0];
        assert_eq!(p.old_mode, 0o100644);
        assert_eq!(p.new_mode, 0o100755);
        assert_eq!(p.old_name.as_deref(), Some("script.sh"));
        assert!(p.metadata_changes());
    }

    #[test]
    fn test_inconsistent_header_rejected() {
        let input = "\
diff --git a/x b/x
new file mode 100644
deleted file mode 100644
";
        let err = parse(input).unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::InconsistentHeader);
    }

    #[test]
    fn test_creation_with_old_lines_rejected() {
        let input = "\
diff --git a/x b/x
new file mode 100644
--- /dev/null
+++ b/x
@@ -1,1 +1,1 @@
-old
+new
";
        assert!(parse(input).is_err());
    }

    #[test]
    fn test_quoted_path() {
        let input = "\
diff --git \"a/sp ace\" \"b/sp ace\"
index 0000000..1111111 100644
--- \"a/sp ace\"
+++ \"b/sp ace\"
@@ -1,1 +1,1 @@
-x
+y
";
        let patches = parse(input).unwrap();
        assert_eq!(patches[0].old_name.as_deref(), Some("sp ace"));
    }

    #[test]
    fn test_stray_fragment_is_error() {
        let input = "@@ -1,2 +1,2 @@\n a\n-b\n+c\n";
        let err = parse(input).unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::BadHeader);
    }

    #[test]
    fn test_multiple_patches() {
        let two = format!("{SIMPLE}{}", SIMPLE.replace("a/f", "a/g").replace("b/f", "b/g"));
        let patches = parse(&two).unwrap();
        assert_eq!(patches.len(), 2);
        assert_eq!(patches[1].new_name.as_deref(), Some("g"));
    }

    #[test]
    fn test_reverse_patches() {
        let mut patches = parse(SIMPLE).unwrap();
        reverse_patches(&mut patches);
        let f = &patches[0].fragments[0];
        assert_eq!((f.oldpos, f.newpos), (1, 1));
        assert_eq!(patches[0].lines_added, 1);
    }

    #[test]
    fn test_p_value_stripping() {
        let input = "\
diff --git a/deep/dir/file b/deep/dir/file
--- a/deep/dir/file
+++ b/deep/dir/file
@@ -1,1 +1,1 @@
-x
+y
";
        let patches = parse(input).unwrap();
        assert_eq!(patches[0].new_name.as_deref(), Some("deep/dir/file"));
    }

    #[test]
    fn test_epoch_timestamp_means_creation() {
        let input = "\
--- f\t1970-01-01 00:00:00 +0000
+++ f\t2024-03-01 10:00:00 +0000
@@ -0,0 +1,1 @@
+hello
";
        let patches = parse(input).unwrap();
        assert!(patches[0].is_creation());
    }

    #[test]
    fn test_traditional_timestamp_stripped_from_name() {
        let input = "\
--- a/f.txt\t2010-07-05 19:41:17.620000023 -0500
+++ b/f.txt\t2010-07-05 19:41:17.620000023 -0500
@@ -1,1 +1,1 @@
-x
+y
";
        let patches = parse(input).unwrap();
        assert_eq!(patches[0].new_name.as_deref(), Some("f.txt"));
    }

    #[test]
    fn test_no_newline_marker() {
        let input = "\
--- a/f
+++ b/f
@@ -1,1 +1,1 @@
-x
+y
\\ No newline at end of file
";
        let patches = parse(input).unwrap();
        let frag = &patches[0].fragments[0];
        assert!(frag.body.ends_with(b"\\ No newline at end of file\n"));
    }

    #[test]
    fn test_crlf_context_sets_rule() {
        let input = "--- a/f\n+++ b/f\n@@ -1,2 +1,2 @@\n a\r\n-b\n+c\n";
        let patches = parse(input).unwrap();
        assert!(patches[0].crlf_in_old);
        assert_ne!(patches[0].ws_rule & ws::WS_CR_AT_EOL, 0);
    }

    #[test]
    fn test_corrupt_hunk_is_error() {
        let input = "--- a/f\n+++ b/f\n@@ -1,3 +1,3 @@\n a\n-b\n+B\n";
        let err = parse(input).unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::BadHunkBody);
    }

    #[test]
    fn test_garbage_only_patch_is_error() {
        let input = "diff --git a/f b/f\nindex 000..111 100644\n";
        assert!(parse(input).is_err());
    }
}
