//! Hunk matcher: locate where a fragment applies in an image and
//! splice its postimage in, with graded tolerance. A position is tried
//! exactly first, then with whitespace differences ignored, then with
//! whitespace errors corrected on both sides, depending on the options.

use crate::image::{hash_line, Image, LINE_COMMON, LINE_PATCHED};
use crate::parse::{linelen, Fragment};
use crate::ws::{
    ws_blank_line, ws_fix, WsErrorAction, WsIgnoreAction, WsStats, WS_BLANK_AT_EOF,
};

/// Matching knobs, a slice of the driver's options.
#[derive(Debug, Clone)]
pub struct MatchOptions {
    pub ws_error_action: WsErrorAction,
    pub ws_ignore_action: WsIgnoreAction,
    pub apply_in_reverse: bool,
    pub unidiff_zero: bool,
    pub allow_overlap: bool,
    /// Context lines both runs may be shrunk down to while hunting for
    /// a match (`-C`). `usize::MAX` disables shrinking.
    pub context_limit: usize,
}

impl Default for MatchOptions {
    fn default() -> Self {
        MatchOptions {
            ws_error_action: WsErrorAction::Warn,
            ws_ignore_action: WsIgnoreAction::None,
            apply_in_reverse: false,
            unidiff_zero: false,
            allow_overlap: false,
            context_limit: usize::MAX,
        }
    }
}

/// Yields `[center, center-1, center+1, center-2, center+2, ...]`
/// clamped to `0..=max`, so equidistant candidates resolve backward.
struct OutwardSearch {
    center: usize,
    max: usize,
    emitted_center: bool,
    back: usize,
    fwd: usize,
    try_back_next: bool,
}

impl OutwardSearch {
    fn new(center: usize, max: usize) -> OutwardSearch {
        let center = center.min(max);
        OutwardSearch {
            center,
            max,
            emitted_center: false,
            back: center,
            fwd: center,
            try_back_next: true,
        }
    }
}

impl Iterator for OutwardSearch {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if !self.emitted_center {
            self.emitted_center = true;
            return Some(self.center);
        }
        for _ in 0..2 {
            if self.try_back_next {
                self.try_back_next = false;
                if self.back > 0 {
                    self.back -= 1;
                    return Some(self.back);
                }
            } else {
                self.try_back_next = true;
                if self.fwd < self.max {
                    self.fwd += 1;
                    return Some(self.fwd);
                }
            }
        }
        // Both directions exhausted.
        None
    }
}

/// Compare two lines ignoring whitespace differences: line endings and
/// leading whitespace are ignored, and interior runs of whitespace
/// match runs of whitespace ("a  b" matches "a\tb" but not "ab").
fn fuzzy_matchlines(a: &[u8], b: &[u8]) -> bool {
    let mut end1 = a.len();
    while end1 > 0 && (a[end1 - 1] == b'\r' || a[end1 - 1] == b'\n') {
        end1 -= 1;
    }
    let mut end2 = b.len();
    while end2 > 0 && (b[end2 - 1] == b'\r' || b[end2 - 1] == b'\n') {
        end2 -= 1;
    }

    let mut i = 0;
    while i < end1 && a[i].is_ascii_whitespace() {
        i += 1;
    }
    let mut j = 0;
    while j < end2 && b[j].is_ascii_whitespace() {
        j += 1;
    }
    while i < end1 && j < end2 {
        if a[i].is_ascii_whitespace() {
            // Both sides must carry whitespace here; the amount may
            // differ.
            if !b[j].is_ascii_whitespace() {
                return false;
            }
            while i < end1 && a[i].is_ascii_whitespace() {
                i += 1;
            }
            while j < end2 && b[j].is_ascii_whitespace() {
                j += 1;
            }
        } else {
            if a[i] != b[j] {
                return false;
            }
            i += 1;
            j += 1;
        }
    }
    i == end1 && j == end2
}

/// Rebuild `preimage` from `fixed` bytes (the corrected or
/// target-matched form) and regenerate the common context lines of
/// `postimage` from it, so the final output carries the target's
/// bytes.
fn update_pre_post_images(preimage: &mut Image, postimage: &mut Image, fixed: Vec<u8>) {
    let mut fixed_preimage = Image::new(fixed, true);
    debug_assert!(fixed_preimage.line_count() <= preimage.line_count());
    for (i, line) in fixed_preimage.lines.iter_mut().enumerate() {
        line.flags = preimage.lines[i].flags;
    }
    *preimage = fixed_preimage;

    let mut new_bytes = Vec::with_capacity(postimage.len());
    let mut new_lines = Vec::with_capacity(postimage.line_count());
    let mut old_ofs = 0;
    let mut ctx = 0;
    let mut fixed_ofs = 0;
    for i in 0..postimage.line_count() {
        let l_len = postimage.lines[i].len;
        if postimage.lines[i].flags & LINE_COMMON == 0 {
            // An added line has no counterpart in the preimage.
            new_bytes.extend_from_slice(&postimage.bytes[old_ofs..old_ofs + l_len]);
            new_lines.push(postimage.lines[i]);
            old_ofs += l_len;
            continue;
        }

        // A common context line: take its bytes from the fixed
        // preimage instead.
        old_ofs += l_len;
        while ctx < preimage.line_count() && preimage.lines[ctx].flags & LINE_COMMON == 0 {
            fixed_ofs += preimage.lines[ctx].len;
            ctx += 1;
        }
        if ctx >= preimage.line_count() {
            // The preimage ran out: trailing blank lines were dropped.
            continue;
        }
        let l = preimage.lines[ctx].len;
        new_bytes.extend_from_slice(&preimage.bytes[fixed_ofs..fixed_ofs + l]);
        let mut line = postimage.lines[i];
        line.len = l;
        line.hash = preimage.lines[ctx].hash;
        new_lines.push(line);
        fixed_ofs += l;
        ctx += 1;
    }
    postimage.bytes = new_bytes;
    postimage.lines = new_lines;
}

fn line_by_line_fuzzy_match(
    img: &Image,
    preimage: &mut Image,
    postimage: &mut Image,
    current: usize,
    current_lno: usize,
    preimage_limit: usize,
) -> bool {
    let mut imgoff = 0usize;
    let mut preoff = 0usize;
    for i in 0..preimage_limit {
        let prelen = preimage.lines[i].len;
        let imglen = img.lines[current_lno + i].len;
        if !fuzzy_matchlines(
            &img.bytes[current + imgoff..current + imgoff + imglen],
            &preimage.bytes[preoff..preoff + prelen],
        ) {
            return false;
        }
        imgoff += imglen;
        preoff += prelen;
    }

    // Any preimage lines past EOF must be pure whitespace (we are
    // removing blank lines at the end of the file).
    let preimage_eof = preoff;
    for i in preimage_limit..preimage.line_count() {
        preoff += preimage.lines[i].len;
    }
    if preimage.bytes[preimage_eof..preoff]
        .iter()
        .any(|b| !b.is_ascii_whitespace())
    {
        return false;
    }

    // Adopt the target's whitespace for the matched span; keep the
    // preimage's own bytes for the part beyond EOF.
    let mut fixed = img.bytes[current..current + imgoff].to_vec();
    fixed.extend_from_slice(&preimage.bytes[preimage_eof..preoff]);
    update_pre_post_images(preimage, postimage, fixed);
    true
}

fn match_with_ws_fix(
    img: &Image,
    preimage: &mut Image,
    postimage: &mut Image,
    current: usize,
    current_lno: usize,
    preimage_limit: usize,
    ws_rule: u32,
) -> bool {
    // Fix whitespace on each preimage line and each target line; the
    // hunk matches if the corrected forms agree.
    let mut fixed: Vec<u8> = Vec::with_capacity(preimage.len() + 1);
    let mut orig_ofs = 0usize;
    let mut target_ofs = 0usize;
    for i in 0..preimage_limit {
        let oldlen = preimage.lines[i].len;
        let tgtlen = img.lines[current_lno + i].len;
        let fixstart = fixed.len();

        fixed.extend_from_slice(&ws_fix(
            &preimage.bytes[orig_ofs..orig_ofs + oldlen],
            ws_rule,
        ));
        let tgtfix = ws_fix(
            &img.bytes[current + target_ofs..current + target_ofs + tgtlen],
            ws_rule,
        );
        if tgtfix != fixed[fixstart..] {
            return false;
        }
        orig_ofs += oldlen;
        target_ofs += tgtlen;
    }

    // Preimage lines beyond EOF must correct down to whitespace only.
    for i in preimage_limit..preimage.line_count() {
        let oldlen = preimage.lines[i].len;
        let fixstart = fixed.len();
        fixed.extend_from_slice(&ws_fix(
            &preimage.bytes[orig_ofs..orig_ofs + oldlen],
            ws_rule,
        ));
        if fixed[fixstart..].iter().any(|b| !b.is_ascii_whitespace()) {
            return false;
        }
        orig_ofs += oldlen;
    }

    update_pre_post_images(preimage, postimage, fixed);
    true
}

/// Try the fragment at one position. Mutates the sub-images only when
/// a fuzzy or whitespace-corrected match succeeds.
#[allow(clippy::too_many_arguments)]
fn match_fragment(
    img: &Image,
    preimage: &mut Image,
    postimage: &mut Image,
    current: usize,
    current_lno: usize,
    ws_rule: u32,
    opts: &MatchOptions,
    match_beginning: bool,
    match_end: bool,
) -> bool {
    let preimage_limit;
    if preimage.line_count() + current_lno <= img.line_count() {
        // The hunk falls within the boundaries of img.
        preimage_limit = preimage.line_count();
        if match_end && preimage.line_count() + current_lno != img.line_count() {
            return false;
        }
    } else if opts.ws_error_action == WsErrorAction::Fix && ws_rule & WS_BLANK_AT_EOF != 0 {
        // The hunk extends past EOF and we are removing blank lines at
        // the end: only the in-bounds part has to match, the rest must
        // be blank.
        preimage_limit = img.line_count() - current_lno;
    } else {
        return false;
    }

    if match_beginning && current_lno != 0 {
        return false;
    }

    // Quick hash check before touching any bytes.
    for i in 0..preimage_limit {
        if img.lines[current_lno + i].flags & LINE_PATCHED != 0
            || preimage.lines[i].hash != img.lines[current_lno + i].hash
        {
            return false;
        }
    }

    if preimage_limit == preimage.line_count() {
        // Byte-exact attempt. With match_end the hunk must close the
        // file exactly.
        let fits = if match_end {
            current + preimage.len() == img.len()
        } else {
            current + preimage.len() <= img.len()
        };
        if fits && img.bytes[current..current + preimage.len()] == preimage.bytes {
            return true;
        }
    } else {
        // The preimage extends beyond EOF, so no exact match is
        // possible; at least one in-bounds context line must be
        // non-blank for the position to be meaningful.
        let in_bounds: usize = preimage.lines[..preimage_limit].iter().map(|l| l.len).sum();
        if preimage.bytes[..in_bounds]
            .iter()
            .all(|b| b.is_ascii_whitespace())
        {
            return false;
        }
    }

    if opts.ws_ignore_action == WsIgnoreAction::Change {
        return line_by_line_fuzzy_match(
            img,
            preimage,
            postimage,
            current,
            current_lno,
            preimage_limit,
        );
    }

    if opts.ws_error_action != WsErrorAction::Fix {
        return false;
    }
    match_with_ws_fix(
        img,
        preimage,
        postimage,
        current,
        current_lno,
        preimage_limit,
        ws_rule,
    )
}

/// Search outward from `line` for a position where the fragment
/// matches. Returns the matching line number.
#[allow(clippy::too_many_arguments)]
fn find_pos(
    img: &Image,
    preimage: &mut Image,
    postimage: &mut Image,
    line: isize,
    ws_rule: u32,
    opts: &MatchOptions,
    mut match_beginning: bool,
    match_end: bool,
) -> Option<usize> {
    // With --allow-overlap a hunk may pretend to start at the
    // beginning yet still need to match the end; trust match_end more.
    if opts.allow_overlap
        && match_beginning
        && match_end
        && img.line_count() != preimage.line_count()
    {
        match_beginning = false;
    }

    // When an anchor is forced there is no point wandering.
    let line = if match_beginning {
        0
    } else if match_end {
        img.line_count() as isize - preimage.line_count() as isize
    } else {
        line
    };
    let start = if line < 0 || line as usize > img.line_count() {
        img.line_count()
    } else {
        line as usize
    };

    let mut offsets = Vec::with_capacity(img.line_count() + 1);
    let mut acc = 0usize;
    offsets.push(0);
    for l in &img.lines {
        acc += l.len;
        offsets.push(acc);
    }

    for lno in OutwardSearch::new(start, img.line_count()) {
        if match_fragment(
            img,
            preimage,
            postimage,
            offsets[lno],
            lno,
            ws_rule,
            opts,
            match_beginning,
            match_end,
        ) {
            return Some(lno);
        }
    }
    None
}

/// Outcome of applying one fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentOutcome {
    Applied {
        /// Line the hunk landed on (0-based).
        pos: usize,
        /// Signed distance from the hinted position, in lines.
        offset: isize,
    },
    Rejected,
}

/// Build the pre/postimage for `frag` and apply it to `img`.
///
/// The `+` lines are whitespace-corrected up front when the action is
/// `fix` and the patch is not being reversed; context lines are later
/// regenerated from the target if a tolerant match level fires.
#[allow(clippy::too_many_arguments)]
pub fn apply_one_fragment(
    img: &mut Image,
    frag: &Fragment,
    inaccurate_eof: bool,
    ws_rule: u32,
    nth_fragment: usize,
    opts: &MatchOptions,
    stats: &mut WsStats,
) -> FragmentOutcome {
    let mut preimage = Image::default();
    let mut postimage = Image::default();
    let mut new_blank_lines_at_end = 0usize;
    let mut found_new_blank_lines_at_end = 0usize;
    let mut hunk_linenr = frag.linenr;

    let mut body = frag.body.as_slice();
    while !body.is_empty() {
        let len = linelen(body);
        let line = &body[..len];
        body = &body[len..];

        // How much of the line is patch data: strip the prefix byte,
        // and the newline too when "\ No newline" follows.
        let mut plen = len as isize - 1;
        if body.first() == Some(&b'\\') {
            plen -= 1;
        }
        let mut first = line[0];
        if opts.apply_in_reverse {
            if first == b'-' {
                first = b'+';
            } else if first == b'+' {
                first = b'-';
            }
        }

        let mut added_blank_line = false;
        let mut is_blank_context = false;
        match first {
            b'\n' => {
                // Newer GNU diff, an empty context line.
                if plen >= 0 {
                    preimage.add_line(b"\n", LINE_COMMON);
                    postimage.add_line(b"\n", LINE_COMMON);
                    is_blank_context = true;
                }
            }
            b' ' | b'-' => {
                let content = &line[1..1 + plen.max(0) as usize];
                if first == b' ' {
                    if ws_rule & WS_BLANK_AT_EOF != 0 && ws_blank_line(content) {
                        is_blank_context = true;
                    }
                    preimage.add_line(content, LINE_COMMON);
                    postimage.add_line(content, LINE_COMMON);
                } else {
                    preimage.add_line(content, 0);
                }
            }
            b'+' => {
                let content = &line[1..1 + plen.max(0) as usize];
                if stats.errors > 0 && opts.ws_error_action == WsErrorAction::Fix {
                    let fixed = ws_fix(content, ws_rule);
                    if fixed != content {
                        stats.fixed += 1;
                    }
                    postimage.add_line(&fixed, 0);
                } else {
                    postimage.add_line(content, 0);
                }
                if ws_rule & WS_BLANK_AT_EOF != 0 && ws_blank_line(content) {
                    added_blank_line = true;
                }
            }
            b'@' | b'\\' => {
                // Header and no-newline marker, already accounted for.
            }
            _ => {
                log::error!("invalid start of line: '{}'", first as char);
                return FragmentOutcome::Rejected;
            }
        }
        if added_blank_line {
            if new_blank_lines_at_end == 0 {
                found_new_blank_lines_at_end = hunk_linenr;
            }
            new_blank_lines_at_end += 1;
        } else if !is_blank_context {
            new_blank_lines_at_end = 0;
        }
        hunk_linenr += 1;
    }

    if inaccurate_eof
        && preimage.bytes.last() == Some(&b'\n')
        && postimage.bytes.last() == Some(&b'\n')
    {
        preimage.strip_final_newline();
        postimage.strip_final_newline();
    }

    let mut leading = frag.leading;
    let mut trailing = frag.trailing;

    // A hunk for the first lines has oldpos <= 1, with or without
    // context, and must match the beginning; a hunk with no trailing
    // context must match the end. Neither holds under unidiff-zero,
    // where hunks legitimately carry no context at all.
    let mut match_beginning =
        frag.oldpos == 0 || (frag.oldpos == 1 && !opts.unidiff_zero);
    let mut match_end = !opts.unidiff_zero && trailing == 0;

    let mut pos = frag.newpos as isize - 1;
    let applied_pos: Option<usize>;
    loop {
        if let Some(found) = find_pos(
            img,
            &mut preimage,
            &mut postimage,
            pos.max(0),
            ws_rule,
            opts,
            match_beginning,
            match_end,
        ) {
            applied_pos = Some(found);
            break;
        }

        // An anchored attempt that failed is retried unanchored before
        // giving up; a hunk hinted at the beginning may still apply at
        // an offset.
        if match_beginning || match_end {
            match_beginning = false;
            match_end = false;
            continue;
        }
        // At the context limit already?
        if leading <= opts.context_limit && trailing <= opts.context_limit {
            applied_pos = None;
            break;
        }

        // Shrink the surviving context: both sides when equal,
        // otherwise just the larger one.
        if leading >= trailing {
            preimage.remove_first_line();
            postimage.remove_first_line();
            pos -= 1;
            leading -= 1;
        }
        if trailing > leading {
            preimage.remove_last_line();
            postimage.remove_last_line();
            trailing -= 1;
        }
    }

    let Some(applied_pos) = applied_pos else {
        log::warn!(
            "while searching for:\n{}",
            String::from_utf8_lossy(&preimage.bytes)
        );
        return FragmentOutcome::Rejected;
    };

    if new_blank_lines_at_end > 0
        && preimage.line_count() + applied_pos >= img.line_count()
        && ws_rule & WS_BLANK_AT_EOF != 0
        && opts.ws_error_action != WsErrorAction::Nowarn
    {
        stats.record(WS_BLANK_AT_EOF, found_new_blank_lines_at_end, b"+");
        if opts.ws_error_action == WsErrorAction::Fix {
            for _ in 0..new_blank_lines_at_end {
                postimage.remove_last_line();
            }
        }
    }

    let offset = applied_pos as isize - pos.max(0);
    if offset != 0 {
        let shown = if opts.apply_in_reverse { -offset } else { offset };
        log::info!(
            "Hunk #{} succeeded at {} (offset {} lines).",
            nth_fragment,
            applied_pos + 1,
            shown
        );
    }
    if leading != frag.leading || trailing != frag.trailing {
        log::warn!(
            "Context reduced to ({leading}/{trailing}) to apply fragment at {}",
            applied_pos + 1
        );
    }

    img.update(applied_pos, &preimage, &postimage, opts.allow_overlap);
    FragmentOutcome::Applied {
        pos: applied_pos,
        offset,
    }
}

impl Image {
    /// Drop an unreliably reported final newline from the last line.
    fn strip_final_newline(&mut self) {
        if self.bytes.last() == Some(&b'\n') {
            self.bytes.pop();
            if let Some(line) = self.lines.last_mut() {
                line.len -= 1;
                line.hash = hash_line(&self.bytes[self.bytes.len() - line.len..]);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::{parse_patch_stream, ParseConfig};
    use crate::ws::{WsAttributes, WS_DEFAULT_RULE};

    fn first_fragment(patch_text: &str) -> Fragment {
        let config = ParseConfig::default();
        let attrs = WsAttributes::default();
        let mut stats = WsStats::default();
        let patches =
            parse_patch_stream(patch_text.as_bytes(), &config, &attrs, &mut stats).unwrap();
        patches.into_iter().next().unwrap().fragments.remove(0)
    }

    const ONE_HUNK: &str = "\
--- a/f
+++ b/f
@@ -1,3 +1,3 @@
 a
-b
+B
 c
";

    #[test]
    fn test_exact_apply() {
        let frag = first_fragment(ONE_HUNK);
        let mut img = Image::new(b"a\nb\nc\n".to_vec(), true);
        let outcome = apply_one_fragment(
            &mut img,
            &frag,
            false,
            WS_DEFAULT_RULE,
            1,
            &MatchOptions::default(),
            &mut WsStats::default(),
        );
        assert_eq!(outcome, FragmentOutcome::Applied { pos: 0, offset: 0 });
        assert_eq!(img.bytes, b"a\nB\nc\n");
    }

    #[test]
    fn test_apply_with_offset() {
        let frag = first_fragment(ONE_HUNK);
        let mut img = Image::new(b"x\ny\na\nb\nc\nz\n".to_vec(), true);
        let outcome = apply_one_fragment(
            &mut img,
            &frag,
            false,
            WS_DEFAULT_RULE,
            1,
            &MatchOptions::default(),
            &mut WsStats::default(),
        );
        assert_eq!(outcome, FragmentOutcome::Applied { pos: 2, offset: 2 });
        assert_eq!(img.bytes, b"x\ny\na\nB\nc\nz\n");
    }

    #[test]
    fn test_mismatch_rejects() {
        let frag = first_fragment(ONE_HUNK);
        let mut img = Image::new(b"entirely\ndifferent\n".to_vec(), true);
        let outcome = apply_one_fragment(
            &mut img,
            &frag,
            false,
            WS_DEFAULT_RULE,
            1,
            &MatchOptions::default(),
            &mut WsStats::default(),
        );
        assert_eq!(outcome, FragmentOutcome::Rejected);
        assert_eq!(img.bytes, b"entirely\ndifferent\n");
    }

    #[test]
    fn test_ignore_whitespace_match() {
        let patch = "\
--- a/f
+++ b/f
@@ -1,1 +1,1 @@
- foo   bar
+FOO bar
";
        let frag = first_fragment(patch);
        let mut img = Image::new(b"foo\tbar\n".to_vec(), true);
        let opts = MatchOptions {
            ws_ignore_action: WsIgnoreAction::Change,
            ..MatchOptions::default()
        };
        let outcome = apply_one_fragment(
            &mut img,
            &frag,
            false,
            WS_DEFAULT_RULE,
            1,
            &opts,
            &mut WsStats::default(),
        );
        assert!(matches!(outcome, FragmentOutcome::Applied { .. }));
        assert_eq!(img.bytes, b"FOO bar\n");
    }

    #[test]
    fn test_ignore_whitespace_preserves_target_context() {
        // The context line keeps the target's tab, not the patch's
        // spaces.
        let patch = "\
--- a/f
+++ b/f
@@ -1,2 +1,2 @@
 keep  me
-drop
+add
";
        let frag = first_fragment(patch);
        let mut img = Image::new(b"keep\tme\ndrop\n".to_vec(), true);
        let opts = MatchOptions {
            ws_ignore_action: WsIgnoreAction::Change,
            ..MatchOptions::default()
        };
        let outcome = apply_one_fragment(
            &mut img,
            &frag,
            false,
            WS_DEFAULT_RULE,
            1,
            &opts,
            &mut WsStats::default(),
        );
        assert!(matches!(outcome, FragmentOutcome::Applied { .. }));
        assert_eq!(img.bytes, b"keep\tme\nadd\n");
    }

    #[test]
    fn test_patched_lines_not_rematched() {
        let frag = first_fragment(ONE_HUNK);
        let mut img = Image::new(b"a\nb\nc\n".to_vec(), true);
        let opts = MatchOptions::default();
        let mut stats = WsStats::default();
        assert!(matches!(
            apply_one_fragment(&mut img, &frag, false, WS_DEFAULT_RULE, 1, &opts, &mut stats),
            FragmentOutcome::Applied { .. }
        ));
        // Applying the same hunk again must fail: the lines are
        // flagged as already patched (and 'b' is gone anyway).
        assert_eq!(
            apply_one_fragment(&mut img, &frag, false, WS_DEFAULT_RULE, 1, &opts, &mut stats),
            FragmentOutcome::Rejected
        );
    }

    #[test]
    fn test_reverse_application() {
        let frag = first_fragment(ONE_HUNK);
        let mut img = Image::new(b"a\nB\nc\n".to_vec(), true);
        let opts = MatchOptions {
            apply_in_reverse: true,
            ..MatchOptions::default()
        };
        // Note: the driver swaps oldpos/newpos before this point; for
        // this symmetric hunk the positions coincide.
        let outcome = apply_one_fragment(
            &mut img,
            &frag,
            false,
            WS_DEFAULT_RULE,
            1,
            &opts,
            &mut WsStats::default(),
        );
        assert!(matches!(outcome, FragmentOutcome::Applied { .. }));
        assert_eq!(img.bytes, b"a\nb\nc\n");
    }

    #[test]
    fn test_creation_hunk_on_empty_image() {
        let patch = "\
--- /dev/null
+++ b/f
@@ -0,0 +1,2 @@
+one
+two
";
        let frag = first_fragment(patch);
        let mut img = Image::new(Vec::new(), true);
        let outcome = apply_one_fragment(
            &mut img,
            &frag,
            false,
            WS_DEFAULT_RULE,
            1,
            &MatchOptions::default(),
            &mut WsStats::default(),
        );
        assert!(matches!(outcome, FragmentOutcome::Applied { pos: 0, .. }));
        assert_eq!(img.bytes, b"one\ntwo\n");
    }

    #[test]
    fn test_match_end_constraint() {
        // No trailing context: must match at EOF, so a mid-file
        // candidate with the same bytes is not taken.
        let patch = "\
--- a/f
+++ b/f
@@ -2,2 +2,3 @@
 mid
-end
+end
+more
";
        let frag = first_fragment(patch);
        let mut img = Image::new(b"mid\nend\nmid\nend\n".to_vec(), true);
        let outcome = apply_one_fragment(
            &mut img,
            &frag,
            false,
            WS_DEFAULT_RULE,
            1,
            &MatchOptions::default(),
            &mut WsStats::default(),
        );
        assert!(matches!(outcome, FragmentOutcome::Applied { pos: 2, .. }));
        assert_eq!(img.bytes, b"mid\nend\nmid\nend\nmore\n");
    }

    #[test]
    fn test_outward_search_prefers_backward() {
        let seen: Vec<usize> = OutwardSearch::new(3, 6).collect();
        assert_eq!(seen, vec![3, 2, 4, 1, 5, 0, 6]);
    }

    #[test]
    fn test_outward_search_clamps() {
        let seen: Vec<usize> = OutwardSearch::new(0, 2).collect();
        assert_eq!(seen, vec![0, 1, 2]);
    }
}
