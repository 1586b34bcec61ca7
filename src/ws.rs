//! Whitespace rule handling: per-path rule sets, violation detection,
//! and in-line correction used by the whitespace-fixing match level.

/// Trailing whitespace at the end of a line.
pub const WS_TRAILING_SPACE: u32 = 1 << 0;
/// A space immediately before a tab in the indent.
pub const WS_SPACE_BEFORE_TAB: u32 = 1 << 1;
/// Carriage return at end of line is tolerated (rule bit, not error).
pub const WS_CR_AT_EOL: u32 = 1 << 2;
/// Blank lines added at end of file.
pub const WS_BLANK_AT_EOF: u32 = 1 << 3;

pub const WS_DEFAULT_RULE: u32 = WS_TRAILING_SPACE | WS_SPACE_BEFORE_TAB | WS_BLANK_AT_EOF;

/// What to do when the patch adds whitespace errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WsErrorAction {
    Nowarn,
    #[default]
    Warn,
    Error,
    Fix,
}

/// Whether whitespace differences are ignored while matching context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WsIgnoreAction {
    #[default]
    None,
    Change,
}

impl WsErrorAction {
    /// Parse the `--whitespace=` option values.
    pub fn parse(s: &str) -> Option<WsErrorAction> {
        match s {
            "nowarn" => Some(WsErrorAction::Nowarn),
            "warn" => Some(WsErrorAction::Warn),
            "error" | "error-all" => Some(WsErrorAction::Error),
            "fix" | "strip" => Some(WsErrorAction::Fix),
            _ => None,
        }
    }
}

/// Parse a comma-separated rule string (`trailing-space,-blank-at-eof`).
/// Unknown names are ignored with a warning.
pub fn parse_ws_rule(s: &str) -> u32 {
    let mut rule = WS_DEFAULT_RULE;
    for raw in s.split(',') {
        let name = raw.trim();
        if name.is_empty() {
            continue;
        }
        let (negated, name) = match name.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, name),
        };
        let bit = match name {
            "trailing-space" => WS_TRAILING_SPACE,
            "space-before-tab" => WS_SPACE_BEFORE_TAB,
            "cr-at-eol" => WS_CR_AT_EOL,
            "blank-at-eof" => WS_BLANK_AT_EOF,
            _ => {
                log::warn!("unrecognized whitespace rule '{name}'");
                continue;
            }
        };
        if negated {
            rule &= !bit;
        } else {
            rule |= bit;
        }
    }
    rule
}

/// Is the line (sans prefix byte) nothing but whitespace?
pub fn ws_blank_line(line: &[u8]) -> bool {
    line.iter().all(|b| b.is_ascii_whitespace())
}

fn split_newline(line: &[u8]) -> (&[u8], bool) {
    match line.last() {
        Some(b'\n') => (&line[..line.len() - 1], true),
        _ => (line, false),
    }
}

/// Check one line against `rule`; returns the violation bits found.
pub fn ws_check(line: &[u8], rule: u32) -> u32 {
    let (body, _) = split_newline(line);
    let mut found = 0;

    if rule & WS_TRAILING_SPACE != 0 {
        let mut end = body.len();
        if rule & WS_CR_AT_EOL != 0 && end > 0 && body[end - 1] == b'\r' {
            end -= 1;
        }
        if end > 0 && matches!(body[end - 1], b' ' | b'\t' | b'\r') {
            found |= WS_TRAILING_SPACE;
        }
    }

    if rule & WS_SPACE_BEFORE_TAB != 0 {
        let mut seen_space = false;
        for &b in body {
            match b {
                b' ' => seen_space = true,
                b'\t' => {
                    if seen_space {
                        found |= WS_SPACE_BEFORE_TAB;
                        break;
                    }
                }
                _ => break,
            }
        }
    }

    found
}

/// Produce a whitespace-corrected copy of `line` per `rule`. The
/// trailing newline, if present, is preserved.
pub fn ws_fix(line: &[u8], rule: u32) -> Vec<u8> {
    let (body, had_nl) = split_newline(line);
    let mut body = body.to_vec();

    if rule & WS_TRAILING_SPACE != 0 {
        let keep_cr = rule & WS_CR_AT_EOL != 0 && body.last() == Some(&b'\r');
        if keep_cr {
            body.pop();
        }
        while matches!(body.last(), Some(b' ' | b'\t' | b'\r')) {
            body.pop();
        }
        if keep_cr {
            body.push(b'\r');
        }
    }

    if rule & WS_SPACE_BEFORE_TAB != 0 {
        let indent_len = body
            .iter()
            .take_while(|b| matches!(b, b' ' | b'\t'))
            .count();
        let mut indent = Vec::with_capacity(indent_len);
        for &b in &body[..indent_len] {
            if b == b'\t' {
                while indent.last() == Some(&b' ') {
                    indent.pop();
                }
            }
            indent.push(b);
        }
        if indent.len() != indent_len {
            indent.extend_from_slice(&body[indent_len..]);
            body = indent;
        }
    }

    if had_nl {
        body.push(b'\n');
    }
    body
}

/// Per-path whitespace rules, matched by glob pattern. The last
/// matching entry wins; paths with no match get the default rule.
pub struct WsAttributes {
    entries: Vec<(glob::Pattern, u32)>,
    pub default_rule: u32,
}

impl Default for WsAttributes {
    fn default() -> Self {
        WsAttributes {
            entries: Vec::new(),
            default_rule: WS_DEFAULT_RULE,
        }
    }
}

impl WsAttributes {
    pub fn add(&mut self, pattern: &str, rule: &str) -> bool {
        match glob::Pattern::new(pattern) {
            Ok(p) => {
                self.entries.push((p, parse_ws_rule(rule)));
                true
            }
            Err(e) => {
                log::warn!("bad whitespace attribute pattern '{pattern}': {e}");
                false
            }
        }
    }

    pub fn rule_for(&self, path: &str) -> u32 {
        self.entries
            .iter()
            .rev()
            .find(|(p, _)| p.matches(path))
            .map(|(_, rule)| *rule)
            .unwrap_or(self.default_rule)
    }
}

/// Running whitespace diagnostics for one apply. The first
/// `squelch_limit` violations are reported in full; the rest are
/// summarised at the end.
#[derive(Debug)]
pub struct WsStats {
    pub errors: usize,
    pub fixed: usize,
    pub squelch_limit: usize,
}

impl Default for WsStats {
    fn default() -> Self {
        WsStats {
            errors: 0,
            fixed: 0,
            squelch_limit: 5,
        }
    }
}

impl WsStats {
    /// Record a violation found on `line` (prefix already stripped).
    pub fn record(&mut self, found: u32, linenr: usize, line: &[u8]) {
        if found == 0 {
            return;
        }
        self.errors += 1;
        if self.squelch_limit == 0 || self.errors <= self.squelch_limit {
            let shown = line.strip_suffix(b"\n").unwrap_or(line);
            log::warn!(
                "line {linenr}: {}.\n{}",
                ws_error_string(found),
                String::from_utf8_lossy(shown)
            );
        }
    }

    /// Emit the end-of-run summary.
    pub fn summarize(&self) {
        if self.squelch_limit > 0 && self.errors > self.squelch_limit {
            log::warn!(
                "squelched {} whitespace errors",
                self.errors - self.squelch_limit
            );
        }
        if self.fixed > 0 {
            log::warn!("{} lines applied after fixing whitespace errors", self.fixed);
        } else if self.errors > 0 {
            log::warn!("{} lines add whitespace errors", self.errors);
        }
    }
}

/// Human-readable description of violation bits, for diagnostics.
pub fn ws_error_string(found: u32) -> String {
    let mut parts = Vec::new();
    if found & WS_TRAILING_SPACE != 0 {
        parts.push("trailing whitespace");
    }
    if found & WS_SPACE_BEFORE_TAB != 0 {
        parts.push("space before tab in indent");
    }
    if found & WS_BLANK_AT_EOF != 0 {
        parts.push("new blank line at EOF");
    }
    parts.join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rules() {
        let rule = parse_ws_rule("cr-at-eol,-blank-at-eof");
        assert_ne!(rule & WS_CR_AT_EOL, 0);
        assert_eq!(rule & WS_BLANK_AT_EOF, 0);
        assert_ne!(rule & WS_TRAILING_SPACE, 0);
    }

    #[test]
    fn test_check_trailing_space() {
        assert_eq!(
            ws_check(b"code  \n", WS_DEFAULT_RULE),
            WS_TRAILING_SPACE
        );
        assert_eq!(ws_check(b"code\n", WS_DEFAULT_RULE), 0);
    }

    #[test]
    fn test_check_cr_tolerance() {
        assert_eq!(ws_check(b"code\r\n", WS_DEFAULT_RULE), WS_TRAILING_SPACE);
        assert_eq!(ws_check(b"code\r\n", WS_DEFAULT_RULE | WS_CR_AT_EOL), 0);
    }

    #[test]
    fn test_check_space_before_tab() {
        assert_eq!(
            ws_check(b"  \tindent\n", WS_DEFAULT_RULE),
            WS_SPACE_BEFORE_TAB
        );
        assert_eq!(ws_check(b"\t  indent\n", WS_DEFAULT_RULE), 0);
    }

    #[test]
    fn test_fix_trailing() {
        assert_eq!(ws_fix(b"code \t\n", WS_DEFAULT_RULE), b"code\n");
        assert_eq!(ws_fix(b"code", WS_DEFAULT_RULE), b"code");
    }

    #[test]
    fn test_fix_keeps_allowed_cr() {
        assert_eq!(
            ws_fix(b"code  \r\n", WS_DEFAULT_RULE | WS_CR_AT_EOL),
            b"code\r\n"
        );
        assert_eq!(ws_fix(b"code  \r\n", WS_DEFAULT_RULE), b"code\n");
    }

    #[test]
    fn test_fix_space_before_tab() {
        assert_eq!(ws_fix(b"  \tx\n", WS_DEFAULT_RULE), b"\tx\n");
    }

    #[test]
    fn test_blank_line() {
        assert!(ws_blank_line(b" \t\r\n"));
        assert!(!ws_blank_line(b" x\n"));
    }
}
