//! Growable byte buffer with text-processing helpers.
//!
//! The buffer always keeps a NUL sentinel one past the logical end, so
//! the contents are usable as a C string without copying.

use std::fmt;
use std::io::{self, BufRead, Read};

/// Result of [`Strbuf::getline`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Getline {
    Ok,
    Eof,
}

/// Growable byte buffer. Internally stores `content + NUL`; the NUL is
/// not part of the logical length.
pub struct Strbuf {
    vec: Vec<u8>,
}

impl Default for Strbuf {
    fn default() -> Self {
        Strbuf::new()
    }
}

impl Strbuf {
    pub fn new() -> Strbuf {
        Strbuf { vec: vec![0] }
    }

    pub fn with_capacity(hint: usize) -> Strbuf {
        let mut vec = Vec::with_capacity(hint + 1);
        vec.push(0);
        Strbuf { vec }
    }

    pub fn from_bytes(data: &[u8]) -> Strbuf {
        let mut sb = Strbuf::with_capacity(data.len());
        sb.append(data);
        sb
    }

    pub fn len(&self) -> usize {
        self.vec.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.vec[..self.len()]
    }

    /// Contents including the guaranteed trailing NUL.
    pub fn as_bytes_with_nul(&self) -> &[u8] {
        &self.vec
    }

    pub fn clear(&mut self) {
        self.vec.clear();
        self.vec.push(0);
    }

    /// Truncate to `len` (must not exceed the current length).
    pub fn truncate(&mut self, len: usize) {
        assert!(len <= self.len());
        self.vec.truncate(len);
        self.vec.push(0);
    }

    pub fn push(&mut self, byte: u8) {
        self.vec.pop();
        self.vec.push(byte);
        self.vec.push(0);
    }

    pub fn append(&mut self, data: &[u8]) {
        self.vec.pop();
        self.vec.extend_from_slice(data);
        self.vec.push(0);
    }

    pub fn append_str(&mut self, s: &str) {
        self.append(s.as_bytes());
    }

    /// Formatted append; use with `format_args!`.
    pub fn append_fmt(&mut self, args: fmt::Arguments<'_>) {
        use fmt::Write;
        // Writing into a byte buffer cannot fail.
        let _ = self.write_fmt(args);
    }

    /// Replace `len` bytes starting at `pos` with `replacement`.
    pub fn splice(&mut self, pos: usize, len: usize, replacement: &[u8]) {
        assert!(pos + len <= self.len(), "splice range out of bounds");
        self.vec.splice(pos..pos + len, replacement.iter().copied());
    }

    pub fn insert(&mut self, pos: usize, data: &[u8]) {
        self.splice(pos, 0, data);
    }

    pub fn remove(&mut self, pos: usize, len: usize) {
        self.splice(pos, len, b"");
    }

    pub fn rtrim(&mut self) {
        let mut len = self.len();
        while len > 0 && self.vec[len - 1].is_ascii_whitespace() {
            len -= 1;
        }
        self.truncate(len);
    }

    pub fn ltrim(&mut self) {
        let skip = self
            .as_bytes()
            .iter()
            .take_while(|b| b.is_ascii_whitespace())
            .count();
        self.remove(0, skip);
    }

    pub fn trim(&mut self) {
        self.rtrim();
        self.ltrim();
    }

    /// Read one terminator-delimited record from `reader` into the
    /// buffer (replacing its contents). The terminator is stripped; a
    /// `\r` preceding a `\n` terminator is stripped too.
    pub fn getline(&mut self, reader: &mut impl BufRead, term: u8) -> io::Result<Getline> {
        self.clear();
        self.vec.pop();
        let n = reader.read_until(term, &mut self.vec)?;
        if n == 0 {
            self.vec.push(0);
            return Ok(Getline::Eof);
        }
        if self.vec.last() == Some(&term) {
            self.vec.pop();
            if term == b'\n' && self.vec.last() == Some(&b'\r') {
                self.vec.pop();
            }
        }
        self.vec.push(0);
        Ok(Getline::Ok)
    }

    /// Append everything `reader` has to offer; returns bytes read.
    pub fn read_from(&mut self, reader: &mut impl Read) -> io::Result<usize> {
        self.vec.pop();
        let n = reader.read_to_end(&mut self.vec)?;
        self.vec.push(0);
        Ok(n)
    }

    /// Convert CRLF line endings to LF in place.
    pub fn normalize_crlf(&mut self) {
        let mut out = Vec::with_capacity(self.vec.len());
        let bytes = self.as_bytes();
        let mut i = 0;
        while i < bytes.len() {
            if bytes[i] == b'\r' && bytes.get(i + 1) == Some(&b'\n') {
                i += 1;
                continue;
            }
            out.push(bytes[i]);
            i += 1;
        }
        out.push(0);
        self.vec = out;
    }

    /// Re-encode the contents from charset `from` to charset `to`.
    /// Returns false when either label is unknown or the text cannot be
    /// represented in the target encoding.
    pub fn reencode(&mut self, from: &str, to: &str) -> bool {
        if from.eq_ignore_ascii_case(to) {
            return true;
        }
        let (Some(src), Some(dst)) = (
            encoding_rs::Encoding::for_label(from.as_bytes()),
            encoding_rs::Encoding::for_label(to.as_bytes()),
        ) else {
            return false;
        };
        let (decoded, _, had_errors) = src.decode(self.as_bytes());
        if had_errors {
            return false;
        }
        let (encoded, _, had_errors) = dst.encode(&decoded);
        if had_errors {
            return false;
        }
        let mut vec = encoded.into_owned();
        vec.push(0);
        self.vec = vec;
        true
    }

    /// Remove trailing whitespace from every line, coalesce runs of
    /// blank lines to a single blank line between paragraphs, drop
    /// leading and trailing blank lines, and complete the final line
    /// with a newline. With `skip_comments`, lines starting with the
    /// comment leader are dropped as well.
    pub fn stripspace(&mut self, skip_comments: Option<u8>) {
        let bytes = self.as_bytes();
        let mut out: Vec<u8> = Vec::with_capacity(bytes.len());
        let mut empties = 0usize;
        let mut i = 0;
        while i < bytes.len() {
            let eol = bytes[i..]
                .iter()
                .position(|&b| b == b'\n')
                .map(|p| i + p + 1)
                .unwrap_or(bytes.len());
            let line = &bytes[i..eol];
            i = eol;

            if let Some(comment) = skip_comments {
                if line.first() == Some(&comment) {
                    continue;
                }
            }
            let mut content = line.len();
            while content > 0 && line[content - 1].is_ascii_whitespace() {
                content -= 1;
            }
            if content > 0 {
                if empties > 0 && !out.is_empty() {
                    out.push(b'\n');
                }
                empties = 0;
                out.extend_from_slice(&line[..content]);
                out.push(b'\n');
            } else {
                empties += 1;
            }
        }
        out.push(0);
        self.vec = out;
    }
}

impl fmt::Write for Strbuf {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.append(s.as_bytes());
        Ok(())
    }
}

impl fmt::Debug for Strbuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Strbuf({:?})", String::from_utf8_lossy(self.as_bytes()))
    }
}

/// Does this path need C-style quoting in a diff header?
pub fn needs_c_quoting(path: &[u8]) -> bool {
    path.iter()
        .any(|&b| b < 0x20 || b >= 0x7f || b == b'"' || b == b'\\')
}

/// Append `path` to `out` C-quoted (surrounding double quotes included)
/// when needed, verbatim otherwise.
pub fn quote_c_style(path: &[u8], out: &mut Strbuf) {
    if !needs_c_quoting(path) {
        out.append(path);
        return;
    }
    out.push(b'"');
    for &b in path {
        match b {
            b'"' => out.append(b"\\\""),
            b'\\' => out.append(b"\\\\"),
            0x07 => out.append(b"\\a"),
            0x08 => out.append(b"\\b"),
            0x0c => out.append(b"\\f"),
            b'\n' => out.append(b"\\n"),
            b'\r' => out.append(b"\\r"),
            b'\t' => out.append(b"\\t"),
            0x0b => out.append(b"\\v"),
            _ if b < 0x20 || b >= 0x7f => {
                out.append_fmt(format_args!("\\{:03o}", b));
            }
            _ => out.push(b),
        }
    }
    out.push(b'"');
}

/// Parse a C-quoted string starting at `src[0] == '"'`. Returns the
/// decoded bytes and the index one past the closing quote, or None on
/// unterminated or malformed quoting.
pub fn unquote_c_style(src: &[u8]) -> Option<(Vec<u8>, usize)> {
    if src.first() != Some(&b'"') {
        return None;
    }
    let mut out = Vec::new();
    let mut i = 1;
    while i < src.len() {
        match src[i] {
            b'"' => return Some((out, i + 1)),
            b'\\' => {
                i += 1;
                let &esc = src.get(i)?;
                match esc {
                    b'a' => out.push(0x07),
                    b'b' => out.push(0x08),
                    b'f' => out.push(0x0c),
                    b'n' => out.push(b'\n'),
                    b'r' => out.push(b'\r'),
                    b't' => out.push(b'\t'),
                    b'v' => out.push(0x0b),
                    b'\\' => out.push(b'\\'),
                    b'"' => out.push(b'"'),
                    b'0'..=b'7' => {
                        let mut val = 0u32;
                        let mut digits = 0;
                        while digits < 3 {
                            match src.get(i) {
                                Some(&d @ b'0'..=b'7') => {
                                    val = val * 8 + u32::from(d - b'0');
                                    i += 1;
                                    digits += 1;
                                }
                                _ => break,
                            }
                        }
                        if digits == 0 || val > 255 {
                            return None;
                        }
                        out.push(val as u8);
                        continue;
                    }
                    _ => return None,
                }
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    None
}

/// Append `s` single-quoted for POSIX shells.
pub fn quote_sh(s: &[u8], out: &mut Strbuf) {
    out.push(b'\'');
    for &b in s {
        if b == b'\'' {
            out.append(b"'\\''");
        } else {
            out.push(b);
        }
    }
    out.push(b'\'');
}

const URL_UNSAFE: &[u8] = b" <>\"%{}|\\^`:?#[]@!$&'()*+,;=";

/// Append `s` percent-encoded for URLs.
pub fn quote_url(s: &[u8], out: &mut Strbuf) {
    for &b in s {
        if b <= 0x1f || b >= 0x7f || URL_UNSAFE.contains(&b) {
            out.append_fmt(format_args!("%{:02X}", b));
        } else {
            out.push(b);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nul_sentinel_maintained() {
        let mut sb = Strbuf::new();
        assert_eq!(sb.as_bytes_with_nul(), b"\0");
        sb.append(b"abc");
        assert_eq!(sb.as_bytes(), b"abc");
        assert_eq!(sb.as_bytes_with_nul(), b"abc\0");
        sb.push(b'!');
        assert_eq!(sb.as_bytes_with_nul(), b"abc!\0");
    }

    #[test]
    fn test_splice() {
        let mut sb = Strbuf::from_bytes(b"hello world");
        sb.splice(6, 5, b"there");
        assert_eq!(sb.as_bytes(), b"hello there");
        sb.splice(0, 6, b"");
        assert_eq!(sb.as_bytes(), b"there");
        sb.insert(0, b"over ");
        assert_eq!(sb.as_bytes(), b"over there");
    }

    #[test]
    fn test_trim() {
        let mut sb = Strbuf::from_bytes(b"  padded\t\n");
        sb.trim();
        assert_eq!(sb.as_bytes(), b"padded");
    }

    #[test]
    fn test_getline() {
        let mut reader = io::Cursor::new(b"one\r\ntwo\nlast".to_vec());
        let mut sb = Strbuf::new();
        assert_eq!(sb.getline(&mut reader, b'\n').unwrap(), Getline::Ok);
        assert_eq!(sb.as_bytes(), b"one");
        assert_eq!(sb.getline(&mut reader, b'\n').unwrap(), Getline::Ok);
        assert_eq!(sb.as_bytes(), b"two");
        assert_eq!(sb.getline(&mut reader, b'\n').unwrap(), Getline::Ok);
        assert_eq!(sb.as_bytes(), b"last");
        assert_eq!(sb.getline(&mut reader, b'\n').unwrap(), Getline::Eof);
    }

    #[test]
    fn test_append_fmt() {
        let mut sb = Strbuf::new();
        sb.append_fmt(format_args!("mode {:06o}", 0o100644));
        assert_eq!(sb.as_bytes(), b"mode 100644");
    }

    #[test]
    fn test_stripspace() {
        let mut sb = Strbuf::from_bytes(b"\n\none  \n\n\n\ntwo\nthree");
        sb.stripspace(None);
        assert_eq!(sb.as_bytes(), b"one\n\ntwo\nthree\n");
    }

    #[test]
    fn test_stripspace_idempotent() {
        let input: &[u8] = b"  \na \n\n\nb\n\n";
        let mut once = Strbuf::from_bytes(input);
        once.stripspace(None);
        let mut twice = Strbuf::from_bytes(once.as_bytes());
        twice.stripspace(None);
        assert_eq!(once.as_bytes(), twice.as_bytes());
    }

    #[test]
    fn test_stripspace_skip_comments() {
        let mut sb = Strbuf::from_bytes(b"keep\n# drop\nalso keep\n");
        sb.stripspace(Some(b'#'));
        assert_eq!(sb.as_bytes(), b"keep\nalso keep\n");
    }

    #[test]
    fn test_normalize_crlf() {
        let mut sb = Strbuf::from_bytes(b"a\r\nb\rc\n");
        sb.normalize_crlf();
        assert_eq!(sb.as_bytes(), b"a\nb\rc\n");
    }

    #[test]
    fn test_c_quote_round_trip() {
        let path = b"dir/na\tme\"x";
        let mut quoted = Strbuf::new();
        quote_c_style(path, &mut quoted);
        assert_eq!(quoted.as_bytes(), b"\"dir/na\\tme\\\"x\"");
        let (decoded, used) = unquote_c_style(quoted.as_bytes()).unwrap();
        assert_eq!(decoded, path);
        assert_eq!(used, quoted.len());
    }

    #[test]
    fn test_unquote_rejects_malformed() {
        assert!(unquote_c_style(b"\"unterminated").is_none());
        assert!(unquote_c_style(b"\"bad\\q\"").is_none());
        assert!(unquote_c_style(b"plain").is_none());
    }

    #[test]
    fn test_plain_path_not_quoted() {
        let mut out = Strbuf::new();
        quote_c_style(b"src/lib.rs", &mut out);
        assert_eq!(out.as_bytes(), b"src/lib.rs");
    }

    #[test]
    fn test_quote_sh() {
        let mut out = Strbuf::new();
        quote_sh(b"it's", &mut out);
        assert_eq!(out.as_bytes(), b"'it'\\''s'");
    }

    #[test]
    fn test_quote_url() {
        let mut out = Strbuf::new();
        quote_url(b"a b/c", &mut out);
        assert_eq!(out.as_bytes(), b"a%20b/c");
    }

    #[test]
    fn test_reencode() {
        let mut sb = Strbuf::from_bytes("caf\u{e9}".as_bytes());
        assert!(sb.reencode("UTF-8", "ISO-8859-1"));
        assert_eq!(sb.as_bytes(), b"caf\xe9");
        assert!(sb.reencode("ISO-8859-1", "UTF-8"));
        assert_eq!(sb.as_bytes(), "caf\u{e9}".as_bytes());
    }
}
