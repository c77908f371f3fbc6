//! Text escaping shared by the wire driver and the session.
//!
//! These follow the server's lexical rules, they do not depend on a live connection
//! except for the `standard_conforming_strings` setting passed in by the caller.
use std::fmt::Write;

/// Escape `text` for use inside a single quoted string literal, appending to `out`.
///
/// Returns `false` when `text` contains a NUL, which no literal can carry.
pub fn escape_string(out: &mut String, text: &str, standard_conforming_strings: bool) -> bool {
    if text.contains('\0') {
        return false;
    }
    for ch in text.chars() {
        match ch {
            '\'' => out.push_str("''"),
            '\\' if !standard_conforming_strings => out.push_str("\\\\"),
            ch => out.push(ch),
        }
    }
    true
}

/// Escape binary data into the hex `bytea` text format.
///
/// When `standard_conforming_strings` is off the leading backslash is doubled,
/// so the result stays correct inside a plain string literal.
pub fn escape_bytea(data: &[u8], standard_conforming_strings: bool) -> String {
    let mut out = String::with_capacity(3 + data.len() * 2);
    if standard_conforming_strings {
        out.push_str("\\x");
    } else {
        out.push_str("\\\\x");
    }
    for b in data {
        // writing into a String never fails
        let _ = write!(out, "{b:02x}");
    }
    out
}

/// Quote an identifier, doubling embedded double quotes.
///
/// Returns `None` when `ident` contains a NUL.
pub fn escape_identifier(ident: &str) -> Option<String> {
    if ident.contains('\0') {
        return None;
    }
    let mut out = String::with_capacity(ident.len() + 2);
    out.push('"');
    for ch in ident.chars() {
        if ch == '"' {
            out.push('"');
        }
        out.push(ch);
    }
    out.push('"');
    Some(out)
}

/// Decode the text form of a `bytea` value.
///
/// Both the hex format (`\x...`) and the legacy escape format are accepted.
/// Returns `None` on malformed input.
pub fn unescape_bytea(text: &str) -> Option<Vec<u8>> {
    if let Some(hex) = text.strip_prefix("\\x") {
        return unhex(hex.as_bytes());
    }

    let bytes = text.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'\\' {
            out.push(bytes[i]);
            i += 1;
            continue;
        }
        match bytes.get(i + 1..i + 4) {
            Some(&[a @ b'0'..=b'3', b @ b'0'..=b'7', c @ b'0'..=b'7']) => {
                out.push((a - b'0') * 64 + (b - b'0') * 8 + (c - b'0'));
                i += 4;
            },
            _ if bytes.get(i + 1) == Some(&b'\\') => {
                out.push(b'\\');
                i += 2;
            },
            _ => return None,
        }
    }
    Some(out)
}

fn unhex(hex: &[u8]) -> Option<Vec<u8>> {
    fn nibble(b: u8) -> Option<u8> {
        match b {
            b'0'..=b'9' => Some(b - b'0'),
            b'a'..=b'f' => Some(b - b'a' + 10),
            b'A'..=b'F' => Some(b - b'A' + 10),
            _ => None,
        }
    }

    let mut out = Vec::with_capacity(hex.len() / 2);
    let mut iter = hex.iter().copied().filter(|b| !b.is_ascii_whitespace());
    while let Some(hi) = iter.next() {
        let lo = iter.next()?;
        out.push(nibble(hi)? << 4 | nibble(lo)?);
    }
    Some(out)
}

/// Escape `text` for use in a `LIKE` pattern, prefixing `_` and `%` with `escape_char`.
///
/// Walks characters, so a multibyte character is never split.
pub fn escape_like(text: &str, escape_char: char) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        if matches!(ch, '_' | '%') {
            out.push(escape_char);
        }
        out.push(ch);
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn string_literal() {
        let mut out = String::new();
        assert!(escape_string(&mut out, "it's a\\b", true));
        assert_eq!(out, "it''s a\\b");

        out.clear();
        assert!(escape_string(&mut out, "it's a\\b", false));
        assert_eq!(out, "it''s a\\\\b");

        assert!(!escape_string(&mut out, "nul\0", true));
    }

    #[test]
    fn bytea_hex() {
        assert_eq!(escape_bytea(&[0x00, 0xff, 0x10], true), "\\x00ff10");
        assert_eq!(escape_bytea(b"", false), "\\\\x");
        assert_eq!(unescape_bytea("\\x00ff10").unwrap(), vec![0x00, 0xff, 0x10]);
        assert!(unescape_bytea("\\x0").is_none());
    }

    #[test]
    fn bytea_escape_format() {
        assert_eq!(unescape_bytea("a\\000b\\\\").unwrap(), b"a\0b\\");
        assert!(unescape_bytea("bad\\9").is_none());
    }

    #[test]
    fn identifiers() {
        assert_eq!(escape_identifier("my \"table\"").unwrap(), "\"my \"\"table\"\"\"");
        assert!(escape_identifier("a\0b").is_none());
    }

    #[test]
    fn like_pattern() {
        assert_eq!(escape_like("50%_ñ", '\\'), "50\\%\\_ñ");
        assert_eq!(escape_like("日本_語", '#'), "日本#_語");
    }
}
