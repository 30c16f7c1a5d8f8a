/*
 * canon.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * This file is part of Cassetta, a personal email server.
 *
 * Cassetta is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Cassetta is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Cassetta.  If not, see <http://www.gnu.org/licenses/>.
 */

//! DKIM canonicalization (RFC 6376 §3.4). Body: relaxed collapses WSP and
//! trailing blank lines; simple only normalizes the ending. Header:
//! relaxed lowercases the name, unfolds, and collapses WSP; simple is the
//! wire form untouched.

use super::Canon;

/// Canonical body bytes under `canon`.
pub fn canonical_body(body: &[u8], canon: Canon) -> Vec<u8> {
    match canon {
        Canon::Relaxed => relaxed_body(body),
        Canon::Simple => simple_body(body),
    }
}

fn relaxed_body(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len());
    for line in lines(body) {
        let mut in_wsp = false;
        for &b in line {
            if b == b' ' || b == b'\t' {
                in_wsp = true;
            } else {
                // Any WSP run inside the line reduces to one SP; a run at
                // the end of the line disappears.
                if in_wsp {
                    out.push(b' ');
                }
                in_wsp = false;
                out.push(b);
            }
        }
        out.extend_from_slice(b"\r\n");
    }
    trim_trailing_blank_lines(&mut out);
    out
}

fn simple_body(body: &[u8]) -> Vec<u8> {
    if body.is_empty() {
        return b"\r\n".to_vec();
    }
    let mut out = Vec::with_capacity(body.len() + 2);
    for line in lines(body) {
        out.extend_from_slice(line);
        out.extend_from_slice(b"\r\n");
    }
    trim_trailing_blank_lines(&mut out);
    if out.is_empty() {
        out.extend_from_slice(b"\r\n");
    }
    out
}

/// Drop empty lines at the end; what remains ends with one CRLF (or is
/// empty when the body had no content at all).
fn trim_trailing_blank_lines(out: &mut Vec<u8>) {
    while out.ends_with(b"\r\n\r\n") {
        out.truncate(out.len() - 2);
    }
    if out == b"\r\n" {
        out.clear();
    }
}

/// Split on LF, tolerating a missing final newline; CR before LF is not
/// part of the line.
fn lines(body: &[u8]) -> impl Iterator<Item = &[u8]> {
    let mut pos = 0;
    std::iter::from_fn(move || {
        if pos >= body.len() {
            return None;
        }
        let rest = &body[pos..];
        match rest.iter().position(|&b| b == b'\n') {
            Some(i) => {
                let line = if i > 0 && rest[i - 1] == b'\r' {
                    &rest[..i - 1]
                } else {
                    &rest[..i]
                };
                pos += i + 1;
                Some(line)
            }
            None => {
                pos = body.len();
                Some(rest)
            }
        }
    })
}

/// Relaxed header canonicalization of one field: lowercase name, unfolded
/// value with WSP runs collapsed and edges trimmed, `name:value CRLF`.
/// `raw_value` is the field body as received, folds included.
pub fn relaxed_header_line(name: &str, raw_value: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(name.len() + raw_value.len() + 3);
    for b in name.bytes() {
        out.push(b.to_ascii_lowercase());
    }
    out.push(b':');
    let mut value = Vec::with_capacity(raw_value.len());
    let mut in_wsp = false;
    for &b in raw_value {
        match b {
            b' ' | b'\t' | b'\r' | b'\n' => in_wsp = true,
            _ => {
                if in_wsp && !value.is_empty() {
                    value.push(b' ');
                }
                in_wsp = false;
                value.push(b);
            }
        }
    }
    out.extend_from_slice(&value);
    out.extend_from_slice(b"\r\n");
    out
}

/// Simple header canonicalization: the raw field exactly as received,
/// with its CRLF terminator.
pub fn simple_header_line(raw_field: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(raw_field.len() + 2);
    out.extend_from_slice(raw_field);
    out.extend_from_slice(b"\r\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relaxed_body_collapses_wsp() {
        // The canonical example: " C \r\nD  \t E\r\n" -> " C\r\nD E\r\n".
        assert_eq!(
            canonical_body(b" C \r\nD  \t E\r\n", Canon::Relaxed),
            b" C\r\nD E\r\n"
        );
    }

    #[test]
    fn relaxed_body_trims_trailing_blank_lines() {
        assert_eq!(
            canonical_body(b"hi\r\n\r\n\r\n", Canon::Relaxed),
            b"hi\r\n"
        );
    }

    #[test]
    fn relaxed_body_adds_missing_crlf() {
        assert_eq!(canonical_body(b"hi", Canon::Relaxed), b"hi\r\n");
    }

    #[test]
    fn relaxed_empty_body_is_empty() {
        assert_eq!(canonical_body(b"", Canon::Relaxed), b"");
        assert_eq!(canonical_body(b"\r\n\r\n", Canon::Relaxed), b"");
    }

    #[test]
    fn simple_body_keeps_interior_wsp() {
        assert_eq!(
            canonical_body(b"a  b \r\n\r\n\r\n", Canon::Simple),
            b"a  b \r\n"
        );
    }

    #[test]
    fn simple_empty_body_is_crlf() {
        assert_eq!(canonical_body(b"", Canon::Simple), b"\r\n");
    }

    #[test]
    fn relaxed_header() {
        assert_eq!(
            relaxed_header_line("Subject", b"  a   test\r\n\t with fold "),
            b"subject:a test with fold\r\n"
        );
        assert_eq!(relaxed_header_line("FROM", b"a@x"), b"from:a@x\r\n");
    }

    #[test]
    fn simple_header_is_verbatim() {
        assert_eq!(
            simple_header_line(b"Subject:  kept  as-is"),
            b"Subject:  kept  as-is\r\n"
        );
    }
}
