/*
 * header.rs
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

//! RFC 5322 header section: ordered entries under canonical-case keys,
//! folding encoder (78 soft / 998 hard), continuation-aware parser.

use std::collections::HashMap;
use std::fmt;
use std::io::{self, Write};

use super::rfc2047::decode_encoded_words;

/// Well-known keys whose capitalization does not follow the
/// capitalize-after-hyphen rule.
const KEY_EXCEPTIONS: &[(&str, &str)] = &[
    ("content-id", "Content-ID"),
    ("content-md5", "Content-MD5"),
    ("dkim-signature", "DKIM-Signature"),
    ("message-id", "Message-ID"),
    ("mime-version", "MIME-Version"),
];

/// Canonical form of a header key: lowercase, then capitalize the first
/// letter and every letter following a hyphen, with a fixed exception
/// table. Pure over the byte input; non-ASCII bytes pass through.
pub fn canonical_key(input: &[u8]) -> String {
    let lower: String = input
        .iter()
        .map(|&b| (b as char).to_ascii_lowercase())
        .collect();
    if let Some((_, canonical)) = KEY_EXCEPTIONS.iter().find(|(k, _)| *k == lower) {
        return (*canonical).to_string();
    }
    let mut out = String::with_capacity(lower.len());
    let mut capitalize = true;
    for c in lower.chars() {
        if capitalize {
            out.extend(c.to_uppercase());
        } else {
            out.push(c);
        }
        capitalize = c == '-';
    }
    out
}

#[derive(Debug)]
pub enum HeaderError {
    /// First line of the section begins with whitespace.
    LeadingWhitespace,
    /// Header line is not valid UTF-8 where it must be (key).
    BadKey,
}

impl fmt::Display for HeaderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeaderError::LeadingWhitespace => {
                write!(f, "header section begins with whitespace")
            }
            HeaderError::BadKey => write!(f, "malformed header key"),
        }
    }
}

impl std::error::Error for HeaderError {}

/// Ordered header list plus an index from canonical key to the entry
/// positions in order of appearance. Values are raw bytes as received
/// (unfolded, trimmed); RFC 2047 decoding happens on demand.
#[derive(Debug, Clone, Default)]
pub struct Headers {
    entries: Vec<(String, Vec<u8>)>,
    index: HashMap<String, Vec<usize>>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// Append an entry. The key is canonicalized.
    pub fn add(&mut self, key: &str, value: impl Into<Vec<u8>>) {
        let key = canonical_key(key.as_bytes());
        let pos = self.entries.len();
        self.entries.push((key.clone(), value.into()));
        self.index.entry(key).or_default().push(pos);
    }

    /// First value for `key`, raw bytes.
    pub fn get(&self, key: &str) -> Option<&[u8]> {
        let key = canonical_key(key.as_bytes());
        let pos = *self.index.get(&key)?.first()?;
        Some(&self.entries[pos].1)
    }

    /// All values for `key` in order of appearance.
    pub fn get_all(&self, key: &str) -> Vec<&[u8]> {
        let key = canonical_key(key.as_bytes());
        match self.index.get(&key) {
            Some(positions) => positions
                .iter()
                .map(|&p| self.entries[p].1.as_slice())
                .collect(),
            None => Vec::new(),
        }
    }

    /// First value as lossy UTF-8.
    pub fn get_str(&self, key: &str) -> Option<String> {
        self.get(key)
            .map(|v| String::from_utf8_lossy(v).into_owned())
    }

    /// First value with encoded-words expanded.
    pub fn decoded(&self, key: &str) -> Option<String> {
        self.get_str(key).map(|v| decode_encoded_words(&v))
    }

    /// Remove every entry for `key`.
    pub fn del(&mut self, key: &str) {
        let key = canonical_key(key.as_bytes());
        if self.index.remove(&key).is_some() {
            self.entries.retain(|(k, _)| *k != key);
            self.rebuild_index();
        }
    }

    /// Replace all entries for `key` with a single one, keeping the slot of
    /// the first occurrence when present.
    pub fn set(&mut self, key: &str, value: impl Into<Vec<u8>>) {
        let canonical = canonical_key(key.as_bytes());
        match self.index.get(&canonical).and_then(|p| p.first().copied()) {
            Some(first) => {
                self.entries[first].1 = value.into();
                let mut removed = false;
                let canonical_ref = &canonical;
                let mut seen = false;
                self.entries.retain(|(k, _)| {
                    if k == canonical_ref {
                        if seen {
                            removed = true;
                            return false;
                        }
                        seen = true;
                    }
                    true
                });
                if removed {
                    self.rebuild_index();
                }
            }
            None => self.add(key, value),
        }
    }

    /// Insert an entry at the front (e.g. a freshly produced signature).
    pub fn prepend(&mut self, key: &str, value: impl Into<Vec<u8>>) {
        let key = canonical_key(key.as_bytes());
        self.entries.insert(0, (key, value.into()));
        self.rebuild_index();
    }

    fn rebuild_index(&mut self) {
        self.index.clear();
        for (pos, (k, _)) in self.entries.iter().enumerate() {
            self.index.entry(k.clone()).or_default().push(pos);
        }
    }

    /// Emit `Key: value<CRLF>` per entry with folding white space keeping
    /// lines within 78 columns where a break point exists, never past 998
    /// except as a forced break. The blank line ending the section is the
    /// caller's to write.
    pub fn encode(&self, out: &mut dyn Write) -> io::Result<()> {
        for (key, value) in &self.entries {
            let mut line = Vec::with_capacity(key.len() + 2 + value.len());
            line.extend_from_slice(key.as_bytes());
            line.extend_from_slice(b": ");
            line.extend_from_slice(value);
            fold_line(&line, out)?;
        }
        Ok(())
    }

    /// Parse a header section from `data`. Returns the headers and the
    /// offset of the first body byte (past the blank line; end of input
    /// when the section is unterminated).
    pub fn parse(data: &[u8]) -> Result<(Headers, usize), HeaderError> {
        let mut headers = Headers::new();
        let mut pos = 0;
        // Key of the entry under construction and its accumulated value.
        let mut current: Option<(String, Vec<u8>)> = None;
        let mut first_line = true;

        loop {
            if pos >= data.len() {
                break;
            }
            let (line, next) = read_line(data, pos);
            if line.is_empty() {
                pos = next;
                break;
            }
            if line[0] == b' ' || line[0] == b'\t' {
                if first_line {
                    return Err(HeaderError::LeadingWhitespace);
                }
                // Continuation: fold replaced by a single space.
                if let Some((_, value)) = current.as_mut() {
                    if !value.is_empty() {
                        value.push(b' ');
                    }
                    value.extend_from_slice(trim_wsp(line));
                }
                pos = next;
                continue;
            }
            first_line = false;
            if let Some((key, value)) = current.take() {
                headers.add(&key, value);
            }
            match line.iter().position(|&b| b == b':') {
                Some(0) | None => {
                    // Empty or missing key: skip the line, do not abort.
                }
                Some(colon) => {
                    let key = String::from_utf8_lossy(&line[..colon]).trim().to_string();
                    if key.is_empty() {
                        pos = next;
                        continue;
                    }
                    let value = trim_wsp(&line[colon + 1..]).to_vec();
                    current = Some((key, value));
                }
            }
            pos = next;
        }
        if let Some((key, value)) = current.take() {
            headers.add(&key, value);
        }
        Ok((headers, pos))
    }
}

/// One line without its terminator, plus the offset past the terminator.
fn read_line(data: &[u8], from: usize) -> (&[u8], usize) {
    match data[from..].iter().position(|&b| b == b'\n') {
        Some(i) => {
            let nl = from + i;
            let end = if nl > from && data[nl - 1] == b'\r' {
                nl - 1
            } else {
                nl
            };
            (&data[from..end], nl + 1)
        }
        None => (&data[from..], data.len()),
    }
}

fn trim_wsp(mut s: &[u8]) -> &[u8] {
    while let Some((&first, rest)) = s.split_first() {
        if first == b' ' || first == b'\t' {
            s = rest;
        } else {
            break;
        }
    }
    while let Some((&last, rest)) = s.split_last() {
        if last == b' ' || last == b'\t' {
            s = rest;
        } else {
            break;
        }
    }
    s
}

const SOFT_LIMIT: usize = 78;
const HARD_LIMIT: usize = 998;
const INDENT: &[u8] = b"    ";

/// Fold one logical header line. Break points are WSP positions; the WSP
/// at the break is replaced by CRLF + four spaces.
fn fold_line(line: &[u8], out: &mut dyn Write) -> io::Result<()> {
    let mut start = 0;
    let mut indent = 0usize;
    loop {
        let budget_soft = SOFT_LIMIT - indent;
        let budget_hard = HARD_LIMIT - indent;
        let rest = &line[start..];
        if rest.len() <= budget_soft {
            if indent > 0 {
                out.write_all(INDENT)?;
            }
            out.write_all(rest)?;
            out.write_all(b"\r\n")?;
            return Ok(());
        }
        let window = &rest[..budget_soft.min(rest.len())];
        let brk = match rposition_wsp(window) {
            Some(i) if i > 0 => Some(i),
            _ => {
                // No boundary within 78: relax to 998, then force.
                let wide = &rest[..budget_hard.min(rest.len())];
                match rposition_wsp(wide) {
                    Some(i) if i > 0 => Some(i),
                    _ => None,
                }
            }
        };
        if indent > 0 {
            out.write_all(INDENT)?;
        }
        match brk {
            Some(i) => {
                out.write_all(&rest[..i])?;
                out.write_all(b"\r\n")?;
                start += i + 1;
            }
            None => {
                let cut = budget_hard.min(rest.len());
                out.write_all(&rest[..cut])?;
                out.write_all(b"\r\n")?;
                start += cut;
                if start >= line.len() {
                    return Ok(());
                }
            }
        }
        indent = INDENT.len();
    }
}

fn rposition_wsp(s: &[u8]) -> Option<usize> {
    s.iter().rposition(|&b| b == b' ' || b == b'\t')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_case() {
        assert_eq!(canonical_key(b"subject"), "Subject");
        assert_eq!(canonical_key(b"CONTENT-TYPE"), "Content-Type");
        assert_eq!(canonical_key(b"x-spam-score"), "X-Spam-Score");
        assert_eq!(canonical_key(b"in-reply-to"), "In-Reply-To");
    }

    #[test]
    fn canonical_exceptions() {
        assert_eq!(canonical_key(b"message-id"), "Message-ID");
        assert_eq!(canonical_key(b"MIME-VERSION"), "MIME-Version");
        assert_eq!(canonical_key(b"dkim-signature"), "DKIM-Signature");
        assert_eq!(canonical_key(b"content-id"), "Content-ID");
    }

    #[test]
    fn case_insensitive_lookup() {
        let mut h = Headers::new();
        h.add("SUBJECT", "hello".as_bytes());
        assert_eq!(h.get("subject"), Some("hello".as_bytes()));
        assert_eq!(h.get("Subject"), Some("hello".as_bytes()));
    }

    #[test]
    fn parse_simple_section() {
        let raw = b"From: a@x\r\nTo: b@y\r\n\r\nbody";
        let (h, body) = Headers::parse(raw).unwrap();
        assert_eq!(h.len(), 2);
        assert_eq!(h.get("from"), Some("a@x".as_bytes()));
        assert_eq!(&raw[body..], b"body");
    }

    #[test]
    fn parse_continuation_joined_with_space() {
        let raw = b"Subject: part one\r\n\tpart two\r\n\r\n";
        let (h, _) = Headers::parse(raw).unwrap();
        assert_eq!(h.get_str("subject").unwrap(), "part one part two");
    }

    #[test]
    fn parse_rejects_leading_whitespace() {
        assert!(matches!(
            Headers::parse(b" Oops: no\r\n\r\n"),
            Err(HeaderError::LeadingWhitespace)
        ));
    }

    #[test]
    fn parse_skips_empty_keys() {
        let raw = b": nameless\r\nnocolonhere\r\nReal: yes\r\n\r\n";
        let (h, _) = Headers::parse(raw).unwrap();
        assert_eq!(h.len(), 1);
        assert_eq!(h.get_str("real").unwrap(), "yes");
    }

    #[test]
    fn parse_unterminated_section() {
        let (h, body) = Headers::parse(b"A: 1\r\nB: 2").unwrap();
        assert_eq!(h.len(), 2);
        assert_eq!(body, 10);
    }

    #[test]
    fn duplicate_keys_ordered() {
        let raw = b"Received: one\r\nReceived: two\r\n\r\n";
        let (h, _) = Headers::parse(raw).unwrap();
        let all = h.get_all("received");
        assert_eq!(all, vec![b"one".as_slice(), b"two".as_slice()]);
    }

    #[test]
    fn set_replaces_in_place() {
        let mut h = Headers::new();
        h.add("MIME-Version", "0.9".as_bytes());
        h.add("Subject", "x".as_bytes());
        h.add("MIME-Version", "0.8".as_bytes());
        h.set("mime-version", "1.0".as_bytes());
        assert_eq!(h.get_all("MIME-Version"), vec![b"1.0".as_slice()]);
        assert_eq!(h.len(), 2);
    }

    #[test]
    fn encode_short_line_unfolded() {
        let mut h = Headers::new();
        h.add("Subject", "short".as_bytes());
        let mut out = Vec::new();
        h.encode(&mut out).unwrap();
        assert_eq!(out, b"Subject: short\r\n");
    }

    #[test]
    fn encode_folds_at_word_boundary() {
        let mut h = Headers::new();
        let value = "word ".repeat(30);
        h.add("Subject", value.trim_end().as_bytes());
        let mut out = Vec::new();
        h.encode(&mut out).unwrap();
        for line in out.split(|&b| b == b'\n') {
            assert!(line.len() <= SOFT_LIMIT + 1, "line too long: {}", line.len());
        }
        // Folding round-trips through the parser.
        let mut section = out.clone();
        section.extend_from_slice(b"\r\n");
        let (parsed, _) = Headers::parse(&section).unwrap();
        assert_eq!(parsed.get_str("subject").unwrap(), value.trim_end());
    }

    #[test]
    fn encode_unbreakable_line_relaxes_to_hard_limit() {
        let mut h = Headers::new();
        let value = "x".repeat(500);
        h.add("X-Blob", value.as_bytes());
        let mut out = Vec::new();
        h.encode(&mut out).unwrap();
        for line in out.split(|&b| b == b'\n') {
            assert!(line.len() <= HARD_LIMIT + 1);
        }
    }

    #[test]
    fn encode_forced_break_past_hard_limit() {
        let mut h = Headers::new();
        let value = "y".repeat(2500);
        h.add("X-Blob", value.as_bytes());
        let mut out = Vec::new();
        h.encode(&mut out).unwrap();
        let lines: Vec<_> = out.split(|&b| b == b'\n').filter(|l| !l.is_empty()).collect();
        assert!(lines.len() > 2);
        for line in &lines {
            assert!(line.len() <= HARD_LIMIT + 1);
        }
    }

    #[test]
    fn decoded_value_expands_encoded_words() {
        let mut h = Headers::new();
        h.add("Subject", "=?utf-8?q?caf=C3=A9?=".as_bytes());
        assert_eq!(h.decoded("subject").unwrap(), "café");
    }
}
