/*
 * content_type.rs
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

//! Content-Type header value (RFC 2045) and the shared parameter-list
//! grammar used by Content-Disposition as well.

/// Valid in an RFC 2045 token.
#[inline]
pub fn is_token_char(c: u8) -> bool {
    matches!(c,
        b'0'..=b'9' | b'A'..=b'Z' | b'a'..=b'z' |
        b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'-' | b'.' |
        b'^' | b'_' | b'`' | b'{' | b'|' | b'}' | b'~'
    )
}

/// Non-empty string of token characters (RFC 2045).
pub fn is_token(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(is_token_char)
}

/// Parsed media type: `primary/sub` plus parameters in order of appearance.
/// Parameter names compare case-insensitively.
#[derive(Debug, Clone)]
pub struct MediaType {
    pub primary: String,
    pub sub: String,
    params: Vec<(String, String)>,
}

impl MediaType {
    pub fn new(primary: impl Into<String>, sub: impl Into<String>) -> Self {
        Self {
            primary: primary.into(),
            sub: sub.into(),
            params: Vec::new(),
        }
    }

    /// `primary/sub` in lowercase, no parameters.
    pub fn essence(&self) -> String {
        format!(
            "{}/{}",
            self.primary.to_ascii_lowercase(),
            self.sub.to_ascii_lowercase()
        )
    }

    pub fn is(&self, primary: &str, sub: &str) -> bool {
        self.primary.eq_ignore_ascii_case(primary) && self.sub.eq_ignore_ascii_case(sub)
    }

    pub fn is_primary(&self, primary: &str) -> bool {
        self.primary.eq_ignore_ascii_case(primary)
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Parse a Content-Type value. Returns None on grammar violations; the
/// caller decides whether that is fatal.
pub fn parse_media_type(value: &str) -> Option<MediaType> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    let (type_part, params_part) = match value.find(';') {
        Some(i) => {
            let (a, b) = value.split_at(i);
            (a.trim(), b[1..].trim())
        }
        None => (value, ""),
    };
    let slash = type_part.find('/')?;
    let primary = type_part[..slash].trim();
    let sub = type_part[slash + 1..].trim();
    if !is_token(primary) || !is_token(sub) {
        return None;
    }
    let mut mt = MediaType::new(primary, sub);
    mt.params = parse_params(params_part);
    Some(mt)
}

/// Parse a `;`-separated parameter list (`name=value` or `name="value"`).
/// Malformed items are skipped rather than failing the whole list.
pub fn parse_params(input: &str) -> Vec<(String, String)> {
    let bytes = input.as_bytes();
    let len = bytes.len();
    let mut params = Vec::new();
    let mut pos = 0;

    while pos < len {
        while pos < len && (bytes[pos] == b';' || bytes[pos].is_ascii_whitespace()) {
            pos += 1;
        }
        if pos >= len {
            break;
        }
        let eq = match bytes[pos..].iter().position(|&b| b == b'=') {
            Some(i) => pos + i,
            None => break,
        };
        let name = match std::str::from_utf8(&bytes[pos..eq]) {
            Ok(n) => n.trim(),
            Err(_) => break,
        };
        pos = eq + 1;
        if !is_token(name) {
            // Skip to the next parameter.
            match bytes[pos..].iter().position(|&b| b == b';') {
                Some(i) => {
                    pos += i + 1;
                    continue;
                }
                None => break,
            }
        }
        let value = if pos < len && bytes[pos] == b'"' {
            pos += 1;
            let mut v = String::new();
            while pos < len {
                match bytes[pos] {
                    b'\\' if pos + 1 < len => {
                        v.push(bytes[pos + 1] as char);
                        pos += 2;
                    }
                    b'"' => {
                        pos += 1;
                        break;
                    }
                    c => {
                        v.push(c as char);
                        pos += 1;
                    }
                }
            }
            v
        } else {
            let end = bytes[pos..]
                .iter()
                .position(|&b| b == b';')
                .map(|i| pos + i)
                .unwrap_or(len);
            let v = std::str::from_utf8(&bytes[pos..end])
                .map(str::trim)
                .unwrap_or("");
            pos = end;
            v.to_string()
        };
        params.push((name.to_string(), value));
    }
    params
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_type() {
        let mt = parse_media_type("text/plain").unwrap();
        assert_eq!(mt.essence(), "text/plain");
        assert!(mt.is("TEXT", "Plain"));
        assert!(mt.param("charset").is_none());
    }

    #[test]
    fn type_with_params() {
        let mt = parse_media_type("multipart/mixed; boundary=\"a b\"; charset=utf-8").unwrap();
        assert_eq!(mt.param("BOUNDARY"), Some("a b"));
        assert_eq!(mt.param("charset"), Some("utf-8"));
    }

    #[test]
    fn quoted_value_with_escape() {
        let mt = parse_media_type("application/x-thing; name=\"a\\\"b\"").unwrap();
        assert_eq!(mt.param("name"), Some("a\"b"));
    }

    #[test]
    fn missing_slash_rejected() {
        assert!(parse_media_type("textplain").is_none());
        assert!(parse_media_type("").is_none());
    }

    #[test]
    fn malformed_parameter_skipped() {
        let mt = parse_media_type("text/plain; =bad; charset=us-ascii").unwrap();
        assert_eq!(mt.param("charset"), Some("us-ascii"));
    }
}
