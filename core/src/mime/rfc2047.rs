/*
 * rfc2047.rs
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

//! RFC 2047 encoded-word decoding for header values
//! (`=?charset?b|q?payload?=`). Unknown charsets fall back to the raw
//! token so nothing is lost.

use super::base64::b64_decode;
use super::quoted_printable::qp_decode;

/// Expand every encoded-word in `s`; literal text passes through.
pub fn decode_encoded_words(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = String::with_capacity(s.len());
    let mut pos = 0;

    while pos < bytes.len() {
        let start = match find_subslice(bytes, pos, b"=?") {
            Some(i) => i,
            None => {
                out.push_str(&String::from_utf8_lossy(&bytes[pos..]));
                break;
            }
        };
        out.push_str(&String::from_utf8_lossy(&bytes[pos..start]));
        match decode_one(bytes, start) {
            Some((decoded, end)) => {
                out.push_str(&decoded);
                pos = end;
            }
            None => {
                out.push_str("=?");
                pos = start + 2;
            }
        }
    }
    out
}

fn find_subslice(haystack: &[u8], from: usize, needle: &[u8]) -> Option<usize> {
    haystack
        .get(from..)?
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|i| from + i)
}

/// Decode the encoded-word starting at `start` (which points at `=?`).
/// Returns the decoded text and the index just past the closing `?=`.
/// An unrecognized charset yields the whole token verbatim.
fn decode_one(bytes: &[u8], start: usize) -> Option<(String, usize)> {
    let charset_start = start + 2;
    let q1 = find_subslice(bytes, charset_start, b"?")?;
    let charset = std::str::from_utf8(&bytes[charset_start..q1]).ok()?;
    let encoding = bytes.get(q1 + 1)?.to_ascii_lowercase();
    if bytes.get(q1 + 2) != Some(&b'?') {
        return None;
    }
    let payload_start = q1 + 3;
    let end = find_subslice(bytes, payload_start, b"?=")?;
    let payload = &bytes[payload_start..end];

    let decoded = match encoding {
        b'b' => b64_decode(payload),
        b'q' => {
            // Q encoding: underscore is space, the rest is quoted-printable.
            let mut qp = Vec::with_capacity(payload.len());
            for &b in payload {
                if b == b'_' {
                    qp.push(b' ');
                } else {
                    qp.push(b);
                }
            }
            qp_decode(&qp)
        }
        _ => return None,
    };
    let after = end + 2;
    match charset_to_utf8(&decoded, charset) {
        Some(text) => Some((text, after)),
        // Unknown charset: keep the raw token so nothing is lost.
        None => Some((
            String::from_utf8_lossy(&bytes[start..after]).into_owned(),
            after,
        )),
    }
}

fn charset_to_utf8(bytes: &[u8], charset: &str) -> Option<String> {
    let lower = charset.trim().to_ascii_lowercase();
    match lower.as_str() {
        "utf-8" | "utf8" | "us-ascii" | "ascii" => {
            Some(String::from_utf8_lossy(bytes).into_owned())
        }
        "iso-8859-1" | "iso_8859-1" | "latin1" => {
            Some(bytes.iter().map(|&b| b as char).collect())
        }
        _ => None,
    }
}
