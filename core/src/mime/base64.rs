/*
 * base64.rs
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

//! Base64 transfer-encoding codec (RFC 2045). The decoder is forgiving:
//! whitespace anywhere, bytes after padding ignored. Wire-format tags
//! elsewhere (SASL, DKIM) use the `base64` crate; this codec exists for
//! body content, where line breaks are part of the encoding.

const ALPHABET: &[u8; 64] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

fn value_of(b: u8) -> Option<u32> {
    match b {
        b'A'..=b'Z' => Some((b - b'A') as u32),
        b'a'..=b'z' => Some((b - b'a' + 26) as u32),
        b'0'..=b'9' => Some((b - b'0' + 52) as u32),
        b'+' => Some(62),
        b'/' => Some(63),
        _ => None,
    }
}

/// Decode a complete base64 body. Whitespace (including CRLF) is skipped;
/// decoding stops at the first `=` padding. A trailing partial quantum of
/// one significant character is dropped, matching lenient mail parsers.
pub fn b64_decode(src: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(src.len() / 4 * 3);
    let mut quantum: u32 = 0;
    let mut bits: u32 = 0;
    for &b in src {
        if b == b'=' {
            break;
        }
        let v = match value_of(b) {
            Some(v) => v,
            None => continue,
        };
        quantum = (quantum << 6) | v;
        bits += 6;
        if bits == 24 {
            out.push((quantum >> 16) as u8);
            out.push((quantum >> 8) as u8);
            out.push(quantum as u8);
            quantum = 0;
            bits = 0;
        }
    }
    if bits >= 8 {
        out.push((quantum >> (bits - 8)) as u8);
        if bits >= 16 {
            out.push((quantum >> (bits - 16)) as u8);
        }
    }
    out
}

/// Encode with a CRLF after every `wrap` output characters (and after the
/// final partial line when any output was produced).
pub fn b64_encode_wrapped(src: &[u8], wrap: usize, out: &mut Vec<u8>) {
    let mut col = 0;
    let mut push = |out: &mut Vec<u8>, c: u8| {
        out.push(c);
        col += 1;
        if col == wrap {
            out.extend_from_slice(b"\r\n");
            col = 0;
        }
    };
    for chunk in src.chunks(3) {
        let n = (chunk[0] as usize) << 16
            | (chunk.get(1).copied().unwrap_or(0) as usize) << 8
            | chunk.get(2).copied().unwrap_or(0) as usize;
        push(out, ALPHABET[n >> 18]);
        push(out, ALPHABET[(n >> 12) & 63]);
        push(out, if chunk.len() > 1 { ALPHABET[(n >> 6) & 63] } else { b'=' });
        push(out, if chunk.len() > 2 { ALPHABET[n & 63] } else { b'=' });
    }
    if !src.is_empty() && col != 0 {
        out.extend_from_slice(b"\r\n");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_simple() {
        assert_eq!(b64_decode(b"aGVsbG8="), b"hello");
        assert_eq!(b64_decode(b"aGVsbG8h"), b"hello!");
    }

    #[test]
    fn decode_with_line_breaks() {
        assert_eq!(b64_decode(b"aGVs\r\nbG8h\r\n"), b"hello!");
    }

    #[test]
    fn decode_unpadded_tail() {
        assert_eq!(b64_decode(b"aGVsbG8"), b"hello");
    }

    #[test]
    fn encode_wraps_lines() {
        let mut out = Vec::new();
        b64_encode_wrapped(&[0u8; 9], 8, &mut out);
        assert_eq!(out, b"AAAAAAAA\r\nAAAA\r\n");
    }

    #[test]
    fn encode_pads() {
        let mut out = Vec::new();
        b64_encode_wrapped(b"hi", 68, &mut out);
        assert_eq!(out, b"aGk=\r\n");
    }

    #[test]
    fn roundtrip() {
        let data: Vec<u8> = (0u8..=255).collect();
        let mut enc = Vec::new();
        b64_encode_wrapped(&data, 68, &mut enc);
        assert_eq!(b64_decode(&enc), data);
    }
}
