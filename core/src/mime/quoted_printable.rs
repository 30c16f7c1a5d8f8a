/*
 * quoted_printable.rs
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

//! Quoted-printable transfer-encoding codec (RFC 2045 §6.7).

const HEX: &[u8; 16] = b"0123456789ABCDEF";

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'A'..=b'F' => Some(b - b'A' + 10),
        b'a'..=b'f' => Some(b - b'a' + 10),
        _ => None,
    }
}

/// Decode a complete quoted-printable body: `=XX` escapes, `=CRLF` and
/// `=LF` soft breaks. Invalid escapes pass through literally.
pub fn qp_decode(src: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(src.len());
    let mut i = 0;
    while i < src.len() {
        let b = src[i];
        if b != b'=' {
            out.push(b);
            i += 1;
            continue;
        }
        match (src.get(i + 1).copied(), src.get(i + 2).copied()) {
            (Some(h1), Some(h2)) if hex_value(h1).is_some() && hex_value(h2).is_some() => {
                out.push((hex_value(h1).unwrap() << 4) | hex_value(h2).unwrap());
                i += 3;
            }
            (Some(b'\r'), Some(b'\n')) => i += 3,
            (Some(b'\n'), _) => i += 2,
            _ => {
                out.push(b);
                i += 1;
            }
        }
    }
    out
}

/// Encode to quoted-printable with soft breaks at 75 columns. CRLF in the
/// input is a hard break; whitespace before a break is escaped.
pub fn qp_encode(src: &[u8]) -> Vec<u8> {
    const LIMIT: usize = 75;
    let mut out = Vec::with_capacity(src.len() + src.len() / 8);
    let mut col = 0;
    let mut i = 0;

    while i < src.len() {
        let b = src[i];
        if b == b'\r' && src.get(i + 1) == Some(&b'\n') {
            out.extend_from_slice(b"\r\n");
            col = 0;
            i += 2;
            continue;
        }
        let at_line_end = matches!(src.get(i + 1), None | Some(b'\r'));
        let literal = match b {
            b'=' => false,
            b' ' | b'\t' => !at_line_end,
            0x21..=0x7e => true,
            _ => false,
        };
        let width = if literal { 1 } else { 3 };
        if col + width > LIMIT {
            out.extend_from_slice(b"=\r\n");
            col = 0;
        }
        if literal {
            out.push(b);
        } else {
            out.push(b'=');
            out.push(HEX[(b >> 4) as usize]);
            out.push(HEX[(b & 0x0f) as usize]);
        }
        col += width;
        i += 1;
    }
    out
}
