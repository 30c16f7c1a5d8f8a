/*
 * dot.rs
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

//! RFC 5321 §4.5.2 dot stuffing for outbound DATA. The receiving
//! direction (stripping) lives in the server's DATA loop, which is
//! already line-oriented.

/// Append `message` to `out` with leading dots doubled, ensuring a
/// final CRLF, then the `.` terminator line.
pub fn dot_stuff(message: &[u8], out: &mut Vec<u8>) {
    let mut at_line_start = true;
    let mut i = 0;
    while i < message.len() {
        if at_line_start && message[i] == b'.' {
            out.push(b'.');
        }
        let line_end = match message[i..].iter().position(|&b| b == b'\n') {
            Some(n) => i + n + 1,
            None => message.len(),
        };
        out.extend_from_slice(&message[i..line_end]);
        at_line_start = true;
        i = line_end;
    }
    if !message.ends_with(b"\n") {
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b".\r\n");
}
