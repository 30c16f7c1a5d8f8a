/*
 * content_disposition.rs
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

//! Content-Disposition header value (RFC 2183).

use super::content_type::{is_token, parse_params};

#[derive(Debug, Clone)]
pub struct Disposition {
    pub kind: String,
    params: Vec<(String, String)>,
}

impl Disposition {
    pub fn is_attachment(&self) -> bool {
        self.kind.eq_ignore_ascii_case("attachment")
    }

    pub fn is_inline(&self) -> bool {
        self.kind.eq_ignore_ascii_case("inline")
    }

    pub fn filename(&self) -> Option<&str> {
        self.params
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case("filename"))
            .map(|(_, v)| v.as_str())
    }
}

pub fn parse_disposition(value: &str) -> Option<Disposition> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    let (kind, params_part) = match value.find(';') {
        Some(i) => {
            let (a, b) = value.split_at(i);
            (a.trim(), b[1..].trim())
        }
        None => (value, ""),
    };
    if !is_token(kind) {
        return None;
    }
    Some(Disposition {
        kind: kind.to_string(),
        params: parse_params(params_part),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attachment_with_filename() {
        let d = parse_disposition("attachment; filename=\"report.pdf\"").unwrap();
        assert!(d.is_attachment());
        assert_eq!(d.filename(), Some("report.pdf"));
    }

    #[test]
    fn bare_inline() {
        let d = parse_disposition("INLINE").unwrap();
        assert!(d.is_inline());
        assert!(d.filename().is_none());
    }
}
