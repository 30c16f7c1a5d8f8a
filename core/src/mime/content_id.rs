/*
 * content_id.rs
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

//! Content-ID values (RFC 2045): `<local@domain>`, stored without the
//! angle brackets.

/// Parse a Content-ID or Message-ID value, with or without angle brackets.
/// Returns the bare `local@domain` form.
pub fn parse_content_id(value: &str) -> Option<String> {
    let value = value.trim();
    let inner = value
        .strip_prefix('<')
        .and_then(|v| v.strip_suffix('>'))
        .unwrap_or(value);
    let inner = inner.trim();
    let at = inner.find('@')?;
    if at == 0 || at + 1 >= inner.len() {
        return None;
    }
    Some(inner.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn brackets_stripped() {
        assert_eq!(
            parse_content_id("<img1@mailer.local>").as_deref(),
            Some("img1@mailer.local")
        );
    }

    #[test]
    fn bare_value_accepted() {
        assert_eq!(parse_content_id("a@b").as_deref(), Some("a@b"));
    }

    #[test]
    fn missing_at_rejected() {
        assert!(parse_content_id("<nodomains>").is_none());
        assert!(parse_content_id("").is_none());
    }
}
