/*
 * plain.rs
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

//! PLAIN (RFC 4616), server side: `authzid NUL authcid NUL password`.

use super::SaslError;

/// Parsed PLAIN credentials.
#[derive(Debug, PartialEq, Eq)]
pub struct PlainCredentials {
    pub authzid: String,
    pub authcid: String,
    pub password: String,
}

pub fn parse_plain(credentials: &[u8]) -> Result<PlainCredentials, SaslError> {
    let mut pieces = credentials.split(|&b| b == 0);
    let authzid = pieces.next();
    let authcid = pieces.next();
    let password = pieces.next();
    if pieces.next().is_some() {
        return Err(SaslError::invalid("invalid PLAIN credentials format"));
    }
    match (authzid, authcid, password) {
        (Some(z), Some(c), Some(p)) => Ok(PlainCredentials {
            authzid: String::from_utf8(z.to_vec())
                .map_err(|_| SaslError::invalid("invalid PLAIN credentials format"))?,
            authcid: String::from_utf8(c.to_vec())
                .map_err(|_| SaslError::invalid("invalid PLAIN credentials format"))?,
            password: String::from_utf8(p.to_vec())
                .map_err(|_| SaslError::invalid("invalid PLAIN credentials format"))?,
        }),
        _ => Err(SaslError::invalid("invalid PLAIN credentials format")),
    }
}
