/*
 * msg.rs
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

//! Decoded message model: [`Msg`] owns an ordered header list, a boundary
//! seed, flags, and its [`Part`]s with materialized content buffers.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};

use crate::mime::{Content, Headers};

/// Well-known IMAP system flags.
pub const FLAG_SEEN: &str = "\\Seen";
pub const FLAG_ANSWERED: &str = "\\Answered";
pub const FLAG_FLAGGED: &str = "\\Flagged";
pub const FLAG_DELETED: &str = "\\Deleted";
pub const FLAG_DRAFT: &str = "\\Draft";
pub const FLAG_RECENT: &str = "\\Recent";

/// Set of flag labels with a stable sorted order and the `{"<flag>":1}`
/// JSON persistence form.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlagSet(BTreeSet<String>);

impl FlagSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_iter<I: IntoIterator<Item = S>, S: Into<String>>(flags: I) -> Self {
        Self(flags.into_iter().map(Into::into).collect())
    }

    pub fn contains(&self, flag: &str) -> bool {
        self.0.contains(flag)
    }

    pub fn insert(&mut self, flag: impl Into<String>) -> bool {
        self.0.insert(flag.into())
    }

    pub fn remove(&mut self, flag: &str) -> bool {
        self.0.remove(flag)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Canonical textual form: a JSON object mapping each flag to 1, keys
    /// in sorted order. Stable for equal sets.
    pub fn to_json(&self) -> String {
        let mut map = serde_json::Map::new();
        for flag in &self.0 {
            map.insert(flag.clone(), serde_json::Value::from(1));
        }
        serde_json::Value::Object(map).to_string()
    }

    /// Parse the persistence form; unknown shapes yield the empty set.
    pub fn from_json(s: &str) -> Self {
        let mut set = BTreeSet::new();
        if let Ok(serde_json::Value::Object(map)) = serde_json::from_str(s) {
            for (key, _) in map {
                set.insert(key);
            }
        }
        Self(set)
    }
}

/// One MIME leaf. Exactly one role applies: body (`is_body`), attachment
/// (`is_attachment`), or related (neither, with a Content-ID).
#[derive(Debug)]
pub struct Part {
    /// Contiguous from 0 within the owning message.
    pub part_num: u32,
    /// Filename, for attachments that carry one.
    pub name: Option<String>,
    pub is_body: bool,
    pub is_attachment: bool,
    /// Stored-content gzip decision; `content` itself is always decoded.
    pub is_compressed: bool,
    pub compressed_size: Option<u64>,
    /// Lowercase `primary/sub`.
    pub content_type: String,
    /// Bare `local@domain`, no angle brackets.
    pub content_id: Option<String>,
    /// Decoded content, position 0.
    pub content: Content,
    /// Row id in the blobs store once persisted.
    pub blob_id: Option<i64>,
    /// Preset Content-Transfer-Encoding for the rebuild, when the source
    /// declared one worth keeping.
    pub cte: Option<String>,
    /// Decoded content size in bytes.
    pub ct_size: u64,
    /// Line count of the decoded content.
    pub ct_lines: u32,
}

impl Part {
    pub fn is_related(&self) -> bool {
        !self.is_body && !self.is_attachment
    }
}

/// A decoded email: ordered headers, reproducible-boundary seed, flags,
/// parts, and identity assigned at storage time.
#[derive(Debug)]
pub struct Msg {
    /// Row id once stored; 0 before.
    pub id: i64,
    pub headers: Headers,
    /// Drives boundary generation so rebuilds are byte-stable.
    pub seed: u64,
    pub date: DateTime<Utc>,
    pub flags: FlagSet,
    pub parts: Vec<Part>,
    /// Size of the canonical wire form.
    pub encoded_size: u64,
    /// SHA-256 over the raw input the message was cleaved from.
    pub raw_hash: [u8; 32],
}

impl Msg {
    /// Body parts in part order.
    pub fn bodies(&self) -> impl Iterator<Item = &Part> {
        self.parts.iter().filter(|p| p.is_body)
    }

    pub fn attachments(&self) -> impl Iterator<Item = &Part> {
        self.parts.iter().filter(|p| p.is_attachment)
    }

    pub fn related(&self) -> impl Iterator<Item = &Part> {
        self.parts.iter().filter(|p| p.is_related())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_codec_is_sorted_and_stable() {
        let mut flags = FlagSet::new();
        flags.insert(FLAG_SEEN);
        flags.insert("custom");
        flags.insert(FLAG_DELETED);
        assert_eq!(
            flags.to_json(),
            "{\"\\\\Deleted\":1,\"\\\\Seen\":1,\"custom\":1}"
        );
        let back = FlagSet::from_json(&flags.to_json());
        assert_eq!(back, flags);
    }

    #[test]
    fn from_json_tolerates_garbage() {
        assert!(FlagSet::from_json("not json").is_empty());
        assert!(FlagSet::from_json("[1,2]").is_empty());
    }

    #[test]
    fn set_semantics() {
        let mut flags = FlagSet::new();
        assert!(flags.insert(FLAG_SEEN));
        assert!(!flags.insert(FLAG_SEEN));
        assert!(flags.contains(FLAG_SEEN));
        assert!(flags.remove(FLAG_SEEN));
        assert!(flags.is_empty());
    }
}
