/*
 * mod.rs
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

//! MIME: header model, transfer encodings, the cleaver (wire message →
//! structured [`crate::msg::Msg`]) and the builder (the reverse, with
//! deterministic boundaries).

mod base64;
mod build;
mod cleave;
mod content;
mod content_disposition;
mod content_id;
mod content_type;
mod header;
mod quoted_printable;
mod rfc2047;

pub use base64::{b64_decode, b64_encode_wrapped};
pub use build::{encode_msg, encoded_size, plan_tree, BuildError, PartNode};
pub use cleave::{cleave, CleaveError};
pub use content::{Content, ContentWriter};
pub use content_disposition::{parse_disposition, Disposition};
pub use content_id::parse_content_id;
pub use content_type::{is_token, parse_media_type, MediaType};
pub use header::{canonical_key, HeaderError, Headers};
pub use quoted_printable::{qp_decode, qp_encode};
pub use rfc2047::decode_encoded_words;
