/*
 * cleave.rs
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

//! The cleaver: decompose a wire message into a [`Msg`] with decoded,
//! classified parts. Nothing is discarded on success; every leaf lands in
//! exactly one role (body, related, attachment).

use std::fmt;
use std::io::{self, Write};

use chrono::{DateTime, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};

use super::base64::b64_decode;
use super::build::encoded_size;
use super::content::Content;
use super::content_disposition::parse_disposition;
use super::content_id::parse_content_id;
use super::content_type::parse_media_type;
use super::header::Headers;
use super::quoted_printable::qp_decode;
use crate::msg::{FlagSet, Msg, Part};

#[derive(Debug)]
pub enum CleaveError {
    /// Structurally unusable MIME: bad media-type parameters, missing
    /// boundary, truncated multipart, unknown transfer encoding.
    Malformed(String),
    Io(io::Error),
}

impl fmt::Display for CleaveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CleaveError::Malformed(m) => write!(f, "malformed message: {}", m),
            CleaveError::Io(e) => write!(f, "i/o: {}", e),
        }
    }
}

impl std::error::Error for CleaveError {}

impl From<io::Error> for CleaveError {
    fn from(e: io::Error) -> Self {
        CleaveError::Io(e)
    }
}

/// Content types that gzip cannot improve.
const INCOMPRESSIBLE: &[&str] = &[
    "image/jpeg",
    "image/png",
    "image/gif",
    "application/zip",
    "application/gzip",
    "application/x-gtar",
    "application/x-rar-compressed",
];

/// Parts below this size are stored uncompressed regardless of type.
const COMPRESS_MIN_SIZE: usize = 32768;
/// Compress only when compressed/original falls below this.
const COMPRESS_MAX_RATIO: f64 = 0.9;

/// Decode `raw` into a structured message. The returned [`Msg`] carries
/// the raw hash, the boundary seed derived from it, decoded part buffers,
/// and the canonical encoded size.
pub fn cleave(raw: &[u8]) -> Result<Msg, CleaveError> {
    let mut hasher = Sha256::new();
    hasher.update(raw);
    let raw_hash: [u8; 32] = hasher.finalize().into();
    let seed = u64::from_le_bytes(raw_hash[..8].try_into().expect("8 hash bytes"));

    let (headers, body_start) =
        Headers::parse(raw).map_err(|e| CleaveError::Malformed(e.to_string()))?;
    let date = headers
        .get_str("Date")
        .and_then(|d| DateTime::parse_from_rfc2822(d.trim()).ok())
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);

    let mut state = Classify { body_assigned: false };
    let mut leaves = Vec::new();
    walk(&headers, &raw[body_start..], Parent::Top, 0, &mut state, &mut leaves)?;

    let mut parts = Vec::with_capacity(leaves.len());
    for (num, leaf) in leaves.into_iter().enumerate() {
        parts.push(into_part(num as u32, leaf)?);
    }
    // Every message gets a body: promote the first text part when
    // classification assigned none, and failing that the first leaf
    // (the positional default for a fully opaque mixed message).
    if !parts.iter().any(|p| p.is_body) {
        let promote = parts
            .iter()
            .position(|p| p.content_type.starts_with("text/"))
            .unwrap_or(0);
        if let Some(p) = parts.get_mut(promote) {
            p.is_body = true;
            p.is_attachment = false;
        }
    }

    let mut msg = Msg {
        id: 0,
        headers,
        seed,
        date,
        flags: FlagSet::new(),
        parts,
        encoded_size: 0,
        raw_hash,
    };
    msg.encoded_size = encoded_size(&mut msg).map_err(|e| CleaveError::Malformed(e.to_string()))?;
    Ok(msg)
}

/// Immediate multipart context a leaf is classified under.
#[derive(Clone, Copy, PartialEq)]
enum Parent {
    Top,
    Alternative,
    Related,
    Mixed,
}

struct Classify {
    body_assigned: bool,
}

/// A decoded leaf before numbering.
struct Leaf {
    content_type: String,
    content_id: Option<String>,
    name: Option<String>,
    data: Vec<u8>,
    is_body: bool,
    is_attachment: bool,
}

fn walk(
    headers: &Headers,
    body: &[u8],
    parent: Parent,
    index: usize,
    state: &mut Classify,
    out: &mut Vec<Leaf>,
) -> Result<(), CleaveError> {
    let media = headers
        .get_str("Content-Type")
        .and_then(|v| parse_media_type(&v));
    if headers.get("Content-Type").is_some() && media.is_none() {
        return Err(CleaveError::Malformed("bad Content-Type parameters".into()));
    }

    if let Some(mt) = media.as_ref().filter(|mt| mt.is_primary("multipart")) {
        let boundary = mt
            .param("boundary")
            .filter(|b| !b.is_empty())
            .ok_or_else(|| CleaveError::Malformed("multipart without boundary".into()))?;
        let child_parent = if mt.is("multipart", "alternative") {
            Parent::Alternative
        } else if mt.is("multipart", "related") {
            Parent::Related
        } else {
            Parent::Mixed
        };
        let entities = split_multipart(body, boundary)?;
        for (i, entity) in entities.iter().enumerate() {
            let (entity_headers, entity_body) = Headers::parse(entity)
                .map_err(|e| CleaveError::Malformed(e.to_string()))?;
            walk(
                &entity_headers,
                &entity[entity_body..],
                child_parent,
                i,
                state,
                out,
            )?;
        }
        return Ok(());
    }

    // Leaf entity: decode and classify.
    let content_type = media
        .as_ref()
        .map(|mt| mt.essence())
        .unwrap_or_else(|| "text/plain".to_string());
    let data = decode_cte(headers, body)?;
    let disposition = headers
        .get_str("Content-Disposition")
        .and_then(|v| parse_disposition(&v));
    let name = disposition
        .as_ref()
        .and_then(|d| d.filename().map(str::to_string))
        .or_else(|| {
            media
                .as_ref()
                .and_then(|mt| mt.param("name").map(str::to_string))
        });
    let content_id = headers
        .get_str("Content-ID")
        .and_then(|v| parse_content_id(&v));

    let explicit_attachment = disposition.as_ref().map_or(false, |d| d.is_attachment());
    let (is_body, is_attachment) = match parent {
        Parent::Top => (true, false),
        Parent::Alternative => (true, false),
        Parent::Related => {
            if index == 0 {
                (true, false)
            } else if content_id.is_some() {
                (false, false)
            } else {
                (false, true)
            }
        }
        Parent::Mixed => {
            if explicit_attachment || name.is_some() {
                (false, true)
            } else if !state.body_assigned && content_type.starts_with("text/") {
                (true, false)
            } else {
                (false, true)
            }
        }
    };
    if is_body {
        state.body_assigned = true;
    }
    out.push(Leaf {
        content_type,
        content_id,
        name,
        data,
        is_body,
        is_attachment,
    });
    Ok(())
}

fn decode_cte(headers: &Headers, body: &[u8]) -> Result<Vec<u8>, CleaveError> {
    let cte = headers
        .get_str("Content-Transfer-Encoding")
        .map(|v| v.trim().to_ascii_lowercase());
    match cte.as_deref() {
        None | Some("") | Some("7bit") | Some("8bit") => Ok(body.to_vec()),
        Some("quoted-printable") => Ok(qp_decode(body)),
        Some("base64") => Ok(b64_decode(body)),
        Some(other) => Err(CleaveError::Malformed(format!(
            "unknown transfer encoding {}",
            other
        ))),
    }
}

/// Split a multipart body into entity slices. The CRLF preceding each
/// delimiter belongs to the delimiter, not the entity.
fn split_multipart<'a>(body: &'a [u8], boundary: &str) -> Result<Vec<&'a [u8]>, CleaveError> {
    let mut entities = Vec::new();
    let mut entity_start: Option<usize> = None;
    let mut pos = 0;
    let mut closed = false;

    while pos < body.len() {
        let line_start = pos;
        let line_end = match body[pos..].iter().position(|&b| b == b'\n') {
            Some(i) => pos + i + 1,
            None => body.len(),
        };
        let line = trim_line(&body[line_start..line_end]);
        match boundary_kind(line, boundary) {
            Some(closing) => {
                if let Some(start) = entity_start.take() {
                    entities.push(strip_preceding_crlf(body, start, line_start));
                }
                if closing {
                    closed = true;
                    break;
                }
                entity_start = Some(line_end);
            }
            None => {}
        }
        pos = line_end;
    }
    if !closed {
        return Err(CleaveError::Malformed("unterminated multipart".into()));
    }
    if entities.is_empty() {
        return Err(CleaveError::Malformed("multipart with no parts".into()));
    }
    Ok(entities)
}

/// `Some(false)` for a delimiter, `Some(true)` for the closing delimiter.
fn boundary_kind(line: &[u8], boundary: &str) -> Option<bool> {
    let rest = line.strip_prefix(b"--")?;
    let rest = rest.strip_prefix(boundary.as_bytes())?;
    if rest.is_empty() {
        Some(false)
    } else if rest == b"--" {
        Some(true)
    } else {
        None
    }
}

fn strip_preceding_crlf(body: &[u8], start: usize, end: usize) -> &[u8] {
    let mut end = end;
    if end > start && body[end - 1] == b'\n' {
        end -= 1;
        if end > start && body[end - 1] == b'\r' {
            end -= 1;
        }
    }
    &body[start..end]
}

fn trim_line(line: &[u8]) -> &[u8] {
    let mut end = line.len();
    while end > 0 && matches!(line[end - 1], b'\r' | b'\n' | b' ' | b'\t') {
        end -= 1;
    }
    &line[..end]
}

fn into_part(part_num: u32, leaf: Leaf) -> Result<Part, CleaveError> {
    let ct_size = leaf.data.len() as u64;
    let ct_lines = count_lines(&leaf.data);
    let (is_compressed, compressed_size) = compression_decision(&leaf.content_type, &leaf.data)?;
    Ok(Part {
        part_num,
        name: leaf.name,
        is_body: leaf.is_body,
        is_attachment: leaf.is_attachment,
        is_compressed,
        compressed_size,
        content_type: leaf.content_type,
        content_id: leaf.content_id,
        content: Content::from_vec(leaf.data),
        blob_id: None,
        cte: None,
        ct_size,
        ct_lines,
    })
}

fn count_lines(data: &[u8]) -> u32 {
    let full = data.iter().filter(|&&b| b == b'\n').count() as u32;
    if !data.is_empty() && data.last() != Some(&b'\n') {
        full + 1
    } else {
        full
    }
}

/// Whether the stored blob for this content should be gzipped, and the
/// resulting size when it should.
fn compression_decision(
    content_type: &str,
    data: &[u8],
) -> Result<(bool, Option<u64>), CleaveError> {
    if data.len() < COMPRESS_MIN_SIZE {
        return Ok((false, None));
    }
    if INCOMPRESSIBLE.iter().any(|t| *t == content_type) {
        return Ok((false, None));
    }
    let mut enc = GzEncoder::new(Vec::new(), Compression::default());
    enc.write_all(data)?;
    let compressed = enc.finish()?;
    let ratio = compressed.len() as f64 / data.len() as f64;
    if ratio < COMPRESS_MAX_RATIO {
        Ok((true, Some(compressed.len() as u64)))
    } else {
        Ok((false, None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn part_bytes(msg: &mut Msg, num: usize) -> Vec<u8> {
        msg.parts[num].content.read_all().unwrap()
    }

    #[test]
    fn bare_text_message() {
        let raw = b"From: a@x\r\nSubject: hi\r\n\r\nHello there.\r\n";
        let mut msg = cleave(raw).unwrap();
        assert_eq!(msg.parts.len(), 1);
        assert!(msg.parts[0].is_body);
        assert_eq!(msg.parts[0].content_type, "text/plain");
        assert_eq!(part_bytes(&mut msg, 0), b"Hello there.\r\n");
        assert!(msg.encoded_size > 0);
    }

    #[test]
    fn seed_comes_from_raw_hash() {
        let raw = b"From: a@x\r\n\r\nbody\r\n";
        let msg = cleave(raw).unwrap();
        let mut hasher = Sha256::new();
        hasher.update(raw);
        let hash: [u8; 32] = hasher.finalize().into();
        assert_eq!(msg.raw_hash, hash);
        assert_eq!(msg.seed, u64::from_le_bytes(hash[..8].try_into().unwrap()));
    }

    #[test]
    fn uppercase_quoted_printable() {
        let raw = b"Content-Type: text/plain\r\nContent-Transfer-Encoding: QUOTED-PRINTABLE\r\n\r\npkgf=\r\nort.com";
        let mut msg = cleave(raw).unwrap();
        assert_eq!(msg.parts.len(), 1);
        assert_eq!(msg.parts[0].content_type, "text/plain");
        assert_eq!(part_bytes(&mut msg, 0), b"pkgfort.com");
    }

    #[test]
    fn alternative_bodies() {
        let raw = b"MIME-Version: 1.0\r\n\
Content-Type: multipart/alternative; boundary=sep\r\n\r\n\
--sep\r\nContent-Type: text/plain\r\n\r\nplain\r\n\
--sep\r\nContent-Type: text/html\r\n\r\n<p>html</p>\r\n\
--sep--\r\n";
        let mut msg = cleave(raw).unwrap();
        assert_eq!(msg.parts.len(), 2);
        assert!(msg.parts[0].is_body && msg.parts[1].is_body);
        assert_eq!(part_bytes(&mut msg, 0), b"plain");
        assert_eq!(part_bytes(&mut msg, 1), b"<p>html</p>");
    }

    #[test]
    fn related_with_inline_image() {
        let raw = b"Content-Type: multipart/related; boundary=rel\r\n\r\n\
--rel\r\nContent-Type: text/html\r\n\r\n<img src=\"cid:img1@x\">\r\n\
--rel\r\nContent-Type: image/png\r\nContent-ID: <img1@x>\r\n\
Content-Transfer-Encoding: base64\r\n\r\naGk=\r\n\
--rel--\r\n";
        let mut msg = cleave(raw).unwrap();
        assert_eq!(msg.parts.len(), 2);
        assert!(msg.parts[0].is_body);
        assert!(msg.parts[1].is_related());
        assert_eq!(msg.parts[1].content_id.as_deref(), Some("img1@x"));
        assert_eq!(part_bytes(&mut msg, 1), b"hi");
    }

    #[test]
    fn mixed_with_attachment() {
        let raw = b"Content-Type: multipart/mixed; boundary=mix\r\n\r\n\
--mix\r\nContent-Type: text/plain\r\n\r\nsee attached\r\n\
--mix\r\nContent-Type: application/pdf\r\n\
Content-Disposition: attachment; filename=\"r.pdf\"\r\n\
Content-Transfer-Encoding: base64\r\n\r\nJVBERg==\r\n\
--mix--\r\n";
        let mut msg = cleave(raw).unwrap();
        assert_eq!(msg.parts.len(), 2);
        assert!(msg.parts[0].is_body);
        assert!(msg.parts[1].is_attachment);
        assert_eq!(msg.parts[1].name.as_deref(), Some("r.pdf"));
        assert_eq!(part_bytes(&mut msg, 1), b"%PDF");
    }

    #[test]
    fn nested_alternative_inside_mixed() {
        let raw = b"Content-Type: multipart/mixed; boundary=outer\r\n\r\n\
--outer\r\nContent-Type: multipart/alternative; boundary=inner\r\n\r\n\
--inner\r\nContent-Type: text/plain\r\n\r\np\r\n\
--inner\r\nContent-Type: text/html\r\n\r\n<i>h</i>\r\n\
--inner--\r\n\
--outer\r\nContent-Type: application/octet-stream\r\n\
Content-Disposition: attachment; filename=x.bin\r\n\r\ndata\r\n\
--outer--\r\n";
        let msg = cleave(raw).unwrap();
        assert_eq!(msg.parts.len(), 3);
        assert!(msg.parts[0].is_body && msg.parts[1].is_body);
        assert!(msg.parts[2].is_attachment);
        // Part numbering is contiguous from zero.
        for (i, p) in msg.parts.iter().enumerate() {
            assert_eq!(p.part_num, i as u32);
        }
    }

    #[test]
    fn mixed_without_text_promotes_first_leaf() {
        // No text leaves, no dispositions, no filenames: leaf 0 still
        // becomes the body, nothing is lost.
        let raw = b"Content-Type: multipart/mixed; boundary=m\r\n\r\n\
--m\r\nContent-Type: application/octet-stream\r\n\
Content-Transfer-Encoding: base64\r\n\r\naGk=\r\n\
--m\r\nContent-Type: application/pdf\r\n\
Content-Transfer-Encoding: base64\r\n\r\nJVBERg==\r\n\
--m--\r\n";
        let msg = cleave(raw).unwrap();
        assert_eq!(msg.parts.len(), 2);
        assert!(msg.parts[0].is_body);
        assert!(!msg.parts[0].is_attachment);
        assert!(msg.parts[1].is_attachment);
    }

    #[test]
    fn unknown_transfer_encoding_rejected() {
        let raw = b"Content-Transfer-Encoding: uuencode\r\n\r\ndata\r\n";
        assert!(matches!(cleave(raw), Err(CleaveError::Malformed(_))));
    }

    #[test]
    fn missing_boundary_rejected() {
        let raw = b"Content-Type: multipart/mixed\r\n\r\n--x\r\n\r\nhm\r\n--x--\r\n";
        assert!(matches!(cleave(raw), Err(CleaveError::Malformed(_))));
    }

    #[test]
    fn unterminated_multipart_rejected() {
        let raw = b"Content-Type: multipart/mixed; boundary=b\r\n\r\n\
--b\r\nContent-Type: text/plain\r\n\r\ntruncated";
        assert!(matches!(cleave(raw), Err(CleaveError::Malformed(_))));
    }

    #[test]
    fn small_parts_never_compressed() {
        let raw = b"From: a@x\r\n\r\nshort body\r\n";
        let msg = cleave(raw).unwrap();
        assert!(!msg.parts[0].is_compressed);
        assert!(msg.parts[0].compressed_size.is_none());
    }

    #[test]
    fn large_text_part_compressed() {
        let mut raw = b"Content-Type: text/plain\r\n\r\n".to_vec();
        for _ in 0..4000 {
            raw.extend_from_slice(b"the same ten bytes over and over again \r\n");
        }
        let msg = cleave(&raw).unwrap();
        assert!(msg.parts[0].is_compressed);
        let compressed = msg.parts[0].compressed_size.unwrap();
        assert!(compressed < msg.parts[0].ct_size);
    }

    #[test]
    fn large_jpeg_never_compressed() {
        let mut raw = b"Content-Type: multipart/mixed; boundary=m\r\n\r\n\
--m\r\nContent-Type: text/plain\r\n\r\nbody\r\n\
--m\r\nContent-Type: image/jpeg\r\nContent-Disposition: attachment; filename=p.jpg\r\n\r\n"
            .to_vec();
        raw.extend(std::iter::repeat(b'j').take(40000));
        raw.extend_from_slice(b"\r\n--m--\r\n");
        let msg = cleave(&raw).unwrap();
        assert_eq!(msg.parts[1].content_type, "image/jpeg");
        assert!(!msg.parts[1].is_compressed);
    }

    #[test]
    fn ct_lines_counts_decoded_lines() {
        let raw = b"From: a@x\r\n\r\none\r\ntwo\r\nthree";
        let msg = cleave(raw).unwrap();
        assert_eq!(msg.parts[0].ct_lines, 3);
        assert_eq!(msg.parts[0].ct_size, 15);
    }
}
