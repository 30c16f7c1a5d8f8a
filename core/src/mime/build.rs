/*
 * build.rs
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

//! The builder: reassemble a canonical wire message from a [`Msg`]. The
//! output is byte-stable for a fixed seed; boundaries come from a seeded
//! RNG so rebuilding the same message always frames it identically.
//!
//! `encode_msg` reads every part content to EOF and rewinds it before
//! returning; callers keep ownership of the buffers.

use std::fmt;
use std::io::{self, Write};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

use super::base64::b64_encode_wrapped;
use super::content::ContentWriter;
use super::header::Headers;
use super::quoted_printable::qp_encode;
use crate::dkim::DkimSigner;
use crate::msg::{Msg, Part};

#[derive(Debug)]
pub enum BuildError {
    Io(io::Error),
    Dkim(crate::dkim::DkimError),
}

impl fmt::Display for BuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildError::Io(e) => write!(f, "i/o: {}", e),
            BuildError::Dkim(e) => write!(f, "dkim: {}", e),
        }
    }
}

impl std::error::Error for BuildError {}

impl From<io::Error> for BuildError {
    fn from(e: io::Error) -> Self {
        BuildError::Io(e)
    }
}

/// Shape of the outgoing MIME tree. Leaves index into `msg.parts`; the
/// same plan drives both encoding and BODYSTRUCTURE reporting.
#[derive(Debug, Clone, PartialEq)]
pub enum PartNode {
    Empty,
    Leaf(usize),
    Multipart {
        subtype: &'static str,
        children: Vec<PartNode>,
    },
}

/// Arrange parts into the canonical tree:
/// several bodies → `alternative`; an HTML body with related parts →
/// `related` (body first); anything plus attachments → `mixed`; a lone
/// body needs no wrapper.
pub fn plan_tree(msg: &Msg) -> PartNode {
    let bodies: Vec<usize> = indices(msg, |p| p.is_body);
    let related: Vec<usize> = indices(msg, |p| p.is_related());
    let attachments: Vec<usize> = indices(msg, |p| p.is_attachment);

    let body_core = match bodies.len() {
        0 => None,
        1 => Some(PartNode::Leaf(bodies[0])),
        _ => Some(PartNode::Multipart {
            subtype: "alternative",
            children: bodies.iter().map(|&i| PartNode::Leaf(i)).collect(),
        }),
    };
    let body_tree = if related.is_empty() {
        body_core
    } else {
        let mut children = Vec::with_capacity(1 + related.len());
        if let Some(core) = body_core {
            children.push(core);
        }
        children.extend(related.iter().map(|&i| PartNode::Leaf(i)));
        Some(PartNode::Multipart {
            subtype: "related",
            children,
        })
    };

    if attachments.is_empty() {
        body_tree.unwrap_or(PartNode::Empty)
    } else {
        let mut children = Vec::with_capacity(1 + attachments.len());
        if let Some(tree) = body_tree {
            children.push(tree);
        }
        children.extend(attachments.iter().map(|&i| PartNode::Leaf(i)));
        PartNode::Multipart {
            subtype: "mixed",
            children,
        }
    }
}

fn indices(msg: &Msg, pred: impl Fn(&Part) -> bool) -> Vec<usize> {
    msg.parts
        .iter()
        .enumerate()
        .filter(|(_, p)| pred(p))
        .map(|(i, _)| i)
        .collect()
}

/// Encode `msg` to `out` and return the byte count. Rewrites
/// `MIME-Version` and the root `Content-Type` on `msg.headers`; when
/// `signer` is given and no `DKIM-Signature` exists yet, signs the
/// finished body and prepends the signature header.
pub fn encode_msg(
    msg: &mut Msg,
    out: &mut dyn Write,
    signer: Option<&DkimSigner>,
) -> Result<u64, BuildError> {
    let plan = plan_tree(msg);
    let mut boundaries = BoundarySource::new(msg.seed);

    // Assemble everything below the header section first; the signature
    // (when requested) covers this exact byte stream.
    let mut body = ContentWriter::new();
    let root_content_type = match &plan {
        PartNode::Empty => {
            msg_content_type_value("text/plain", None)
        }
        PartNode::Leaf(i) => {
            let part = &mut msg.parts[*i];
            let data = part.content.read_all()?;
            let cte = transfer_encoding(part, &data);
            msg.headers.set("Content-Transfer-Encoding", cte.as_bytes());
            write_encoded(&mut body, cte, &data)?;
            msg_content_type_value(&msg.parts[*i].content_type, None)
        }
        PartNode::Multipart { .. } => {
            // A stale root transfer encoding would misdescribe the wrapper.
            msg.headers.del("Content-Transfer-Encoding");
            write_multipart(&plan, msg, &mut body, &mut boundaries)?
        }
    };
    msg.headers.set("MIME-Version", "1.0".as_bytes());
    msg.headers.set("Content-Type", root_content_type.as_bytes());

    let mut body = body.finish()?;
    if let Some(signer) = signer {
        if msg.headers.get("DKIM-Signature").is_none() {
            let value = signer
                .sign(&msg.headers, &mut body)
                .map_err(BuildError::Dkim)?;
            msg.headers.prepend("DKIM-Signature", value.into_bytes());
        }
    }

    let mut counted = CountingWriter { inner: out, count: 0 };
    msg.headers.encode(&mut counted)?;
    counted.write_all(b"\r\n")?;
    io::copy(&mut body, &mut counted)?;
    for part in &mut msg.parts {
        part.content.reset()?;
    }
    Ok(counted.count)
}

/// Size of the canonical wire form; contents are rewound afterwards.
pub fn encoded_size(msg: &mut Msg) -> Result<u64, BuildError> {
    encode_msg(msg, &mut io::sink(), None)
}

struct CountingWriter<'a> {
    inner: &'a mut dyn Write,
    count: u64,
}

impl Write for CountingWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write_all(buf)?;
        self.count += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Boundaries drawn in pre-order from the seeded RNG: 12 bytes each,
/// URL-safe base64 between `.` bookends so a boundary can never occur
/// inside base64 body content.
struct BoundarySource {
    rng: StdRng,
}

impl BoundarySource {
    fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    fn next(&mut self) -> String {
        let mut bytes = [0u8; 12];
        self.rng.fill_bytes(&mut bytes);
        format!(".{}.", URL_SAFE_NO_PAD.encode(bytes))
    }
}

/// Write a multipart node; returns the Content-Type value that describes
/// it (for the parent's header block or the message root).
fn write_multipart(
    node: &PartNode,
    msg: &mut Msg,
    out: &mut dyn Write,
    boundaries: &mut BoundarySource,
) -> Result<String, BuildError> {
    let (subtype, children) = match node {
        PartNode::Multipart { subtype, children } => (*subtype, children),
        _ => unreachable!("write_multipart on non-multipart node"),
    };
    let boundary = boundaries.next();
    let content_type = format!("multipart/{}; boundary=\"{}\"", subtype, boundary);

    let mut first = true;
    for child in children {
        if first {
            write!(out, "--{}\r\n", boundary)?;
            first = false;
        } else {
            write!(out, "\r\n--{}\r\n", boundary)?;
        }
        match child {
            PartNode::Leaf(i) => write_leaf(msg, *i, out)?,
            PartNode::Multipart { .. } => {
                // Recurse into a temp buffer so the child's Content-Type
                // (with its own boundary) can head its block.
                let mut inner = ContentWriter::new();
                let child_ct = write_multipart(child, msg, &mut inner, boundaries)?;
                write!(out, "Content-Type: {}\r\n\r\n", child_ct)?;
                let mut inner = inner.finish()?;
                io::copy(&mut inner, out)?;
            }
            PartNode::Empty => unreachable!("empty node inside multipart"),
        }
    }
    write!(out, "\r\n--{}--\r\n", boundary)?;
    Ok(content_type)
}

fn write_leaf(msg: &mut Msg, index: usize, out: &mut dyn Write) -> Result<(), BuildError> {
    let part = &mut msg.parts[index];
    let data = part.content.read_all()?;
    let cte = transfer_encoding(part, &data);

    let name = part.name.clone();
    write!(
        out,
        "Content-Type: {}\r\n",
        msg_content_type_value(&part.content_type, name.as_deref())
    )?;
    let disposition = if part.is_attachment {
        match &name {
            Some(n) => format!("attachment; filename=\"{}\"", quote_param(n)),
            None => "attachment".to_string(),
        }
    } else {
        match &name {
            Some(n) => format!("inline; filename=\"{}\"", quote_param(n)),
            None => "inline".to_string(),
        }
    };
    write!(out, "Content-Disposition: {}\r\n", disposition)?;
    if let Some(cid) = &part.content_id {
        write!(out, "Content-ID: <{}>\r\n", cid)?;
    }
    write!(out, "Content-Transfer-Encoding: {}\r\n\r\n", cte)?;
    write_encoded(out, cte, &data)?;
    Ok(())
}

fn msg_content_type_value(content_type: &str, name: Option<&str>) -> String {
    let mut value = content_type.to_string();
    if content_type == "text/plain" || content_type == "text/html" {
        value.push_str("; charset=\"UTF-8\"");
    }
    if let Some(n) = name {
        value.push_str(&format!("; name=\"{}\"", quote_param(n)));
    }
    value
}

fn quote_param(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Pick the transfer encoding unless the part presets one: `7bit` for
/// short-lined pure ASCII without NUL, `quoted-printable` for text or
/// otherwise-ASCII content, `base64` for the rest.
fn transfer_encoding(part: &Part, data: &[u8]) -> &'static str {
    if let Some(preset) = part.cte.as_deref() {
        match preset {
            "7bit" => return "7bit",
            "8bit" => return "8bit",
            "quoted-printable" => return "quoted-printable",
            "base64" => return "base64",
            _ => {}
        }
    }
    let mut line_len = 0usize;
    let mut seven_bit = true;
    let mut has_nul = false;
    let mut high_bit = false;
    for &b in data {
        if b == b'\n' {
            line_len = 0;
            continue;
        }
        line_len += 1;
        if line_len > 120 {
            seven_bit = false;
        }
        if b == 0 {
            has_nul = true;
        }
        if b >= 0x80 {
            high_bit = true;
        }
    }
    if seven_bit && !has_nul && !high_bit {
        return "7bit";
    }
    if part.content_type.starts_with("text/") || (!high_bit && !has_nul) {
        return "quoted-printable";
    }
    "base64"
}

fn write_encoded(out: &mut dyn Write, cte: &str, data: &[u8]) -> io::Result<()> {
    match cte {
        "quoted-printable" => {
            out.write_all(&qp_encode(data))?;
        }
        "base64" => {
            let mut buf = Vec::with_capacity(data.len() / 3 * 4 + 64);
            b64_encode_wrapped(data, 68, &mut buf);
            out.write_all(&buf)?;
        }
        _ => out.write_all(data)?,
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mime::cleave::cleave;

    fn encode_to_vec(msg: &mut Msg) -> Vec<u8> {
        let mut out = Vec::new();
        encode_msg(msg, &mut out, None).unwrap();
        out
    }

    #[test]
    fn deterministic_for_fixed_seed() {
        let raw = b"Content-Type: multipart/alternative; boundary=x\r\n\r\n\
--x\r\nContent-Type: text/plain\r\n\r\np\r\n\
--x\r\nContent-Type: text/html\r\n\r\n<i>h</i>\r\n\
--x--\r\n";
        let mut msg = cleave(raw).unwrap();
        let first = encode_to_vec(&mut msg);
        let second = encode_to_vec(&mut msg);
        assert_eq!(first, second);
        assert!(!first.is_empty());
    }

    #[test]
    fn encoded_size_matches_output() {
        let raw = b"From: a@x\r\nSubject: s\r\n\r\nbody line\r\n";
        let mut msg = cleave(raw).unwrap();
        let out = encode_to_vec(&mut msg);
        assert_eq!(msg.encoded_size, out.len() as u64);
    }

    #[test]
    fn bare_body_needs_no_wrapper() {
        let raw = b"From: a@x\r\n\r\njust text\r\n";
        let mut msg = cleave(raw).unwrap();
        let out = encode_to_vec(&mut msg);
        let text = String::from_utf8_lossy(&out);
        assert!(text.contains("MIME-Version: 1.0"));
        assert!(text.contains("Content-Type: text/plain; charset=\"UTF-8\""));
        assert!(!text.contains("multipart"));
        assert!(text.contains("just text"));
    }

    #[test]
    fn alternative_then_mixed_wrapping() {
        let raw = b"Content-Type: multipart/mixed; boundary=m\r\n\r\n\
--m\r\nContent-Type: multipart/alternative; boundary=a\r\n\r\n\
--a\r\nContent-Type: text/plain\r\n\r\np\r\n\
--a\r\nContent-Type: text/html\r\n\r\n<i>h</i>\r\n\
--a--\r\n\
--m\r\nContent-Type: application/pdf\r\nContent-Disposition: attachment; filename=f.pdf\r\n\r\n%PDF\r\n\
--m--\r\n";
        let mut msg = cleave(raw).unwrap();
        let plan = plan_tree(&msg);
        match &plan {
            PartNode::Multipart { subtype, children } => {
                assert_eq!(*subtype, "mixed");
                assert_eq!(children.len(), 2);
                assert!(matches!(
                    children[0],
                    PartNode::Multipart { subtype: "alternative", .. }
                ));
            }
            other => panic!("unexpected plan: {:?}", other),
        }
        let out = encode_to_vec(&mut msg);
        let text = String::from_utf8_lossy(&out);
        assert!(text.contains("multipart/mixed"));
        assert!(text.contains("multipart/alternative"));
        assert!(text.contains("attachment; filename=\"f.pdf\""));
    }

    #[test]
    fn html_with_related_parts() {
        let raw = b"Content-Type: multipart/related; boundary=r\r\n\r\n\
--r\r\nContent-Type: text/html\r\n\r\n<img src=\"cid:i@x\">\r\n\
--r\r\nContent-Type: image/png\r\nContent-ID: <i@x>\r\nContent-Transfer-Encoding: base64\r\n\r\naGk=\r\n\
--r--\r\n";
        let mut msg = cleave(raw).unwrap();
        assert!(matches!(
            plan_tree(&msg),
            PartNode::Multipart { subtype: "related", .. }
        ));
        let out = encode_to_vec(&mut msg);
        let text = String::from_utf8_lossy(&out);
        assert!(text.contains("multipart/related"));
        assert!(text.contains("Content-ID: <i@x>"));
    }

    #[test]
    fn rebuild_reparses_with_same_leaves() {
        let raw = b"Content-Type: multipart/mixed; boundary=m\r\n\r\n\
--m\r\nContent-Type: text/plain\r\n\r\nhello body\r\n\
--m\r\nContent-Type: application/octet-stream\r\n\
Content-Disposition: attachment; filename=d.bin\r\n\
Content-Transfer-Encoding: base64\r\n\r\nAAECAwQ=\r\n\
--m--\r\n";
        let mut msg = cleave(raw).unwrap();
        let wire = encode_to_vec(&mut msg);
        let mut again = cleave(&wire).unwrap();
        assert_eq!(again.parts.len(), msg.parts.len());
        for (a, b) in again.parts.iter_mut().zip(msg.parts.iter_mut()) {
            assert_eq!(a.content_type, b.content_type);
            assert_eq!(a.is_body, b.is_body);
            assert_eq!(a.is_attachment, b.is_attachment);
            assert_eq!(a.content.read_all().unwrap(), b.content.read_all().unwrap());
        }
    }

    #[test]
    fn boundaries_derived_from_seed() {
        let raw = b"Content-Type: multipart/alternative; boundary=q\r\n\r\n\
--q\r\nContent-Type: text/plain\r\n\r\na\r\n\
--q\r\nContent-Type: text/html\r\n\r\nb\r\n\
--q--\r\n";
        let mut msg = cleave(raw).unwrap();
        let out1 = encode_to_vec(&mut msg);
        msg.seed ^= 0xdead_beef;
        let out2 = encode_to_vec(&mut msg);
        assert_ne!(out1, out2);
        // Bookended URL-safe boundary appears in the output.
        let text = String::from_utf8_lossy(&out2);
        let marker = text
            .lines()
            .find(|l| l.starts_with("Content-Type: multipart/alternative"))
            .unwrap();
        assert!(marker.contains("boundary=\".") && marker.contains(".\""));
    }

    #[test]
    fn cte_selection() {
        let raw = b"From: a@x\r\n\r\nplain ascii\r\n";
        let mut msg = cleave(raw).unwrap();
        let text = String::from_utf8_lossy(&encode_to_vec(&mut msg)).into_owned();
        assert!(text.contains("Content-Transfer-Encoding: 7bit"));

        let raw = "From: a@x\r\nContent-Type: text/plain\r\n\r\ncafé au lait\r\n".as_bytes();
        let mut msg = cleave(raw).unwrap();
        let text = String::from_utf8_lossy(&encode_to_vec(&mut msg)).into_owned();
        assert!(text.contains("Content-Transfer-Encoding: quoted-printable"));
        assert!(text.contains("caf=C3=A9"));
    }

    #[test]
    fn binary_attachment_uses_base64() {
        let raw = b"Content-Type: multipart/mixed; boundary=m\r\n\r\n\
--m\r\nContent-Type: text/plain\r\n\r\nb\r\n\
--m\r\nContent-Type: application/octet-stream\r\n\
Content-Disposition: attachment; filename=z\r\n\
Content-Transfer-Encoding: base64\r\n\r\n/wD/AP8A\r\n\
--m--\r\n";
        let mut msg = cleave(raw).unwrap();
        let out = encode_to_vec(&mut msg);
        let text = String::from_utf8_lossy(&out);
        assert!(text.contains("Content-Transfer-Encoding: base64"));
        // Re-cleave restores the original bytes.
        let mut again = cleave(&out).unwrap();
        let attachment = again.parts.iter_mut().find(|p| p.is_attachment).unwrap();
        assert_eq!(
            attachment.content.read_all().unwrap(),
            vec![0xff, 0x00, 0xff, 0x00, 0xff, 0x00]
        );
    }
}
