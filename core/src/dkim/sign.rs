/*
 * sign.rs
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

//! Signing side: `rsa-sha256` over `relaxed/relaxed`. The builder calls
//! [`DkimSigner::sign`] with the outgoing headers and the finished body
//! stream; the returned value goes into a prepended `DKIM-Signature`.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rsa::{Pkcs1v15Sign, RsaPrivateKey};
use sha2::{Digest, Sha256};

use super::canon::{canonical_body, relaxed_header_line};
use super::{Canon, DkimError};
use crate::mime::{Content, Headers};

/// Headers included in `h=` when present on the message.
const DEFAULT_SIGNED_HEADERS: &[&str] = &[
    "From",
    "To",
    "Cc",
    "Reply-To",
    "Subject",
    "Date",
    "Message-ID",
    "In-Reply-To",
    "References",
    "MIME-Version",
    "Content-Type",
];

/// Base64 in `b=` folds with a space after this many characters.
const B_FOLD_WIDTH: usize = 66;

pub struct DkimSigner {
    domain: String,
    selector: String,
    key: RsaPrivateKey,
    signed_headers: Vec<String>,
}

impl DkimSigner {
    pub fn new(domain: impl Into<String>, selector: impl Into<String>, key: RsaPrivateKey) -> Self {
        Self {
            domain: domain.into(),
            selector: selector.into(),
            key,
            signed_headers: DEFAULT_SIGNED_HEADERS
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }

    pub fn with_signed_headers(mut self, headers: Vec<String>) -> Self {
        self.signed_headers = headers;
        self
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Produce the `DKIM-Signature` value for `headers` + `body`. The body
    /// stream is read to EOF and rewound.
    pub fn sign(&self, headers: &Headers, body: &mut Content) -> Result<String, DkimError> {
        let body_bytes = body
            .read_all()
            .map_err(|e| DkimError::Rsa(e.to_string()))?;
        let canonical = canonical_body(&body_bytes, Canon::Relaxed);
        let bh = STANDARD.encode(Sha256::digest(&canonical));

        // Only headers actually present make it into h=.
        let mut h_names: Vec<&str> = Vec::new();
        for name in &self.signed_headers {
            if headers.get(name).is_some() {
                h_names.push(name.as_str());
            }
        }
        let h_joined = h_names
            .iter()
            .map(|n| n.to_ascii_lowercase())
            .collect::<Vec<_>>()
            .join(":");

        let unsigned_value = format!(
            "v=1; a=rsa-sha256; c=relaxed/relaxed; d={}; s={}; h={}; bh={}; b=",
            self.domain, self.selector, h_joined, bh
        );

        let mut hash_input = Vec::new();
        for name in &h_names {
            // The bottom-most instance is the signed one.
            if let Some(value) = headers.get_all(name).last() {
                hash_input.extend_from_slice(&relaxed_header_line(name, value));
            }
        }
        // The signature header itself, blank b=, no trailing CRLF.
        hash_input.extend_from_slice(b"dkim-signature:");
        hash_input.extend_from_slice(unsigned_value.as_bytes());

        let digest = Sha256::digest(&hash_input);
        let signature = self
            .key
            .sign(Pkcs1v15Sign::new::<Sha256>(), &digest)
            .map_err(|e| DkimError::Rsa(e.to_string()))?;

        Ok(format!(
            "{}{}",
            unsigned_value,
            fold_b64(&STANDARD.encode(signature))
        ))
    }
}

/// Insert a space after every `B_FOLD_WIDTH` characters so the header
/// encoder has somewhere to break; verifiers strip the whitespace.
fn fold_b64(b64: &str) -> String {
    let mut out = String::with_capacity(b64.len() + b64.len() / B_FOLD_WIDTH + 1);
    for (i, c) in b64.chars().enumerate() {
        if i > 0 && i % B_FOLD_WIDTH == 0 {
            out.push(' ');
        }
        out.push(c);
    }
    out
}
