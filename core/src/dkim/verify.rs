/*
 * verify.rs
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

//! Verification side: all four canonicalization pairs, `l=` limits,
//! `dns/txt` key discovery with a TTL-honoring cache.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rsa::Pkcs1v15Sign;
use sha1::Sha1;
use sha2::{Digest, Sha256};

use super::canon::{canonical_body, relaxed_header_line, simple_header_line};
use super::key::{parse_domain_key, DomainKey};
use super::signature::{parse_signature, DkimSignature};
use super::{Algorithm, Canon, DkimError};
use crate::dns::{DnsError, Resolver};

/// One header field as it appeared on the wire: the name as written and
/// the whole field (name, colon, value, internal folds), no final CRLF.
#[derive(Debug, Clone)]
pub struct RawField {
    pub name: String,
    pub raw: Vec<u8>,
}

impl RawField {
    /// Bytes after the first colon.
    fn value(&self) -> &[u8] {
        match self.raw.iter().position(|&b| b == b':') {
            Some(i) => &self.raw[i + 1..],
            None => &[],
        }
    }

    /// Value with folds removed, for tag-list parsing.
    fn unfolded_value(&self) -> String {
        self.value()
            .iter()
            .filter(|&&b| b != b'\r' && b != b'\n')
            .map(|&b| b as char)
            .collect()
    }
}

/// Split a raw message into header fields and the body offset.
pub fn parse_raw_fields(raw: &[u8]) -> (Vec<RawField>, usize) {
    let mut fields: Vec<RawField> = Vec::new();
    let mut pos = 0;
    while pos < raw.len() {
        let line_end = match raw[pos..].iter().position(|&b| b == b'\n') {
            Some(i) => pos + i + 1,
            None => raw.len(),
        };
        let mut content_end = line_end;
        while content_end > pos && matches!(raw[content_end - 1], b'\r' | b'\n') {
            content_end -= 1;
        }
        let line = &raw[pos..content_end];
        if line.is_empty() {
            pos = line_end;
            break;
        }
        if line[0] == b' ' || line[0] == b'\t' {
            if let Some(field) = fields.last_mut() {
                field.raw.extend_from_slice(b"\r\n");
                field.raw.extend_from_slice(line);
            }
        } else if let Some(colon) = line.iter().position(|&b| b == b':') {
            let name = String::from_utf8_lossy(&line[..colon]).trim().to_string();
            fields.push(RawField {
                name,
                raw: line.to_vec(),
            });
        }
        pos = line_end;
    }
    (fields, pos)
}

/// Successful verification outcome.
#[derive(Debug, Clone)]
pub struct Verification {
    pub domain: String,
    pub selector: String,
    pub algorithm: Algorithm,
}

struct CachedKey {
    key: DomainKey,
    expires: Instant,
}

/// Verifier with a shared key cache. Clone-cheap via `Arc` around it.
pub struct DkimVerifier {
    resolver: Arc<dyn Resolver>,
    cache: Mutex<HashMap<String, CachedKey>>,
}

impl DkimVerifier {
    pub fn new(resolver: Arc<dyn Resolver>) -> Self {
        Self {
            resolver,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Verify the first `DKIM-Signature` on `raw`.
    pub async fn verify(&self, raw: &[u8]) -> Result<Verification, DkimError> {
        let (fields, body_off) = parse_raw_fields(raw);
        let body = &raw[body_off..];
        let sig_index = fields
            .iter()
            .position(|f| f.name.eq_ignore_ascii_case("dkim-signature"))
            .ok_or(DkimError::NotSigned)?;
        let sig_field = &fields[sig_index];
        let sig = parse_signature(&sig_field.unfolded_value())?;

        check_body_hash(body, &sig)?;
        let digest = header_digest(&fields, sig_index, &sig);

        let query = format!("{}._domainkey.{}", sig.selector, sig.domain);
        let key = self.domain_key(&query).await?;
        verify_rsa(sig.algorithm, &key, &digest, &sig.signature)?;
        Ok(Verification {
            domain: sig.domain.clone(),
            selector: sig.selector.clone(),
            algorithm: sig.algorithm,
        })
    }

    async fn domain_key(&self, query: &str) -> Result<DomainKey, DkimError> {
        {
            let cache = self.cache.lock().expect("dkim key cache");
            if let Some(entry) = cache.get(query) {
                if entry.expires > Instant::now() {
                    return Ok(entry.key.clone());
                }
            }
        }
        let records = self.resolver.lookup_txt(query).await.map_err(|e| match e {
            DnsError::NotFound => DkimError::NoTXTRecord,
            DnsError::Other(m) => DkimError::Dns(m),
        })?;
        let record = records.first().ok_or(DkimError::NoTXTRecord)?;
        let key = parse_domain_key(&record.text)?;
        let mut cache = self.cache.lock().expect("dkim key cache");
        cache.insert(
            query.to_string(),
            CachedKey {
                key: key.clone(),
                expires: Instant::now() + Duration::from_secs(u64::from(record.ttl)),
            },
        );
        Ok(key)
    }
}

fn digest_bytes(algorithm: Algorithm, data: &[u8]) -> Vec<u8> {
    match algorithm {
        Algorithm::RsaSha256 => Sha256::digest(data).to_vec(),
        Algorithm::RsaSha1 => Sha1::digest(data).to_vec(),
    }
}

fn check_body_hash(body: &[u8], sig: &DkimSignature) -> Result<(), DkimError> {
    let mut canonical = canonical_body(body, sig.body_canon);
    if let Some(limit) = sig.body_limit {
        if (canonical.len() as u64) < limit {
            return Err(DkimError::ShortBody);
        }
        canonical.truncate(limit as usize);
    }
    if digest_bytes(sig.algorithm, &canonical) != sig.body_hash {
        return Err(DkimError::BadBodyHash);
    }
    Ok(())
}

fn header_digest(fields: &[RawField], sig_index: usize, sig: &DkimSignature) -> Vec<u8> {
    let mut input = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    for name in &sig.headers {
        let lower = name.to_ascii_lowercase();
        // A name listed twice in h= hashes once.
        if !seen.insert(lower.clone()) {
            continue;
        }
        // Bottom-most instance wins; the signature field itself never
        // participates here.
        let field = fields
            .iter()
            .enumerate()
            .rev()
            .find(|(i, f)| *i != sig_index && f.name.eq_ignore_ascii_case(name))
            .map(|(_, f)| f);
        if let Some(field) = field {
            input.extend_from_slice(&canonical_field(field, sig.header_canon));
        }
    }
    // The signature header, b= emptied, without a trailing CRLF.
    input.extend_from_slice(&blanked_signature_field(&fields[sig_index], sig.header_canon));
    digest_bytes(sig.algorithm, &input)
}

fn canonical_field(field: &RawField, canon: Canon) -> Vec<u8> {
    match canon {
        Canon::Relaxed => relaxed_header_line(&field.name, field.value()),
        Canon::Simple => simple_header_line(&field.raw),
    }
}

fn blanked_signature_field(field: &RawField, canon: Canon) -> Vec<u8> {
    match canon {
        Canon::Relaxed => {
            let mut line = relaxed_header_line(&field.name, field.value());
            // Strip the CRLF the canonicalizer appended.
            line.truncate(line.len().saturating_sub(2));
            let colon = line
                .iter()
                .position(|&b| b == b':')
                .map(|i| i + 1)
                .unwrap_or(0);
            blank_b(&line, colon)
        }
        Canon::Simple => {
            let colon = field
                .raw
                .iter()
                .position(|&b| b == b':')
                .map(|i| i + 1)
                .unwrap_or(0);
            blank_b(&field.raw, colon)
        }
    }
}

/// Copy a tag-list, emptying the value of the `b` tag and leaving every
/// other byte (spaces included) untouched.
fn blank_b(input: &[u8], from: usize) -> Vec<u8> {
    let mut out = input[..from].to_vec();
    let mut i = from;
    while i < input.len() {
        while i < input.len() && matches!(input[i], b' ' | b'\t' | b'\r' | b'\n') {
            out.push(input[i]);
            i += 1;
        }
        let name_start = i;
        while i < input.len() && input[i] != b'=' && input[i] != b';' {
            i += 1;
        }
        let name: Vec<u8> = input[name_start..i]
            .iter()
            .copied()
            .filter(|b| !b.is_ascii_whitespace())
            .collect();
        out.extend_from_slice(&input[name_start..i]);
        if i >= input.len() {
            break;
        }
        if input[i] == b';' {
            out.push(b';');
            i += 1;
            continue;
        }
        out.push(b'=');
        i += 1;
        let value_start = i;
        while i < input.len() && input[i] != b';' {
            i += 1;
        }
        if name != b"b" {
            out.extend_from_slice(&input[value_start..i]);
        }
        if i < input.len() {
            out.push(b';');
            i += 1;
        }
    }
    out
}

fn verify_rsa(
    algorithm: Algorithm,
    key: &DomainKey,
    digest: &[u8],
    signature: &[u8],
) -> Result<(), DkimError> {
    let padding = match algorithm {
        Algorithm::RsaSha256 => Pkcs1v15Sign::new::<Sha256>(),
        Algorithm::RsaSha1 => Pkcs1v15Sign::new::<Sha1>(),
    };
    key.key
        .verify(padding, digest, signature)
        .map_err(|_| DkimError::RSAVerifyFailed)
}
