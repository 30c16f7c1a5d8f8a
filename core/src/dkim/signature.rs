/*
 * signature.rs
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

//! `DKIM-Signature` tag-list parsing (RFC 6376 §3.5).

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine;

use super::{Algorithm, Canon, DkimError};

/// Parsed signature tags.
#[derive(Debug, Clone)]
pub struct DkimSignature {
    pub algorithm: Algorithm,
    pub header_canon: Canon,
    pub body_canon: Canon,
    pub domain: String,
    pub selector: String,
    /// `h=` names in listed order; may repeat.
    pub headers: Vec<String>,
    pub body_hash: Vec<u8>,
    pub signature: Vec<u8>,
    /// `l=` body length limit.
    pub body_limit: Option<u64>,
}

/// Split a tag-list into `(name, value)` pairs. Leading/trailing WSP and
/// a trailing semicolon are tolerated; folds inside values survive as
/// whitespace for the decoders to strip.
fn split_tags(value: &str) -> Vec<(String, String)> {
    let mut tags = Vec::new();
    for segment in value.split(';') {
        let segment = segment.trim();
        if segment.is_empty() {
            continue;
        }
        match segment.find('=') {
            Some(eq) => {
                let name = segment[..eq].trim().to_ascii_lowercase();
                let val = segment[eq + 1..].trim().to_string();
                if !name.is_empty() {
                    tags.push((name, val));
                }
            }
            None => continue,
        }
    }
    tags
}

fn strip_wsp(s: &str) -> String {
    s.chars().filter(|c| !c.is_whitespace()).collect()
}

fn decode_b64_tag(s: &str) -> Result<Vec<u8>, DkimError> {
    let clean = strip_wsp(s);
    STANDARD
        .decode(clean.as_bytes())
        .or_else(|_| STANDARD_NO_PAD.decode(clean.as_bytes()))
        .map_err(|_| DkimError::BadSignatureData)
}

/// Parse and validate a signature header value.
pub fn parse_signature(value: &str) -> Result<DkimSignature, DkimError> {
    let tags = split_tags(value);
    let get = |name: &str| -> Option<&str> {
        tags.iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    };

    for required in ["v", "a", "d", "s", "b", "bh"] {
        if get(required).is_none() {
            return Err(DkimError::Malformed(format!("missing {}= tag", required)));
        }
    }
    if get("v") != Some("1") {
        return Err(DkimError::BadVersion);
    }
    let algorithm =
        Algorithm::parse(get("a").unwrap_or_default()).ok_or(DkimError::UnknownAlgorithm)?;
    let (header_canon, body_canon) = match get("c") {
        None => (Canon::Simple, Canon::Simple),
        Some(c) => {
            let mut sides = c.splitn(2, '/');
            let header = Canon::parse(sides.next().unwrap_or(""))
                .ok_or(DkimError::UnknownCanonicalization)?;
            let body = match sides.next() {
                Some(s) => Canon::parse(s).ok_or(DkimError::UnknownCanonicalization)?,
                None => Canon::Simple,
            };
            (header, body)
        }
    };
    if let Some(q) = get("q") {
        if !q.split(':').any(|m| m.trim() == "dns/txt") {
            return Err(DkimError::UnknownQueryMethod);
        }
    }
    let domain = strip_wsp(get("d").unwrap_or_default());
    if domain.is_empty() {
        return Err(DkimError::NoDomain);
    }
    let selector = strip_wsp(get("s").unwrap_or_default());
    if selector.is_empty() {
        return Err(DkimError::NoSelector);
    }
    let headers = get("h")
        .map(|h| {
            h.split(':')
                .map(|n| strip_wsp(n))
                .filter(|n| !n.is_empty())
                .collect()
        })
        .unwrap_or_default();
    let body_hash = decode_b64_tag(get("bh").unwrap_or_default())?;
    let signature = decode_b64_tag(get("b").unwrap_or_default())?;
    if signature.is_empty() || body_hash.is_empty() {
        return Err(DkimError::BadSignatureData);
    }
    let body_limit = match get("l") {
        Some(l) => Some(
            strip_wsp(l)
                .parse::<u64>()
                .map_err(|_| DkimError::Malformed("bad l= tag".into()))?,
        ),
        None => None,
    };

    Ok(DkimSignature {
        algorithm,
        header_canon,
        body_canon,
        domain,
        selector,
        headers,
        body_hash,
        signature,
        body_limit,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "v=1; a=rsa-sha256; c=relaxed/relaxed; d=example.org; s=sel; \
h=from:to:subject; bh=aGFzaA==; b=c2ln; l=42;";

    #[test]
    fn parses_complete_signature() {
        let sig = parse_signature(SAMPLE).unwrap();
        assert_eq!(sig.algorithm, Algorithm::RsaSha256);
        assert_eq!(sig.header_canon, Canon::Relaxed);
        assert_eq!(sig.body_canon, Canon::Relaxed);
        assert_eq!(sig.domain, "example.org");
        assert_eq!(sig.selector, "sel");
        assert_eq!(sig.headers, vec!["from", "to", "subject"]);
        assert_eq!(sig.body_hash, b"hash");
        assert_eq!(sig.signature, b"sig");
        assert_eq!(sig.body_limit, Some(42));
    }

    #[test]
    fn folded_b_value_decodes() {
        let sig = parse_signature(
            "v=1; a=rsa-sha256; d=x.org; s=k; h=from; bh=aGFzaA==; b=c2 ln",
        )
        .unwrap();
        assert_eq!(sig.signature, b"sig");
    }

    #[test]
    fn missing_tag_is_malformed() {
        assert!(matches!(
            parse_signature("v=1; a=rsa-sha256; d=x; s=k; b=c2ln"),
            Err(DkimError::Malformed(_))
        ));
    }

    #[test]
    fn wrong_version() {
        assert!(matches!(
            parse_signature("v=2; a=rsa-sha256; d=x; s=k; bh=aGFzaA==; b=c2ln"),
            Err(DkimError::BadVersion)
        ));
    }

    #[test]
    fn unknown_algorithm() {
        assert!(matches!(
            parse_signature("v=1; a=ed25519-sha256; d=x; s=k; bh=aGFzaA==; b=c2ln"),
            Err(DkimError::UnknownAlgorithm)
        ));
    }

    #[test]
    fn unknown_canonicalization() {
        assert!(matches!(
            parse_signature("v=1; a=rsa-sha256; c=nope/simple; d=x; s=k; bh=aGFzaA==; b=c2ln"),
            Err(DkimError::UnknownCanonicalization)
        ));
    }

    #[test]
    fn unknown_query_method() {
        assert!(matches!(
            parse_signature("v=1; a=rsa-sha256; q=dns/other; d=x; s=k; bh=aGFzaA==; b=c2ln"),
            Err(DkimError::UnknownQueryMethod)
        ));
    }

    #[test]
    fn canon_defaults_to_simple() {
        let sig = parse_signature("v=1; a=rsa-sha1; d=x; s=k; bh=aGFzaA==; b=c2ln").unwrap();
        assert_eq!(sig.header_canon, Canon::Simple);
        assert_eq!(sig.body_canon, Canon::Simple);
        assert_eq!(sig.algorithm, Algorithm::RsaSha1);
    }

    #[test]
    fn single_sided_canon_applies_to_header() {
        let sig =
            parse_signature("v=1; a=rsa-sha256; c=relaxed; d=x; s=k; bh=aGFzaA==; b=c2ln")
                .unwrap();
        assert_eq!(sig.header_canon, Canon::Relaxed);
        assert_eq!(sig.body_canon, Canon::Simple);
    }

    #[test]
    fn garbage_signature_data() {
        assert!(matches!(
            parse_signature("v=1; a=rsa-sha256; d=x; s=k; bh=!!!; b=c2ln"),
            Err(DkimError::BadSignatureData)
        ));
    }
}
