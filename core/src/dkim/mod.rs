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

//! DKIM (RFC 6376): signing with `rsa-sha256` over `relaxed/relaxed`,
//! verification of `rsa-sha256`/`rsa-sha1` under all four canonicalization
//! pairs, `dns/txt` key discovery with a TTL-honoring cache.

mod canon;
mod key;
mod sign;
mod signature;
mod verify;

pub use canon::{canonical_body, relaxed_header_line, simple_header_line};
pub use key::{parse_domain_key, DomainKey};
pub use sign::DkimSigner;
pub use signature::{parse_signature, DkimSignature};
pub use verify::{parse_raw_fields, DkimVerifier, RawField, Verification};

use std::fmt;

/// Hash/signature algorithm from the `a=` tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    RsaSha256,
    RsaSha1,
}

impl Algorithm {
    pub fn name(self) -> &'static str {
        match self {
            Algorithm::RsaSha256 => "rsa-sha256",
            Algorithm::RsaSha1 => "rsa-sha1",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "rsa-sha256" => Some(Algorithm::RsaSha256),
            "rsa-sha1" => Some(Algorithm::RsaSha1),
            _ => None,
        }
    }
}

/// One side of the `c=` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Canon {
    Relaxed,
    Simple,
}

impl Canon {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "relaxed" => Some(Canon::Relaxed),
            "simple" => Some(Canon::Simple),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub enum DkimError {
    NotSigned,
    Malformed(String),
    BadVersion,
    UnknownAlgorithm,
    UnknownQueryMethod,
    UnknownCanonicalization,
    NoDomain,
    NoSelector,
    BadSignatureData,
    NoTXTRecord,
    BadDomainKey,
    ShortBody,
    BadBodyHash,
    RSAVerifyFailed,
    /// Resolver failure other than a missing record.
    Dns(String),
    /// RSA failure on the signing side.
    Rsa(String),
}

impl fmt::Display for DkimError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DkimError::NotSigned => write!(f, "message is not signed"),
            DkimError::Malformed(m) => write!(f, "malformed signature: {}", m),
            DkimError::BadVersion => write!(f, "unsupported signature version"),
            DkimError::UnknownAlgorithm => write!(f, "unknown algorithm"),
            DkimError::UnknownQueryMethod => write!(f, "unknown query method"),
            DkimError::UnknownCanonicalization => write!(f, "unknown canonicalization"),
            DkimError::NoDomain => write!(f, "missing domain"),
            DkimError::NoSelector => write!(f, "missing selector"),
            DkimError::BadSignatureData => write!(f, "undecodable signature data"),
            DkimError::NoTXTRecord => write!(f, "no TXT record for domain key"),
            DkimError::BadDomainKey => write!(f, "unusable domain key"),
            DkimError::ShortBody => write!(f, "body shorter than declared length"),
            DkimError::BadBodyHash => write!(f, "body hash mismatch"),
            DkimError::RSAVerifyFailed => write!(f, "RSA verification failed"),
            DkimError::Dns(m) => write!(f, "dns failure: {}", m),
            DkimError::Rsa(m) => write!(f, "rsa failure: {}", m),
        }
    }
}

impl std::error::Error for DkimError {}
