/*
 * key.rs
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

//! Domain key TXT records: `k=rsa; p=<base64 SPKI>`; other tags ignored.

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::DecodePublicKey;
use rsa::RsaPublicKey;

use super::DkimError;

/// Public key published under `<selector>._domainkey.<domain>`.
#[derive(Debug, Clone)]
pub struct DomainKey {
    pub key: RsaPublicKey,
}

/// Parse a TXT record into a usable key. An empty `p=` means the key was
/// revoked; a `k=` other than `rsa` is unusable.
pub fn parse_domain_key(txt: &str) -> Result<DomainKey, DkimError> {
    let mut key_type: Option<String> = None;
    let mut p: Option<String> = None;
    for segment in txt.split(';') {
        let segment = segment.trim();
        let Some(eq) = segment.find('=') else {
            continue;
        };
        let name = segment[..eq].trim().to_ascii_lowercase();
        let value = segment[eq + 1..].trim();
        match name.as_str() {
            "k" => key_type = Some(value.to_ascii_lowercase()),
            "p" => p = Some(value.chars().filter(|c| !c.is_whitespace()).collect()),
            _ => {}
        }
    }
    if let Some(k) = key_type {
        if k != "rsa" {
            return Err(DkimError::BadDomainKey);
        }
    }
    let p = p.ok_or(DkimError::BadDomainKey)?;
    if p.is_empty() {
        return Err(DkimError::BadDomainKey);
    }
    let der = STANDARD
        .decode(p.as_bytes())
        .or_else(|_| STANDARD_NO_PAD.decode(p.as_bytes()))
        .map_err(|_| DkimError::BadDomainKey)?;
    let key = RsaPublicKey::from_public_key_der(&der)
        .or_else(|_| RsaPublicKey::from_pkcs1_der(&der))
        .map_err(|_| DkimError::BadDomainKey)?;
    Ok(DomainKey { key })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::pkcs8::EncodePublicKey;
    use rsa::RsaPrivateKey;

    fn spki_b64() -> String {
        let private = RsaPrivateKey::new(&mut rand::thread_rng(), 1024).unwrap();
        let der = private.to_public_key().to_public_key_der().unwrap();
        STANDARD.encode(der.as_bytes())
    }

    #[test]
    fn parses_spki_record() {
        let record = format!("v=DKIM1; k=rsa; p={}", spki_b64());
        assert!(parse_domain_key(&record).is_ok());
    }

    #[test]
    fn unknown_tags_ignored() {
        let record = format!("v=DKIM1; t=s; n=note; p={}", spki_b64());
        assert!(parse_domain_key(&record).is_ok());
    }

    #[test]
    fn non_rsa_key_rejected() {
        assert!(matches!(
            parse_domain_key("k=ed25519; p=AAAA"),
            Err(DkimError::BadDomainKey)
        ));
    }

    #[test]
    fn revoked_or_missing_key_rejected() {
        assert!(matches!(
            parse_domain_key("k=rsa; p="),
            Err(DkimError::BadDomainKey)
        ));
        assert!(matches!(
            parse_domain_key("v=DKIM1"),
            Err(DkimError::BadDomainKey)
        ));
    }

    #[test]
    fn garbage_key_rejected() {
        assert!(matches!(
            parse_domain_key("k=rsa; p=bm90IGEga2V5"),
            Err(DkimError::BadDomainKey)
        ));
    }
}
