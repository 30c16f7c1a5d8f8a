/*
 * dns.rs
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

//! Abstract DNS resolver: TXT lookups (DKIM keys) and MX lookups
//! (outbound delivery). The server consumes this trait; the hickory
//! implementation is the production resolver, the static one serves tests.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;

use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::error::ResolveErrorKind;
use hickory_resolver::proto::rr::RData;
use hickory_resolver::TokioAsyncResolver;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[derive(Debug)]
pub enum DnsError {
    /// Name exists without matching records, or does not exist at all.
    NotFound,
    Other(String),
}

impl fmt::Display for DnsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DnsError::NotFound => write!(f, "no record"),
            DnsError::Other(m) => write!(f, "dns: {}", m),
        }
    }
}

impl std::error::Error for DnsError {}

/// One TXT record, character strings concatenated, with its TTL.
#[derive(Debug, Clone)]
pub struct TxtRecord {
    pub text: String,
    pub ttl: u32,
}

/// One MX target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MxHost {
    pub preference: u16,
    pub host: String,
}

pub trait Resolver: Send + Sync {
    fn lookup_txt<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<Vec<TxtRecord>, DnsError>>;
    fn lookup_mx<'a>(&'a self, domain: &'a str) -> BoxFuture<'a, Result<Vec<MxHost>, DnsError>>;
}

/// System resolver backed by hickory.
pub struct HickoryResolver {
    inner: TokioAsyncResolver,
}

impl HickoryResolver {
    /// Resolver from the platform configuration, falling back to defaults.
    pub fn new() -> Self {
        let inner = match hickory_resolver::system_conf::read_system_conf() {
            Ok((config, opts)) => TokioAsyncResolver::tokio(config, opts),
            Err(_) => TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default()),
        };
        Self { inner }
    }
}

impl Default for HickoryResolver {
    fn default() -> Self {
        Self::new()
    }
}

fn map_resolve_error(e: hickory_resolver::error::ResolveError) -> DnsError {
    match e.kind() {
        ResolveErrorKind::NoRecordsFound { .. } => DnsError::NotFound,
        other => DnsError::Other(other.to_string()),
    }
}

impl Resolver for HickoryResolver {
    fn lookup_txt<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<Vec<TxtRecord>, DnsError>> {
        Box::pin(async move {
            let lookup = self
                .inner
                .txt_lookup(name.to_string())
                .await
                .map_err(map_resolve_error)?;
            let mut records = Vec::new();
            for record in lookup.as_lookup().records() {
                if let Some(RData::TXT(txt)) = record.data() {
                    let mut text = String::new();
                    for chunk in txt.txt_data() {
                        text.push_str(&String::from_utf8_lossy(chunk));
                    }
                    records.push(TxtRecord {
                        text,
                        ttl: record.ttl(),
                    });
                }
            }
            if records.is_empty() {
                return Err(DnsError::NotFound);
            }
            Ok(records)
        })
    }

    fn lookup_mx<'a>(&'a self, domain: &'a str) -> BoxFuture<'a, Result<Vec<MxHost>, DnsError>> {
        Box::pin(async move {
            let lookup = self
                .inner
                .mx_lookup(domain.to_string())
                .await
                .map_err(map_resolve_error)?;
            let mut hosts: Vec<MxHost> = lookup
                .iter()
                .map(|mx| MxHost {
                    preference: mx.preference(),
                    host: mx.exchange().to_utf8().trim_end_matches('.').to_string(),
                })
                .collect();
            hosts.sort_by_key(|h| h.preference);
            if hosts.is_empty() {
                return Err(DnsError::NotFound);
            }
            Ok(hosts)
        })
    }
}

/// Fixed-answer resolver for tests.
#[derive(Default)]
pub struct StaticResolver {
    txt: HashMap<String, Vec<TxtRecord>>,
    mx: HashMap<String, Vec<MxHost>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_txt(&mut self, name: impl Into<String>, text: impl Into<String>, ttl: u32) {
        self.txt.entry(name.into()).or_default().push(TxtRecord {
            text: text.into(),
            ttl,
        });
    }

    pub fn add_mx(&mut self, domain: impl Into<String>, preference: u16, host: impl Into<String>) {
        self.mx.entry(domain.into()).or_default().push(MxHost {
            preference,
            host: host.into(),
        });
    }
}

impl Resolver for StaticResolver {
    fn lookup_txt<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<Vec<TxtRecord>, DnsError>> {
        let result = self.txt.get(name).cloned().ok_or(DnsError::NotFound);
        Box::pin(async move { result })
    }

    fn lookup_mx<'a>(&'a self, domain: &'a str) -> BoxFuture<'a, Result<Vec<MxHost>, DnsError>> {
        let result = self
            .mx
            .get(domain)
            .map(|hosts| {
                let mut hosts = hosts.clone();
                hosts.sort_by_key(|h| h.preference);
                hosts
            })
            .ok_or(DnsError::NotFound);
        Box::pin(async move { result })
    }
}
