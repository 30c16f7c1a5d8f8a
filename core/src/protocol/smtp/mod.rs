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

//! SMTP: reception/submission server (RFC 5321) and the outbound
//! delivery client the pipeline uses to reach remote MX hosts.

mod client;
mod dot;
mod server;

pub use client::{deliver_batch, RecipientResult, SmtpClientError};
pub use dot::dot_stuff;
pub use server::{run_session, SessionEnd, SmtpApp, SmtpConfig, SmtpServer, SmtpTransaction};

/// Split a command line into its verb (uppercased) and remainder.
pub fn split_verb(line: &str) -> (String, &str) {
    let trimmed = line.trim_start();
    match trimmed.find(' ') {
        Some(i) => (trimmed[..i].to_ascii_uppercase(), trimmed[i + 1..].trim_start()),
        None => (trimmed.to_ascii_uppercase(), ""),
    }
}

/// Parse `FROM:<addr>` / `TO:<addr>` arguments, case-insensitively,
/// ignoring trailing ESMTP parameters. The address must be non-empty
/// and contain `@`.
pub fn parse_path(args: &str, keyword: &str) -> Option<String> {
    let args = args.trim();
    if args.len() < keyword.len() || !args[..keyword.len()].eq_ignore_ascii_case(keyword) {
        return None;
    }
    let rest = args[keyword.len()..].trim_start().strip_prefix(':')?;
    let rest = rest.trim_start();
    let address = if let Some(stripped) = rest.strip_prefix('<') {
        let end = stripped.find('>')?;
        &stripped[..end]
    } else {
        rest.split_whitespace().next().unwrap_or("")
    };
    let address = address.trim();
    if address.is_empty() || !address.contains('@') {
        return None;
    }
    Some(address.to_string())
}

/// Domain part of an address, lowercased.
pub fn address_domain(address: &str) -> Option<String> {
    address
        .rsplit_once('@')
        .map(|(_, d)| d.trim().to_ascii_lowercase())
        .filter(|d| !d.is_empty())
}
