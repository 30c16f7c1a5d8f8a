/*
 * config.rs
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

//! Server configuration. A plain struct with constructor defaults; reading
//! a configuration file is the embedding application's concern.

use std::path::PathBuf;
use std::time::Duration;

/// Tunables for the whole server. One instance, shared via `Arc`.
#[derive(Debug, Clone)]
pub struct Config {
    /// Name used in SMTP/IMAP greetings and EHLO.
    pub hostname: String,
    /// Domains whose addresses resolve to local users.
    pub local_domains: Vec<String>,
    /// Directory holding the global database and per-user box databases.
    pub data_dir: PathBuf,
    /// Maximum accepted message size in bytes (SMTP SIZE).
    pub max_size: u64,
    /// Maximum recipients per SMTP transaction.
    pub max_recipients: usize,
    /// Maximum concurrent sessions per listener.
    pub max_sessions: usize,
    /// Accept commands besides HELO/EHLO/STARTTLS/NOOP/QUIT on plaintext
    /// connections. Off in production.
    pub allow_no_tls: bool,
    /// Pipeline worker poll interval.
    pub poll_interval: Duration,
    /// Staging ids processed per processor scan.
    pub process_batch: usize,
    /// Processor attempts before a staged message is quarantined.
    pub max_process_attempts: u32,
    /// Concurrent outbound deliveries.
    pub delivery_concurrency: usize,
    /// Age of the first delivery attempt after which a still-failing
    /// recipient is treated as permanently failed.
    pub permanent_failure_age: Duration,
    /// Authentication failures tolerated per key inside the window.
    pub throttle_max_failures: u32,
    /// Sliding window for authentication failures.
    pub throttle_window: Duration,
    /// Delay imposed once the failure budget is exhausted.
    pub throttle_delay: Duration,
}

impl Config {
    pub fn new(hostname: impl Into<String>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            hostname: hostname.into(),
            local_domains: Vec::new(),
            data_dir: data_dir.into(),
            max_size: 64 * 1024 * 1024,
            max_recipients: 100,
            max_sessions: 64,
            allow_no_tls: false,
            poll_interval: Duration::from_secs(2),
            process_batch: 8,
            max_process_attempts: 5,
            delivery_concurrency: 100,
            permanent_failure_age: Duration::from_secs(36 * 3600),
            throttle_max_failures: 10,
            throttle_window: Duration::from_secs(60),
            throttle_delay: Duration::from_secs(3),
        }
    }

    /// True when `domain` is one of the configured local domains.
    pub fn is_local_domain(&self, domain: &str) -> bool {
        self.local_domains
            .iter()
            .any(|d| d.eq_ignore_ascii_case(domain))
    }
}
