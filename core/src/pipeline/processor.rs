/*
 * processor.rs
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

//! Processor: for each staged message with `ToProcess` recipients, run
//! DKIM verification, cleave, reconcile inline assets, rebuild the
//! canonical wire form, and flip the recipients to `Received` under a
//! monotonic ready date. Failures are retried per scan; a poison
//! message is quarantined after the attempt budget.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::Notify;

use super::Worker;
use crate::config::Config;
use crate::dkim::{DkimError, DkimSigner, DkimVerifier};
use crate::dns::BoxFuture;
use crate::mime::{cleave, encode_msg};
use crate::msg::Msg;
use crate::protocol::smtp::address_domain;
use crate::shutdown::CancelToken;
use crate::storage::{StagedForProcessing, StagingStore};

pub struct Processor {
    config: Arc<Config>,
    staging: Arc<StagingStore>,
    verifier: Arc<DkimVerifier>,
    /// Signs outbound mail from local senders when configured.
    signer: Option<Arc<DkimSigner>>,
    wake: Arc<Notify>,
    cancel: CancelToken,
    last_ready: Mutex<i64>,
}

impl Processor {
    pub fn new(
        config: Arc<Config>,
        staging: Arc<StagingStore>,
        verifier: Arc<DkimVerifier>,
        signer: Option<Arc<DkimSigner>>,
        wake: Arc<Notify>,
        cancel: CancelToken,
    ) -> Self {
        Self {
            config,
            staging,
            verifier,
            signer,
            wake,
            cancel,
            last_ready: Mutex::new(0),
        }
    }

    /// Wall-clock nanoseconds, bumped past the last issued value so
    /// ready dates are strictly increasing.
    fn next_ready_date(&self) -> i64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as i64)
            .unwrap_or(0);
        let mut last = self.last_ready.lock().expect("ready date lock");
        let next = if now > *last { now } else { *last + 1 };
        *last = next;
        next
    }

    async fn process_one(&self, staged: &StagedForProcessing) -> Result<(), String> {
        let dkim_status = match self.verifier.verify(&staged.raw).await {
            Ok(v) => format!("pass ({})", v.domain),
            Err(DkimError::NotSigned) => "none".to_string(),
            Err(e) => format!("fail ({})", e),
        };

        let mut msg: Msg = cleave(&staged.raw).map_err(|e| e.to_string())?;
        embed_assets(&mut msg);

        // Sign outbound mail from our own domains.
        let signer = self.signer.as_deref().filter(|_| {
            address_domain(&staged.sender)
                .map(|d| self.config.is_local_domain(&d))
                .unwrap_or(false)
        });
        let mut full = Vec::with_capacity(staged.raw.len());
        encode_msg(&mut msg, &mut full, signer).map_err(|e| e.to_string())?;

        let ready_date = self.next_ready_date();
        self.staging
            .store_processed(
                &self.cancel,
                staged.staging_id,
                &full,
                &dkim_status,
                ready_date,
            )
            .map_err(|e| e.to_string())?;
        tracing::info!(
            staging_id = staged.staging_id,
            sender = %staged.sender,
            dkim = %dkim_status,
            size = full.len(),
            "message processed"
        );
        Ok(())
    }
}

impl Worker for Processor {
    fn name(&self) -> &'static str {
        "processor"
    }

    fn tick<'a>(&'a self) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            let batch = match self
                .staging
                .to_process_batch(&self.cancel, self.config.process_batch)
            {
                Ok(b) => b,
                Err(e) => {
                    tracing::error!(error = %e, "processor scan failed");
                    return false;
                }
            };
            let found = !batch.is_empty();
            for staged in &batch {
                if self.cancel.is_cancelled() {
                    return false;
                }
                match self.process_one(staged).await {
                    Ok(()) => {
                        self.wake.notify_waiters();
                    }
                    Err(e) => {
                        tracing::warn!(
                            staging_id = staged.staging_id,
                            error = %e,
                            attempts = staged.attempts + 1,
                            "processing failed"
                        );
                        let attempts = self
                            .staging
                            .bump_process_attempts(&self.cancel, staged.staging_id)
                            .unwrap_or(u32::MAX);
                        if attempts >= self.config.max_process_attempts {
                            tracing::error!(
                                staging_id = staged.staging_id,
                                "quarantining poison message"
                            );
                            let _ = self.staging.fail_staged(&self.cancel, staged.staging_id);
                        }
                    }
                }
            }
            found
        })
    }
}

/// Reconcile CID references: parts referenced from an HTML body become
/// related (inline); CID-bearing parts nothing references demote to
/// attachments. No part is ever dropped.
pub fn embed_assets(msg: &mut Msg) {
    let mut html = String::new();
    for part in &mut msg.parts {
        if part.is_body && part.content_type == "text/html" {
            if let Ok(bytes) = part.content.read_all() {
                html.push_str(&String::from_utf8_lossy(&bytes));
            }
        }
    }
    let referenced: HashSet<String> = cid_references(&html);
    for part in &mut msg.parts {
        let Some(cid) = part.content_id.clone() else {
            continue;
        };
        if part.is_body {
            continue;
        }
        if referenced.contains(&cid) {
            part.is_attachment = false;
        } else if part.is_related() {
            part.is_attachment = true;
        }
    }
}

fn cid_references(html: &str) -> HashSet<String> {
    let mut refs = HashSet::new();
    let lower = html.to_ascii_lowercase();
    let mut from = 0;
    while let Some(i) = lower[from..].find("cid:") {
        let start = from + i + 4;
        let end = html[start..]
            .find(|c: char| c == '"' || c == '\'' || c == ')' || c == ' ' || c == '>' || c == '<')
            .map(|j| start + j)
            .unwrap_or(html.len());
        let cid = html[start..end].trim();
        if !cid.is_empty() {
            refs.insert(cid.to_string());
        }
        from = end.max(start);
        if from >= lower.len() {
            break;
        }
    }
    refs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cid_scan_finds_references() {
        let refs = cid_references(
            "<img src=\"cid:one@x\"> and <img src='cid:two@y'> done",
        );
        assert!(refs.contains("one@x"));
        assert!(refs.contains("two@y"));
        assert_eq!(refs.len(), 2);
    }

    #[test]
    fn embed_promotes_referenced_and_demotes_orphans() {
        let raw = b"Content-Type: multipart/mixed; boundary=m\r\n\r\n\
--m\r\nContent-Type: text/html\r\n\r\n<img src=\"cid:logo@x\">\r\n\
--m\r\nContent-Type: image/png\r\nContent-ID: <logo@x>\r\n\
Content-Disposition: attachment; filename=logo.png\r\n\
Content-Transfer-Encoding: base64\r\n\r\naGk=\r\n\
--m--\r\n";
        let mut msg = cleave(raw).unwrap();
        // The cleaver saw an explicit attachment disposition.
        assert!(msg.parts[1].is_attachment);
        embed_assets(&mut msg);
        assert!(msg.parts[1].is_related());

        // An unreferenced CID part demotes the other way.
        let raw = b"Content-Type: multipart/related; boundary=r\r\n\r\n\
--r\r\nContent-Type: text/html\r\n\r\nno references here\r\n\
--r\r\nContent-Type: image/png\r\nContent-ID: <orphan@x>\r\n\
Content-Transfer-Encoding: base64\r\n\r\naGk=\r\n\
--r--\r\n";
        let mut msg = cleave(raw).unwrap();
        assert!(msg.parts[1].is_related());
        embed_assets(&mut msg);
        assert!(msg.parts[1].is_attachment);
        assert_eq!(msg.parts.len(), 2);
    }
}
