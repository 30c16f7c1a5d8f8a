/*
 * deliverer.rs
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

//! Outbound deliverer: groups `Sending` recipients by staged message
//! and domain, dials the lowest-preference MX (the domain itself when
//! no MX exists), STARTTLS, issues the whole batch on one connection,
//! and records per-recipient outcomes. Permanent failure is a final
//! code ≥ 500 or a first attempt older than the configured age; no
//! bounce message is synthesized.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Semaphore;

use super::Worker;
use crate::config::Config;
use crate::dns::{BoxFuture, DnsError, Resolver};
use crate::protocol::smtp::{address_domain, deliver_batch, SmtpClientError};
use crate::shutdown::CancelToken;
use crate::storage::{DeliveryState, StagingStore};

#[derive(Clone)]
pub struct Deliverer {
    config: Arc<Config>,
    staging: Arc<StagingStore>,
    resolver: Arc<dyn Resolver>,
    limiter: Arc<Semaphore>,
    cancel: CancelToken,
}

impl Deliverer {
    pub fn new(
        config: Arc<Config>,
        staging: Arc<StagingStore>,
        resolver: Arc<dyn Resolver>,
        cancel: CancelToken,
    ) -> Self {
        let limiter = Arc::new(Semaphore::new(config.delivery_concurrency));
        Self {
            config,
            staging,
            resolver,
            limiter,
            cancel,
        }
    }

    /// MX target for a domain: lowest preference, implicit MX fallback.
    async fn mx_host(&self, domain: &str) -> Result<String, DnsError> {
        match self.resolver.lookup_mx(domain).await {
            Ok(hosts) => Ok(hosts
                .first()
                .map(|h| h.host.clone())
                .unwrap_or_else(|| domain.to_string())),
            Err(DnsError::NotFound) => Ok(domain.to_string()),
            Err(e) => Err(e),
        }
    }

    async fn deliver_group(
        &self,
        staging_id: i64,
        sender: &str,
        domain: &str,
        recipients: Vec<String>,
    ) {
        let _permit = match Arc::clone(&self.limiter).acquire_owned().await {
            Ok(p) => p,
            Err(_) => return,
        };
        let full = match self.staging.read_full(&self.cancel, staging_id) {
            Ok(f) => f,
            Err(e) => {
                tracing::error!(staging_id, error = %e, "staged bytes missing");
                return;
            }
        };
        let host = match self.mx_host(domain).await {
            Ok(h) => h,
            Err(e) => {
                tracing::warn!(domain = %domain, error = %e, "mx lookup failed");
                for recipient in &recipients {
                    let _ = self.staging.record_delivery(
                        &self.cancel,
                        staging_id,
                        recipient,
                        451,
                        &format!("mx lookup failed: {}", e),
                    );
                    self.settle(staging_id, recipient, 451).await;
                }
                return;
            }
        };

        tracing::info!(
            staging_id,
            host = %host,
            recipients = recipients.len(),
            "delivering"
        );
        match deliver_batch(
            &self.cancel,
            &host,
            25,
            &self.config.hostname,
            sender,
            &recipients,
            &full,
        )
        .await
        {
            Ok(results) => {
                for result in results {
                    let _ = self.staging.record_delivery(
                        &self.cancel,
                        staging_id,
                        &result.recipient,
                        result.code,
                        &result.message,
                    );
                    if result.accepted() {
                        let _ = self.staging.set_recipient_state(
                            &self.cancel,
                            staging_id,
                            &result.recipient,
                            DeliveryState::Done,
                        );
                    } else {
                        self.settle(staging_id, &result.recipient, result.code).await;
                    }
                }
            }
            Err(e) => {
                let code = match &e {
                    SmtpClientError::Refused { code, .. } => *code,
                    _ => 451,
                };
                tracing::warn!(staging_id, host = %host, error = %e, "delivery failed");
                for recipient in &recipients {
                    let _ = self.staging.record_delivery(
                        &self.cancel,
                        staging_id,
                        recipient,
                        code,
                        &e.to_string(),
                    );
                    self.settle(staging_id, recipient, code).await;
                }
            }
        }
    }

    /// After a failed attempt: permanent when the code is ≥ 500 or the
    /// first attempt is too old; otherwise leave the recipient in
    /// `Sending` for a later pass.
    async fn settle(&self, staging_id: i64, recipient: &str, code: u16) {
        let permanent = if code >= 500 {
            true
        } else {
            match self
                .staging
                .delivery_history(&self.cancel, staging_id, recipient)
            {
                Ok(history) => history.first().map_or(false, |first| {
                    let age = Utc::now().timestamp() - first.date;
                    age > self.config.permanent_failure_age.as_secs() as i64
                }),
                Err(_) => false,
            }
        };
        if permanent {
            tracing::warn!(staging_id, recipient = %recipient, code, "permanent failure");
            let _ = self.staging.set_recipient_state(
                &self.cancel,
                staging_id,
                recipient,
                DeliveryState::Failed,
            );
        }
    }
}

impl Worker for Deliverer {
    fn name(&self) -> &'static str {
        "deliverer"
    }

    fn tick<'a>(&'a self) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            let pending = match self
                .staging
                .recipients_in_state(&self.cancel, DeliveryState::Sending)
            {
                Ok(p) => p,
                Err(e) => {
                    tracing::error!(error = %e, "deliverer scan failed");
                    return false;
                }
            };
            if pending.is_empty() {
                return false;
            }

            // One connection per staged message per target domain.
            let mut groups: HashMap<(i64, String), (String, Vec<String>)> = HashMap::new();
            for recipient in pending {
                let Some(domain) = address_domain(&recipient.full_address) else {
                    let _ = self.staging.set_recipient_state(
                        &self.cancel,
                        recipient.staging_id,
                        &recipient.full_address,
                        DeliveryState::Failed,
                    );
                    continue;
                };
                groups
                    .entry((recipient.staging_id, domain))
                    .or_insert_with(|| (recipient.sender.clone(), Vec::new()))
                    .1
                    .push(recipient.full_address);
            }
            // Groups run in parallel; the semaphore caps the fan-out.
            let mut handles = Vec::with_capacity(groups.len());
            for ((staging_id, domain), (sender, recipients)) in groups {
                if self.cancel.is_cancelled() {
                    return false;
                }
                let this = self.clone();
                handles.push(tokio::spawn(async move {
                    this.deliver_group(staging_id, &sender, &domain, recipients)
                        .await;
                }));
            }
            for handle in handles {
                let _ = handle.await;
            }
            if let Err(e) = self.staging.purge_completed(&self.cancel) {
                tracing::warn!(error = %e, "staging purge failed");
            }
            true
        })
    }
}
