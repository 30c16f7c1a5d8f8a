/*
 * localsender.rs
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

//! Local sender: moves processed messages into each local addressee's
//! box as an INBOX append with `\Recent`, then flips the recipient to
//! `Done` and purges finished staging rows.

use std::sync::Arc;

use chrono::{TimeZone, Utc};

use super::Worker;
use crate::boxes::BoxMgr;
use crate::dns::BoxFuture;
use crate::mime::cleave;
use crate::msg::FLAG_RECENT;
use crate::shutdown::CancelToken;
use crate::storage::{DeliveryState, StagingStore};

/// Recipients handled per scan.
const BATCH_CAP: usize = 32;

pub struct LocalSender {
    staging: Arc<StagingStore>,
    boxes: Arc<BoxMgr>,
    cancel: CancelToken,
}

impl LocalSender {
    pub fn new(staging: Arc<StagingStore>, boxes: Arc<BoxMgr>, cancel: CancelToken) -> Self {
        Self {
            staging,
            boxes,
            cancel,
        }
    }

    fn deliver_one(
        &self,
        staging_id: i64,
        full_address: &str,
        ready_date: Option<i64>,
    ) -> Result<(), String> {
        let user_id = self
            .staging
            .user_for_address(&self.cancel, full_address)
            .map_err(|e| e.to_string())?
            .ok_or_else(|| format!("no user behind {}", full_address))?;
        let full = self
            .staging
            .read_full(&self.cancel, staging_id)
            .map_err(|e| e.to_string())?;
        let mut msg = cleave(&full).map_err(|e| e.to_string())?;
        msg.flags.insert(FLAG_RECENT);
        let internal_date = ready_date
            .and_then(|ns| Utc.timestamp_opt(ns / 1_000_000_000, 0).single());
        let uid = self
            .boxes
            .append(&self.cancel, user_id, "INBOX", &mut msg, internal_date)
            .map_err(|e| e.to_string())?;
        tracing::info!(
            staging_id,
            user_id,
            uid,
            recipient = %full_address,
            "delivered locally"
        );
        Ok(())
    }
}

impl Worker for LocalSender {
    fn name(&self) -> &'static str {
        "local-sender"
    }

    fn tick<'a>(&'a self) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            let pending = match self
                .staging
                .recipients_in_state(&self.cancel, DeliveryState::Received)
            {
                Ok(p) => p,
                Err(e) => {
                    tracing::error!(error = %e, "local sender scan failed");
                    return false;
                }
            };
            let found = !pending.is_empty();
            for recipient in pending.into_iter().take(BATCH_CAP) {
                if self.cancel.is_cancelled() {
                    return false;
                }
                let next_state = match self.deliver_one(
                    recipient.staging_id,
                    &recipient.full_address,
                    recipient.ready_date,
                ) {
                    Ok(()) => DeliveryState::Done,
                    Err(e) => {
                        tracing::error!(
                            staging_id = recipient.staging_id,
                            recipient = %recipient.full_address,
                            error = %e,
                            "local delivery failed"
                        );
                        DeliveryState::Failed
                    }
                };
                let _ = self.staging.set_recipient_state(
                    &self.cancel,
                    recipient.staging_id,
                    &recipient.full_address,
                    next_state,
                );
            }
            if let Err(e) = self.staging.purge_completed(&self.cancel) {
                tracing::warn!(error = %e, "staging purge failed");
            }
            found
        })
    }
}
