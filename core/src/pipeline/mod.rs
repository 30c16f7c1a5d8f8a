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

//! The staging pipeline: SMTP reception feeds the global staging store;
//! the processor, local sender, and deliverer drain it. Workers poll
//! every two seconds and wake early on the shared `newmsg` signal.

mod deliverer;
mod localsender;
mod processor;

pub use deliverer::Deliverer;
pub use localsender::LocalSender;
pub use processor::{embed_assets, Processor};

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::auth::Authenticator;
use crate::config::Config;
use crate::dns::BoxFuture;
use crate::error::UserError;
use crate::protocol::smtp::{address_domain, SmtpApp, SmtpTransaction};
use crate::shutdown::CancelToken;
use crate::storage::{StagingStore, StorageError};

/// Drain iterations per poll cycle.
const DRAIN_CAP: u32 = 4;

/// One pipeline stage. `tick` processes a bounded batch and reports
/// whether it found work.
pub trait Worker: Send + Sync {
    fn name(&self) -> &'static str;
    fn tick<'a>(&'a self) -> BoxFuture<'a, bool>;
}

/// Poll loop: every `interval`, or earlier on `wake`, run `tick` until
/// it reports an idle pass (capped per cycle).
pub async fn run_worker(
    worker: Arc<dyn Worker>,
    cancel: CancelToken,
    wake: Arc<Notify>,
    interval: Duration,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = wake.notified() => {}
            _ = tokio::time::sleep(interval) => {}
        }
        for _ in 0..DRAIN_CAP {
            if cancel.is_cancelled() {
                return;
            }
            if !worker.tick().await {
                break;
            }
        }
    }
}

fn map_user_error(e: StorageError) -> UserError {
    match e {
        StorageError::Denied(m) => UserError::new(m),
        other => {
            tracing::error!(error = %other, "staging failure");
            UserError::new("temporary storage failure")
        }
    }
}

/// SMTP-facing application: authenticates devices and stages messages.
pub struct StagingSmtpApp {
    config: Arc<Config>,
    staging: Arc<StagingStore>,
    auth: Arc<Authenticator>,
    wake: Arc<Notify>,
    cancel: CancelToken,
}

impl StagingSmtpApp {
    pub fn new(
        config: Arc<Config>,
        staging: Arc<StagingStore>,
        auth: Arc<Authenticator>,
        wake: Arc<Notify>,
        cancel: CancelToken,
    ) -> Self {
        Self {
            config,
            staging,
            auth,
            wake,
            cancel,
        }
    }
}

impl SmtpApp for StagingSmtpApp {
    fn authenticate<'a>(
        &'a self,
        remote: &'a str,
        username: &'a str,
        password: &'a str,
    ) -> BoxFuture<'a, u64> {
        Box::pin(async move {
            match self
                .auth
                .verify(&self.cancel, remote, username, password)
                .await
            {
                Ok(Some(user_id)) => user_id as u64,
                Ok(None) => 0,
                Err(e) => {
                    tracing::error!(error = %e, "authentication backend failure");
                    0
                }
            }
        })
    }

    fn start_message(
        &self,
        sender: &str,
        auth_token: u64,
    ) -> Result<Box<dyn SmtpTransaction>, UserError> {
        let user_id = if auth_token != 0 {
            Some(auth_token as i64)
        } else {
            None
        };
        let staging_id = self
            .staging
            .begin_staged(&self.cancel, sender, user_id)
            .map_err(map_user_error)?;
        Ok(Box::new(StagingTxn {
            config: Arc::clone(&self.config),
            staging: Arc::clone(&self.staging),
            wake: Arc::clone(&self.wake),
            cancel: self.cancel.clone(),
            staging_id,
            authenticated: auth_token != 0,
            data: Vec::new(),
            open: true,
        }))
    }
}

struct StagingTxn {
    config: Arc<Config>,
    staging: Arc<StagingStore>,
    wake: Arc<Notify>,
    cancel: CancelToken,
    staging_id: i64,
    authenticated: bool,
    data: Vec<u8>,
    open: bool,
}

impl SmtpTransaction for StagingTxn {
    fn add_recipient(&mut self, recipient: &str) -> Result<bool, UserError> {
        let Some(domain) = address_domain(recipient) else {
            return Ok(false);
        };
        let local = self.config.is_local_domain(&domain)
            && self
                .staging
                .user_for_address(&self.cancel, recipient)
                .map_err(map_user_error)?
                .is_some();
        // Unauthenticated sessions may only deliver to local users; a
        // relay requires submission credentials.
        if !local && !self.authenticated {
            return Ok(false);
        }
        let local_part = recipient.split('@').next().unwrap_or(recipient);
        self.staging
            .add_recipient(&self.cancel, self.staging_id, local_part, recipient)
            .map_err(map_user_error)?;
        Ok(true)
    }

    fn data_line(&mut self, line: &[u8]) -> Result<(), UserError> {
        self.data.extend_from_slice(line);
        self.data.extend_from_slice(b"\r\n");
        Ok(())
    }

    fn commit(&mut self) -> Result<(), UserError> {
        self.staging
            .commit_staged(&self.cancel, self.staging_id, &self.data)
            .map_err(map_user_error)?;
        self.open = false;
        self.wake.notify_waiters();
        Ok(())
    }

    fn cancel(&mut self) {
        if self.open {
            if let Err(e) = self.staging.cancel_staged(&self.cancel, self.staging_id) {
                tracing::warn!(error = %e, staging_id = self.staging_id, "cancel failed");
            }
            self.open = false;
        }
    }
}

/// Spawn the three workers against the shared wake signal.
pub fn spawn_workers(
    config: &Config,
    cancel: &CancelToken,
    wake: &Arc<Notify>,
    processor: Arc<Processor>,
    local_sender: Arc<LocalSender>,
    deliverer: Arc<Deliverer>,
) -> Vec<JoinHandle<()>> {
    let interval = config.poll_interval;
    [
        processor as Arc<dyn Worker>,
        local_sender as Arc<dyn Worker>,
        deliverer as Arc<dyn Worker>,
    ]
    .into_iter()
    .map(|worker| {
        tokio::spawn(run_worker(
            worker,
            cancel.clone(),
            Arc::clone(wake),
            interval,
        ))
    })
    .collect()
}
