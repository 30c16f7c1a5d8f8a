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

//! Storage facade over the embedded row store: a per-user mailbox
//! database with a sibling blobs database, and the global staging
//! database. All SQL lives in this module tree.

mod blob;
mod pool;
mod staging;
mod userstore;

pub use pool::{Pool, ReadGuard, WriteGuard};
pub use staging::{
    DeliveryAttempt, DeliveryState, PendingRecipient, StagedForProcessing, StagingStore,
};
pub use userstore::{
    AppendOutcome, FlagMode, FlagsOp, MailboxAttr, MailboxInfo, MailboxStatus, MsgRow, PushDevice,
    StoreFlagsOutcome, StoredFlag, UserStore, MAILBOX_RESERVED, MAILBOX_NO_CHILDREN,
};

use std::fmt;
use std::io;

#[derive(Debug)]
pub enum StorageError {
    Sql(rusqlite::Error),
    Io(io::Error),
    /// Pool acquisition or operation under a cancelled context.
    Cancelled,
    NotFound,
    /// Rule violation with a message fit for the client
    /// (`Mailbox already exists`, reserved-name deletes, ...).
    Denied(String),
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::Sql(e) => write!(f, "storage: {}", e),
            StorageError::Io(e) => write!(f, "storage i/o: {}", e),
            StorageError::Cancelled => write!(f, "operation cancelled"),
            StorageError::NotFound => write!(f, "not found"),
            StorageError::Denied(m) => write!(f, "{}", m),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<rusqlite::Error> for StorageError {
    fn from(e: rusqlite::Error) -> Self {
        match e {
            rusqlite::Error::QueryReturnedNoRows => StorageError::NotFound,
            other => StorageError::Sql(other),
        }
    }
}

impl From<io::Error> for StorageError {
    fn from(e: io::Error) -> Self {
        StorageError::Io(e)
    }
}
