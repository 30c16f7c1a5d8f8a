/*
 * staging.rs
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

//! Global staging store: users, addresses, devices, in-flight messages
//! with their per-recipient delivery state machine, and the delivery
//! attempt log. The staging store owns message bytes until every
//! recipient reaches a terminal state.

use std::path::Path;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

use super::pool::Pool;
use super::StorageError;
use crate::shutdown::CancelToken;

/// Per-recipient delivery progress. `Staging` is reserved and never
/// produced by active paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Receiving = 0,
    ToProcess = 1,
    Received = 2,
    Staging = 3,
    Sending = 4,
    Done = 5,
    Failed = 6,
}

impl DeliveryState {
    pub fn from_i64(v: i64) -> Option<Self> {
        Some(match v {
            0 => DeliveryState::Receiving,
            1 => DeliveryState::ToProcess,
            2 => DeliveryState::Received,
            3 => DeliveryState::Staging,
            4 => DeliveryState::Sending,
            5 => DeliveryState::Done,
            6 => DeliveryState::Failed,
            _ => return None,
        })
    }
}

/// A staged message the processor should look at.
#[derive(Debug)]
pub struct StagedForProcessing {
    pub staging_id: i64,
    pub sender: String,
    pub raw: Vec<u8>,
    pub attempts: u32,
}

/// A recipient waiting on the local sender or the deliverer.
#[derive(Debug, Clone)]
pub struct PendingRecipient {
    pub staging_id: i64,
    pub sender: String,
    pub recipient: String,
    pub full_address: String,
    pub user_id: Option<i64>,
    pub ready_date: Option<i64>,
}

/// One row of the delivery attempt log.
#[derive(Debug, Clone)]
pub struct DeliveryAttempt {
    pub code: u16,
    pub message: String,
    pub date: i64,
}

pub struct StagingStore {
    pool: Pool,
}

const SCHEMA: &str = "\
CREATE TABLE IF NOT EXISTS Users (
    UserID INTEGER PRIMARY KEY,
    Username TEXT UNIQUE NOT NULL,
    PasswordHash TEXT
);
CREATE TABLE IF NOT EXISTS UserAddresses (
    Address TEXT PRIMARY KEY,
    UserID INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS Devices (
    DeviceID INTEGER PRIMARY KEY,
    UserID INTEGER NOT NULL,
    DeviceName TEXT NOT NULL,
    PasswordHash TEXT NOT NULL,
    UNIQUE (UserID, DeviceName)
);
CREATE TABLE IF NOT EXISTS Msgs (
    StagingID INTEGER PRIMARY KEY,
    Sender TEXT NOT NULL,
    DKIMStatus TEXT,
    DateReceived INTEGER NOT NULL,
    ReadyDate INTEGER,
    UserID INTEGER,
    ProcessAttempts INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS MsgRecipients (
    StagingID INTEGER NOT NULL,
    Recipient TEXT NOT NULL,
    FullAddress TEXT NOT NULL,
    DeliveryState INTEGER NOT NULL,
    PRIMARY KEY (StagingID, FullAddress)
);
CREATE INDEX IF NOT EXISTS RecipientsByState ON MsgRecipients (DeliveryState);
CREATE TABLE IF NOT EXISTS MsgRaw (
    StagingID INTEGER PRIMARY KEY,
    Content BLOB NOT NULL
);
CREATE TABLE IF NOT EXISTS MsgFull (
    StagingID INTEGER PRIMARY KEY,
    Content BLOB NOT NULL
);
CREATE TABLE IF NOT EXISTS Deliveries (
    DeliveryID INTEGER PRIMARY KEY,
    StagingID INTEGER NOT NULL,
    Recipient TEXT NOT NULL,
    Code INTEGER NOT NULL,
    Message TEXT,
    Date INTEGER NOT NULL
);
";

impl StagingStore {
    pub fn open(dir: &Path) -> Result<Self, StorageError> {
        std::fs::create_dir_all(dir)?;
        let pool = Pool::open(
            &dir.join("global.db"),
            4,
            &|_| Ok(()),
            &|conn: &Connection| conn.execute_batch(SCHEMA),
        )?;
        Ok(Self { pool })
    }

    // ---- users, addresses, devices ----

    pub fn create_user(
        &self,
        cancel: &CancelToken,
        username: &str,
    ) -> Result<i64, StorageError> {
        let writer = self.pool.write(cancel)?;
        let inserted = writer.execute(
            "INSERT OR IGNORE INTO Users (Username) VALUES (?1)",
            params![username],
        )?;
        if inserted == 0 {
            return Err(StorageError::Denied("Username unavailable".into()));
        }
        Ok(writer.last_insert_rowid())
    }

    pub fn add_address(
        &self,
        cancel: &CancelToken,
        address: &str,
        user_id: i64,
    ) -> Result<(), StorageError> {
        let writer = self.pool.write(cancel)?;
        writer.execute(
            "INSERT OR REPLACE INTO UserAddresses (Address, UserID) VALUES (?1, ?2)",
            params![address.to_ascii_lowercase(), user_id],
        )?;
        Ok(())
    }

    pub fn user_for_address(
        &self,
        cancel: &CancelToken,
        address: &str,
    ) -> Result<Option<i64>, StorageError> {
        let conn = self.pool.read(cancel)?;
        let user = conn
            .query_row(
                "SELECT UserID FROM UserAddresses WHERE Address = ?1",
                params![address.to_ascii_lowercase()],
                |r| r.get(0),
            )
            .optional()?;
        Ok(user)
    }

    pub fn add_device(
        &self,
        cancel: &CancelToken,
        user_id: i64,
        device_name: &str,
        password_hash: &str,
    ) -> Result<(), StorageError> {
        let writer = self.pool.write(cancel)?;
        writer.execute(
            "INSERT OR REPLACE INTO Devices (UserID, DeviceName, PasswordHash) \
             VALUES (?1, ?2, ?3)",
            params![user_id, device_name, password_hash],
        )?;
        Ok(())
    }

    /// `(user_id, device password hashes)` for a username; the
    /// authenticator tries each device.
    pub fn device_hashes(
        &self,
        cancel: &CancelToken,
        username: &str,
    ) -> Result<Option<(i64, Vec<String>)>, StorageError> {
        let conn = self.pool.read(cancel)?;
        let user_id: Option<i64> = conn
            .query_row(
                "SELECT UserID FROM Users WHERE Username = ?1",
                params![username],
                |r| r.get(0),
            )
            .optional()?;
        let Some(user_id) = user_id else {
            return Ok(None);
        };
        let mut stmt =
            conn.prepare("SELECT PasswordHash FROM Devices WHERE UserID = ?1")?;
        let hashes = stmt
            .query_map(params![user_id], |r| r.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(Some((user_id, hashes)))
    }

    // ---- reception ----

    /// New staged message; recipients start in `Receiving`.
    pub fn begin_staged(
        &self,
        cancel: &CancelToken,
        sender: &str,
        user_id: Option<i64>,
    ) -> Result<i64, StorageError> {
        let writer = self.pool.write(cancel)?;
        writer.execute(
            "INSERT INTO Msgs (Sender, DateReceived, UserID) VALUES (?1, ?2, ?3)",
            params![sender, Utc::now().timestamp(), user_id],
        )?;
        Ok(writer.last_insert_rowid())
    }

    pub fn add_recipient(
        &self,
        cancel: &CancelToken,
        staging_id: i64,
        recipient: &str,
        full_address: &str,
    ) -> Result<(), StorageError> {
        let writer = self.pool.write(cancel)?;
        writer.execute(
            "INSERT OR IGNORE INTO MsgRecipients \
             (StagingID, Recipient, FullAddress, DeliveryState) VALUES (?1, ?2, ?3, ?4)",
            params![
                staging_id,
                recipient,
                full_address,
                DeliveryState::Receiving as i64
            ],
        )?;
        Ok(())
    }

    /// DATA committed: store the raw bytes and route each recipient;
    /// local addresses go to `ToProcess`, everything else to `Sending`.
    pub fn commit_staged(
        &self,
        cancel: &CancelToken,
        staging_id: i64,
        raw: &[u8],
    ) -> Result<(), StorageError> {
        let mut writer = self.pool.write(cancel)?;
        let tx = writer.transaction()?;
        tx.execute(
            "INSERT OR REPLACE INTO MsgRaw (StagingID, Content) VALUES (?1, ?2)",
            params![staging_id, raw],
        )?;
        tx.execute(
            "UPDATE MsgRecipients SET DeliveryState = ?1 \
             WHERE StagingID = ?2 AND DeliveryState = ?3 \
             AND FullAddress IN (SELECT Address FROM UserAddresses)",
            params![
                DeliveryState::ToProcess as i64,
                staging_id,
                DeliveryState::Receiving as i64
            ],
        )?;
        tx.execute(
            "UPDATE MsgRecipients SET DeliveryState = ?1 \
             WHERE StagingID = ?2 AND DeliveryState = ?3",
            params![
                DeliveryState::Sending as i64,
                staging_id,
                DeliveryState::Receiving as i64
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Abandon an uncommitted staged message (RSET, dropped session).
    pub fn cancel_staged(
        &self,
        cancel: &CancelToken,
        staging_id: i64,
    ) -> Result<(), StorageError> {
        let mut writer = self.pool.write(cancel)?;
        let tx = writer.transaction()?;
        for sql in [
            "DELETE FROM MsgRecipients WHERE StagingID = ?1",
            "DELETE FROM MsgRaw WHERE StagingID = ?1",
            "DELETE FROM MsgFull WHERE StagingID = ?1",
            "DELETE FROM Msgs WHERE StagingID = ?1",
        ] {
            tx.execute(sql, params![staging_id])?;
        }
        tx.commit()?;
        Ok(())
    }

    // ---- processor ----

    /// Staged messages with `ToProcess` recipients, oldest first, capped.
    pub fn to_process_batch(
        &self,
        cancel: &CancelToken,
        limit: usize,
    ) -> Result<Vec<StagedForProcessing>, StorageError> {
        let conn = self.pool.read(cancel)?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT m.StagingID, m.Sender, m.ProcessAttempts \
             FROM Msgs m JOIN MsgRecipients r ON r.StagingID = m.StagingID \
             WHERE r.DeliveryState = ?1 ORDER BY m.StagingID LIMIT ?2",
        )?;
        let heads = stmt
            .query_map(params![DeliveryState::ToProcess as i64, limit as i64], |r| {
                Ok((r.get::<_, i64>(0)?, r.get::<_, String>(1)?, r.get::<_, u32>(2)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        drop(stmt);
        let mut out = Vec::with_capacity(heads.len());
        for (staging_id, sender, attempts) in heads {
            let raw: Vec<u8> = conn.query_row(
                "SELECT Content FROM MsgRaw WHERE StagingID = ?1",
                params![staging_id],
                |r| r.get(0),
            )?;
            out.push(StagedForProcessing {
                staging_id,
                sender,
                raw,
                attempts,
            });
        }
        Ok(out)
    }

    /// Processor success: store the canonical bytes, record the DKIM
    /// outcome and the monotonic ready date, flip recipients to
    /// `Received`.
    pub fn store_processed(
        &self,
        cancel: &CancelToken,
        staging_id: i64,
        full: &[u8],
        dkim_status: &str,
        ready_date: i64,
    ) -> Result<(), StorageError> {
        let mut writer = self.pool.write(cancel)?;
        let tx = writer.transaction()?;
        tx.execute(
            "INSERT OR REPLACE INTO MsgFull (StagingID, Content) VALUES (?1, ?2)",
            params![staging_id, full],
        )?;
        tx.execute(
            "UPDATE Msgs SET DKIMStatus = ?1, ReadyDate = ?2 WHERE StagingID = ?3",
            params![dkim_status, ready_date, staging_id],
        )?;
        tx.execute(
            "UPDATE MsgRecipients SET DeliveryState = ?1 \
             WHERE StagingID = ?2 AND DeliveryState = ?3",
            params![
                DeliveryState::Received as i64,
                staging_id,
                DeliveryState::ToProcess as i64
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Processor failure: bump the attempt count; recipients stay in
    /// `ToProcess` for the next scan. Returns the new count.
    pub fn bump_process_attempts(
        &self,
        cancel: &CancelToken,
        staging_id: i64,
    ) -> Result<u32, StorageError> {
        let writer = self.pool.write(cancel)?;
        writer.execute(
            "UPDATE Msgs SET ProcessAttempts = ProcessAttempts + 1 WHERE StagingID = ?1",
            params![staging_id],
        )?;
        let attempts: u32 = writer.query_row(
            "SELECT ProcessAttempts FROM Msgs WHERE StagingID = ?1",
            params![staging_id],
            |r| r.get(0),
        )?;
        Ok(attempts)
    }

    /// Quarantine a poison message: every non-terminal recipient fails.
    pub fn fail_staged(
        &self,
        cancel: &CancelToken,
        staging_id: i64,
    ) -> Result<(), StorageError> {
        let writer = self.pool.write(cancel)?;
        writer.execute(
            "UPDATE MsgRecipients SET DeliveryState = ?1 \
             WHERE StagingID = ?2 AND DeliveryState NOT IN (?3, ?4)",
            params![
                DeliveryState::Failed as i64,
                staging_id,
                DeliveryState::Done as i64,
                DeliveryState::Failed as i64
            ],
        )?;
        Ok(())
    }

    // ---- local sender / deliverer ----

    pub fn recipients_in_state(
        &self,
        cancel: &CancelToken,
        state: DeliveryState,
    ) -> Result<Vec<PendingRecipient>, StorageError> {
        let conn = self.pool.read(cancel)?;
        let mut stmt = conn.prepare(
            "SELECT r.StagingID, m.Sender, r.Recipient, r.FullAddress, m.UserID, m.ReadyDate \
             FROM MsgRecipients r JOIN Msgs m ON m.StagingID = r.StagingID \
             WHERE r.DeliveryState = ?1 ORDER BY m.ReadyDate, r.StagingID",
        )?;
        let rows = stmt
            .query_map(params![state as i64], |r| {
                Ok(PendingRecipient {
                    staging_id: r.get(0)?,
                    sender: r.get(1)?,
                    recipient: r.get(2)?,
                    full_address: r.get(3)?,
                    user_id: r.get(4)?,
                    ready_date: r.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn read_full(
        &self,
        cancel: &CancelToken,
        staging_id: i64,
    ) -> Result<Vec<u8>, StorageError> {
        let conn = self.pool.read(cancel)?;
        let content: Vec<u8> = conn.query_row(
            "SELECT Content FROM MsgFull WHERE StagingID = ?1",
            params![staging_id],
            |r| r.get(0),
        )?;
        Ok(content)
    }

    pub fn set_recipient_state(
        &self,
        cancel: &CancelToken,
        staging_id: i64,
        full_address: &str,
        state: DeliveryState,
    ) -> Result<(), StorageError> {
        let writer = self.pool.write(cancel)?;
        writer.execute(
            "UPDATE MsgRecipients SET DeliveryState = ?1 \
             WHERE StagingID = ?2 AND FullAddress = ?3",
            params![state as i64, staging_id, full_address],
        )?;
        Ok(())
    }

    /// Log one SMTP delivery outcome for a recipient.
    pub fn record_delivery(
        &self,
        cancel: &CancelToken,
        staging_id: i64,
        recipient: &str,
        code: u16,
        message: &str,
    ) -> Result<(), StorageError> {
        let writer = self.pool.write(cancel)?;
        writer.execute(
            "INSERT INTO Deliveries (StagingID, Recipient, Code, Message, Date) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![staging_id, recipient, code, message, Utc::now().timestamp()],
        )?;
        Ok(())
    }

    /// Attempt history for a recipient, oldest first.
    pub fn delivery_history(
        &self,
        cancel: &CancelToken,
        staging_id: i64,
        recipient: &str,
    ) -> Result<Vec<DeliveryAttempt>, StorageError> {
        let conn = self.pool.read(cancel)?;
        let mut stmt = conn.prepare(
            "SELECT Code, COALESCE(Message, ''), Date FROM Deliveries \
             WHERE StagingID = ?1 AND Recipient = ?2 ORDER BY DeliveryID",
        )?;
        let rows = stmt
            .query_map(params![staging_id, recipient], |r| {
                Ok(DeliveryAttempt {
                    code: r.get(0)?,
                    message: r.get(1)?,
                    date: r.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Drop staged bytes once every recipient is terminal.
    pub fn purge_completed(&self, cancel: &CancelToken) -> Result<u32, StorageError> {
        let mut writer = self.pool.write(cancel)?;
        let tx = writer.transaction()?;
        let mut stmt = tx.prepare(
            "SELECT StagingID FROM Msgs WHERE NOT EXISTS \
             (SELECT 1 FROM MsgRecipients r WHERE r.StagingID = Msgs.StagingID \
              AND r.DeliveryState NOT IN (?1, ?2))",
        )?;
        let done: Vec<i64> = stmt
            .query_map(
                params![DeliveryState::Done as i64, DeliveryState::Failed as i64],
                |r| r.get(0),
            )?
            .collect::<Result<Vec<_>, _>>()?;
        drop(stmt);
        for staging_id in &done {
            for sql in [
                "DELETE FROM MsgRecipients WHERE StagingID = ?1",
                "DELETE FROM MsgRaw WHERE StagingID = ?1",
                "DELETE FROM MsgFull WHERE StagingID = ?1",
                "DELETE FROM Msgs WHERE StagingID = ?1",
            ] {
                tx.execute(sql, params![staging_id])?;
            }
        }
        tx.commit()?;
        Ok(done.len() as u32)
    }
}
