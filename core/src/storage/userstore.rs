/*
 * userstore.rs
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

//! Per-user mailbox store: mailboxes with UIDVALIDITY history, name-keyed
//! MODSEQ sequencing, message rows with part summaries, and the mailbox
//! mutations the IMAP core builds on. One database file per user plus a
//! sibling blobs database attached as `blobs`.

use std::io::{Read, Write};
use std::path::Path;

use chrono::{DateTime, TimeZone, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use sha2::{Digest, Sha256};

use super::blob::{insert_blob, read_blob, BLOBS_SCHEMA};
use super::pool::Pool;
use super::StorageError;
use crate::mime::{Content, Headers};
use crate::msg::{FlagSet, Msg, Part, FLAG_RECENT, FLAG_SEEN};
use crate::shutdown::CancelToken;

/// Names that can never be deleted.
pub const MAILBOX_RESERVED: &[&str] =
    &["Subscriptions", "INBOX", "Archive", "Sent", "Drafts", "Trash"];

/// Names that cannot have children (`<name>/...` rejected).
pub const MAILBOX_NO_CHILDREN: &[&str] = &["INBOX", "Archive", "Sent", "Drafts", "Trash"];

/// Mailbox attribute bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailboxAttr {
    Archive = 1,
    Drafts = 2,
    Sent = 4,
    Junk = 8,
    Trash = 16,
}

const MSG_STATE_FETCHING: i64 = 0;
const MSG_STATE_READY: i64 = 1;
const MSG_STATE_EXPUNGED: i64 = 2;

#[derive(Debug, Clone)]
pub struct MailboxInfo {
    pub mailbox_id: i64,
    pub name: String,
    pub uid_validity: i64,
    pub next_uid: i64,
    pub attrs: u32,
    pub subscribed: bool,
}

#[derive(Debug, Clone)]
pub struct MailboxStatus {
    pub messages: u32,
    pub recent: u32,
    pub unseen: u32,
    pub first_unseen_seq: Option<u32>,
    pub uid_next: i64,
    pub uid_validity: i64,
    pub highest_modseq: i64,
}

/// Live message row summary, ordered by UID when listed.
#[derive(Debug, Clone)]
pub struct MsgRow {
    pub msg_id: i64,
    pub uid: i64,
    pub modseq: i64,
    pub flags: FlagSet,
    pub date: i64,
    pub size: i64,
}

#[derive(Debug)]
pub struct AppendOutcome {
    pub msg_id: i64,
    pub uid: i64,
    pub modseq: i64,
    /// An identical raw hash already lived in this store; `uid` is the
    /// existing row's.
    pub duplicate: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagMode {
    Add,
    Remove,
    Replace,
}

#[derive(Debug, Clone)]
pub struct FlagsOp {
    pub mode: FlagMode,
    pub flags: FlagSet,
    pub unchanged_since: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct StoredFlag {
    pub uid: i64,
    pub flags: FlagSet,
    pub modseq: i64,
}

#[derive(Debug, Default)]
pub struct StoreFlagsOutcome {
    pub stored: Vec<StoredFlag>,
    /// UIDs rejected by UNCHANGEDSINCE.
    pub failed_modified: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushDevice {
    pub account_id: String,
    pub device_token: String,
}

pub struct UserStore {
    pool: Pool,
    pub user_id: i64,
}

const SCHEMA: &str = "\
CREATE TABLE IF NOT EXISTS Mailboxes (
    MailboxID INTEGER PRIMARY KEY,
    Name TEXT UNIQUE,
    DeletedName TEXT,
    UIDValidity INTEGER NOT NULL,
    NextUID INTEGER NOT NULL DEFAULT 1,
    Attrs INTEGER NOT NULL DEFAULT 0,
    Subscribed INTEGER NOT NULL DEFAULT 1
);
CREATE TABLE IF NOT EXISTS MailboxSequencing (
    Name TEXT PRIMARY KEY,
    NextModSequence INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS Msgs (
    MsgID INTEGER PRIMARY KEY,
    MailboxID INTEGER NOT NULL,
    UID INTEGER NOT NULL,
    ModSequence INTEGER NOT NULL,
    State INTEGER NOT NULL,
    Flags TEXT NOT NULL DEFAULT '{}',
    Date INTEGER NOT NULL,
    Seed INTEGER NOT NULL,
    HdrsBlobID INTEGER,
    RawHash BLOB NOT NULL,
    EncodedSize INTEGER NOT NULL,
    ExpungedAt INTEGER,
    UNIQUE (MailboxID, UID)
);
CREATE INDEX IF NOT EXISTS MsgsByMailbox ON Msgs (MailboxID, State, UID);
CREATE TABLE IF NOT EXISTS MsgParts (
    MsgID INTEGER NOT NULL,
    PartNum INTEGER NOT NULL,
    Name TEXT,
    IsBody INTEGER NOT NULL,
    IsAttachment INTEGER NOT NULL,
    IsCompressed INTEGER NOT NULL,
    CompressedSize INTEGER,
    ContentType TEXT NOT NULL,
    ContentID TEXT,
    BlobID INTEGER NOT NULL,
    CTEncoding TEXT,
    CTSize INTEGER NOT NULL,
    CTLines INTEGER NOT NULL,
    PRIMARY KEY (MsgID, PartNum)
);
CREATE TABLE IF NOT EXISTS MsgAddresses (
    MsgID INTEGER NOT NULL,
    Kind TEXT NOT NULL,
    Address TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS Contacts (
    ContactID INTEGER PRIMARY KEY,
    Name TEXT
);
CREATE TABLE IF NOT EXISTS Addresses (
    ContactID INTEGER NOT NULL,
    Address TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS Convos (
    ConvoID INTEGER PRIMARY KEY,
    Subject TEXT
);
CREATE TABLE IF NOT EXISTS Labels (
    LabelID INTEGER PRIMARY KEY,
    Name TEXT UNIQUE
);
CREATE TABLE IF NOT EXISTS ApplePushDevices (
    Mailbox TEXT NOT NULL,
    AccountID TEXT NOT NULL,
    DeviceToken TEXT NOT NULL,
    PRIMARY KEY (Mailbox, AccountID, DeviceToken)
);
CREATE TRIGGER IF NOT EXISTS MailboxRenameBumpsUIDValidity
AFTER UPDATE OF Name ON Mailboxes
WHEN NEW.Name IS NOT NULL AND (OLD.Name IS NULL OR OLD.Name <> NEW.Name)
BEGIN
    UPDATE Mailboxes
    SET UIDValidity = (SELECT MAX(UIDValidity) FROM Mailboxes) + 1
    WHERE MailboxID = NEW.MailboxID;
END;
";

/// Mailboxes created for every fresh store.
const DEFAULT_MAILBOXES: &[(&str, u32)] = &[
    ("INBOX", 0),
    ("Archive", MailboxAttr::Archive as u32),
    ("Drafts", MailboxAttr::Drafts as u32),
    ("Sent", MailboxAttr::Sent as u32),
    ("Junk", MailboxAttr::Junk as u32),
    ("Trash", MailboxAttr::Trash as u32),
];

impl UserStore {
    /// Open (creating when absent) the store under `dir` for `user_id`.
    pub fn open(dir: &Path, user_id: i64) -> Result<Self, StorageError> {
        std::fs::create_dir_all(dir)?;
        let db_path = dir.join(format!("user-{}.db", user_id));
        let blobs_path = dir.join(format!("user-{}.blobs.db", user_id));
        let blobs_str = blobs_path.to_string_lossy().into_owned();

        let init = move |conn: &Connection| -> Result<(), rusqlite::Error> {
            conn.execute("ATTACH DATABASE ?1 AS blobs", [blobs_str.as_str()])?;
            Ok(())
        };
        let schema = |conn: &Connection| -> Result<(), rusqlite::Error> {
            conn.execute_batch(BLOBS_SCHEMA)?;
            conn.execute_batch(SCHEMA)?;
            let count: i64 =
                conn.query_row("SELECT COUNT(*) FROM Mailboxes", [], |r| r.get(0))?;
            if count == 0 {
                for (i, (name, attrs)) in DEFAULT_MAILBOXES.iter().enumerate() {
                    conn.execute(
                        "INSERT INTO Mailboxes (Name, UIDValidity, Attrs) VALUES (?1, ?2, ?3)",
                        params![name, (i + 1) as i64, attrs],
                    )?;
                    conn.execute(
                        "INSERT OR IGNORE INTO MailboxSequencing (Name, NextModSequence) \
                         VALUES (?1, 1)",
                        params![name],
                    )?;
                }
            }
            Ok(())
        };
        let pool = Pool::open(&db_path, 3, &init, &schema)?;
        Ok(Self { pool, user_id })
    }

    // ---- mailbox lifecycle ----

    pub fn mailboxes(&self, cancel: &CancelToken) -> Result<Vec<MailboxInfo>, StorageError> {
        let conn = self.pool.read(cancel)?;
        let mut stmt = conn.prepare(
            "SELECT MailboxID, Name, UIDValidity, NextUID, Attrs, Subscribed \
             FROM Mailboxes WHERE Name IS NOT NULL \
             ORDER BY (Name <> 'INBOX'), Name",
        )?;
        let rows = stmt
            .query_map([], row_to_mailbox)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn mailbox(
        &self,
        cancel: &CancelToken,
        name: &str,
    ) -> Result<Option<MailboxInfo>, StorageError> {
        let conn = self.pool.read(cancel)?;
        let info = conn
            .query_row(
                "SELECT MailboxID, Name, UIDValidity, NextUID, Attrs, Subscribed \
                 FROM Mailboxes WHERE Name = ?1",
                params![name],
                row_to_mailbox,
            )
            .optional()?;
        Ok(info)
    }

    pub fn create_mailbox(
        &self,
        cancel: &CancelToken,
        name: &str,
        attrs: u32,
    ) -> Result<MailboxInfo, StorageError> {
        check_name_rules(name)?;
        let mut writer = self.pool.write(cancel)?;
        let tx = writer.transaction()?;
        let exists: bool = tx
            .query_row(
                "SELECT 1 FROM Mailboxes WHERE Name = ?1",
                params![name],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        if exists {
            return Err(StorageError::Denied("Mailbox already exists".into()));
        }
        let uid_validity: i64 = tx.query_row(
            "SELECT COALESCE(MAX(UIDValidity), 0) + 1 FROM Mailboxes",
            [],
            |r| r.get(0),
        )?;
        tx.execute(
            "INSERT INTO Mailboxes (Name, UIDValidity, Attrs) VALUES (?1, ?2, ?3)",
            params![name, uid_validity, attrs],
        )?;
        let mailbox_id = tx.last_insert_rowid();
        tx.execute(
            "INSERT OR IGNORE INTO MailboxSequencing (Name, NextModSequence) VALUES (?1, 1)",
            params![name],
        )?;
        tx.commit()?;
        Ok(MailboxInfo {
            mailbox_id,
            name: name.to_string(),
            uid_validity,
            next_uid: 1,
            attrs,
            subscribed: true,
        })
    }

    /// Soft delete: the row keeps its history under `DeletedName`.
    pub fn delete_mailbox(&self, cancel: &CancelToken, name: &str) -> Result<(), StorageError> {
        if MAILBOX_RESERVED.iter().any(|r| *r == name) {
            return Err(StorageError::Denied(format!(
                "Mailbox {} cannot be deleted",
                name
            )));
        }
        let mut writer = self.pool.write(cancel)?;
        let tx = writer.transaction()?;
        let n = tx.execute(
            "UPDATE Mailboxes SET DeletedName = Name, Name = NULL WHERE Name = ?1",
            params![name],
        )?;
        if n == 0 {
            return Err(StorageError::NotFound);
        }
        tx.commit()?;
        Ok(())
    }

    pub fn rename_mailbox(
        &self,
        cancel: &CancelToken,
        old: &str,
        new: &str,
    ) -> Result<(), StorageError> {
        if MAILBOX_RESERVED.iter().any(|r| *r == old) && old != new {
            return Err(StorageError::Denied(format!(
                "Mailbox {} cannot be renamed",
                old
            )));
        }
        check_name_rules(new)?;
        let mut writer = self.pool.write(cancel)?;
        let tx = writer.transaction()?;
        let taken: bool = tx
            .query_row(
                "SELECT 1 FROM Mailboxes WHERE Name = ?1",
                params![new],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        if taken {
            return Err(StorageError::Denied("Mailbox already exists".into()));
        }
        // The rename trigger advances UIDValidity.
        let n = tx.execute(
            "UPDATE Mailboxes SET Name = ?1 WHERE Name = ?2",
            params![new, old],
        )?;
        if n == 0 {
            return Err(StorageError::NotFound);
        }
        tx.execute(
            "INSERT OR IGNORE INTO MailboxSequencing (Name, NextModSequence) VALUES (?1, 1)",
            params![new],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn set_subscribed(
        &self,
        cancel: &CancelToken,
        name: &str,
        subscribed: bool,
    ) -> Result<(), StorageError> {
        let writer = self.pool.write(cancel)?;
        let n = writer.execute(
            "UPDATE Mailboxes SET Subscribed = ?1 WHERE Name = ?2",
            params![subscribed, name],
        )?;
        if n == 0 {
            return Err(StorageError::NotFound);
        }
        Ok(())
    }

    /// STATUS/SELECT numbers, computed inside one read transaction.
    pub fn info(
        &self,
        cancel: &CancelToken,
        mailbox_id: i64,
    ) -> Result<MailboxStatus, StorageError> {
        let conn = self.pool.read(cancel)?;
        let tx = conn.unchecked_transaction()?;
        let (uid_next, uid_validity): (i64, i64) = tx.query_row(
            "SELECT NextUID, UIDValidity FROM Mailboxes WHERE MailboxID = ?1",
            params![mailbox_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )?;
        let mut stmt = tx.prepare(
            "SELECT Flags, ModSequence FROM Msgs \
             WHERE MailboxID = ?1 AND State = ?2 ORDER BY UID",
        )?;
        let mut messages = 0u32;
        let mut recent = 0u32;
        let mut unseen = 0u32;
        let mut first_unseen_seq = None;
        let mut highest_modseq = 0i64;
        let mut rows = stmt.query(params![mailbox_id, MSG_STATE_READY])?;
        while let Some(row) = rows.next()? {
            messages += 1;
            let flags = FlagSet::from_json(&row.get::<_, String>(0)?);
            let modseq: i64 = row.get(1)?;
            highest_modseq = highest_modseq.max(modseq);
            if flags.contains(FLAG_RECENT) {
                recent += 1;
            }
            if !flags.contains(FLAG_SEEN) {
                unseen += 1;
                if first_unseen_seq.is_none() {
                    first_unseen_seq = Some(messages);
                }
            }
        }
        drop(rows);
        drop(stmt);
        tx.commit()?;
        Ok(MailboxStatus {
            messages,
            recent,
            unseen,
            first_unseen_seq,
            uid_next,
            uid_validity,
            highest_modseq,
        })
    }

    pub fn highest_modseq(
        &self,
        cancel: &CancelToken,
        mailbox_id: i64,
    ) -> Result<i64, StorageError> {
        let conn = self.pool.read(cancel)?;
        let max: i64 = conn.query_row(
            "SELECT COALESCE(MAX(ModSequence), 0) FROM Msgs \
             WHERE MailboxID = ?1 AND State = ?2",
            params![mailbox_id, MSG_STATE_READY],
            |r| r.get(0),
        )?;
        Ok(max)
    }

    // ---- message rows ----

    /// Insert a cleaved message. The row is created `Fetching`, contents
    /// land in blobs under savepoints, and the row flips to `Ready` in
    /// the same transaction. A duplicate raw hash short-circuits to the
    /// existing UID.
    pub fn append_msg(
        &self,
        cancel: &CancelToken,
        mailbox_id: i64,
        msg: &mut Msg,
        internal_date: Option<DateTime<Utc>>,
    ) -> Result<AppendOutcome, StorageError> {
        let mut writer = self.pool.write(cancel)?;
        let mut tx = writer.transaction()?;

        let existing: Option<(i64, i64, i64)> = tx
            .query_row(
                "SELECT MsgID, UID, ModSequence FROM Msgs \
                 WHERE RawHash = ?1 AND State = ?2",
                params![msg.raw_hash.as_slice(), MSG_STATE_READY],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .optional()?;
        if let Some((msg_id, uid, modseq)) = existing {
            return Ok(AppendOutcome {
                msg_id,
                uid,
                modseq,
                duplicate: true,
            });
        }

        let mailbox_name: String = tx.query_row(
            "SELECT Name FROM Mailboxes WHERE MailboxID = ?1 AND Name IS NOT NULL",
            params![mailbox_id],
            |r| r.get(0),
        )?;
        let uid = alloc_uid(&tx, mailbox_id)?;
        let modseq = alloc_modseq(&tx, &mailbox_name)?;
        let date = internal_date.unwrap_or(msg.date).timestamp();

        tx.execute(
            "INSERT INTO Msgs (MailboxID, UID, ModSequence, State, Flags, Date, Seed, \
             RawHash, EncodedSize) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                mailbox_id,
                uid,
                modseq,
                MSG_STATE_FETCHING,
                msg.flags.to_json(),
                date,
                msg.seed as i64,
                msg.raw_hash.as_slice(),
                msg.encoded_size as i64,
            ],
        )?;
        let msg_id = tx.last_insert_rowid();

        let mut hdr_bytes = Vec::new();
        msg.headers
            .encode(&mut hdr_bytes)
            .map_err(StorageError::Io)?;
        let hdrs_blob = insert_blob(&tx, &hdr_bytes, None)?;
        tx.execute(
            "UPDATE Msgs SET HdrsBlobID = ?1 WHERE MsgID = ?2",
            params![hdrs_blob, msg_id],
        )?;

        for part in &mut msg.parts {
            let sp = tx.savepoint()?;
            let blob_id = write_part_blob(&sp, part)?;
            sp.execute(
                "INSERT INTO MsgParts (MsgID, PartNum, Name, IsBody, IsAttachment, \
                 IsCompressed, CompressedSize, ContentType, ContentID, BlobID, \
                 CTEncoding, CTSize, CTLines) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    msg_id,
                    part.part_num,
                    part.name,
                    part.is_body,
                    part.is_attachment,
                    part.is_compressed,
                    part.compressed_size.map(|s| s as i64),
                    part.content_type,
                    part.content_id,
                    blob_id,
                    part.cte,
                    part.ct_size as i64,
                    part.ct_lines,
                ],
            )?;
            sp.commit()?;
            part.blob_id = Some(blob_id);
        }

        for (kind, key) in [("from", "From"), ("to", "To"), ("cc", "Cc")] {
            if let Some(value) = msg.headers.get_str(key) {
                for address in extract_addresses(&value) {
                    tx.execute(
                        "INSERT INTO MsgAddresses (MsgID, Kind, Address) VALUES (?1, ?2, ?3)",
                        params![msg_id, kind, address],
                    )?;
                }
            }
        }

        tx.execute(
            "UPDATE Msgs SET State = ?1 WHERE MsgID = ?2",
            params![MSG_STATE_READY, msg_id],
        )?;
        tx.commit()?;
        msg.id = msg_id;
        Ok(AppendOutcome {
            msg_id,
            uid,
            modseq,
            duplicate: false,
        })
    }

    /// Ready rows ordered by UID; sequence numbers are positions herein.
    pub fn ready_rows(
        &self,
        cancel: &CancelToken,
        mailbox_id: i64,
    ) -> Result<Vec<MsgRow>, StorageError> {
        let conn = self.pool.read(cancel)?;
        let mut stmt = conn.prepare(
            "SELECT MsgID, UID, ModSequence, Flags, Date, EncodedSize FROM Msgs \
             WHERE MailboxID = ?1 AND State = ?2 ORDER BY UID",
        )?;
        let rows = stmt
            .query_map(params![mailbox_id, MSG_STATE_READY], |r| {
                Ok(MsgRow {
                    msg_id: r.get(0)?,
                    uid: r.get(1)?,
                    modseq: r.get(2)?,
                    flags: FlagSet::from_json(&r.get::<_, String>(3)?),
                    date: r.get(4)?,
                    size: r.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// UIDs expunged after `modseq` (QRESYNC VANISHED answers).
    pub fn expunged_uids_since(
        &self,
        cancel: &CancelToken,
        mailbox_id: i64,
        modseq: i64,
    ) -> Result<Vec<i64>, StorageError> {
        let conn = self.pool.read(cancel)?;
        let mut stmt = conn.prepare(
            "SELECT UID FROM Msgs \
             WHERE MailboxID = ?1 AND State = ?2 AND ModSequence > ?3 ORDER BY UID",
        )?;
        let uids = stmt
            .query_map(params![mailbox_id, MSG_STATE_EXPUNGED, modseq], |r| {
                r.get(0)
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(uids)
    }

    pub fn load_headers(
        &self,
        cancel: &CancelToken,
        msg_id: i64,
    ) -> Result<Headers, StorageError> {
        let conn = self.pool.read(cancel)?;
        let blob_id: i64 = conn.query_row(
            "SELECT HdrsBlobID FROM Msgs WHERE MsgID = ?1",
            params![msg_id],
            |r| r.get(0),
        )?;
        let bytes = read_blob(&conn, blob_id)?;
        let (headers, _) =
            Headers::parse(&bytes).map_err(|e| StorageError::Denied(e.to_string()))?;
        Ok(headers)
    }

    /// Materialize the full message for rebuilding wire bytes.
    pub fn load_msg(&self, cancel: &CancelToken, msg_id: i64) -> Result<Msg, StorageError> {
        let conn = self.pool.read(cancel)?;
        let (flags_json, date, seed, hdrs_blob, raw_hash, encoded_size): (
            String,
            i64,
            i64,
            i64,
            Vec<u8>,
            i64,
        ) = conn.query_row(
            "SELECT Flags, Date, Seed, HdrsBlobID, RawHash, EncodedSize \
             FROM Msgs WHERE MsgID = ?1",
            params![msg_id],
            |r| {
                Ok((
                    r.get(0)?,
                    r.get(1)?,
                    r.get(2)?,
                    r.get(3)?,
                    r.get(4)?,
                    r.get(5)?,
                ))
            },
        )?;
        let hdr_bytes = read_blob(&conn, hdrs_blob)?;
        let (headers, _) =
            Headers::parse(&hdr_bytes).map_err(|e| StorageError::Denied(e.to_string()))?;

        let mut stmt = conn.prepare(
            "SELECT PartNum, Name, IsBody, IsAttachment, IsCompressed, CompressedSize, \
             ContentType, ContentID, BlobID, CTEncoding, CTSize, CTLines \
             FROM MsgParts WHERE MsgID = ?1 ORDER BY PartNum",
        )?;
        let summaries = stmt
            .query_map(params![msg_id], |r| {
                Ok((
                    r.get::<_, u32>(0)?,
                    r.get::<_, Option<String>>(1)?,
                    r.get::<_, bool>(2)?,
                    r.get::<_, bool>(3)?,
                    r.get::<_, bool>(4)?,
                    r.get::<_, Option<i64>>(5)?,
                    r.get::<_, String>(6)?,
                    r.get::<_, Option<String>>(7)?,
                    r.get::<_, i64>(8)?,
                    r.get::<_, Option<String>>(9)?,
                    r.get::<_, i64>(10)?,
                    r.get::<_, u32>(11)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        drop(stmt);

        let mut parts = Vec::with_capacity(summaries.len());
        for (
            part_num,
            name,
            is_body,
            is_attachment,
            is_compressed,
            compressed_size,
            content_type,
            content_id,
            blob_id,
            cte,
            ct_size,
            ct_lines,
        ) in summaries
        {
            let stored = read_blob(&conn, blob_id)?;
            let data = if is_compressed {
                let mut decoder = GzDecoder::new(&stored[..]);
                let mut out = Vec::with_capacity(ct_size as usize);
                decoder.read_to_end(&mut out)?;
                out
            } else {
                stored
            };
            parts.push(Part {
                part_num,
                name,
                is_body,
                is_attachment,
                is_compressed,
                compressed_size: compressed_size.map(|s| s as u64),
                content_type,
                content_id,
                content: Content::from_vec(data),
                blob_id: Some(blob_id),
                cte,
                ct_size: ct_size as u64,
                ct_lines,
            });
        }

        let mut hash = [0u8; 32];
        if raw_hash.len() == 32 {
            hash.copy_from_slice(&raw_hash);
        }
        Ok(Msg {
            id: msg_id,
            headers,
            seed: seed as u64,
            date: Utc.timestamp_opt(date, 0).single().unwrap_or_else(Utc::now),
            flags: FlagSet::from_json(&flags_json),
            parts,
            encoded_size: encoded_size as u64,
            raw_hash: hash,
        })
    }

    /// Apply a STORE command. One new modseq covers the whole command;
    /// `UnchangedSince` conflicts collect in `failed_modified`; a
    /// no-change Replace under `UnchangedSince` still reports the row at
    /// its old modseq.
    pub fn store_flags(
        &self,
        cancel: &CancelToken,
        mailbox_id: i64,
        uids: &[i64],
        op: &FlagsOp,
    ) -> Result<StoreFlagsOutcome, StorageError> {
        let mut writer = self.pool.write(cancel)?;
        let tx = writer.transaction()?;
        let mailbox_name: String = tx.query_row(
            "SELECT Name FROM Mailboxes WHERE MailboxID = ?1 AND Name IS NOT NULL",
            params![mailbox_id],
            |r| r.get(0),
        )?;
        let new_modseq = alloc_modseq(&tx, &mailbox_name)?;

        // \Recent is never client-settable.
        let mut requested = op.flags.clone();
        requested.remove(FLAG_RECENT);

        let mut outcome = StoreFlagsOutcome::default();
        for &uid in uids {
            let row: Option<(i64, String, i64)> = tx
                .query_row(
                    "SELECT MsgID, Flags, ModSequence FROM Msgs \
                     WHERE MailboxID = ?1 AND UID = ?2 AND State = ?3",
                    params![mailbox_id, uid, MSG_STATE_READY],
                    |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
                )
                .optional()?;
            let Some((msg_id, flags_json, row_modseq)) = row else {
                continue;
            };
            let old_flags = FlagSet::from_json(&flags_json);

            if op.mode == FlagMode::Replace {
                if let Some(unchanged_since) = op.unchanged_since {
                    if row_modseq > unchanged_since {
                        outcome.failed_modified.push(uid);
                        continue;
                    }
                }
            }

            let mut new_flags = match op.mode {
                FlagMode::Add => {
                    let mut f = old_flags.clone();
                    for flag in requested.iter() {
                        f.insert(flag);
                    }
                    f
                }
                FlagMode::Remove => {
                    let mut f = old_flags.clone();
                    for flag in requested.iter() {
                        f.remove(flag);
                    }
                    f
                }
                FlagMode::Replace => requested.clone(),
            };
            if old_flags.contains(FLAG_RECENT) {
                new_flags.insert(FLAG_RECENT);
            }

            if new_flags == old_flags {
                if op.mode == FlagMode::Replace && op.unchanged_since.is_some() {
                    outcome.stored.push(StoredFlag {
                        uid,
                        flags: old_flags,
                        modseq: row_modseq,
                    });
                }
                continue;
            }
            tx.execute(
                "UPDATE Msgs SET Flags = ?1, ModSequence = ?2 WHERE MsgID = ?3",
                params![new_flags.to_json(), new_modseq, msg_id],
            )?;
            outcome.stored.push(StoredFlag {
                uid,
                flags: new_flags,
                modseq: new_modseq,
            });
        }
        tx.commit()?;
        Ok(outcome)
    }

    /// Mark `\Deleted` rows (optionally restricted to `uids`) expunged.
    /// Returns the expunged UIDs in ascending order.
    pub fn expunge(
        &self,
        cancel: &CancelToken,
        mailbox_id: i64,
        uids: Option<&[i64]>,
    ) -> Result<Vec<i64>, StorageError> {
        let mut writer = self.pool.write(cancel)?;
        let tx = writer.transaction()?;
        let mailbox_name: String = tx.query_row(
            "SELECT Name FROM Mailboxes WHERE MailboxID = ?1 AND Name IS NOT NULL",
            params![mailbox_id],
            |r| r.get(0),
        )?;
        let mut stmt = tx.prepare(
            "SELECT MsgID, UID, Flags FROM Msgs \
             WHERE MailboxID = ?1 AND State = ?2 ORDER BY UID",
        )?;
        let candidates = stmt
            .query_map(params![mailbox_id, MSG_STATE_READY], |r| {
                Ok((
                    r.get::<_, i64>(0)?,
                    r.get::<_, i64>(1)?,
                    r.get::<_, String>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        drop(stmt);

        let mut doomed = Vec::new();
        for (msg_id, uid, flags_json) in candidates {
            if !FlagSet::from_json(&flags_json).contains(crate::msg::FLAG_DELETED) {
                continue;
            }
            if let Some(set) = uids {
                if !set.contains(&uid) {
                    continue;
                }
            }
            doomed.push((msg_id, uid));
        }
        if doomed.is_empty() {
            tx.commit()?;
            return Ok(Vec::new());
        }
        let modseq = alloc_modseq(&tx, &mailbox_name)?;
        let now = Utc::now().timestamp();
        for (msg_id, _) in &doomed {
            tx.execute(
                "UPDATE Msgs SET State = ?1, ExpungedAt = ?2, ModSequence = ?3 \
                 WHERE MsgID = ?4",
                params![MSG_STATE_EXPUNGED, now, modseq, msg_id],
            )?;
        }
        tx.commit()?;
        Ok(doomed.into_iter().map(|(_, uid)| uid).collect())
    }

    /// Copy rows into `dst`: fresh UIDs, one fresh modseq, shared header
    /// blob and part rows. Returns `(src_uid, dst_uid)` pairs.
    pub fn copy_msgs(
        &self,
        cancel: &CancelToken,
        src_mailbox_id: i64,
        dst_mailbox_id: i64,
        uids: &[i64],
    ) -> Result<Vec<(i64, i64)>, StorageError> {
        let mut writer = self.pool.write(cancel)?;
        let tx = writer.transaction()?;
        let dst_name: String = tx.query_row(
            "SELECT Name FROM Mailboxes WHERE MailboxID = ?1 AND Name IS NOT NULL",
            params![dst_mailbox_id],
            |r| r.get(0),
        )?;
        let dst_modseq = alloc_modseq(&tx, &dst_name)?;
        let mut pairs = Vec::new();
        for &src_uid in uids {
            let row: Option<(i64, String, i64, i64, Vec<u8>, i64, i64)> = tx
                .query_row(
                    "SELECT MsgID, Flags, Date, Seed, RawHash, EncodedSize, HdrsBlobID \
                     FROM Msgs WHERE MailboxID = ?1 AND UID = ?2 AND State = ?3",
                    params![src_mailbox_id, src_uid, MSG_STATE_READY],
                    |r| {
                        Ok((
                            r.get(0)?,
                            r.get(1)?,
                            r.get(2)?,
                            r.get(3)?,
                            r.get(4)?,
                            r.get(5)?,
                            r.get(6)?,
                        ))
                    },
                )
                .optional()?;
            let Some((src_msg_id, flags_json, date, seed, raw_hash, size, hdrs_blob)) = row
            else {
                continue;
            };
            let dst_uid = alloc_uid(&tx, dst_mailbox_id)?;
            let mut flags = FlagSet::from_json(&flags_json);
            flags.remove(FLAG_RECENT);
            tx.execute(
                "INSERT INTO Msgs (MailboxID, UID, ModSequence, State, Flags, Date, Seed, \
                 HdrsBlobID, RawHash, EncodedSize) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    dst_mailbox_id,
                    dst_uid,
                    dst_modseq,
                    MSG_STATE_READY,
                    flags.to_json(),
                    date,
                    seed,
                    hdrs_blob,
                    raw_hash,
                    size,
                ],
            )?;
            let new_msg_id = tx.last_insert_rowid();
            tx.execute(
                "INSERT INTO MsgParts (MsgID, PartNum, Name, IsBody, IsAttachment, \
                 IsCompressed, CompressedSize, ContentType, ContentID, BlobID, CTEncoding, \
                 CTSize, CTLines) \
                 SELECT ?1, PartNum, Name, IsBody, IsAttachment, IsCompressed, \
                 CompressedSize, ContentType, ContentID, BlobID, CTEncoding, CTSize, CTLines \
                 FROM MsgParts WHERE MsgID = ?2",
                params![new_msg_id, src_msg_id],
            )?;
            pairs.push((src_uid, dst_uid));
        }
        tx.commit()?;
        Ok(pairs)
    }

    /// Move rows: the row changes mailbox and UID in place; an expunged
    /// tombstone preserves the source position.
    pub fn move_msgs(
        &self,
        cancel: &CancelToken,
        src_mailbox_id: i64,
        dst_mailbox_id: i64,
        uids: &[i64],
    ) -> Result<Vec<(i64, i64)>, StorageError> {
        let mut writer = self.pool.write(cancel)?;
        let tx = writer.transaction()?;
        let src_name: String = tx.query_row(
            "SELECT Name FROM Mailboxes WHERE MailboxID = ?1 AND Name IS NOT NULL",
            params![src_mailbox_id],
            |r| r.get(0),
        )?;
        let dst_name: String = tx.query_row(
            "SELECT Name FROM Mailboxes WHERE MailboxID = ?1 AND Name IS NOT NULL",
            params![dst_mailbox_id],
            |r| r.get(0),
        )?;
        let dst_modseq = alloc_modseq(&tx, &dst_name)?;
        let src_modseq = alloc_modseq(&tx, &src_name)?;
        let now = Utc::now().timestamp();
        let mut pairs = Vec::new();
        for &src_uid in uids {
            let row: Option<(i64, i64, i64, Vec<u8>, i64)> = tx
                .query_row(
                    "SELECT MsgID, Date, Seed, RawHash, EncodedSize FROM Msgs \
                     WHERE MailboxID = ?1 AND UID = ?2 AND State = ?3",
                    params![src_mailbox_id, src_uid, MSG_STATE_READY],
                    |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?)),
                )
                .optional()?;
            let Some((msg_id, date, seed, raw_hash, size)) = row else {
                continue;
            };
            let dst_uid = alloc_uid(&tx, dst_mailbox_id)?;
            tx.execute(
                "UPDATE Msgs SET MailboxID = ?1, UID = ?2, ModSequence = ?3 WHERE MsgID = ?4",
                params![dst_mailbox_id, dst_uid, dst_modseq, msg_id],
            )?;
            tx.execute(
                "INSERT INTO Msgs (MailboxID, UID, ModSequence, State, Flags, Date, Seed, \
                 RawHash, EncodedSize, ExpungedAt) \
                 VALUES (?1, ?2, ?3, ?4, '{}', ?5, ?6, ?7, ?8, ?9)",
                params![
                    src_mailbox_id,
                    src_uid,
                    src_modseq,
                    MSG_STATE_EXPUNGED,
                    date,
                    seed,
                    raw_hash,
                    size,
                    now,
                ],
            )?;
            pairs.push((src_uid, dst_uid));
        }
        tx.commit()?;
        Ok(pairs)
    }

    // ---- push devices ----

    /// Idempotent on `(mailbox, account_id, device_token)`.
    pub fn register_push_device(
        &self,
        cancel: &CancelToken,
        mailbox: &str,
        device: &PushDevice,
    ) -> Result<(), StorageError> {
        let writer = self.pool.write(cancel)?;
        writer.execute(
            "INSERT OR IGNORE INTO ApplePushDevices (Mailbox, AccountID, DeviceToken) \
             VALUES (?1, ?2, ?3)",
            params![mailbox, device.account_id, device.device_token],
        )?;
        Ok(())
    }

    pub fn push_devices(
        &self,
        cancel: &CancelToken,
        mailbox: &str,
    ) -> Result<Vec<PushDevice>, StorageError> {
        let conn = self.pool.read(cancel)?;
        let mut stmt = conn.prepare(
            "SELECT AccountID, DeviceToken FROM ApplePushDevices WHERE Mailbox = ?1",
        )?;
        let devices = stmt
            .query_map(params![mailbox], |r| {
                Ok(PushDevice {
                    account_id: r.get(0)?,
                    device_token: r.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(devices)
    }
}

fn row_to_mailbox(r: &rusqlite::Row<'_>) -> Result<MailboxInfo, rusqlite::Error> {
    Ok(MailboxInfo {
        mailbox_id: r.get(0)?,
        name: r.get(1)?,
        uid_validity: r.get(2)?,
        next_uid: r.get(3)?,
        attrs: r.get(4)?,
        subscribed: r.get(5)?,
    })
}

fn check_name_rules(name: &str) -> Result<(), StorageError> {
    if name.is_empty() {
        return Err(StorageError::Denied("Invalid mailbox name".into()));
    }
    for parent in MAILBOX_NO_CHILDREN {
        if name.len() > parent.len() + 1 && name.starts_with(parent) && name.as_bytes()[parent.len()] == b'/'
        {
            return Err(StorageError::Denied(format!(
                "Mailbox {} cannot have children",
                parent
            )));
        }
    }
    Ok(())
}

/// Compare-and-set UID allocation under the write transaction.
fn alloc_uid(tx: &Transaction<'_>, mailbox_id: i64) -> Result<i64, StorageError> {
    loop {
        let current: i64 = tx.query_row(
            "SELECT NextUID FROM Mailboxes WHERE MailboxID = ?1",
            params![mailbox_id],
            |r| r.get(0),
        )?;
        let n = tx.execute(
            "UPDATE Mailboxes SET NextUID = ?1 WHERE MailboxID = ?2 AND NextUID = ?3",
            params![current + 1, mailbox_id, current],
        )?;
        if n == 1 {
            return Ok(current);
        }
    }
}

/// Compare-and-set MODSEQ allocation, keyed by mailbox name so a
/// recreated name continues its sequence.
fn alloc_modseq(tx: &Transaction<'_>, mailbox_name: &str) -> Result<i64, StorageError> {
    tx.execute(
        "INSERT OR IGNORE INTO MailboxSequencing (Name, NextModSequence) VALUES (?1, 1)",
        params![mailbox_name],
    )?;
    loop {
        let current: i64 = tx.query_row(
            "SELECT NextModSequence FROM MailboxSequencing WHERE Name = ?1",
            params![mailbox_name],
            |r| r.get(0),
        )?;
        let n = tx.execute(
            "UPDATE MailboxSequencing SET NextModSequence = ?1 \
             WHERE Name = ?2 AND NextModSequence = ?3",
            params![current + 1, mailbox_name, current],
        )?;
        if n == 1 {
            return Ok(current);
        }
    }
}

fn write_part_blob(conn: &Connection, part: &mut Part) -> Result<i64, StorageError> {
    let data = part.content.read_all()?;
    let sha: [u8; 32] = Sha256::digest(&data).into();
    let stored = if part.is_compressed {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(&data)?;
        enc.finish()?
    } else {
        data
    };
    insert_blob(conn, &stored, Some(&sha))
}

/// Crude addr-spec extraction for the MsgAddresses index.
fn extract_addresses(value: &str) -> Vec<String> {
    let mut out = Vec::new();
    for chunk in value.split(',') {
        let chunk = chunk.trim();
        let candidate = match (chunk.rfind('<'), chunk.rfind('>')) {
            (Some(a), Some(b)) if a < b => &chunk[a + 1..b],
            _ => chunk,
        };
        let candidate = candidate.trim();
        if candidate.contains('@') && !candidate.contains(' ') {
            out.push(candidate.to_ascii_lowercase());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mime::cleave;
    use crate::msg::FLAG_DELETED;

    fn store() -> (tempfile::TempDir, UserStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = UserStore::open(dir.path(), 1).unwrap();
        (dir, store)
    }

    fn sample_msg(body: &str) -> Msg {
        let raw = format!("From: a@x\r\nTo: b@y\r\nSubject: t\r\n\r\n{}\r\n", body);
        cleave(raw.as_bytes()).unwrap()
    }

    fn inbox_id(store: &UserStore) -> i64 {
        store
            .mailbox(&CancelToken::never(), "INBOX")
            .unwrap()
            .unwrap()
            .mailbox_id
    }

    #[test]
    fn default_mailboxes_inbox_first() {
        let (_dir, store) = store();
        let boxes = store.mailboxes(&CancelToken::never()).unwrap();
        assert_eq!(boxes[0].name, "INBOX");
        let rest: Vec<&str> = boxes[1..].iter().map(|m| m.name.as_str()).collect();
        let mut sorted = rest.clone();
        sorted.sort();
        assert_eq!(rest, sorted);
    }

    #[test]
    fn append_assigns_sequential_uids() {
        let (_dir, store) = store();
        let cancel = CancelToken::never();
        let inbox = inbox_id(&store);
        let a = store
            .append_msg(&cancel, inbox, &mut sample_msg("one"), None)
            .unwrap();
        let b = store
            .append_msg(&cancel, inbox, &mut sample_msg("two"), None)
            .unwrap();
        assert_eq!(a.uid, 1);
        assert_eq!(b.uid, 2);
        assert!(b.modseq > a.modseq);
        assert!(!a.duplicate);
    }

    #[test]
    fn duplicate_raw_hash_returns_existing_uid() {
        let (_dir, store) = store();
        let cancel = CancelToken::never();
        let inbox = inbox_id(&store);
        let first = store
            .append_msg(&cancel, inbox, &mut sample_msg("same"), None)
            .unwrap();
        let second = store
            .append_msg(&cancel, inbox, &mut sample_msg("same"), None)
            .unwrap();
        assert!(second.duplicate);
        assert_eq!(second.uid, first.uid);
        assert_eq!(store.ready_rows(&cancel, inbox).unwrap().len(), 1);
    }

    #[test]
    fn load_msg_roundtrips_parts() {
        let (_dir, store) = store();
        let cancel = CancelToken::never();
        let inbox = inbox_id(&store);
        let mut msg = sample_msg("round trip body");
        let out = store.append_msg(&cancel, inbox, &mut msg, None).unwrap();
        let mut loaded = store.load_msg(&cancel, out.msg_id).unwrap();
        assert_eq!(loaded.seed, msg.seed);
        assert_eq!(loaded.parts.len(), 1);
        assert_eq!(
            loaded.parts[0].content.read_all().unwrap(),
            b"round trip body\r\n"
        );
        assert_eq!(loaded.headers.get_str("subject").as_deref(), Some("t"));
    }

    #[test]
    fn uidvalidity_increases_across_rename_delete_recreate() {
        let (_dir, store) = store();
        let cancel = CancelToken::never();
        let foo = store.create_mailbox(&cancel, "Foo", 0).unwrap();
        let uv1 = foo.uid_validity;
        store.rename_mailbox(&cancel, "Foo", "Bar").unwrap();
        let bar = store.mailbox(&cancel, "Bar").unwrap().unwrap();
        assert!(bar.uid_validity > uv1);
        store.delete_mailbox(&cancel, "Bar").unwrap();
        assert!(store.mailbox(&cancel, "Bar").unwrap().is_none());
        let again = store.create_mailbox(&cancel, "Bar", 0).unwrap();
        assert!(again.uid_validity > bar.uid_validity);
    }

    #[test]
    fn modseq_continues_for_recreated_name() {
        let (_dir, store) = store();
        let cancel = CancelToken::never();
        store.create_mailbox(&cancel, "Tmp", 0).unwrap();
        let id = store.mailbox(&cancel, "Tmp").unwrap().unwrap().mailbox_id;
        let out = store
            .append_msg(&cancel, id, &mut sample_msg("x"), None)
            .unwrap();
        store.delete_mailbox(&cancel, "Tmp").unwrap();
        let recreated = store.create_mailbox(&cancel, "Tmp", 0).unwrap();
        let out2 = store
            .append_msg(&cancel, recreated.mailbox_id, &mut sample_msg("y"), None)
            .unwrap();
        assert!(out2.modseq > out.modseq);
    }

    #[test]
    fn reserved_names_cannot_be_deleted() {
        let (_dir, store) = store();
        let cancel = CancelToken::never();
        for name in ["INBOX", "Sent", "Trash"] {
            assert!(matches!(
                store.delete_mailbox(&cancel, name),
                Err(StorageError::Denied(_))
            ));
        }
    }

    #[test]
    fn system_prefixes_cannot_have_children() {
        let (_dir, store) = store();
        let cancel = CancelToken::never();
        assert!(matches!(
            store.create_mailbox(&cancel, "INBOX/sub", 0),
            Err(StorageError::Denied(_))
        ));
        // Other prefixes are fine.
        assert!(store.create_mailbox(&cancel, "Projects/sub", 0).is_ok());
    }

    #[test]
    fn store_flags_modes() {
        let (_dir, store) = store();
        let cancel = CancelToken::never();
        let inbox = inbox_id(&store);
        let out = store
            .append_msg(&cancel, inbox, &mut sample_msg("flags"), None)
            .unwrap();

        let add = FlagsOp {
            mode: FlagMode::Add,
            flags: FlagSet::from_iter([FLAG_SEEN]),
            unchanged_since: None,
        };
        let result = store.store_flags(&cancel, inbox, &[out.uid], &add).unwrap();
        assert_eq!(result.stored.len(), 1);
        assert!(result.stored[0].flags.contains(FLAG_SEEN));
        assert!(result.stored[0].modseq > out.modseq);

        // Adding the same flag again changes nothing and emits nothing.
        let result = store.store_flags(&cancel, inbox, &[out.uid], &add).unwrap();
        assert!(result.stored.is_empty());

        let remove = FlagsOp {
            mode: FlagMode::Remove,
            flags: FlagSet::from_iter([FLAG_SEEN]),
            unchanged_since: None,
        };
        let result = store
            .store_flags(&cancel, inbox, &[out.uid], &remove)
            .unwrap();
        assert_eq!(result.stored.len(), 1);
        assert!(!result.stored[0].flags.contains(FLAG_SEEN));
    }

    #[test]
    fn unchanged_since_rejects_modified_rows() {
        let (_dir, store) = store();
        let cancel = CancelToken::never();
        let inbox = inbox_id(&store);
        let out = store
            .append_msg(&cancel, inbox, &mut sample_msg("condstore"), None)
            .unwrap();
        // Bump the row's modseq.
        let bump = FlagsOp {
            mode: FlagMode::Add,
            flags: FlagSet::from_iter([FLAG_SEEN]),
            unchanged_since: None,
        };
        let bumped = store
            .store_flags(&cancel, inbox, &[out.uid], &bump)
            .unwrap();
        let row_modseq = bumped.stored[0].modseq;

        let replace = FlagsOp {
            mode: FlagMode::Replace,
            flags: FlagSet::from_iter(["alt"]),
            unchanged_since: Some(row_modseq - 1),
        };
        let result = store
            .store_flags(&cancel, inbox, &[out.uid], &replace)
            .unwrap();
        assert_eq!(result.failed_modified, vec![out.uid]);
        assert!(result.stored.is_empty());

        // No-change replace under UNCHANGEDSINCE reports the old modseq.
        let replace_same = FlagsOp {
            mode: FlagMode::Replace,
            flags: FlagSet::from_iter([FLAG_SEEN]),
            unchanged_since: Some(row_modseq),
        };
        let result = store
            .store_flags(&cancel, inbox, &[out.uid], &replace_same)
            .unwrap();
        assert_eq!(result.stored.len(), 1);
        assert_eq!(result.stored[0].modseq, row_modseq);
    }

    #[test]
    fn recent_flag_not_client_settable() {
        let (_dir, store) = store();
        let cancel = CancelToken::never();
        let inbox = inbox_id(&store);
        let out = store
            .append_msg(&cancel, inbox, &mut sample_msg("recent"), None)
            .unwrap();
        let add = FlagsOp {
            mode: FlagMode::Add,
            flags: FlagSet::from_iter([FLAG_RECENT]),
            unchanged_since: None,
        };
        let result = store.store_flags(&cancel, inbox, &[out.uid], &add).unwrap();
        assert!(result.stored.is_empty());
    }

    #[test]
    fn expunge_returns_deleted_uids() {
        let (_dir, store) = store();
        let cancel = CancelToken::never();
        let inbox = inbox_id(&store);
        let mut uids = Vec::new();
        for i in 0..4 {
            let out = store
                .append_msg(&cancel, inbox, &mut sample_msg(&format!("m{}", i)), None)
                .unwrap();
            uids.push(out.uid);
        }
        let mark = FlagsOp {
            mode: FlagMode::Add,
            flags: FlagSet::from_iter([FLAG_DELETED]),
            unchanged_since: None,
        };
        store
            .store_flags(&cancel, inbox, &[uids[1], uids[3]], &mark)
            .unwrap();
        let expunged = store.expunge(&cancel, inbox, None).unwrap();
        assert_eq!(expunged, vec![uids[1], uids[3]]);
        assert_eq!(store.ready_rows(&cancel, inbox).unwrap().len(), 2);
        // Tombstones answer VANISHED queries.
        let vanished = store.expunged_uids_since(&cancel, inbox, 0).unwrap();
        assert_eq!(vanished, vec![uids[1], uids[3]]);
    }

    #[test]
    fn copy_and_move_between_mailboxes() {
        let (_dir, store) = store();
        let cancel = CancelToken::never();
        let inbox = inbox_id(&store);
        let archive = store
            .mailbox(&cancel, "Archive")
            .unwrap()
            .unwrap()
            .mailbox_id;
        let a = store
            .append_msg(&cancel, inbox, &mut sample_msg("copy me"), None)
            .unwrap();
        let b = store
            .append_msg(&cancel, inbox, &mut sample_msg("move me"), None)
            .unwrap();

        let copied = store
            .copy_msgs(&cancel, inbox, archive, &[a.uid])
            .unwrap();
        assert_eq!(copied.len(), 1);
        assert_eq!(copied[0].0, a.uid);
        assert_eq!(store.ready_rows(&cancel, inbox).unwrap().len(), 2);
        assert_eq!(store.ready_rows(&cancel, archive).unwrap().len(), 1);

        let before_dst = store.ready_rows(&cancel, archive).unwrap();
        let max_dst_modseq = before_dst.iter().map(|r| r.modseq).max().unwrap();
        let moved = store.move_msgs(&cancel, inbox, archive, &[b.uid]).unwrap();
        assert_eq!(moved.len(), 1);
        assert_eq!(store.ready_rows(&cancel, inbox).unwrap().len(), 1);
        let after_dst = store.ready_rows(&cancel, archive).unwrap();
        assert_eq!(after_dst.len(), 2);
        let moved_row = after_dst
            .iter()
            .find(|r| r.uid == moved[0].1)
            .expect("moved row in destination");
        assert!(moved_row.modseq > max_dst_modseq);
        // Source keeps a tombstone.
        let vanished = store.expunged_uids_since(&cancel, inbox, 0).unwrap();
        assert_eq!(vanished, vec![b.uid]);
    }

    #[test]
    fn info_counts_and_first_unseen() {
        let (_dir, store) = store();
        let cancel = CancelToken::never();
        let inbox = inbox_id(&store);
        for i in 0..3 {
            let mut msg = sample_msg(&format!("info {}", i));
            msg.flags.insert(FLAG_RECENT);
            store.append_msg(&cancel, inbox, &mut msg, None).unwrap();
        }
        let mark_seen = FlagsOp {
            mode: FlagMode::Add,
            flags: FlagSet::from_iter([FLAG_SEEN]),
            unchanged_since: None,
        };
        store.store_flags(&cancel, inbox, &[1], &mark_seen).unwrap();
        let status = store.info(&cancel, inbox).unwrap();
        assert_eq!(status.messages, 3);
        assert_eq!(status.recent, 3);
        assert_eq!(status.unseen, 2);
        assert_eq!(status.first_unseen_seq, Some(2));
        assert_eq!(status.uid_next, 4);
        assert!(status.highest_modseq > 0);
    }

    #[test]
    fn push_device_registration_is_idempotent() {
        let (_dir, store) = store();
        let cancel = CancelToken::never();
        let device = PushDevice {
            account_id: "acct".into(),
            device_token: "tok".into(),
        };
        store
            .register_push_device(&cancel, "INBOX", &device)
            .unwrap();
        store
            .register_push_device(&cancel, "INBOX", &device)
            .unwrap();
        assert_eq!(store.push_devices(&cancel, "INBOX").unwrap().len(), 1);
    }

    #[test]
    fn highest_modseq_tracks_live_rows() {
        let (_dir, store) = store();
        let cancel = CancelToken::never();
        let inbox = inbox_id(&store);
        let out = store
            .append_msg(&cancel, inbox, &mut sample_msg("hm"), None)
            .unwrap();
        assert_eq!(store.highest_modseq(&cancel, inbox).unwrap(), out.modseq);
    }
}
