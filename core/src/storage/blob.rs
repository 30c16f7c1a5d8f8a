/*
 * blob.rs
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

//! Write-once blob rows in the attached `blobs` schema. Content bytes are
//! stored as given (the caller compresses when it wants compression).

use rusqlite::{params, Connection};

use super::StorageError;

pub const BLOBS_SCHEMA: &str = "\
CREATE TABLE IF NOT EXISTS blobs.Blobs (
    BlobID INTEGER PRIMARY KEY,
    SHA256 BLOB,
    Content BLOB NOT NULL,
    Deleted INTEGER NOT NULL DEFAULT 0
);";

pub fn insert_blob(
    conn: &Connection,
    content: &[u8],
    sha256: Option<&[u8]>,
) -> Result<i64, StorageError> {
    conn.execute(
        "INSERT INTO blobs.Blobs (SHA256, Content) VALUES (?1, ?2)",
        params![sha256, content],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn read_blob(conn: &Connection, blob_id: i64) -> Result<Vec<u8>, StorageError> {
    let content: Vec<u8> = conn.query_row(
        "SELECT Content FROM blobs.Blobs WHERE BlobID = ?1 AND Deleted = 0",
        params![blob_id],
        |row| row.get(0),
    )?;
    Ok(content)
}

/// Soft delete; content stays until vacuumed.
pub fn delete_blob(conn: &Connection, blob_id: i64) -> Result<(), StorageError> {
    conn.execute(
        "UPDATE blobs.Blobs SET Deleted = 1 WHERE BlobID = ?1",
        params![blob_id],
    )?;
    Ok(())
}
