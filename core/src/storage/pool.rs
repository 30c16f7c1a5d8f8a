/*
 * pool.rs
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

//! Connection pool: one writer serializing mutations, a small set of
//! read connections handed out under a condition variable. Acquisition
//! under a cancelled context fails instead of waiting.

use std::ops::{Deref, DerefMut};
use std::path::Path;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::{Connection, OpenFlags};

use super::StorageError;
use crate::shutdown::CancelToken;

pub struct Pool {
    readers: Mutex<Vec<Connection>>,
    reader_returned: Condvar,
    writer: Mutex<Connection>,
}

impl Pool {
    /// Open the database with one writer and `reader_count` readers.
    /// `init` runs on every connection (pragmas, ATTACH); `schema` runs
    /// once on the writer.
    pub fn open(
        path: &Path,
        reader_count: usize,
        init: &dyn Fn(&Connection) -> Result<(), rusqlite::Error>,
        schema: &dyn Fn(&Connection) -> Result<(), rusqlite::Error>,
    ) -> Result<Self, StorageError> {
        let writer = Connection::open(path)?;
        writer.busy_timeout(Duration::from_secs(5))?;
        writer.pragma_update(None, "journal_mode", "WAL")?;
        init(&writer)?;
        schema(&writer)?;

        let mut readers = Vec::with_capacity(reader_count);
        for _ in 0..reader_count.max(1) {
            let conn = Connection::open_with_flags(
                path,
                OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )?;
            conn.busy_timeout(Duration::from_secs(5))?;
            init(&conn)?;
            readers.push(conn);
        }
        Ok(Self {
            readers: Mutex::new(readers),
            reader_returned: Condvar::new(),
            writer: Mutex::new(writer),
        })
    }

    /// A read connection; blocks until one frees up, failing fast when
    /// the context is cancelled.
    pub fn read(&self, cancel: &CancelToken) -> Result<ReadGuard<'_>, StorageError> {
        let mut readers = self.readers.lock().expect("reader pool lock");
        loop {
            if cancel.is_cancelled() {
                return Err(StorageError::Cancelled);
            }
            if let Some(conn) = readers.pop() {
                return Ok(ReadGuard {
                    conn: Some(conn),
                    pool: self,
                });
            }
            let (guard, _) = self
                .reader_returned
                .wait_timeout(readers, Duration::from_millis(100))
                .expect("reader pool wait");
            readers = guard;
        }
    }

    /// The writer connection. Mutations serialize here.
    pub fn write(&self, cancel: &CancelToken) -> Result<WriteGuard<'_>, StorageError> {
        if cancel.is_cancelled() {
            return Err(StorageError::Cancelled);
        }
        Ok(WriteGuard {
            guard: self.writer.lock().expect("writer lock"),
        })
    }
}

pub struct ReadGuard<'a> {
    conn: Option<Connection>,
    pool: &'a Pool,
}

impl Deref for ReadGuard<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("read connection present")
    }
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool
                .readers
                .lock()
                .expect("reader pool lock")
                .push(conn);
            self.pool.reader_returned.notify_one();
        }
    }
}

pub struct WriteGuard<'a> {
    guard: MutexGuard<'a, Connection>,
}

impl Deref for WriteGuard<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.guard
    }
}

impl DerefMut for WriteGuard<'_> {
    fn deref_mut(&mut self) -> &mut Connection {
        &mut self.guard
    }
}
