/*
 * content.rs
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

//! Opaque seekable buffer for part content: memory below a spill
//! threshold, an unlinked temp file above it. The temp file is released
//! when the buffer drops, on every exit path.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};

/// Spill to a temp file once a buffer grows past this.
const SPILL_THRESHOLD: usize = 256 * 1024;

#[derive(Debug)]
enum Inner {
    Mem(io::Cursor<Vec<u8>>),
    File(File),
}

/// Finished content buffer. Read/Seek; position starts at 0.
#[derive(Debug)]
pub struct Content {
    inner: Inner,
    len: u64,
}

impl Content {
    pub fn empty() -> Self {
        Self::from_vec(Vec::new())
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        let len = data.len() as u64;
        Self {
            inner: Inner::Mem(io::Cursor::new(data)),
            len,
        }
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Seek back to the start.
    pub fn reset(&mut self) -> io::Result<()> {
        self.seek(SeekFrom::Start(0)).map(|_| ())
    }

    /// Whole content as bytes; the position is reset afterwards.
    pub fn read_all(&mut self) -> io::Result<Vec<u8>> {
        self.reset()?;
        let mut buf = Vec::with_capacity(self.len as usize);
        self.read_to_end(&mut buf)?;
        self.reset()?;
        Ok(buf)
    }
}

impl Read for Content {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.inner {
            Inner::Mem(c) => c.read(buf),
            Inner::File(f) => f.read(buf),
        }
    }
}

impl Seek for Content {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        match &mut self.inner {
            Inner::Mem(c) => c.seek(pos),
            Inner::File(f) => f.seek(pos),
        }
    }
}

/// Write-side builder for [`Content`]. Starts in memory, spills to an
/// unlinked temp file past the threshold.
#[derive(Debug)]
pub struct ContentWriter {
    mem: Vec<u8>,
    file: Option<File>,
    written: u64,
}

impl ContentWriter {
    pub fn new() -> Self {
        Self {
            mem: Vec::new(),
            file: None,
            written: 0,
        }
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    /// Finish writing and hand back a readable buffer positioned at 0.
    pub fn finish(mut self) -> io::Result<Content> {
        let len = self.written;
        match self.file.take() {
            Some(mut f) => {
                f.flush()?;
                f.seek(SeekFrom::Start(0))?;
                Ok(Content {
                    inner: Inner::File(f),
                    len,
                })
            }
            None => Ok(Content::from_vec(self.mem)),
        }
    }
}

impl Default for ContentWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl Write for ContentWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.file.is_none() && self.mem.len() + buf.len() > SPILL_THRESHOLD {
            let mut f = tempfile::tempfile()?;
            f.write_all(&self.mem)?;
            self.mem = Vec::new();
            self.file = Some(f);
        }
        match &mut self.file {
            Some(f) => f.write_all(buf)?,
            None => self.mem.extend_from_slice(buf),
        }
        self.written += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.file {
            Some(f) => f.flush(),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_content_stays_in_memory() {
        let mut w = ContentWriter::new();
        w.write_all(b"hello").unwrap();
        let mut c = w.finish().unwrap();
        assert_eq!(c.len(), 5);
        assert_eq!(c.read_all().unwrap(), b"hello");
        // Position reset: reading again yields the same bytes.
        assert_eq!(c.read_all().unwrap(), b"hello");
    }

    #[test]
    fn large_content_spills_to_file() {
        let chunk = vec![7u8; 64 * 1024];
        let mut w = ContentWriter::new();
        for _ in 0..8 {
            w.write_all(&chunk).unwrap();
        }
        let mut c = w.finish().unwrap();
        assert_eq!(c.len(), 8 * 64 * 1024);
        let data = c.read_all().unwrap();
        assert_eq!(data.len(), 8 * 64 * 1024);
        assert!(data.iter().all(|&b| b == 7));
    }

    #[test]
    fn seek_within_content() {
        let mut c = Content::from_vec(b"abcdef".to_vec());
        c.seek(SeekFrom::Start(3)).unwrap();
        let mut buf = [0u8; 3];
        c.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"def");
    }
}
