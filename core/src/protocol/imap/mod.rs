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

//! IMAP server (RFC 3501 with CONDSTORE/QRESYNC, MOVE, IDLE, UIDPLUS,
//! XAPPLEPUSHSERVICE): wire parsing, mailbox operations, and the session
//! loop.

pub mod ops;
pub mod parser;
pub mod search;
pub mod sequence;
pub mod session;

pub use parser::{parse_command, Command, FetchItem, Section, StatusItem};
pub use search::SearchKey;
pub use sequence::{parse_sequence_set, SeqRange};
pub use session::{run_session, ImapConfig, ImapServer, SessionDeps, Subscribers};
