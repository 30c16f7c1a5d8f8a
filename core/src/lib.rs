/*
 * lib.rs
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

//! Cassetta core: a single-node personal email server.
//!
//! Mail arrives over SMTP and is staged in a global store; the pipeline
//! verifies DKIM, cleaves the MIME tree into parts, rebuilds a canonical
//! wire form, and either appends into per-user boxes (served over IMAP with
//! CONDSTORE/QRESYNC) or relays to remote MX hosts with STARTTLS.

pub mod auth;
pub mod boxes;
pub mod config;
pub mod dkim;
pub mod dns;
pub mod error;
pub mod mime;
pub mod msg;
pub mod net;
pub mod pipeline;
pub mod protocol;
pub mod sasl;
pub mod shutdown;
pub mod storage;
