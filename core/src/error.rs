/*
 * error.rs
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

//! Shared error types. Protocol and storage modules define their own error
//! enums and convert at the seams; the types here are the ones that cross
//! module boundaries.

use std::fmt;

/// Error with a human-visible message, surfaced verbatim to the client
/// (e.g. `Invalid email address`). `focus` optionally names the input field
/// a UI should highlight.
#[derive(Debug, Clone)]
pub struct UserError {
    pub message: String,
    pub focus: Option<String>,
}

impl UserError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self {
            message: msg.into(),
            focus: None,
        }
    }

    pub fn with_focus(msg: impl Into<String>, focus: impl Into<String>) -> Self {
        Self {
            message: msg.into(),
            focus: Some(focus.into()),
        }
    }
}

impl fmt::Display for UserError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for UserError {}

/// Operation aborted because the enclosing context was cancelled
/// (shutdown, client hangup). Not a failure of the operation itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

impl fmt::Display for Cancelled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "operation cancelled")
    }
}

impl std::error::Error for Cancelled {}
