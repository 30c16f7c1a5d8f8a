/*
 * ops.rs
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

//! Mailbox operations behind the IMAP session: sequence/UID resolution
//! over the Ready rows, CONDSTORE filtering, expunge renumbering, and
//! the copy/move bookkeeping. Sequence numbers are positions in the
//! UID-ordered Ready rows at command time.

use super::search::{self, SearchCtx, SearchKey};
use super::sequence::{set_contains, SeqRange};
use crate::shutdown::CancelToken;
use crate::storage::{MsgRow, StorageError, UserStore};

/// A row selected by a sequence set, with its current sequence number.
#[derive(Debug, Clone)]
pub struct SelectedRow {
    pub seq: u32,
    pub row: MsgRow,
}

/// Resolve `ranges` (sequence or UID based) against the current Ready
/// rows, in UID order.
pub fn resolve_rows(
    rows: &[MsgRow],
    use_uid: bool,
    ranges: &[SeqRange],
) -> Vec<SelectedRow> {
    let max_seq = rows.len() as u32;
    let max_uid = rows.last().map(|r| r.uid).unwrap_or(0) as u32;
    rows.iter()
        .enumerate()
        .filter(|(i, row)| {
            if use_uid {
                set_contains(ranges, row.uid as u32, max_uid)
            } else {
                set_contains(ranges, (*i as u32) + 1, max_seq)
            }
        })
        .map(|(i, row)| SelectedRow {
            seq: (i as u32) + 1,
            row: row.clone(),
        })
        .collect()
}

/// Fetch selection: resolved rows with `modseq > changed_since` when a
/// CHANGEDSINCE filter applies.
pub fn fetch_rows(
    store: &UserStore,
    cancel: &CancelToken,
    mailbox_id: i64,
    use_uid: bool,
    ranges: &[SeqRange],
    changed_since: Option<i64>,
) -> Result<Vec<SelectedRow>, StorageError> {
    let rows = store.ready_rows(cancel, mailbox_id)?;
    let mut selected = resolve_rows(&rows, use_uid, ranges);
    if let Some(since) = changed_since {
        selected.retain(|s| s.row.modseq > since);
    }
    Ok(selected)
}

/// Evaluate a search key over every Ready row, in UID order.
pub fn search_rows(
    store: &UserStore,
    cancel: &CancelToken,
    mailbox_id: i64,
    key: &SearchKey,
) -> Result<Vec<SelectedRow>, StorageError> {
    let rows = store.ready_rows(cancel, mailbox_id)?;
    let max_seq = rows.len() as u32;
    let max_uid = rows.last().map(|r| r.uid).unwrap_or(0);
    let want_body = search::needs_body(key);

    let mut matches = Vec::new();
    for (i, row) in rows.iter().enumerate() {
        let headers = store.load_headers(cancel, row.msg_id)?;
        let body_text = if want_body {
            let mut msg = store.load_msg(cancel, row.msg_id)?;
            let mut text = String::new();
            for part in &mut msg.parts {
                if part.content_type.starts_with("text/") {
                    let bytes = part.content.read_all()?;
                    text.push_str(&String::from_utf8_lossy(&bytes));
                    text.push('\n');
                }
            }
            Some(text)
        } else {
            None
        };
        let ctx = SearchCtx {
            seq: (i as u32) + 1,
            max_seq,
            uid: row.uid,
            max_uid,
            modseq: row.modseq,
            size: row.size,
            date: row.date,
            flags: &row.flags,
            headers: &headers,
            body: body_text.as_deref(),
        };
        if search::eval(key, &ctx) {
            matches.push(SelectedRow {
                seq: (i as u32) + 1,
                row: row.clone(),
            });
        }
    }
    Ok(matches)
}

/// Expunge with shrinking sequence numbers: each reported number is the
/// original sequence number minus the count of earlier expunges in the
/// same call. Returns `(reported_seq, uid)` pairs.
pub fn expunge(
    store: &UserStore,
    cancel: &CancelToken,
    mailbox_id: i64,
    uid_ranges: Option<&[SeqRange]>,
) -> Result<Vec<(u32, i64)>, StorageError> {
    let rows = store.ready_rows(cancel, mailbox_id)?;
    let max_uid = rows.last().map(|r| r.uid).unwrap_or(0) as u32;
    let restricted: Option<Vec<i64>> = uid_ranges.map(|ranges| {
        rows.iter()
            .filter(|r| set_contains(ranges, r.uid as u32, max_uid))
            .map(|r| r.uid)
            .collect()
    });
    let expunged = store.expunge(cancel, mailbox_id, restricted.as_deref())?;

    let mut reported = Vec::with_capacity(expunged.len());
    for (removed_before, uid) in expunged.iter().enumerate() {
        let original_seq = rows
            .iter()
            .position(|r| r.uid == *uid)
            .map(|i| (i as u32) + 1)
            .unwrap_or(0);
        reported.push((original_seq - removed_before as u32, *uid));
    }
    Ok(reported)
}

/// Copy/move outcome: `(src_uid, dst_uid)` pairs plus, for move, the
/// shrinking source sequence numbers to report as EXPUNGE.
pub struct TransferOutcome {
    pub pairs: Vec<(i64, i64)>,
    pub expunged_seqs: Vec<u32>,
    pub dst_uid_validity: i64,
}

pub fn copy(
    store: &UserStore,
    cancel: &CancelToken,
    src_mailbox_id: i64,
    use_uid: bool,
    ranges: &[SeqRange],
    dst_name: &str,
) -> Result<TransferOutcome, StorageError> {
    let dst = store
        .mailbox(cancel, dst_name)?
        .ok_or(StorageError::NotFound)?;
    let rows = store.ready_rows(cancel, src_mailbox_id)?;
    let selected = resolve_rows(&rows, use_uid, ranges);
    let uids: Vec<i64> = selected.iter().map(|s| s.row.uid).collect();
    let pairs = store.copy_msgs(cancel, src_mailbox_id, dst.mailbox_id, &uids)?;
    Ok(TransferOutcome {
        pairs,
        expunged_seqs: Vec::new(),
        dst_uid_validity: dst.uid_validity,
    })
}

pub fn transfer_move(
    store: &UserStore,
    cancel: &CancelToken,
    src_mailbox_id: i64,
    use_uid: bool,
    ranges: &[SeqRange],
    dst_name: &str,
) -> Result<TransferOutcome, StorageError> {
    let dst = store
        .mailbox(cancel, dst_name)?
        .ok_or(StorageError::NotFound)?;
    let rows = store.ready_rows(cancel, src_mailbox_id)?;
    let selected = resolve_rows(&rows, use_uid, ranges);
    let uids: Vec<i64> = selected.iter().map(|s| s.row.uid).collect();
    let pairs = store.move_msgs(cancel, src_mailbox_id, dst.mailbox_id, &uids)?;

    // Shrinking sequence numbers for the rows that left the source.
    let mut expunged_seqs = Vec::with_capacity(pairs.len());
    for (removed_before, (src_uid, _)) in pairs.iter().enumerate() {
        let original_seq = rows
            .iter()
            .position(|r| r.uid == *src_uid)
            .map(|i| (i as u32) + 1)
            .unwrap_or(0);
        expunged_seqs.push(original_seq - removed_before as u32);
    }
    Ok(TransferOutcome {
        pairs,
        expunged_seqs,
        dst_uid_validity: dst.uid_validity,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mime::cleave;
    use crate::msg::{FlagSet, FLAG_DELETED};
    use crate::storage::{FlagMode, FlagsOp};

    fn store_with_msgs(n: usize) -> (tempfile::TempDir, UserStore, i64, Vec<i64>) {
        let dir = tempfile::tempdir().unwrap();
        let store = UserStore::open(dir.path(), 1).unwrap();
        let cancel = CancelToken::never();
        let inbox = store
            .mailbox(&cancel, "INBOX")
            .unwrap()
            .unwrap()
            .mailbox_id;
        let mut uids = Vec::new();
        for i in 0..n {
            let raw = format!("From: a@x\r\nSubject: m{}\r\n\r\nbody {}\r\n", i, i);
            let mut msg = cleave(raw.as_bytes()).unwrap();
            uids.push(store.append_msg(&cancel, inbox, &mut msg, None).unwrap().uid);
        }
        (dir, store, inbox, uids)
    }

    #[test]
    fn sequence_resolution() {
        let (_d, store, inbox, uids) = store_with_msgs(4);
        let cancel = CancelToken::never();
        let rows = store.ready_rows(&cancel, inbox).unwrap();
        let set = crate::protocol::imap::sequence::parse_sequence_set("2:3").unwrap();
        let selected = resolve_rows(&rows, false, &set);
        assert_eq!(selected.len(), 2);
        assert_eq!(selected[0].seq, 2);
        assert_eq!(selected[0].row.uid, uids[1]);

        let uid_set =
            crate::protocol::imap::sequence::parse_sequence_set(&format!("{}:*", uids[2]))
                .unwrap();
        let selected = resolve_rows(&rows, true, &uid_set);
        assert_eq!(selected.len(), 2);
    }

    #[test]
    fn changedsince_filters_fetch() {
        let (_d, store, inbox, uids) = store_with_msgs(2);
        let cancel = CancelToken::never();
        // Bump the second message's modseq.
        let op = FlagsOp {
            mode: FlagMode::Add,
            flags: FlagSet::from_iter(["\\Flagged"]),
            unchanged_since: None,
        };
        let bumped = store.store_flags(&cancel, inbox, &[uids[1]], &op).unwrap();
        let threshold = bumped.stored[0].modseq - 1;

        let all = crate::protocol::imap::sequence::parse_sequence_set("1:*").unwrap();
        let rows =
            fetch_rows(&store, &cancel, inbox, false, &all, Some(threshold)).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].row.uid, uids[1]);
    }

    #[test]
    fn search_by_subject_and_uid() {
        let (_d, store, inbox, uids) = store_with_msgs(3);
        let cancel = CancelToken::never();
        let matches =
            search_rows(&store, &cancel, inbox, &SearchKey::Subject("m1".into())).unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].row.uid, uids[1]);

        let matches = search_rows(
            &store,
            &cancel,
            inbox,
            &SearchKey::Body(format!("body {}", 2)),
        )
        .unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].row.uid, uids[2]);
    }

    #[test]
    fn expunge_reports_shrinking_seqs() {
        let (_d, store, inbox, uids) = store_with_msgs(4);
        let cancel = CancelToken::never();
        let op = FlagsOp {
            mode: FlagMode::Add,
            flags: FlagSet::from_iter([FLAG_DELETED]),
            unchanged_since: None,
        };
        store
            .store_flags(&cancel, inbox, &[uids[1], uids[3]], &op)
            .unwrap();
        let reported = expunge(&store, &cancel, inbox, None).unwrap();
        // Sequence 2 goes first; the former sequence 4 reports as 3.
        assert_eq!(
            reported,
            vec![(2, uids[1]), (3, uids[3])]
        );
    }

    #[test]
    fn move_preserves_cardinality_and_reports_source_seqs() {
        let (_d, store, inbox, uids) = store_with_msgs(3);
        let cancel = CancelToken::never();
        let before_src = store.ready_rows(&cancel, inbox).unwrap().len();
        let archive = store.mailbox(&cancel, "Archive").unwrap().unwrap();
        let before_dst = store
            .ready_rows(&cancel, archive.mailbox_id)
            .unwrap()
            .len();

        let set = crate::protocol::imap::sequence::parse_sequence_set("1:2").unwrap();
        let outcome =
            transfer_move(&store, &cancel, inbox, false, &set, "Archive").unwrap();
        assert_eq!(outcome.pairs.len(), 2);
        assert_eq!(outcome.expunged_seqs, vec![1, 1]);
        assert_eq!(
            store.ready_rows(&cancel, inbox).unwrap().len(),
            before_src - 2
        );
        assert_eq!(
            store.ready_rows(&cancel, archive.mailbox_id).unwrap().len(),
            before_dst + 2
        );
        let _ = uids;
    }
}
