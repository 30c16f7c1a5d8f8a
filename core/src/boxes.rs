/*
 * boxes.rs
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

//! Box manager: per-user store lifecycle, notifier fan-out on message
//! arrival, push-device registry access. Notifier registration is
//! append-only; the store cache is a mutex-protected map.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};

use crate::msg::Msg;
use crate::shutdown::CancelToken;
use crate::storage::{PushDevice, StorageError, UserStore};

/// Fired after an append commits and the message is visible.
#[derive(Debug, Clone)]
pub struct NotifyEvent {
    pub user_id: i64,
    pub mailbox_id: i64,
    pub mailbox_name: String,
    pub push_devices: Vec<PushDevice>,
}

/// Delivery of notifications is best-effort and may reorder across
/// mailboxes.
pub trait Notifier: Send + Sync {
    fn notify(&self, event: &NotifyEvent);
}

pub struct UserBox {
    pub user_id: i64,
    pub store: UserStore,
}

pub struct BoxMgr {
    dir: PathBuf,
    boxes: Mutex<HashMap<i64, Arc<UserBox>>>,
    notifiers: Mutex<Vec<Arc<dyn Notifier>>>,
}

impl BoxMgr {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            boxes: Mutex::new(HashMap::new()),
            notifiers: Mutex::new(Vec::new()),
        }
    }

    /// Open (or fetch the cached) box for `user_id`.
    pub fn user_box(&self, user_id: i64) -> Result<Arc<UserBox>, StorageError> {
        let mut boxes = self.boxes.lock().expect("box cache lock");
        if let Some(existing) = boxes.get(&user_id) {
            return Ok(Arc::clone(existing));
        }
        let store = UserStore::open(&self.dir.join(format!("user-{}", user_id)), user_id)?;
        let user_box = Arc::new(UserBox { user_id, store });
        boxes.insert(user_id, Arc::clone(&user_box));
        Ok(user_box)
    }

    pub fn register_notifier(&self, notifier: Arc<dyn Notifier>) {
        self.notifiers
            .lock()
            .expect("notifier registry lock")
            .push(notifier);
    }

    fn fan_out(&self, event: NotifyEvent) {
        let notifiers = self.notifiers.lock().expect("notifier registry lock").clone();
        for notifier in notifiers {
            notifier.notify(&event);
        }
    }

    /// Append a message into a user's mailbox and notify subscribers.
    /// Returns the assigned UID (the existing one for duplicates).
    pub fn append(
        &self,
        cancel: &CancelToken,
        user_id: i64,
        mailbox_name: &str,
        msg: &mut Msg,
        internal_date: Option<DateTime<Utc>>,
    ) -> Result<i64, StorageError> {
        let user_box = self.user_box(user_id)?;
        let mailbox = user_box
            .store
            .mailbox(cancel, mailbox_name)?
            .ok_or(StorageError::NotFound)?;
        let outcome = user_box
            .store
            .append_msg(cancel, mailbox.mailbox_id, msg, internal_date)?;
        if !outcome.duplicate {
            let push_devices = user_box.store.push_devices(cancel, mailbox_name)?;
            self.fan_out(NotifyEvent {
                user_id,
                mailbox_id: mailbox.mailbox_id,
                mailbox_name: mailbox_name.to_string(),
                push_devices,
            });
        }
        Ok(outcome.uid)
    }

    /// Stage-two shutdown: drop every cached store.
    pub fn close_all(&self) {
        self.boxes.lock().expect("box cache lock").clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mime::cleave;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingNotifier {
        count: AtomicU32,
        last_mailbox: Mutex<String>,
    }

    impl Notifier for CountingNotifier {
        fn notify(&self, event: &NotifyEvent) {
            self.count.fetch_add(1, Ordering::SeqCst);
            *self.last_mailbox.lock().unwrap() = event.mailbox_name.clone();
        }
    }

    #[test]
    fn append_notifies_and_caches_box() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = BoxMgr::new(dir.path());
        let notifier = Arc::new(CountingNotifier {
            count: AtomicU32::new(0),
            last_mailbox: Mutex::new(String::new()),
        });
        mgr.register_notifier(notifier.clone());

        let cancel = CancelToken::never();
        let mut msg = cleave(b"From: a@x\r\n\r\nhello\r\n").unwrap();
        let uid = mgr.append(&cancel, 7, "INBOX", &mut msg, None).unwrap();
        assert_eq!(uid, 1);
        assert_eq!(notifier.count.load(Ordering::SeqCst), 1);
        assert_eq!(&*notifier.last_mailbox.lock().unwrap(), "INBOX");

        // A duplicate append returns the same UID and stays silent.
        let mut dup = cleave(b"From: a@x\r\n\r\nhello\r\n").unwrap();
        let uid2 = mgr.append(&cancel, 7, "INBOX", &mut dup, None).unwrap();
        assert_eq!(uid2, uid);
        assert_eq!(notifier.count.load(Ordering::SeqCst), 1);

        let b1 = mgr.user_box(7).unwrap();
        let b2 = mgr.user_box(7).unwrap();
        assert!(Arc::ptr_eq(&b1, &b2));
    }
}
