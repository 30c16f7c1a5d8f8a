/*
 * auth.rs
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

//! Device-password authentication and the failure throttle.
//!
//! Device passwords are human-copied tokens; the presented password is
//! uppercased with spaces removed before the bcrypt compare, so `abcd
//! efgh` and `ABCDEFGH` are the same credential.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::shutdown::CancelToken;
use crate::storage::{StagingStore, StorageError};

/// Normalize a presented device password: uppercase, spaces removed.
pub fn normalize_device_password(presented: &str) -> String {
    presented
        .chars()
        .filter(|c| *c != ' ')
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

/// Hash a device password for storage (provisioning side).
pub fn hash_device_password(password: &str) -> Result<String, bcrypt::BcryptError> {
    bcrypt::hash(normalize_device_password(password), bcrypt::DEFAULT_COST)
}

/// Sliding-window failure throttle, keyed by remote address + username.
/// After `max_failures` failures inside `window`, each further attempt
/// sleeps for `delay`. Expired entries are swept on the same cadence as
/// the window.
pub struct Throttle {
    max_failures: u32,
    window: Duration,
    delay: Duration,
    state: Mutex<ThrottleState>,
}

struct ThrottleState {
    failures: HashMap<String, Vec<Instant>>,
    last_sweep: Instant,
}

impl Throttle {
    pub fn new(max_failures: u32, window: Duration, delay: Duration) -> Self {
        Self {
            max_failures,
            window,
            delay,
            state: Mutex::new(ThrottleState {
                failures: HashMap::new(),
                last_sweep: Instant::now(),
            }),
        }
    }

    /// Delay to impose before processing this attempt.
    pub fn penalty(&self, key: &str) -> Duration {
        let mut state = self.state.lock().expect("throttle lock");
        let now = Instant::now();
        if now.duration_since(state.last_sweep) >= self.window {
            let window = self.window;
            state
                .failures
                .retain(|_, stamps| stamps.iter().any(|s| now.duration_since(*s) < window));
            state.last_sweep = now;
        }
        match state.failures.get(key) {
            Some(stamps) => {
                let recent = stamps
                    .iter()
                    .filter(|s| now.duration_since(**s) < self.window)
                    .count() as u32;
                if recent >= self.max_failures {
                    self.delay
                } else {
                    Duration::ZERO
                }
            }
            None => Duration::ZERO,
        }
    }

    pub fn record_failure(&self, key: &str) {
        let mut state = self.state.lock().expect("throttle lock");
        state
            .failures
            .entry(key.to_string())
            .or_default()
            .push(Instant::now());
    }

    pub fn record_success(&self, key: &str) {
        let mut state = self.state.lock().expect("throttle lock");
        state.failures.remove(key);
    }
}

/// Verifies device credentials against the global store, throttled.
pub struct Authenticator {
    staging: Arc<StagingStore>,
    throttle: Throttle,
}

impl Authenticator {
    pub fn new(staging: Arc<StagingStore>, throttle: Throttle) -> Self {
        Self { staging, throttle }
    }

    /// Verify `username`/`password` from `remote_addr`. Returns the user
    /// id (always non-zero) on success, None on failure; the throttle
    /// sleep happens in here.
    pub async fn verify(
        &self,
        cancel: &CancelToken,
        remote_addr: &str,
        username: &str,
        password: &str,
    ) -> Result<Option<i64>, StorageError> {
        let key = format!("{}/{}", remote_addr, username);
        let penalty = self.throttle.penalty(&key);
        if !penalty.is_zero() {
            tokio::time::sleep(penalty).await;
        }
        if cancel.is_cancelled() {
            return Err(StorageError::Cancelled);
        }
        let normalized = normalize_device_password(password);
        let Some((user_id, hashes)) = self.staging.device_hashes(cancel, username)? else {
            self.throttle.record_failure(&key);
            return Ok(None);
        };
        for hash in &hashes {
            if bcrypt::verify(&normalized, hash).unwrap_or(false) {
                self.throttle.record_success(&key);
                return Ok(Some(user_id));
            }
        }
        self.throttle.record_failure(&key);
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_uppercases_and_strips_spaces() {
        assert_eq!(normalize_device_password("abcd efgh"), "ABCDEFGH");
        assert_eq!(normalize_device_password("AB cd-12"), "ABCD-12");
    }

    #[test]
    fn throttle_kicks_in_after_budget() {
        let throttle = Throttle::new(3, Duration::from_secs(60), Duration::from_secs(3));
        assert!(throttle.penalty("k").is_zero());
        for _ in 0..3 {
            throttle.record_failure("k");
        }
        assert_eq!(throttle.penalty("k"), Duration::from_secs(3));
        // Other keys are unaffected.
        assert!(throttle.penalty("other").is_zero());
        throttle.record_success("k");
        assert!(throttle.penalty("k").is_zero());
    }

    #[tokio::test]
    async fn verify_against_device_hashes() {
        let dir = tempfile::tempdir().unwrap();
        let staging = Arc::new(StagingStore::open(dir.path()).unwrap());
        let cancel = CancelToken::never();
        let user = staging.create_user(&cancel, "alice").unwrap();
        let hash = hash_device_password("wxyz 1234").unwrap();
        staging.add_device(&cancel, user, "phone", &hash).unwrap();

        let auth = Authenticator::new(
            Arc::clone(&staging),
            Throttle::new(10, Duration::from_secs(60), Duration::from_millis(1)),
        );
        // Spacing and case are immaterial.
        assert_eq!(
            auth.verify(&cancel, "1.2.3.4", "alice", "WX YZ 12 34")
                .await
                .unwrap(),
            Some(user)
        );
        assert_eq!(
            auth.verify(&cancel, "1.2.3.4", "alice", "wrong").await.unwrap(),
            None
        );
        assert_eq!(
            auth.verify(&cancel, "1.2.3.4", "nobody", "x").await.unwrap(),
            None
        );
    }
}
