/*
 * shutdown.rs
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

//! Cancellation token and two-stage shutdown orchestration.
//!
//! Every long-running operation carries a [`CancelToken`] and checks it at
//! I/O boundaries and pool acquisitions. Shutdown stage one cancels the
//! token and runs all registered callbacks in parallel under a deadline;
//! stage two (closing stores and temp directories) happens when the owning
//! structures drop.

use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::watch;

/// Cheaply clonable cancellation handle. `true` in the channel means
/// cancelled; a dropped sender also counts as cancelled.
#[derive(Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    /// Token that can never be cancelled (tests, standalone tools).
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        // Keep the sender alive for the life of the process.
        std::mem::forget(tx);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve when cancellation is signalled.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

type Callback = Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send>;

/// Shutdown coordinator. Subsystems register named callbacks; `run` cancels
/// the shared token and drives the callbacks in parallel with a deadline.
pub struct Shutdown {
    tx: watch::Sender<bool>,
    rx: watch::Receiver<bool>,
    callbacks: Mutex<Vec<(String, Callback)>>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx,
            rx,
            callbacks: Mutex::new(Vec::new()),
        }
    }

    pub fn token(&self) -> CancelToken {
        CancelToken {
            rx: self.rx.clone(),
        }
    }

    /// Register a callback to run during stage one. The name appears in the
    /// log if the callback misses the deadline.
    pub fn on_shutdown<F, Fut>(&self, name: impl Into<String>, f: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cb: Callback = Box::new(move || Box::pin(f()));
        self.callbacks
            .lock()
            .expect("shutdown callback lock")
            .push((name.into(), cb));
    }

    /// Stage one: signal cancellation, then run every registered callback
    /// in parallel, waiting up to `deadline` for them to finish.
    pub async fn run(&self, deadline: Duration) {
        let _ = self.tx.send(true);
        let callbacks = std::mem::take(
            &mut *self.callbacks.lock().expect("shutdown callback lock"),
        );
        let mut handles = Vec::with_capacity(callbacks.len());
        for (name, cb) in callbacks {
            handles.push((name, tokio::spawn(cb())));
        }
        let wait = async {
            for (name, handle) in handles {
                if handle.await.is_err() {
                    tracing::warn!(callback = %name, "shutdown callback panicked");
                }
            }
        };
        if tokio::time::timeout(deadline, wait).await.is_err() {
            tracing::warn!(
                deadline_ms = deadline.as_millis() as u64,
                "shutdown deadline exceeded, abandoning remaining callbacks"
            );
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn token_reports_cancellation() {
        let shutdown = Shutdown::new();
        let token = shutdown.token();
        assert!(!token.is_cancelled());
        shutdown.run(Duration::from_millis(100)).await;
        assert!(token.is_cancelled());
        token.cancelled().await;
    }

    #[tokio::test]
    async fn callbacks_run_in_parallel() {
        let shutdown = Shutdown::new();
        let count = Arc::new(AtomicU32::new(0));
        for _ in 0..3 {
            let count = Arc::clone(&count);
            shutdown.on_shutdown("test", move || async move {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }
        shutdown.run(Duration::from_secs(1)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn deadline_abandons_stuck_callback() {
        let shutdown = Shutdown::new();
        shutdown.on_shutdown("stuck", || async {
            tokio::time::sleep(Duration::from_secs(60)).await;
        });
        let start = std::time::Instant::now();
        shutdown.run(Duration::from_millis(50)).await;
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
