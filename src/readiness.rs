//! # Readiness Latch
//!
//! One-shot barrier resolved with success or error: many waiters, one
//! resolver, sticky resolution. The client waits on it for the server's
//! acknowledgement; the server resolves it when the connected-hook returns.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

use crate::error::Error;

pub(crate) struct ReadinessLatch {
    resolved: AtomicBool,
    result: Mutex<Option<Result<(), Error>>>,
    notify: Notify,
}

impl ReadinessLatch {
    pub(crate) fn new() -> Self {
        Self {
            resolved: AtomicBool::new(false),
            result: Mutex::new(None),
            notify: Notify::new(),
        }
    }

    /// Resolves the latch. The first resolution wins; re-resolving with a
    /// different value is a no-op.
    pub(crate) fn resolve(&self, result: Result<(), Error>) {
        {
            let mut slot = self.result.lock();
            if slot.is_some() {
                return;
            }
            *slot = Some(result);
            self.resolved.store(true, Ordering::Release);
        }
        self.notify.notify_waiters();
    }

    /// Reports whether the latch has been resolved.
    pub(crate) fn is_resolved(&self) -> bool {
        self.resolved.load(Ordering::Acquire)
    }

    /// Waits until the latch is resolved and returns the sticky result.
    pub(crate) async fn wait(&self) -> Result<(), Error> {
        loop {
            // Register interest before the check so a concurrent resolve
            // between the check and the await cannot be missed.
            let notified = self.notify.notified();

            if self.resolved.load(Ordering::Acquire) {
                if let Some(result) = self.result.lock().clone() {
                    return result;
                }
            }

            notified.await;
        }
    }
}
