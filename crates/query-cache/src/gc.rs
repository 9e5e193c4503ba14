//! Delayed deletion of unobserved queries.

use std::collections::HashMap;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::AbortHandle;

use crate::key::CanonicalKey;

/// A single armed deletion timer.
#[derive(Debug)]
struct ArmedTimer {
    id: u64,
    handle: AbortHandle,
}

/// Per-key single-shot deletion timers.
///
/// At most one timer is armed per key. Arming a key that already has a timer
/// aborts the old one first.
#[derive(Debug, Default)]
pub(crate) struct GcScheduler {
    timers: HashMap<CanonicalKey, ArmedTimer>,
    next_id: u64,
}

impl GcScheduler {
    /// Arm (or re-arm) the timer for `key`.
    ///
    /// `fire` receives the timer id and must pass it to [`take_fired`] so a
    /// timer that was superseded while waiting does not delete anything.
    /// Returns `false` when no async runtime is available to drive the timer.
    ///
    /// [`take_fired`]: GcScheduler::take_fired
    pub(crate) fn arm<F>(&mut self, key: CanonicalKey, delay: Duration, fire: F) -> bool
    where
        F: FnOnce(u64) + Send + 'static,
    {
        self.disarm(&key);

        let Ok(runtime) = Handle::try_current() else {
            tracing::warn!(key = %key, "no async runtime, query will not be garbage collected");
            return false;
        };

        self.next_id += 1;
        let id = self.next_id;
        let task = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            fire(id);
        });

        tracing::debug!(key = %key, ?delay, "gc timer armed");
        self.timers.insert(
            key,
            ArmedTimer {
                id,
                handle: task.abort_handle(),
            },
        );
        true
    }

    /// Forget the timer for `key` if it is still the one identified by `id`.
    pub(crate) fn take_fired(&mut self, key: &CanonicalKey, id: u64) -> bool {
        match self.timers.get(key) {
            Some(timer) if timer.id == id => {
                self.timers.remove(key);
                true
            }
            _ => false,
        }
    }

    /// Abort the timer for `key`, if any.
    pub(crate) fn disarm(&mut self, key: &CanonicalKey) {
        if let Some(timer) = self.timers.remove(key) {
            timer.handle.abort();
        }
    }

    /// Check if a timer is armed for `key`.
    pub(crate) fn is_armed(&self, key: &CanonicalKey) -> bool {
        self.timers.contains_key(key)
    }

    /// Abort every armed timer.
    pub(crate) fn clear(&mut self) {
        for (_, timer) in self.timers.drain() {
            timer.handle.abort();
        }
    }
}

impl Drop for GcScheduler {
    fn drop(&mut self) {
        self.clear();
    }
}
