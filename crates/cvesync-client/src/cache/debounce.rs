//! Leading + trailing debounce per key.
//!
//! The first call for a key fires at once and opens a window. Calls inside
//! the window push its end out and arrange one more fire when it closes.
//! The end never moves past three windows from the leading fire, so a
//! steady stream still gets a trailing fire.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::AbortHandle;
use tokio::time::{Instant, sleep_until};

/// Longest a window can stretch, in windows.
const MAX_WAIT_WINDOWS: u32 = 3;

struct Slot {
    opened: Instant,
    deadline: Instant,
    trailing: bool,
    timer: AbortHandle,
}

pub(crate) struct Debouncer<K> {
    window: Duration,
    max_wait: Duration,
    slots: Arc<Mutex<HashMap<K, Slot>>>,
}

impl<K> Clone for Debouncer<K> {
    fn clone(&self) -> Self {
        Self {
            window: self.window,
            max_wait: self.max_wait,
            slots: Arc::clone(&self.slots),
        }
    }
}

impl<K> Debouncer<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    pub(crate) fn new(window: Duration) -> Self {
        Self {
            window,
            max_wait: window.saturating_mul(MAX_WAIT_WINDOWS),
            slots: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Run `fire` for `key` now or when the window closes.
    ///
    /// Returns `true` when this call fired immediately. `fire` runs under
    /// the debouncer's lock on the leading edge and must not call back in.
    pub(crate) fn call<F>(&self, key: K, fire: F) -> bool
    where
        F: Fn(&K) + Send + 'static,
    {
        if self.window.is_zero() {
            fire(&key);
            return true;
        }

        let now = Instant::now();
        let deadline = now + self.window;
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get_mut(&key) {
            slot.deadline = deadline.min(slot.opened + self.max_wait);
            slot.trailing = true;
            return false;
        }

        fire(&key);

        let shared = Arc::clone(&self.slots);
        let timer_key = key.clone();
        let task = tokio::spawn(async move {
            let mut wake_at = deadline;
            loop {
                sleep_until(wake_at).await;
                let fire_trailing = {
                    let mut slots = shared.lock();
                    let Some(slot) = slots.get(&timer_key) else {
                        return;
                    };
                    if slot.deadline > Instant::now() {
                        wake_at = slot.deadline;
                        continue;
                    }
                    slots.remove(&timer_key).is_some_and(|s| s.trailing)
                };
                if fire_trailing {
                    fire(&timer_key);
                }
                return;
            }
        });
        let _ = slots.insert(
            key,
            Slot {
                opened: now,
                deadline,
                trailing: false,
                timer: task.abort_handle(),
            },
        );
        true
    }

    /// Keys with an open window.
    pub(crate) fn open_windows(&self) -> usize {
        self.slots.lock().len()
    }

    /// Drop every window without firing.
    pub(crate) fn cancel_all(&self) {
        for (_, slot) in self.slots.lock().drain() {
            slot.timer.abort();
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
