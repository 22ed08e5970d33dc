//! Keyed one-shot timers for the idle triggers.
//!
//! Each key holds at most one pending timer. Scheduling under an occupied
//! key cancels the old timer first, so a stream of messages keeps pushing
//! the fire time out instead of stacking timers. Cancellation only reaches
//! timers that have not fired yet: once a handler has claimed its slot it
//! runs to completion.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;

struct TimerEntry {
    token: u64,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct SchedulerInner {
    entries: Mutex<HashMap<String, TimerEntry>>,
    next_token: AtomicU64,
}

impl SchedulerInner {
    /// True when the firing task still owns its slot. Removing the entry
    /// here is what makes an in-flight handler immune to later cancels.
    fn claim(&self, key: &str, token: u64) -> bool {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(key) {
            Some(entry) if entry.token == token => {
                entries.remove(key);
                true
            }
            _ => false,
        }
    }
}

#[derive(Default)]
pub struct IdleScheduler {
    inner: Arc<SchedulerInner>,
}

impl IdleScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `fut` after `delay`, replacing any pending timer under the same
    /// key. The replaced timer's handler never runs.
    pub fn schedule<F>(&self, key: impl Into<String>, delay: Duration, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let key = key.into();
        let token = self.inner.next_token.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::clone(&self.inner);
        let task_key = key.clone();

        // The lock spans spawn and insert so the new task cannot observe
        // the map before its own entry is in place.
        let mut entries = self.inner.entries.lock().unwrap();
        if let Some(previous) = entries.remove(&key) {
            previous.handle.abort();
        }
        // The sleep is created here, not inside the task, so the deadline
        // is measured from the schedule call even when the clock advances
        // before the spawned task gets its first poll.
        let sleep = tokio::time::sleep(delay);
        let handle = tokio::spawn(async move {
            sleep.await;
            if inner.claim(&task_key, token) {
                fut.await;
            }
        });
        entries.insert(key, TimerEntry { token, handle });
    }

    /// Cancel the pending timer under `key`, if any. Returns whether a
    /// timer was pending. Handlers that already claimed their slot are not
    /// affected.
    pub fn cancel(&self, key: &str) -> bool {
        let entry = self.inner.entries.lock().unwrap().remove(key);
        match entry {
            Some(entry) => {
                entry.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Keys with a timer that has not fired or been cancelled yet.
    pub fn pending_keys(&self) -> Vec<String> {
        let entries = self.inner.entries.lock().unwrap();
        entries.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Let spawned timer tasks run up to their next await point.
    async fn settle() {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fires_once_after_delay() {
        let scheduler = IdleScheduler::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&fired);
        scheduler.schedule("chat-1", Duration::from_secs(600), async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::advance(Duration::from_secs(599)).await;
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(scheduler.pending_keys(), vec!["chat-1".to_string()]);

        tokio::time::advance(Duration::from_secs(2)).await;
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(scheduler.pending_keys().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn reschedule_replaces_pending_timer() {
        let scheduler = IdleScheduler::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&first);
        scheduler.schedule("key", Duration::from_secs(600), async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::advance(Duration::from_secs(300)).await;
        settle().await;

        let counter = Arc::clone(&second);
        scheduler.schedule("key", Duration::from_secs(600), async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(scheduler.pending_keys().len(), 1);

        // Past the first deadline: the replaced timer must stay dead.
        tokio::time::advance(Duration::from_secs(301)).await;
        settle().await;
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 0);

        tokio::time::advance(Duration::from_secs(300)).await;
        settle().await;
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_prevents_handler_from_running() {
        let scheduler = IdleScheduler::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&fired);
        scheduler.schedule("key", Duration::from_secs(60), async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(scheduler.cancel("key"));
        assert!(!scheduler.cancel("key"));

        tokio::time::advance(Duration::from_secs(120)).await;
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn keys_are_independent() {
        let scheduler = IdleScheduler::new();
        let short = Arc::new(AtomicUsize::new(0));
        let long = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&short);
        scheduler.schedule("short", Duration::from_secs(600), async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let counter = Arc::clone(&long);
        scheduler.schedule("long", Duration::from_secs(14_400), async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::advance(Duration::from_secs(601)).await;
        settle().await;
        assert_eq!(short.load(Ordering::SeqCst), 1);
        assert_eq!(long.load(Ordering::SeqCst), 0);
        assert_eq!(scheduler.pending_keys(), vec!["long".to_string()]);

        tokio::time::advance(Duration::from_secs(13_800)).await;
        settle().await;
        assert_eq!(long.load(Ordering::SeqCst), 1);
        assert!(scheduler.pending_keys().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn claimed_handler_survives_cancel() {
        let scheduler = IdleScheduler::new();
        let started = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicUsize::new(0));

        let started_flag = Arc::clone(&started);
        let finished_flag = Arc::clone(&finished);
        scheduler.schedule("key", Duration::from_secs(10), async move {
            started_flag.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(5)).await;
            finished_flag.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::advance(Duration::from_secs(11)).await;
        settle().await;
        assert_eq!(started.load(Ordering::SeqCst), 1);

        // The slot is already claimed, so there is nothing to cancel and
        // the handler keeps running.
        assert!(!scheduler.cancel("key"));
        tokio::time::advance(Duration::from_secs(6)).await;
        settle().await;
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }
}
