// Copyright (c) The vigil Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Keyed trailing-edge debouncing.
//!
//! Test runs are expensive: firing on every file save would pay the external
//! command's startup cost over and over. The debouncer coalesces a burst of
//! triggers for one key into a single callback, fired once the key has been
//! quiet for the configured interval. Keys are independent; a burst on one
//! key never delays another.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};
use tokio::{sync::Mutex, task::JoinHandle};

/// Debounces named triggers with a fixed quiet interval.
#[derive(Debug)]
pub struct Debouncer {
    interval: Duration,
    next_generation: AtomicU64,
    pending: Arc<Mutex<HashMap<String, PendingTimer>>>,
}

#[derive(Debug)]
struct PendingTimer {
    generation: u64,
    handle: JoinHandle<()>,
}

impl Debouncer {
    /// Creates a debouncer with the given quiet interval.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_generation: AtomicU64::new(0),
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// The configured quiet interval.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Schedules `action` to run once `key` has been quiet for the
    /// interval.
    ///
    /// Any timer already pending for `key` is canceled and restarted; a
    /// second timer is never queued behind the first. Only the timer that
    /// survives uncancelled fires.
    pub async fn trigger<F>(&self, key: impl Into<String>, action: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let key = key.into();
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let interval = self.interval;
        let shared = Arc::clone(&self.pending);

        let mut pending = self.pending.lock().await;
        if let Some(previous) = pending.remove(&key) {
            previous.handle.abort();
        }

        let task_key = key.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            {
                let mut pending = shared.lock().await;
                // Fire only if our timer is still the registered one.
                match pending.get(&task_key) {
                    Some(timer) if timer.generation == generation => {
                        pending.remove(&task_key);
                    }
                    _ => return,
                }
            }
            action();
        });
        // The map lock is held across the insert, so the spawned task
        // cannot observe the map before its own entry exists.
        pending.insert(key, PendingTimer { generation, handle });
    }

    /// Cancels all pending timers without firing them.
    pub async fn clear(&self) {
        let mut pending = self.pending.lock().await;
        for (_, timer) in pending.drain() {
            timer.handle.abort();
        }
    }

    /// The number of keys with a pending timer.
    pub async fn pending_len(&self) -> usize {
        self.pending.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use tokio::{sync::mpsc, time::timeout};

    const INTERVAL: Duration = Duration::from_millis(80);

    fn recorder() -> (
        mpsc::UnboundedSender<(&'static str, Instant)>,
        mpsc::UnboundedReceiver<(&'static str, Instant)>,
    ) {
        mpsc::unbounded_channel()
    }

    fn record(
        tx: &mpsc::UnboundedSender<(&'static str, Instant)>,
        label: &'static str,
    ) -> impl FnOnce() + Send + 'static {
        let tx = tx.clone();
        move || {
            let _ = tx.send((label, Instant::now()));
        }
    }

    #[tokio::test]
    async fn burst_coalesces_to_one_fire_after_last_trigger() {
        let debouncer = Debouncer::new(INTERVAL);
        let (tx, mut rx) = recorder();

        let mut last_trigger = Instant::now();
        for _ in 0..4 {
            debouncer.trigger("key", record(&tx, "key")).await;
            last_trigger = Instant::now();
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let (_, fired_at) = timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("callback should fire")
            .expect("sender alive");
        assert!(
            fired_at.duration_since(last_trigger) >= INTERVAL,
            "fired {:?} after last trigger, expected at least {INTERVAL:?}",
            fired_at.duration_since(last_trigger),
        );

        // No second fire for the same burst.
        tokio::time::sleep(INTERVAL * 2).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn keys_debounce_independently() {
        let debouncer = Debouncer::new(INTERVAL);
        let (tx, mut rx) = recorder();

        debouncer.trigger("a", record(&tx, "a")).await;
        debouncer.trigger("b", record(&tx, "b")).await;
        // Keep re-arming "a"; "b" must still fire on schedule.
        for _ in 0..3 {
            tokio::time::sleep(Duration::from_millis(30)).await;
            debouncer.trigger("a", record(&tx, "a")).await;
        }

        let (first, _) = timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("b should fire")
            .expect("sender alive");
        assert_eq!(first, "b");

        let (second, _) = timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("a should fire eventually")
            .expect("sender alive");
        assert_eq!(second, "a");
    }

    #[tokio::test]
    async fn clear_cancels_pending_timers_without_firing() {
        let debouncer = Debouncer::new(INTERVAL);
        let (tx, mut rx) = recorder();

        debouncer.trigger("a", record(&tx, "a")).await;
        debouncer.trigger("b", record(&tx, "b")).await;
        assert_eq!(debouncer.pending_len().await, 2);

        debouncer.clear().await;
        assert_eq!(debouncer.pending_len().await, 0);

        tokio::time::sleep(INTERVAL * 3).await;
        assert!(rx.try_recv().is_err(), "cleared timers must not fire");
    }

    #[tokio::test]
    async fn key_can_fire_again_after_a_fire() {
        let debouncer = Debouncer::new(INTERVAL);
        let (tx, mut rx) = recorder();

        debouncer.trigger("key", record(&tx, "key")).await;
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("first fire")
            .expect("sender alive");

        debouncer.trigger("key", record(&tx, "key")).await;
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("second fire")
            .expect("sender alive");
        assert_eq!(debouncer.pending_len().await, 0);
    }
}
