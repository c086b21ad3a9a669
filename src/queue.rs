//! FIFO stage queues with a completion counter.
//!
//! A `StageQueue` tracks every item ever put until the consumer acknowledges
//! it, so `join` distinguishes "nothing visible in the queue" from "everything
//! taken out has finished". The acknowledgement is the [`Ack`] token handed
//! out with each item: consuming it or dropping it marks the item done, once.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify, Semaphore};

pub struct StageQueue<T> {
    name: &'static str,
    items: Mutex<VecDeque<T>>,
    depth: AtomicUsize,
    available: Notify,
    slots: Option<Semaphore>,
    tracker: Arc<CompletionTracker>,
}

#[derive(Debug, Default)]
struct CompletionTracker {
    unfinished: AtomicUsize,
    drained: Notify,
}

impl CompletionTracker {
    fn mark_done(&self) {
        let previous = self
            .unfinished
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        match previous {
            Ok(1) => self.drained.notify_waiters(),
            Ok(_) => {}
            Err(_) => tracing::error!("completion counter underflow"),
        }
    }
}

/// Completion token for one dequeued item.
#[must_use = "dropping the ack immediately marks the item done"]
#[derive(Debug)]
pub struct Ack {
    tracker: Arc<CompletionTracker>,
    acknowledged: bool,
}

impl Ack {
    pub fn done(mut self) {
        self.acknowledge();
    }

    fn acknowledge(&mut self) {
        if !self.acknowledged {
            self.acknowledged = true;
            self.tracker.mark_done();
        }
    }
}

impl Drop for Ack {
    fn drop(&mut self) {
        self.acknowledge();
    }
}

impl<T> StageQueue<T> {
    pub fn unbounded(name: &'static str) -> Self {
        Self::with_slots(name, None)
    }

    pub fn bounded(name: &'static str, capacity: usize) -> Self {
        Self::with_slots(name, Some(Semaphore::new(capacity)))
    }

    /// Bounded when `capacity` is set, unbounded otherwise.
    pub fn with_capacity(name: &'static str, capacity: Option<usize>) -> Self {
        match capacity {
            Some(capacity) => Self::bounded(name, capacity),
            None => Self::unbounded(name),
        }
    }

    fn with_slots(name: &'static str, slots: Option<Semaphore>) -> Self {
        Self {
            name,
            items: Mutex::new(VecDeque::new()),
            depth: AtomicUsize::new(0),
            available: Notify::new(),
            slots,
            tracker: Arc::new(CompletionTracker::default()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Append an item, suspending while a bounded queue is full.
    pub async fn put(&self, item: T) {
        if let Some(slots) = &self.slots {
            // The semaphore is never closed, so acquire cannot fail.
            if let Ok(permit) = slots.acquire().await {
                permit.forget();
            }
        }

        self.tracker.unfinished.fetch_add(1, Ordering::AcqRel);
        {
            // depth moves under the lock so a concurrent pop can never wrap it
            let mut items = self.items.lock().await;
            items.push_back(item);
            self.depth.fetch_add(1, Ordering::AcqRel);
        }
        self.available.notify_one();
    }

    /// Take the oldest item, suspending while the queue is empty.
    pub async fn get(&self) -> (T, Ack) {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(item) = self.try_pop().await {
                return item;
            }

            notified.await;
        }
    }

    /// Like [`get`](Self::get) but gives up after `wait`.
    pub async fn get_timeout(&self, wait: Duration) -> Option<(T, Ack)> {
        tokio::time::timeout(wait, self.get()).await.ok()
    }

    async fn try_pop(&self) -> Option<(T, Ack)> {
        let item = {
            let mut items = self.items.lock().await;
            let item = items.pop_front()?;
            self.depth.fetch_sub(1, Ordering::AcqRel);
            item
        };
        if let Some(slots) = &self.slots {
            slots.add_permits(1);
        }

        let ack = Ack {
            tracker: self.tracker.clone(),
            acknowledged: false,
        };
        Some((item, ack))
    }

    /// Resolve once every item ever put has been acknowledged.
    pub async fn join(&self) {
        loop {
            let drained = self.tracker.drained.notified();
            tokio::pin!(drained);
            drained.as_mut().enable();

            if self.unfinished() == 0 {
                return;
            }

            drained.await;
        }
    }

    /// Items currently waiting in the queue.
    pub fn len(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Items put but not yet acknowledged, whether queued or in flight.
    pub fn unfinished(&self) -> usize {
        self.tracker.unfinished.load(Ordering::Acquire)
    }
}

impl<T> std::fmt::Debug for StageQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageQueue")
            .field("name", &self.name)
            .field("len", &self.len())
            .field("unfinished", &self.unfinished())
            .finish()
    }
}
