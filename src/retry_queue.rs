//! Time-ordered queue of outstanding reliable fragments awaiting acknowledgement.
//!
//! Entries live in a min-heap keyed by due time. A timer task sleeps until the
//!  earliest due time, pops the minimum, hands it to the owner for resending and
//!  reinserts it with a fresh due time; pushes and removals re-aim the sleep at
//!  the new minimum. Every firing first upgrades a weak reference to the owner
//!  and exits silently if the owner is gone - this is what keeps retries from
//!  outliving their connection.

use crate::buffers::pool::SharedBuffer;
use crate::wire::DataHeader;
use async_trait::async_trait;
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::select;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::trace;

/// The object a fired retry is handed back to, in practice the owning connection.
#[async_trait]
pub trait ResendTarget: Send + Sync + 'static {
    async fn resend(&self, entry: &RetryEntry);
}

/// One outstanding fragment: its header (for ack matching) and the pinned datagram.
#[derive(Clone)]
pub struct RetryEntry {
    pub header: DataHeader,
    pub datagram: SharedBuffer,
}

struct HeapSlot {
    due: Instant,
    /// tie-break so equal due times pop in insertion order
    insertion: u64,
    entry: RetryEntry,
}

impl PartialEq for HeapSlot {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.insertion == other.insertion
    }
}
impl Eq for HeapSlot {}

impl PartialOrd for HeapSlot {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapSlot {
    fn cmp(&self, other: &Self) -> Ordering {
        self.due
            .cmp(&other.due)
            .then(self.insertion.cmp(&other.insertion))
    }
}

struct RetryQueueInner {
    heap: BinaryHeap<Reverse<HeapSlot>>,
    insertion_counter: u64,
}

pub struct RetryQueue {
    interval: Duration,
    inner: Arc<Mutex<RetryQueueInner>>,
    rearm: Arc<Notify>,
    timer: JoinHandle<()>,
}

impl RetryQueue {
    pub fn new(interval: Duration, owner: Weak<dyn ResendTarget>) -> RetryQueue {
        let inner = Arc::new(Mutex::new(RetryQueueInner {
            heap: BinaryHeap::new(),
            insertion_counter: 0,
        }));
        let rearm = Arc::new(Notify::new());

        let timer = tokio::spawn(Self::timer_loop(
            interval,
            Arc::downgrade(&inner),
            rearm.clone(),
            owner,
        ));

        RetryQueue {
            interval,
            inner,
            rearm,
            timer,
        }
    }

    /// Queues an entry due after one retry interval and rearms the timer.
    pub fn push(&self, entry: RetryEntry) {
        {
            let mut inner = self.lock();
            let insertion = inner.insertion_counter;
            inner.insertion_counter += 1;

            inner.heap.push(Reverse(HeapSlot {
                due: Instant::now() + self.interval,
                insertion,
                entry,
            }));
        }
        self.rearm.notify_one();
    }

    /// Removes the first entry matching `pred`, restoring the heap. Returns whether
    ///  anything was removed.
    pub fn remove_one_if(&self, pred: impl Fn(&RetryEntry) -> bool) -> bool {
        let removed = {
            let mut inner = self.lock();
            if inner.heap.is_empty() {
                return false;
            }

            let mut slots = std::mem::take(&mut inner.heap).into_vec();
            let found = slots.iter().position(|Reverse(slot)| pred(&slot.entry));

            let removed = match found {
                Some(index) => {
                    slots.swap_remove(index);
                    true
                }
                None => false,
            };
            inner.heap = BinaryHeap::from(slots);
            removed
        };

        if removed {
            self.rearm.notify_one();
        }
        removed
    }

    /// Removes all entries matching `pred`. Returns whether anything was removed.
    pub fn remove_all_if(&self, pred: impl Fn(&RetryEntry) -> bool) -> bool {
        let removed = {
            let mut inner = self.lock();
            if inner.heap.is_empty() {
                return false;
            }

            let len_before = inner.heap.len();
            inner.heap.retain(|Reverse(slot)| !pred(&slot.entry));
            inner.heap.len() != len_before
        };

        if removed {
            self.rearm.notify_one();
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().heap.is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, RetryQueueInner> {
        self.inner.lock().expect("retry queue lock poisoned")
    }

    async fn timer_loop(
        interval: Duration,
        inner: Weak<Mutex<RetryQueueInner>>,
        rearm: Arc<Notify>,
        owner: Weak<dyn ResendTarget>,
    ) {
        loop {
            let earliest = {
                let Some(inner) = inner.upgrade() else {
                    return;
                };
                let inner = inner.lock().expect("retry queue lock poisoned");
                inner.heap.peek().map(|Reverse(slot)| slot.due)
            };

            match earliest {
                None => {
                    // nothing queued; wait until a push rearms us
                    rearm.notified().await;
                }
                Some(due) => {
                    select! {
                        _ = sleep_until(due) => {
                            Self::fire(interval, &inner, &owner).await;
                        }
                        _ = rearm.notified() => {
                            // the minimum changed; recompute the wait
                        }
                    }
                }
            }
        }
    }

    async fn fire(
        interval: Duration,
        inner: &Weak<Mutex<RetryQueueInner>>,
        owner: &Weak<dyn ResendTarget>,
    ) {
        let Some(owner) = owner.upgrade() else {
            trace!("retry timer fired after its owner was dropped - ignoring");
            return;
        };

        let entry = {
            let Some(inner) = inner.upgrade() else {
                return;
            };
            let mut inner = inner.lock().expect("retry queue lock poisoned");

            // a removal may have raced with this firing; re-check emptiness
            let Some(Reverse(mut slot)) = inner.heap.pop() else {
                return;
            };

            let entry = slot.entry.clone();
            slot.due = Instant::now() + interval;
            slot.insertion = inner.insertion_counter;
            inner.insertion_counter += 1;
            inner.heap.push(Reverse(slot));

            entry
        };

        owner.resend(&entry).await;
    }
}

impl Drop for RetryQueue {
    fn drop(&mut self) {
        self.timer.abort();
    }
}
