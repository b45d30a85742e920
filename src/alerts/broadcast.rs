//! Fan-out delivery with per-subscriber bounded buffers
//!
//! Publishing never blocks on a subscriber: each subscriber owns a bounded
//! mailbox drained by its own delivery thread. When a mailbox is full the
//! oldest undelivered item is dropped and counted for that subscriber only.

use log::{error, warn};
use std::collections::VecDeque;
use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, RwLock};
use std::thread::{self, JoinHandle, ThreadId};

struct Mailbox<T> {
    queue: VecDeque<T>,
    closed: bool,
}

struct Subscriber<T> {
    id: u64,
    mailbox: Mutex<Mailbox<T>>,
    ready: Condvar,
    capacity: usize,
    dropped: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
}

impl<T> Subscriber<T> {
    fn lock(&self) -> MutexGuard<'_, Mailbox<T>> {
        self.mailbox
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn close(&self) {
        let mut mailbox = self.lock();
        mailbox.closed = true;
        mailbox.queue.clear();
        self.ready.notify_all();
    }

    fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

/// Publishes items to any number of subscribers
pub struct Broadcaster<T> {
    name: &'static str,
    capacity: usize,
    next_id: AtomicU64,
    subscribers: RwLock<Vec<Arc<Subscriber<T>>>>,
    dropped_total: AtomicU64,
}

impl<T: Clone + Send + 'static> Broadcaster<T> {
    /// # Arguments
    ///
    /// * `name` - Prefix of delivery thread names
    /// * `capacity` - Undelivered items buffered per subscriber
    pub fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            capacity: capacity.max(1),
            next_id: AtomicU64::new(1),
            subscribers: RwLock::new(Vec::new()),
            dropped_total: AtomicU64::new(0),
        }
    }

    /// Register a callback run on a dedicated delivery thread
    ///
    /// Delivery is at-most-once and in publish order. A panicking callback is
    /// contained and counted; later items are still delivered.
    pub fn subscribe<F>(&self, callback: F) -> io::Result<Subscription<T>>
    where
        F: Fn(&T) + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let subscriber = Arc::new(Subscriber {
            id,
            mailbox: Mutex::new(Mailbox {
                queue: VecDeque::new(),
                closed: false,
            }),
            ready: Condvar::new(),
            capacity: self.capacity,
            dropped: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        });

        let worker_subscriber = Arc::clone(&subscriber);
        let handle = thread::Builder::new()
            .name(format!("{}-subscriber-{}", self.name, id))
            .spawn(move || deliver_loop(worker_subscriber, callback))?;

        self.subscribers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(Arc::clone(&subscriber));

        Ok(Subscription {
            worker: Some(handle.thread().id()),
            handle: Some(handle),
            subscriber,
        })
    }

    /// Hand an item to every subscriber without waiting for delivery
    pub fn publish(&self, item: &T) {
        let mut saw_closed = false;
        {
            let subscribers = self
                .subscribers
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            for subscriber in subscribers.iter() {
                let mut mailbox = subscriber.lock();
                if mailbox.closed {
                    saw_closed = true;
                    continue;
                }
                if mailbox.queue.len() >= subscriber.capacity {
                    mailbox.queue.pop_front();
                    let dropped = subscriber.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    self.dropped_total.fetch_add(1, Ordering::Relaxed);
                    if dropped == 1 || dropped % 100 == 0 {
                        warn!(
                            "{} subscriber {} is falling behind, {} item(s) dropped",
                            self.name, subscriber.id, dropped
                        );
                    }
                }
                mailbox.queue.push_back(item.clone());
                subscriber.ready.notify_one();
            }
        }

        if saw_closed {
            self.subscribers
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .retain(|subscriber| !subscriber.is_closed());
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .filter(|subscriber| !subscriber.is_closed())
            .count()
    }

    /// Items dropped across all subscribers, including departed ones
    pub fn dropped_total(&self) -> u64 {
        self.dropped_total.load(Ordering::Relaxed)
    }
}

fn deliver_loop<T, F>(subscriber: Arc<Subscriber<T>>, callback: F)
where
    F: Fn(&T),
{
    loop {
        let item = {
            let mut mailbox = subscriber.lock();
            loop {
                if mailbox.closed {
                    return;
                }
                if let Some(item) = mailbox.queue.pop_front() {
                    break item;
                }
                mailbox = subscriber
                    .ready
                    .wait(mailbox)
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
            }
        };

        if catch_unwind(AssertUnwindSafe(|| callback(&item))).is_err() {
            subscriber.failed.fetch_add(1, Ordering::Relaxed);
            error!("Subscriber {} callback panicked", subscriber.id);
        } else {
            subscriber.delivered.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Handle of one subscriber; dropping it unsubscribes
pub struct Subscription<T> {
    subscriber: Arc<Subscriber<T>>,
    handle: Option<JoinHandle<()>>,
    worker: Option<ThreadId>,
}

impl<T> Subscription<T> {
    /// Stop delivery
    ///
    /// Waits for an in-flight callback to return, so no callback runs after
    /// this returns. Called from inside the callback it only stops further
    /// deliveries.
    pub fn unsubscribe(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.subscriber.close();
        if let Some(handle) = self.handle.take() {
            if self.worker != Some(thread::current().id()) && handle.join().is_err() {
                error!("Subscriber {} delivery thread panicked", self.subscriber.id);
            }
        }
    }

    /// Items dropped for this subscriber because it fell behind
    pub fn dropped(&self) -> u64 {
        self.subscriber.dropped.load(Ordering::Relaxed)
    }

    pub fn delivered(&self) -> u64 {
        self.subscriber.delivered.load(Ordering::Relaxed)
    }

    /// Callbacks that panicked
    pub fn failed(&self) -> u64 {
        self.subscriber.failed.load(Ordering::Relaxed)
    }

    /// Items waiting for delivery
    pub fn pending(&self) -> usize {
        self.subscriber.lock().queue.len()
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
