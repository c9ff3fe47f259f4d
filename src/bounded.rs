//! Bounded FIFO blocking queue with independent head and tail locks.
//!
//! ## How it works
//!
//! ```text
//!  head (sentinel, item = None)          tail
//!   ↓                                     ↓
//! ┌────┐    ┌────┐    ┌────┐    ┌────┐
//! │ ∅  │ →  │ a  │ →  │ b  │ →  │ c  │ →  ∅
//! └────┘    └────┘    └────┘    └────┘
//! ```
//!
//! The head is a dummy node whose item is always empty; the first live
//! element is `head.next`. That split gives producers and consumers
//! disjoint pointer domains: whenever the queue is non-empty, producers
//! only touch `tail` (under `put_lock`) and consumers only touch `head`
//! (under `take_lock`), so a put and a take never contend.
//!
//! ## Synchronization
//!
//! | Access | Ordering | Purpose |
//! |--------|----------|---------|
//! | count increment (producer) | `AcqRel` | publish the linked node |
//! | count read (consumer) | `Acquire` | see the first `count` node links |
//! | count decrement (consumer) | `AcqRel` | hand the slot back |
//!
//! The count is the publication frontier: a producer links the node first
//! and increments last, a consumer reads the count first and only then
//! chases `head.next`. A consumer observing `count = n` therefore sees the
//! first `n` node publications without taking the producer's lock.
//!
//! ## Cascading wake-ups
//!
//! Each state transition issues a single `signal` (never a broadcast): a
//! producer that leaves slack wakes one more producer, a consumer that
//! leaves items wakes one more consumer, and the empty→non-empty /
//! full→non-full edges cross-signal the other side. Wake-up work stays
//! proportional to the number of transfers.

use std::cell::UnsafeCell;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crossbeam_utils::CachePadded;
use parking_lot::{Mutex, MutexGuard};

use crate::condition::Condition;
use crate::error::{CapacityExceeded, Interrupted, OfferError};

struct Node<T> {
    item: Option<T>,
    next: *mut Node<T>,
}

impl<T> Node<T> {
    fn sentinel() -> *mut Self {
        Box::into_raw(Box::new(Self {
            item: None,
            next: ptr::null_mut(),
        }))
    }
}

/// A bounded multi-producer multi-consumer FIFO queue.
///
/// Blocking inserts and removals park through the crate's task primitive
/// and therefore observe [`Task::interrupt`](crate::task::Task::interrupt).
pub struct BoundedQueue<T> {
    capacity: usize,
    count: CachePadded<AtomicUsize>,
    /// Sentinel node; guarded by `take_lock`.
    head: UnsafeCell<*mut Node<T>>,
    /// Last node; guarded by `put_lock`.
    tail: UnsafeCell<*mut Node<T>>,
    put_lock: Mutex<()>,
    not_full: Condition,
    take_lock: Mutex<()>,
    not_empty: Condition,
}

// Safety: every node access happens under the lock that owns its side of
// the list (or both locks for structural operations), items cross threads
// by value, and the count's release/acquire pairing publishes node links
// from producers to consumers.
unsafe impl<T: Send> Send for BoundedQueue<T> {}
unsafe impl<T: Send> Sync for BoundedQueue<T> {}

impl<T> std::fmt::Debug for BoundedQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundedQueue")
            .field("capacity", &self.capacity)
            .field("count", &self.count.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl<T> BoundedQueue<T> {
    /// Creates a queue holding at most `capacity` elements.
    ///
    /// # Panics
    ///
    /// Panics when `capacity` is zero (a zero-capacity handoff is what
    /// [`SyncChannel`](crate::handoff::SyncChannel) is for).
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "capacity must be positive");
        let sentinel = Node::sentinel();
        Self {
            capacity,
            count: CachePadded::new(AtomicUsize::new(0)),
            head: UnsafeCell::new(sentinel),
            tail: UnsafeCell::new(sentinel),
            put_lock: Mutex::new(()),
            not_full: Condition::new(),
            take_lock: Mutex::new(()),
            not_empty: Condition::new(),
        }
    }

    /// Creates a queue pre-populated from `items`, in iteration order.
    pub fn with_items<I>(capacity: usize, items: I) -> Result<Self, CapacityExceeded>
    where
        I: IntoIterator<Item = T>,
    {
        let queue = Self::new(capacity);
        {
            let _guard = queue.put_lock.lock();
            let mut n = 0;
            for item in items {
                if n == capacity {
                    return Err(CapacityExceeded);
                }
                queue.enqueue(item);
                n += 1;
            }
        }
        Ok(queue)
    }

    /// Inserts, blocking while the queue is full.
    ///
    /// The only failure is interruption, which hands the element back and
    /// leaves the queue unchanged.
    pub fn put(&self, item: T) -> Result<(), OfferError<T>> {
        let mut guard = self.put_lock.lock();
        while self.count.load(Ordering::Acquire) == self.capacity {
            if self.not_full.wait(&mut guard).is_err() {
                drop(guard);
                return Err(OfferError::Interrupted(item));
            }
        }
        let prev = self.enqueue(item);
        if prev + 1 < self.capacity {
            self.not_full.signal();
        }
        drop(guard);
        if prev == 0 {
            self.signal_not_empty();
        }
        Ok(())
    }

    /// Inserts only if the queue has room right now; hands the element
    /// back otherwise.
    pub fn offer(&self, item: T) -> Result<(), T> {
        if self.count.load(Ordering::Acquire) == self.capacity {
            return Err(item);
        }
        let prev;
        {
            let _guard = self.put_lock.lock();
            if self.count.load(Ordering::Acquire) == self.capacity {
                return Err(item);
            }
            prev = self.enqueue(item);
            if prev + 1 < self.capacity {
                self.not_full.signal();
            }
        }
        if prev == 0 {
            self.signal_not_empty();
        }
        Ok(())
    }

    /// Inserts, blocking up to `timeout` for room.
    pub fn offer_timeout(&self, item: T, timeout: Duration) -> Result<(), OfferError<T>> {
        let deadline = Instant::now() + timeout;
        let mut guard = self.put_lock.lock();
        while self.count.load(Ordering::Acquire) == self.capacity {
            if Instant::now() >= deadline {
                drop(guard);
                return Err(OfferError::Full(item));
            }
            match self.not_full.wait_until(&mut guard, deadline) {
                Ok(_) => {}
                Err(Interrupted) => {
                    drop(guard);
                    return Err(OfferError::Interrupted(item));
                }
            }
        }
        let prev = self.enqueue(item);
        if prev + 1 < self.capacity {
            self.not_full.signal();
        }
        drop(guard);
        if prev == 0 {
            self.signal_not_empty();
        }
        Ok(())
    }

    /// Removes the head element, blocking while the queue is empty.
    pub fn take(&self) -> Result<T, Interrupted> {
        let mut guard = self.take_lock.lock();
        while self.count.load(Ordering::Acquire) == 0 {
            self.not_empty.wait(&mut guard)?;
        }
        let (item, prev) = self.dequeue();
        if prev > 1 {
            self.not_empty.signal();
        }
        drop(guard);
        if prev == self.capacity {
            self.signal_not_full();
        }
        Ok(item)
    }

    /// Removes the head element if one is available right now.
    pub fn poll(&self) -> Option<T> {
        if self.count.load(Ordering::Acquire) == 0 {
            return None;
        }
        let item;
        let prev;
        {
            let _guard = self.take_lock.lock();
            if self.count.load(Ordering::Acquire) == 0 {
                return None;
            }
            let (taken, p) = self.dequeue();
            item = taken;
            prev = p;
            if prev > 1 {
                self.not_empty.signal();
            }
        }
        if prev == self.capacity {
            self.signal_not_full();
        }
        Some(item)
    }

    /// Removes the head element, blocking up to `timeout`. `Ok(None)` means
    /// the deadline elapsed with the queue still empty.
    pub fn poll_timeout(&self, timeout: Duration) -> Result<Option<T>, Interrupted> {
        let deadline = Instant::now() + timeout;
        let mut guard = self.take_lock.lock();
        while self.count.load(Ordering::Acquire) == 0 {
            if Instant::now() >= deadline {
                return Ok(None);
            }
            self.not_empty.wait_until(&mut guard, deadline)?;
        }
        let (item, prev) = self.dequeue();
        if prev > 1 {
            self.not_empty.signal();
        }
        drop(guard);
        if prev == self.capacity {
            self.signal_not_full();
        }
        Ok(Some(item))
    }

    /// Clones the head element without removing it.
    pub fn peek(&self) -> Option<T>
    where
        T: Clone,
    {
        let _guard = self.take_lock.lock();
        if self.count.load(Ordering::Acquire) == 0 {
            return None;
        }
        // Safety: take_lock is held and count > 0, so head.next is a
        // published live node that no consumer can unlink underneath us.
        unsafe {
            let first = (*(*self.head.get())).next;
            (*first).item.clone()
        }
    }

    /// Number of elements currently queued.
    pub fn len(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Free slots remaining (capacity minus length).
    pub fn remaining_capacity(&self) -> usize {
        self.capacity - self.len()
    }

    /// Removes the first element equal to `target`. Takes both locks.
    pub fn remove(&self, target: &T) -> bool
    where
        T: PartialEq,
    {
        let _guards = self.fully_lock();
        // Safety: both locks held, the list is frozen.
        unsafe {
            let mut pred = *self.head.get();
            let mut node = (*pred).next;
            while !node.is_null() {
                if (*node).item.as_ref() == Some(target) {
                    self.unlink(pred, node);
                    return true;
                }
                pred = node;
                node = (*node).next;
            }
        }
        false
    }

    /// Whether any element equals `target`. Takes both locks.
    pub fn contains(&self, target: &T) -> bool
    where
        T: PartialEq,
    {
        let _guards = self.fully_lock();
        // Safety: both locks held, the list is frozen.
        unsafe {
            let mut node = (*(*self.head.get())).next;
            while !node.is_null() {
                if (*node).item.as_ref() == Some(target) {
                    return true;
                }
                node = (*node).next;
            }
        }
        false
    }

    /// Discards every element. Takes both locks.
    pub fn clear(&self) {
        let _guards = self.fully_lock();
        // Safety: both locks held, the list is frozen.
        unsafe {
            let sentinel = *self.head.get();
            let mut node = (*sentinel).next;
            while !node.is_null() {
                let next = (*node).next;
                drop(Box::from_raw(node));
                node = next;
            }
            (*sentinel).next = ptr::null_mut();
            *self.tail.get() = sentinel;
        }
        if self.count.swap(0, Ordering::AcqRel) == self.capacity {
            self.not_full.signal();
        }
    }

    /// Moves every queued element into `sink`; returns how many moved.
    pub fn drain_to<E>(&self, sink: &mut E) -> usize
    where
        E: Extend<T>,
    {
        self.drain_to_limit(sink, usize::MAX)
    }

    /// Moves up to `max` elements into `sink`; returns how many moved.
    ///
    /// Holds only `take_lock`, so producers keep running while the drain is
    /// in progress.
    pub fn drain_to_limit<E>(&self, sink: &mut E, max: usize) -> usize
    where
        E: Extend<T>,
    {
        let guard = self.take_lock.lock();
        let n = max.min(self.count.load(Ordering::Acquire));
        // Safety: take_lock is held and the first n nodes are published by
        // the count read above.
        unsafe {
            let mut head = *self.head.get();
            for _ in 0..n {
                let first = (*head).next;
                drop(Box::from_raw(head));
                head = first;
                sink.extend((*first).item.take());
            }
            *self.head.get() = head;
        }
        let was_full = n > 0 && self.count.fetch_sub(n, Ordering::AcqRel) == self.capacity;
        drop(guard);
        if was_full {
            self.signal_not_full();
        }
        n
    }

    /// Weakly consistent iteration: an owned snapshot taken under both
    /// locks. Elements inserted or removed afterwards are not reflected;
    /// the iterator never fails on concurrent modification.
    pub fn iter(&self) -> std::vec::IntoIter<T>
    where
        T: Clone,
    {
        let mut items = Vec::with_capacity(self.len());
        {
            let _guards = self.fully_lock();
            // Safety: both locks held, the list is frozen.
            unsafe {
                let mut node = (*(*self.head.get())).next;
                while !node.is_null() {
                    if let Some(item) = (*node).item.as_ref() {
                        items.push(item.clone());
                    }
                    node = (*node).next;
                }
            }
        }
        items.into_iter()
    }

    /// Links `item` at the tail. Caller holds `put_lock`. Returns the
    /// pre-increment count.
    fn enqueue(&self, item: T) -> usize {
        let node = Box::into_raw(Box::new(Node {
            item: Some(item),
            next: ptr::null_mut(),
        }));
        // Safety: put_lock serialises tail access; the link is published to
        // consumers by the count increment below.
        unsafe {
            let tail = *self.tail.get();
            (*tail).next = node;
            *self.tail.get() = node;
        }
        self.count.fetch_add(1, Ordering::AcqRel)
    }

    /// Unlinks the first element. Caller holds `take_lock` and has
    /// observed `count > 0`. Returns the item and the pre-decrement count.
    fn dequeue(&self) -> (T, usize) {
        // Safety: take_lock serialises head access; count > 0 published the
        // first node, which becomes the new sentinel.
        let item = unsafe {
            let head = *self.head.get();
            let first = (*head).next;
            drop(Box::from_raw(head));
            *self.head.get() = first;
            (*first).item.take()
        };
        let prev = self.count.fetch_sub(1, Ordering::AcqRel);
        match item {
            Some(item) => (item, prev),
            None => unreachable!("sentinel reached dequeue with count > 0"),
        }
    }

    /// Unlinks `node` after `pred`. Caller holds both locks.
    unsafe fn unlink(&self, pred: *mut Node<T>, node: *mut Node<T>) {
        unsafe {
            (*pred).next = (*node).next;
            if *self.tail.get() == node {
                *self.tail.get() = pred;
            }
            drop(Box::from_raw(node));
        }
        if self.count.fetch_sub(1, Ordering::AcqRel) == self.capacity {
            self.not_full.signal();
        }
    }

    /// Both locks, always in put → take order.
    fn fully_lock(&self) -> (MutexGuard<'_, ()>, MutexGuard<'_, ()>) {
        let put = self.put_lock.lock();
        let take = self.take_lock.lock();
        (put, take)
    }

    fn signal_not_empty(&self) {
        let _guard = self.take_lock.lock();
        self.not_empty.signal();
    }

    fn signal_not_full(&self) {
        let _guard = self.put_lock.lock();
        self.not_full.signal();
    }
}

impl<T> Drop for BoundedQueue<T> {
    fn drop(&mut self) {
        // Safety: exclusive access; frees the sentinel and any unread nodes.
        unsafe {
            let mut node = *self.head.get_mut();
            while !node.is_null() {
                let next = (*node).next;
                drop(Box::from_raw(node));
                node = next;
            }
        }
    }
}
