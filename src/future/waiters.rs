//! Treiber stack of tasks waiting on a promise.
//!
//! The stack head is an `AtomicPtr`; pushes CAS the head, the completer
//! swaps the whole chain out in one step (the swap linearises the
//! broadcast), and a waiter that gives up (timeout, interrupt) unsplices
//! its own node.
//!
//! ## Node lifetime
//!
//! Nodes are `Arc`-counted. Every structure field holding a node pointer
//! (the head, each `next`) owns one strong count. A count moves only
//! through an atomic exchange on the field that holds it: the thread whose
//! CAS/swap extracts a pointer owns that count and releases it through an
//! epoch-deferred drop, so any thread that loaded the pointer under an
//! epoch pin may still dereference it. A node's own `Drop` releases the
//! count left in its `next` field, which keeps a successor alive for as
//! long as any predecessor still links to it.

use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

use crossbeam_epoch as epoch;

use crate::task::Task;

/// One blocked `get` caller.
pub(super) struct Waiter {
    task: Arc<Task>,
    /// Cleared exactly once: by the broadcaster (which then unparks) or by
    /// the waiter itself on timeout/interrupt. A cleared node is dead and
    /// gets unspliced by the next traversal that sees it.
    active: AtomicBool,
    next: AtomicPtr<Waiter>,
}

impl Waiter {
    pub(super) fn new(task: Arc<Task>) -> Arc<Self> {
        Arc::new(Self {
            task,
            active: AtomicBool::new(true),
            next: AtomicPtr::new(ptr::null_mut()),
        })
    }

    /// Marks the node dead without unsplicing it; the broadcast sweep (or a
    /// later unlink pass) discards it.
    pub(super) fn retire(&self) {
        self.active.store(false, Ordering::Release);
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        let next = *self.next.get_mut();
        if !next.is_null() {
            // Safety: this field owned one strong count on the successor and
            // no other thread can touch a node whose count reached zero.
            unsafe { drop(Arc::from_raw(next)) };
        }
    }
}

/// Links `node` as the new head.
pub(super) fn push(head: &AtomicPtr<Waiter>, node: &Arc<Waiter>) {
    // +1 owned by the head field once the CAS lands
    let raw = Arc::into_raw(node.clone()).cast_mut();
    loop {
        let h = head.load(Ordering::Acquire);
        node.next.store(h, Ordering::Relaxed);
        // Release publishes the node fields (and the next link) to any
        // thread that acquire-loads the head. On success the count the head
        // held on `h` now lives in `node.next`.
        if head
            .compare_exchange_weak(h, raw, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            return;
        }
    }
}

/// Broadcast: detaches the whole chain and unparks every live waiter.
///
/// Called exactly once per promise, on the terminal transition; the head
/// swap is the linearisation point.
pub(super) fn wake_all(head: &AtomicPtr<Waiter>) {
    let guard = epoch::pin();
    let mut cur = head.swap(ptr::null_mut(), Ordering::AcqRel);
    while !cur.is_null() {
        // Safety: the swap above (or the next-swap below) handed us the
        // structure's count on `cur`, so it is alive.
        let node = unsafe { &*cur };
        if node.active.swap(false, Ordering::AcqRel) {
            node.task.unpark();
        }
        // Taking the next pointer by swap (not load) keeps count ownership
        // unambiguous against a concurrent unsplice of the same field.
        let next = node.next.swap(ptr::null_mut(), Ordering::AcqRel);
        let retired = cur.cast_const();
        // Safety: we own the count extracted above; deferring the release
        // lets concurrently pinned traversals finish with the node.
        unsafe { guard.defer_unchecked(move || drop(Arc::from_raw(retired))) };
        cur = next;
    }
}

/// Retires `node` and unsplices every dead node it can reach.
///
/// Head mutations go through CAS because the completer and enrollers race
/// with us; an observed race restarts from the head.
pub(super) fn unlink(head: &AtomicPtr<Waiter>, node: &Arc<Waiter>) {
    node.retire();
    let guard = epoch::pin();
    'restart: loop {
        let mut pred: *mut Waiter = ptr::null_mut();
        let mut cur = head.load(Ordering::Acquire);
        while !cur.is_null() {
            // Safety: loaded from a live field under the pin; a concurrent
            // removal only defers its count release past this guard.
            let cur_ref = unsafe { &*cur };
            let next = cur_ref.next.load(Ordering::Acquire);
            if cur_ref.active.load(Ordering::Acquire) {
                pred = cur;
                cur = next;
            } else if !pred.is_null() {
                // Safety: `pred` stays alive for the same reason as `cur`.
                let pred_ref = unsafe { &*pred };
                if !next.is_null() {
                    // Safety: the new field needs its own count; `next` is alive.
                    unsafe { Arc::increment_strong_count(next) };
                }
                match pred_ref
                    .next
                    .compare_exchange(cur, next, Ordering::AcqRel, Ordering::Acquire)
                {
                    Ok(_) => {
                        let retired = cur.cast_const();
                        // Safety: the CAS extracted pred.next's count on `cur`.
                        unsafe { guard.defer_unchecked(move || drop(Arc::from_raw(retired))) };
                    }
                    Err(_) => {
                        if !next.is_null() {
                            // Safety: rolls back the speculative increment above.
                            unsafe { Arc::decrement_strong_count(next) };
                        }
                    }
                }
                if !pred_ref.active.load(Ordering::Acquire) {
                    continue 'restart;
                }
                cur = next;
            } else {
                // dead node at the head
                if !next.is_null() {
                    // Safety: as above, the head field needs its own count.
                    unsafe { Arc::increment_strong_count(next) };
                }
                match head.compare_exchange(cur, next, Ordering::AcqRel, Ordering::Acquire) {
                    Ok(_) => {
                        let retired = cur.cast_const();
                        // Safety: the CAS extracted the head's count on `cur`.
                        unsafe { guard.defer_unchecked(move || drop(Arc::from_raw(retired))) };
                        cur = next;
                    }
                    Err(_) => {
                        if !next.is_null() {
                            // Safety: rolls back the speculative increment above.
                            unsafe { Arc::decrement_strong_count(next) };
                        }
                        continue 'restart;
                    }
                }
            }
        }
        return;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain_len(head: &AtomicPtr<Waiter>) -> usize {
        let _guard = epoch::pin();
        let mut n = 0;
        let mut cur = head.load(Ordering::Acquire);
        while !cur.is_null() {
            n += 1;
            cur = unsafe { &*cur }.next.load(Ordering::Acquire);
        }
        n
    }

    fn release_chain(head: &AtomicPtr<Waiter>) {
        let chain = head.swap(ptr::null_mut(), Ordering::AcqRel);
        if !chain.is_null() {
            unsafe { drop(Arc::from_raw(chain.cast_const())) };
        }
    }

    /// Pushes stack in LIFO order; unlink removes exactly the retired node
    #[test]
    fn test_push_and_unlink() {
        let head = AtomicPtr::new(ptr::null_mut());
        let a = Waiter::new(Task::current());
        let b = Waiter::new(Task::current());
        let c = Waiter::new(Task::current());
        push(&head, &a);
        push(&head, &b);
        push(&head, &c);
        assert_eq!(chain_len(&head), 3);

        // interior removal
        unlink(&head, &b);
        assert_eq!(chain_len(&head), 2);

        // head removal
        unlink(&head, &c);
        assert_eq!(chain_len(&head), 1);

        release_chain(&head);
    }

    /// Broadcast unparks each live waiter exactly once and empties the stack
    #[test]
    fn test_wake_all_clears_stack() {
        let head = AtomicPtr::new(ptr::null_mut());
        let nodes: Vec<_> = (0..4).map(|_| Waiter::new(Task::current())).collect();
        for node in &nodes {
            push(&head, node);
        }
        nodes[1].retire();

        wake_all(&head);
        assert_eq!(chain_len(&head), 0);
        for node in &nodes {
            assert!(!node.active.load(Ordering::Acquire));
        }
    }

    /// Counts balance: every node is freed once all owners let go
    #[test]
    fn test_no_leak_after_broadcast() {
        let head = AtomicPtr::new(ptr::null_mut());
        let nodes: Vec<_> = (0..8).map(|_| Waiter::new(Task::current())).collect();
        for node in &nodes {
            push(&head, node);
        }
        wake_all(&head);
        drop(nodes);
        // the deferred releases hold no count of their own; the stack is
        // empty, so a fresh push/broadcast cycle works
        let late = Waiter::new(Task::current());
        push(&head, &late);
        wake_all(&head);
        assert_eq!(chain_len(&head), 0);
    }
}
