//! Unfair transfer algorithm: a LIFO dual stack.
//!
//! Waiters and fulfillers share one Treiber stack. Each main-loop pass
//! takes one of three actions, decided by the head:
//!
//! 1. empty or same-mode head — push a waiter node and spin-then-park
//!    until matched (or cancelled);
//! 2. complementary head with no fulfiller in flight — push a `FULFILLING`
//!    marker on top of the waiter and try to match it;
//! 3. head already fulfilling — help it finish, then retry.
//!
//! A node is matched exactly when its `matched` pointer is non-null; the
//! CAS that sets it is the rendezvous linearisation point. Cancellation is
//! `matched == self`.
//!
//! ## Node lifetime
//!
//! Nodes are `Arc`-counted; the head and every `next` link own one strong
//! count apiece, and `matched` owns a count on the fulfiller (the `self`
//! sentinel is uncounted). A pop extracts the head's count and also drains
//! the popped node's `next` link, which is what keeps a matched pair from
//! keeping each other alive through the `matched` back-reference. Releases
//! are deferred through an epoch guard so concurrent traversals never
//! observe freed memory; no guard is held across a park.

use std::cell::UnsafeCell;
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::time::Instant;

use crossbeam_epoch::{self as epoch, Guard};
use crossbeam_utils::CachePadded;
use crossbeam_utils::atomic::AtomicCell;

use super::{SpinPolicy, Unmatched, Wait};
use crate::task::{self, Task};

const REQUEST: usize = 0;
const DATA: usize = 1;
const FULFILLING: usize = 2;

fn is_fulfilling(mode: usize) -> bool {
    mode & FULFILLING != 0
}

struct SNode<T> {
    /// Successor; owns one strong count while this node is linked.
    next: AtomicPtr<SNode<T>>,
    /// Fulfiller that matched this node (counted), or `self` (uncounted)
    /// when cancelled. The CAS from null is the linearisation point.
    matched: AtomicPtr<SNode<T>>,
    /// Parked owner; taken by the matcher for an exactly-once unpark.
    waiter: AtomicCell<Option<Arc<Task>>>,
    /// A producer's payload.
    item: UnsafeCell<Option<T>>,
    /// Rewritten only while the node is private (before a push lands).
    mode: AtomicUsize,
}

// Safety: the payload crosses threads by value (taken through the cell
// exactly once, under the matched/push publication edges); everything else
// is atomics and `Arc<Task>`.
unsafe impl<T: Send> Send for SNode<T> {}
unsafe impl<T: Send> Sync for SNode<T> {}

impl<T> SNode<T> {
    fn new(item: Option<T>, mode: usize) -> Arc<Self> {
        Arc::new(Self {
            next: AtomicPtr::new(ptr::null_mut()),
            matched: AtomicPtr::new(ptr::null_mut()),
            waiter: AtomicCell::new(None),
            item: UnsafeCell::new(item),
            mode: AtomicUsize::new(mode),
        })
    }

    fn mode(&self) -> usize {
        self.mode.load(Ordering::Relaxed)
    }

    /// Marks the node cancelled; loses against a concurrent match.
    fn try_cancel(&self) {
        let sentinel = ptr::from_ref(self).cast_mut();
        let _ = self.matched.compare_exchange(
            ptr::null_mut(),
            sentinel,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    fn is_cancelled(&self) -> bool {
        ptr::eq(self.matched.load(Ordering::Acquire), self)
    }

    /// Takes the payload. The caller has exclusive rights to it: the node
    /// is still private, or cancelled (a cancelled node never matches), or
    /// the caller won the match CAS on it.
    fn take_item(&self) -> Option<T> {
        unsafe { (*self.item.get()).take() }
    }

    /// CAS on the successor link, with the count moving accordingly:
    /// the new pointer gains a count, the unlinked one is released once
    /// current readers are done.
    fn cas_next(&self, expected: *mut SNode<T>, new: *mut SNode<T>, guard: &Guard) -> bool {
        if !new.is_null() {
            // Safety: `new` is alive (loaded under the pin).
            unsafe { Arc::increment_strong_count(new.cast_const()) };
        }
        match self
            .next
            .compare_exchange(expected, new, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                if !expected.is_null() {
                    let retired = expected.cast_const();
                    // Safety: the CAS extracted this field's count.
                    unsafe { guard.defer_unchecked(move || drop(Arc::from_raw(retired))) };
                }
                true
            }
            Err(_) => {
                if !new.is_null() {
                    // Safety: rolls back the speculative increment.
                    unsafe { Arc::decrement_strong_count(new.cast_const()) };
                }
                false
            }
        }
    }
}

impl<T> Drop for SNode<T> {
    fn drop(&mut self) {
        let next = *self.next.get_mut();
        if !next.is_null() {
            // Safety: a linked next owns one count; pops drain it, so a
            // non-null value here is a count still owed.
            unsafe { drop(Arc::from_raw(next.cast_const())) };
        }
        let matched = *self.matched.get_mut();
        if !matched.is_null() && !ptr::eq(matched, self) {
            // Safety: a match installed one count on the fulfiller.
            unsafe { drop(Arc::from_raw(matched.cast_const())) };
        }
    }
}

/// Matches `m` to the fulfiller `s`, waking `m`'s owner. Returns true when
/// `m` is matched to `s`, whether by this call or a helping one.
fn try_match<T>(m: &SNode<T>, s: *mut SNode<T>) -> bool {
    // Safety: `s` is alive (caller holds an Arc or loaded it under a pin);
    // the increment backs the count the matched field will own.
    unsafe { Arc::increment_strong_count(s.cast_const()) };
    match m
        .matched
        .compare_exchange(ptr::null_mut(), s, Ordering::AcqRel, Ordering::Acquire)
    {
        Ok(_) => {
            if let Some(waiter) = m.waiter.take() {
                waiter.unpark();
            }
            true
        }
        Err(existing) => {
            // Safety: rolls back the speculative increment.
            unsafe { Arc::decrement_strong_count(s.cast_const()) };
            ptr::eq(existing, s)
        }
    }
}

pub(crate) struct TransferStack<T> {
    head: CachePadded<AtomicPtr<SNode<T>>>,
    spin: SpinPolicy,
}

// Safety: all shared state is the counted head pointer and the nodes,
// which are Send/Sync as above.
unsafe impl<T: Send> Send for TransferStack<T> {}
unsafe impl<T: Send> Sync for TransferStack<T> {}

impl<T> TransferStack<T> {
    pub(crate) fn new(spin: SpinPolicy) -> Self {
        Self {
            head: CachePadded::new(AtomicPtr::new(ptr::null_mut())),
            spin,
        }
    }

    /// Puts or takes an item; `Some` marks the caller a producer.
    pub(crate) fn transfer(
        &self,
        mut item: Option<T>,
        wait: Wait,
    ) -> Result<Option<T>, Unmatched<T>> {
        let mode = if item.is_some() { DATA } else { REQUEST };
        let mut s: Option<Arc<SNode<T>>> = None;

        loop {
            let guard = epoch::pin();
            let head = self.head.load(Ordering::Acquire);
            // Safety: loaded under the pin; unlink releases are deferred.
            let head_ref = unsafe { head.as_ref() };
            let head_mode = head_ref.map(SNode::mode);

            if head_mode.is_none() || head_mode == Some(mode) {
                // empty or same-mode: we must wait our turn
                if wait.expired() {
                    if let Some(h) = head_ref
                        && h.is_cancelled()
                    {
                        self.pop_head(head, h.next.load(Ordering::Acquire), &guard);
                        continue;
                    }
                    let item = reclaim(&mut s, item);
                    return Err(Unmatched {
                        item,
                        interrupted: false,
                    });
                }
                let node = s
                    .get_or_insert_with(|| SNode::new(item.take(), mode))
                    .clone();
                node.mode.store(mode, Ordering::Relaxed);
                node.next.store(head, Ordering::Relaxed);
                if !self.push_head(head, &node) {
                    continue;
                }
                drop(guard);

                let matched = self.await_fulfill(&node, &wait);
                if ptr::eq(matched, Arc::as_ptr(&node)) {
                    // cancelled: unsplice and report why
                    self.clean(&node);
                    let interrupted = Task::current().take_interrupt();
                    return Err(Unmatched {
                        item: node.take_item(),
                        interrupted,
                    });
                }
                // help the fulfiller pop the pair off the stack
                {
                    let guard = epoch::pin();
                    let h = self.head.load(Ordering::Acquire);
                    if !h.is_null()
                        // Safety: loaded under the pin.
                        && unsafe { &*h }.next.load(Ordering::Acquire)
                            == Arc::as_ptr(&node).cast_mut()
                    {
                        self.pop_head(h, node.next.load(Ordering::Acquire), &guard);
                    }
                }
                return Ok(if mode == REQUEST {
                    // Safety: `matched` is kept alive by the count our
                    // node's matched field owns.
                    unsafe { &*matched }.take_item()
                } else {
                    None
                });
            } else if head_mode.is_some_and(|m| !is_fulfilling(m)) {
                // complementary waiter on top: try to fulfil it
                let h = unsafe { &*head };
                if h.is_cancelled() {
                    self.pop_head(head, h.next.load(Ordering::Acquire), &guard);
                    continue;
                }
                let node = s
                    .get_or_insert_with(|| SNode::new(item.take(), FULFILLING | mode))
                    .clone();
                node.mode.store(FULFILLING | mode, Ordering::Relaxed);
                node.next.store(head, Ordering::Relaxed);
                if !self.push_head(head, &node) {
                    continue;
                }
                let node_raw = Arc::as_ptr(&node).cast_mut();
                loop {
                    let m = node.next.load(Ordering::Acquire);
                    if m.is_null() {
                        // every waiter bailed: withdraw the marker
                        self.pop_head(node_raw, ptr::null_mut(), &guard);
                        item = reclaim(&mut s, item);
                        break;
                    }
                    // Safety: `m` stays reachable through our node's
                    // counted next link.
                    let m_ref = unsafe { &*m };
                    let mn = m_ref.next.load(Ordering::Acquire);
                    if try_match(m_ref, node_raw) {
                        self.pop_head(node_raw, mn, &guard);
                        // Safety: winning the match CAS gave us the
                        // producer's payload (we keep our own on a put).
                        return Ok(if mode == REQUEST {
                            m_ref.take_item()
                        } else {
                            None
                        });
                    }
                    // lost to a cancel: unlink the dead waiter
                    node.cas_next(m, mn, &guard);
                }
            } else {
                // a fulfiller is mid-match at the head: help it
                let h = unsafe { &*head };
                let m = h.next.load(Ordering::Acquire);
                if m.is_null() {
                    self.pop_head(head, ptr::null_mut(), &guard);
                } else {
                    // Safety: reachable through the head's counted link.
                    let m_ref = unsafe { &*m };
                    let mn = m_ref.next.load(Ordering::Acquire);
                    if try_match(m_ref, head) {
                        self.pop_head(head, mn, &guard);
                    } else {
                        h.cas_next(m, mn, &guard);
                    }
                }
            }
        }
    }

    /// Spin-then-park until this node is matched or cancelled; returns the
    /// matched pointer (`self` when cancelled).
    fn await_fulfill(&self, s: &Arc<SNode<T>>, wait: &Wait) -> *mut SNode<T> {
        let deadline = wait.deadline();
        let current = Task::current();
        let mut spins = if self.should_spin(s) {
            self.spin.budget(wait.is_timed())
        } else {
            0
        };
        let mut registered = false;
        loop {
            if current.is_interrupted() {
                s.try_cancel();
            }
            let matched = s.matched.load(Ordering::Acquire);
            if !matched.is_null() {
                return matched;
            }
            if let Some(d) = deadline
                && Instant::now() >= d
            {
                s.try_cancel();
                continue;
            }
            if spins > 0 {
                spins = if self.should_spin(s) { spins - 1 } else { 0 };
                std::hint::spin_loop();
            } else if !registered {
                s.waiter.store(Some(current.clone()));
                registered = true;
            } else {
                match deadline {
                    // park_until spins through sub-microsecond remainders
                    Some(d) => task::park_until(d),
                    None => task::park(),
                }
            }
        }
    }

    /// A node at (or just under a fulfiller at) the head is likely to be
    /// matched next, so spinning beats parking.
    fn should_spin(&self, s: &Arc<SNode<T>>) -> bool {
        let _guard = epoch::pin();
        let head = self.head.load(Ordering::Acquire);
        head.is_null()
            || ptr::eq(head, Arc::as_ptr(s))
            // Safety: loaded under the pin.
            || is_fulfilling(unsafe { &*head }.mode())
    }

    /// Links `node` at the head. On success the count the head held on the
    /// displaced top moves into `node.next`; on failure the link is
    /// cleared so the node carries no stray count.
    fn push_head(&self, expected: *mut SNode<T>, node: &Arc<SNode<T>>) -> bool {
        let raw = Arc::into_raw(node.clone()).cast_mut();
        if self
            .head
            .compare_exchange(expected, raw, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            true
        } else {
            node.next.store(ptr::null_mut(), Ordering::Relaxed);
            // Safety: rolls back the count minted for the head field.
            unsafe { Arc::decrement_strong_count(raw.cast_const()) };
            false
        }
    }

    /// Pops `old` by CASing the head to `new`, draining `old`'s next link.
    /// The drain is what severs a matched pair's mutual references.
    fn pop_head(&self, old: *mut SNode<T>, new: *mut SNode<T>, guard: &Guard) -> bool {
        if !new.is_null() {
            // Safety: alive, loaded under the caller's pin.
            unsafe { Arc::increment_strong_count(new.cast_const()) };
        }
        match self
            .head
            .compare_exchange(old, new, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                // Safety: the CAS extracted the head's count on `old`, so
                // it is alive for the drain below.
                let old_ref = unsafe { &*old };
                let next = old_ref.next.swap(ptr::null_mut(), Ordering::AcqRel);
                if !next.is_null() {
                    let retired = next.cast_const();
                    // Safety: the swap extracted the next link's count.
                    unsafe { guard.defer_unchecked(move || drop(Arc::from_raw(retired))) };
                }
                let retired = old.cast_const();
                // Safety: releasing the extracted head count, deferred past
                // concurrent readers.
                unsafe { guard.defer_unchecked(move || drop(Arc::from_raw(retired))) };
                true
            }
            Err(_) => {
                if !new.is_null() {
                    // Safety: rolls back the speculative increment.
                    unsafe { Arc::decrement_strong_count(new.cast_const()) };
                }
                false
            }
        }
    }

    /// Unsplices a cancelled node: walk from the head to a stop past the
    /// node, dropping every cancelled node on the way. O(n) in waiters,
    /// but runs concurrently with everything else.
    fn clean(&self, s: &Arc<SNode<T>>) {
        s.waiter.take();
        let guard = epoch::pin();

        let mut past = s.next.load(Ordering::Acquire);
        if !past.is_null()
            // Safety: reachable through s's counted link.
            && unsafe { &*past }.is_cancelled()
        {
            past = unsafe { &*past }.next.load(Ordering::Acquire);
        }

        // absorb cancelled nodes at the head
        let mut p;
        loop {
            p = self.head.load(Ordering::Acquire);
            if p.is_null() || p == past {
                break;
            }
            // Safety: loaded under the pin.
            let p_ref = unsafe { &*p };
            if !p_ref.is_cancelled() {
                break;
            }
            self.pop_head(p, p_ref.next.load(Ordering::Acquire), &guard);
        }

        // unsplice embedded cancelled nodes up to the stop
        while !p.is_null() && p != past {
            // Safety: loaded under the pin.
            let p_ref = unsafe { &*p };
            let n = p_ref.next.load(Ordering::Acquire);
            if n.is_null() {
                break;
            }
            // Safety: reachable through p's counted link.
            let n_ref = unsafe { &*n };
            if n_ref.is_cancelled() {
                p_ref.cas_next(n, n_ref.next.load(Ordering::Acquire), &guard);
            } else {
                p = n;
            }
        }
    }
}

impl<T> Drop for TransferStack<T> {
    fn drop(&mut self) {
        // Release the head's count; node drops cascade down the links.
        let head = *self.head.get_mut();
        if !head.is_null() {
            // Safety: exclusive access, the head field owned this count.
            unsafe { drop(Arc::from_raw(head.cast_const())) };
        }
    }
}

/// Pulls the payload back out of a node we are abandoning before it was
/// ever (or is no longer) shared, so a retried attempt can move it again.
fn reclaim<T>(s: &mut Option<Arc<SNode<T>>>, item: Option<T>) -> Option<T> {
    match s.take() {
        Some(node) => node.take_item().or(item),
        None => item,
    }
}
