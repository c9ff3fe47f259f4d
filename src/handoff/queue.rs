//! Fair transfer algorithm: a FIFO dual queue.
//!
//! One linked queue with a permanent dummy head. Arrivals of the mode
//! already queued append at the tail and wait; complementary arrivals
//! fulfil the node right behind the dummy, so matching is in arrival
//! order, per role and across roles.
//!
//! The rendezvous is linearised by a CAS on the waited node's item slot:
//! a producer publishes its boxed payload into a consumer node
//! (null → item), a consumer extracts a producer node's payload
//! (item → null). The slot also encodes cancellation: `item == self`.
//! An off-list node is self-linked (`next == self`); readers treat an
//! observed self-link as "restart from the head".
//!
//! ## Cleanup
//!
//! Unsplicing a cancelled interior node is O(1): `pred.next = s.next`.
//! The queue's tail can never be unspliced directly (its successor is not
//! known to be stable), so deleting a cancelled tail is postponed: the
//! node's predecessor is parked in `clean_me` and removed at the next
//! cleanup once the victim is no longer the tail. That guarantees
//! termination even when trailing nodes are cancelled back to back.
//!
//! ## Node lifetime
//!
//! As in the dual stack: nodes are `Arc`-counted, every structure field
//! (head, tail, `next`, `clean_me`) owns one strong count, counts move
//! only through the atomic exchange that links or unlinks them, and
//! releases are deferred through an epoch guard. Payload boxes are owned
//! by whoever wins the item CAS.

use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::time::Instant;

use crossbeam_epoch::{self as epoch, Guard};
use crossbeam_utils::CachePadded;
use crossbeam_utils::atomic::AtomicCell;

use super::{SpinPolicy, Unmatched, Wait};
use crate::task::{self, Task};

struct QNode<T> {
    /// Successor; owns one strong count while linked. `self` (uncounted)
    /// once the node is off the list.
    next: AtomicPtr<QNode<T>>,
    /// Rendezvous slot: null = awaiting an item, a box = holding one,
    /// `self` = cancelled (or already harvested). The CAS away from the
    /// born-with value is the linearisation point.
    item: AtomicPtr<T>,
    /// Parked owner; taken by the fulfiller for an exactly-once unpark.
    waiter: AtomicCell<Option<Arc<Task>>>,
    is_data: bool,
    /// The slot value this node was born with (a producer's box, or null
    /// for a consumer); never changes, read only by the owner.
    original: *mut T,
}

// Safety: payload boxes are owned by whoever wins the item CAS and cross
// threads by value; the rest is atomics and `Arc<Task>`.
unsafe impl<T: Send> Send for QNode<T> {}
unsafe impl<T: Send> Sync for QNode<T> {}

impl<T> QNode<T> {
    fn new(item: Option<T>, is_data: bool) -> Arc<Self> {
        let original = match item {
            Some(value) => Box::into_raw(Box::new(value)),
            None => ptr::null_mut(),
        };
        Arc::new(Self {
            next: AtomicPtr::new(ptr::null_mut()),
            item: AtomicPtr::new(original),
            waiter: AtomicCell::new(None),
            is_data,
            original,
        })
    }

    fn cancel_sentinel(&self) -> *mut T {
        ptr::from_ref(self).cast_mut().cast()
    }

    /// Marks the node cancelled; loses against a concurrent fulfil.
    fn try_cancel(&self) {
        let _ = self.item.compare_exchange(
            self.original,
            self.cancel_sentinel(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    fn is_cancelled(&self) -> bool {
        self.item.load(Ordering::Acquire) == self.cancel_sentinel()
    }

    fn is_off_list(&self) -> bool {
        ptr::eq(self.next.load(Ordering::Acquire), self)
    }

    /// Takes the born-with payload back out of a node that will never
    /// match: still private, or cancelled (the cancel CAS re-took the box).
    fn reclaim_item(&self) -> Option<T> {
        if self.original.is_null() {
            return None;
        }
        // A still-private node's slot holds the box; neutralise it so Drop
        // cannot double-free. A cancelled node keeps showing the sentinel.
        let _ = self.item.compare_exchange(
            self.original,
            ptr::null_mut(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        // Safety: in both permitted states this thread owns the box.
        Some(unsafe { *Box::from_raw(self.original) })
    }

    /// CAS on the successor link, moving counts with the pointers.
    fn cas_next(&self, expected: *mut QNode<T>, new: *mut QNode<T>, guard: &Guard) -> bool {
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

    /// Appends `node` after this (tail) node; the link field mints one
    /// count on it.
    fn link_next(&self, node: &Arc<QNode<T>>) -> bool {
        let raw = Arc::into_raw(node.clone()).cast_mut();
        if self
            .next
            .compare_exchange(ptr::null_mut(), raw, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            true
        } else {
            // Safety: rolls back the count minted for the link.
            unsafe { Arc::decrement_strong_count(raw.cast_const()) };
            false
        }
    }
}

impl<T> Drop for QNode<T> {
    fn drop(&mut self) {
        let next = *self.next.get_mut();
        if !next.is_null() && !ptr::eq(next, self) {
            // Safety: a linked next owns one count; the self-link left by a
            // dequeue is uncounted.
            unsafe { drop(Arc::from_raw(next.cast_const())) };
        }
        let item = *self.item.get_mut();
        if !item.is_null() && item != self.cancel_sentinel() {
            // Safety: an unharvested payload box still belongs to the node.
            unsafe { drop(Box::from_raw(item)) };
        }
    }
}

pub(crate) struct TransferQueue<T> {
    head: CachePadded<AtomicPtr<QNode<T>>>,
    tail: CachePadded<AtomicPtr<QNode<T>>>,
    /// Predecessor of a cancelled ex-tail whose deletion was postponed.
    clean_me: AtomicPtr<QNode<T>>,
    spin: SpinPolicy,
}

// Safety: as for QNode; the structure fields are counted atomics.
unsafe impl<T: Send> Send for TransferQueue<T> {}
unsafe impl<T: Send> Sync for TransferQueue<T> {}

impl<T> TransferQueue<T> {
    pub(crate) fn new(spin: SpinPolicy) -> Self {
        let dummy = QNode::new(None, false);
        let head = Arc::into_raw(dummy.clone()).cast_mut();
        let tail = Arc::into_raw(dummy).cast_mut();
        Self {
            head: CachePadded::new(AtomicPtr::new(head)),
            tail: CachePadded::new(AtomicPtr::new(tail)),
            clean_me: AtomicPtr::new(ptr::null_mut()),
            spin,
        }
    }

    /// Puts or takes an item; `Some` marks the caller a producer.
    pub(crate) fn transfer(
        &self,
        mut item: Option<T>,
        wait: Wait,
    ) -> Result<Option<T>, Unmatched<T>> {
        let is_data = item.is_some();
        let mut s: Option<Arc<QNode<T>>> = None;

        loop {
            let guard = epoch::pin();
            let t = self.tail.load(Ordering::Acquire);
            let h = self.head.load(Ordering::Acquire);
            // Safety: loaded under the pin; unlink releases are deferred.
            let t_ref = unsafe { &*t };

            if h == t || t_ref.is_data == is_data {
                // empty or same-mode tail: line up and wait
                let tn = t_ref.next.load(Ordering::Acquire);
                if t != self.tail.load(Ordering::Acquire) {
                    continue;
                }
                if !tn.is_null() {
                    // lagging tail (a self-linked tn just means the lag is
                    // still being repaired by the enqueuer)
                    self.advance_tail(t, tn, &guard);
                    continue;
                }
                if wait.expired() {
                    return Err(Unmatched {
                        item: reclaim(&mut s, item),
                        interrupted: false,
                    });
                }
                let node = s
                    .get_or_insert_with(|| QNode::new(item.take(), is_data))
                    .clone();
                if !t_ref.link_next(&node) {
                    continue;
                }
                let node_raw = Arc::as_ptr(&node).cast_mut();
                self.advance_tail(t, node_raw, &guard);
                // Keep the predecessor alive across the wait: clean() needs
                // to dereference it after an arbitrarily long park.
                // Safety: `t` is alive under the pin (deferred releases
                // have not run), so its count cannot be stale.
                let pred = unsafe {
                    Arc::increment_strong_count(t.cast_const());
                    Arc::from_raw(t.cast_const())
                };
                drop(guard);

                let x = self.await_fulfill(&node, &wait);
                if x == node.cancel_sentinel() {
                    self.clean(&pred, &node);
                    let interrupted = Task::current().take_interrupt();
                    return Err(Unmatched {
                        item: node.reclaim_item(),
                        interrupted,
                    });
                }
                let guard = epoch::pin();
                if !node.is_off_list() {
                    // we were fulfilled while still first in line: retire
                    // the old dummy, we are the dummy now
                    self.advance_head(t, node_raw, &guard);
                }
                let received = if is_data {
                    None
                } else {
                    // Safety: the fulfiller's CAS published this box and
                    // handed it to us; the sentinel store keeps Drop away
                    // from the raw pointer left in the slot.
                    let received = unsafe { *Box::from_raw(x) };
                    node.item.store(node.cancel_sentinel(), Ordering::Release);
                    Some(received)
                };
                node.waiter.take();
                return Ok(received);
            } else {
                // complementary mode: fulfil the node behind the dummy
                // Safety: loaded under the pin.
                let m = unsafe { &*h }.next.load(Ordering::Acquire);
                if t != self.tail.load(Ordering::Acquire)
                    || m.is_null()
                    || h != self.head.load(Ordering::Acquire)
                {
                    continue; // inconsistent reads
                }
                // Safety: reachable through the head's counted link.
                let m_ref = unsafe { &*m };
                let x = m_ref.item.load(Ordering::Acquire);
                if is_data == !x.is_null() || x == m_ref.cancel_sentinel() {
                    // already fulfilled, or cancelled: step over it
                    self.advance_head(h, m, &guard);
                    continue;
                }
                let offered = match item.take() {
                    Some(value) => Box::into_raw(Box::new(value)),
                    None => ptr::null_mut(),
                };
                match m_ref
                    .item
                    .compare_exchange(x, offered, Ordering::AcqRel, Ordering::Acquire)
                {
                    Ok(_) => {
                        self.advance_head(h, m, &guard);
                        if let Some(waiter) = m_ref.waiter.take() {
                            waiter.unpark();
                        }
                        return Ok(if is_data {
                            None
                        } else {
                            // Safety: the CAS handed us the producer's box.
                            Some(unsafe { *Box::from_raw(x) })
                        });
                    }
                    Err(_) => {
                        if !offered.is_null() {
                            // Safety: reclaims the box we failed to install.
                            item = Some(unsafe { *Box::from_raw(offered) });
                        }
                        self.advance_head(h, m, &guard);
                    }
                }
            }
        }
    }

    /// Spin-then-park until this node's slot flips or it is cancelled;
    /// returns the new slot value.
    fn await_fulfill(&self, s: &Arc<QNode<T>>, wait: &Wait) -> *mut T {
        let deadline = wait.deadline();
        let current = Task::current();
        // FIFO: only the node next in line is worth spinning for
        let mut spins = if self.next_in_line(s) {
            self.spin.budget(wait.is_timed())
        } else {
            0
        };
        let mut registered = false;
        loop {
            if current.is_interrupted() {
                s.try_cancel();
            }
            let x = s.item.load(Ordering::Acquire);
            if x != s.original {
                return x;
            }
            if let Some(d) = deadline
                && Instant::now() >= d
            {
                s.try_cancel();
                continue;
            }
            if spins > 0 {
                spins -= 1;
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

    fn next_in_line(&self, s: &Arc<QNode<T>>) -> bool {
        let _guard = epoch::pin();
        let head = self.head.load(Ordering::Acquire);
        // Safety: loaded under the pin.
        unsafe { &*head }.next.load(Ordering::Acquire) == Arc::as_ptr(s).cast_mut()
    }

    /// Swings the tail forward, releasing the old tail's count.
    fn advance_tail(&self, t: *mut QNode<T>, tn: *mut QNode<T>, guard: &Guard) {
        // Safety: `tn` is alive (loaded under the caller's pin).
        unsafe { Arc::increment_strong_count(tn.cast_const()) };
        match self
            .tail
            .compare_exchange(t, tn, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                let retired = t.cast_const();
                // Safety: the CAS extracted the tail's count on `t`.
                unsafe { guard.defer_unchecked(move || drop(Arc::from_raw(retired))) };
            }
            Err(_) => {
                // Safety: rolls back the speculative increment.
                unsafe { Arc::decrement_strong_count(tn.cast_const()) };
            }
        }
    }

    /// Retires the dummy `h`, making `nh` the new dummy. The old dummy is
    /// self-linked (off-list sentinel) and its links are drained.
    fn advance_head(&self, h: *mut QNode<T>, nh: *mut QNode<T>, guard: &Guard) {
        // Safety: `nh` is alive (loaded under the caller's pin).
        unsafe { Arc::increment_strong_count(nh.cast_const()) };
        match self
            .head
            .compare_exchange(h, nh, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                // Safety: the CAS extracted the head's count on `h`.
                let h_ref = unsafe { &*h };
                let old_next = h_ref.next.swap(h, Ordering::AcqRel);
                if !old_next.is_null() && old_next != h {
                    let retired = old_next.cast_const();
                    // Safety: the swap extracted the next link's count.
                    unsafe { guard.defer_unchecked(move || drop(Arc::from_raw(retired))) };
                }
                let retired = h.cast_const();
                // Safety: releasing the extracted head count.
                unsafe { guard.defer_unchecked(move || drop(Arc::from_raw(retired))) };
            }
            Err(_) => {
                // Safety: rolls back the speculative increment.
                unsafe { Arc::decrement_strong_count(nh.cast_const()) };
            }
        }
    }

    fn cas_clean_me(&self, expected: *mut QNode<T>, new: *mut QNode<T>, guard: &Guard) -> bool {
        if !new.is_null() {
            // Safety: `new` is alive (the caller holds an Arc on it).
            unsafe { Arc::increment_strong_count(new.cast_const()) };
        }
        match self
            .clean_me
            .compare_exchange(expected, new, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                if !expected.is_null() {
                    let retired = expected.cast_const();
                    // Safety: the CAS extracted the field's count.
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

    /// Unlinks the cancelled node `s` whose predecessor was `pred`, or
    /// postpones the deletion through `clean_me` when `s` is the tail.
    fn clean(&self, pred: &Arc<QNode<T>>, s: &Arc<QNode<T>>) {
        s.waiter.take();
        let guard = epoch::pin();
        let s_raw = Arc::as_ptr(s).cast_mut();
        let pred_raw = Arc::as_ptr(pred).cast_mut();

        while pred.next.load(Ordering::Acquire) == s_raw {
            let h = self.head.load(Ordering::Acquire);
            // Safety: pinned loads throughout this walk.
            let hn = unsafe { &*h }.next.load(Ordering::Acquire);
            if !hn.is_null() && hn != h && unsafe { &*hn }.is_cancelled() {
                // absorb a cancelled first node into the dummy position
                self.advance_head(h, hn, &guard);
                continue;
            }
            let t = self.tail.load(Ordering::Acquire);
            if t == h {
                return; // empty, nothing left to unlink
            }
            let t_ref = unsafe { &*t };
            let tn = t_ref.next.load(Ordering::Acquire);
            if t != self.tail.load(Ordering::Acquire) {
                continue;
            }
            if !tn.is_null() {
                self.advance_tail(t, tn, &guard);
                continue;
            }
            if s_raw != t {
                // not the tail: splice out directly
                let sn = s.next.load(Ordering::Acquire);
                if sn == s_raw || pred.cas_next(s_raw, sn, &guard) {
                    return;
                }
            }
            // s is (or raced back to) the tail: work on the postponed
            // victim instead, then try to park ourselves in clean_me
            let dp = self.clean_me.load(Ordering::Acquire);
            if !dp.is_null() {
                // Safety: clean_me holds a count on dp.
                let dp_ref = unsafe { &*dp };
                let d = dp_ref.next.load(Ordering::Acquire);
                let reaped = if d.is_null() || d == dp {
                    true // victim is gone or dp is off the list
                } else {
                    // Safety: reachable through dp's counted link.
                    let d_ref = unsafe { &*d };
                    if !d_ref.is_cancelled() {
                        true // stale registration
                    } else if d != t {
                        let dn = d_ref.next.load(Ordering::Acquire);
                        !dn.is_null() && dn != d && dp_ref.cas_next(d, dn, &guard)
                    } else {
                        false // still the tail, keep postponing
                    }
                };
                if reaped {
                    self.cas_clean_me(dp, ptr::null_mut(), &guard);
                }
                if dp == pred_raw {
                    return; // someone already parked s for deletion
                }
            } else if self.cas_clean_me(ptr::null_mut(), pred_raw, &guard) {
                return; // postponed: the next clean pass deletes s
            }
        }
    }
}

impl<T> Drop for TransferQueue<T> {
    fn drop(&mut self) {
        // Release the three structure counts; node drops cascade down the
        // remaining links.
        let clean_me = *self.clean_me.get_mut();
        if !clean_me.is_null() {
            // Safety: exclusive access; each field owned its count.
            unsafe { drop(Arc::from_raw(clean_me.cast_const())) };
        }
        let tail = *self.tail.get_mut();
        if !tail.is_null() {
            // Safety: as above.
            unsafe { drop(Arc::from_raw(tail.cast_const())) };
        }
        let head = *self.head.get_mut();
        if !head.is_null() {
            // Safety: as above.
            unsafe { drop(Arc::from_raw(head.cast_const())) };
        }
    }
}

/// Pulls the payload back out of a node that never got linked, so a
/// retried attempt (or the caller) can have it again.
fn reclaim<T>(s: &mut Option<Arc<QNode<T>>>, item: Option<T>) -> Option<T> {
    match s.take() {
        Some(node) => node.reclaim_item().or(item),
        None => item,
    }
}
