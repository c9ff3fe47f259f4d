//! Interruptible condition variable built on the park primitive.
//!
//! `parking_lot`'s own `Condvar` cannot be woken by [`Task::interrupt`], so
//! the blocking queue uses this condition instead: a FIFO list of parked
//! tasks, one [`signal`](Condition::signal) per state transition, waits that
//! observe the caller's interrupt flag.
//!
//! Signalling must happen while holding the data lock associated with the
//! wait (the waiter enqueues its slot before releasing that lock, so a
//! signaller that acquires the lock afterwards is guaranteed to see the
//! slot). Waits may also wake spuriously; callers re-check predicates.
//!
//! A waiter that consumed a signal but is about to report an interrupt
//! returns normally instead and leaves its interrupt flag set for the next
//! suspension point, so the signal is never lost.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Instant;

use parking_lot::{Mutex, MutexGuard};

use crate::error::Interrupted;
use crate::task::{self, Task};

const WAITING: u8 = 0;
const SIGNALLED: u8 = 1;
const ABORTED: u8 = 2;

/// One parked waiter. The state CAS decides who owns the slot's wake-up:
/// the signaller (WAITING → SIGNALLED) or the waiter itself on
/// timeout/interrupt (WAITING → ABORTED).
struct WaitSlot {
    task: Arc<Task>,
    state: AtomicU8,
}

pub(crate) struct Condition {
    waiters: Mutex<VecDeque<Arc<WaitSlot>>>,
}

impl Condition {
    pub(crate) const fn new() -> Self {
        Self {
            waiters: Mutex::new(VecDeque::new()),
        }
    }

    /// Releases `guard`, parks until signalled, re-acquires `guard`.
    pub(crate) fn wait<T>(&self, guard: &mut MutexGuard<'_, T>) -> Result<(), Interrupted> {
        self.wait_inner(guard, None).map(|_| ())
    }

    /// Timed [`wait`](Condition::wait). Returns `Ok(false)` when the
    /// deadline elapsed without a signal.
    pub(crate) fn wait_until<T>(
        &self,
        guard: &mut MutexGuard<'_, T>,
        deadline: Instant,
    ) -> Result<bool, Interrupted> {
        self.wait_inner(guard, Some(deadline))
    }

    fn wait_inner<T>(
        &self,
        guard: &mut MutexGuard<'_, T>,
        deadline: Option<Instant>,
    ) -> Result<bool, Interrupted> {
        let slot = Arc::new(WaitSlot {
            task: Task::current(),
            state: AtomicU8::new(WAITING),
        });
        // Enqueued while the caller still holds the data lock: any signaller
        // acquiring that lock afterwards sees this slot.
        self.waiters.lock().push_back(slot.clone());

        enum Wake {
            Signalled,
            Interrupted,
            Deadline,
        }

        let wake = MutexGuard::unlocked(guard, || {
            loop {
                if slot.state.load(Ordering::Acquire) == SIGNALLED {
                    return Wake::Signalled;
                }
                if slot.task.is_interrupted() {
                    return Wake::Interrupted;
                }
                match deadline {
                    Some(d) => {
                        if Instant::now() >= d {
                            return Wake::Deadline;
                        }
                        task::park_until(d);
                    }
                    None => task::park(),
                }
            }
        });

        match wake {
            Wake::Signalled => Ok(true),
            Wake::Interrupted => {
                if self.abort(&slot) {
                    slot.task.take_interrupt();
                    Err(Interrupted)
                } else {
                    // A signal won the race: honour it and leave the interrupt
                    // flag set for the next suspension point.
                    Ok(true)
                }
            }
            Wake::Deadline => {
                // An abort that loses to a concurrent signal counts as
                // signalled; the caller's predicate loop settles the rest.
                if self.abort(&slot) { Ok(false) } else { Ok(true) }
            }
        }
    }

    /// Takes the slot back from the signaller. Returns false when the slot
    /// was already signalled.
    fn abort(&self, slot: &Arc<WaitSlot>) -> bool {
        let mut queue = self.waiters.lock();
        if slot
            .state
            .compare_exchange(WAITING, ABORTED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            queue.retain(|s| !Arc::ptr_eq(s, slot));
            true
        } else {
            false
        }
    }

    /// Wakes the longest-waiting live slot, if any.
    pub(crate) fn signal(&self) {
        let mut queue = self.waiters.lock();
        while let Some(slot) = queue.pop_front() {
            if slot
                .state
                .compare_exchange(WAITING, SIGNALLED, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                slot.task.unpark();
                return;
            }
        }
    }

    /// Wakes every live slot.
    pub(crate) fn signal_all(&self) {
        let mut queue = self.waiters.lock();
        while let Some(slot) = queue.pop_front() {
            if slot
                .state
                .compare_exchange(WAITING, SIGNALLED, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                slot.task.unpark();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::{Duration, Instant};

    use parking_lot::Mutex;

    use super::*;
    use crate::task::Task;

    struct Fixture {
        lock: Mutex<bool>,
        cond: Condition,
    }

    impl Fixture {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                lock: Mutex::new(false),
                cond: Condition::new(),
            })
        }
    }

    /// A signal under the data lock wakes the waiter
    #[test]
    fn test_signal_wakes_waiter() {
        let fx = Fixture::new();
        let fx2 = fx.clone();

        let handle = thread::spawn(move || {
            let mut ready = fx2.lock.lock();
            while !*ready {
                fx2.cond.wait(&mut ready).unwrap();
            }
        });

        thread::sleep(Duration::from_millis(10));
        {
            let mut ready = fx.lock.lock();
            *ready = true;
            fx.cond.signal();
        }
        handle.join().unwrap();
    }

    /// A timed wait with no signal reports the deadline, at or after it
    #[test]
    fn test_wait_until_times_out() {
        let fx = Fixture::new();
        let deadline = Instant::now() + Duration::from_millis(20);
        let mut ready = fx.lock.lock();
        let signalled = fx.cond.wait_until(&mut ready, deadline).unwrap();
        assert!(!signalled);
        assert!(Instant::now() >= deadline);
    }

    /// An interrupt wakes the waiter with an error and consumes the flag
    #[test]
    fn test_interrupt_wakes_waiter() {
        let fx = Fixture::new();
        let fx2 = fx.clone();
        let (tx, rx) = std::sync::mpsc::channel();

        let handle = thread::spawn(move || {
            tx.send(Task::current()).unwrap();
            let mut ready = fx2.lock.lock();
            let out = fx2.cond.wait(&mut ready);
            (out, Task::current().is_interrupted())
        });

        let task = rx.recv().unwrap();
        thread::sleep(Duration::from_millis(10));
        task.interrupt();
        let (out, flag_after) = handle.join().unwrap();
        assert_eq!(out, Err(crate::Interrupted));
        assert!(!flag_after, "reporting the interrupt consumes the flag");
    }

    /// signal wakes exactly one of several waiters
    #[test]
    fn test_signal_wakes_one() {
        let fx = Fixture::new();
        let woken = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..3)
            .map(|_| {
                let fx = fx.clone();
                let woken = woken.clone();
                thread::spawn(move || {
                    let mut ready = fx.lock.lock();
                    if fx.cond.wait(&mut ready).is_ok() {
                        woken.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();

        thread::sleep(Duration::from_millis(20));
        {
            let _guard = fx.lock.lock();
            fx.cond.signal();
        }
        thread::sleep(Duration::from_millis(20));
        assert_eq!(woken.load(Ordering::SeqCst), 1);

        {
            let _guard = fx.lock.lock();
            fx.cond.signal_all();
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(woken.load(Ordering::SeqCst), 3);
    }
}
