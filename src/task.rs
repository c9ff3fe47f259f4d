//! Task identity, interrupt flag and the park primitive.
//!
//! Every blocking operation in this crate suspends through [`park`] /
//! [`park_until`] and is woken through [`Task::unpark`]. A [`Task`] is the
//! per-thread handle other threads keep to deliver those wake-ups and to
//! request interruption.
//!
//! ## Contract
//!
//! - [`park`] suspends the caller; [`park_until`] suspends with a deadline.
//! - [`Task::unpark`] ensures the next (or in-flight) park by that task
//!   returns. `std::thread` already provides the single-permit semantics:
//!   an unpark delivered before the park makes the park return immediately.
//! - Spurious wake-ups are allowed; callers re-check their predicates.
//! - [`Task::interrupt`] sets the interrupt flag and unparks, so a parked
//!   task observes the flag on its next predicate check.
//! - Timed waits below [`SPIN_FOR_TIMEOUT_THRESHOLD`] spin instead of
//!   parking: the wake is imminent and a park/unpark round trip would cost
//!   more than the remaining wait.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, Thread};
use std::time::{Duration, Instant};

/// Timed waits shorter than this spin instead of parking.
pub(crate) const SPIN_FOR_TIMEOUT_THRESHOLD: Duration = Duration::from_micros(1);

/// Per-thread handle: identity, wake-up and interrupt delivery.
#[derive(Debug)]
pub struct Task {
    thread: Thread,
    interrupted: AtomicBool,
}

thread_local! {
    static CURRENT: Arc<Task> = Arc::new(Task {
        thread: thread::current(),
        interrupted: AtomicBool::new(false),
    });
}

impl Task {
    /// Returns the calling thread's task handle.
    pub fn current() -> Arc<Task> {
        CURRENT.with(Arc::clone)
    }

    /// Asks the task to stop what it is doing.
    ///
    /// Sets the interrupt flag and unparks the task, so a blocked operation
    /// wakes, observes the flag and reports [`Interrupted`](crate::Interrupted).
    /// A task that never blocks sees the flag at its next poll.
    pub fn interrupt(&self) {
        // release-store pairs with the acquire in is_interrupted/take_interrupt:
        // whatever the interrupter wrote before interrupting is visible to the
        // interrupted task once it observes the flag
        self.interrupted.store(true, Ordering::Release);
        self.thread.unpark();
    }

    /// Observes the interrupt flag without consuming it.
    #[inline]
    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Acquire)
    }

    /// Consumes the interrupt flag, returning whether it was set.
    ///
    /// Exactly one observer consumes each delivered interrupt: the blocking
    /// operation that reports it, or the runner epilogue that absorbs a
    /// cancellation interrupt arriving after the state already settled.
    #[inline]
    pub fn take_interrupt(&self) -> bool {
        self.interrupted.swap(false, Ordering::AcqRel)
    }

    /// Grants the task's park permit, waking an in-flight or upcoming park.
    #[inline]
    pub fn unpark(&self) {
        self.thread.unpark();
    }
}

/// Suspends the calling thread until unparked (or spuriously).
#[inline]
pub fn park() {
    thread::park();
}

/// Suspends the calling thread until `deadline` or an unpark.
///
/// A deadline closer than [`SPIN_FOR_TIMEOUT_THRESHOLD`] spins once instead:
/// callers sit in a re-check loop, so the remaining nanoseconds burn off
/// without a syscall.
#[inline]
pub fn park_until(deadline: Instant) {
    if let Some(remaining) = deadline.checked_duration_since(Instant::now()) {
        if remaining < SPIN_FOR_TIMEOUT_THRESHOLD {
            std::hint::spin_loop();
        } else {
            thread::park_timeout(remaining);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;

    /// The handle is stable per thread
    #[test]
    fn test_current_is_stable() {
        let a = Task::current();
        let b = Task::current();
        assert!(Arc::ptr_eq(&a, &b));

        let c = std::thread::spawn(Task::current).join().unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
    }

    /// take_interrupt consumes the flag exactly once
    #[test]
    fn test_interrupt_is_consumed() {
        let task = Task::current();
        assert!(!task.is_interrupted());
        task.interrupt();
        assert!(task.is_interrupted());
        assert!(task.take_interrupt());
        assert!(!task.is_interrupted());
        assert!(!task.take_interrupt());
    }

    /// An interrupt delivered to a parked task wakes it with the flag set
    #[test]
    fn test_interrupt_wakes_parked_task() {
        let (tx, rx) = std::sync::mpsc::channel();
        let handle = std::thread::spawn(move || {
            let me = Task::current();
            tx.send(me.clone()).unwrap();
            while !me.is_interrupted() {
                park();
            }
        });

        let task = rx.recv().unwrap();
        std::thread::sleep(Duration::from_millis(10));
        task.interrupt();
        handle.join().unwrap();
    }

    /// An unpark delivered before the park makes the park return immediately
    #[test]
    fn test_unpark_before_park() {
        Task::current().unpark();
        let start = Instant::now();
        park();
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    /// A timed park returns no earlier than its deadline when nobody wakes it
    #[test]
    fn test_park_until_respects_deadline() {
        let deadline = Instant::now() + Duration::from_millis(20);
        while Instant::now() < deadline {
            park_until(deadline);
        }
        assert!(Instant::now() >= deadline);
    }
}
