//! One-shot cancellable computations.
//!
//! A [`Promise`] couples a computation with a write-once outcome slot and a
//! stack of waiting tasks. The executing thread claims the promise, runs
//! the computation and publishes the outcome; any number of threads block
//! in [`get`](Promise::get) until the promise settles; a canceller races
//! completion and may deliver an interrupt to the runner.
//!
//! ## State machine
//!
//! ```text
//! NEW → COMPLETING → NORMAL        (value produced)
//! NEW → COMPLETING → EXCEPTIONAL   (computation panicked)
//! NEW → CANCELLED                  (cancel without interrupt)
//! NEW → INTERRUPTING → INTERRUPTED (cancel with interrupt)
//! ```
//!
//! Terminal states never change. The outcome is written between the CAS to
//! `COMPLETING` and the release store of the terminal state; readers
//! acquire-load the state before touching the outcome, so the two writes
//! publish it race-free.
//!
//! | Access | Ordering | Purpose |
//! |--------|----------|---------|
//! | state read before outcome read | `Acquire` | see the published outcome |
//! | terminal state write | `Release` | publish the outcome |
//! | waiter-stack head swap | `AcqRel` | linearise the broadcast |
//! | runner claim | `AcqRel` | unique runner per cycle |

mod waiters;

use std::any::Any;
use std::cell::UnsafeCell;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU8, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_utils::atomic::AtomicCell;
use parking_lot::Mutex;

use crate::error::JoinError;
use crate::task::{self, Task};
use waiters::Waiter;

const NEW: u8 = 0;
const COMPLETING: u8 = 1;
const NORMAL: u8 = 2;
const EXCEPTIONAL: u8 = 3;
const CANCELLED: u8 = 4;
const INTERRUPTING: u8 = 5;
const INTERRUPTED: u8 = 6;

type Job<T> = Box<dyn FnMut() -> T + Send>;
type DoneHook = Box<dyn FnOnce() + Send>;

/// A one-shot computation with a cancellable, waitable outcome.
///
/// Share it with `Arc`: one thread calls [`run`](Promise::run) (usually via
/// an [`Executor`](crate::executor::Executor)), any number of threads call
/// [`get`](Promise::get), and anyone may [`cancel`](Promise::cancel).
pub struct Promise<T> {
    state: AtomicU8,
    /// Runner claim; taken once per run cycle, reopened only by
    /// [`run_and_reset`](Promise::run_and_reset).
    claimed: AtomicBool,
    /// Touched only by the thread holding the claim.
    job: UnsafeCell<Option<Job<T>>>,
    /// Written once, between `COMPLETING` and the terminal state store.
    outcome: UnsafeCell<Option<Result<T, Arc<str>>>>,
    /// Executing task, for interrupt delivery; cleared once settled.
    runner: AtomicCell<Option<Arc<Task>>>,
    waiters: AtomicPtr<Waiter>,
    done_hook: Mutex<Option<DoneHook>>,
}

// Safety: `job` is only ever touched by the unique claim holder, so it only
// needs to move between threads (`Send`). `outcome` is written once by the
// completer and read by waiters after the release/acquire handshake on
// `state`; waiters clone through a shared reference, hence `T: Sync`.
impl<T> std::fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Promise")
            .field("state", &self.state.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

unsafe impl<T: Send> Send for Promise<T> {}
unsafe impl<T: Send + Sync> Sync for Promise<T> {}

impl<T> Promise<T> {
    /// Wraps a computation. `FnMut` rather than `FnOnce` so that
    /// [`run_and_reset`](Promise::run_and_reset) can execute it repeatedly.
    pub fn new<F>(job: F) -> Self
    where
        F: FnMut() -> T + Send + 'static,
    {
        Self {
            state: AtomicU8::new(NEW),
            claimed: AtomicBool::new(false),
            job: UnsafeCell::new(Some(Box::new(job))),
            outcome: UnsafeCell::new(None),
            runner: AtomicCell::new(None),
            waiters: AtomicPtr::new(ptr::null_mut()),
            done_hook: Mutex::new(None),
        }
    }

    /// Wraps a side-effecting job with a fixed success value.
    pub fn with_value<F>(mut job: F, value: T) -> Self
    where
        F: FnMut() + Send + 'static,
        T: Clone + Send + 'static,
    {
        Self::new(move || {
            job();
            value.clone()
        })
    }

    /// Installs a completion callback, fired exactly once from the
    /// broadcast path of the terminal transition.
    pub fn on_done<F>(self, hook: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        *self.done_hook.lock() = Some(Box::new(hook));
        self
    }

    /// Executes the computation, unless already claimed, settled or reset
    /// mid-flight. Idempotent: losers of the claim return immediately.
    pub fn run(&self) {
        if self.state.load(Ordering::Acquire) != NEW || !self.claim() {
            return;
        }
        self.runner.store(Some(Task::current()));
        // recheck: a cancel may have landed between the claim and here
        if self.state.load(Ordering::Acquire) == NEW {
            // Safety: the claim makes this thread the only `job` accessor.
            let job = unsafe { &mut *self.job.get() };
            // the job is consumed either way; a settled promise never reruns
            if let Some(mut f) = job.take() {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| f()));
                match outcome {
                    Ok(value) => self.set(value),
                    Err(payload) => self.set_failure(render_panic(payload)),
                }
            }
        }
        self.finish_run();
    }

    /// Executes without publishing a result; returns whether the
    /// computation ran to completion with the promise still fresh (no
    /// cancel intervened). Lets inherently periodic jobs reuse one promise.
    pub fn run_and_reset(&self) -> bool {
        if self.state.load(Ordering::Acquire) != NEW || !self.claim() {
            return false;
        }
        self.runner.store(Some(Task::current()));
        let mut ran = false;
        if self.state.load(Ordering::Acquire) == NEW {
            // Safety: the claim makes this thread the only `job` accessor.
            let job = unsafe { &mut *self.job.get() };
            if let Some(mut f) = job.take() {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| f()));
                match outcome {
                    Ok(_) => {
                        // keep the job for the next cycle
                        *job = Some(f);
                        ran = true;
                    }
                    Err(payload) => self.set_failure(render_panic(payload)),
                }
            }
        }
        let state = self.finish_run();
        if state == NEW {
            // reopen the claim for the next cycle
            self.claimed.store(false, Ordering::Release);
        }
        ran && state == NEW
    }

    /// Attempts to cancel. Succeeds only from `NEW`; with `interrupt` the
    /// runner (if any) is interrupted and the state settles through
    /// `INTERRUPTING → INTERRUPTED`. Returns whether this call cancelled.
    ///
    /// Cancelling frees no resources of the computation itself; a running
    /// job is expected to poll its task's interrupt flag.
    pub fn cancel(&self, interrupt: bool) -> bool {
        let target = if interrupt { INTERRUPTING } else { CANCELLED };
        if self
            .state
            .compare_exchange(NEW, target, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        if interrupt {
            if let Some(runner) = self.runner.take() {
                runner.interrupt();
            }
            self.state.store(INTERRUPTED, Ordering::Release);
        }
        self.finish_completion();
        true
    }

    /// Blocks until the promise settles and reports its outcome.
    pub fn get(&self) -> Result<T, JoinError>
    where
        T: Clone,
    {
        let state = self.await_done(None)?;
        self.report(state)
    }

    /// [`get`](Promise::get) with a deadline; `JoinError::TimedOut` if the
    /// promise has not settled in time.
    pub fn get_timeout(&self, timeout: Duration) -> Result<T, JoinError>
    where
        T: Clone,
    {
        let state = self.await_done(Some(Instant::now() + timeout))?;
        self.report(state)
    }

    /// Whether the promise has left `NEW` (including in-flight completion
    /// and cancellation).
    pub fn is_done(&self) -> bool {
        self.state.load(Ordering::Acquire) != NEW
    }

    /// Whether the promise was cancelled (with or without interrupt).
    pub fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::Acquire) >= CANCELLED
    }

    fn claim(&self) -> bool {
        self.claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Publishes a value: `NEW → COMPLETING → NORMAL`, outcome written
    /// between the two.
    fn set(&self, value: T) {
        if self
            .state
            .compare_exchange(NEW, COMPLETING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            // Safety: the COMPLETING claim makes this the only outcome
            // write, ever; no reader touches it before the release below.
            unsafe { *self.outcome.get() = Some(Ok(value)) };
            self.state.store(NORMAL, Ordering::Release);
            self.finish_completion();
        }
    }

    fn set_failure(&self, cause: Arc<str>) {
        if self
            .state
            .compare_exchange(NEW, COMPLETING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            // Safety: as in `set`.
            unsafe { *self.outcome.get() = Some(Err(cause)) };
            self.state.store(EXCEPTIONAL, Ordering::Release);
            self.finish_completion();
        }
    }

    /// Runner epilogue: clears the runner handle, then if a concurrent
    /// cancel is mid-interrupt, waits it out and absorbs the interrupt so
    /// it cannot leak into unrelated work. Returns the settled state.
    fn finish_run(&self) -> u8 {
        self.runner.take();
        let state = self.state.load(Ordering::Acquire);
        if state >= INTERRUPTING {
            while self.state.load(Ordering::Acquire) == INTERRUPTING {
                thread::yield_now();
            }
            Task::current().take_interrupt();
        }
        state
    }

    /// Broadcast to all waiters, then fire the done hook. Reached exactly
    /// once: only one terminal CAS out of `NEW` can succeed.
    fn finish_completion(&self) {
        waiters::wake_all(&self.waiters);
        if let Some(hook) = self.done_hook.lock().take() {
            hook();
        }
    }

    /// Waits for a state above `COMPLETING`, enrolling on the waiter stack
    /// once the fast checks fail. On interrupt or elapsed deadline the
    /// waiter unsplices itself; a deadline that loses the race to a
    /// terminal transition still reports the terminal state.
    fn await_done(&self, deadline: Option<Instant>) -> Result<u8, JoinError> {
        let current = Task::current();
        let mut node: Option<Arc<Waiter>> = None;
        let mut queued = false;
        loop {
            if current.take_interrupt() {
                if let Some(node) = &node {
                    waiters::unlink(&self.waiters, node);
                }
                return Err(JoinError::Interrupted);
            }
            let state = self.state.load(Ordering::Acquire);
            if state > COMPLETING {
                if let Some(node) = &node {
                    node.retire();
                }
                return Ok(state);
            }
            if state == COMPLETING {
                // outcome write in flight; settles imminently
                thread::yield_now();
                continue;
            }
            match &node {
                None => node = Some(Waiter::new(current.clone())),
                Some(n) if !queued => {
                    waiters::push(&self.waiters, n);
                    queued = true;
                }
                Some(n) => match deadline {
                    Some(d) => {
                        if Instant::now() >= d {
                            waiters::unlink(&self.waiters, n);
                            let state = self.state.load(Ordering::Acquire);
                            if state > COMPLETING {
                                return Ok(state);
                            }
                            return Err(JoinError::TimedOut);
                        }
                        task::park_until(d);
                    }
                    None => task::park(),
                },
            }
        }
    }

    fn report(&self, state: u8) -> Result<T, JoinError>
    where
        T: Clone,
    {
        match state {
            NORMAL | EXCEPTIONAL => {
                // Safety: a state ≥ NORMAL was acquire-loaded, so the
                // write-once outcome is published and never changes again.
                let outcome = unsafe { &*self.outcome.get() };
                match outcome {
                    Some(Ok(value)) => Ok(value.clone()),
                    Some(Err(cause)) => Err(JoinError::Failed(cause.clone())),
                    None => unreachable!("terminal state without outcome"),
                }
            }
            _ => Err(JoinError::Cancelled),
        }
    }
}

impl<T> Drop for Promise<T> {
    fn drop(&mut self) {
        // Normally empty (the broadcast detaches the chain); releasing the
        // head count is enough, node drops cascade down the links.
        let chain = *self.waiters.get_mut();
        if !chain.is_null() {
            // Safety: exclusive access; the head field owned this count.
            unsafe { drop(Arc::from_raw(chain.cast_const())) };
        }
    }
}

fn render_panic(payload: Box<dyn Any + Send>) -> Arc<str> {
    if let Some(s) = payload.downcast_ref::<&str>() {
        Arc::from(*s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        Arc::from(s.as_str())
    } else {
        Arc::from("computation panicked")
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    use super::*;

    /// run then get yields the computed value
    #[test]
    fn test_run_then_get() {
        let p = Promise::new(|| 41 + 1);
        p.run();
        assert_eq!(p.get(), Ok(42));
        assert!(p.is_done());
        assert!(!p.is_cancelled());
    }

    /// get blocks until another thread runs the promise; every waiter
    /// receives the value
    #[test]
    fn test_get_blocks_until_run() {
        let p = Arc::new(Promise::new(|| String::from("ok")));

        let getters: Vec<_> = (0..3)
            .map(|_| {
                let p = p.clone();
                thread::spawn(move || p.get())
            })
            .collect();

        thread::sleep(Duration::from_millis(20));
        p.run();

        for getter in getters {
            assert_eq!(getter.join().unwrap(), Ok(String::from("ok")));
        }
    }

    /// A panicking computation surfaces as Failed with the rendered cause,
    /// distinguishable from cancellation
    #[test]
    fn test_panic_becomes_failure() {
        let p = Promise::<i32>::new(|| panic!("boom"));
        p.run();
        match p.get() {
            Err(JoinError::Failed(cause)) => assert_eq!(&*cause, "boom"),
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    /// cancel before run wins; a later run is a no-op
    #[test]
    fn test_cancel_before_run() {
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = ran.clone();
        let p = Promise::new(move || ran2.fetch_add(1, Ordering::SeqCst));
        assert!(p.cancel(false));
        p.run();
        assert_eq!(p.get(), Err(JoinError::Cancelled));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert!(p.is_cancelled());
    }

    /// cancel on a settled promise returns false and changes nothing
    #[test]
    fn test_cancel_after_terminal_is_noop() {
        let p = Promise::new(|| 7);
        p.run();
        assert!(!p.cancel(true));
        assert!(!p.cancel(false));
        assert_eq!(p.get(), Ok(7));
    }

    /// cancel(true) interrupts the runner mid-computation; the state is
    /// terminal and stable afterwards
    #[test]
    fn test_cancel_interrupts_runner() {
        let (tx, rx) = mpsc::channel();
        let p = Arc::new(Promise::new(move || {
            tx.send(Task::current()).unwrap();
            let me = Task::current();
            let deadline = Instant::now() + Duration::from_secs(5);
            while !me.is_interrupted() && Instant::now() < deadline {
                thread::yield_now();
            }
            me.is_interrupted()
        }));

        let runner = {
            let p = p.clone();
            thread::spawn(move || p.run())
        };

        // wait until the job is live, then cancel with interrupt
        let runner_task = rx.recv().unwrap();
        assert!(p.cancel(true));
        runner.join().unwrap();

        assert_eq!(p.get(), Err(JoinError::Cancelled));
        assert!(p.is_cancelled());
        // the epilogue absorbed the cancellation interrupt
        assert!(!runner_task.is_interrupted());
    }

    /// run_and_reset executes repeatedly without settling; cancel ends the
    /// cycle
    #[test]
    fn test_run_and_reset_is_periodic() {
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        let p = Promise::new(move || {
            hits2.fetch_add(1, Ordering::SeqCst);
        });

        assert!(p.run_and_reset());
        assert!(p.run_and_reset());
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert!(!p.is_done());

        assert!(p.cancel(false));
        assert!(!p.run_and_reset());
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    /// cancel(true) reaches a job that is mid-flight via run_and_reset:
    /// the runner observes its interrupt and the cycle ends cancelled
    #[test]
    fn test_cancel_interrupts_run_and_reset() {
        let (tx, rx) = mpsc::channel();
        let p = Arc::new(Promise::new(move || {
            tx.send(Task::current()).unwrap();
            let me = Task::current();
            let deadline = Instant::now() + Duration::from_secs(5);
            while !me.is_interrupted() && Instant::now() < deadline {
                thread::yield_now();
            }
        }));

        let runner = {
            let p = p.clone();
            thread::spawn(move || p.run_and_reset())
        };

        // wait until the job is live, then cancel with interrupt
        let runner_task = rx.recv().unwrap();
        assert!(p.cancel(true));
        assert!(!runner.join().unwrap());
        assert!(p.is_cancelled());
        // the epilogue absorbed the cancellation interrupt
        assert!(!runner_task.is_interrupted());
    }

    /// Timed get times out while the computation is slow, then a plain get
    /// sees the eventual value
    #[test]
    fn test_timed_get_then_value() {
        let p = Arc::new(Promise::new(|| {
            thread::sleep(Duration::from_millis(100));
            5
        }));

        let waiters: Vec<_> = (0..2)
            .map(|_| {
                let p = p.clone();
                thread::spawn(move || p.get_timeout(Duration::from_millis(10)))
            })
            .collect();
        for w in waiters {
            assert_eq!(w.join().unwrap(), Err(JoinError::TimedOut));
        }

        let runner = {
            let p = p.clone();
            thread::spawn(move || p.run())
        };
        assert_eq!(p.get(), Ok(5));
        runner.join().unwrap();
    }

    /// A zero timeout on an unsettled promise reports TimedOut at once
    #[test]
    fn test_zero_timeout() {
        let p = Promise::new(|| 1);
        assert_eq!(p.get_timeout(Duration::ZERO), Err(JoinError::TimedOut));
    }

    /// Interrupting a blocked getter surfaces Interrupted and consumes the
    /// flag
    #[test]
    fn test_interrupt_getter() {
        let p = Arc::new(Promise::new(|| 1));
        let (tx, rx) = mpsc::channel();

        let getter = {
            let p = p.clone();
            thread::spawn(move || {
                tx.send(Task::current()).unwrap();
                p.get()
            })
        };

        let task = rx.recv().unwrap();
        thread::sleep(Duration::from_millis(10));
        task.interrupt();
        assert_eq!(getter.join().unwrap(), Err(JoinError::Interrupted));
    }

    /// The done hook fires exactly once, on whichever transition settles
    /// the promise
    #[test]
    fn test_done_hook_fires_once() {
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        let p = Promise::new(|| 3).on_done(move || {
            fired2.fetch_add(1, Ordering::SeqCst);
        });
        p.run();
        p.run();
        assert!(!p.cancel(false));
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        let p = Promise::new(|| 3).on_done(move || {
            fired2.fetch_add(1, Ordering::SeqCst);
        });
        assert!(p.cancel(true));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    /// Cancel racing completion: exactly one of value/cancellation wins and
    /// the outcome is stable
    #[test]
    fn test_cancel_races_completion() {
        for _ in 0..50 {
            let p = Arc::new(Promise::new(|| 9));
            let runner = {
                let p = p.clone();
                thread::spawn(move || p.run())
            };
            let won = p.cancel(true);
            runner.join().unwrap();

            let first = p.get();
            match (won, &first) {
                (true, Err(JoinError::Cancelled)) => {}
                (false, Ok(9)) => {}
                other => panic!("inconsistent race outcome: {other:?}"),
            }
            // terminal state never changes
            assert_eq!(p.get(), first);
        }
    }
}
