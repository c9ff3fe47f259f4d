//! Executor surface and promise orchestration.
//!
//! The crate does not ship a scheduler; it consumes one through the
//! one-method [`Executor`] trait and layers the submission helpers on top:
//! [`submit`] wraps a computation in a [`Promise`] and dispatches its run,
//! [`invoke_all`] joins a whole batch, and [`invoke_any`] works through a
//! batch one job at a time until something succeeds — completions flow
//! back through a [`BoundedQueue`] fed by each job's epilogue, so the
//! caller never polls promises individually.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::bounded::BoundedQueue;
use crate::error::{InvokeError, JoinError, Rejected};
use crate::future::Promise;

/// A unit of work handed to an executor.
pub type Job = Box<dyn FnOnce() + Send>;

/// An opaque dispatcher: runs the job some time in the future, on any
/// thread. Submission helpers treat a refusal as [`Rejected`].
pub trait Executor {
    fn execute(&self, job: Job) -> Result<(), Rejected>;
}

/// Wraps `f` in a promise and dispatches its run.
///
/// The promise is constructed before dispatch, so a handle exists (and can
/// be cancelled) even while the job is still queued.
pub fn submit<E, F, T>(executor: &E, f: F) -> Result<Arc<Promise<T>>, Rejected>
where
    E: Executor + ?Sized,
    F: FnMut() -> T + Send + 'static,
    T: Send + Sync + 'static,
{
    let promise = Arc::new(Promise::new(f));
    let runner = promise.clone();
    executor.execute(Box::new(move || runner.run()))?;
    Ok(promise)
}

/// [`submit`] for a side-effecting job with a fixed success value.
pub fn submit_with_value<E, F, T>(executor: &E, f: F, value: T) -> Result<Arc<Promise<T>>, Rejected>
where
    E: Executor + ?Sized,
    F: FnMut() + Send + 'static,
    T: Clone + Send + Sync + 'static,
{
    let promise = Arc::new(Promise::with_value(f, value));
    let runner = promise.clone();
    executor.execute(Box::new(move || runner.run()))?;
    Ok(promise)
}

/// Runs every job and collects every outcome, in input order. Sibling
/// failures never abort the batch; only caller interruption does, which
/// cancels whatever is still running.
pub fn invoke_all<E, F, T>(executor: &E, jobs: Vec<F>) -> Result<Vec<Result<T, JoinError>>, InvokeError>
where
    E: Executor + ?Sized,
    F: FnMut() -> T + Send + 'static,
    T: Clone + Send + Sync + 'static,
{
    let promises = submit_all(executor, jobs)?;
    let mut results = Vec::with_capacity(promises.len());
    for (index, promise) in promises.iter().enumerate() {
        match promise.get() {
            Err(JoinError::Interrupted) => {
                cancel_rest(&promises[index..]);
                return Err(InvokeError::Interrupted);
            }
            outcome => results.push(outcome),
        }
    }
    Ok(results)
}

/// [`invoke_all`] under a global deadline, applied to each remaining join;
/// a promise that misses it is cancelled and reported timed out.
pub fn invoke_all_timeout<E, F, T>(
    executor: &E,
    jobs: Vec<F>,
    timeout: Duration,
) -> Result<Vec<Result<T, JoinError>>, InvokeError>
where
    E: Executor + ?Sized,
    F: FnMut() -> T + Send + 'static,
    T: Clone + Send + Sync + 'static,
{
    let deadline = Instant::now() + timeout;
    let promises = submit_all(executor, jobs)?;
    let mut results = Vec::with_capacity(promises.len());
    let mut expired = false;
    for (index, promise) in promises.iter().enumerate() {
        if expired {
            promise.cancel(true);
            results.push(Err(JoinError::TimedOut));
            continue;
        }
        let remaining = deadline
            .checked_duration_since(Instant::now())
            .unwrap_or(Duration::ZERO);
        match promise.get_timeout(remaining) {
            Err(JoinError::Interrupted) => {
                cancel_rest(&promises[index..]);
                return Err(InvokeError::Interrupted);
            }
            Err(JoinError::TimedOut) => {
                promise.cancel(true);
                expired = true;
                results.push(Err(JoinError::TimedOut));
            }
            outcome => results.push(outcome),
        }
    }
    Ok(results)
}

/// Returns the first success among the jobs, cancelling whatever is still
/// in flight. Submission is staged: one job up front, the next dispatched
/// only after an observed failure, so a winner leaves the jobs behind it
/// untouched. If every job fails, the last observed failure propagates.
pub fn invoke_any<E, F, T>(executor: &E, jobs: Vec<F>) -> Result<T, InvokeError>
where
    E: Executor + ?Sized,
    F: FnMut() -> T + Send + 'static,
    T: Clone + Send + Sync + 'static,
{
    invoke_any_inner(executor, jobs, None)
}

/// [`invoke_any`] under a global deadline.
pub fn invoke_any_timeout<E, F, T>(
    executor: &E,
    jobs: Vec<F>,
    timeout: Duration,
) -> Result<T, InvokeError>
where
    E: Executor + ?Sized,
    F: FnMut() -> T + Send + 'static,
    T: Clone + Send + Sync + 'static,
{
    invoke_any_inner(executor, jobs, Some(Instant::now() + timeout))
}

fn invoke_any_inner<E, F, T>(
    executor: &E,
    jobs: Vec<F>,
    deadline: Option<Instant>,
) -> Result<T, InvokeError>
where
    E: Executor + ?Sized,
    F: FnMut() -> T + Send + 'static,
    T: Clone + Send + Sync + 'static,
{
    let total = jobs.len();
    if total == 0 {
        return Err(InvokeError::Empty);
    }

    // Completions land here from each job's epilogue; capacity `total`
    // means the offer below can never fail.
    let completed: Arc<BoundedQueue<Arc<Promise<T>>>> = Arc::new(BoundedQueue::new(total));
    let mut promises: Vec<Arc<Promise<T>>> = Vec::with_capacity(total);
    let mut jobs = jobs.into_iter();

    // Staged submission: one job up front, one more only after an observed
    // non-success completion. A job that wins outright means the rest are
    // never dispatched at all.
    let mut submit_next = |promises: &mut Vec<Arc<Promise<T>>>| -> Result<bool, Rejected> {
        let Some(f) = jobs.next() else {
            return Ok(false);
        };
        let promise = Arc::new(Promise::new(f));
        let runner = promise.clone();
        let queue = completed.clone();
        let finished = promise.clone();
        executor.execute(Box::new(move || {
            runner.run();
            let _ = queue.offer(finished);
        }))?;
        promises.push(promise);
        Ok(true)
    };

    let outcome = 'race: {
        if let Err(rejected) = submit_next(&mut promises) {
            break 'race Err(InvokeError::Rejected(rejected));
        }
        loop {
            // exactly one job is in flight: wait for it to report
            let finished = match deadline {
                Some(d) => {
                    let remaining = d
                        .checked_duration_since(Instant::now())
                        .unwrap_or(Duration::ZERO);
                    match completed.poll_timeout(remaining) {
                        Ok(Some(f)) => f,
                        Ok(None) => break 'race Err(InvokeError::TimedOut),
                        Err(_) => break 'race Err(InvokeError::Interrupted),
                    }
                }
                None => match completed.take() {
                    Ok(f) => f,
                    Err(_) => break 'race Err(InvokeError::Interrupted),
                },
            };
            let failure = match finished.get() {
                Ok(value) => break 'race Ok(value),
                Err(failure) => failure,
            };
            // a failure buys the next contender its dispatch
            match submit_next(&mut promises) {
                Ok(true) => {}
                // out of jobs with nothing in flight: every job failed and
                // the last observed failure propagates
                Ok(false) => break 'race Err(to_invoke_failure(failure)),
                Err(rejected) => break 'race Err(InvokeError::Rejected(rejected)),
            }
        }
    };

    // winner, timeout and interrupt alike: nothing still running survives
    cancel_rest(&promises);
    outcome
}

fn submit_all<E, F, T>(executor: &E, jobs: Vec<F>) -> Result<Vec<Arc<Promise<T>>>, InvokeError>
where
    E: Executor + ?Sized,
    F: FnMut() -> T + Send + 'static,
    T: Send + Sync + 'static,
{
    let mut promises = Vec::with_capacity(jobs.len());
    for f in jobs {
        match submit(executor, f) {
            Ok(promise) => promises.push(promise),
            Err(rejected) => {
                // a refused batch leaves no stragglers behind
                cancel_rest(&promises);
                return Err(InvokeError::Rejected(rejected));
            }
        }
    }
    Ok(promises)
}

fn cancel_rest<T>(promises: &[Arc<Promise<T>>]) {
    for promise in promises {
        promise.cancel(true);
    }
}

fn to_invoke_failure(failure: JoinError) -> InvokeError {
    match failure {
        JoinError::Failed(cause) => InvokeError::Failed(cause),
        JoinError::Cancelled => InvokeError::Failed(Arc::from("task was cancelled")),
        JoinError::TimedOut => InvokeError::TimedOut,
        JoinError::Interrupted => InvokeError::Interrupted,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::thread;

    use super::*;
    use crate::task::Task;

    /// One detached thread per job; the executor the scenarios run on.
    struct Spawner;

    impl Executor for Spawner {
        fn execute(&self, job: Job) -> Result<(), Rejected> {
            thread::Builder::new()
                .spawn(job)
                .map(|_| ())
                .map_err(|_| Rejected)
        }
    }

    struct RejectAll;

    impl Executor for RejectAll {
        fn execute(&self, _job: Job) -> Result<(), Rejected> {
            Err(Rejected)
        }
    }

    /// submit dispatches the run and the handle observes the value
    #[test]
    fn test_submit() {
        let promise = submit(&Spawner, || 6 * 7).unwrap();
        assert_eq!(promise.get(), Ok(42));
    }

    /// submit_with_value resolves to the fixed value after the job ran
    #[test]
    fn test_submit_with_value() {
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        let promise = submit_with_value(
            &Spawner,
            move || {
                hits2.fetch_add(1, Ordering::SeqCst);
            },
            "done",
        )
        .unwrap();
        assert_eq!(promise.get(), Ok("done"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    /// A rejected submission surfaces as Rejected
    #[test]
    fn test_rejected() {
        assert_eq!(submit(&RejectAll, || 1).unwrap_err(), Rejected);
        assert_eq!(
            invoke_all(&RejectAll, vec![|| 1]).unwrap_err(),
            InvokeError::Rejected(Rejected)
        );
        assert_eq!(
            invoke_any(&RejectAll, vec![|| 1]).unwrap_err(),
            InvokeError::Rejected(Rejected)
        );
    }

    /// invoke_all yields exactly N results whose values form 0..N
    #[test]
    fn test_invoke_all_round_trip() {
        const N: usize = 8;
        let jobs: Vec<_> = (0..N).map(|i| move || i).collect();
        let results = invoke_all(&Spawner, jobs).unwrap();
        assert_eq!(results.len(), N);
        let mut values: Vec<usize> = results.into_iter().map(|r| r.unwrap()).collect();
        values.sort_unstable();
        assert_eq!(values, (0..N).collect::<Vec<_>>());
    }

    /// A failing sibling does not abort the rest of invoke_all
    #[test]
    fn test_invoke_all_collects_failures() {
        let jobs: Vec<Box<dyn FnMut() -> i32 + Send>> = vec![
            Box::new(|| 1),
            Box::new(|| panic!("job two failed")),
            Box::new(|| 3),
        ];
        let results = invoke_all(&Spawner, jobs).unwrap();
        assert_eq!(results[0], Ok(1));
        match &results[1] {
            Err(JoinError::Failed(cause)) => assert_eq!(&**cause, "job two failed"),
            other => panic!("expected Failed, got {other:?}"),
        }
        assert_eq!(results[2], Ok(3));
    }

    /// invoke_all under a deadline: the fast job finishes, the slow one is
    /// cancelled and reported timed out
    #[test]
    fn test_invoke_all_timeout() {
        let jobs: Vec<Box<dyn FnMut() -> i32 + Send>> = vec![
            Box::new(|| 1),
            Box::new(|| {
                let me = Task::current();
                let start = Instant::now();
                while !me.is_interrupted() && start.elapsed() < Duration::from_secs(5) {
                    thread::yield_now();
                }
                2
            }),
        ];
        let start = Instant::now();
        let results = invoke_all_timeout(&Spawner, jobs, Duration::from_millis(50)).unwrap();
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(results[0], Ok(1));
        assert_eq!(results[1], Err(JoinError::TimedOut));
    }

    /// invoke_any returns the first success; a failure dispatches the next
    /// contender, while jobs behind the winner are never dispatched at all
    #[test]
    fn test_invoke_any_staged_submission() {
        let dispatched = Arc::new(AtomicUsize::new(0));
        let dispatched2 = dispatched.clone();
        let jobs: Vec<Box<dyn FnMut() -> &'static str + Send>> = vec![
            Box::new(|| panic!("opener fails")),
            Box::new(|| {
                thread::sleep(Duration::from_millis(5));
                "A"
            }),
            Box::new(move || {
                dispatched2.fetch_add(1, Ordering::SeqCst);
                "B"
            }),
        ];

        let start = Instant::now();
        assert_eq!(invoke_any(&Spawner, jobs), Ok("A"));
        assert!(start.elapsed() < Duration::from_secs(5));

        // "A" won, so the third job never earned its dispatch
        thread::sleep(Duration::from_millis(50));
        assert_eq!(dispatched.load(Ordering::SeqCst), 0);
    }

    /// When every job fails, the last observed cause propagates
    #[test]
    fn test_invoke_any_all_fail() {
        let jobs: Vec<Box<dyn FnMut() -> i32 + Send>> = vec![
            Box::new(|| panic!("first")),
            Box::new(|| panic!("second")),
        ];
        // submissions are sequential, so the last cause is deterministic
        match invoke_any(&Spawner, jobs) {
            Err(InvokeError::Failed(cause)) => assert_eq!(&*cause, "second"),
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    /// An empty job set is a caller error
    #[test]
    fn test_invoke_any_empty() {
        let jobs: Vec<fn() -> i32> = Vec::new();
        assert_eq!(invoke_any(&Spawner, jobs), Err(InvokeError::Empty));
    }

    /// invoke_any under a deadline nobody meets reports TimedOut; the
    /// in-flight straggler is cancelled and observes its interrupt well
    /// before finishing on its own
    #[test]
    fn test_invoke_any_timeout() {
        let (tx, rx) = mpsc::channel();
        let jobs: Vec<Box<dyn FnMut() -> i32 + Send>> = vec![
            Box::new(move || {
                let me = Task::current();
                let start = Instant::now();
                while !me.is_interrupted() && start.elapsed() < Duration::from_secs(5) {
                    thread::yield_now();
                }
                tx.send(me.is_interrupted()).unwrap();
                0
            }),
            // queued behind the straggler; never dispatched
            Box::new(|| 1),
        ];
        let start = Instant::now();
        assert_eq!(
            invoke_any_timeout(&Spawner, jobs, Duration::from_millis(40)),
            Err(InvokeError::TimedOut)
        );
        assert!(start.elapsed() < Duration::from_secs(5));

        let interrupted = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(interrupted);
    }
}
