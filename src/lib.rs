//! Concurrent handoff primitives
//!
//! Three cooperating subsystems whose correctness rides on fine-grained
//! atomic state machines rather than coarse locking:
//!
//! | Component | What it is | Blocking discipline |
//! |-----------|------------|---------------------|
//! | [`Promise`] | one-shot cancellable computation with broadcast completion | Treiber stack of parked waiters |
//! | [`BoundedQueue`] | bounded FIFO with independent head/tail locks | mutex + interruptible condition, cascading signals |
//! | [`SyncChannel`] | zero-capacity rendezvous, fair or unfair | lock-free dual stack / dual queue, spin-then-park |
//!
//! They share two leaves: the [`task`] module (per-thread identity, an
//! interrupt flag and the park/unpark primitive every blocking operation
//! suspends through) and an internal interruptible condition variable.
//! The [`executor`] module consumes promises through a one-method
//! dispatch trait and layers `submit` / `invoke_all` / `invoke_any`
//! orchestration on top.
//!
//! ## Interruption
//!
//! Every blocking operation observes [`Task::interrupt`]: the flag is set,
//! the task unparked, and the operation unlinks its waiter record and
//! reports a dedicated error, consuming the flag exactly once. Timeouts
//! are monotonic deadlines; timed operations recompute the remainder on
//! every wake-up.
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use std::thread;
//! use staffetta::{Promise, SyncChannel};
//!
//! // a rendezvous: the producer blocks until the consumer arrives
//! let ch = Arc::new(SyncChannel::new(true));
//! let ch2 = ch.clone();
//! let consumer = thread::spawn(move || ch2.take().unwrap());
//! ch.put("hello").unwrap();
//! assert_eq!(consumer.join().unwrap(), "hello");
//!
//! // a promise: run anywhere, observed everywhere
//! let p = Arc::new(Promise::new(|| 6 * 7));
//! let p2 = p.clone();
//! let runner = thread::spawn(move || p2.run());
//! assert_eq!(p.get(), Ok(42));
//! runner.join().unwrap();
//! ```

pub mod bounded;
mod condition;
pub mod error;
pub mod executor;
pub mod future;
pub mod handoff;
pub mod task;

pub use bounded::BoundedQueue;
pub use error::{
    CapacityExceeded, Interrupted, InvokeError, JoinError, OfferError, Rejected, SendError,
};
pub use executor::{
    Executor, Job, invoke_all, invoke_all_timeout, invoke_any, invoke_any_timeout, submit,
    submit_with_value,
};
pub use future::Promise;
pub use handoff::SyncChannel;
pub use task::Task;
