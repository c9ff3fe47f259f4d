use std::sync::Arc;

use thiserror::Error;

/// The calling task was interrupted while blocked.
///
/// Raised from any suspension point. The task's interrupt flag is consumed
/// exactly once when this is returned.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("interrupted while waiting")]
pub struct Interrupted;

/// Why [`Promise::get`](crate::future::Promise::get) did not produce a value.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum JoinError {
    /// The promise was cancelled before it completed.
    #[error("computation was cancelled")]
    Cancelled,
    /// The computation panicked; carries the rendered panic cause.
    #[error("computation failed: {0}")]
    Failed(Arc<str>),
    /// The deadline elapsed before the promise settled.
    #[error("timed out waiting for completion")]
    TimedOut,
    /// The waiting task was interrupted.
    #[error("interrupted while waiting for completion")]
    Interrupted,
}

impl From<Interrupted> for JoinError {
    fn from(_: Interrupted) -> Self {
        JoinError::Interrupted
    }
}

/// Timed insertion failed; the element is handed back to the caller.
#[derive(Debug, Error)]
pub enum OfferError<T> {
    /// The deadline elapsed with the queue still full.
    #[error("queue is full")]
    Full(T),
    /// The waiting task was interrupted.
    #[error("interrupted while waiting for queue capacity")]
    Interrupted(T),
}

impl<T> OfferError<T> {
    /// Recovers the element that could not be inserted.
    pub fn into_inner(self) -> T {
        match self {
            OfferError::Full(item) | OfferError::Interrupted(item) => item,
        }
    }
}

/// A rendezvous send failed; the element is handed back to the caller.
#[derive(Debug, Error)]
pub enum SendError<T> {
    /// The deadline elapsed without a receiver arriving.
    #[error("timed out waiting for a receiver")]
    TimedOut(T),
    /// The waiting task was interrupted.
    #[error("interrupted while waiting for a receiver")]
    Interrupted(T),
}

impl<T> SendError<T> {
    /// Recovers the element that was never handed off.
    pub fn into_inner(self) -> T {
        match self {
            SendError::TimedOut(item) | SendError::Interrupted(item) => item,
        }
    }
}

/// The executor refused to run the submitted task.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("executor rejected the task")]
pub struct Rejected;

/// Initial elements did not fit when pre-populating a bounded queue.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("initial elements exceed queue capacity")]
pub struct CapacityExceeded;

/// Why [`invoke_any`](crate::executor::invoke_any) produced no value.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InvokeError {
    /// No tasks were supplied.
    #[error("no tasks were supplied")]
    Empty,
    /// The executor refused a submission.
    #[error(transparent)]
    Rejected(#[from] Rejected),
    /// Every task failed; carries the last observed cause.
    #[error("all tasks failed: {0}")]
    Failed(Arc<str>),
    /// The deadline elapsed before any task succeeded.
    #[error("timed out before any task completed")]
    TimedOut,
    /// The calling task was interrupted.
    #[error("interrupted while waiting for a result")]
    Interrupted,
}

impl From<Interrupted> for InvokeError {
    fn from(_: Interrupted) -> Self {
        InvokeError::Interrupted
    }
}
