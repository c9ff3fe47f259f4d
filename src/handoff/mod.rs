//! Zero-capacity synchronous rendezvous channel.
//!
//! A [`SyncChannel`] holds no buffer: every producer blocks until a
//! consumer arrives and vice versa; the hand-off publish and receive are
//! linearised at a single CAS. Two transfer algorithms implement the same
//! contract, selected at construction:
//!
//! - **unfair** (default): a LIFO *dual stack* — waiters and fulfillers
//!   share one Treiber stack; the most recent waiter is matched first.
//!   Better locality and throughput, no ordering guarantee.
//! - **fair**: a FIFO *dual queue* — waiters line up behind a dummy head
//!   and are matched in arrival order, per role and across roles.
//!
//! Both structures are *dual*: a node is either a request or data, and a
//! complementary arrival matches (pops/fulfils) instead of enqueueing.
//!
//! ## Waiting
//!
//! An arriving party spins briefly when its match is imminent (it sits at
//! the stack head, or is the queue's next-to-be-fulfilled), then registers
//! its task handle and parks. Spin counts follow the usual calibration: no
//! spinning on uniprocessors, fewer spins for timed waits, and timed waits
//! under a microsecond never park at all.
//!
//! ## Example
//!
//! ```
//! use std::thread;
//! use staffetta::handoff::SyncChannel;
//! use std::sync::Arc;
//!
//! let ch = Arc::new(SyncChannel::new(true));
//! let ch2 = ch.clone();
//! let consumer = thread::spawn(move || ch2.take().unwrap());
//!
//! ch.put(42).unwrap();          // blocks until the consumer takes
//! assert_eq!(consumer.join().unwrap(), 42);
//! ```

mod stack;
mod queue;

use std::time::{Duration, Instant};

use crate::error::{Interrupted, SendError};
use queue::TransferQueue;
use stack::TransferStack;

/// How long a transfer may block.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Wait {
    Forever,
    Until(Instant),
    Immediate,
}

impl Wait {
    /// Whether the permitted wait is already over.
    fn expired(&self) -> bool {
        match self {
            Wait::Forever => false,
            Wait::Until(deadline) => Instant::now() >= *deadline,
            Wait::Immediate => true,
        }
    }

    fn deadline(&self) -> Option<Instant> {
        match self {
            Wait::Forever => None,
            Wait::Until(deadline) => Some(*deadline),
            // an Immediate transfer never reaches the waiting phase
            Wait::Immediate => Some(Instant::now()),
        }
    }

    fn is_timed(&self) -> bool {
        !matches!(self, Wait::Forever)
    }
}

/// A transfer that found no counterpart; hands a producer's item back.
pub(crate) struct Unmatched<T> {
    pub(crate) item: Option<T>,
    pub(crate) interrupted: bool,
}

/// Spin calibration, resolved once per channel.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SpinPolicy {
    /// Spins before a timed park; 0 on uniprocessors.
    max_timed_spins: u32,
    /// Spins before an untimed park.
    max_untimed_spins: u32,
}

impl SpinPolicy {
    fn new() -> Self {
        let max_timed_spins = if num_cpus::get() < 2 { 0 } else { 32 };
        Self {
            max_timed_spins,
            max_untimed_spins: max_timed_spins * 16,
        }
    }

    fn budget(&self, timed: bool) -> u32 {
        if timed {
            self.max_timed_spins
        } else {
            self.max_untimed_spins
        }
    }
}

enum Algo<T> {
    Unfair(TransferStack<T>),
    Fair(TransferQueue<T>),
}

/// A rendezvous point: zero capacity, every transfer pairs one producer
/// with one consumer.
pub struct SyncChannel<T> {
    algo: Algo<T>,
}

impl<T> SyncChannel<T> {
    /// Creates a channel; `fair` selects FIFO matching (dual queue) over
    /// the default LIFO (dual stack).
    pub fn new(fair: bool) -> Self {
        let spin = SpinPolicy::new();
        Self {
            algo: if fair {
                Algo::Fair(TransferQueue::new(spin))
            } else {
                Algo::Unfair(TransferStack::new(spin))
            },
        }
    }

    fn transfer(&self, item: Option<T>, wait: Wait) -> Result<Option<T>, Unmatched<T>> {
        match &self.algo {
            Algo::Unfair(stack) => stack.transfer(item, wait),
            Algo::Fair(queue) => queue.transfer(item, wait),
        }
    }

    /// Hands `item` to a consumer, blocking until one arrives.
    pub fn put(&self, item: T) -> Result<(), SendError<T>> {
        self.send(item, Wait::Forever)
    }

    /// Hands `item` to a consumer only if one is already waiting.
    pub fn offer(&self, item: T) -> Result<(), T> {
        match self.transfer(Some(item), Wait::Immediate) {
            Ok(_) => Ok(()),
            Err(unmatched) => Err(recover(unmatched.item)),
        }
    }

    /// Hands `item` to a consumer, blocking up to `timeout` for one.
    pub fn offer_timeout(&self, item: T, timeout: Duration) -> Result<(), SendError<T>> {
        self.send(item, Wait::Until(Instant::now() + timeout))
    }

    /// Receives from a producer, blocking until one arrives.
    pub fn take(&self) -> Result<T, Interrupted> {
        match self.transfer(None, Wait::Forever) {
            Ok(received) => Ok(recover(received)),
            // an untimed consumer only fails by interruption
            Err(_) => Err(Interrupted),
        }
    }

    /// Receives only if a producer is already waiting.
    pub fn poll(&self) -> Option<T> {
        self.transfer(None, Wait::Immediate).ok().map(recover)
    }

    /// Receives, blocking up to `timeout` for a producer. `Ok(None)` means
    /// the deadline elapsed with nobody there.
    pub fn poll_timeout(&self, timeout: Duration) -> Result<Option<T>, Interrupted> {
        match self.transfer(None, Wait::Until(Instant::now() + timeout)) {
            Ok(received) => Ok(Some(recover(received))),
            Err(unmatched) if unmatched.interrupted => Err(Interrupted),
            Err(_) => Ok(None),
        }
    }

    /// Always `true`: a rendezvous holds nothing between transfers.
    pub fn is_empty(&self) -> bool {
        true
    }

    /// Always zero.
    pub fn len(&self) -> usize {
        0
    }

    /// Always zero.
    pub fn capacity(&self) -> usize {
        0
    }

    /// Always `None`: there is never a buffered element to inspect.
    pub fn peek(&self) -> Option<T> {
        None
    }

    fn send(&self, item: T, wait: Wait) -> Result<(), SendError<T>> {
        match self.transfer(Some(item), wait) {
            Ok(_) => Ok(()),
            Err(Unmatched {
                item,
                interrupted: true,
            }) => Err(SendError::Interrupted(recover(item))),
            Err(Unmatched { item, .. }) => Err(SendError::TimedOut(recover(item))),
        }
    }
}

impl<T> Default for SyncChannel<T> {
    fn default() -> Self {
        Self::new(false)
    }
}

/// A producer's failed transfer always carries its item back, and a
/// consumer's successful transfer always carries one; reaching the `None`
/// arm would be a protocol bug in the transferer.
fn recover<T>(item: Option<T>) -> T {
    match item {
        Some(item) => item,
        None => unreachable!("transfer violated its item-ownership contract"),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::sync::mpsc;
    use std::thread;
    use std::time::{Duration, Instant};

    use super::*;
    use crate::task::Task;

    fn both() -> [Arc<SyncChannel<u64>>; 2] {
        [
            Arc::new(SyncChannel::new(false)),
            Arc::new(SyncChannel::new(true)),
        ]
    }

    /// Handoff rendezvous: a parked consumer receives the producer's item
    /// and both sides return promptly
    #[test]
    fn test_rendezvous() {
        for ch in both() {
            let ch2 = ch.clone();
            let consumer = thread::spawn(move || ch2.take().unwrap());

            thread::sleep(Duration::from_millis(10));
            let start = Instant::now();
            ch.put(42).unwrap();
            assert_eq!(consumer.join().unwrap(), 42);
            assert!(start.elapsed() < Duration::from_secs(1));
        }
    }

    /// The reverse direction: a parked producer is drained by a consumer
    #[test]
    fn test_rendezvous_producer_first() {
        for ch in both() {
            let ch2 = ch.clone();
            let producer = thread::spawn(move || ch2.put(7));

            thread::sleep(Duration::from_millis(10));
            assert_eq!(ch.take().unwrap(), 7);
            producer.join().unwrap().unwrap();
        }
    }

    /// poll and offer without a counterpart return empty immediately
    #[test]
    fn test_immediate_without_counterpart() {
        for ch in both() {
            assert_eq!(ch.poll(), None);
            assert_eq!(ch.offer(1), Err(1));
            assert_eq!(ch.poll(), None);
        }
    }

    /// offer succeeds when a consumer is already parked
    #[test]
    fn test_offer_with_waiting_consumer() {
        for ch in both() {
            let ch2 = ch.clone();
            let consumer = thread::spawn(move || ch2.take().unwrap());
            thread::sleep(Duration::from_millis(20));

            // the consumer is parked by now; the offer must pair with it
            let mut item = 9;
            loop {
                match ch.offer(item) {
                    Ok(()) => break,
                    Err(back) => {
                        item = back;
                        thread::yield_now();
                    }
                }
            }
            assert_eq!(consumer.join().unwrap(), 9);
        }
    }

    /// Timed operations report timeout no earlier than the deadline and
    /// hand a producer's item back untouched
    #[test]
    fn test_timeouts() {
        for ch in both() {
            let deadline = Instant::now() + Duration::from_millis(20);
            match ch.offer_timeout(5, Duration::from_millis(20)) {
                Err(SendError::TimedOut(5)) => {}
                other => panic!("expected TimedOut(5), got {other:?}"),
            }
            assert!(Instant::now() >= deadline);

            assert_eq!(ch.poll_timeout(Duration::from_millis(10)), Ok(None));

            // the timed-out item never became visible to a later consumer
            assert_eq!(ch.poll(), None);
        }
    }

    /// An interrupt during a pending rendezvous cancels the waiter's node
    /// and surfaces as the interrupt error
    #[test]
    fn test_interrupt_pending_producer() {
        for ch in both() {
            let (tx, rx) = mpsc::channel();
            let ch2 = ch.clone();
            let producer = thread::spawn(move || {
                tx.send(Task::current()).unwrap();
                ch2.put(3)
            });

            let task = rx.recv().unwrap();
            thread::sleep(Duration::from_millis(20));
            task.interrupt();
            match producer.join().unwrap() {
                Err(SendError::Interrupted(3)) => {}
                other => panic!("expected Interrupted(3), got {other:?}"),
            }
            // the cancelled node never matches
            assert_eq!(ch.poll(), None);
        }
    }

    /// An interrupted consumer reports Interrupted and consumes the flag
    #[test]
    fn test_interrupt_pending_consumer() {
        for ch in both() {
            let (tx, rx) = mpsc::channel();
            let ch2 = ch.clone();
            let consumer = thread::spawn(move || {
                tx.send(Task::current()).unwrap();
                let out = ch2.take();
                (out, Task::current().is_interrupted())
            });

            let task = rx.recv().unwrap();
            thread::sleep(Duration::from_millis(20));
            task.interrupt();
            let (out, flag) = consumer.join().unwrap();
            assert_eq!(out, Err(Interrupted));
            assert!(!flag);
        }
    }

    /// Observers are fixed: a rendezvous never holds anything
    #[test]
    fn test_observers_are_fixed() {
        for ch in both() {
            assert!(ch.is_empty());
            assert_eq!(ch.len(), 0);
            assert_eq!(ch.capacity(), 0);
            assert_eq!(ch.peek(), None);
        }
    }

    /// Ping-pong alternation through one channel
    #[test]
    fn test_ping_pong() {
        for ch in both() {
            let ch2 = ch.clone();
            let echo = thread::spawn(move || {
                for _ in 0..100 {
                    let v = ch2.take().unwrap();
                    ch2.put(v + 1).unwrap();
                }
            });
            for i in 0..100 {
                ch.put(i * 2).unwrap();
                assert_eq!(ch.take().unwrap(), i * 2 + 1);
            }
            echo.join().unwrap();
        }
    }

    fn stress(fair: bool) -> (Vec<u64>, Vec<Vec<u64>>) {
        const PRODUCERS: u64 = 4;
        const PER_PRODUCER: u64 = 1000;
        let ch = Arc::new(SyncChannel::new(fair));

        let producers: Vec<_> = (0..PRODUCERS)
            .map(|p| {
                let ch = ch.clone();
                thread::spawn(move || {
                    for i in 0..PER_PRODUCER {
                        ch.put(p * 10_000 + i).unwrap();
                    }
                })
            })
            .collect();

        let consumers: Vec<_> = (0..PRODUCERS)
            .map(|_| {
                let ch = ch.clone();
                thread::spawn(move || {
                    (0..PER_PRODUCER)
                        .map(|_| ch.take().unwrap())
                        .collect::<Vec<u64>>()
                })
            })
            .collect();

        for p in producers {
            p.join().unwrap();
        }
        let per_consumer: Vec<Vec<u64>> = consumers
            .into_iter()
            .map(|c| c.join().unwrap())
            .collect();
        let mut all: Vec<u64> = per_consumer.iter().flatten().copied().collect();
        all.sort_unstable();
        (all, per_consumer)
    }

    /// Unfair stress: nothing lost, nothing duplicated
    #[test]
    fn test_stress_unfair() {
        let (all, _) = stress(false);
        let expected: Vec<u64> = (0..4u64)
            .flat_map(|p| (0..1000).map(move |i| p * 10_000 + i))
            .collect();
        assert_eq!(all, expected);
    }

    /// Fair stress: nothing lost or duplicated, and the slice of one
    /// producer's items any single consumer sees is in send order
    #[test]
    fn test_stress_fair() {
        let (all, per_consumer) = stress(true);
        let expected: Vec<u64> = (0..4u64)
            .flat_map(|p| (0..1000).map(move |i| p * 10_000 + i))
            .collect();
        assert_eq!(all, expected);

        for consumed in per_consumer {
            let mut last: HashMap<u64, u64> = HashMap::new();
            for value in consumed {
                let producer = value / 10_000;
                let seq = value % 10_000;
                if let Some(prev) = last.insert(producer, seq) {
                    assert!(prev < seq, "producer {producer} delivered out of order");
                }
            }
        }
    }
}
