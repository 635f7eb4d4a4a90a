//! Bounded single-producer/single-consumer row channel.
//!
//! The only flow-control mechanism between stage instances. A full channel blocks its
//! producer, an empty one blocks its consumer. Both ends are move-only so exactly one thread
//! owns each.
//!
//! Dropping the [`RowSender`] marks the stream done; dropping the [`RowReceiver`] cancels the
//! channel so the producer is never left blocked on a channel nobody reads.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use rowflow_common::{Result, RowflowError};

use crate::row::Row;

struct Shared {
    state: Mutex<State>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
}

#[derive(Default)]
struct State {
    queue: VecDeque<Row>,
    done: bool,
    cancelled: bool,
}

impl Shared {
    fn cancel(&self) {
        let mut state = self.state.lock();
        state.cancelled = true;
        state.queue.clear();
        drop(state);
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    fn set_done(&self) {
        let mut state = self.state.lock();
        state.done = true;
        drop(state);
        self.not_empty.notify_all();
    }

    fn len(&self) -> usize {
        self.state.lock().queue.len()
    }
}

/// Create a channel holding at most `capacity` rows (at least 1).
pub fn row_channel(capacity: usize) -> (RowSender, RowReceiver) {
    let shared = Arc::new(Shared {
        state: Mutex::new(State::default()),
        not_empty: Condvar::new(),
        not_full: Condvar::new(),
        capacity: capacity.max(1),
    });
    (
        RowSender {
            shared: Arc::clone(&shared),
        },
        RowReceiver { shared },
    )
}

/// Outcome of a non-blocking or bounded-wait read.
#[derive(Debug, Clone, PartialEq)]
pub enum TryRecv {
    /// Next row in FIFO order.
    Row(Row),
    /// Nothing buffered yet; the producer is still running.
    Pending,
    /// Producer done and buffer drained, or channel cancelled.
    Ended,
}

/// Producer half.
pub struct RowSender {
    shared: Arc<Shared>,
}

impl RowSender {
    /// Append `row`, blocking while the channel is full.
    ///
    /// Fails with [`RowflowError::Cancelled`] once the channel has been cancelled, including
    /// while blocked.
    pub fn put(&self, row: Row) -> Result<()> {
        let mut state = self.shared.state.lock();
        loop {
            if state.cancelled {
                return Err(RowflowError::Cancelled);
            }
            if state.queue.len() < self.shared.capacity {
                break;
            }
            self.shared.not_full.wait(&mut state);
        }
        state.queue.push_back(row);
        drop(state);
        self.shared.not_empty.notify_one();
        Ok(())
    }

    /// Mark the stream finished. Also happens on drop.
    pub fn set_done(&self) {
        self.shared.set_done();
    }

    pub fn len(&self) -> usize {
        self.shared.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.state.lock().cancelled
    }

    /// Handle that can cancel this channel from another thread.
    pub fn canceller(&self) -> ChannelCanceller {
        ChannelCanceller {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Drop for RowSender {
    fn drop(&mut self) {
        self.shared.set_done();
    }
}

impl fmt::Debug for RowSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RowSender")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .finish()
    }
}

/// Consumer half.
pub struct RowReceiver {
    shared: Arc<Shared>,
}

impl RowReceiver {
    /// Take the next row, blocking while the channel is empty.
    ///
    /// Returns `None` once the producer is done and every buffered row was taken, or as soon
    /// as the channel is cancelled.
    pub fn get(&self) -> Option<Row> {
        let mut state = self.shared.state.lock();
        loop {
            if state.cancelled {
                return None;
            }
            if let Some(row) = state.queue.pop_front() {
                drop(state);
                self.shared.not_full.notify_one();
                return Some(row);
            }
            if state.done {
                return None;
            }
            self.shared.not_empty.wait(&mut state);
        }
    }

    /// Take the next row if one is buffered, without blocking.
    pub fn try_get(&self) -> TryRecv {
        self.get_timeout(Duration::ZERO)
    }

    /// Like [`RowReceiver::get`], but give up with [`TryRecv::Pending`] after `wait`.
    pub fn get_timeout(&self, wait: Duration) -> TryRecv {
        let mut state = self.shared.state.lock();
        let mut waited = false;
        loop {
            if state.cancelled {
                return TryRecv::Ended;
            }
            if let Some(row) = state.queue.pop_front() {
                drop(state);
                self.shared.not_full.notify_one();
                return TryRecv::Row(row);
            }
            if state.done {
                return TryRecv::Ended;
            }
            if waited || wait.is_zero() {
                return TryRecv::Pending;
            }
            self.shared.not_empty.wait_for(&mut state, wait);
            waited = true;
        }
    }

    /// Cancel the channel, waking the producer. Also happens on drop.
    pub fn cancel(&self) {
        self.shared.cancel();
    }

    pub fn len(&self) -> usize {
        self.shared.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Handle that can cancel this channel from another thread.
    pub fn canceller(&self) -> ChannelCanceller {
        ChannelCanceller {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Drop for RowReceiver {
    fn drop(&mut self) {
        self.shared.cancel();
    }
}

impl fmt::Debug for RowReceiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RowReceiver")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .finish()
    }
}

/// Cloneable cancel handle held by the stop signal.
#[derive(Clone)]
pub struct ChannelCanceller {
    shared: Arc<Shared>,
}

impl ChannelCanceller {
    pub fn cancel(&self) {
        self.shared.cancel();
    }
}

impl fmt::Debug for ChannelCanceller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelCanceller").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Duration;

    use rowflow_common::RowflowError;

    use super::{TryRecv, row_channel};
    use crate::row::{Row, Value};

    fn row(v: i64) -> Row {
        Row::new(vec![Value::Integer(v)])
    }

    #[test]
    fn preserves_fifo_order_and_ends_after_done() {
        let (tx, rx) = row_channel(8);
        for i in 0..5 {
            tx.put(row(i)).expect("put");
        }
        drop(tx);
        let got = std::iter::from_fn(|| rx.get())
            .map(|r| r.values()[0].clone())
            .collect::<Vec<_>>();
        assert_eq!(got, (0..5).map(Value::Integer).collect::<Vec<_>>());
        assert_eq!(rx.get(), None);
    }

    #[test]
    fn second_put_blocks_until_first_get_with_capacity_one() {
        let (tx, rx) = row_channel(1);
        let second_done = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&second_done);
        let producer = thread::spawn(move || {
            tx.put(row(1)).expect("first put");
            tx.put(row(2)).expect("second put");
            flag.store(true, Ordering::SeqCst);
        });

        thread::sleep(Duration::from_millis(100));
        assert!(!second_done.load(Ordering::SeqCst));
        assert_eq!(rx.len(), 1);

        assert_eq!(rx.get(), Some(row(1)));
        producer.join().expect("producer thread");
        assert!(second_done.load(Ordering::SeqCst));
        assert!(rx.len() <= rx.capacity());
        assert_eq!(rx.get(), Some(row(2)));
        assert_eq!(rx.get(), None);
    }

    #[test]
    fn cancel_wakes_blocked_producer() {
        let (tx, rx) = row_channel(1);
        let canceller = rx.canceller();
        tx.put(row(1)).expect("fill");
        let producer = thread::spawn(move || tx.put(row(2)));
        thread::sleep(Duration::from_millis(50));
        canceller.cancel();
        let res = producer.join().expect("producer thread");
        assert!(matches!(res, Err(RowflowError::Cancelled)));
        assert_eq!(rx.get(), None);
    }

    #[test]
    fn dropping_receiver_cancels_producer() {
        let (tx, rx) = row_channel(4);
        drop(rx);
        assert!(tx.is_cancelled());
        assert!(matches!(tx.put(row(1)), Err(RowflowError::Cancelled)));
    }

    #[test]
    fn try_get_reports_pending_until_done() {
        let (tx, rx) = row_channel(2);
        assert_eq!(rx.try_get(), TryRecv::Pending);
        tx.put(row(7)).expect("put");
        assert_eq!(rx.try_get(), TryRecv::Row(row(7)));
        assert_eq!(
            rx.get_timeout(Duration::from_millis(5)),
            TryRecv::Pending
        );
        tx.set_done();
        assert_eq!(rx.try_get(), TryRecv::Ended);
    }
}
