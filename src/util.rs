//! Small synchronization/sequencing primitives shared by the connection and
//! listener state machines.

use std::sync::{Arc, Condvar, Mutex};

use crate::error::IpcError;

/// A counter that cycles through `[start, limit)`, wrapping back to `start`
/// once it reaches `limit`.
///
/// The original implementation this is grounded on wraps to `limit` itself on
/// the first cycle (an off-by-one bug); this version wraps to `start`, so the
/// produced sequence never leaves `[start, limit)`.
#[derive(Debug)]
pub struct WrappedCounter {
    start: u32,
    limit: u32,
    current: u32,
}

impl WrappedCounter {
    /// Build a counter over `[start, limit)`. Panics if `start >= limit`.
    pub fn new(start: u32, limit: u32) -> Self {
        assert!(start < limit, "WrappedCounter requires start < limit");
        WrappedCounter {
            start,
            limit,
            current: start,
        }
    }

    /// Advance and return the next value in the cycle.
    pub fn next(&mut self) -> u32 {
        let value = self.current;
        self.current = if self.current + 1 >= self.limit {
            self.start
        } else {
            self.current + 1
        };
        value
    }
}

/// A single-producer/single-consumer oneshot slot: set once with either a
/// value or an error, any number of waiters block until it is set.
///
/// Grounded on the original `Result[T]` (a `trio.Event` guarding a success-or-
/// failure slot); realized here with a `Condvar` since the core has no async
/// runtime to hook an event into.
pub struct ResultCell<T> {
    inner: Mutex<Slot<T>>,
    cond: Condvar,
}

enum Slot<T> {
    Pending,
    Value(T),
    Error(IpcError),
}

impl<T> ResultCell<T> {
    pub fn new() -> Arc<Self> {
        Arc::new(ResultCell {
            inner: Mutex::new(Slot::Pending),
            cond: Condvar::new(),
        })
    }

    /// Fulfill the cell with a value. No-op if already set.
    pub fn set(&self, value: T) {
        let mut slot = self.inner.lock().unwrap();
        if matches!(*slot, Slot::Pending) {
            *slot = Slot::Value(value);
            self.cond.notify_all();
        }
    }

    /// Fulfill the cell with an error. No-op if already set.
    pub fn fail(&self, err: IpcError) {
        let mut slot = self.inner.lock().unwrap();
        if matches!(*slot, Slot::Pending) {
            *slot = Slot::Error(err);
            self.cond.notify_all();
        }
    }

    /// Block until the cell is set, then consume it, returning the value or
    /// re-raising the stored error. Panics if called twice (the cell is
    /// single-shot per the oneshot contract).
    pub fn wait(&self) -> Result<T, IpcError> {
        let mut slot = self.inner.lock().unwrap();
        while matches!(*slot, Slot::Pending) {
            slot = self.cond.wait(slot).unwrap();
        }
        match std::mem::replace(&mut *slot, Slot::Pending) {
            Slot::Value(v) => Ok(v),
            Slot::Error(e) => Err(e),
            Slot::Pending => unreachable!(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_cycles_and_wraps_to_start_not_limit() {
        let mut counter = WrappedCounter::new(1, 4);
        assert_eq!(counter.next(), 1);
        assert_eq!(counter.next(), 2);
        assert_eq!(counter.next(), 3);
        // must wrap to `start` (1), not to `limit` (4)
        assert_eq!(counter.next(), 1);
    }

    #[test]
    #[should_panic]
    fn counter_rejects_empty_range() {
        WrappedCounter::new(5, 5);
    }

    #[test]
    fn result_cell_delivers_value() {
        let cell = ResultCell::new();
        cell.set(42);
        assert_eq!(cell.wait().unwrap(), 42);
    }

    #[test]
    fn result_cell_delivers_error() {
        let cell: Arc<ResultCell<i32>> = ResultCell::new();
        cell.fail(IpcError::Closed);
        assert!(matches!(cell.wait(), Err(IpcError::Closed)));
    }

    #[test]
    fn result_cell_wakes_blocked_waiter() {
        let cell = ResultCell::new();
        let waiter = {
            let cell = cell.clone();
            std::thread::spawn(move || cell.wait())
        };
        std::thread::sleep(std::time::Duration::from_millis(20));
        cell.set(7);
        assert_eq!(waiter.join().unwrap().unwrap(), 7);
    }
}
