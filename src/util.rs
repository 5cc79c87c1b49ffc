//! Small Helpers shared across the Allocator

use std::cell::Cell;
use std::sync::atomic;

pub fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

pub fn align_down(value: usize, align: usize) -> usize {
    value & !(align - 1)
}

static THREAD_COUNTER: atomic::AtomicUsize = atomic::AtomicUsize::new(0);

thread_local! {
    static THREAD_ID: Cell<Option<usize>> = Cell::new(None);
}

/// A small monotonically assigned Id for the current Thread, stable for the
/// lifetime of the Thread
fn thread_id() -> usize {
    THREAD_ID.with(|raw| match raw.get() {
        Some(id) => id,
        None => {
            let id = THREAD_COUNTER.fetch_add(1, atomic::Ordering::Relaxed);
            raw.set(Some(id));
            id
        }
    })
}

/// The Per-Processor Heap-Row the current Thread is bound to, for an
/// Allocator attached with `count` Heap-Rows
pub fn thread_slot(count: usize) -> usize {
    thread_id() % count
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align() {
        assert_eq!(0, align_up(0, 8));
        assert_eq!(8, align_up(1, 8));
        assert_eq!(8, align_up(8, 8));
        assert_eq!(16, align_up(9, 8));

        assert_eq!(0, align_down(7, 8));
        assert_eq!(8, align_down(15, 8));
    }

    #[test]
    fn thread_slot_stable() {
        let first = thread_slot(4);
        let second = thread_slot(4);
        assert_eq!(first, second);
        assert!(first < 4);
    }
}
