//! The persistent Root-Table and the Filter-Registry
//!
//! Roots are the named entry points Recovery starts its Mark-Phase from.
//! Each Slot pairs a Pointer with a Filter-Id, a small Integer selecting the
//! Function that enumerates the persistent Child-Pointers inside the Block.
//! Ids instead of Function-Pointers keep the Slots valid across restarts,
//! the Registry itself is process-local and has to be filled again on every
//! Attach before Recovery may rely on it.

use std::sync::atomic;

use lazy_static::lazy_static;
use std::sync::Mutex;

use crate::durability;
use crate::error::AllocError;

/// The Number of persistent Root-Slots
pub const MAX_ROOTS: usize = 1024;

/// The Number of registrable Filters
pub const MAX_FILTERS: usize = 64;

/// The Id of the built-in conservative Filter that treats every Word of a
/// Block as a potential Pointer
pub const FILTER_CONSERVATIVE: usize = 0;

/// A Filter receives a Block and its Descriptor-derived Size and reports
/// every contained Candidate-Pointer to the Sink
pub type ScanFn = fn(block: *const u8, size: usize, sink: &mut dyn FnMut(usize));

/// One persistent Root-Slot
#[repr(C)]
pub struct RootSlot {
    ptr: atomic::AtomicU64,
    filter: atomic::AtomicU64,
}

impl RootSlot {
    pub(crate) fn clear(&self) {
        self.ptr.store(0, atomic::Ordering::Release);
        self.filter.store(0, atomic::Ordering::Release);
    }

    /// Stores the Pointer and Filter-Id and makes both durable before
    /// returning
    pub(crate) fn store(&self, ptr: usize, filter: usize) {
        self.filter.store(filter as u64, atomic::Ordering::Release);
        self.ptr.store(ptr as u64, atomic::Ordering::Release);
        durability::flush(&self.filter);
        durability::flush(&self.ptr);
        durability::fence();
    }

    pub(crate) fn load(&self) -> (usize, usize) {
        (
            self.ptr.load(atomic::Ordering::Acquire) as usize,
            self.filter.load(atomic::Ordering::Acquire) as usize,
        )
    }
}

lazy_static! {
    static ref FILTERS: Mutex<[Option<ScanFn>; MAX_FILTERS]> = Mutex::new([None; MAX_FILTERS]);
}

/// Registers the Scan-Function for the given Filter-Id. Id 0 is the
/// built-in conservative Filter and can not be replaced
pub fn register_filter(id: usize, scan: ScanFn) -> Result<(), AllocError> {
    if id == FILTER_CONSERVATIVE || id >= MAX_FILTERS {
        return Err(AllocError::InvalidArgument);
    }

    let mut filters = FILTERS
        .lock()
        .expect("The Filter-Registry Lock is never poisoned as registration can not panic");
    filters[id] = Some(scan);
    Ok(())
}

/// Looks up the Scan-Function for a Filter-Id, falling back to the
/// conservative Filter for Id 0
pub(crate) fn lookup_filter(id: usize) -> Option<ScanFn> {
    if id == FILTER_CONSERVATIVE {
        return Some(conservative_scan);
    }
    if id >= MAX_FILTERS {
        return None;
    }

    let filters = FILTERS
        .lock()
        .expect("The Filter-Registry Lock is never poisoned as registration can not panic");
    filters[id]
}

/// The built-in Filter: every 8-Byte aligned Word of the Block is reported
/// as a Candidate. False positives are fine, the Mark-Phase validates every
/// Candidate against the Descriptors before following it
pub(crate) fn conservative_scan(block: *const u8, size: usize, sink: &mut dyn FnMut(usize)) {
    let words = size / std::mem::size_of::<u64>();
    for i in 0..words {
        let value = unsafe { (block as *const u64).add(i).read() };
        sink(value as usize);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conservative_reports_every_word() {
        let data: [u64; 4] = [1, 2, 3, 4];
        let mut seen = Vec::new();

        conservative_scan(data.as_ptr() as *const u8, 32, &mut |candidate| {
            seen.push(candidate)
        });

        assert_eq!(vec![1, 2, 3, 4], seen);
    }

    #[test]
    fn register_rejects_reserved_ids() {
        fn noop(_: *const u8, _: usize, _: &mut dyn FnMut(usize)) {}

        assert_eq!(
            Err(AllocError::InvalidArgument),
            register_filter(FILTER_CONSERVATIVE, noop)
        );
        assert_eq!(
            Err(AllocError::InvalidArgument),
            register_filter(MAX_FILTERS, noop)
        );

        register_filter(7, noop).unwrap();
        assert!(lookup_filter(7).is_some());
        assert!(lookup_filter(8).is_none());
    }
}
