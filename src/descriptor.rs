//! The Descriptor describing exactly one Superblock
//!
//! Descriptors live in the persistent Descriptor-Section, indexed 1:1 with
//! the Superblocks of the Arena, so the Descriptor of any Block is found by
//! pure Address-Arithmetic instead of a Pagemap.

use std::sync::atomic;

use crate::durability;
use crate::region::{DESC_BASE, SBSIZE, SB_BASE};

mod anchor;
pub use anchor::{Anchor, AnchorState};
mod active;
pub use active::{Active, MAXCREDITS};

/// The Size of the Kind-Prefix of a Block-Header
pub const TYPE_SIZE: usize = 8;
/// The Size of the Descriptor-Pointer (or Byte-Length) of a Block-Header
pub const PTR_SIZE: usize = 8;
/// The full Block-Header preceding every User-Pointer
pub const HEADER_SIZE: usize = TYPE_SIZE + PTR_SIZE;

/// The Kind-Byte of a Block served from a Size-Class
pub const KIND_SMALL: u8 = 0x01;
/// The Kind-Byte of a directly mapped Large Block
pub const KIND_LARGE: u8 = 0x80;

/// The persistent Record describing exactly one Superblock (or, for Large
/// Blocks, one Superblock of a Span)
#[repr(C, align(64))]
pub struct Descriptor {
    anchor: atomic::AtomicU64,
    super_block: atomic::AtomicU64,
    block_size: atomic::AtomicU32,
    max_count: atomic::AtomicU32,
    sc_idx: atomic::AtomicU32,
    /// Back-Pointer into the transient Heap-Table, reassigned on every
    /// Attach and on every reuse
    heap_idx: atomic::AtomicU32,
    next_free: atomic::AtomicU64,
    next_partial: atomic::AtomicU64,
}

impl Descriptor {
    /// The Descriptor of the Superblock at the given Address
    pub fn lookup(sb_addr: usize) -> *mut Descriptor {
        let index = (sb_addr - SB_BASE) / SBSIZE;
        (DESC_BASE + index * std::mem::size_of::<Descriptor>()) as *mut Descriptor
    }

    /// The Index of this Descriptor inside the Descriptor-Section
    pub fn index(&self) -> usize {
        (self as *const Descriptor as usize - DESC_BASE) / std::mem::size_of::<Descriptor>()
    }

    /// The Address of the Superblock this Descriptor is indexed with, fixed
    /// by the 1:1 Layout of the two Sections
    pub fn indexed_sb_addr(&self) -> usize {
        SB_BASE + self.index() * SBSIZE
    }

    pub fn anchor(&self) -> Anchor {
        self.anchor.load(atomic::Ordering::Acquire).into()
    }

    /// Atomically swings the Anchor from `old` to `new` and makes the new
    /// Value durable on success
    pub fn update_anchor(&self, old: Anchor, new: Anchor) -> bool {
        durability::fence();
        let swapped = self
            .anchor
            .compare_exchange_weak(
                old.into(),
                new.into(),
                atomic::Ordering::AcqRel,
                atomic::Ordering::Relaxed,
            )
            .is_ok();

        if swapped {
            durability::flush_fence(&self.anchor);
        }
        swapped
    }

    /// Plain Anchor-Store for Paths where the Descriptor is not yet (or no
    /// longer) visible to other Threads
    pub fn store_anchor(&self, new: Anchor) {
        self.anchor.store(new.into(), atomic::Ordering::Release);
        durability::flush_fence(&self.anchor);
    }

    /// Initializes the Fields for a Superblock of a small Size-Class and
    /// makes them durable. The Anchor is published separately afterwards
    pub fn init_small(&self, sb_addr: usize, sc_idx: usize, heap_idx: usize) {
        let block_size = crate::size_classes::block_size(sc_idx);
        self.super_block
            .store(sb_addr as u64, atomic::Ordering::Release);
        self.block_size
            .store(block_size as u32, atomic::Ordering::Release);
        self.max_count
            .store(crate::size_classes::max_count(sc_idx) as u32, atomic::Ordering::Release);
        self.sc_idx.store(sc_idx as u32, atomic::Ordering::Release);
        self.heap_idx
            .store(heap_idx as u32, atomic::Ordering::Release);
        self.next_free.store(0, atomic::Ordering::Release);
        self.next_partial.store(0, atomic::Ordering::Release);

        // the Descriptor is exactly one Cache-Line
        durability::flush(self as *const Descriptor);
        durability::fence();
    }

    /// Initializes the Fields for (one Superblock of) a Large-Block Span.
    /// Every Superblock of a Span carries the Span-Base and the full
    /// Byte-Length, so any interior Pointer can be resolved to the Block
    pub fn init_large(&self, span_base: usize, span_bytes: usize) {
        self.super_block
            .store(span_base as u64, atomic::Ordering::Release);
        self.block_size
            .store(span_bytes as u32, atomic::Ordering::Release);
        self.max_count.store(1, atomic::Ordering::Release);
        self.sc_idx.store(0, atomic::Ordering::Release);
        self.heap_idx.store(0, atomic::Ordering::Release);
        self.next_free.store(0, atomic::Ordering::Release);
        self.next_partial.store(0, atomic::Ordering::Release);

        durability::flush(self as *const Descriptor);
        durability::fence();
    }

    pub fn superblock(&self) -> usize {
        self.super_block.load(atomic::Ordering::Acquire) as usize
    }
    pub fn block_size(&self) -> usize {
        self.block_size.load(atomic::Ordering::Acquire) as usize
    }
    pub fn max_count(&self) -> u32 {
        self.max_count.load(atomic::Ordering::Acquire)
    }
    /// The Size-Class Index, 0 for Large Blocks
    pub fn size_class(&self) -> usize {
        self.sc_idx.load(atomic::Ordering::Acquire) as usize
    }
    pub fn heap_idx(&self) -> usize {
        self.heap_idx.load(atomic::Ordering::Acquire) as usize
    }
    pub fn set_heap_idx(&self, heap_idx: usize) {
        self.heap_idx
            .store(heap_idx as u32, atomic::Ordering::Release);
        durability::flush(&self.heap_idx);
    }

    pub(crate) fn next_free(&self) -> &atomic::AtomicU64 {
        &self.next_free
    }
    pub(crate) fn next_partial(&self) -> &atomic::AtomicU64 {
        &self.next_partial
    }

    /// Whether the given Header-Address lies inside this Superblock
    pub fn contains(&self, addr: usize) -> bool {
        let lower = self.superblock();
        let upper = lower + self.block_size() * self.max_count() as usize;

        lower <= addr && addr < upper
    }

    /// The Slot-Index the given Header-Address falls into
    pub fn calc_index(&self, addr: usize) -> u32 {
        ((addr - self.superblock()) / self.block_size()) as u32
    }

    /// The Address of the Slot with the given Index
    pub fn slot(&self, index: u32) -> *mut u8 {
        (self.superblock() + index as usize * self.block_size()) as *mut u8
    }
}

/// Writes and flushes the Header of a small Block, the last Step before a
/// Block-Address may be handed out
pub unsafe fn write_header_small(header: *mut u8, desc: *const Descriptor) {
    unsafe {
        header.write(KIND_SMALL);
        (header.add(TYPE_SIZE) as *mut u64).write(desc as u64);
    }
    durability::flush(header);
    durability::flush(unsafe { header.add(TYPE_SIZE) });
    durability::fence();
}

/// Writes and flushes the Header of a Large Block with its exact Byte-Length
pub unsafe fn write_header_large(header: *mut u8, len: u64) {
    unsafe {
        header.write(KIND_LARGE);
        (header.add(TYPE_SIZE) as *mut u64).write(len);
    }
    durability::flush(header);
    durability::flush(unsafe { header.add(TYPE_SIZE) });
    durability::fence();
}

/// The Kind-Byte of the Block behind the given User-Pointer
pub unsafe fn header_kind(payload: *const u8) -> u8 {
    unsafe { payload.sub(HEADER_SIZE).read() }
}

/// The Descriptor recorded in the Header of a small Block
pub unsafe fn header_desc(payload: *const u8) -> *mut Descriptor {
    unsafe { (payload.sub(PTR_SIZE) as *const u64).read() as *mut Descriptor }
}

/// The Byte-Length recorded in the Header of a Large Block
pub unsafe fn header_len(payload: *const u8) -> u64 {
    unsafe { (payload.sub(PTR_SIZE) as *const u64).read() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_cache_line() {
        assert_eq!(64, std::mem::size_of::<Descriptor>());
        assert_eq!(64, std::mem::align_of::<Descriptor>());
    }

    #[test]
    fn lookup_arithmetic() {
        let sb = SB_BASE + 5 * SBSIZE;
        let desc = Descriptor::lookup(sb);

        assert_eq!(
            DESC_BASE + 5 * std::mem::size_of::<Descriptor>(),
            desc as usize
        );
        assert_eq!(DESC_BASE as *mut Descriptor, Descriptor::lookup(SB_BASE));
    }
}
