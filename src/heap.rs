//! The central Heap managing the Superblocks and the synchronization
//! between the Threads
//!
//! Every Thread is bound to one Row of Per-Processor Heaps, one entry per
//! Size-Class. An entry holds the Active-Word with the currently serving
//! Descriptor plus its pre-reserved Credits, and one Partial-Slot. Misses
//! fall back to the Size-Class Partial-Queue and finally to a fresh
//! Superblock from the Region.

use std::cmp::min;
use std::sync::atomic;

use crate::cache::Bin;
use crate::descriptor::{
    self, Active, Anchor, AnchorState, Descriptor, HEADER_SIZE, MAXCREDITS,
};
use crate::durability;
use crate::error::AllocError;
use crate::queues::{DescStack, Link};
use crate::region::{RegionManager, DESC_BASE, DESC_CHUNK, SBSIZE};
use crate::size_classes::{self, CLASS_COUNT};
use crate::util::align_up;

/// One Per-Processor Heap entry for a single Size-Class
#[derive(Debug)]
pub struct ProcHeap {
    active: atomic::AtomicU64,
    partial: atomic::AtomicPtr<Descriptor>,
    /// The Index of this entry in the Heap-Table, stored into Descriptors
    /// as their transient Back-Pointer
    index: usize,
    sc_idx: usize,
}

impl ProcHeap {
    fn new(index: usize, sc_idx: usize) -> Self {
        Self {
            active: atomic::AtomicU64::new(0),
            partial: atomic::AtomicPtr::new(std::ptr::null_mut()),
            index,
            sc_idx,
        }
    }

    fn reset(&self) {
        self.active.store(0, atomic::Ordering::Release);
        self.partial
            .store(std::ptr::null_mut(), atomic::Ordering::Release);
    }
}

#[derive(Debug)]
struct SizeClass {
    partial: DescStack,
}

/// The shared Heap, one per attached Allocator
#[derive(Debug)]
pub struct Heap {
    /// The Partial-Queue of every Size-Class
    classes: Vec<SizeClass>,
    /// The Heap-Table, `thread_count` Rows of one entry per Size-Class
    procs: Vec<ProcHeap>,
    /// Retired Descriptors ready for a new Superblock, which in the 1:1
    /// Layout means their Superblocks are free as well
    free_desc: DescStack,
}

impl Heap {
    pub fn new(thread_count: usize) -> Self {
        let classes = (0..CLASS_COUNT)
            .map(|_| SizeClass {
                partial: DescStack::new(DESC_BASE, Link::Partial),
            })
            .collect();
        let procs = (0..thread_count * CLASS_COUNT)
            .map(|index| ProcHeap::new(index, index % CLASS_COUNT))
            .collect();

        Self {
            classes,
            procs,
            free_desc: DescStack::new(DESC_BASE, Link::Free),
        }
    }

    /// The Heap-Entry serving `sc_idx` for the Thread bound to `slot`
    fn proc_heap(&self, slot: usize, sc_idx: usize) -> &ProcHeap {
        &self.procs[slot * CLASS_COUNT + sc_idx]
    }

    fn heap_by_index(&self, index: usize) -> &ProcHeap {
        &self.procs[index]
    }

    pub(crate) fn free_desc_queue(&self) -> &DescStack {
        &self.free_desc
    }

    pub(crate) fn class_partial(&self, sc_idx: usize) -> &DescStack {
        &self.classes[sc_idx].partial
    }

    /// Clears every transient Structure, the first Step of Recovery
    pub(crate) fn reset_transient(&self) {
        for class in self.classes.iter() {
            class.partial.reset();
        }
        self.free_desc.reset();
        for heap in self.procs.iter() {
            heap.reset();
        }
    }

    /// Allocates one small Block, trying the Active-Word first, then the
    /// Partial-Superblocks and finally a fresh Superblock
    pub fn malloc_small(
        &self,
        sc_idx: usize,
        slot: usize,
        region: &RegionManager,
    ) -> Result<*mut u8, AllocError> {
        let heap = self.proc_heap(slot, sc_idx);

        loop {
            if let Some(addr) = self.malloc_from_active(heap) {
                return Ok(addr);
            }
            if let Some(addr) = self.malloc_from_partial(heap) {
                return Ok(addr);
            }
            // a loser of the install race retries the whole ladder, the
            // winner's Active-Word now has Credits for us
            if let Some(addr) = self.malloc_from_newsb(heap, region)? {
                return Ok(addr);
            }
        }
    }

    /// Claims one of the Blocks reserved in the Active-Word
    fn malloc_from_active(&self, heap: &ProcHeap) -> Option<*mut u8> {
        // First step: reserve a Block by taking one Credit
        let oldactive;
        let mut old_raw = heap.active.load(atomic::Ordering::Acquire);
        loop {
            if old_raw == 0 {
                return None;
            }

            let active = Active::from(old_raw);
            let new_raw = if active.credits == 0 {
                // the last reserved Block, the Active-Word becomes empty
                0
            } else {
                Active::new(active.desc, active.credits - 1).into()
            };

            durability::fence();
            match heap.active.compare_exchange_weak(
                old_raw,
                new_raw,
                atomic::Ordering::AcqRel,
                atomic::Ordering::Acquire,
            ) {
                Ok(_) => {
                    durability::flush_fence(&heap.active);
                    oldactive = active;
                    break;
                }
                Err(current) => old_raw = current,
            }
        }

        // Second step: pop the reserved Block off the Superblock Free-List
        let desc = unsafe { &*(oldactive.desc as *const Descriptor) };
        let mut morecredits = 0;
        let addr = loop {
            let old = desc.anchor();
            let mut new = old;

            let addr = desc.slot(old.avail);
            let next = unsafe { (addr as *const u64).read() };
            new.avail = next as u32;
            new.tag = old.tag.wrapping_add(1);

            morecredits = 0;
            if oldactive.credits == 0 {
                // we took the last Credit, so the State must be ACTIVE
                if old.count == 0 {
                    new.state = AnchorState::Full;
                } else {
                    // reserve more Blocks for a fresh Active-Word
                    morecredits = min(old.count, MAXCREDITS);
                    new.count -= morecredits;
                }
            }

            if desc.update_anchor(old, new) {
                break addr;
            }
        };

        if oldactive.credits == 0 && morecredits > 0 {
            self.update_active(heap, desc, morecredits);
        }

        unsafe { descriptor::write_header_small(addr, desc) };
        Some(unsafe { addr.add(HEADER_SIZE) })
    }

    /// Takes a Partial Superblock, first from the Heap-Slot, then from the
    /// Size-Class Queue, and reserves its Blocks
    fn malloc_from_partial(&self, heap: &ProcHeap) -> Option<*mut u8> {
        loop {
            let desc_ptr = self.heap_get_partial(heap)?;
            let desc = unsafe { &*desc_ptr };
            desc.set_heap_idx(heap.index);

            // reserve Blocks
            let mut morecredits = 0;
            let mut retired = false;
            loop {
                let old = desc.anchor();
                if let AnchorState::Empty = old.state {
                    self.desc_retire(desc);
                    retired = true;
                    break;
                }

                // the State must be PARTIAL here, so count is at least 1
                let mut new = old;
                morecredits = min(old.count.saturating_sub(1), MAXCREDITS);
                new.count = old.count.saturating_sub(morecredits + 1);
                new.state = if morecredits > 0 {
                    AnchorState::Active
                } else {
                    AnchorState::Full
                };

                if desc.update_anchor(old, new) {
                    break;
                }
            }
            if retired {
                continue;
            }

            // pop the one Block reserved for this call
            let addr = loop {
                let old = desc.anchor();
                let mut new = old;

                let addr = desc.slot(old.avail);
                new.avail = unsafe { (addr as *const u64).read() } as u32;
                new.tag = old.tag.wrapping_add(1);

                if desc.update_anchor(old, new) {
                    break addr;
                }
            };

            if morecredits > 0 {
                self.update_active(heap, desc, morecredits);
            }

            unsafe { descriptor::write_header_small(addr, desc) };
            return Some(unsafe { addr.add(HEADER_SIZE) });
        }
    }

    /// Reserves a fresh Superblock, organizes its Free-List and races to
    /// install it as the Active Descriptor.
    ///
    /// Returns Ok(None) if another Thread won the install race, the fresh
    /// Superblock is retired again in that case
    fn malloc_from_newsb(
        &self,
        heap: &ProcHeap,
        region: &RegionManager,
    ) -> Result<Option<*mut u8>, AllocError> {
        let desc = unsafe { &*self.desc_alloc(region)? };
        let sb = desc.indexed_sb_addr();

        desc.init_small(sb, heap.sc_idx, heap.index);
        let max_count = desc.max_count();
        let block_size = desc.block_size();
        organize_sb_list(sb, max_count as usize, block_size);

        let credits = min(max_count - 1, MAXCREDITS) - 1;
        let newactive = Active::new(desc as *const Descriptor as usize, credits);

        let anchor = Anchor::new(
            AnchorState::Active,
            1,
            (max_count - 1).saturating_sub(credits + 1),
            desc.anchor().tag.wrapping_add(1),
        );
        desc.store_anchor(anchor);

        durability::fence();
        match heap.active.compare_exchange(
            0,
            newactive.into(),
            atomic::Ordering::AcqRel,
            atomic::Ordering::Relaxed,
        ) {
            Ok(_) => {
                durability::flush_fence(&heap.active);

                let addr = sb as *mut u8;
                unsafe { descriptor::write_header_small(addr, desc) };
                Ok(Some(unsafe { addr.add(HEADER_SIZE) }))
            }
            Err(_) => {
                // lost the race, the Superblock goes back with its
                // Descriptor
                self.desc_retire(desc);
                Ok(None)
            }
        }
    }

    /// Installs a Descriptor with left over Credits as the new Active, or
    /// returns the Credits to its Anchor and parks it as Partial if another
    /// Thread was faster
    fn update_active(&self, heap: &ProcHeap, desc: &Descriptor, morecredits: u32) {
        let newactive = Active::new(desc as *const Descriptor as usize, morecredits - 1);

        durability::fence();
        if heap
            .active
            .compare_exchange(
                0,
                newactive.into(),
                atomic::Ordering::AcqRel,
                atomic::Ordering::Relaxed,
            )
            .is_ok()
        {
            durability::flush_fence(&heap.active);
            return;
        }

        // someone installed another Active Superblock, return the reserved
        // Credits and make this one Partial
        loop {
            let old = desc.anchor();
            let mut new = old;
            new.count += morecredits;
            new.state = AnchorState::Partial;

            if desc.update_anchor(old, new) {
                break;
            }
        }

        self.heap_put_partial(desc);
    }

    /// Claims the Partial-Slot of the Heap, falling back to the Size-Class
    /// Queue when it is empty
    fn heap_get_partial(&self, heap: &ProcHeap) -> Option<*mut Descriptor> {
        let mut desc = heap.partial.load(atomic::Ordering::Acquire);
        loop {
            if desc.is_null() {
                return self.list_get_partial(heap.sc_idx);
            }

            durability::fence();
            match heap.partial.compare_exchange_weak(
                desc,
                std::ptr::null_mut(),
                atomic::Ordering::AcqRel,
                atomic::Ordering::Acquire,
            ) {
                Ok(_) => {
                    durability::flush_fence(&heap.partial);
                    return Some(desc);
                }
                Err(current) => desc = current,
            }
        }
    }

    /// Parks a Descriptor in the Partial-Slot of its Heap, a displaced
    /// previous occupant moves on to the Size-Class Queue
    fn heap_put_partial(&self, desc: &Descriptor) {
        let heap = self.heap_by_index(desc.heap_idx());

        let mut prev = heap.partial.load(atomic::Ordering::Acquire);
        loop {
            durability::fence();
            match heap.partial.compare_exchange_weak(
                prev,
                desc as *const Descriptor as *mut Descriptor,
                atomic::Ordering::AcqRel,
                atomic::Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(current) => prev = current,
            }
        }
        durability::flush_fence(&heap.partial);

        if !prev.is_null() {
            self.list_put_partial(unsafe { &*prev });
        }
    }

    fn list_get_partial(&self, sc_idx: usize) -> Option<*mut Descriptor> {
        self.classes[sc_idx].partial.pop()
    }

    fn list_put_partial(&self, desc: &Descriptor) {
        self.classes[desc.size_class()].partial.push(desc);
    }

    /// Retires EMPTY Descriptors found at the front of a Size-Class Queue,
    /// stopping after a couple of live ones
    fn list_remove_empty_desc(&self, sc_idx: usize) {
        let mut non_empty = 0;
        while let Some(desc_ptr) = self.list_get_partial(sc_idx) {
            let desc = unsafe { &*desc_ptr };
            if let AnchorState::Empty = desc.anchor().state {
                self.desc_retire(desc);
            } else {
                self.list_put_partial(desc);
                non_empty += 1;
                if non_empty >= 2 {
                    break;
                }
            }
        }
    }

    /// Detaches an EMPTY Descriptor from wherever it is parked and retires
    /// it
    fn remove_empty_desc(&self, desc: &Descriptor) {
        let heap = self.heap_by_index(desc.heap_idx());

        durability::fence();
        if heap
            .partial
            .compare_exchange(
                desc as *const Descriptor as *mut Descriptor,
                std::ptr::null_mut(),
                atomic::Ordering::AcqRel,
                atomic::Ordering::Relaxed,
            )
            .is_ok()
        {
            durability::flush_fence(&heap.partial);
            self.desc_retire(desc);
        } else {
            self.list_remove_empty_desc(desc.size_class());
        }
    }

    /// Takes a Descriptor (and with it a Superblock) from the free Queue,
    /// carving a fresh batch out of the Region when the Queue is dry
    fn desc_alloc(&self, region: &RegionManager) -> Result<*mut Descriptor, AllocError> {
        if let Some(desc) = self.free_desc.pop() {
            return Ok(desc);
        }

        let mut base = std::ptr::null_mut();
        region.region_allocator(&mut base, SBSIZE, DESC_CHUNK * SBSIZE)?;

        let first = Descriptor::lookup(base as usize);
        for i in 1..DESC_CHUNK {
            let sb = base as usize + i * SBSIZE;
            self.free_desc.push(unsafe { &*Descriptor::lookup(sb) });
        }

        Ok(first)
    }

    /// Returns a Descriptor to the free Queue. Descriptors are never handed
    /// back to the Region
    fn desc_retire(&self, desc: &Descriptor) {
        self.free_desc.push(desc);
    }

    /// Frees one small Block back to its Superblock, the slow path behind
    /// the Thread-Cache
    pub fn free_small(&self, payload: *mut u8) {
        let header = payload as usize - HEADER_SIZE;
        let desc = unsafe { &*descriptor::header_desc(payload) };

        let index = desc.calc_index(header);
        let slot = desc.slot(index);

        let (old, new) = loop {
            let old = desc.anchor();
            let mut new = old;

            unsafe { (slot as *mut u64).write(old.avail as u64) };
            new.avail = index;

            if let AnchorState::Full = old.state {
                new.state = AnchorState::Partial;
            }
            if old.count == desc.max_count() - 1 {
                // the whole Superblock is free again, the freed Block stays
                // uncounted as the Head of the List
                new.state = AnchorState::Empty;
            } else {
                new.count += 1;
            }

            if desc.update_anchor(old, new) {
                break (old, new);
            }
        };

        if let AnchorState::Empty = new.state {
            self.remove_empty_desc(desc);
        } else if let AnchorState::Full = old.state {
            self.heap_put_partial(desc);
        }
    }

    /// Fills a Thread-Cache Bin with a batch of Blocks. A partially filled
    /// Bin counts as success even if the Region runs out mid-batch
    pub fn fill_cache(
        &self,
        sc_idx: usize,
        slot: usize,
        bin: &mut Bin,
        region: &RegionManager,
    ) -> Result<(), AllocError> {
        let fill = size_classes::cache_fill(sc_idx);

        for _ in 0..fill {
            match self.malloc_small(sc_idx, slot, region) {
                Ok(addr) => bin.push(addr),
                Err(e) => {
                    if bin.is_empty() {
                        return Err(e);
                    }
                    break;
                }
            }
        }

        Ok(())
    }

    /// Flushes a Bin down to its fill level, returning Blocks to their
    /// Superblocks. Consecutive Blocks of the same Superblock are returned
    /// with a single Anchor update
    pub fn flush_cache(&self, sc_idx: usize, bin: &mut Bin) {
        let keep = size_classes::cache_fill(sc_idx);

        while bin.len() > keep {
            let head = match bin.pop() {
                Some(h) => h,
                None => return,
            };
            let desc = unsafe { &*descriptor::header_desc(head) };

            let head_index = desc.calc_index(head as usize - HEADER_SIZE);
            let mut tail_index = head_index;
            let mut block_count = 1;

            // gather the following Blocks that live in the same Superblock
            while let Some(next) = bin.peek() {
                if !desc.contains(next as usize - HEADER_SIZE) {
                    break;
                }
                let next = bin
                    .pop()
                    .expect("We just peeked and found a Block, so the Pop must succeed");

                let index = desc.calc_index(next as usize - HEADER_SIZE);
                unsafe { (desc.slot(tail_index) as *mut u64).write(index as u64) };
                tail_index = index;
                block_count += 1;
            }

            let (old, new) = loop {
                let old = desc.anchor();
                let mut new = old;

                unsafe { (desc.slot(tail_index) as *mut u64).write(old.avail as u64) };
                new.avail = head_index;
                if let AnchorState::Full = old.state {
                    new.state = AnchorState::Partial;
                }
                if old.count + block_count == desc.max_count() {
                    // the whole Superblock is free again, the Head of the
                    // List stays uncounted
                    new.state = AnchorState::Empty;
                    new.count = desc.max_count() - 1;
                } else {
                    new.count += block_count;
                }

                if desc.update_anchor(old, new) {
                    break (old, new);
                }
            };

            if let AnchorState::Empty = new.state {
                self.remove_empty_desc(desc);
            } else if let AnchorState::Full = old.state {
                self.heap_put_partial(desc);
            }
        }
    }

    /// Allocates a Large Block as a Span of contiguous Superblocks,
    /// bypassing the Size-Classes
    pub fn alloc_large(
        &self,
        size: usize,
        align: usize,
        region: &RegionManager,
    ) -> Result<*mut u8, AllocError> {
        let padding = if align > HEADER_SIZE { align } else { HEADER_SIZE };
        let span_bytes = align_up(size + padding, SBSIZE);
        if span_bytes > u32::MAX as usize {
            return Err(AllocError::OutOfRegion);
        }

        let base = if span_bytes == SBSIZE {
            // a single Superblock can come from the retired Queue
            let desc = self.desc_alloc(region)?;
            unsafe { &*desc }.indexed_sb_addr()
        } else {
            let mut out = std::ptr::null_mut();
            region.region_allocator(&mut out, SBSIZE, span_bytes)?;
            out as usize
        };

        // every Superblock of the Span records the Span, so any interior
        // Pointer resolves to the Block
        for sb in (base..base + span_bytes).step_by(SBSIZE) {
            unsafe { &*Descriptor::lookup(sb) }.init_large(base, span_bytes);
        }
        let first = unsafe { &*Descriptor::lookup(base) };
        first.store_anchor(Anchor::new(
            AnchorState::Full,
            0,
            0,
            first.anchor().tag.wrapping_add(1),
        ));

        let payload = if align > HEADER_SIZE {
            align_up(base + HEADER_SIZE, align)
        } else {
            base + HEADER_SIZE
        };
        unsafe {
            descriptor::write_header_large(
                (payload - HEADER_SIZE) as *mut u8,
                (size + HEADER_SIZE) as u64,
            )
        };

        Ok(payload as *mut u8)
    }

    /// Returns the whole Span of a Large Block to the Region
    pub fn free_large(&self, payload: *mut u8) {
        let header = payload as usize - HEADER_SIZE;
        let first = unsafe { &*Descriptor::lookup(crate::util::align_down(header, SBSIZE)) };

        let base = first.superblock();
        let span_bytes = first.block_size();

        for sb in (base..base + span_bytes).step_by(SBSIZE) {
            self.desc_retire(unsafe { &*Descriptor::lookup(sb) });
        }
    }
}

/// Threads the Blocks of a fresh Superblock into the Free-List the Anchor
/// starts at, Block 0 is handed out directly by the caller.
///
/// The last Block carries no Link, the count Bookkeeping of the Anchor
/// guarantees it is never followed
fn organize_sb_list(sb: usize, count: usize, stride: usize) {
    for i in 1..count.saturating_sub(1) {
        let block = (sb + i * stride) as *mut u64;
        unsafe { block.write(i as u64 + 1) };
        durability::flush(block);
    }
}
