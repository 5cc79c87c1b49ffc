#![deny(unsafe_op_in_unsafe_fn)]
#![warn(rust_2018_idioms, missing_docs)]
//! A persistent, lock-free, thread-caching Memory-Allocator
//!
//! The Allocator serves small Blocks from segregated Size-Classes backed by
//! Superblocks, with per-Thread Caches in front and a lock-free Heap
//! behind. All Metadata and Payload live in a persistent Region mapped at a
//! fixed Address, and every Metadata-Write is ordered with explicit Flushes
//! and Fences, so that after a crash the next [`Allocator::attach`] finds a
//! consistent State and reclaims every Block that is not reachable from one
//! of the named [Roots](Allocator::set_root).
//!
//! # Internal design
//! ## Thread-Local Caches
//! Each thread has a small Cache of ready to use Blocks per Size-Class,
//! which help with performance in most cases as they dont need any extra
//! synchronization between threads.
//!
//! ## Heap
//! The Heap is the central shared entity, which actually manages the
//! underlying Superblocks as well as the needed synchronization between
//! different threads, using only CAS on single Words.
//!
//! ## Recovery
//! Attaching to an already formatted Region runs a single-threaded
//! Mark-and-Sweep pass over the Root-Table that rebuilds all transient
//! State and reclaims unreachable Superblocks.
//!
//! # Feature-Flags
//! * `pmem`: Emits the real Cache-Line writeback and Fence instructions,
//!   without it the Durability-Layer is a volatile no-op
//!
//! # References
//! * [Paper - 'Scalable Lock-Free Dynamic Memory Allocation'](https://www.cs.tufts.edu/~nr/cs257/archive/maged-michael/pldi-2004.pdf)

use std::cell::RefCell;
use std::cmp::min;
use std::path::Path;
use std::ptr::NonNull;
use std::sync::atomic;

use log::info;

pub mod descriptor;
pub mod durability;
pub mod error;
pub mod queues;
pub mod region;
pub mod roots;
pub mod size_classes;

mod cache;
mod heap;
mod recovery;
mod util;

use cache::Cache;
use descriptor::{HEADER_SIZE, KIND_LARGE};
use heap::Heap;
use region::{RegionManager, DEFAULT_SB_BYTES};

pub use error::{AllocError, AttachError};
pub use roots::{register_filter, ScanFn, FILTER_CONSERVATIVE, MAX_FILTERS, MAX_ROOTS};

// there is one Address-Space, so there can only be one attached Allocator
static ATTACHED: atomic::AtomicBool = atomic::AtomicBool::new(false);
static EPOCH: atomic::AtomicU64 = atomic::AtomicU64::new(0);

thread_local! {
    static CACHE: RefCell<Cache> = RefCell::new(Cache::new());
}

/// Whether an Attach created a fresh Region or resumed an existing one
#[derive(Debug, PartialEq, Clone, Copy)]
pub enum AttachKind {
    /// The Region was formatted by this Attach
    Fresh,
    /// An already formatted Region was found and recovered
    Resumed,
}

/// The Handle to an attached persistent Allocator
///
/// All Operations go through this Handle. It is created by
/// [`Allocator::attach`] and detaches (flushes and unmaps the Region) on
/// Drop. Only a single Allocator can be attached per Process at a time
#[derive(Debug)]
pub struct Allocator {
    region: RegionManager,
    heap: Heap,
    thread_count: usize,
    epoch: u64,
}

// the raw Pointers inside only ever reference the fixed mapped Region
unsafe impl Send for Allocator {}
unsafe impl Sync for Allocator {}

impl Allocator {
    /// Attaches to the persistent Region at the given Path with the default
    /// Arena-Size, creating and formatting it if needed.
    ///
    /// `thread_count` fixes the Number of Per-Processor Heap-Rows, Threads
    /// beyond that share Rows by Id
    pub fn attach(path: &Path, thread_count: usize) -> Result<(Self, AttachKind), AttachError> {
        Self::attach_with(path, thread_count, DEFAULT_SB_BYTES)
    }

    /// Like [`Allocator::attach`], with an explicit Arena-Size for the
    /// Superblock-Region. The Size only applies when the Region is freshly
    /// formatted, a resumed Region keeps its Geometry
    pub fn attach_with(
        path: &Path,
        thread_count: usize,
        sb_bytes: usize,
    ) -> Result<(Self, AttachKind), AttachError> {
        if thread_count == 0 {
            return Err(AttachError::InvalidArgument);
        }

        if ATTACHED
            .compare_exchange(
                false,
                true,
                atomic::Ordering::SeqCst,
                atomic::Ordering::SeqCst,
            )
            .is_err()
        {
            return Err(AttachError::AlreadyAttached);
        }

        let (region, resumed) = match RegionManager::attach(path, sb_bytes) {
            Ok(v) => v,
            Err(e) => {
                ATTACHED.store(false, atomic::Ordering::SeqCst);
                return Err(e);
            }
        };

        let allocator = Self {
            region,
            heap: Heap::new(thread_count),
            thread_count,
            epoch: EPOCH.fetch_add(1, atomic::Ordering::SeqCst) + 1,
        };

        if resumed {
            if let Err(e) = recovery::run(&allocator.region, &allocator.heap) {
                // Drop unmaps the Region and releases the Attach-Guard
                drop(allocator);
                return Err(e);
            }
            info!("Resumed persistent Region at {:?}", path);
            Ok((allocator, AttachKind::Resumed))
        } else {
            info!("Created fresh persistent Region at {:?}", path);
            Ok((allocator, AttachKind::Fresh))
        }
    }

    /// Flushes and unmaps the Region. Equivalent to dropping the Handle
    pub fn detach(self) {}

    fn slot(&self) -> usize {
        util::thread_slot(self.thread_count)
    }

    /// Runs the given Closure with the Thread-Cache, or with None if the
    /// Cache is already borrowed further up the Stack
    fn with_cache<R>(&self, f: impl FnOnce(Option<&mut Cache>) -> R) -> R {
        CACHE.with(|raw| match raw.try_borrow_mut() {
            Ok(mut cache) => {
                cache.ensure_epoch(self.epoch);
                f(Some(&mut cache))
            }
            Err(_) => f(None),
        })
    }

    /// Allocates a Block of at least `size` Bytes.
    ///
    /// A `size` of 0 yields a valid minimum-size Allocation
    pub fn allocate(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        let sc_idx = size_classes::size_to_class(size);

        let ptr = if sc_idx == 0 {
            self.heap.alloc_large(size, 1, &self.region)?
        } else {
            self.with_cache(|cache| match cache {
                Some(cache) => {
                    if let Some(ptr) = cache.try_alloc(sc_idx) {
                        return Ok(ptr);
                    }

                    let bin = cache.bin_mut(sc_idx);
                    self.heap.fill_cache(sc_idx, self.slot(), bin, &self.region)?;
                    Ok(bin.pop().expect(
                        "We just filled the Bin with at least one Block, so there has to be one available",
                    ))
                }
                None => self.heap.malloc_small(sc_idx, self.slot(), &self.region),
            })?
        };

        NonNull::new(ptr).ok_or(AllocError::OutOfRegion)
    }

    /// Frees a Block previously returned by this Allocator. A null Pointer
    /// is a no-op
    pub fn free(&self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }

        if unsafe { descriptor::header_kind(ptr) } == KIND_LARGE {
            self.heap.free_large(ptr);
            return;
        }

        let desc = unsafe { &*descriptor::header_desc(ptr) };
        let sc_idx = desc.size_class();

        // an aligned Allocation frees through its duplicate Header, the
        // Block reenters circulation as its canonical Slot-Payload
        let slot_start = descriptor_slot_start(ptr);
        let canonical = (slot_start + HEADER_SIZE) as *mut u8;
        let ptr = if canonical != ptr {
            unsafe { descriptor::write_header_small(slot_start as *mut u8, desc) };
            canonical
        } else {
            ptr
        };

        self.with_cache(|cache| match cache {
            Some(cache) => {
                let bin = cache.bin_mut(sc_idx);
                bin.push(ptr);
                if bin.len() > size_classes::cache_high_water(sc_idx) {
                    self.heap.flush_cache(sc_idx, bin);
                }
            }
            None => self.heap.free_small(ptr),
        });
    }

    /// Resizes a Block, keeping it in place when the new Size still fits
    /// its current Block, copying into a fresh Allocation otherwise
    pub fn reallocate(&self, ptr: *mut u8, size: usize) -> Result<NonNull<u8>, AllocError> {
        if ptr.is_null() {
            return self.allocate(size);
        }
        if size == 0 {
            self.free(ptr);
            return self.allocate(0);
        }

        let old_payload = if unsafe { descriptor::header_kind(ptr) } == KIND_LARGE {
            (unsafe { descriptor::header_len(ptr) }) as usize - HEADER_SIZE
        } else {
            let desc = unsafe { &*descriptor::header_desc(ptr) };
            let slot_start = descriptor_slot_start(ptr);
            desc.block_size() - (ptr as usize - slot_start)
        };

        if size <= old_payload {
            return NonNull::new(ptr).ok_or(AllocError::InvalidArgument);
        }

        let new = self.allocate(size)?;
        unsafe {
            std::ptr::copy_nonoverlapping(ptr, new.as_ptr(), min(old_payload, size));
        }
        self.free(ptr);
        Ok(new)
    }

    /// Allocates `n_elems * elem_size` Bytes and zeroes them
    pub fn allocate_zeroed(
        &self,
        n_elems: usize,
        elem_size: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        let bytes = n_elems
            .checked_mul(elem_size)
            .ok_or(AllocError::InvalidArgument)?;

        let ptr = self.allocate(bytes)?;
        unsafe { std::ptr::write_bytes(ptr.as_ptr(), 0, bytes) };
        Ok(ptr)
    }

    /// Allocates a Block whose Address is a multiple of `align`, which has
    /// to be a power of two
    pub fn allocate_aligned(&self, align: usize, size: usize) -> Result<NonNull<u8>, AllocError> {
        if !align.is_power_of_two() {
            return Err(AllocError::InvalidArgument);
        }
        if align <= size_classes::GRANULARITY {
            return self.allocate(size);
        }

        // over-allocate so an aligned Address with room for a Header in
        // front always exists inside the Block
        let padded = size + align;
        if size_classes::size_to_class(padded) == 0 {
            let ptr = self.heap.alloc_large(size, align, &self.region)?;
            return NonNull::new(ptr).ok_or(AllocError::OutOfRegion);
        }

        let raw = self.allocate(padded)?.as_ptr();
        let aligned = util::align_up(raw as usize, align);
        if aligned != raw as usize {
            // the duplicate Header lets free() find the Descriptor from the
            // aligned Address, the Slot itself is recovered by Index
            let desc = unsafe { descriptor::header_desc(raw) };
            unsafe { descriptor::write_header_small((aligned - HEADER_SIZE) as *mut u8, desc) };
        }

        NonNull::new(aligned as *mut u8).ok_or(AllocError::OutOfRegion)
    }

    /// The `posix_memalign`-shaped Variant of
    /// [`Allocator::allocate_aligned`], writing the Block into `out`
    pub fn aligned_into(
        &self,
        out: &mut *mut u8,
        align: usize,
        size: usize,
    ) -> Result<(), AllocError> {
        let ptr = self.allocate_aligned(align, size)?;
        *out = ptr.as_ptr();
        Ok(())
    }

    /// Stores a persistent Root. The Slot is durable before this returns.
    ///
    /// The Filter-Id selects the registered Scan-Function Recovery uses to
    /// find the persistent Pointers inside the Root-Block
    pub fn set_root(&self, index: usize, ptr: *mut u8, filter_id: usize) -> Result<(), AllocError> {
        if index >= MAX_ROOTS || filter_id >= MAX_FILTERS {
            return Err(AllocError::InvalidArgument);
        }

        self.region.meta().roots()[index].store(ptr as usize, filter_id);
        Ok(())
    }

    /// Reads a persistent Root, null if the Slot was never set
    pub fn get_root(&self, index: usize) -> Result<*mut u8, AllocError> {
        if index >= MAX_ROOTS {
            return Err(AllocError::InvalidArgument);
        }

        let (ptr, _) = self.region.meta().roots()[index].load();
        Ok(ptr as *mut u8)
    }

    /// Registers a Scan-Function under the given Filter-Id. Registration is
    /// process-local and has to be repeated in every Process before the
    /// Recovery of the next Attach may rely on it
    pub fn register_filter(&self, id: usize, scan: ScanFn) -> Result<(), AllocError> {
        roots::register_filter(id, scan)
    }
}

impl Drop for Allocator {
    fn drop(&mut self) {
        self.region.detach();
        ATTACHED.store(false, atomic::Ordering::SeqCst);
    }
}

/// The Start of the Slot a small Block-Payload lives in, which differs from
/// `ptr - HEADER_SIZE` for aligned Allocations
fn descriptor_slot_start(ptr: *mut u8) -> usize {
    let desc = unsafe { &*descriptor::header_desc(ptr) };
    let index = desc.calc_index(ptr as usize - HEADER_SIZE);
    desc.slot(index) as usize
}
