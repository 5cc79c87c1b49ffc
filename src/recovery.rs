//! The single-threaded Mark-and-Sweep Pass running on every resumed Attach
//!
//! The Pass rebuilds all transient State from the persistent Descriptors
//! and the Root-Table: it marks every Block transitively reachable from the
//! Roots, then walks the Superblock-Arena in Address-Order, rethreading the
//! Free-Lists of partially used Superblocks and reclaiming every Superblock
//! without a single marked Block.
//!
//! The marked Set is an ordered Set of Block-Addresses, so the Sweep visits
//! the Marks of each Superblock with a single Range-Query and stays
//! O(marked) overall, independent of how large the Arena is.

use std::collections::BTreeSet;

use log::{debug, warn};

use crate::descriptor::{Anchor, AnchorState, Descriptor};
use crate::durability;
use crate::error::AttachError;
use crate::heap::Heap;
use crate::region::{RegionManager, SBSIZE, SB_BASE};
use crate::roots::{self, FILTER_CONSERVATIVE};
use crate::size_classes::{self, CLASS_COUNT};
use crate::util::align_down;

/// Runs the full Recovery-Pass. No other Thread may touch the Allocator
/// while this runs
pub fn run(region: &RegionManager, heap: &Heap) -> Result<(), AttachError> {
    // Step 0: all transient State starts from scratch
    heap.reset_transient();

    let top = region.sb_top_addr();
    let marked = mark(region, top)?;

    debug!("Recovery marked {} reachable Blocks", marked.len());

    sweep(heap, &marked, top)?;

    durability::fence();
    Ok(())
}

/// Marks every Block transitively reachable from the Root-Table.
///
/// Roots are scanned with their registered Filter, everything reached from
/// there is scanned conservatively. Candidates are validated against the
/// Descriptors and normalized to their Block-Start before insertion, which
/// both deduplicates interior Pointers and lets Cycles terminate
fn mark(region: &RegionManager, top: usize) -> Result<BTreeSet<usize>, AttachError> {
    let mut marked = BTreeSet::new();
    let mut work: Vec<(usize, usize)> = Vec::new();

    for slot in region.meta().roots().iter() {
        let (ptr, filter_id) = slot.load();
        if ptr == 0 {
            continue;
        }

        if ptr < SB_BASE || ptr >= top {
            return Err(AttachError::Corruption(
                "a root points outside the superblock region",
            ));
        }
        let (start, size) = match normalize(ptr, top) {
            Some(block) => block,
            None => {
                return Err(AttachError::Corruption(
                    "a root does not resolve to a block",
                ));
            }
        };

        if marked.insert(start) {
            let scan = match roots::lookup_filter(filter_id) {
                Some(scan) => scan,
                None => {
                    warn!(
                        "Filter {} is not registered, scanning the root conservatively",
                        filter_id
                    );
                    roots::lookup_filter(FILTER_CONSERVATIVE)
                        .expect("The conservative Filter is always available")
                }
            };

            let mut candidates = Vec::new();
            scan(start as *const u8, size, &mut |candidate| {
                candidates.push(candidate)
            });
            enqueue_candidates(&candidates, top, &mut marked, &mut work);
        }
    }

    while let Some((start, size)) = work.pop() {
        let mut candidates = Vec::new();
        roots::conservative_scan(start as *const u8, size, &mut |candidate| {
            candidates.push(candidate)
        });
        enqueue_candidates(&candidates, top, &mut marked, &mut work);
    }

    Ok(marked)
}

fn enqueue_candidates(
    candidates: &[usize],
    top: usize,
    marked: &mut BTreeSet<usize>,
    work: &mut Vec<(usize, usize)>,
) {
    for &candidate in candidates {
        if let Some((start, size)) = normalize(candidate, top) {
            if marked.insert(start) {
                work.push((start, size));
            }
        }
    }
}

/// Resolves a Candidate-Pointer to the Start and Size of the Block it falls
/// into, or None if it does not plausibly point at any Block
fn normalize(ptr: usize, top: usize) -> Option<(usize, usize)> {
    if ptr < SB_BASE || ptr >= top {
        return None;
    }

    let sb = align_down(ptr, SBSIZE);
    let desc = unsafe { &*Descriptor::lookup(sb) };
    let sc_idx = desc.size_class();

    if sc_idx == 0 {
        // a Large Span, possibly entered through an interior Superblock
        let base = desc.superblock();
        let len = desc.block_size();
        if base < SB_BASE || base % SBSIZE != 0 || len == 0 || len % SBSIZE != 0 {
            return None;
        }
        if ptr < base || ptr >= base + len || base + len > top {
            return None;
        }
        Some((base, len))
    } else if sc_idx < CLASS_COUNT && desc.superblock() == sb {
        if !small_geometry_ok(desc, sc_idx) {
            return None;
        }
        let block_size = desc.block_size();
        let slot = (ptr - sb) / block_size;
        if slot >= desc.max_count() as usize {
            return None;
        }
        Some((sb + slot * block_size, block_size))
    } else {
        None
    }
}

fn small_geometry_ok(desc: &Descriptor, sc_idx: usize) -> bool {
    desc.block_size() == size_classes::block_size(sc_idx)
        && desc.max_count() as usize == size_classes::max_count(sc_idx)
}

/// Walks the Arena Superblock by Superblock, rebuilding Anchors and Queues
fn sweep(heap: &Heap, marked: &BTreeSet<usize>, top: usize) -> Result<(), AttachError> {
    let mut reclaimed = 0_usize;
    let mut partial = 0_usize;

    let mut curr = SB_BASE;
    while curr < top {
        let desc = unsafe { &*Descriptor::lookup(curr) };
        let sc_idx = desc.size_class();

        // a live Large Span starts here
        if sc_idx == 0 && desc.superblock() == curr && marked.contains(&curr) {
            let len = desc.block_size();
            if len == 0 || len % SBSIZE != 0 || curr + len > top {
                return Err(AttachError::Corruption(
                    "a large descriptor does not match its span",
                ));
            }

            desc.next_free().store(0, std::sync::atomic::Ordering::Release);
            desc.next_partial()
                .store(0, std::sync::atomic::Ordering::Release);
            desc.store_anchor(Anchor::new(
                AnchorState::Full,
                0,
                0,
                desc.anchor().tag.wrapping_add(1),
            ));

            curr += len;
            continue;
        }

        // a small Superblock with at least one reachable Block
        if sc_idx > 0
            && sc_idx < CLASS_COUNT
            && desc.superblock() == curr
            && marked.range(curr..curr + SBSIZE).next().is_some()
        {
            if !small_geometry_ok(desc, sc_idx) {
                return Err(AttachError::Corruption(
                    "a descriptor does not match its size class",
                ));
            }

            let block_size = desc.block_size();
            let max_count = desc.max_count() as usize;

            let mut used = vec![false; max_count];
            for &mark in marked.range(curr..curr + SBSIZE) {
                used[(mark - curr) / block_size] = true;
            }

            // rethread the Free-List through every unreachable Slot,
            // ascending so the List starts at the lowest one
            let mut free_head = max_count as u32;
            let mut free_count = 0_u32;
            for slot in (0..max_count).rev() {
                if !used[slot] {
                    let block = (curr + slot * block_size) as *mut u64;
                    unsafe { block.write(free_head as u64) };
                    durability::flush(block);
                    free_head = slot as u32;
                    free_count += 1;
                }
            }

            desc.next_free().store(0, std::sync::atomic::Ordering::Release);
            desc.next_partial()
                .store(0, std::sync::atomic::Ordering::Release);
            // bind to Heap-Row 0 until a Thread claims the Superblock, the
            // entry of Row 0 for this Class sits at Index sc_idx
            desc.set_heap_idx(sc_idx);

            let tag = desc.anchor().tag.wrapping_add(1);
            if free_count == 0 {
                desc.store_anchor(Anchor::new(AnchorState::Full, free_head, 0, tag));
            } else {
                desc.store_anchor(Anchor::new(
                    AnchorState::Partial,
                    free_head,
                    free_count,
                    tag,
                ));
                heap.class_partial(sc_idx).push(desc);
                partial += 1;
            }

            curr += SBSIZE;
            continue;
        }

        // nothing reachable in here: stale, never used, or fully freed
        if marked.range(curr..curr + SBSIZE).next().is_some() {
            return Err(AttachError::Corruption(
                "a marked block lies in an unowned superblock",
            ));
        }
        heap.free_desc_queue().push(desc);
        reclaimed += 1;
        curr += SBSIZE;
    }

    debug!(
        "Recovery reclaimed {} Superblocks, requeued {} partial ones",
        reclaimed, partial
    );
    Ok(())
}
