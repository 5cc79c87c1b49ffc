//! The static Size-Class Table
//!
//! Small Blocks are served from 256 Classes covering every multiple of the
//! Granularity up to 2 KiB, each Class carving its Superblocks into equal
//! Blocks of that Size. Index 0 is reserved for Large Blocks that bypass the
//! Classes entirely.

use crate::descriptor::HEADER_SIZE;
use crate::region::SBSIZE;

/// The Granularity all Block-Sizes are a multiple of
pub const GRANULARITY: usize = 8;

/// The largest Block-Size (including the Header) served from a Size-Class
pub const MAX_SMALL: usize = 2048;

/// The Number of small Size-Classes
pub const NUM_SMALL_CLASSES: usize = MAX_SMALL / GRANULARITY;

/// The Number of Class-Indices, including Index 0 for Large Blocks
pub const CLASS_COUNT: usize = NUM_SMALL_CLASSES + 1;

/// Maps a requested Allocation-Size to its Size-Class Index.
///
/// The Block has to fit both the Object and the Header, so the Header-Size
/// is added before rounding up to the Granularity. Returns 0 if the Request
/// is too large for any Class and has to take the Large-Block path
pub fn size_to_class(size: usize) -> usize {
    let total = size + HEADER_SIZE;
    if total > MAX_SMALL {
        return 0;
    }

    crate::util::align_up(total, GRANULARITY) / GRANULARITY
}

/// The Block-Size of the given Class
pub const fn block_size(sc_idx: usize) -> usize {
    sc_idx * GRANULARITY
}

/// The Superblock-Size used for the given Class
pub const fn sb_size(_sc_idx: usize) -> usize {
    SBSIZE
}

/// The Number of Blocks in a Superblock of the given Class
pub const fn max_count(sc_idx: usize) -> usize {
    SBSIZE / block_size(sc_idx)
}

/// The Number of Blocks a Thread-Cache Bin is filled with on a miss, larger
/// Classes get smaller Batches
pub fn cache_fill(sc_idx: usize) -> usize {
    (4096 / block_size(sc_idx)).clamp(1, 64)
}

/// The Bin-Size above which a Thread-Cache Bin flushes a Batch back to its
/// Superblocks
pub fn cache_high_water(sc_idx: usize) -> usize {
    2 * cache_fill(sc_idx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn smallest_sizes() {
        // even a 0-Byte Request still needs room for the Header
        assert_eq!(2, size_to_class(0));
        assert_eq!(3, size_to_class(1));
        assert_eq!(3, size_to_class(7));
        assert_eq!(3, size_to_class(8));
    }

    #[test]
    fn largest_small_size() {
        assert_eq!(NUM_SMALL_CLASSES, size_to_class(MAX_SMALL - HEADER_SIZE));
        assert_eq!(0, size_to_class(MAX_SMALL - HEADER_SIZE + 1));
    }

    #[test]
    fn class_geometry() {
        assert_eq!(24, block_size(3));
        assert_eq!(2048, block_size(NUM_SMALL_CLASSES));
        assert_eq!(SBSIZE / 24, max_count(3));
        assert_eq!(8, max_count(NUM_SMALL_CLASSES));
    }

    #[test]
    fn cache_batches_shrink_with_size() {
        assert!(cache_fill(3) > cache_fill(NUM_SMALL_CLASSES));
        assert!(cache_fill(NUM_SMALL_CLASSES) >= 1);
        assert_eq!(2 * cache_fill(10), cache_high_water(10));
    }
}
