//! The Anchor-Word of a Descriptor
//!
//! The Anchor is the single source of truth for the free Blocks of a
//! Superblock and its Lifecycle-State. It is always updated as one 64-Bit
//! Word with a CAS, laid out as
//! `[state: 2][tag: 30][avail: 16][count: 16]`.

const COUNT_BITS: u64 = 16;
const AVAIL_BITS: u64 = 16;
const TAG_BITS: u64 = 30;

const COUNT_MASK: u64 = (1 << COUNT_BITS) - 1;
const AVAIL_MASK: u64 = (1 << AVAIL_BITS) - 1;
const TAG_MASK: u64 = (1 << TAG_BITS) - 1;

/// The Lifecycle-State of a Superblock
#[derive(Debug, PartialEq, Clone, Copy)]
pub enum AnchorState {
    /// Every Block is free, the Superblock can be recycled
    Empty,
    /// Some Blocks are free and not reserved by any Active-Word
    Partial,
    /// Every Block is handed out or reserved
    Full,
    /// Installed in the Active-Word of a Heap
    Active,
}

impl From<u64> for AnchorState {
    fn from(raw: u64) -> Self {
        match raw & 0b11 {
            0b00 => Self::Empty,
            0b01 => Self::Partial,
            0b10 => Self::Full,
            _ => Self::Active,
        }
    }
}
impl From<AnchorState> for u64 {
    fn from(raw: AnchorState) -> Self {
        match raw {
            AnchorState::Empty => 0b00,
            AnchorState::Partial => 0b01,
            AnchorState::Full => 0b10,
            AnchorState::Active => 0b11,
        }
    }
}

/// The decoded Anchor-Word
#[derive(Debug, PartialEq, Clone, Copy)]
pub struct Anchor {
    /// The Lifecycle-State of the Superblock
    pub state: AnchorState,
    /// The Index of the first Block on the intra-Superblock Free-List
    pub avail: u32,
    /// The Number of free Blocks not reserved by any Active-Word
    pub count: u32,
    /// A monotonically increasing Counter closing the ABA-Window on the
    /// Free-List head
    pub tag: u32,
}

impl Anchor {
    pub fn new(state: AnchorState, avail: u32, count: u32, tag: u32) -> Self {
        Self {
            state,
            avail,
            count,
            tag,
        }
    }
}

impl From<u64> for Anchor {
    fn from(raw: u64) -> Self {
        Self {
            state: (raw >> 62).into(),
            tag: ((raw >> 32) & TAG_MASK) as u32,
            avail: ((raw >> 16) & AVAIL_MASK) as u32,
            count: (raw & COUNT_MASK) as u32,
        }
    }
}
impl From<Anchor> for u64 {
    fn from(raw: Anchor) -> Self {
        let state_bits: u64 = u64::from(raw.state) << 62;
        let tag_bits: u64 = (raw.tag as u64 & TAG_MASK) << 32;
        let avail_bits: u64 = (raw.avail as u64 & AVAIL_MASK) << 16;
        let count_bits: u64 = raw.count as u64 & COUNT_MASK;

        state_bits | tag_bits | avail_bits | count_bits
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn u64_to_anchor_state() {
        assert_eq!(AnchorState::Empty, AnchorState::from(0b00));
        assert_eq!(AnchorState::Partial, AnchorState::from(0b01));
        assert_eq!(AnchorState::Full, AnchorState::from(0b10));
        assert_eq!(AnchorState::Active, AnchorState::from(0b11));
    }

    #[test]
    fn anchor_state_to_u64() {
        assert_eq!(0b00_u64, AnchorState::Empty.into());
        assert_eq!(0b01_u64, AnchorState::Partial.into());
        assert_eq!(0b10_u64, AnchorState::Full.into());
        assert_eq!(0b11_u64, AnchorState::Active.into());
    }

    #[test]
    fn u64_to_anchor() {
        assert_eq!(
            Anchor {
                state: AnchorState::Full,
                tag: 1,
                avail: 0x12,
                count: 0x34,
            },
            Anchor::from(0x8000_0001_0012_0034)
        );
        assert_eq!(
            Anchor {
                state: AnchorState::Active,
                tag: 0x3fff_ffff,
                avail: 0xffff,
                count: 0xffff,
            },
            Anchor::from(0xffff_ffff_ffff_ffff)
        );
    }

    #[test]
    fn anchor_to_u64() {
        assert_eq!(
            0x8000_0001_0012_0034_u64,
            Anchor {
                state: AnchorState::Full,
                tag: 1,
                avail: 0x12,
                count: 0x34,
            }
            .into(),
        );
        assert_eq!(
            0x4000_0000_0000_0000_u64,
            Anchor {
                state: AnchorState::Partial,
                tag: 0,
                avail: 0,
                count: 0,
            }
            .into(),
        );
    }

    #[test]
    fn round_trip_masks_overflow() {
        // a tag that outgrew its 30 Bits wraps instead of clobbering the
        // State-Bits
        let anchor = Anchor {
            state: AnchorState::Partial,
            tag: u32::MAX,
            avail: 3,
            count: 4,
        };
        let raw: u64 = anchor.into();
        let back = Anchor::from(raw);

        assert_eq!(AnchorState::Partial, back.state);
        assert_eq!(0x3fff_ffff, back.tag);
        assert_eq!(3, back.avail);
        assert_eq!(4, back.count);
    }
}
