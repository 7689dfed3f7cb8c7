//! Hardware slot occupancy bitmap
//!
//! One bit per hardware MPU slot, set while the slot is claimed. Bits past
//! the real slot count are set at construction so they are never handed out.
//! The search always starts at slot 0, which biases reuse toward low slots.

#![deny(missing_docs)]

use super::MAX_HW_SLOTS;

const WORD_BITS: usize = u64::BITS as usize;

/// Words needed to cover [`MAX_HW_SLOTS`]
pub const BITMAP_WORDS: usize = MAX_HW_SLOTS.div_ceil(WORD_BITS);

/// Slot occupancy bitmap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotBitmap {
    words: [u64; BITMAP_WORDS],
}

impl SlotBitmap {
    /// Bitmap for `slots` usable slots, all free
    // `slot < MAX_HW_SLOTS` keeps every word index below `BITMAP_WORDS`.
    #[allow(clippy::indexing_slicing)]
    pub const fn new(slots: usize) -> Self {
        let mut words = [!0u64; BITMAP_WORDS];
        let mut slot = 0;
        while slot < slots && slot < MAX_HW_SLOTS {
            words[slot / WORD_BITS] &= !(1 << (slot % WORD_BITS));
            slot += 1;
        }
        Self { words }
    }

    /// Lowest free slot: first word that is not all ones, then its lowest
    /// clear bit
    #[inline]
    pub fn find_free(&self) -> Option<usize> {
        self.words
            .iter()
            .enumerate()
            .find(|(_, w)| **w != !0)
            .map(|(i, w)| i * WORD_BITS + w.trailing_ones() as usize)
    }

    /// Claim `slot`
    #[inline]
    pub fn set(&mut self, slot: usize) {
        if let Some(w) = self.words.get_mut(slot / WORD_BITS) {
            *w |= 1 << (slot % WORD_BITS);
        }
    }

    /// Release `slot`
    #[inline]
    pub fn clear(&mut self, slot: usize) {
        if let Some(w) = self.words.get_mut(slot / WORD_BITS) {
            *w &= !(1 << (slot % WORD_BITS));
        }
    }

    /// Whether `slot` is claimed (slots past the end always are)
    #[inline]
    pub fn is_set(&self, slot: usize) -> bool {
        self.words
            .get(slot / WORD_BITS)
            .is_none_or(|w| w & (1 << (slot % WORD_BITS)) != 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lowest_free_slot_first() {
        let mut map = SlotBitmap::new(8);
        assert_eq!(map.find_free(), Some(0));
        map.set(0);
        map.set(1);
        map.set(3);
        assert_eq!(map.find_free(), Some(2));
        map.clear(0);
        assert_eq!(map.find_free(), Some(0));
    }

    #[test]
    fn slots_past_the_end_never_returned() {
        let mut map = SlotBitmap::new(2);
        map.set(0);
        map.set(1);
        assert_eq!(map.find_free(), None);
        assert!(map.is_set(2));
        assert!(map.is_set(MAX_HW_SLOTS + 5));
    }

    #[test]
    fn search_crosses_word_boundary() {
        let mut map = SlotBitmap::new(MAX_HW_SLOTS);
        for slot in 0..64 {
            map.set(slot);
        }
        assert_eq!(map.find_free(), Some(64));
    }
}
