use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::DWB_MAX_BLOCKS;

const POSITION_MASK: u64 = 0x0000_0000_ffff_ffff;
const BLOCKS_STATUS_SHIFT: u32 = 56;
const MODIFY_STRUCTURE: u64 = 1 << 55;
const CREATE: u64 = 1 << 54;

/// Decoded form of the global double-write state word.
///
/// The word packs the next linear slot position in its low 32 bits,
/// one "write started" bit per block (block `n` owns bit `63 - n`),
/// a structure-modification bit (55) and a created bit (54). Every
/// state change goes through [`AtomicPosition::compare_exchange`],
/// so all of these move together or not at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct Position {
    pub position: u32,
    pub blocks_writing: u8,
    pub modifying_structure: bool,
    pub created: bool,
}

const fn block_bit(block_no: usize) -> u8 {
    1 << (DWB_MAX_BLOCKS - 1 - block_no)
}

impl Position {
    pub fn from_word(word: u64) -> Position {
        Position {
            position: (word & POSITION_MASK) as u32,
            blocks_writing: (word >> BLOCKS_STATUS_SHIFT) as u8,
            modifying_structure: word & MODIFY_STRUCTURE != 0,
            created: word & CREATE != 0,
        }
    }

    pub fn to_word(self) -> u64 {
        let mut word = u64::from(self.position);
        word |= u64::from(self.blocks_writing) << BLOCKS_STATUS_SHIFT;
        if self.modifying_structure {
            word |= MODIFY_STRUCTURE;
        }
        if self.created {
            word |= CREATE;
        }
        word
    }

    pub fn is_block_writing(&self, block_no: usize) -> bool {
        debug_assert!(block_no < DWB_MAX_BLOCKS);
        self.blocks_writing & block_bit(block_no) != 0
    }

    pub fn starts_block_writing(mut self, block_no: usize) -> Position {
        debug_assert!(!self.is_block_writing(block_no));
        self.blocks_writing |= block_bit(block_no);
        self
    }

    pub fn ends_block_writing(mut self, block_no: usize) -> Position {
        debug_assert!(self.is_block_writing(block_no));
        self.blocks_writing &= !block_bit(block_no);
        self
    }

    pub fn block_no(&self, log2_block_pages: u32) -> usize {
        (self.position >> log2_block_pages) as usize
    }

    pub fn position_in_block(&self, block_pages: usize) -> usize {
        self.position as usize & (block_pages - 1)
    }

    /// Advances to the next slot, wrapping to the start of the ring.
    pub fn advance(mut self, num_pages: usize) -> Position {
        let next = self.position as usize + 1;
        self.position = if next == num_pages { 0 } else { next as u32 };
        self
    }

    pub fn reset(mut self) -> Position {
        self.position = 0;
        self
    }
}

#[derive(Debug, Default)]
pub(crate) struct AtomicPosition(AtomicU64);

impl AtomicPosition {
    pub fn load(&self) -> Position {
        Position::from_word(self.0.load(Ordering::Acquire))
    }

    /// Installs `new` if the word still equals `current`, otherwise
    /// returns the value that was found.
    pub fn compare_exchange(
        &self,
        current: Position,
        new: Position,
    ) -> Result<Position, Position> {
        self.0
            .compare_exchange(
                current.to_word(),
                new.to_word(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(Position::from_word)
            .map_err(Position::from_word)
    }

    /// Applies `f` in a CAS loop until it sticks, returning the
    /// installed value. `f` may refuse by returning `None`.
    pub fn fetch_update<F>(&self, mut f: F) -> Result<Position, Position>
    where
        F: FnMut(Position) -> Option<Position>,
    {
        let mut current = self.load();
        loop {
            let new = match f(current) {
                Some(new) => new,
                None => return Err(current),
            };
            match self.compare_exchange(current, new) {
                Ok(_) => return Ok(new),
                Err(actual) => current = actual,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use quickcheck::{Arbitrary, Gen, QuickCheck};

    use super::*;

    impl Arbitrary for Position {
        fn arbitrary(g: &mut Gen) -> Position {
            Position {
                position: u32::arbitrary(g),
                blocks_writing: u8::arbitrary(g),
                modifying_structure: bool::arbitrary(g),
                created: bool::arbitrary(g),
            }
        }
    }

    fn prop_word_round_trip(position: Position) -> bool {
        Position::from_word(position.to_word()) == position
    }

    #[test]
    fn word_round_trip() {
        QuickCheck::new()
            .tests(1000)
            .quickcheck(prop_word_round_trip as fn(Position) -> bool);
    }

    #[test]
    fn matches_packed_layout() {
        let p = Position {
            position: 5,
            blocks_writing: 0,
            modifying_structure: false,
            created: true,
        }
        .starts_block_writing(0)
        .starts_block_writing(2);

        assert_eq!(
            p.to_word(),
            (1 << 63) | (1 << 61) | (1 << 54) | 5,
        );

        let p = Position { modifying_structure: true, ..p };
        assert_eq!(p.to_word() & (1 << 55), 1 << 55);
    }

    #[test]
    fn block_arithmetic() {
        // 8 blocks of 4 pages
        let p = Position { position: 13, created: true, ..Default::default() };
        assert_eq!(p.block_no(2), 3);
        assert_eq!(p.position_in_block(4), 1);

        let last = Position { position: 31, ..p };
        assert_eq!(last.advance(32).position, 0);
    }

    #[test]
    fn cas_rejects_stale_view() {
        let atomic = AtomicPosition::default();
        let seen = atomic.load();
        let created = Position { created: true, ..seen };
        assert!(atomic.compare_exchange(seen, created).is_ok());
        assert_eq!(atomic.compare_exchange(seen, created), Err(created));
    }
}
