//! Provides `PrioBitmap`, a one-word bit array supporting constant-time bit
//! scan operations.
use core::fmt;

use super::Init;

/// The number of bits stored in [`PrioBitmap`].
pub const PRIO_BITMAP_LEN: usize = u32::BITS as usize;

/// A bit array of [`PRIO_BITMAP_LEN`] entries. Bit `i` is set iff priority
/// level `i` has at least one entry.
///
/// All methods panic when the given bit position is out of range.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PrioBitmap {
    bits: u32,
}

impl Init for PrioBitmap {
    const INIT: Self = Self { bits: 0 };
}

impl fmt::Debug for PrioBitmap {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_list()
            .entries((0..PRIO_BITMAP_LEN).filter(|&i| self.get(i)))
            .finish()
    }
}

impl PrioBitmap {
    /// Get the bit at the specified position.
    #[inline]
    pub fn get(&self, i: usize) -> bool {
        assert!(i < PRIO_BITMAP_LEN);
        self.bits & (1 << i) != 0
    }

    /// Clear the bit at the specified position.
    #[inline]
    pub fn clear(&mut self, i: usize) {
        assert!(i < PRIO_BITMAP_LEN);
        self.bits &= !(1 << i);
    }

    /// Set the bit at the specified position.
    #[inline]
    pub fn set(&mut self, i: usize) {
        assert!(i < PRIO_BITMAP_LEN);
        self.bits |= 1 << i;
    }

    /// Get the position of the first set bit.
    #[inline]
    pub fn find_set(&self) -> Option<usize> {
        if self.bits == 0 {
            None
        } else {
            Some(self.bits.trailing_zeros() as usize)
        }
    }

    /// Check if any bit in `..end` is set.
    #[inline]
    pub fn any_below(&self, end: usize) -> bool {
        if end >= PRIO_BITMAP_LEN {
            self.bits != 0
        } else {
            self.bits & ((1 << end) - 1) != 0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;
    use std::collections::BTreeSet;

    struct BTreePrioBitmap(BTreeSet<usize>);

    impl BTreePrioBitmap {
        fn new() -> Self {
            Self(BTreeSet::new())
        }

        fn enum_set_bits(&self) -> Vec<usize> {
            self.0.iter().cloned().collect()
        }

        fn clear(&mut self, i: usize) {
            self.0.remove(&i);
        }

        fn set(&mut self, i: usize) {
            self.0.insert(i);
        }

        fn find_set(&self) -> Option<usize> {
            self.0.iter().next().cloned()
        }
    }

    /// A modifying operation on `PrioBitmap`.
    #[derive(Debug)]
    enum Cmd {
        Insert(usize),
        Remove(usize),
    }

    /// Map random bytes to operations on `PrioBitmap`.
    fn interpret(bytecode: &[u8], bitmap_len: usize) -> impl Iterator<Item = Cmd> + '_ {
        let mut i = 0;
        let mut known_set_bits = Vec::new();
        std::iter::from_fn(move || {
            if let Some(instr) = bytecode.get(i..i + 2) {
                i += 2;

                let value = instr[1] as usize;

                if instr[0] % 2 == 0 || known_set_bits.is_empty() {
                    let bit = value % bitmap_len;
                    known_set_bits.push(bit);
                    Some(Cmd::Insert(bit))
                } else {
                    let i = value % known_set_bits.len();
                    let bit = known_set_bits.swap_remove(i);
                    Some(Cmd::Remove(bit))
                }
            } else {
                None
            }
        })
    }

    fn enum_set_bits(bitmap: &PrioBitmap) -> Vec<usize> {
        (0..PRIO_BITMAP_LEN).filter(|&i| bitmap.get(i)).collect()
    }

    #[quickcheck]
    fn matches_btree_set(bytecode: Vec<u8>) {
        let mut subject = PrioBitmap::INIT;
        let mut reference = BTreePrioBitmap::new();

        for cmd in interpret(&bytecode, PRIO_BITMAP_LEN) {
            log::trace!("    {cmd:?}");
            match cmd {
                Cmd::Insert(bit) => {
                    subject.set(bit);
                    reference.set(bit);
                }
                Cmd::Remove(bit) => {
                    subject.clear(bit);
                    reference.clear(bit);
                }
            }

            assert_eq!(subject.find_set(), reference.find_set());
            for end in [0, 1, 5, 31, 32] {
                assert_eq!(
                    subject.any_below(end),
                    reference.0.range(..end).next().is_some()
                );
            }
        }

        assert_eq!(enum_set_bits(&subject), reference.enum_set_bits());
    }
}
