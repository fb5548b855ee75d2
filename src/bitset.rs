//! Taxon sets as packed bits, one bit per taxon rank.
//!
//! A branch of an unrooted tree splits the leaves in two; [`Bitset`] holds one
//! side. [`Bitset::canonical`] picks the side without taxon 0 so the same
//! split always has the same bits, whichever end of the branch it was read
//! from.
//!
//! # Example
//! ```
//! # use phylo_search::bitset::Bitset;
//! // taxa A B C D -> bits 0..4; the side {A, B} of ((A,B),(C,D))
//! let ab = Bitset::from_indices(4, [0, 1]);
//! assert!(!ab.is_trivial(4));
//! assert_eq!(ab.canonical(4), Bitset::from_indices(4, [2, 3]));
//! ```

use serde::{Deserialize, Serialize};

const WORD_BITS: usize = 64;

#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct Bitset(pub Vec<u64>);

impl Bitset {
    /// Words needed for `num_taxa` bits (at least one).
    pub fn words_for(num_taxa: usize) -> usize {
        num_taxa.div_ceil(WORD_BITS).max(1)
    }

    /// Empty set sized for `num_taxa`.
    pub fn empty(num_taxa: usize) -> Self {
        Bitset(vec![0; Self::words_for(num_taxa)])
    }

    pub fn from_indices(num_taxa: usize, indices: impl IntoIterator<Item = usize>) -> Self {
        let mut set = Self::empty(num_taxa);
        for i in indices {
            set.insert(i);
        }
        set
    }

    #[inline]
    pub fn insert(&mut self, idx: usize) {
        self.0[idx / WORD_BITS] |= 1 << (idx % WORD_BITS);
    }

    #[inline]
    pub fn contains(&self, idx: usize) -> bool {
        self.0.get(idx / WORD_BITS).is_some_and(|w| (w >> (idx % WORD_BITS)) & 1 == 1)
    }

    /// Add every taxon of `other`.
    #[inline]
    pub fn union_with(&mut self, other: &Bitset) {
        self.0.iter_mut().zip(&other.0).for_each(|(a, b)| *a |= b);
    }

    /// Number of taxa in the set.
    #[inline]
    pub fn len(&self) -> usize {
        self.0.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|&w| w == 0)
    }

    /// The other side of the split. Bits past `num_taxa` stay clear.
    pub fn complement(&self, num_taxa: usize) -> Bitset {
        let mut out = Bitset(self.0.iter().map(|w| !w).collect());
        let tail = num_taxa % WORD_BITS;
        if tail != 0 {
            if let Some(last) = out.0.last_mut() {
                *last &= (1 << tail) - 1;
            }
        }
        out
    }

    /// The side of the split that does not hold taxon 0.
    pub fn canonical(self, num_taxa: usize) -> Bitset {
        if self.contains(0) { self.complement(num_taxa) } else { self }
    }

    /// A split with a single taxon (or none) on one side. Every tree has these.
    pub fn is_trivial(&self, num_taxa: usize) -> bool {
        let n = self.len();
        n <= 1 || n + 1 >= num_taxa
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_contains() {
        let set = Bitset::from_indices(4, [0, 2]);
        assert_eq!(set.0, vec![0b0101]);
        assert!(set.contains(2));
        assert!(!set.contains(1));
        assert!(!set.contains(200));
    }

    #[test]
    fn test_union() {
        let mut left = Bitset::from_indices(4, [0, 1]);
        left.union_with(&Bitset::from_indices(4, [2, 3]));
        assert_eq!(left.0, vec![0b1111]);
        assert_eq!(left.len(), 4);
    }

    /// ```text
    ///   A           C
    ///    \         /
    ///     u ----- v
    ///    /         \
    ///   B           D
    /// ```
    /// Reading u-v from either end gives the same canonical side {C, D}.
    #[test]
    fn test_quartet_canonical_side() {
        let ab = Bitset::from_indices(4, [0, 1]);
        let cd = Bitset::from_indices(4, [2, 3]);
        assert_eq!(ab.complement(4), cd);
        assert_eq!(ab.clone().canonical(4), cd);
        assert_eq!(cd.clone().canonical(4), cd);
    }

    #[test]
    fn test_trivial_splits() {
        assert!(Bitset::from_indices(5, [3]).is_trivial(5));
        assert!(Bitset::from_indices(5, [1, 2, 3, 4]).is_trivial(5));
        assert!(!Bitset::from_indices(5, [3, 4]).is_trivial(5));
        assert!(Bitset::empty(5).is_empty());
    }

    #[test]
    fn test_spans_words() {
        let set = Bitset::from_indices(100, [0, 63, 64, 99]);
        assert_eq!(set.0.len(), 2);
        assert_eq!(set.0[0], 1u64 | (1u64 << 63));
        let other = set.complement(100);
        assert_eq!(other.len(), 96);
        assert!(!other.contains(99));
        assert!(other.contains(98));
    }
}
