//! Packed bit vector with block-sampled rank support.
//!
//! `BitVector` backs one construction level each: bits are claimed while keys
//! are scanned, then [`BitVector::build_ranks`] freezes a sampled prefix
//! popcount (one `u64` sample per 512-bit block, roughly 12.5% overhead on top
//! of the payload) and the vector is read-only from then on. Rank samples
//! continue from a caller-supplied offset so the vectors of consecutive levels
//! chain into one global numbering.
//!
//! The serialized layout is little-endian and field-exact:
//! `size: u64, word_count: u64, word_count x u64, rank_count: u64,
//! rank_count x u64`. A vector of `size > 0` bits carries `1 + size/64` words;
//! the spare word stays zero and is part of the format.

use std::io;

use binout::{AsIs, Serializer};

/// Width of one rank sample block, in bits.
const BITS_PER_RANK_SAMPLE: u64 = 512;

/// Bits per storage word.
const WORD_BITS: u64 = 64;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BitVector {
    size: u64,
    words: Box<[u64]>,
    ranks: Vec<u64>,
}

impl BitVector {
    /// Creates an all-zero vector of `size` bits.
    pub fn new(size: u64) -> Self {
        BitVector {
            size,
            words: vec![0u64; Self::word_count_for(size)].into_boxed_slice(),
            ranks: Vec::new(),
        }
    }

    fn word_count_for(size: u64) -> usize {
        if size == 0 {
            0
        } else {
            (1 + size / WORD_BITS) as usize
        }
    }

    /// Number of addressable bits.
    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Returns the bit at `pos`; positions past the end read as unset.
    #[inline]
    pub fn get(&self, pos: u64) -> bool {
        if pos >= self.size {
            return false;
        }
        (self.words[(pos >> 6) as usize] >> (pos & 63)) & 1 != 0
    }

    /// Sets the bit at `pos`.
    #[inline]
    pub fn set(&mut self, pos: u64) {
        self.words[(pos >> 6) as usize] |= 1u64 << (pos & 63);
    }

    /// Clears the bit at `pos`.
    #[inline]
    pub fn reset(&mut self, pos: u64) {
        self.words[(pos >> 6) as usize] &= !(1u64 << (pos & 63));
    }

    /// Sets the bit at `pos` and returns its previous value.
    ///
    /// This is the builder's "first claim or collision" probe. It is a plain
    /// sequential read-modify-write; the construction scan is single-threaded
    /// and its key iteration order decides which key claims a contested slot.
    #[inline]
    pub fn test_and_set(&mut self, pos: u64) -> bool {
        let word = &mut self.words[(pos >> 6) as usize];
        let mask = 1u64 << (pos & 63);
        let old = *word & mask != 0;
        *word |= mask;
        old
    }

    /// Clears every bit that is set in `collisions`.
    ///
    /// After a level scan, slots claimed by two or more keys are marked in the
    /// collision vector; removing them here makes all contenders fall through
    /// to the next level.
    pub fn clear_collisions(&mut self, collisions: &BitVector) {
        for (word, collided) in self.words.iter_mut().zip(collisions.words.iter()) {
            *word &= !collided;
        }
    }

    /// Number of set bits.
    pub fn count_ones(&self) -> u64 {
        self.words.iter().map(|w| w.count_ones() as u64).sum()
    }

    /// Populates the rank samples, counting from `offset`, and returns the
    /// cumulative count after this vector (`offset` plus own popcount).
    pub fn build_ranks(&mut self, offset: u64) -> u64 {
        let mut ranks = Vec::with_capacity((2 + self.size / BITS_PER_RANK_SAMPLE) as usize);
        let mut current_rank = offset;
        for (i, word) in self.words.iter().enumerate() {
            if (i as u64 * WORD_BITS) % BITS_PER_RANK_SAMPLE == 0 {
                ranks.push(current_rank);
            }
            current_rank += word.count_ones() as u64;
        }
        self.ranks = ranks;
        current_rank
    }

    /// Number of set bits strictly before `pos`, counted from the offset given
    /// to [`BitVector::build_ranks`]. `pos` is clamped to the last bit.
    pub fn rank(&self, pos: u64) -> u64 {
        if self.size == 0 {
            return 0;
        }
        let pos = pos.min(self.size - 1);
        let word_idx = (pos / WORD_BITS) as usize;
        let block = (pos / BITS_PER_RANK_SAMPLE) as usize;
        let mut r = self.ranks.get(block).copied().unwrap_or(0);
        for w in block * (BITS_PER_RANK_SAMPLE / WORD_BITS) as usize..word_idx {
            r += self.words[w].count_ones() as u64;
        }
        let mask = (1u64 << (pos % WORD_BITS)) - 1;
        r + (self.words[word_idx] & mask).count_ones() as u64
    }

    /// Storage footprint in bits: payload words plus rank samples.
    pub fn bit_size(&self) -> u64 {
        (self.words.len() + self.ranks.len()) as u64 * WORD_BITS
    }

    /// Writes the vector in its serialized layout.
    pub fn write(&self, output: &mut dyn io::Write) -> io::Result<()> {
        AsIs::write(output, self.size)?;
        AsIs::write(output, self.words.len() as u64)?;
        AsIs::write_all(output, self.words.iter())?;
        AsIs::write(output, self.ranks.len() as u64)?;
        AsIs::write_all(output, self.ranks.iter())
    }

    /// Reads a vector previously produced by [`BitVector::write`].
    ///
    /// Fails with [`io::ErrorKind::UnexpectedEof`] on truncated input and with
    /// [`io::ErrorKind::InvalidData`] if the word count does not match the bit
    /// size.
    pub fn read(input: &mut dyn io::Read) -> io::Result<Self> {
        let size: u64 = AsIs::read(input)?;
        let word_count: u64 = AsIs::read(input)?;
        if word_count != Self::word_count_for(size) as u64 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("bit vector of {size} bits cannot span {word_count} words"),
            ));
        }
        let words: Box<[u64]> = AsIs::read_n(input, word_count as usize)?;
        let rank_count: u64 = AsIs::read(input)?;
        if rank_count > word_count {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("rank sample count {rank_count} exceeds word count {word_count}"),
            ));
        }
        let ranks: Box<[u64]> = AsIs::read_n(input, rank_count as usize)?;
        Ok(BitVector { size, words, ranks: ranks.into_vec() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitvec::order::Lsb0;
    use bitvec::vec::BitVec;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn test_get_set_reset() {
        let mut bv = BitVector::new(130);
        assert!(!bv.get(0));
        bv.set(0);
        bv.set(64);
        bv.set(129);
        assert!(bv.get(0));
        assert!(bv.get(64));
        assert!(bv.get(129));
        assert!(!bv.get(1));
        bv.reset(64);
        assert!(!bv.get(64));
        // out of range reads as unset
        assert!(!bv.get(130));
        assert!(!bv.get(u64::MAX));
    }

    #[test]
    fn test_test_and_set() {
        let mut bv = BitVector::new(64);
        assert!(!bv.test_and_set(7));
        assert!(bv.test_and_set(7));
        assert!(bv.get(7));
        assert_eq!(bv.count_ones(), 1);
    }

    #[test]
    fn test_word_count_has_spare_word() {
        assert_eq!(BitVector::new(0).words.len(), 0);
        assert_eq!(BitVector::new(1).words.len(), 1);
        assert_eq!(BitVector::new(64).words.len(), 2);
        assert_eq!(BitVector::new(512).words.len(), 9);
    }

    #[test]
    fn test_rank_against_oracle() {
        let mut rng = ChaCha8Rng::seed_from_u64(123);
        let size = 5000u64;
        let mut bv = BitVector::new(size);
        let mut oracle = BitVec::<u64, Lsb0>::repeat(false, size as usize);
        for pos in 0..size {
            if rng.gen::<bool>() {
                bv.set(pos);
                oracle.set(pos as usize, true);
            }
        }
        let total = bv.build_ranks(0);
        assert_eq!(total, oracle.count_ones() as u64);
        for pos in 0..size {
            assert_eq!(
                bv.rank(pos),
                oracle[..pos as usize].count_ones() as u64,
                "rank mismatch at {}",
                pos
            );
        }
    }

    #[test]
    fn test_rank_clamps_past_the_end() {
        let mut bv = BitVector::new(100);
        bv.set(0);
        bv.set(99);
        bv.build_ranks(0);
        assert_eq!(bv.rank(u64::MAX), bv.rank(99));
        assert_eq!(bv.rank(99), 1);
    }

    #[test]
    fn test_build_ranks_chains_offsets() {
        let mut first = BitVector::new(512);
        for pos in [0, 100, 511] {
            first.set(pos);
        }
        let mut second = BitVector::new(512);
        second.set(3);

        let offset = first.build_ranks(0);
        assert_eq!(offset, 3);
        let total = second.build_ranks(offset);
        assert_eq!(total, 4);
        // ranks of the second vector continue the numbering of the first
        assert_eq!(second.rank(3), 3);
        assert_eq!(second.rank(4), 4);
    }

    #[test]
    fn test_clear_collisions() {
        let mut bv = BitVector::new(128);
        let mut collisions = BitVector::new(128);
        for pos in [1, 2, 70, 100] {
            bv.set(pos);
        }
        collisions.set(2);
        collisions.set(100);
        bv.clear_collisions(&collisions);
        assert!(bv.get(1));
        assert!(!bv.get(2));
        assert!(bv.get(70));
        assert!(!bv.get(100));
        assert_eq!(bv.count_ones(), 2);
    }

    #[test]
    fn test_write_read_round_trip() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let mut bv = BitVector::new(1600);
        for pos in 0..1600 {
            if rng.gen_ratio(1, 3) {
                bv.set(pos);
            }
        }
        bv.build_ranks(10);

        let mut buff = Vec::new();
        bv.write(&mut buff).unwrap();
        // size, word_count, words, rank_count, ranks
        assert_eq!(
            buff.len(),
            8 + 8 + 8 * bv.words.len() + 8 + 8 * bv.ranks.len()
        );
        let read = BitVector::read(&mut &buff[..]).unwrap();
        assert_eq!(read, bv);
    }

    #[test]
    fn test_read_rejects_inconsistent_word_count() {
        let mut buff = Vec::new();
        buff.extend_from_slice(&64u64.to_le_bytes()); // size
        buff.extend_from_slice(&1u64.to_le_bytes()); // word_count, should be 2
        buff.extend_from_slice(&0u64.to_le_bytes());
        assert_eq!(
            BitVector::read(&mut &buff[..]).unwrap_err().kind(),
            io::ErrorKind::InvalidData
        );
    }

    #[test]
    fn test_read_fails_on_truncated_input() {
        let mut bv = BitVector::new(256);
        bv.set(17);
        bv.build_ranks(0);
        let mut buff = Vec::new();
        bv.write(&mut buff).unwrap();
        for cut in [0, 7, 8, 16, 20, buff.len() - 1] {
            assert!(
                BitVector::read(&mut &buff[..cut]).is_err(),
                "prefix of {} bytes must not parse",
                cut
            );
        }
    }
}
