//! # Minimal Perfect Hash Function (MPHF) Module
//!
//! This module implements a minimal perfect hash function over `u64` key sets
//! using the multi-level bit-array scheme of BBHash, as detailed in
//! [Fast and Scalable Minimal Perfect Hashing for Massive Key Sets](https://doi.org/10.4230/LIPIcs.SEA.2017.25).
//!
//! Keys are greedily assigned to 25 levels of shrinking bit domains: a key
//! claims a slot at the first level where its hash lands on a bit nobody else
//! claims; contested slots are released and all contenders retry one level
//! down. Keys still unplaced after the last level go to a small explicit
//! fallback table. Chained rank samples over the level bitsets turn a claimed
//! slot directly into a dense index in `[0, n)`.
//!
//! The serialized form is little-endian and field-exact, and can be exchanged
//! with the C++ implementation of the same structure: construction here and
//! loading there (or the reverse) yields identical lookup results.

use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::Path;

use binout::{AsIs, Serializer};

use crate::bits::BitVector;
use crate::hash::LevelHashes;

/// Default space/time tradeoff; per-level domains hold `gamma` bits per key.
pub const DEFAULT_GAMMA: f64 = 2.0;

/// Fixed number of construction levels.
const NB_LEVELS: usize = 25;

/// Estimated cost of one fallback entry in bits, for size diagnostics only.
const FALLBACK_ENTRY_BITS: u64 = 42 * 8;

/// Maps a raw hash into `[0, p)`.
#[inline]
fn fastrange64(word: u64, p: u64) -> u64 {
    if p == 0 {
        0
    } else {
        word % p
    }
}

/// Probability that a key shares its slot with at least one other key in a
/// domain of `gamma * nelem` bits.
fn proba_collision(gamma: f64, nelem: u64) -> f64 {
    let gn = gamma * nelem as f64;
    1.0 - ((gn - 1.0) / gn).powf(nelem.saturating_sub(1).max(1) as f64)
}

/// Bit-domain size of level `level`: the expected surviving fraction of the
/// base domain, rounded up to a non-zero multiple of 64.
fn level_hash_domain(hash_domain: u64, proba_collision: f64, level: u32) -> u64 {
    let raw = (hash_domain as f64 * proba_collision.powf(level as f64)).ceil() as u64;
    (raw.div_ceil(64) * 64).max(64)
}

/// One tier of the construction: a hash domain and the bits claimed in it.
#[derive(Clone, Debug)]
struct Level {
    hash_domain: u64,
    bitset: BitVector,
}

impl Level {
    #[inline]
    fn contains(&self, hash_raw: u64) -> bool {
        self.bitset.get(fastrange64(hash_raw, self.hash_domain))
    }
}

/// Walks the level-hash chain of `key` over the already-built `levels`.
/// Returns the hash for the next level if no built level claims the key,
/// `None` if some level does.
fn unplaced_hash(levels: &[Level], key: u64) -> Option<u64> {
    let mut hashes = LevelHashes::new(key);
    for level in levels {
        if level.contains(hashes.next_hash()) {
            return None;
        }
    }
    Some(hashes.next_hash())
}

/// Error returned when reading a serialized [`Mphf`].
#[derive(Debug)]
pub enum MphfError {
    /// I/O failure, including truncated input.
    Io(io::Error),
    /// A persisted level bitset disagrees with the hash domain re-derived
    /// from the header's `(gamma, nelem)`.
    LevelSizeMismatch {
        level: u32,
        expected: u64,
        actual: u64,
    },
}

impl fmt::Display for MphfError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MphfError::Io(e) => write!(f, "I/O error: {e}"),
            MphfError::LevelSizeMismatch { level, expected, actual } => write!(
                f,
                "level {level} bitset holds {actual} bits, header implies {expected}"
            ),
        }
    }
}

impl std::error::Error for MphfError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MphfError::Io(e) => Some(e),
            MphfError::LevelSizeMismatch { .. } => None,
        }
    }
}

impl From<io::Error> for MphfError {
    fn from(e: io::Error) -> Self {
        MphfError::Io(e)
    }
}

/// Observes construction progress.
pub trait BuildStatsCollector {
    /// Called after level `level` is populated, with the number of keys that
    /// reached it and the level's domain size in bits.
    fn level(&mut self, level: u32, keys: u64, hash_domain: u64);
    /// Called when construction completes, with the fallback table size.
    fn end(&mut self, fallback_keys: u64);
}

/// Collects nothing.
impl BuildStatsCollector for () {
    fn level(&mut self, _level: u32, _keys: u64, _hash_domain: u64) {}
    fn end(&mut self, _fallback_keys: u64) {}
}

/// Prints per-level statistics to stdout.
#[derive(Clone, Copy, Debug, Default)]
pub struct BuildStatsPrinter;

impl BuildStatsCollector for BuildStatsPrinter {
    fn level(&mut self, level: u32, keys: u64, hash_domain: u64) {
        println!("level {level}: {keys} keys over {hash_domain} bits");
    }

    fn end(&mut self, fallback_keys: u64) {
        println!("fallback table: {fallback_keys} keys");
    }
}

/// A minimal perfect hash function over a fixed set of distinct `u64` keys.
///
/// Built once from a key slice; immutable afterwards, so a shared reference
/// can serve lookups from any number of threads.
#[derive(Clone, Debug)]
pub struct Mphf {
    gamma: f64,
    nelem: u64,
    levels: Vec<Level>,
    /// Key to dense index, in discovery order. The order is part of the
    /// serialized form, so this stays a vector of pairs rather than a map.
    final_hash: Vec<(u64, u64)>,
    /// Set bits across all levels; index offset for fallback entries.
    lastbitsetrank: u64,
}

impl Mphf {
    /// Builds the function for `keys` with the given `gamma` (bits per key
    /// per level, `> 0`; 1.0 to 2.0 is the useful range).
    ///
    /// Keys must be distinct; the minimal-perfect guarantee does not hold for
    /// multisets. An empty slice yields a valid function whose lookups all
    /// return `None`.
    ///
    /// # Panics
    ///
    /// Panics if `gamma <= 0`.
    pub fn from_slice(keys: &[u64], gamma: f64) -> Self {
        Self::from_slice_with_stats(keys, gamma, &mut ())
    }

    /// Like [`Mphf::from_slice`], reporting per-level statistics to `stats`.
    pub fn from_slice_with_stats(
        keys: &[u64],
        gamma: f64,
        stats: &mut impl BuildStatsCollector,
    ) -> Self {
        assert!(gamma > 0.0, "gamma must be positive, got {gamma}");
        let nelem = keys.len() as u64;
        if nelem == 0 {
            return Mphf {
                gamma,
                nelem: 0,
                levels: Vec::new(),
                final_hash: Vec::new(),
                lastbitsetrank: 0,
            };
        }

        let hash_domain = (nelem as f64 * gamma).ceil() as u64;
        let proba = proba_collision(gamma, nelem);
        let mut levels: Vec<Level> = Vec::with_capacity(NB_LEVELS);
        let mut final_hash = Vec::new();
        let mut offset = 0;

        for i in 0..NB_LEVELS as u32 {
            let domain = level_hash_domain(hash_domain, proba, i);
            let mut bitset = BitVector::new(domain);
            let mut keys_in = 0u64;

            if i as usize == NB_LEVELS - 1 {
                // Last level: whatever is left goes to the fallback table,
                // indexed densely in encounter order.
                for &key in keys {
                    if unplaced_hash(&levels, key).is_some() {
                        final_hash.push((key, final_hash.len() as u64));
                        keys_in += 1;
                    }
                }
            } else {
                let mut collisions = BitVector::new(domain);
                for &key in keys {
                    if let Some(hash) = unplaced_hash(&levels, key) {
                        keys_in += 1;
                        let slot = fastrange64(hash, domain);
                        if bitset.test_and_set(slot) {
                            collisions.set(slot);
                        }
                    }
                }
                bitset.clear_collisions(&collisions);
            }

            offset = bitset.build_ranks(offset);
            stats.level(i, keys_in, domain);
            levels.push(Level { hash_domain: domain, bitset });
        }

        stats.end(final_hash.len() as u64);
        Mphf { gamma, nelem, levels, final_hash, lastbitsetrank: offset }
    }

    /// Returns the index associated with `key`, within 0 to the build key
    /// count (exclusive), or `None`.
    ///
    /// For keys of the build set the result is their unique index. For any
    /// other key the result is unspecified: it may be `None` or alias a build
    /// key's index, and neither outcome is detectable as an error.
    pub fn lookup(&self, key: u64) -> Option<u64> {
        let (_, probed) = self.levels.split_last()?;
        let mut hashes = LevelHashes::new(key);
        for level in probed {
            let slot = fastrange64(hashes.next_hash(), level.hash_domain);
            if level.bitset.get(slot) {
                return Some(level.bitset.rank(slot));
            }
        }
        self.final_hash
            .iter()
            .find(|&&(k, _)| k == key)
            .map(|&(_, index)| index + self.lastbitsetrank)
    }

    /// Number of keys the function was built over.
    #[inline]
    pub fn nb_keys(&self) -> u64 {
        self.nelem
    }

    /// Number of construction levels (25, or 0 for an empty function).
    #[inline]
    pub fn nb_levels(&self) -> u32 {
        self.levels.len() as u32
    }

    /// The gamma the function was built with.
    #[inline]
    pub fn gamma(&self) -> f64 {
        self.gamma
    }

    /// Estimated total size in bits: level bitsets with their rank samples,
    /// plus a flat per-entry charge for the fallback table. Diagnostic only.
    pub fn total_bit_size(&self) -> u64 {
        self.levels.iter().map(|l| l.bitset.bit_size()).sum::<u64>()
            + self.final_hash.len() as u64 * FALLBACK_ENTRY_BITS
    }

    /// Writes `self` to `output` in the serialized format:
    /// `gamma: f64, nb_levels: u32, lastbitsetrank: u64, nelem: u64`, then one
    /// bit-vector block per level, then the fallback table as a `u64` count
    /// followed by `(key, index)` pairs in discovery order. All fields are
    /// little-endian.
    pub fn write(&self, output: &mut dyn io::Write) -> io::Result<()> {
        // gamma travels as its IEEE 754 bits; same bytes as a raw double
        AsIs::write(output, self.gamma.to_bits())?;
        AsIs::write(output, self.levels.len() as u32)?;
        AsIs::write(output, self.lastbitsetrank)?;
        AsIs::write(output, self.nelem)?;
        for level in &self.levels {
            level.bitset.write(output)?;
        }
        AsIs::write(output, self.final_hash.len() as u64)?;
        for &(key, index) in &self.final_hash {
            AsIs::write(output, key)?;
            AsIs::write(output, index)?;
        }
        Ok(())
    }

    /// Reads a function previously produced by [`Mphf::write`].
    ///
    /// Level hash domains are not persisted; they are re-derived from the
    /// header's `(gamma, nelem)` and checked against the persisted bitset
    /// sizes, so a header inconsistent with its level blocks is rejected
    /// instead of yielding a silently corrupt structure.
    pub fn read(input: &mut dyn io::Read) -> Result<Self, MphfError> {
        let gamma = f64::from_bits(AsIs::read(input)?);
        let nb_levels: u32 = AsIs::read(input)?;
        let lastbitsetrank: u64 = AsIs::read(input)?;
        let nelem: u64 = AsIs::read(input)?;

        let (hash_domain, proba) = if nelem == 0 {
            (0, 0.0)
        } else {
            ((nelem as f64 * gamma).ceil() as u64, proba_collision(gamma, nelem))
        };

        let mut levels = Vec::with_capacity(nb_levels.min(NB_LEVELS as u32) as usize);
        for i in 0..nb_levels {
            let bitset = BitVector::read(input)?;
            let domain = level_hash_domain(hash_domain, proba, i);
            if bitset.size() != domain {
                return Err(MphfError::LevelSizeMismatch {
                    level: i,
                    expected: domain,
                    actual: bitset.size(),
                });
            }
            levels.push(Level { hash_domain: domain, bitset });
        }

        let final_count: u64 = AsIs::read(input)?;
        let mut final_hash = Vec::new();
        for _ in 0..final_count {
            let key: u64 = AsIs::read(input)?;
            let index: u64 = AsIs::read(input)?;
            final_hash.push((key, index));
        }

        Ok(Mphf { gamma, nelem, levels, final_hash, lastbitsetrank })
    }

    /// Saves the serialized form to a file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let mut output = BufWriter::new(File::create(path)?);
        self.write(&mut output)?;
        output.flush()
    }

    /// Loads a function saved with [`Mphf::save`].
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, MphfError> {
        let mut input = BufReader::new(File::open(path)?);
        Self::read(&mut input)
    }
}
