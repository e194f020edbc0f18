//! Salted canonical k-mer hashing and the two sparse selectors built on
//! it: the modimizer iterator (hash divisible by w) and the minimizer
//! iterator (window minimum). Both roll a forward and a reverse
//! complement word across the sequence and pick the strand whose salted
//! hash is smaller, so the same k-mer from either strand maps onto one
//! identity.

use crate::new_types::twobit::seq_string;
use anyhow::{ensure, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use std::io::{Read, Write};

pub const SEQHASH_MAGIC: &[u8; 8] = b"SQHSHv2\0";

/// Immutable hashing parameters. `factor1` is an odd 64-bit multiplier
/// derived reproducibly from `seed`, so multiplication is a bijection on
/// the low 2k bits and `(x * factor1) >> shift1` is a salted permutation
/// of the k-mer space.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Seqhash {
    pub seed: i32,
    pub k: i32,
    pub w: i32,
    pub mask: u64,
    pub shift1: i32,
    pub factor1: u64,
    pub pattern_rc: [u64; 4],
}

impl Seqhash {
    pub fn new(k: i32, w: i32, seed: i32) -> Result<Self> {
        ensure!((1..=31).contains(&k), "seqhash k {} must be between 1 and 31", k);
        ensure!(w >= 1, "seqhash w {} must be positive", w);
        let mut rng = StdRng::seed_from_u64(seed as u64);
        let factor1 = ((rng.next_u32() as u64) << 32) | rng.next_u32() as u64 | 0x1;
        let mut pattern_rc = [0u64; 4];
        for (b, p) in pattern_rc.iter_mut().enumerate() {
            *p = (3 - b as u64) << (2 * (k - 1));
        }
        Ok(Seqhash {
            seed,
            k,
            w,
            mask: (1u64 << (2 * k)) - 1,
            shift1: 64 - 2 * k,
            factor1,
            pattern_rc,
        })
    }

    /// The salted hash of a 2-bit k-mer word.
    #[inline(always)]
    pub fn hash(&self, kmer: u64) -> u64 {
        kmer.wrapping_mul(self.factor1) >> self.shift1
    }

    /// Hash compatibility: same k-mer space and the same permutation.
    pub fn compatible(&self, other: &Seqhash) -> bool {
        self.k == other.k && self.w == other.w && self.factor1 == other.factor1
    }

    pub fn kmer_string(&self, kmer: u64) -> String {
        seq_string(kmer, self.k as usize)
    }

    pub fn report(&self, out: &mut dyn Write) -> Result<()> {
        writeln!(out, "SH k {}  w/m {}  s {}", self.k, self.w, self.seed)?;
        Ok(())
    }

    pub fn write(&self, out: &mut dyn Write) -> Result<()> {
        out.write_all(SEQHASH_MAGIC)?;
        out.write_i32::<LittleEndian>(self.seed)?;
        out.write_i32::<LittleEndian>(self.k)?;
        out.write_i32::<LittleEndian>(self.w)?;
        out.write_u64::<LittleEndian>(self.mask)?;
        out.write_i32::<LittleEndian>(self.shift1)?;
        out.write_u64::<LittleEndian>(self.factor1)?;
        for p in &self.pattern_rc {
            out.write_u64::<LittleEndian>(*p)?;
        }
        Ok(())
    }

    pub fn read(inp: &mut dyn Read) -> Result<Self> {
        let mut magic = [0u8; 8];
        inp.read_exact(&mut magic)?;
        ensure!(&magic == SEQHASH_MAGIC, "seqhash header mismatch");
        let seed = inp.read_i32::<LittleEndian>()?;
        let k = inp.read_i32::<LittleEndian>()?;
        let w = inp.read_i32::<LittleEndian>()?;
        let mask = inp.read_u64::<LittleEndian>()?;
        let shift1 = inp.read_i32::<LittleEndian>()?;
        let factor1 = inp.read_u64::<LittleEndian>()?;
        let mut pattern_rc = [0u64; 4];
        for p in pattern_rc.iter_mut() {
            *p = inp.read_u64::<LittleEndian>()?;
        }
        ensure!((1..=31).contains(&k) && w >= 1, "corrupt seqhash parameters");
        Ok(Seqhash {
            seed,
            k,
            w,
            mask,
            shift1,
            factor1,
            pattern_rc,
        })
    }
}

/// One modimizer: the 2-bit word of the canonical orientation, the index
/// of the k-mer's first base, and which strand won.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ModHit {
    pub kmer: u64,
    pub pos: u32,
    pub is_forward: bool,
}

/// Rolling modimizer scan. Borrows the 2-bit sequence; lazy, finite,
/// not restartable.
pub struct ModIter<'a> {
    sh: &'a Seqhash,
    seq: &'a [u8],
    i: usize, // next base to consume
    pos: u32, // first base of the current k-mer
    h: u64,
    h_rc: u64,
    is_f: bool,
    hash: u64,
    is_done: bool,
}

impl<'a> ModIter<'a> {
    pub fn new(sh: &'a Seqhash, seq: &'a [u8]) -> Self {
        let k = sh.k as usize;
        let mut it = ModIter {
            sh,
            seq,
            i: 0,
            pos: 0,
            h: 0,
            h_rc: 0,
            is_f: true,
            hash: 0,
            is_done: seq.len() < k,
        };
        if !it.is_done {
            for _ in 0..k {
                let b = (it.seq[it.i] & 3) as u64;
                it.h = (it.h << 2) | b;
                it.h_rc = (it.h_rc >> 2) | it.sh.pattern_rc[b as usize];
                it.i += 1;
            }
            it.rehash();
            it.settle();
        }
        it
    }

    #[inline(always)]
    fn rehash(&mut self) {
        let hash_f = self.sh.hash(self.h);
        let hash_r = self.sh.hash(self.h_rc);
        if hash_f < hash_r {
            self.is_f = true;
            self.hash = hash_f;
        } else {
            self.is_f = false;
            self.hash = hash_r;
        }
    }

    #[inline(always)]
    fn step(&mut self) {
        let b = (self.seq[self.i] & 3) as u64;
        self.h = ((self.h << 2) & self.sh.mask) | b;
        self.h_rc = (self.h_rc >> 2) | self.sh.pattern_rc[b as usize];
        self.i += 1;
        self.pos += 1;
        self.rehash();
    }

    /// Advance until the canonical hash divides by w or the sequence ends.
    fn settle(&mut self) {
        let w = self.sh.w as u64;
        while self.hash % w != 0 {
            if self.i >= self.seq.len() {
                self.is_done = true;
                return;
            }
            self.step();
        }
    }
}

impl<'a> Iterator for ModIter<'a> {
    type Item = ModHit;

    fn next(&mut self) -> Option<ModHit> {
        if self.is_done {
            return None;
        }
        let hit = ModHit {
            kmer: if self.is_f { self.h } else { self.h_rc },
            pos: self.pos,
            is_forward: self.is_f,
        };
        if self.i >= self.seq.len() {
            self.is_done = true;
        } else {
            self.step();
            self.settle();
        }
        Some(hit)
    }
}

/// One minimizer: the canonical hash that was minimal in its window,
/// with position and strand. Note this carries the hash, not the word;
/// the word left the rolling state long before the minimum is decided.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MinHit {
    pub hash: u64,
    pub pos: u32,
    pub is_forward: bool,
}

/// Window-minimum scan over w consecutive canonical hashes. Each window
/// minimum is emitted exactly once, leftmost occurrence winning ties.
pub struct MinimizerIter<'a> {
    sh: &'a Seqhash,
    seq: &'a [u8],
    i: usize,
    h: u64,
    h_rc: u64,
    hash_buf: Vec<u64>,
    f_buf: Vec<bool>,
    base: usize,
    i_start: usize,
    i_min: usize,
    is_done: bool,
}

impl<'a> MinimizerIter<'a> {
    pub fn new(sh: &'a Seqhash, seq: &'a [u8]) -> Self {
        let k = sh.k as usize;
        let w = sh.w as usize;
        let mut it = MinimizerIter {
            sh,
            seq,
            i: 0,
            h: 0,
            h_rc: 0,
            hash_buf: vec![0; w],
            f_buf: vec![false; w],
            base: 0,
            i_start: 0,
            i_min: 0,
            is_done: seq.len() < k,
        };
        if it.is_done {
            return it;
        }
        for _ in 0..k {
            let b = (it.seq[it.i] & 3) as u64;
            it.h = (it.h << 2) | b;
            it.h_rc = (it.h_rc >> 2) | it.sh.pattern_rc[b as usize];
            it.i += 1;
        }
        let (hash0, is_f0) = it.canonical();
        it.hash_buf[0] = hash0;
        it.f_buf[0] = is_f0;
        let mut min = hash0;
        for j in 1..w {
            it.hash_buf[j] = it.advance(j);
            if it.hash_buf[j] < min {
                min = it.hash_buf[j];
                it.i_min = j;
            }
        }
        it
    }

    #[inline(always)]
    fn canonical(&self) -> (u64, bool) {
        let hash_f = self.sh.hash(self.h);
        let hash_r = self.sh.hash(self.h_rc);
        if hash_f < hash_r {
            (hash_f, true)
        } else {
            (hash_r, false)
        }
    }

    /// Roll one base and return the canonical hash for slot `j`, or
    /// u64::MAX once the sequence is exhausted.
    fn advance(&mut self, j: usize) -> u64 {
        if self.i >= self.seq.len() {
            return u64::MAX;
        }
        let b = (self.seq[self.i] & 3) as u64;
        self.h = ((self.h << 2) & self.sh.mask) | b;
        self.h_rc = (self.h_rc >> 2) | self.sh.pattern_rc[b as usize];
        self.i += 1;
        let (hash, is_f) = self.canonical();
        self.f_buf[j] = is_f;
        hash
    }
}

impl<'a> Iterator for MinimizerIter<'a> {
    type Item = MinHit;

    fn next(&mut self) -> Option<MinHit> {
        if self.is_done {
            return None;
        }
        let w = self.sh.w as usize;
        let mut pos = self.base + self.i_min;
        if self.i_min < self.i_start {
            pos += w;
        }
        let hit = MinHit {
            hash: self.hash_buf[self.i_min],
            pos: pos as u32,
            is_forward: self.f_buf[self.i_min],
        };
        if self.i >= self.seq.len() {
            // nothing left to slide in; this window minimum was the last
            self.is_done = true;
            return Some(hit);
        }

        // slide the window just past the emitted minimum
        if self.i_min >= self.i_start {
            for j in self.i_start..=self.i_min {
                self.hash_buf[j] = self.advance(j);
            }
        } else {
            for j in self.i_start..w {
                self.hash_buf[j] = self.advance(j);
            }
            self.base += w;
            for j in 0..=self.i_min {
                self.hash_buf[j] = self.advance(j);
            }
        }
        self.i_start = self.i_min + 1;
        if self.i_start == w {
            self.i_start = 0;
            self.base += w;
        }

        // find the next minimum; a fully refilled window rescans fresh,
        // a partial refill keeps the old minimum until strictly beaten
        let mut min = if self.hash_buf[self.i_min] == u64::MAX {
            hit.hash
        } else {
            u64::MAX
        };
        let mut next_min = None;
        for t in 0..w {
            // walk slots in position order so equal hashes resolve to
            // the earliest position
            let j = if self.i_start + t >= w {
                self.i_start + t - w
            } else {
                self.i_start + t
            };
            if self.hash_buf[j] < min {
                min = self.hash_buf[j];
                next_min = Some(j);
            }
        }
        match next_min {
            Some(j) => self.i_min = j,
            None => self.is_done = true, // the old minimum was not beaten
        }
        Some(hit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::new_types::twobit::revcmp;

    // brute force canonical hash of the k-mer starting at pos
    fn canonical_at(sh: &Seqhash, seq: &[u8], pos: usize) -> (u64, u64, bool) {
        let k = sh.k as usize;
        let mut fwd = 0u64;
        for &b in &seq[pos..pos + k] {
            fwd = (fwd << 2) | b as u64;
        }
        let rc = revcmp(fwd, k);
        let (hf, hr) = (sh.hash(fwd), sh.hash(rc));
        if hf < hr {
            (hf, fwd, true)
        } else {
            (hr, rc, false)
        }
    }

    #[test]
    fn factor_is_reproducible_and_odd() -> Result<()> {
        let a = Seqhash::new(3, 2, 17)?;
        let b = Seqhash::new(3, 2, 17)?;
        assert_eq!(a.factor1, b.factor1);
        assert_eq!(a.factor1 & 1, 1);
        let c = Seqhash::new(3, 2, 18)?;
        assert_ne!(a.factor1, c.factor1);
        Ok(())
    }

    #[test]
    fn canonical_hash_is_strand_invariant() -> Result<()> {
        let sh = Seqhash::new(3, 2, 17)?;
        // acg = [0,1,2], its reverse complement cgt = [1,2,3]
        let acg = 0b00_01_10u64;
        let cgt = 0b01_10_11u64;
        assert_eq!(revcmp(acg, 3), cgt);
        let canon_acg = sh.hash(acg).min(sh.hash(cgt));
        let canon_cgt = sh.hash(cgt).min(sh.hash(acg));
        assert_eq!(canon_acg, canon_cgt);
        Ok(())
    }

    #[test]
    fn hash_bad_parameters() {
        assert!(Seqhash::new(0, 2, 1).is_err());
        assert!(Seqhash::new(32, 2, 1).is_err());
        assert!(Seqhash::new(16, 0, 1).is_err());
    }

    #[test]
    fn mod_iter_empty_and_short() -> Result<()> {
        let sh = Seqhash::new(4, 3, 1)?;
        assert_eq!(ModIter::new(&sh, &[]).count(), 0);
        assert_eq!(ModIter::new(&sh, &[0, 1, 2]).count(), 0);
        Ok(())
    }

    #[test]
    fn mod_iter_matches_brute_force() -> Result<()> {
        let sh = Seqhash::new(4, 3, 17)?;
        // AAAACGGTTTTT
        let seq: Vec<u8> = b"AAAACGGTTTTT"
            .iter()
            .map(|&c| crate::new_types::twobit::byte_to_b2(c))
            .collect();
        let mut expect = Vec::new();
        for pos in 0..=seq.len() - 4 {
            let (hash, kmer, is_f) = canonical_at(&sh, &seq, pos);
            if hash % 3 == 0 {
                expect.push(ModHit {
                    kmer,
                    pos: pos as u32,
                    is_forward: is_f,
                });
            }
        }
        let got: Vec<ModHit> = ModIter::new(&sh, &seq).collect();
        assert_eq!(got, expect);
        // every emitted word re-hashes to a multiple of w
        for hit in &got {
            assert_eq!(sh.hash(hit.kmer) % 3, 0);
        }
        Ok(())
    }

    #[test]
    fn mod_iter_uniform_sequence_terminates() -> Result<()> {
        let sh = Seqhash::new(4, 3, 5)?;
        let seq = vec![0u8; 64]; // poly-A
        // must terminate; poly-A windows all hash alike, so it emits
        // either every position or none
        let n = ModIter::new(&sh, &seq).count();
        assert!(n == 0 || n == 61);
        Ok(())
    }

    #[test]
    fn minimizer_matches_window_minima() -> Result<()> {
        let sh = Seqhash::new(5, 4, 23)?;
        let seq: Vec<u8> = (0..40u32).map(|i| ((i * 7 + 3) % 4) as u8).collect();
        let nk = seq.len() - 4; // number of k-mers
        let w = 4usize;
        let mut canon = Vec::new();
        for pos in 0..nk {
            canon.push(canonical_at(&sh, &seq, pos));
        }
        // expected: distinct leftmost window minima, in order
        let mut expect = Vec::new();
        let mut last = usize::MAX;
        for j in 0..=nk - w {
            let mut best = j;
            for i in j..j + w {
                if canon[i].0 < canon[best].0 {
                    best = i;
                }
            }
            if best != last {
                expect.push(MinHit {
                    hash: canon[best].0,
                    pos: best as u32,
                    is_forward: canon[best].2,
                });
                last = best;
            }
        }
        let got: Vec<MinHit> = MinimizerIter::new(&sh, &seq).collect();
        assert_eq!(got, expect);
        Ok(())
    }

    #[test]
    fn seqhash_roundtrip() -> Result<()> {
        let sh = Seqhash::new(19, 31, 17)?;
        let mut buf = Vec::new();
        sh.write(&mut buf)?;
        let back = Seqhash::read(&mut &buf[..])?;
        assert_eq!(sh, back);
        let mut bad = buf.clone();
        bad[0] = b'X';
        assert!(Seqhash::read(&mut &bad[..]).is_err());
        Ok(())
    }
}
