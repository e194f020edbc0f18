//! The modset: an open-addressed table mapping canonical modimizer
//! words to dense ids in `1..=max`, with a saturating 16-bit depth and
//! an info byte per id. The probe sequence double-hashes with an odd
//! stride taken from the high bits, so every probe walks the full
//! power-of-two table. Load is capped at 25%.

use crate::seqhash::{ModIter, Seqhash};
use crate::seqio::SeqReader;
use anyhow::{anyhow, ensure, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};
use std::path::Path;

pub const MODSET_MAGIC: &[u8; 8] = b"MSHSTv1\0";

// info byte: low 2 bits copy class in {0,1,2,M}, 0 for likely errors
pub const MS_MINOR: u8 = 0x04; // less than half the depth of a neighbour in some read
pub const MS_REPEAT: u8 = 0x08; // repeated within a read
pub const MS_INTERNAL: u8 = 0x10; // both neighbours within w in a read
pub const MS_RDNA: u8 = 0x20;

pub struct Modset {
    pub hasher: Seqhash,
    pub table_bits: i32,
    /// Capacity of the parallel arrays; max stays below it. Grown on
    /// demand up to a quarter of the table, so a reloaded (packed) set
    /// can keep taking insertions.
    pub size: u32,
    table_size: u64,
    table_mask: u64,
    pub index: Vec<u32>, // 0 = empty slot, else dense id
    pub value: Vec<u64>, // canonical k-mer word per id
    pub depth: Vec<u16>,
    pub info: Vec<u8>,
    pub max: u32, // ids run 1..=max; 0 is the null sentinel
}

impl Modset {
    pub fn new(hasher: Seqhash, bits: i32, size: u32) -> Result<Self> {
        ensure!(
            (20..=34).contains(&bits),
            "table bits {} must be between 20 and 34",
            bits
        );
        let table_size = 1u64 << bits;
        ensure!(
            (size as u64) < (table_size >> 2),
            "modset size {} is too big for {} bits",
            size,
            bits
        );
        let size = if size != 0 {
            size
        } else {
            ((table_size >> 2) - 1) as u32
        };
        Ok(Modset {
            hasher,
            table_bits: bits,
            size,
            table_size,
            table_mask: table_size - 1,
            index: vec![0; table_size as usize],
            value: vec![0; size as usize],
            depth: vec![0; size as usize],
            info: vec![0; size as usize],
            max: 0,
        })
    }

    /// Dense id of `hash`, or 0 when absent. Never mutates; safe on a
    /// frozen set.
    pub fn find(&self, hash: u64) -> u32 {
        let mut offset = hash & self.table_mask;
        let mut diff = 0u64;
        let mut id = self.index[offset as usize];
        while id != 0 && self.value[id as usize] != hash {
            if diff == 0 {
                diff = ((hash >> self.table_bits) & self.table_mask) | 1; // odd, so coprime
            }
            offset = (offset + diff) & self.table_mask;
            id = self.index[offset as usize];
        }
        id
    }

    /// Dense id of `hash`, inserting a fresh id when absent. Fails only
    /// once the 25% load cap is reached; the caller then needs a larger
    /// table.
    pub fn find_or_add(&mut self, hash: u64) -> Result<u32> {
        let mut offset = hash & self.table_mask;
        let mut diff = 0u64;
        let mut id = self.index[offset as usize];
        while id != 0 && self.value[id as usize] != hash {
            if diff == 0 {
                diff = ((hash >> self.table_bits) & self.table_mask) | 1;
            }
            offset = (offset + diff) & self.table_mask;
            id = self.index[offset as usize];
        }
        if id == 0 {
            if self.max + 1 >= self.size {
                self.grow()?;
            }
            self.max += 1;
            id = self.max;
            self.index[offset as usize] = id;
            self.value[id as usize] = hash;
        }
        Ok(id)
    }

    /// Double the parallel arrays, capped at a quarter of the table.
    /// A set loaded from disk is packed to `max + 1` entries, so this is
    /// what lets it keep growing.
    fn grow(&mut self) -> Result<()> {
        let cap = (self.table_size >> 2) - 1;
        ensure!(
            (self.max as u64) + 1 < cap,
            "modset with {} table bits is full at {} entries",
            self.table_bits,
            self.max
        );
        let new_size = ((self.size as u64) * 2).min(cap);
        dbg_print!("modset arrays grow from {} to {}", self.size, new_size);
        self.value.resize(new_size as usize, 0);
        self.depth.resize(new_size as usize, 0);
        self.info.resize(new_size as usize, 0);
        self.size = new_size as u32;
        Ok(())
    }

    #[inline(always)]
    pub fn bump_depth(&mut self, id: u32) {
        let d = &mut self.depth[id as usize];
        *d = d.saturating_add(1);
    }

    /// Trim the parallel arrays to `max + 1` entries. True when anything
    /// changed.
    pub fn pack(&mut self) -> bool {
        let want = self.max as usize + 1;
        if self.size as usize == want {
            return false;
        }
        self.value.truncate(want);
        self.value.shrink_to_fit();
        self.depth.truncate(want);
        self.depth.shrink_to_fit();
        self.info.truncate(want);
        self.info.shrink_to_fit();
        self.size = want as u32;
        true
    }

    /// Keep only entries with `dmin <= depth < dmax` (dmax 0 means
    /// unbounded), renumbering dense ids compactly. Ids are reassigned
    /// in increasing order, so each new slot is written at or below the
    /// old one it came from.
    pub fn prune(&mut self, dmin: u16, dmax: u16) -> Result<()> {
        let n = self.max;
        self.max = 0;
        for cell in self.index.iter_mut() {
            *cell = 0;
        }
        for i in 1..=n {
            let d = self.depth[i as usize];
            if d >= dmin && (dmax == 0 || d < dmax) {
                let v = self.value[i as usize];
                let info = self.info[i as usize];
                let new = self.find_or_add(v)?;
                dbg_assert!(new <= i);
                self.depth[new as usize] = d;
                self.info[new as usize] = info;
            }
        }
        eprintln!(
            "  pruned modset from {} to {} with min {} <= depth < max {}",
            n, self.max, dmin, dmax
        );
        Ok(())
    }

    /// Fold `other` into `self`: depths add saturating, copy classes add
    /// saturating at M. Fails without touching `self` when the hashers
    /// disagree; this is the one recoverable failure in the crate.
    pub fn merge(&mut self, other: &Modset) -> Result<()> {
        ensure!(
            self.hasher.compatible(&other.hasher),
            "modset hashers are incompatible (k/w/factor differ)"
        );
        let mut new_size = self.max as u64 + other.max as u64 + 1;
        if new_size >= self.table_size >> 2 {
            new_size = (self.table_size >> 2) - 1;
        }
        if new_size > self.size as u64 {
            dbg_print!("merge grows modset arrays from {} to {}", self.size, new_size);
            self.value.resize(new_size as usize, 0);
            self.depth.resize(new_size as usize, 0);
            self.info.resize(new_size as usize, 0);
            self.size = new_size as u32;
        }
        for i in 1..=other.max {
            let id = self.find_or_add(other.value[i as usize])?;
            let d = (self.depth[id as usize] as u32 + other.depth[i as usize] as u32)
                .min(u16::MAX as u32);
            self.depth[id as usize] = d as u16;
            let c = (self.copy(id) + other.copy(i)).min(3);
            self.info[id as usize] = (self.info[id as usize] & 0xfc) | c;
        }
        Ok(())
    }

    // copy class and flag accessors

    #[inline(always)]
    pub fn copy(&self, id: u32) -> u8 {
        self.info[id as usize] & 3
    }
    pub fn is_copy0(&self, id: u32) -> bool {
        self.copy(id) == 0
    }
    pub fn is_copy1(&self, id: u32) -> bool {
        self.copy(id) == 1
    }
    pub fn is_copy2(&self, id: u32) -> bool {
        self.copy(id) == 2
    }
    pub fn is_copy_m(&self, id: u32) -> bool {
        self.copy(id) == 3
    }
    pub fn set_copy0(&mut self, id: u32) {
        self.info[id as usize] &= 0xfc;
    }
    pub fn set_copy1(&mut self, id: u32) {
        self.info[id as usize] = (self.info[id as usize] & 0xfc) | 1;
    }
    pub fn set_copy2(&mut self, id: u32) {
        self.info[id as usize] = (self.info[id as usize] & 0xfc) | 2;
    }
    pub fn set_copy_m(&mut self, id: u32) {
        self.info[id as usize] |= 3;
    }
    pub fn set_flag(&mut self, id: u32, flag: u8) {
        self.info[id as usize] |= flag;
    }
    pub fn has_flag(&self, id: u32, flag: u8) -> bool {
        self.info[id as usize] & flag != 0
    }

    /// Run the modimizer iterator over one 2-bit sequence, inserting
    /// every emitted word. Returns the number of hashes added.
    pub fn add_seq(&mut self, seq: &[u8]) -> Result<u64> {
        let mut n_hash = 0u64;
        // the iterator borrows the hasher, so collect before inserting
        let hasher = self.hasher.clone();
        for hit in ModIter::new(&hasher, seq) {
            let id = self.find_or_add(hit.kmer)?;
            self.bump_depth(id);
            n_hash += 1;
        }
        Ok(n_hash)
    }

    /// Add every record of a sequence file.
    pub fn add_seq_file<P: AsRef<Path>>(&mut self, path: P, out: &mut dyn Write) -> Result<()> {
        let mut n_seq = 0u64;
        let mut tot_len = 0u64;
        let mut tot_hash = 0u64;
        for rec in SeqReader::open(&path)? {
            let rec = rec?;
            n_seq += 1;
            tot_len += rec.seq.len() as u64;
            tot_hash += self.add_seq(&rec.seq)?;
        }
        writeln!(
            out,
            "added {} sequences total length {} total hashes {}, new max {}",
            n_seq, tot_len, tot_hash, self.max
        )?;
        Ok(())
    }

    /// Reassign copy classes from depth thresholds: below `c1` copy 0,
    /// below `c2` copy 1, below `cm` copy 2, else M.
    pub fn set_copy_thresholds(&mut self, c1: u16, c2: u16, cm: u16) {
        for id in 1..=self.max {
            let d = self.depth[id as usize];
            if d < c1 {
                self.set_copy0(id);
            } else if d < c2 {
                self.set_copy1(id);
            } else if d < cm {
                self.set_copy2(id);
            } else {
                self.set_copy_m(id);
            }
        }
    }

    /// Mark everything at or above `cm` as multi-copy, leaving the rest
    /// alone.
    pub fn set_copy_m_threshold(&mut self, cm: u16) {
        for id in 1..=self.max {
            if self.depth[id as usize] >= cm {
                self.set_copy_m(id);
            }
        }
    }

    /// Depth histogram, indexed by depth.
    pub fn depth_histogram(&self) -> Vec<u32> {
        let mut h: Vec<u32> = Vec::with_capacity(256);
        for id in 1..=self.max {
            let d = self.depth[id as usize] as usize;
            if d >= h.len() {
                h.resize(d + 1, 0);
            }
            h[d] += 1;
        }
        h
    }

    /// Per-entry depth in this set and in every other given set.
    pub fn report_depths(&self, others: &[Modset], out: &mut dyn Write) -> Result<()> {
        for id in 1..=self.max {
            let v = self.value[id as usize];
            write!(out, "MH\t{:x}\t{}\t{}", v, self.copy(id), self.depth[id as usize])?;
            for other in others {
                let oid = other.find(v);
                let d = if oid != 0 { other.depth[oid as usize] } else { 0 };
                write!(out, "\t{}", d)?;
            }
            writeln!(out)?;
        }
        Ok(())
    }

    pub fn summary(&self, out: &mut dyn Write) -> Result<()> {
        self.hasher.report(out)?;
        write!(
            out,
            "MS table bits {} size {} number of entries {}",
            self.table_bits, self.table_size, self.max
        )?;
        if self.max == 0 {
            writeln!(out)?;
            return Ok(());
        }
        let h = self.depth_histogram();
        let mut copy = [0u64; 4];
        for id in 1..=self.max {
            copy[self.copy(id) as usize] += 1;
        }
        let mut sum = 0u64;
        let mut tot = 0u64;
        for (d, &n) in h.iter().enumerate() {
            sum += n as u64;
            tot += d as u64 * n as u64;
        }
        let mut htot = tot as i64 / 2;
        let mut n50 = 0usize;
        for (d, &n) in h.iter().enumerate() {
            htot -= d as i64 * n as i64;
            n50 = d;
            if htot < 0 {
                break;
            }
        }
        write!(
            out,
            " total count {}\nMS average depth {:.1} N50 depth {}",
            tot,
            tot as f64 / sum as f64,
            n50
        )?;
        if copy[0] < self.max as u64 {
            write!(
                out,
                " copy0 {} copy1 {} copy2 {} copyM {}",
                copy[0], copy[1], copy[2], copy[3]
            )?;
        }
        writeln!(out)?;
        Ok(())
    }

    pub fn write(&self, out: &mut dyn Write) -> Result<()> {
        out.write_all(MODSET_MAGIC)?;
        out.write_i32::<LittleEndian>(self.table_bits)?;
        out.write_u32::<LittleEndian>(self.max + 1)?;
        self.hasher.write(out)?;
        for &cell in &self.index {
            out.write_u32::<LittleEndian>(cell)?;
        }
        for id in 0..=self.max as usize {
            out.write_u64::<LittleEndian>(self.value[id])?;
        }
        for id in 0..=self.max as usize {
            out.write_u16::<LittleEndian>(self.depth[id])?;
        }
        for id in 0..=self.max as usize {
            out.write_u8(self.info[id])?;
        }
        Ok(())
    }

    pub fn read(inp: &mut dyn Read) -> Result<Self> {
        let mut magic = [0u8; 8];
        inp.read_exact(&mut magic)
            .map_err(|e| anyhow!("failed to read modset header: {}", e))?;
        ensure!(&magic == MODSET_MAGIC, "bad modset header");
        let bits = inp.read_i32::<LittleEndian>()?;
        let size = inp.read_u32::<LittleEndian>()?;
        ensure!(size > 0, "corrupt modset: zero size");
        let hasher = Seqhash::read(inp)?;
        let mut ms = Modset::new(hasher, bits, size)?;
        for cell in ms.index.iter_mut() {
            *cell = inp.read_u32::<LittleEndian>()?;
        }
        for id in 0..size as usize {
            ms.value[id] = inp.read_u64::<LittleEndian>()?;
        }
        for id in 0..size as usize {
            ms.depth[id] = inp.read_u16::<LittleEndian>()?;
        }
        for id in 0..size as usize {
            ms.info[id] = inp.read_u8()?;
        }
        ms.max = size - 1;
        Ok(ms)
    }

    pub fn write_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut f = std::io::BufWriter::new(std::fs::File::create(&path)?);
        self.write(&mut f)
    }

    pub fn read_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut f = std::io::BufReader::new(std::fs::File::open(&path)?);
        Self::read(&mut f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_set() -> Result<Modset> {
        let sh = Seqhash::new(3, 4, 1)?;
        Modset::new(sh, 20, 0)
    }

    // hashes not divisible by 4, inserted directly
    const H1: u64 = 0x1234_5679;
    const H2: u64 = 0xdead_beef_cafd;
    const H3: u64 = 0x0fed_cba9_8765_4322;

    #[test]
    fn find_or_add_assigns_dense_ids() -> Result<()> {
        let mut ms = small_set()?;
        assert_eq!(ms.find_or_add(H1)?, 1);
        assert_eq!(ms.find_or_add(H2)?, 2);
        assert_eq!(ms.find_or_add(H3)?, 3);
        assert_eq!(ms.find_or_add(H2)?, 2);
        assert_eq!(ms.max, 3);
        assert_eq!(ms.find(H1), 1);
        assert_eq!(ms.find(0x4444), 0);
        // every stored value finds its own id
        for i in 1..=ms.max {
            assert_eq!(ms.find(ms.value[i as usize]), i);
        }
        Ok(())
    }

    #[test]
    fn small_size_grows_until_the_table_cap() -> Result<()> {
        let sh = Seqhash::new(3, 4, 1)?;
        let mut ms = Modset::new(sh, 20, 4)?;
        let cap = ((1u64 << 20) >> 2) - 1;
        // the explicit size is a starting point, not a ceiling
        for h in 1..cap {
            ms.find_or_add(h)?;
        }
        assert_eq!(ms.max as u64, cap - 1);
        // at the 25% load cap existing keys still resolve
        assert_eq!(ms.find_or_add(1)?, 1);
        assert_eq!(ms.find(cap - 1) as u64, cap - 1);
        // only a truly new key fails
        assert!(ms.find_or_add(u64::MAX).is_err());
        assert_eq!(ms.max as u64, cap - 1);
        Ok(())
    }

    #[test]
    fn saved_modset_accepts_new_entries() -> Result<()> {
        // the create -> add workflow: an empty set is written, comes
        // back packed to max + 1, and must still take insertions
        let ms = small_set()?;
        let mut buf = Vec::new();
        ms.write(&mut buf)?;
        let mut back = Modset::read(&mut &buf[..])?;
        assert_eq!(back.max, 0);
        assert_eq!(back.size, 1);
        assert_eq!(back.find_or_add(H1)?, 1);
        back.depth[1] = 2;

        // and again once it has content
        let mut buf = Vec::new();
        back.write(&mut buf)?;
        let mut back = Modset::read(&mut &buf[..])?;
        assert_eq!(back.find_or_add(H2)?, 2);
        assert_eq!(back.find_or_add(H1)?, 1);
        assert_eq!(back.depth[1], 2);
        assert_eq!(back.max, 2);
        Ok(())
    }

    #[test]
    fn depth_saturates() -> Result<()> {
        let mut ms = small_set()?;
        let id = ms.find_or_add(H1)?;
        ms.depth[id as usize] = u16::MAX - 1;
        ms.bump_depth(id);
        assert_eq!(ms.depth[id as usize], u16::MAX);
        ms.bump_depth(id);
        assert_eq!(ms.depth[id as usize], u16::MAX);
        Ok(())
    }

    #[test]
    fn roundtrip_prune_merge() -> Result<()> {
        // scenario: three direct inserts, depths 3, 5, 3000
        let mut ms = small_set()?;
        ms.find_or_add(H1)?;
        ms.find_or_add(H2)?;
        ms.find_or_add(H3)?;
        ms.depth[1] = 3;
        ms.depth[2] = 5;
        ms.depth[3] = 3000;

        let mut buf = Vec::new();
        ms.write(&mut buf)?;
        let mut back = Modset::read(&mut &buf[..])?;
        assert_eq!(back.find(H2), 2);
        assert_eq!(back.depth[2], 5);
        assert_eq!(back.max, 3);
        assert_eq!(back.size, 4); // written packed

        // prune to [4, 100): only H2 survives, renumbered to 1
        back.prune(4, 100)?;
        assert_eq!(back.max, 1);
        assert_eq!(back.find(H2), 1);
        assert_eq!(back.depth[1], 5);
        assert_eq!(back.find(H1), 0);
        assert_eq!(back.find(H3), 0);
        Ok(())
    }

    #[test]
    fn pack_is_idempotent() -> Result<()> {
        let mut ms = small_set()?;
        ms.find_or_add(H1)?;
        ms.find_or_add(H2)?;
        assert!(ms.pack());
        assert_eq!(ms.size, 3);
        assert!(!ms.pack());
        assert_eq!(ms.size, 3);
        assert_eq!(ms.find(H2), 2);
        Ok(())
    }

    #[test]
    fn merge_adds_depths() -> Result<()> {
        let sh = Seqhash::new(3, 4, 1)?;
        let mut a = Modset::new(sh.clone(), 20, 0)?;
        a.find_or_add(H1)?;
        a.find_or_add(H2)?;
        a.depth[1] = 10;
        a.depth[2] = 20;
        let mut b = Modset::new(sh, 20, 0)?;
        b.find_or_add(H2)?;
        b.find_or_add(H3)?;
        b.depth[1] = 30;
        b.depth[2] = 50;

        a.merge(&b)?;
        assert_eq!(a.max, 3);
        assert_eq!(a.depth[a.find(H1) as usize], 10);
        assert_eq!(a.depth[a.find(H2) as usize], 50);
        assert_eq!(a.depth[a.find(H3) as usize], 50);
        Ok(())
    }

    #[test]
    fn merge_rejects_foreign_hasher() -> Result<()> {
        let mut a = Modset::new(Seqhash::new(3, 4, 1)?, 20, 0)?;
        a.find_or_add(H1)?;
        a.depth[1] = 7;
        let mut b = Modset::new(Seqhash::new(3, 4, 2)?, 20, 0)?;
        b.find_or_add(H2)?;
        assert!(a.merge(&b).is_err());
        // target unchanged
        assert_eq!(a.max, 1);
        assert_eq!(a.depth[1], 7);
        assert_eq!(a.find(H2), 0);
        Ok(())
    }

    #[test]
    fn merge_saturates_depth_and_copy() -> Result<()> {
        let sh = Seqhash::new(3, 4, 1)?;
        let mut a = Modset::new(sh.clone(), 20, 0)?;
        let id = a.find_or_add(H1)?;
        a.depth[id as usize] = u16::MAX - 5;
        a.set_copy2(id);
        let mut b = Modset::new(sh, 20, 0)?;
        let id2 = b.find_or_add(H1)?;
        b.depth[id2 as usize] = 100;
        b.set_copy2(id2);
        a.merge(&b)?;
        assert_eq!(a.depth[id as usize], u16::MAX);
        assert!(a.is_copy_m(id));
        Ok(())
    }

    #[test]
    fn bad_table_bits() -> Result<()> {
        let sh = Seqhash::new(3, 4, 1)?;
        assert!(Modset::new(sh.clone(), 19, 0).is_err());
        assert!(Modset::new(sh.clone(), 35, 0).is_err());
        // size must stay under a quarter of the table
        assert!(Modset::new(sh, 20, 1 << 18).is_err());
        Ok(())
    }

    #[test]
    fn corrupt_magic_is_rejected() -> Result<()> {
        let mut ms = small_set()?;
        ms.find_or_add(H1)?;
        let mut buf = Vec::new();
        ms.write(&mut buf)?;
        buf[3] = b'!';
        assert!(Modset::read(&mut &buf[..]).is_err());
        // short read
        let mut ok = Vec::new();
        ms.write(&mut ok)?;
        ok.truncate(ok.len() - 2);
        assert!(Modset::read(&mut &ok[..]).is_err());
        Ok(())
    }
}
