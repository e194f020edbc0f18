//! A read set stores each read only as its ordered modset hits: a
//! packed (id, strand) per hit and a 16-bit gap to the previous hit.
//! The inverse index maps each mod id back to the reads containing it,
//! packed into one backing buffer. Read names and sequences are dropped
//! at ingest.

use crate::modset::Modset;
use crate::new_types::hit::{Hit, ReadFlags, TOP_MASK};
use crate::new_types::hit::{
    BAD_LOW_COPY1, BAD_LOW_HIT, BAD_NO_MATCH, BAD_ORDER1, BAD_ORDER10, BAD_REPEAT,
};
use crate::seqhash::{ModHit, ModIter};
use crate::seqio::SeqReader;
use anyhow::{anyhow, ensure, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read as IoRead, Write};
use std::path::Path;

pub const READSET_MAGIC: &[u8; 8] = b"RSMSHv2\0";

#[derive(Default, Clone)]
pub struct Read {
    pub len: u32,
    pub n_miss: u32,
    pub contained: u32, // id of a read containing this one, or 0
    pub n_copy: [u32; 4],
    pub flags: ReadFlags,
    pub hit: Vec<Hit>,
    pub dx: Vec<u16>, // gap from the previous hit; first gap from position 0
}

impl Read {
    pub fn n_hit(&self) -> usize {
        self.hit.len()
    }
}

pub struct Readset {
    pub ms: Modset,
    pub reads: Vec<Read>, // reads[0] is burned so 0 can mean "no read"
    pub total_hit: u64,
    inv_start: Vec<u64>,
    inv_space: Vec<u32>,
}

impl Readset {
    pub fn new(ms: Modset) -> Result<Self> {
        // hit packing leaves 31 bits for the mod id
        ensure!(ms.max <= TOP_MASK, "too many entries in modset");
        Ok(Readset {
            ms,
            reads: vec![Read::default()],
            total_hit: 0,
            inv_start: Vec::new(),
            inv_space: Vec::new(),
        })
    }

    /// Append one read from its modimizer stream. Emissions absent from
    /// the modset count as misses; present ones append a packed hit and
    /// gap and bump the mod depth. Returns the new read id.
    pub fn add_read(&mut self, len: u32, mods: impl Iterator<Item = ModHit>) -> u32 {
        let mut read = Read {
            len,
            ..Default::default()
        };
        let mut last_pos = 0u32;
        for m in mods {
            let id = self.ms.find(m.kmer);
            if id == 0 {
                read.n_miss += 1;
                continue;
            }
            let gap = m.pos - last_pos;
            // a single gap above u16 range means the caller fed a read
            // longer than the representation contract allows
            dbg_assert!(gap <= u16::MAX as u32, "gap {} overflows dx", gap);
            read.hit.push(Hit::new(id, m.is_forward));
            read.dx.push(gap.min(u16::MAX as u32) as u16);
            last_pos = m.pos;
            self.ms.bump_depth(id);
        }
        read.hit.shrink_to_fit();
        read.dx.shrink_to_fit();
        self.total_hit += read.hit.len() as u64;
        self.reads.push(read);
        (self.reads.len() - 1) as u32
    }

    /// Ingest a whole sequence file. Depth is rebuilt from this file, and
    /// the inverse index afterwards.
    pub fn file_read<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        for d in self.ms.depth[..=self.ms.max as usize].iter_mut() {
            *d = 0;
        }
        let mut mod_buf: Vec<ModHit> = Vec::with_capacity(1024);
        for rec in SeqReader::open(&path)? {
            let rec = rec?;
            mod_buf.clear();
            mod_buf.extend(ModIter::new(&self.ms.hasher, &rec.seq));
            self.add_read(rec.seq.len() as u32, mod_buf.drain(..));
        }
        self.inv_build();
        Ok(())
    }

    /// All reads containing mod `m`, with multiplicity, in read order.
    /// Empty for unseen and for saturated mods.
    pub fn inv(&self, m: u32) -> &[u32] {
        let d = self.ms.depth[m as usize];
        if d == 0 || d == u16::MAX {
            return &[];
        }
        let start = self.inv_start[m as usize] as usize;
        &self.inv_space[start..start + d as usize]
    }

    /// Rebuild the inverse index and the per-read copy-class counts.
    /// Call after ingest and after anything that touches copy classes.
    pub fn inv_build(&mut self) {
        let ms = &self.ms;
        let ms_max = ms.max as usize;
        self.inv_start = vec![0u64; ms_max + 1];
        let mut offset = 0u64;
        for i in 1..=ms_max {
            let d = ms.depth[i];
            if d > 0 && d < u16::MAX {
                self.inv_start[i] = offset;
                offset += d as u64;
            }
        }
        self.inv_space = vec![0u32; offset as usize];
        let mut cursor = self.inv_start.clone();
        let inv_space = &mut self.inv_space;
        for (r, read) in self.reads.iter_mut().enumerate().skip(1) {
            read.n_copy = [0; 4]; // copy classes may have changed
            for h in &read.hit {
                let m = h.ms_id();
                read.n_copy[ms.copy(m) as usize] += 1;
                if ms.depth[m as usize] < u16::MAX {
                    inv_space[cursor[m as usize] as usize] = r as u32;
                    cursor[m as usize] += 1;
                }
            }
        }
    }

    pub fn write_files(&self, root: &str) -> Result<()> {
        self.ms.write_file(format!("{}.mod", root))?;
        let mut f = std::io::BufWriter::new(std::fs::File::create(format!("{}.readset", root))?);
        self.write_readset(&mut f)
    }

    fn write_readset(&self, out: &mut dyn Write) -> Result<()> {
        out.write_all(READSET_MAGIC)?;
        out.write_u64::<LittleEndian>(self.total_hit)?;
        out.write_u64::<LittleEndian>(self.reads.len() as u64)?;
        for read in &self.reads {
            out.write_u32::<LittleEndian>(read.len)?;
            out.write_u32::<LittleEndian>(read.n_hit() as u32)?;
            out.write_u32::<LittleEndian>(read.n_miss)?;
            out.write_u32::<LittleEndian>(read.contained)?;
            for &c in &read.n_copy {
                out.write_u32::<LittleEndian>(c)?;
            }
            out.write_u8(read.flags.bad)?;
            out.write_u8(read.flags.other)?;
            out.write_u16::<LittleEndian>(0)?; // pad
        }
        for read in &self.reads {
            for &h in &read.hit {
                out.write_u32::<LittleEndian>(h.as_u32())?;
            }
            for &d in &read.dx {
                out.write_u16::<LittleEndian>(d)?;
            }
        }
        Ok(())
    }

    pub fn read_files(root: &str) -> Result<Self> {
        let ms = Modset::read_file(format!("{}.mod", root))?;
        let mut f = std::io::BufReader::new(std::fs::File::open(format!("{}.readset", root))?);
        let mut rs = Self::read_readset(ms, &mut f)?;
        rs.inv_build();
        Ok(rs)
    }

    fn read_readset(ms: Modset, inp: &mut dyn IoRead) -> Result<Self> {
        let mut magic = [0u8; 8];
        inp.read_exact(&mut magic)
            .map_err(|e| anyhow!("failed to read readset header: {}", e))?;
        ensure!(&magic == READSET_MAGIC, "bad readset header");
        let total_hit = inp.read_u64::<LittleEndian>()?;
        let n_reads = inp.read_u64::<LittleEndian>()?;
        ensure!(n_reads >= 1, "corrupt readset: no burned read");
        let mut rs = Readset::new(ms)?;
        rs.total_hit = total_hit;
        rs.reads.clear();
        let mut n_hits = Vec::with_capacity(n_reads as usize);
        for _ in 0..n_reads {
            let mut read = Read {
                len: inp.read_u32::<LittleEndian>()?,
                ..Default::default()
            };
            n_hits.push(inp.read_u32::<LittleEndian>()?);
            read.n_miss = inp.read_u32::<LittleEndian>()?;
            read.contained = inp.read_u32::<LittleEndian>()?;
            for c in read.n_copy.iter_mut() {
                *c = inp.read_u32::<LittleEndian>()?;
            }
            read.flags.bad = inp.read_u8()?;
            read.flags.other = inp.read_u8()?;
            let _pad = inp.read_u16::<LittleEndian>()?;
            rs.reads.push(read);
        }
        let mut check_hit = 0u64;
        for (read, &n) in rs.reads.iter_mut().zip(&n_hits) {
            read.hit = Vec::with_capacity(n as usize);
            for _ in 0..n {
                read.hit.push(Hit::from_u32(inp.read_u32::<LittleEndian>()?));
            }
            read.dx = Vec::with_capacity(n as usize);
            for _ in 0..n {
                read.dx.push(inp.read_u16::<LittleEndian>()?);
            }
            check_hit += n as u64;
        }
        ensure!(
            check_hit == total_hit,
            "corrupt readset: {} hits read, header says {}",
            check_hit,
            total_hit
        );
        Ok(rs)
    }

    pub fn stats(&self, out: &mut dyn Write) -> Result<()> {
        let n = self.reads.len() as u64 - 1;
        if n == 0 {
            writeln!(out, "stats called on empty readset")?;
            return Ok(());
        }
        self.ms.summary(out)?;

        let mut tot_len = 0u64;
        let mut tot_miss = 0u64;
        let mut tot_copy = [0u64; 4];
        let mut n_unique0 = 0u64;
        let mut n_unique1 = 0u64;
        let mut len_unique0 = 0u64;
        let mut len_unique1 = 0u64;
        let mut n_bad = 0u64;
        let mut bad_counts = [0u64; 6];
        for read in &self.reads[1..] {
            tot_len += read.len as u64;
            tot_miss += read.n_miss as u64;
            for j in 0..4 {
                tot_copy[j] += read.n_copy[j] as u64;
            }
            if read.n_copy[1] == 0 {
                n_unique0 += 1;
                len_unique0 += read.len as u64;
            } else if read.n_copy[1] == 1 {
                n_unique1 += 1;
                len_unique1 += read.len as u64;
            }
            if read.flags.is_bad() {
                n_bad += 1;
                for (j, &bit) in [
                    BAD_REPEAT,
                    BAD_ORDER10,
                    BAD_ORDER1,
                    BAD_NO_MATCH,
                    BAD_LOW_HIT,
                    BAD_LOW_COPY1,
                ]
                .iter()
                .enumerate()
                {
                    if read.flags.has(bit) {
                        bad_counts[j] += 1;
                    }
                }
            }
        }
        writeln!(
            out,
            "RS {} sequences, total length {} (av {:.1})",
            n,
            tot_len,
            tot_len as f64 / n as f64
        )?;
        writeln!(
            out,
            "RS {} mod hits, {:.1} bp/hit, frac hit {:.2}, av hits/read {:.1}",
            self.total_hit,
            tot_len as f64 / self.total_hit as f64,
            self.total_hit as f64 / (tot_miss + self.total_hit) as f64,
            self.total_hit as f64 / n as f64
        )?;
        writeln!(
            out,
            "RS hit distribution {:.2} copy0, {:.2} copy1, {:.2} copy2, {:.2} copyM",
            tot_copy[0] as f64 / self.total_hit as f64,
            tot_copy[1] as f64 / self.total_hit as f64,
            tot_copy[2] as f64 / self.total_hit as f64,
            tot_copy[3] as f64 / self.total_hit as f64
        )?;
        let n_multi = n - n_unique0 - n_unique1;
        writeln!(
            out,
            "RS reads with 0 copy1 hits {} (av len {:.1}), 1 copy1 hit {} (av len {:.1}), \
             >1 copy1 hits {} (av len {:.1}, av copy1 hits {:.1})",
            n_unique0,
            len_unique0 as f64 / n_unique0 as f64,
            n_unique1,
            len_unique1 as f64 / n_unique1 as f64,
            n_multi,
            (tot_len - len_unique0 - len_unique1) as f64 / n_multi as f64,
            (tot_copy[1] - n_unique1) as f64 / n_multi as f64
        )?;
        writeln!(
            out,
            "RS bad {} : {} repeat, {} order10, {} order1, {} no_match, {} low_hit, {} low_copy1",
            n_bad,
            bad_counts[0],
            bad_counts[1],
            bad_counts[2],
            bad_counts[3],
            bad_counts[4],
            bad_counts[5]
        )?;

        // per-copy-class mod usage
        let mut n_copy = [0u64; 4];
        let mut hit_copy = [0u64; 4];
        let mut hit2_copy = [0u64; 4];
        let mut depth_copy = [0u64; 4];
        for i in 1..=self.ms.max {
            let j = self.ms.copy(i) as usize;
            n_copy[j] += 1;
            let d = self.ms.depth[i as usize];
            if d > 0 {
                hit_copy[j] += 1;
            }
            if d > 1 {
                hit2_copy[j] += 1;
                depth_copy[j] += d as u64;
            }
        }
        write!(out, "RS mod frac hit hit>1 av:")?;
        for (j, name) in ["copy0", "copy1", "copy2", "copyM"].iter().enumerate() {
            write!(
                out,
                " {} {:.3} {:.3} {:.1}",
                name,
                hit_copy[j] as f64 / n_copy[j] as f64,
                hit2_copy[j] as f64 / n_copy[j] as f64,
                depth_copy[j] as f64 / hit2_copy[j] as f64
            )?;
        }
        writeln!(out)?;
        Ok(())
    }
}
