//! Reference mapping: the reference genome is reduced to its ordered
//! modimizer occurrences, with an inverse from each mod to its
//! occurrence positions, and queries are chained along monotone runs of
//! shared occurrences. Either the modimizer or the minimizer selector
//! can drive the sketch, as long as index and query agree.

use crate::modset::Modset;
use crate::seqhash::{MinimizerIter, ModIter};
use crate::seqio::SeqReader;
use anyhow::{anyhow, bail, ensure, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Write;
use std::path::Path;

pub const REFERENCE_MAGIC: &[u8; 8] = b"RFMSHv1\0";

/// Which selector feeds the sketch.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Selector {
    Modimizer,
    Minimizer,
}

impl Selector {
    fn emit(self, ms: &Modset, seq: &[u8], out: &mut Vec<(u64, u32)>) {
        out.clear();
        match self {
            Selector::Modimizer => {
                out.extend(ModIter::new(&ms.hasher, seq).map(|h| (h.kmer, h.pos)))
            }
            Selector::Minimizer => {
                out.extend(MinimizerIter::new(&ms.hasher, seq).map(|h| (h.hash, h.pos)))
            }
        }
    }
}

pub struct Reference {
    pub ms: Modset,
    pub selector: Selector,
    pub index: Vec<u32>,  // mod id per occurrence, in reference order
    pub offset: Vec<u32>, // base offset of the occurrence in its sequence
    pub id: Vec<u32>,     // sequence id per occurrence
    pub depth: Vec<u32>,  // occurrences per mod id
    pub rev: Vec<u32>,    // occurrence indices grouped per mod
    pub loc: Vec<u32>,    // start of each mod's group in rev
    pub names: Vec<String>,
    pub len: Vec<u32>, // sequence lengths
    size_limit: u32,
}

impl Reference {
    pub fn new(ms: Modset, size_limit: u32) -> Result<Self> {
        ensure!(size_limit > 0, "reference needs a nonzero size limit");
        Ok(Reference {
            ms,
            selector: Selector::Modimizer,
            index: Vec::new(),
            offset: Vec::new(),
            id: Vec::new(),
            depth: Vec::new(),
            rev: Vec::new(),
            loc: Vec::new(),
            names: Vec::new(),
            len: Vec::new(),
            size_limit,
        })
    }

    pub fn max(&self) -> u32 {
        self.index.len() as u32
    }

    /// Sketch a reference fasta. With `is_add` the modset fills up from
    /// the reference itself; without, only preexisting mods are kept.
    /// Copy classes are then assigned from the reference depth and the
    /// occurrence inverse is built.
    pub fn fasta_read<P: AsRef<Path>>(
        &mut self,
        path: P,
        is_add: bool,
        out: &mut dyn Write,
    ) -> Result<()> {
        let mut tot_len = 0u64;
        let mut buf: Vec<(u64, u32)> = Vec::new();
        for rec in SeqReader::open(&path)? {
            let rec = rec?;
            ensure!(
                !self.names.contains(&rec.id),
                "duplicate ref sequence name {}",
                rec.id
            );
            let seq_id = self.names.len() as u32;
            self.names.push(rec.id);
            self.len.push(rec.seq.len() as u32);
            tot_len += rec.seq.len() as u64;
            self.selector.emit(&self.ms, &rec.seq, &mut buf);
            for &(value, pos) in &buf {
                let id = if is_add {
                    self.ms.find_or_add(value)?
                } else {
                    self.ms.find(value)
                };
                if id == 0 {
                    continue;
                }
                ensure!(
                    self.index.len() < self.size_limit as usize,
                    "reference size overflow"
                );
                self.index.push(id);
                self.offset.push(pos);
                self.id.push(seq_id);
                if self.depth.len() <= id as usize {
                    self.depth.resize(id as usize + 1, 0);
                }
                self.depth[id as usize] += 1;
            }
        }
        writeln!(
            out,
            "  {} hashes from {} reference sequences, total length {}",
            self.index.len(),
            self.names.len(),
            tot_len
        )?;

        self.depth.resize(self.ms.max as usize + 1, 0);
        let mut n1 = 0u64;
        let mut n2 = 0u64;
        let mut nm = 0u64;
        for i in 1..=self.ms.max {
            match self.depth[i as usize] {
                1 => {
                    self.ms.set_copy1(i);
                    n1 += 1;
                }
                2 => {
                    self.ms.set_copy2(i);
                    n2 += 1;
                }
                _ => {
                    self.ms.set_copy_m(i);
                    nm += 1;
                }
            }
        }
        writeln!(out, "  {} copy 1, {} copy 2, {} multiple", n1, n2, nm)?;

        if is_add {
            self.ms.pack();
        }
        self.build_rev();
        Ok(())
    }

    /// Group the occurrence indices of each mod contiguously in `rev`,
    /// with `loc[m]` pointing at the group start.
    fn build_rev(&mut self) {
        let max = self.ms.max as usize;
        self.loc = vec![0u32; max + 1];
        for i in 1..=max {
            self.loc[i] = self.loc[i - 1] + self.depth[i - 1];
        }
        self.rev = vec![0u32; self.index.len()];
        let mut cursor = self.loc.clone();
        for (occ, &m) in self.index.iter().enumerate() {
            self.rev[cursor[m as usize] as usize] = occ as u32;
            cursor[m as usize] += 1;
        }
    }

    /// The reference occurrences of mod `m`.
    pub fn occurrences(&self, m: u32) -> &[u32] {
        let s = self.loc[m as usize] as usize;
        &self.rev[s..s + self.depth[m as usize] as usize]
    }

    /// Chain the query's shared occurrences into monotone blocks and
    /// report an M line for each block with more than two copy-1 seeds.
    pub fn query_file<P: AsRef<Path>>(
        &self,
        path: P,
        verbose: bool,
        out: &mut dyn Write,
    ) -> Result<()> {
        let mut buf: Vec<(u64, u32)> = Vec::new();
        for rec in SeqReader::open(&path)? {
            let rec = rec?;
            self.selector.emit(&self.ms, &rec.seq, &mut buf);
            let mut seeds: Vec<(u32, u32)> = Vec::with_capacity(buf.len());
            let mut missed = 0u64;
            let mut copy = [0u64; 4];
            for &(value, pos) in &buf {
                let id = self.ms.find(value);
                seeds.push((id, pos));
                if id != 0 {
                    copy[self.ms.copy(id) as usize] += 1;
                } else {
                    missed += 1;
                }
            }
            let n_seed = seeds.len() as u64;
            writeln!(
                out,
                "Q\t{}\t{}\t{} miss, {} copy1, {} copy2, {} multi, {:.2} hit",
                rec.id,
                rec.seq.len(),
                missed,
                copy[1],
                copy[2],
                copy[3],
                if n_seed > 0 {
                    (n_seed - missed) as f64 / n_seed as f64
                } else {
                    0.0
                }
            )?;
            self.chain_seeds(&rec.id, rec.seq.len(), &seeds, copy[1], verbose, out)?;
        }
        Ok(())
    }

    fn chain_seeds(
        &self,
        qid: &str,
        qlen: usize,
        seeds: &[(u32, u32)],
        n_copy1: u64,
        verbose: bool,
        out: &mut dyn Write,
    ) -> Result<()> {
        let mut block: Option<Block> = None;
        let mut n1 = 0u64;
        let mut n2 = 0u64;
        for (i, &(id, _pos)) in seeds.iter().enumerate() {
            if id == 0 || self.ms.is_copy_m(id) {
                continue; // multi-hits carry no order information
            }
            let occs = self.occurrences(id);
            if occs.is_empty() {
                continue; // known mod without a reference occurrence
            }
            let mut loc = occs[0];
            let is1 = self.ms.is_copy1(id);
            if verbose {
                let l = loc as usize;
                write!(
                    out,
                    "  {:6}\t{} {}",
                    seeds[i].1, self.names[self.id[l] as usize], self.offset[l]
                )?;
                if !is1 && occs.len() > 1 {
                    let l2 = occs[1] as usize;
                    write!(
                        out,
                        "\t{} {}",
                        self.names[self.id[l2] as usize], self.offset[l2]
                    )?;
                }
                writeln!(out)?;
            }

            let mut ends = match &block {
                Some(b) => b.breaks_at(self, loc),
                None => true,
            };
            if ends && block.is_some() && !is1 && occs.len() > 1 {
                // a copy-2 seed may chain through its second location
                let loc2 = occs[1];
                if !block.as_ref().unwrap().breaks_at(self, loc2) {
                    loc = loc2;
                    ends = false;
                }
            }
            if ends {
                if let Some(b) = &block {
                    b.report(self, qid, qlen, seeds, n_copy1, n1, n2, out)?;
                }
                n1 = 0;
                n2 = 0;
                block = Some(Block {
                    loc0: loc,
                    loc_n: loc,
                    i0: i,
                    i_n: i,
                });
            }
            if is1 {
                n1 += 1;
            } else {
                n2 += 1;
            }
            let b = block.as_mut().unwrap();
            b.loc_n = loc;
            b.i_n = i;
        }
        if let Some(b) = &block {
            b.report(self, qid, qlen, seeds, n_copy1, n1, n2, out)?;
        }
        Ok(())
    }
}

struct Block {
    loc0: u32,
    loc_n: u32,
    i0: usize,
    i_n: usize,
}

/// A chain keeps one reference sequence, a consistent direction, and a
/// drift between reference and query steps within 50 occurrences.
const MAX_DRIFT: i64 = 50;

impl Block {
    fn breaks_at(&self, r: &Reference, loc: u32) -> bool {
        if r.id[loc as usize] != r.id[self.loc0 as usize] {
            return true;
        }
        let (loc0, loc_n) = (self.loc0 as i64, self.loc_n as i64);
        let step = self.i_n as i64 - self.i0 as i64;
        if loc0 < loc_n {
            (loc as i64) < loc_n || (loc_n - loc0 - step).abs() > MAX_DRIFT
        } else if loc0 > loc_n {
            (loc as i64) > loc_n || (loc0 - loc_n - step).abs() > MAX_DRIFT
        } else {
            false
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn report(
        &self,
        r: &Reference,
        qid: &str,
        qlen: usize,
        seeds: &[(u32, u32)],
        n_copy1: u64,
        n1: u64,
        n2: u64,
        out: &mut dyn Write,
    ) -> Result<()> {
        if n1 <= 2 {
            return Ok(());
        }
        let (l0, ln) = (self.loc0 as usize, self.loc_n as usize);
        let span = (self.loc_n as i64 - self.loc0 as i64).abs().max(1);
        writeln!(
            out,
            "M\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{} {}\t{:.2}\t{:.2}",
            qid,
            seeds[self.i0].1,
            seeds[self.i_n].1,
            qlen,
            r.names[r.id[l0] as usize],
            r.offset[l0],
            r.offset[ln],
            n1,
            n2,
            (n1 + n2) as f64 / span as f64,
            if n_copy1 > 0 {
                n1 as f64 / n_copy1 as f64
            } else {
                0.0
            }
        )?;
        Ok(())
    }
}

// persistence: <root>.mod for the modset, <root>.ref for the occurrences

impl Reference {
    pub fn write_files(&self, root: &str) -> Result<()> {
        self.ms.write_file(format!("{}.mod", root))?;
        let mut f = std::io::BufWriter::new(std::fs::File::create(format!("{}.ref", root))?);
        let out: &mut dyn Write = &mut f;
        out.write_all(REFERENCE_MAGIC)?;
        out.write_u8(match self.selector {
            Selector::Modimizer => 0,
            Selector::Minimizer => 1,
        })?;
        out.write_u32::<LittleEndian>(self.max())?;
        for v in [&self.index, &self.offset, &self.id] {
            for &x in v.iter() {
                out.write_u32::<LittleEndian>(x)?;
            }
        }
        for &d in &self.depth {
            out.write_u32::<LittleEndian>(d)?;
        }
        out.write_u32::<LittleEndian>(self.names.len() as u32)?;
        for (name, &len) in self.names.iter().zip(&self.len) {
            out.write_u32::<LittleEndian>(len)?;
            out.write_u32::<LittleEndian>(name.len() as u32)?;
            out.write_all(name.as_bytes())?;
        }
        Ok(())
    }

    pub fn read_files(root: &str) -> Result<Self> {
        let ms = Modset::read_file(format!("{}.mod", root))?;
        let f = std::fs::File::open(format!("{}.ref", root))?;
        let mut inp = std::io::BufReader::new(f);
        let mut magic = [0u8; 8];
        std::io::Read::read_exact(&mut inp, &mut magic)
            .map_err(|e| anyhow!("failed to read reference header: {}", e))?;
        ensure!(&magic == REFERENCE_MAGIC, "bad reference header");
        let selector = match inp.read_u8()? {
            0 => Selector::Modimizer,
            1 => Selector::Minimizer,
            s => bail!("corrupt reference: unknown selector {}", s),
        };
        let max = inp.read_u32::<LittleEndian>()?;
        let mut r = Reference::new(ms, max.max(1))?;
        r.selector = selector;
        for v in [&mut r.index, &mut r.offset, &mut r.id] {
            v.reserve(max as usize);
            for _ in 0..max {
                v.push(inp.read_u32::<LittleEndian>()?);
            }
        }
        r.depth = Vec::with_capacity(r.ms.max as usize + 1);
        for _ in 0..=r.ms.max {
            r.depth.push(inp.read_u32::<LittleEndian>()?);
        }
        let n_seq = inp.read_u32::<LittleEndian>()?;
        for _ in 0..n_seq {
            r.len.push(inp.read_u32::<LittleEndian>()?);
            let n = inp.read_u32::<LittleEndian>()? as usize;
            let mut name = vec![0u8; n];
            std::io::Read::read_exact(&mut inp, &mut name)?;
            r.names.push(String::from_utf8(name)?);
        }
        r.build_rev();
        Ok(r)
    }
}

/// A single-sequence reference giving each mod one position and strand.
/// Built for anchoring; a mod occurring twice is a fatal inconsistency.
pub struct Anchor {
    pub ms: Modset,
    pub pos: Vec<u32>,
    pub is_f: Vec<bool>,
    pub len: u32,
    pub n_found: u32,
}

impl Anchor {
    pub fn build<P: AsRef<Path>>(seq_file: P, ms: Modset) -> Result<Anchor> {
        let mut anchor = Anchor {
            pos: vec![0; ms.max as usize + 1],
            is_f: vec![false; ms.max as usize + 1],
            len: 0,
            n_found: 0,
            ms,
        };
        let mut reader = SeqReader::open(&seq_file)?;
        let rec = reader
            .next()
            .ok_or_else(|| anyhow!("cannot read reference sequence"))??;
        ensure!(
            reader.next().is_none(),
            "multiple sequences in ref file - only one allowed"
        );
        let hasher = anchor.ms.hasher.clone();
        for hit in ModIter::new(&hasher, &rec.seq) {
            let id = anchor.ms.find(hit.kmer);
            if id == 0 {
                continue;
            }
            ensure!(
                anchor.pos[id as usize] == 0,
                "duplicate mod entry at position {} in ref",
                hit.pos
            );
            anchor.pos[id as usize] = hit.pos;
            anchor.is_f[id as usize] = hit.is_forward;
            if hit.pos >= anchor.len {
                anchor.len = hit.pos + 1;
            }
            anchor.n_found += 1;
        }
        Ok(anchor)
    }
}
