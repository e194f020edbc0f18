//! Overlap discovery over the inverse index. A query read x is compared
//! against every read sharing one of its copy-1 mods; candidates are
//! classified by strand majority, hit order consistency and containment.
//! The engine owns its scratch vectors and clears only the entries a
//! query touched, so repeated queries stay linear in the data they read.

use crate::new_types::hit::{
    BAD_LOW_COPY1, BAD_LOW_HIT, BAD_NO_MATCH, BAD_ORDER1, BAD_ORDER10, BAD_REPEAT,
};
use crate::readset::Readset;
use anyhow::Result;
use std::io::Write;

#[derive(Default, Clone, Debug)]
pub struct Overlap {
    pub iy: u32,     // candidate read id
    pub n_hit: u32,  // shared copy-1 hits
    pub is_plus: bool,
    pub is_contained: bool, // x starts and ends inside iy
    pub n_bad_order: u32,   // shared hits out of order
    pub n_bad_flip: u32,    // shared hits on the minority strand
}

impl Overlap {
    pub fn is_bad(&self) -> bool {
        self.n_bad_order > 0 || self.n_bad_flip > 0
    }
}

/// Reusable query state. One engine per thread; queries need the read
/// set frozen apart from the flag updates they make themselves.
#[derive(Default)]
pub struct OverlapEngine {
    omap: Vec<u32>, // read id -> 1 + index into olap, 0 = unseen
    hmap: Vec<u32>, // mod id -> 1 + hit index in x, 0 = not a copy-1 hit of x
    xpos: Vec<u32>, // prefix sums of x's gaps; xpos[j+1] is the position of hit j
}

impl OverlapEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_scratch(&mut self, rs: &Readset, n_hit_x: usize) {
        if self.omap.len() < rs.reads.len() {
            self.omap.resize(rs.reads.len(), 0);
        }
        let want = rs.ms.max as usize + 1;
        if self.hmap.len() < want {
            self.hmap.resize(want, 0);
        }
        self.xpos.clear();
        self.xpos.resize(n_hit_x + 1, 0);
    }

    /// All overlaps of read `ix` with at least 3 shared copy-1 hits,
    /// best first. Flags on x (badRepeat, badNoMatch and friends) are
    /// updated as a side effect. `report` 0 is silent, 1 prints an RR
    /// line per query, 2 adds an RH line per candidate.
    pub fn find_overlaps(
        &mut self,
        rs: &mut Readset,
        ix: u32,
        report: u8,
        out: &mut dyn Write,
    ) -> Result<Vec<Overlap>> {
        let x = &rs.reads[ix as usize];
        let x_len = x.len;
        let x_n_hit = x.n_hit();
        let x_n_copy1 = x.n_copy[1];
        self.ensure_scratch(rs, x_n_hit);

        let mut olap: Vec<Overlap> = Vec::with_capacity(64);
        let mut n_repeat = 0u32;
        let mut bad_repeat = false;

        let x = &rs.reads[ix as usize];
        for (j, (&h, &dxj)) in x.hit.iter().zip(x.dx.iter()).enumerate() {
            let m = h.ms_id();
            self.xpos[j + 1] = self.xpos[j] + dxj as u32;
            if !rs.ms.is_copy1(m) {
                continue;
            }
            if self.hmap[m as usize] != 0 {
                n_repeat += 1;
                bad_repeat = true;
                continue;
            }
            self.hmap[m as usize] = (j + 1) as u32;
            for &r2 in rs.inv(m) {
                let oi = self.omap[r2 as usize];
                if oi == 0 {
                    olap.push(Overlap {
                        iy: r2,
                        n_hit: 1,
                        ..Default::default()
                    });
                    self.omap[r2 as usize] = olap.len() as u32;
                } else {
                    olap[(oi - 1) as usize].n_hit += 1;
                }
            }
        }

        olap.sort_by(|a, b| b.n_hit.cmp(&a.n_hit));

        // classify every candidate sharing at least 3 hits
        let mut n_good = 0u32;
        let mut n_bad = 0u32;
        let mut keep = olap.len();
        for (kept, o) in olap.iter_mut().enumerate() {
            if o.n_hit < 3 {
                keep = kept;
                break;
            }
            let y = &rs.reads[o.iy as usize];
            if y.flags.is_bad() {
                continue;
            }
            let x = &rs.reads[ix as usize];

            // first pass over y: which strand agrees more
            let mut n_plus = 0u32;
            let mut n_minus = 0u32;
            for &hy in &y.hit {
                let ihx = self.hmap[hy.ms_id() as usize];
                if ihx != 0 {
                    if hy.same_strand(x.hit[(ihx - 1) as usize]) {
                        n_plus += 1;
                    } else {
                        n_minus += 1;
                    }
                }
            }
            let is_plus = n_plus >= n_minus;

            // second pass: order violations and containment
            let mut last: i64 = if is_plus { 0 } else { x_n_hit as i64 + 1 };
            let mut last_diff: i64 = 0;
            let mut first = true;
            let mut y_pos: i64 = 0;
            let mut n_bad_order = 0u32;
            let mut is_contained = false;
            for (jy, &hy) in y.hit.iter().enumerate() {
                y_pos += y.dx[jy] as i64;
                let ihx = self.hmap[hy.ms_id() as usize] as i64;
                if ihx == 0 {
                    continue;
                }
                last_diff = if is_plus {
                    self.xpos[ihx as usize] as i64 - y_pos
                } else {
                    x_len as i64 - self.xpos[ihx as usize] as i64 - y_pos
                };
                if first && last_diff < 0 {
                    is_contained = true; // x starts inside y
                }
                first = false;
                if (is_plus && ihx < last) || (!is_plus && ihx > last) {
                    n_bad_order += 1;
                    if is_plus {
                        n_plus -= 1;
                    } else {
                        n_minus -= 1;
                    }
                }
                last = ihx;
            }
            if is_contained && x_len as i64 - last_diff > y.len as i64 {
                is_contained = false; // x sticks out beyond y's end
            }

            o.is_plus = is_plus;
            o.is_contained = is_contained;
            o.n_bad_order = n_bad_order;
            o.n_bad_flip = if is_plus { n_minus } else { n_plus };
            if o.is_bad() {
                n_bad += 1;
            } else {
                n_good += 1;
            }

            if report > 1 {
                writeln!(
                    out,
                    "RH\t{}\tlen {}\t{}\tnPlus {}\tnMinus {}\t{}",
                    o.iy,
                    y.len,
                    if o.is_bad() { "BAD" } else { "GOOD" },
                    n_plus,
                    n_minus,
                    if o.is_contained { "CONTAINED" } else { "OVERLAP" }
                )?;
            }
        }

        // put the scratch back before truncating away the tail
        let x = &rs.reads[ix as usize];
        for &h in &x.hit {
            if rs.ms.is_copy1(h.ms_id()) {
                self.hmap[h.ms_id() as usize] = 0;
            }
        }
        for o in &olap {
            self.omap[o.iy as usize] = 0;
        }
        olap.truncate(keep);

        if n_good == 0 && n_bad == 0 {
            let flags = &mut rs.reads[ix as usize].flags;
            flags.set(BAD_NO_MATCH);
            if x_n_hit < 10 {
                flags.set(BAD_LOW_HIT);
            } else if x_n_copy1 < 10 {
                flags.set(BAD_LOW_COPY1);
            }
        }
        if bad_repeat {
            rs.reads[ix as usize].flags.set(BAD_REPEAT);
        }

        if report > 0 {
            let x = &rs.reads[ix as usize];
            writeln!(
                out,
                "RR {:6}\tlen {}\tnHit {:3}\tnMiss {:3}\tnCpy {} {} {} {}\tnRepeatMod {}\tnGood {:4}\tnBad {:4}",
                ix, x.len, x.n_hit(), x.n_miss,
                x.n_copy[0], x.n_copy[1], x.n_copy[2], x.n_copy[3],
                n_repeat, n_good, n_bad
            )?;
        }

        Ok(olap)
    }

    /// Pairwise debug report: every shared copy-1 mod with its position
    /// and strand in both reads.
    pub fn print_overlap(
        &self,
        rs: &Readset,
        ix: u32,
        iy: u32,
        out: &mut dyn Write,
    ) -> Result<()> {
        for &i in &[ix, iy] {
            let r = &rs.reads[i as usize];
            writeln!(
                out,
                "RR overlaps_for {}\tlen {}\tnHit {}\tnMiss {}\tnCopy {} {} {} {}",
                i,
                r.len,
                r.n_hit(),
                r.n_miss,
                r.n_copy[0],
                r.n_copy[1],
                r.n_copy[2],
                r.n_copy[3]
            )?;
        }
        let x = &rs.reads[ix as usize];
        let y = &rs.reads[iy as usize];
        let mut x_pos = 0u32;
        for (jx, &hx) in x.hit.iter().enumerate() {
            x_pos += x.dx[jx] as u32;
            let m = hx.ms_id();
            if !rs.ms.is_copy1(m) {
                continue;
            }
            let mut y_pos = 0u32;
            for (jy, &hy) in y.hit.iter().enumerate() {
                y_pos += y.dx[jy] as u32;
                if hy.ms_id() == m {
                    writeln!(
                        out,
                        "RO\t{:8x} {:5} {}\t{} {} {}\t{} {} {}",
                        m,
                        rs.ms.depth[m as usize],
                        if hx.same_strand(hy) { '+' } else { '-' },
                        ix,
                        x_pos,
                        if hx.is_forward() { 'F' } else { 'R' },
                        iy,
                        y_pos,
                        if hy.is_forward() { 'F' } else { 'R' }
                    )?;
                }
            }
        }
        Ok(())
    }
}

/// Label bad reads in three passes, separating reads with many bad
/// overlaps from the collateral damage on their partners. A read pair
/// that stays bad to the end is labeled symmetrically.
pub fn mark_bad_reads(
    rs: &mut Readset,
    engine: &mut OverlapEngine,
    out: &mut dyn Write,
) -> Result<()> {
    let n = rs.reads.len();
    for read in rs.reads.iter_mut() {
        read.flags.clear_bad();
    }

    let mut bad_list = vec![0u32; n * 10]; // up to 10 bad partners per read
    let mut n_bad = vec![0u32; n]; // times a read was the bad partner
    let mut l_bad = vec![0usize; n];

    let mut sink = std::io::sink();
    for ix in 0..n as u32 {
        let olap = engine.find_overlaps(rs, ix, 0, &mut sink)?;
        for o in &olap {
            if o.is_bad() {
                let iy = o.iy as usize;
                n_bad[iy] += 1;
                if n_bad[iy] < 10 && l_bad[ix as usize] < 10 {
                    bad_list[10 * ix as usize + l_bad[ix as usize]] = o.iy;
                    l_bad[ix as usize] += 1;
                }
            }
        }
    }

    // pass 1: ten or more bad overlaps is clearly a bad read
    let mut count = 0u32;
    for ix in 0..n {
        if n_bad[ix] >= 10 {
            rs.reads[ix].flags.set(BAD_ORDER10);
            l_bad[ix] = 0;
            count += 1;
        }
    }
    writeln!(out, "MB  {} with >=10 bad overlaps", count)?;
    drop_bad_partners(rs, &mut bad_list, &mut l_bad);

    // pass 2: two or more surviving bad partners
    count = 0;
    for ix in 0..n {
        if l_bad[ix] >= 2 {
            rs.reads[ix].flags.set(BAD_ORDER1);
            l_bad[ix] = 0;
            count += 1;
        }
    }
    writeln!(out, "MB  {} with multiple bad overlaps", count)?;
    drop_bad_partners(rs, &mut bad_list, &mut l_bad);

    // pass 3: whatever still has a bad partner
    count = 0;
    for ix in 0..n {
        if l_bad[ix] > 0 {
            rs.reads[ix].flags.set(BAD_ORDER1);
            l_bad[ix] = 0;
            count += 1;
        }
    }
    writeln!(out, "MB  {} with single bad overlaps", count)?;
    Ok(())
}

fn drop_bad_partners(rs: &Readset, bad_list: &mut [u32], l_bad: &mut [usize]) {
    for ix in 0..rs.reads.len() {
        let mut i = l_bad[ix];
        while i > 0 {
            i -= 1;
            if rs.reads[bad_list[10 * ix + i] as usize].flags.is_bad() {
                l_bad[ix] -= 1;
                bad_list[10 * ix + i] = bad_list[10 * ix + l_bad[ix]];
            }
        }
    }
}

/// For every good read pick the containing candidate with the most
/// shared hits, if any.
pub fn mark_contained(
    rs: &mut Readset,
    engine: &mut OverlapEngine,
    out: &mut dyn Write,
) -> Result<()> {
    let mut n_contained = 0u64;
    let mut n_not = 0u64;
    let mut tot_len = 0u64;
    let mut sink = std::io::sink();
    for ix in 0..rs.reads.len() as u32 {
        if rs.reads[ix as usize].flags.is_bad() {
            continue;
        }
        let olap = engine.find_overlaps(rs, ix, 0, &mut sink)?;
        let mut max_hit = 0u32;
        let mut contained = 0u32;
        for o in &olap {
            if o.iy == ix || !o.is_contained || o.n_hit <= max_hit {
                continue;
            }
            contained = o.iy;
            max_hit = o.n_hit;
        }
        rs.reads[ix as usize].contained = contained;
        if contained != 0 {
            n_contained += 1;
        } else {
            n_not += 1;
            tot_len += rs.reads[ix as usize].len as u64;
        }
    }
    writeln!(
        out,
        "MC  found {} contained reads, leaving {} not contained, av length {:.1}",
        n_contained,
        n_not,
        if n_not > 0 { tot_len as f64 / n_not as f64 } else { 0.0 }
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modset::Modset;
    use crate::seqhash::{ModHit, Seqhash};

    const A: u64 = 11;
    const B: u64 = 22;
    const C: u64 = 33;
    const D: u64 = 44;

    fn copy1_modset(hashes: &[u64]) -> Result<Modset> {
        let sh = Seqhash::new(3, 4, 1)?;
        let mut ms = Modset::new(sh, 20, 0)?;
        for &h in hashes {
            let id = ms.find_or_add(h)?;
            ms.set_copy1(id);
        }
        Ok(ms)
    }

    fn mk(kmer: u64, pos: u32, f: bool) -> ModHit {
        ModHit {
            kmer,
            pos,
            is_forward: f,
        }
    }

    #[test]
    fn shared_hits_classify_with_one_flip() -> Result<()> {
        let ms = copy1_modset(&[A, B, C, D])?;
        let mut rs = Readset::new(ms)?;
        // x and y share A,B,C in the same order and orientation, and D
        // with orientation flipped in y
        let x = rs.add_read(
            1000,
            vec![
                mk(A, 100, true),
                mk(B, 300, true),
                mk(C, 500, true),
                mk(D, 700, true),
            ]
            .into_iter(),
        );
        let y = rs.add_read(
            1000,
            vec![
                mk(A, 100, true),
                mk(B, 300, true),
                mk(C, 500, true),
                mk(D, 700, false),
            ]
            .into_iter(),
        );
        rs.inv_build();

        let mut engine = OverlapEngine::new();
        let mut sink = std::io::sink();
        let olap = engine.find_overlaps(&mut rs, x, 0, &mut sink)?;
        let oy = olap.iter().find(|o| o.iy == y).expect("y is a candidate");
        assert_eq!(oy.n_hit, 4);
        assert!(oy.is_plus);
        assert_eq!(oy.n_bad_order, 0);
        assert_eq!(oy.n_bad_flip, 1);
        assert!(oy.is_bad());
        // the self overlap is clean
        let ox = olap.iter().find(|o| o.iy == x).unwrap();
        assert_eq!(ox.n_hit, 4);
        assert!(!ox.is_bad());
        Ok(())
    }

    #[test]
    fn reversed_read_is_minus_and_clean() -> Result<()> {
        let ms = copy1_modset(&[A, B, C])?;
        let mut rs = Readset::new(ms)?;
        let x = rs.add_read(
            600,
            vec![mk(A, 100, true), mk(B, 300, true), mk(C, 500, false)].into_iter(),
        );
        // y is x reverse complemented: reversed order, flipped strands,
        // mirrored positions
        let _y = rs.add_read(
            600,
            vec![mk(C, 100, true), mk(B, 300, false), mk(A, 500, false)].into_iter(),
        );
        rs.inv_build();

        let mut engine = OverlapEngine::new();
        let mut sink = std::io::sink();
        let olap = engine.find_overlaps(&mut rs, x, 0, &mut sink)?;
        let oy = olap.iter().find(|o| o.iy == 2).unwrap();
        assert_eq!(oy.n_hit, 3);
        assert!(!oy.is_plus);
        assert_eq!(oy.n_bad_order, 0);
        assert_eq!(oy.n_bad_flip, 0);
        assert!(!oy.is_bad());
        Ok(())
    }

    #[test]
    fn contained_read_is_flagged_and_marked() -> Result<()> {
        let ms = copy1_modset(&[A, B, C, D])?;
        let mut rs = Readset::new(ms)?;
        // x sits inside y: y has the same mods 2000bp further in
        let x = rs.add_read(
            900,
            vec![
                mk(A, 100, true),
                mk(B, 300, true),
                mk(C, 500, true),
                mk(D, 700, true),
            ]
            .into_iter(),
        );
        let y = rs.add_read(
            5000,
            vec![
                mk(A, 2100, true),
                mk(B, 2300, true),
                mk(C, 2500, true),
                mk(D, 2700, true),
            ]
            .into_iter(),
        );
        rs.inv_build();

        let mut engine = OverlapEngine::new();
        let mut sink = std::io::sink();
        let olap = engine.find_overlaps(&mut rs, x, 0, &mut sink)?;
        let oy = olap.iter().find(|o| o.iy == y).unwrap();
        assert!(oy.is_contained);
        assert!(!oy.is_bad());

        mark_contained(&mut rs, &mut engine, &mut sink)?;
        assert_eq!(rs.reads[x as usize].contained, y);
        assert_eq!(rs.reads[y as usize].contained, 0);
        Ok(())
    }

    #[test]
    fn sub_three_candidates_are_dropped_and_repeats_flagged() -> Result<()> {
        let ms = copy1_modset(&[A, B, C])?;
        let mut rs = Readset::new(ms)?;
        // x carries A twice: the repeat is skipped and flagged
        let x = rs.add_read(
            800,
            vec![
                mk(A, 100, true),
                mk(A, 200, true),
                mk(B, 400, true),
                mk(C, 600, true),
            ]
            .into_iter(),
        );
        // y shares only B and C: two hits, below the threshold
        let y = rs.add_read(400, vec![mk(B, 100, true), mk(C, 300, true)].into_iter());
        rs.inv_build();

        let mut engine = OverlapEngine::new();
        let mut sink = std::io::sink();
        let olap = engine.find_overlaps(&mut rs, x, 0, &mut sink)?;
        assert!(olap.iter().all(|o| o.iy != y));
        assert!(rs.reads[x as usize].flags.has(BAD_REPEAT));
        Ok(())
    }

    #[test]
    fn no_candidates_sets_no_match_flags() -> Result<()> {
        let ms = copy1_modset(&[A, B])?;
        let mut rs = Readset::new(ms)?;
        let x = rs.add_read(300, vec![mk(A, 50, true), mk(B, 150, true)].into_iter());
        rs.inv_build();
        let mut engine = OverlapEngine::new();
        let mut sink = std::io::sink();
        let olap = engine.find_overlaps(&mut rs, x, 0, &mut sink)?;
        assert!(olap.is_empty());
        let flags = rs.reads[x as usize].flags;
        assert!(flags.has(BAD_NO_MATCH));
        assert!(flags.has(BAD_LOW_HIT));
        Ok(())
    }

    #[test]
    fn scratch_survives_repeated_queries() -> Result<()> {
        let ms = copy1_modset(&[A, B, C])?;
        let mut rs = Readset::new(ms)?;
        let x = rs.add_read(
            600,
            vec![mk(A, 100, true), mk(B, 300, true), mk(C, 500, true)].into_iter(),
        );
        let y = rs.add_read(
            600,
            vec![mk(A, 110, true), mk(B, 310, true), mk(C, 510, true)].into_iter(),
        );
        rs.inv_build();
        let mut engine = OverlapEngine::new();
        let mut sink = std::io::sink();
        for _ in 0..3 {
            let olap = engine.find_overlaps(&mut rs, x, 0, &mut sink)?;
            assert_eq!(olap.len(), 2);
            let olap = engine.find_overlaps(&mut rs, y, 0, &mut sink)?;
            assert_eq!(olap.len(), 2);
        }
        Ok(())
    }
}
