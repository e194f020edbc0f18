//! Mod-driven layout traversal. Starting from a copy-1 seed mod, the
//! reads containing it are decomposed into links (from, to, read, x)
//! between successive informative hits, and the traversal repeatedly
//! picks the successor supported by a strict majority of the active
//! reads, advancing every read by the voted gap. The result is a
//! coordinate layout of the reads around the seed.

use crate::new_types::hit::Hit;
use crate::readset::Readset;
use ahash::{AHashMap, AHashSet};
use anyhow::{ensure, Result};
use itertools::Itertools;

/// A link records that `read` continues from hit `from` to hit `to`,
/// with `to` at position `x` in traversal coordinates. `to` 0 is the
/// sentinel for the end of the read.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct Link {
    pub from: u32,
    pub to: u32,
    pub read: u32,
    pub x: u32,
}

/// One read placed by the traversal, in layout coordinates.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct LayoutSpan {
    pub read: u32,
    pub start: i64,
    pub end: i64,
    pub n_hit: u32, // traversal steps this read supported
}

/// How far a read's own gap may sit from the voted median before it
/// counts as a warning.
const GAP_SLACK: i64 = 10;

pub struct LayoutBuilder<'a> {
    rs: &'a Readset,
    links: Vec<Link>,
    range: AHashMap<u32, (u32, u32)>, // links leaving a packed hit
}

struct Active {
    read: u32,
    x: i64, // position of the current `from` in this read
    span: usize,
}

impl<'a> LayoutBuilder<'a> {
    /// Collect and sort the links of every read containing `seed`.
    pub fn new(rs: &'a Readset, seed: u32) -> Result<Self> {
        ensure!(
            seed >= 1 && seed <= rs.ms.max,
            "seed mod {} is out of range",
            seed
        );
        ensure!(rs.ms.is_copy1(seed), "seed mod {} is not copy 1", seed);
        let mut links = Vec::new();
        let mut last_read = 0u32;
        for &r in rs.inv(seed) {
            if r == last_read {
                continue; // the seed repeats within this read
            }
            last_read = r;
            let read = &rs.reads[r as usize];
            // informative hits with their positions
            let mut hits: Vec<(Hit, u32)> = Vec::with_capacity(read.n_hit());
            let mut pos = 0u32;
            for (j, &h) in read.hit.iter().enumerate() {
                pos += read.dx[j] as u32;
                if !rs.ms.is_copy0(h.ms_id()) {
                    hits.push((h, pos));
                }
            }
            if hits.is_empty() {
                continue;
            }
            push_read_links(&mut links, &hits, r, read.len);
            // the reversed-orientation rendering of the same read
            let len = read.len;
            let mut rev: Vec<(Hit, u32)> = hits
                .iter()
                .rev()
                .map(|&(h, p)| (h.flip(), len - p))
                .collect();
            rev.shrink_to_fit();
            push_read_links(&mut links, &rev, r, len);
        }
        links.sort();
        let mut range: AHashMap<u32, (u32, u32)> = AHashMap::new();
        let mut start = 0usize;
        for i in 1..=links.len() {
            if i == links.len() || links[i].from != links[start].from {
                range.insert(links[start].from, (start as u32, i as u32));
                start = i;
            }
        }
        Ok(LayoutBuilder { rs, links, range })
    }

    fn links_from(&self, from: Hit) -> &[Link] {
        match self.range.get(&from.as_u32()) {
            Some(&(s, e)) => &self.links[s as usize..e as usize],
            None => &[],
        }
    }

    /// Walk from `from` by successive majority votes. Spans are emitted
    /// in traversal coordinates, with the starting `from` at 0. Returns
    /// the number of out-of-band gap warnings.
    pub fn extend(&self, from: Hit, spans: &mut Vec<LayoutSpan>) -> u32 {
        let mut active: Vec<Active> = Vec::new();
        let mut by_read: AHashMap<u32, usize> = AHashMap::new();
        let mut placed: AHashSet<u32> = AHashSet::new();

        // reads carrying `from` seed the active set, through whichever
        // rendering carries it on the traversal strand
        let mut last_read = 0u32;
        for &r in self.rs.inv(from.ms_id()) {
            if r == last_read {
                continue;
            }
            last_read = r;
            let read = &self.rs.reads[r as usize];
            let mut pos = 0u32;
            for (j, &h) in read.hit.iter().enumerate() {
                pos += read.dx[j] as u32;
                if h.ms_id() != from.ms_id() {
                    continue;
                }
                let x = if h.same_strand(from) {
                    pos as i64
                } else {
                    read.len as i64 - pos as i64
                };
                by_read.insert(r, active.len());
                placed.insert(r);
                spans.push(LayoutSpan {
                    read: r,
                    start: -x,
                    end: -x + read.len as i64,
                    n_hit: 1,
                });
                active.push(Active {
                    read: r,
                    x,
                    span: spans.len() - 1,
                });
                break; // first occurrence decides
            }
        }

        let mut warnings = 0u32;
        let mut t: i64 = 0;
        let mut from = from;
        struct Tally {
            count: u32,
            d_min: i64,
            ds: Vec<(usize, i64)>,
        }
        while !active.is_empty() {
            let mut tally: AHashMap<u32, Tally> = AHashMap::new();
            for link in self.links_from(from) {
                if link.to == 0 {
                    continue; // read-end sentinel
                }
                if let Some(&ai) = by_read.get(&link.read) {
                    let d = link.x as i64 - active[ai].x;
                    if d <= 0 {
                        continue; // a stale occurrence behind the cursor
                    }
                    let e = tally.entry(link.to).or_insert(Tally {
                        count: 0,
                        d_min: i64::MAX,
                        ds: Vec::new(),
                    });
                    e.count += 1;
                    e.d_min = e.d_min.min(d);
                    e.ds.push((ai, d));
                }
            }

            // strict majority of the active set, smallest gap first
            let mut best: Option<(u32, &Tally)> = None;
            for (&to, tl) in tally.iter() {
                if 2 * tl.count as usize <= active.len() {
                    continue;
                }
                best = match best {
                    Some((bto, b))
                        if (b.d_min, bto) <= (tl.d_min, to) =>
                    {
                        Some((bto, b))
                    }
                    _ => Some((to, tl)),
                };
            }
            let (to, choice) = match best {
                Some(b) => b,
                None => {
                    dbg_print!("no majority past {:?} with {} active", from, active.len());
                    break;
                }
            };

            let unanimous = choice.ds.iter().all(|&(_, d)| d == choice.ds[0].1);
            let d_best = if unanimous {
                choice.ds[0].1
            } else {
                let ds: Vec<i64> = choice.ds.iter().map(|&(_, d)| d).sorted().collect();
                ds[ds.len() / 2]
            };

            // advance: supporters by their own gap, the rest by the vote
            let mut own: AHashMap<usize, i64> = AHashMap::new();
            for &(ai, d) in &choice.ds {
                own.insert(ai, d);
                if (d - d_best).abs() > GAP_SLACK {
                    warnings += 1;
                }
            }
            for (ai, a) in active.iter_mut().enumerate() {
                match own.get(&ai) {
                    Some(&d) => {
                        a.x += d;
                        spans[a.span].n_hit += 1;
                    }
                    None => a.x += d_best,
                }
            }
            t += d_best;

            // retire reads the traversal has walked past
            let mut ai = 0;
            while ai < active.len() {
                if active[ai].x > active[ai].read_len(self.rs) {
                    let gone = active.swap_remove(ai);
                    by_read.remove(&gone.read);
                    if let Some(moved) = active.get(ai) {
                        by_read.insert(moved.read, ai);
                    }
                } else {
                    ai += 1;
                }
            }

            let to_hit = Hit::from_u32(to);
            if self.rs.ms.is_copy1(to_hit.ms_id()) {
                // admit reads joining at this mod, each at most once
                for link in self.links_from(from) {
                    if link.to != to || placed.contains(&link.read) {
                        continue;
                    }
                    placed.insert(link.read);
                    let read = &self.rs.reads[link.read as usize];
                    by_read.insert(link.read, active.len());
                    spans.push(LayoutSpan {
                        read: link.read,
                        start: t - link.x as i64,
                        end: t - link.x as i64 + read.len as i64,
                        n_hit: 1,
                    });
                    active.push(Active {
                        read: link.read,
                        x: link.x as i64,
                        span: spans.len() - 1,
                    });
                }
            }
            from = to_hit;
        }
        warnings
    }
}

impl Active {
    fn read_len(&self, rs: &Readset) -> i64 {
        rs.reads[self.read as usize].len as i64
    }
}

/// Lay out the reads around `seed`, anchored so the seed mod sits at
/// `offset`. Both traversal directions run and their spans merge per
/// read. Returns the spans sorted by start and the warning count.
pub fn layout_from_seed(
    rs: &Readset,
    seed: u32,
    offset: i64,
) -> Result<(Vec<LayoutSpan>, u32)> {
    let builder = LayoutBuilder::new(rs, seed)?;

    let mut fwd = Vec::new();
    let mut warnings = builder.extend(Hit::new(seed, true), &mut fwd);
    let mut bwd = Vec::new();
    warnings += builder.extend(Hit::new(seed, false), &mut bwd);

    let mut merged: AHashMap<u32, LayoutSpan> = AHashMap::new();
    for s in fwd.iter().map(|s| LayoutSpan {
        read: s.read,
        start: offset + s.start,
        end: offset + s.end,
        n_hit: s.n_hit,
    }) {
        merge_span(&mut merged, s);
    }
    // the backward walk runs in mirrored coordinates
    for s in bwd.iter().map(|s| LayoutSpan {
        read: s.read,
        start: offset - s.end,
        end: offset - s.start,
        n_hit: s.n_hit,
    }) {
        merge_span(&mut merged, s);
    }

    let mut spans: Vec<LayoutSpan> = merged.into_iter().map(|(_, s)| s).collect();
    spans.sort_by_key(|s| (s.start, s.read));
    Ok((spans, warnings))
}

fn merge_span(merged: &mut AHashMap<u32, LayoutSpan>, s: LayoutSpan) {
    merged
        .entry(s.read)
        .and_modify(|m| {
            m.start = m.start.min(s.start);
            m.end = m.end.max(s.end);
            m.n_hit += s.n_hit;
        })
        .or_insert(s);
}

fn push_read_links(links: &mut Vec<Link>, hits: &[(Hit, u32)], read: u32, len: u32) {
    links.push(Link {
        from: hits[0].0.as_u32(),
        to: 0,
        read,
        x: 0,
    });
    for pair in hits.windows(2) {
        links.push(Link {
            from: pair[0].0.as_u32(),
            to: pair[1].0.as_u32(),
            read,
            x: pair[1].1,
        });
    }
    links.push(Link {
        from: hits[hits.len() - 1].0.as_u32(),
        to: 0,
        read,
        x: len,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modset::Modset;
    use crate::seqhash::{ModHit, Seqhash};

    const M: [u64; 5] = [11, 22, 33, 44, 55];

    fn mk(kmer: u64, pos: u32) -> ModHit {
        ModHit {
            kmer,
            pos,
            is_forward: true,
        }
    }

    /// Three reads tiling the same region: mods M0..M4 spaced 100bp,
    /// reads shifted by one mod each.
    fn tiling_readset() -> Result<Readset> {
        let sh = Seqhash::new(3, 4, 1)?;
        let mut ms = Modset::new(sh, 20, 0)?;
        for &h in &M {
            let id = ms.find_or_add(h)?;
            ms.set_copy1(id);
        }
        let mut rs = Readset::new(ms)?;
        rs.add_read(
            350,
            vec![mk(M[0], 50), mk(M[1], 150), mk(M[2], 250)].into_iter(),
        );
        rs.add_read(
            350,
            vec![mk(M[1], 50), mk(M[2], 150), mk(M[3], 250)].into_iter(),
        );
        rs.add_read(
            350,
            vec![mk(M[2], 50), mk(M[3], 150), mk(M[4], 250)].into_iter(),
        );
        rs.inv_build();
        Ok(rs)
    }

    #[test]
    fn seed_must_be_copy1() -> Result<()> {
        let rs = tiling_readset()?;
        assert!(LayoutBuilder::new(&rs, 0).is_err());
        let mut rs = rs;
        rs.ms.set_copy0(1);
        assert!(LayoutBuilder::new(&rs, 1).is_err());
        Ok(())
    }

    #[test]
    fn end_seed_places_its_read_at_the_anchor() -> Result<()> {
        let rs = tiling_readset()?;
        // only read 1 contains M0, so the layout is that read alone,
        // anchored with the seed at 1000
        let seed = rs.ms.find(M[0]);
        let (spans, warnings) = layout_from_seed(&rs, seed, 1000)?;
        assert_eq!(warnings, 0);
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].read, 1);
        // the seed sits 50bp into read 1
        assert_eq!(spans[0].start, 950);
        assert_eq!(spans[0].end, 950 + 350);
        // the walk supported M0 -> M1 -> M2 plus the seed itself
        assert_eq!(spans[0].n_hit, 4);
        Ok(())
    }

    #[test]
    fn disagreeing_gap_warns_but_still_advances() -> Result<()> {
        let sh = Seqhash::new(3, 4, 1)?;
        let mut ms = Modset::new(sh, 20, 0)?;
        for &h in &M[..2] {
            let id = ms.find_or_add(h)?;
            ms.set_copy1(id);
        }
        let mut rs = Readset::new(ms)?;
        rs.add_read(400, vec![mk(M[0], 50), mk(M[1], 150)].into_iter());
        rs.add_read(400, vec![mk(M[0], 50), mk(M[1], 150)].into_iter());
        // one read sees a 130bp gap instead of 100
        rs.add_read(400, vec![mk(M[0], 50), mk(M[1], 180)].into_iter());
        rs.inv_build();

        let seed = rs.ms.find(M[0]);
        let (spans, warnings) = layout_from_seed(&rs, seed, 0)?;
        assert_eq!(warnings, 1);
        assert_eq!(spans.len(), 3);
        assert!(spans.iter().all(|s| s.start == -50));
        Ok(())
    }

    #[test]
    fn split_successors_stop_the_walk() -> Result<()> {
        let sh = Seqhash::new(3, 4, 1)?;
        let mut ms = Modset::new(sh, 20, 0)?;
        for &h in &M[..3] {
            let id = ms.find_or_add(h)?;
            ms.set_copy1(id);
        }
        let mut rs = Readset::new(ms)?;
        // the two reads continue from the seed to different mods, so no
        // strict majority exists
        rs.add_read(300, vec![mk(M[0], 50), mk(M[1], 150)].into_iter());
        rs.add_read(300, vec![mk(M[0], 50), mk(M[2], 150)].into_iter());
        rs.inv_build();

        let seed = rs.ms.find(M[0]);
        let (spans, _) = layout_from_seed(&rs, seed, 0)?;
        assert_eq!(spans.len(), 2);
        // nothing beyond the seed was supported: each direction only
        // counts the seed occurrence itself
        assert!(spans.iter().all(|s| s.n_hit == 2 && s.start == -50));
        Ok(())
    }

    #[test]
    fn seed_in_middle_extends_both_ways() -> Result<()> {
        let rs = tiling_readset()?;
        let seed = rs.ms.find(M[2]); // present in all three reads
        let (spans, _) = layout_from_seed(&rs, seed, 0)?;
        assert_eq!(spans.len(), 3);
        // read 1 has M2 at 250, read 2 at 150, read 3 at 50
        let s1 = spans.iter().find(|s| s.read == 1).unwrap();
        let s2 = spans.iter().find(|s| s.read == 2).unwrap();
        let s3 = spans.iter().find(|s| s.read == 3).unwrap();
        assert_eq!(s1.start, -250);
        assert_eq!(s2.start, -150);
        assert_eq!(s3.start, -50);
        assert_eq!(s3.end, 300);
        Ok(())
    }

    #[test]
    fn reversed_read_joins_the_layout() -> Result<()> {
        let sh = Seqhash::new(3, 4, 1)?;
        let mut ms = Modset::new(sh, 20, 0)?;
        for &h in &M[..3] {
            let id = ms.find_or_add(h)?;
            ms.set_copy1(id);
        }
        let mut rs = Readset::new(ms)?;
        rs.add_read(
            300,
            vec![mk(M[0], 50), mk(M[1], 150), mk(M[2], 250)].into_iter(),
        );
        // the same stretch sequenced the other way round
        let rev = vec![
            ModHit {
                kmer: M[2],
                pos: 50,
                is_forward: false,
            },
            ModHit {
                kmer: M[1],
                pos: 150,
                is_forward: false,
            },
            ModHit {
                kmer: M[0],
                pos: 250,
                is_forward: false,
            },
        ];
        rs.add_read(300, rev.into_iter());
        rs.inv_build();

        let seed = rs.ms.find(M[0]);
        let (spans, warnings) = layout_from_seed(&rs, seed, 0)?;
        assert_eq!(warnings, 0);
        assert_eq!(spans.len(), 2);
        let s2 = spans.iter().find(|s| s.read == 2).unwrap();
        // read 2 carries the seed 250bp in, on the other strand
        assert_eq!(s2.start, -50);
        assert_eq!(s2.end, 250);
        Ok(())
    }
}
