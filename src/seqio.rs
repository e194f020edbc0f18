//! Sequence input adaptor. The core only ever sees records of
//! `(id, 2-bit bases, length)`; this module maps fasta and fastq files,
//! gzipped or not, onto that contract. N and any other unexpected byte
//! become base 0.

use crate::new_types::twobit::bytes_to_b2;
use anyhow::{anyhow, Result};
use bio::io::{fasta, fastq};
use flate2::read::MultiGzDecoder;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

pub struct SeqRecord {
    pub id: String,
    /// 2-bit codes, one byte per base
    pub seq: Vec<u8>,
}

enum Records {
    Fasta(fasta::Records<BufReader<Box<dyn Read>>>),
    Fastq(fastq::Records<BufReader<Box<dyn Read>>>),
}

pub struct SeqReader {
    records: Records,
}

impl SeqReader {
    /// Open a fasta or fastq file, gzipped or not; "-" reads fasta from
    /// stdin. The format comes from the file name.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<SeqReader> {
        let path = path.as_ref();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        if path.to_str() == Some("-") {
            let inp: Box<dyn Read> = Box::new(std::io::stdin());
            return Ok(SeqReader {
                records: Records::Fasta(fasta::Reader::new(inp).records()),
            });
        }
        let f = File::open(path).map_err(|e| anyhow!("failed to open {}: {}", name, e))?;
        let (inp, stem): (Box<dyn Read>, &str) = if let Some(stem) = name.strip_suffix(".gz") {
            (Box::new(MultiGzDecoder::new(f)), stem)
        } else {
            (Box::new(f), name.as_str())
        };
        let is_fastq = stem.ends_with(".fq") || stem.ends_with(".fastq");
        Ok(SeqReader {
            records: if is_fastq {
                Records::Fastq(fastq::Reader::new(inp).records())
            } else {
                Records::Fasta(fasta::Reader::new(inp).records())
            },
        })
    }
}

impl Iterator for SeqReader {
    type Item = Result<SeqRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        match &mut self.records {
            Records::Fasta(records) => records.next().map(|r| {
                r.map(|rec| SeqRecord {
                    id: rec.id().to_string(),
                    seq: bytes_to_b2(rec.seq()),
                })
                .map_err(|e| anyhow!("fasta read failed: {}", e))
            }),
            Records::Fastq(records) => records.next().map(|r| {
                r.map(|rec| SeqRecord {
                    id: rec.id().to_string(),
                    seq: bytes_to_b2(rec.seq()),
                })
                .map_err(|e| anyhow!("fastq read failed: {}", e))
            }),
        }
    }
}
