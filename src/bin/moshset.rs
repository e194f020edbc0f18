// Build and maintain modset files: create, add sequence, merge, prune,
// reassign copy classes, histogram and depth reports. Each subcommand
// loads the current modset, mutates it, and writes it back, so state
// accumulates through the .mod file across invocations.

use anyhow::{anyhow, Context, Result};
use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use mosh::modset::Modset;
use mosh::seqhash::Seqhash;
use std::io::Write;

fn main() -> Result<()> {
    let matches = App::new("moshset")
        .version("0.1")
        .about("Build and maintain modimizer sets")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .subcommand(
            SubCommand::with_name("create")
                .about("Create an empty modset")
                .arg(
                    Arg::with_name("bits")
                        .short("B")
                        .long("bits")
                        .value_name("table_bits")
                        .default_value("28")
                        .help("hash index table bit count (20-34)")
                        .takes_value(true),
                )
                .arg(
                    Arg::with_name("kmer")
                        .short("k")
                        .long("kmer")
                        .value_name("k")
                        .default_value("19")
                        .takes_value(true),
                )
                .arg(
                    Arg::with_name("mod")
                        .short("w")
                        .long("mod")
                        .value_name("w")
                        .default_value("31")
                        .help("modimizer divisor")
                        .takes_value(true),
                )
                .arg(
                    Arg::with_name("seed")
                        .short("s")
                        .long("seed")
                        .value_name("seed")
                        .default_value("17")
                        .takes_value(true),
                )
                .arg(
                    Arg::with_name("size")
                        .short("n")
                        .long("size")
                        .value_name("entries")
                        .default_value("0")
                        .help("maximum entries (0 takes a quarter of the table)")
                        .takes_value(true),
                )
                .arg(out_arg().required(true)),
        )
        .subcommand(
            SubCommand::with_name("add")
                .about("Add modimizers from sequence files")
                .arg(mod_arg())
                .arg(out_arg())
                .arg(
                    Arg::with_name("seqfile")
                        .value_name("FILE")
                        .help("fasta/fastq, gzipped or not")
                        .required(true)
                        .multiple(true),
                ),
        )
        .subcommand(
            SubCommand::with_name("merge")
                .about("Merge another modset into the current one")
                .arg(mod_arg())
                .arg(out_arg())
                .arg(
                    Arg::with_name("other")
                        .value_name("MODFILE")
                        .required(true)
                        .multiple(true),
                ),
        )
        .subcommand(
            SubCommand::with_name("prune")
                .about("Keep entries with min <= depth < max")
                .arg(mod_arg())
                .arg(out_arg())
                .arg(Arg::with_name("min").value_name("min").required(true))
                .arg(
                    Arg::with_name("max")
                        .value_name("max")
                        .default_value("0")
                        .help("0 for unbounded"),
                ),
        )
        .subcommand(
            SubCommand::with_name("setcopy")
                .about("Reassign copy classes from depth thresholds")
                .arg(mod_arg())
                .arg(out_arg())
                .arg(Arg::with_name("copy1min").value_name("copy1min").required(true))
                .arg(Arg::with_name("copy2min").value_name("copy2min").required(true))
                .arg(Arg::with_name("copyMmin").value_name("copyMmin").required(true)),
        )
        .subcommand(
            SubCommand::with_name("setcopym")
                .about("Set copy M on entries at or above the threshold")
                .arg(mod_arg())
                .arg(out_arg())
                .arg(Arg::with_name("copyMmin").value_name("copyMmin").required(true)),
        )
        .subcommand(
            SubCommand::with_name("stats")
                .about("Print a modset summary")
                .arg(mod_arg()),
        )
        .subcommand(
            SubCommand::with_name("hist")
                .about("Print the depth histogram")
                .arg(mod_arg()),
        )
        .subcommand(
            SubCommand::with_name("depths")
                .about("Report per-entry depths, also in other modsets")
                .arg(mod_arg())
                .arg(
                    Arg::with_name("other")
                        .value_name("MODFILE")
                        .multiple(true),
                ),
        )
        .get_matches();

    let stdout = std::io::stdout();
    let mut out = stdout.lock();

    match matches.subcommand() {
        ("create", Some(m)) => {
            let sh = Seqhash::new(parse(m, "kmer")?, parse(m, "mod")?, parse(m, "seed")?)?;
            sh.report(&mut out)?;
            let ms = Modset::new(sh, parse(m, "bits")?, parse(m, "size")?)?;
            ms.write_file(m.value_of("out").unwrap())?;
        }
        ("add", Some(m)) => {
            let mut ms = load(m)?;
            for f in m.values_of("seqfile").unwrap() {
                ms.add_seq_file(f, &mut out)
                    .with_context(|| format!("failed to add sequence file {}", f))?;
            }
            ms.summary(&mut out)?;
            save(&ms, m)?;
        }
        ("merge", Some(m)) => {
            let mut ms = load(m)?;
            for f in m.values_of("other").unwrap() {
                let other = Modset::read_file(f)?;
                other.summary(&mut out)?;
                if let Err(e) = ms.merge(&other) {
                    // an incompatible modset leaves the target unchanged
                    eprintln!("modset {} not merged: {}", f, e);
                }
            }
            ms.summary(&mut out)?;
            save(&ms, m)?;
        }
        ("prune", Some(m)) => {
            let mut ms = load(m)?;
            ms.prune(parse(m, "min")?, parse(m, "max")?)?;
            ms.summary(&mut out)?;
            save(&ms, m)?;
        }
        ("setcopy", Some(m)) => {
            let mut ms = load(m)?;
            ms.set_copy_thresholds(
                parse(m, "copy1min")?,
                parse(m, "copy2min")?,
                parse(m, "copyMmin")?,
            );
            ms.summary(&mut out)?;
            save(&ms, m)?;
        }
        ("setcopym", Some(m)) => {
            let mut ms = load(m)?;
            ms.set_copy_m_threshold(parse(m, "copyMmin")?);
            ms.summary(&mut out)?;
            save(&ms, m)?;
        }
        ("stats", Some(m)) => {
            load(m)?.summary(&mut out)?;
        }
        ("hist", Some(m)) => {
            let ms = load(m)?;
            for (d, &n) in ms.depth_histogram().iter().enumerate() {
                if n != 0 {
                    writeln!(out, "DP\t{}\t{}", d, n)?;
                }
            }
        }
        ("depths", Some(m)) => {
            let ms = load(m)?;
            let mut others = Vec::new();
            if let Some(files) = m.values_of("other") {
                for f in files {
                    others.push(Modset::read_file(f)?);
                }
            }
            ms.report_depths(&others, &mut out)?;
        }
        _ => unreachable!(),
    }
    Ok(())
}

fn mod_arg() -> Arg<'static, 'static> {
    Arg::with_name("modset")
        .short("m")
        .long("modset")
        .value_name("MODFILE")
        .help("the current modset file")
        .required(true)
        .takes_value(true)
}

fn out_arg() -> Arg<'static, 'static> {
    Arg::with_name("out")
        .short("o")
        .long("out")
        .value_name("MODFILE")
        .help("where to write the resulting modset (defaults to the input)")
        .required(false)
        .takes_value(true)
}

fn load(m: &ArgMatches) -> Result<Modset> {
    let f = m.value_of("modset").unwrap();
    Modset::read_file(f).with_context(|| format!("failed to read mod file {}", f))
}

fn save(ms: &Modset, m: &ArgMatches) -> Result<()> {
    let f = m
        .value_of("out")
        .or_else(|| m.value_of("modset"))
        .ok_or_else(|| anyhow!("no output file"))?;
    ms.write_file(f)
        .with_context(|| format!("failed to write mod file {}", f))
}

fn parse<T: std::str::FromStr>(m: &ArgMatches, name: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    let v = m.value_of(name).unwrap();
    v.parse()
        .map_err(|e| anyhow!("bad value {} for {}: {}", v, name, e))
}
