// Read set analysis: build a read set against a modset, report stats,
// query overlaps, classify bad and contained reads, clean mod
// annotations, and lay out reads around a seed mod.

use anyhow::{anyhow, Context, Result};
use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use mosh::cleaner::{clean_mods, ld_test};
use mosh::layout::layout_from_seed;
use mosh::modset::Modset;
use mosh::overlap::{mark_bad_reads, mark_contained, OverlapEngine};
use mosh::readset::Readset;
use std::io::Write;

fn main() -> Result<()> {
    let matches = App::new("moshasm")
        .version("0.1")
        .about("Read sets, overlaps and layouts over modimizer sketches")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .subcommand(
            SubCommand::with_name("build")
                .about("Build a read set from a modset and a sequence file")
                .arg(
                    Arg::with_name("modset")
                        .short("m")
                        .long("modset")
                        .value_name("MODFILE")
                        .required(true)
                        .takes_value(true),
                )
                .arg(
                    Arg::with_name("seqfile")
                        .value_name("FILE")
                        .required(true),
                )
                .arg(root_arg("write the read set under this file stem").required(true)),
        )
        .subcommand(
            SubCommand::with_name("stats")
                .about("Read set summary statistics")
                .arg(root_arg("read set file stem").required(true)),
        )
        .subcommand(
            SubCommand::with_name("overlaps")
                .about("Find overlaps for one read")
                .arg(root_arg("read set file stem").required(true))
                .arg(Arg::with_name("read").value_name("READ").required(true))
                .arg(
                    Arg::with_name("level")
                        .short("l")
                        .long("level")
                        .value_name("LEVEL")
                        .default_value("2")
                        .help("1 per-read lines, 2 adds per-overlap lines")
                        .takes_value(true),
                ),
        )
        .subcommand(
            SubCommand::with_name("sample")
                .about("Overlap stats for every k-th read")
                .arg(root_arg("read set file stem").required(true))
                .arg(Arg::with_name("step").value_name("STEP").required(true)),
        )
        .subcommand(
            SubCommand::with_name("pair")
                .about("Print the shared mods of two reads")
                .arg(root_arg("read set file stem").required(true))
                .arg(Arg::with_name("x").value_name("READ1").required(true))
                .arg(Arg::with_name("y").value_name("READ2").required(true)),
        )
        .subcommand(
            SubCommand::with_name("markbad")
                .about("Identify and categorise bad reads")
                .arg(root_arg("read set file stem").required(true))
                .arg(write_arg()),
        )
        .subcommand(
            SubCommand::with_name("contained")
                .about("Identify contained reads")
                .arg(root_arg("read set file stem").required(true))
                .arg(write_arg()),
        )
        .subcommand(
            SubCommand::with_name("clean")
                .about("Set repeat/internal/minor mod annotations")
                .arg(root_arg("read set file stem").required(true))
                .arg(write_arg()),
        )
        .subcommand(
            SubCommand::with_name("ldtest")
                .about("Demote copy-1 mods with inconsistent neighbourhoods")
                .arg(root_arg("read set file stem").required(true))
                .arg(Arg::with_name("min").value_name("dmin").required(true))
                .arg(
                    Arg::with_name("max")
                        .value_name("dmax")
                        .default_value("0")
                        .help("0 for unbounded"),
                )
                .arg(write_arg()),
        )
        .subcommand(
            SubCommand::with_name("layout")
                .about("Lay out reads around a copy-1 seed mod")
                .arg(root_arg("read set file stem").required(true))
                .arg(Arg::with_name("seed").value_name("MOD").required(true))
                .arg(
                    Arg::with_name("offset")
                        .short("x")
                        .long("offset")
                        .value_name("OFFSET")
                        .default_value("0")
                        .help("layout coordinate of the seed mod")
                        .takes_value(true),
                ),
        )
        .get_matches();

    let stdout = std::io::stdout();
    let mut out = stdout.lock();

    match matches.subcommand() {
        ("build", Some(m)) => {
            let modfile = m.value_of("modset").unwrap();
            let ms = Modset::read_file(modfile)
                .with_context(|| format!("failed to read mod file {}", modfile))?;
            let mut rs = Readset::new(ms)?;
            let seqfile = m.value_of("seqfile").unwrap();
            rs.file_read(seqfile)
                .with_context(|| format!("failed to read sequence file {}", seqfile))?;
            rs.stats(&mut out)?;
            rs.write_files(m.value_of("root").unwrap())?;
        }
        ("stats", Some(m)) => {
            load(m)?.stats(&mut out)?;
        }
        ("overlaps", Some(m)) => {
            let mut rs = load(m)?;
            let ix: u32 = parse(m, "read")?;
            check_read(&rs, ix)?;
            let level: u8 = parse(m, "level")?;
            let mut engine = OverlapEngine::new();
            engine.find_overlaps(&mut rs, ix, level, &mut out)?;
        }
        ("sample", Some(m)) => {
            let mut rs = load(m)?;
            let step: usize = parse(m, "step")?;
            anyhow::ensure!(step > 0, "step must be positive");
            let mut engine = OverlapEngine::new();
            let mut ix = step;
            while ix < rs.reads.len() {
                engine.find_overlaps(&mut rs, ix as u32, 1, &mut out)?;
                ix += step;
            }
        }
        ("pair", Some(m)) => {
            let rs = load(m)?;
            let (x, y) = (parse(m, "x")?, parse(m, "y")?);
            check_read(&rs, x)?;
            check_read(&rs, y)?;
            let engine = OverlapEngine::new();
            engine.print_overlap(&rs, x, y, &mut out)?;
        }
        ("markbad", Some(m)) => {
            let mut rs = load(m)?;
            let mut engine = OverlapEngine::new();
            mark_bad_reads(&mut rs, &mut engine, &mut out)?;
            save(&rs, m)?;
        }
        ("contained", Some(m)) => {
            let mut rs = load(m)?;
            let mut engine = OverlapEngine::new();
            mark_contained(&mut rs, &mut engine, &mut out)?;
            save(&rs, m)?;
        }
        ("clean", Some(m)) => {
            let mut rs = load(m)?;
            clean_mods(&mut rs);
            rs.stats(&mut out)?;
            save(&rs, m)?;
        }
        ("ldtest", Some(m)) => {
            let mut rs = load(m)?;
            let demoted = ld_test(&mut rs, parse(m, "min")?, parse(m, "max")?);
            writeln!(out, "LD  demoted {} mods to copy 0", demoted)?;
            save(&rs, m)?;
        }
        ("layout", Some(m)) => {
            let rs = load(m)?;
            let seed: u32 = parse(m, "seed")?;
            let offset: i64 = parse(m, "offset")?;
            let (spans, warnings) = layout_from_seed(&rs, seed, offset)?;
            for s in &spans {
                writeln!(
                    out,
                    "LO\t{}\t{}\t{}\t{}",
                    s.read, s.start, s.end, s.n_hit
                )?;
            }
            if warnings > 0 {
                eprintln!("  layout finished with {} gap warnings", warnings);
            }
        }
        _ => unreachable!(),
    }
    Ok(())
}

fn root_arg(help: &'static str) -> Arg<'static, 'static> {
    Arg::with_name("root")
        .short("r")
        .long("root")
        .value_name("STEM")
        .help(help)
        .takes_value(true)
}

fn write_arg() -> Arg<'static, 'static> {
    Arg::with_name("write")
        .short("w")
        .long("write")
        .value_name("STEM")
        .help("write the updated read set under this stem (defaults to the input)")
        .takes_value(true)
}

fn load(m: &ArgMatches) -> Result<Readset> {
    let root = m.value_of("root").unwrap();
    Readset::read_files(root).with_context(|| format!("failed to read read set {}", root))
}

fn save(rs: &Readset, m: &ArgMatches) -> Result<()> {
    let root = m
        .value_of("write")
        .or_else(|| m.value_of("root"))
        .ok_or_else(|| anyhow!("no output stem"))?;
    rs.write_files(root)
        .with_context(|| format!("failed to write read set {}", root))
}

fn check_read(rs: &Readset, ix: u32) -> Result<()> {
    anyhow::ensure!(
        ix >= 1 && (ix as usize) < rs.reads.len(),
        "read {} is out of range (1..{})",
        ix,
        rs.reads.len()
    );
    Ok(())
}

fn parse<T: std::str::FromStr>(m: &ArgMatches, name: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    let v = m.value_of(name).unwrap();
    v.parse()
        .map_err(|e| anyhow!("bad value {} for {}: {}", v, name, e))
}
