// Reference mapping: sketch a reference genome, then chain query reads
// onto it through their shared modimizer (or minimizer) occurrences.

use anyhow::{anyhow, Context, Result};
use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use mosh::modset::Modset;
use mosh::reference::{Anchor, Reference, Selector};
use mosh::seqhash::Seqhash;

fn main() -> Result<()> {
    let matches = App::new("moshmap")
        .version("0.1")
        .about("Map reads onto a modimizer-sketched reference")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .subcommand(
            SubCommand::with_name("index")
                .about("Sketch a reference fasta")
                .arg(
                    Arg::with_name("ref")
                        .value_name("FASTA")
                        .help("reference genome, optionally gzipped")
                        .required(true),
                )
                .arg(
                    Arg::with_name("kmer")
                        .short("K")
                        .long("kmer")
                        .value_name("k")
                        .default_value("19")
                        .takes_value(true),
                )
                .arg(
                    Arg::with_name("window")
                        .short("W")
                        .long("window")
                        .value_name("w")
                        .default_value("31")
                        .takes_value(true),
                )
                .arg(
                    Arg::with_name("seed")
                        .short("S")
                        .long("seed")
                        .value_name("seed")
                        .default_value("17")
                        .takes_value(true),
                )
                .arg(
                    Arg::with_name("bits")
                        .short("B")
                        .long("bits")
                        .value_name("table_bits")
                        .default_value("28")
                        .takes_value(true),
                )
                .arg(
                    Arg::with_name("minimizer")
                        .long("minimizer")
                        .help("sketch with window minimizers instead of modimizers"),
                )
                .arg(root_arg().required(true)),
        )
        .subcommand(
            SubCommand::with_name("map")
                .about("Chain query sequences onto the reference")
                .arg(root_arg().required(true))
                .arg(
                    Arg::with_name("query")
                        .value_name("FILE")
                        .required(true)
                        .multiple(true),
                )
                .arg(
                    Arg::with_name("verbose")
                        .short("v")
                        .long("verbose")
                        .help("print every seed location"),
                ),
        )
        .subcommand(
            SubCommand::with_name("anchor")
                .about("Check a single-sequence reference for unique mod anchors")
                .arg(
                    Arg::with_name("modset")
                        .short("m")
                        .long("modset")
                        .value_name("MODFILE")
                        .required(true)
                        .takes_value(true),
                )
                .arg(Arg::with_name("seq").value_name("FASTA").required(true)),
        )
        .get_matches();

    let stdout = std::io::stdout();
    let mut out = stdout.lock();

    match matches.subcommand() {
        ("index", Some(m)) => {
            let k: i32 = parse(m, "kmer")?;
            let w: i32 = parse(m, "window")?;
            let sh = Seqhash::new(k, w, parse(m, "seed")?)?;
            println!(
                "  moshmap initialised with k = {}, w = {}, random seed = {}",
                k,
                w,
                sh.seed
            );
            let ms = Modset::new(sh, parse(m, "bits")?, 0)?;
            let mut r = Reference::new(ms, 1 << 26)?;
            if m.is_present("minimizer") {
                r.selector = Selector::Minimizer;
            }
            let fa = m.value_of("ref").unwrap();
            r.fasta_read(fa, true, &mut out)
                .with_context(|| format!("failed to read reference fasta {}", fa))?;
            r.write_files(m.value_of("root").unwrap())?;
        }
        ("map", Some(m)) => {
            let root = m.value_of("root").unwrap();
            let r = Reference::read_files(root)
                .with_context(|| format!("failed to read reference {}", root))?;
            for q in m.values_of("query").unwrap() {
                r.query_file(q, m.is_present("verbose"), &mut out)
                    .with_context(|| format!("failed to process query file {}", q))?;
            }
        }
        ("anchor", Some(m)) => {
            let modfile = m.value_of("modset").unwrap();
            let ms = Modset::read_file(modfile)
                .with_context(|| format!("failed to read mod file {}", modfile))?;
            let max = ms.max;
            let anchor = Anchor::build(m.value_of("seq").unwrap(), ms)?;
            println!(
                "found {} of {} locations in ref length {}",
                anchor.n_found, max, anchor.len
            );
        }
        _ => unreachable!(),
    }
    Ok(())
}

fn root_arg() -> Arg<'static, 'static> {
    Arg::with_name("root")
        .short("r")
        .long("root")
        .value_name("STEM")
        .help("reference file stem (.mod and .ref)")
        .takes_value(true)
}

fn parse<T: std::str::FromStr>(m: &ArgMatches, name: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    let v = m.value_of(name).unwrap();
    v.parse()
        .map_err(|e| anyhow!("bad value {} for {}: {}", v, name, e))
}
