use std::fs::{self, File};
use std::io::{self, Read, Write, stdout};
use std::time::Instant;

use clap::{Parser, ValueEnum};
use tracing_subscriber::filter::EnvFilter;

use crate::*;
use crate::ast::Node;
use crate::lower::build_script;
use crate::script::CompiledScript;
use crate::vm::{Endian, Target, VmRevision};

macro_rules! crash {
    ($ret:literal : $($tt:tt)*) => {{
        eprintln!($($tt)*);
        std::process::exit($ret);
    }}
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Game {
    T7,
    T8,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Platform {
    Pc,
    Ps4,
    Xb1,
    Ps3,
    Xbox,
}

fn get_target(game: Game, platform: Platform) -> Target {
    match (game, platform) {
        (Game::T7, Platform::Pc | Platform::Ps4 | Platform::Xb1) => Target::t7_pc(),
        (Game::T7, Platform::Ps3 | Platform::Xbox) => Target::t7_console(),
        (Game::T8, Platform::Pc | Platform::Ps4 | Platform::Xb1) => Target::t8(),
        (Game::T8, platform) => crash!(3: "{platform:?} is not a supported platform for {game:?}"),
    }
}

/// Script compiler actions that can be performed
#[derive(Parser, Debug)]
pub enum Mode {
    /// Compiles a single syntax tree into a script image
    Compile {
        /// Path to the (json) syntax tree
        src: String,
        /// The game whose VM the image targets
        #[clap(long, value_enum, default_value_t = Game::T7)]
        game: Game,
        /// The platform, which determines the byte order of the image
        #[clap(long, value_enum, default_value_t = Platform::Pc)]
        platform: Platform,
        /// The script path stored in the image
        #[clap(long, default_value_t = String::from("scripts/custom/main.gsc"))]
        name: String,
        /// Where to write the image (default: the source path with a .gscc extension)
        #[clap(long)]
        output: Option<String>,
        /// Where to write the hash map, which maps every hash in the image back to its identifier
        #[clap(long)]
        hashmap: Option<String>,
        /// Marks calls to developer-only engine functions as debug imports
        #[clap(long)]
        dev_calls: bool,
    },
    /// Prints the identifier hashes used by a game
    Hash {
        /// The identifiers to hash
        names: Vec<String>,
        /// The game whose hash functions are used
        #[clap(long, value_enum, default_value_t = Game::T7)]
        game: Game,
    },
    /// Compiles a single syntax tree and dumps the resulting image to stdout
    Dump {
        /// Path to the (json) syntax tree
        src: String,
        /// The game whose VM the image targets
        #[clap(long, value_enum, default_value_t = Game::T7)]
        game: Game,
        /// The platform, which determines the byte order of the image
        #[clap(long, value_enum, default_value_t = Platform::Pc)]
        platform: Platform,
    },
}

#[derive(Parser, Debug)]
#[clap(name = "gscc", version, about = "Compiles GSC syntax trees into script images")]
pub struct Args {
    #[clap(subcommand)]
    pub mode: Mode,
    /// Logs every committed section and function
    #[clap(long, short, global = true)]
    pub verbose: bool,
}

fn read_file(src: &str) -> io::Result<String> {
    let mut file = File::open(src)?;
    let mut s = String::new();
    file.read_to_string(&mut s)?;
    Ok(s)
}

fn init_logging(verbose: bool) {
    let filter = match verbose {
        true => EnvFilter::new("debug"),
        false => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(io::stderr).init();
}

fn compile_file(src: &str, settings: CompileSettings) -> (CompiledScript, std::time::Duration) {
    let content = read_file(src).unwrap_or_else(|e| crash!(1: "failed to read file '{src}': {e}"));
    let tree = Node::from_json(&content).unwrap_or_else(|e| crash!(2: "{e}"));

    let start = Instant::now();
    let script = build_script(settings, &tree).unwrap_or_else(|e| crash!(2: "failed to compile '{src}': {e}"));
    let build_time = start.elapsed();
    let compiled = script.compile().unwrap_or_else(|e| crash!(2: "failed to compile '{src}': {e}"));
    (compiled, build_time)
}

fn dump_image(compiled: &CompiledScript, f: &mut dyn Write) -> io::Result<()> {
    writeln!(f, "sections:")?;
    for record in compiled.records.iter() {
        writeln!(f, "{:08x}  {:>8}  {:?}", record.base, record.size, record.kind)?;
    }
    writeln!(f, "\nfunctions:")?;
    for layout in compiled.layouts.iter() {
        writeln!(f, "{:08x}  {:>8}  crc {:08x}  {} ({} params, {} instructions)", layout.address, layout.size, layout.crc, layout.name, layout.params, layout.instructions.len())?;
    }
    writeln!(f, "\nimage:")?;
    util::hex_dump(&compiled.image, 0, f)?;
    writeln!(f, "\ntotal size: {}", compiled.image.len())
}

pub fn run(args: Args) {
    init_logging(args.verbose);
    match args.mode {
        Mode::Compile { src, game, platform, name, output, hashmap, dev_calls } => {
            let settings = CompileSettings {
                target: get_target(game, platform),
                script_name: name.into(),
                flag_dev_calls: dev_calls,
                ..Default::default()
            };
            let (compiled, build_time) = compile_file(&src, settings);

            let output = output.unwrap_or_else(|| format!("{}.gscc", src.strip_suffix(".json").unwrap_or(&src)));
            fs::write(&output, &compiled.image).unwrap_or_else(|e| crash!(4: "failed to write '{output}': {e}"));
            if let Some(hashmap) = hashmap {
                let json = serde_json::to_string_pretty(&compiled.hash_map()).unwrap_or_else(|e| crash!(4: "failed to serialize hash map: {e}"));
                fs::write(&hashmap, json).unwrap_or_else(|e| crash!(4: "failed to write '{hashmap}': {e}"));
            }

            println!("wrote {} bytes to '{output}'", compiled.image.len());
            println!("build:  {:?}", build_time);
            println!("commit: {:?}", compiled.commit_time);
            println!("total:  {:?}", build_time + compiled.commit_time);
        }
        Mode::Hash { names, game } => {
            for name in names.iter() {
                match game {
                    Game::T7 => println!("{name}: {:08x}", hash::hash32(name)),
                    Game::T8 => println!("{name}: {:08x} {:016x}", hash::t8_hash32(name), hash::t8_hash64(name)),
                }
            }
        }
        Mode::Dump { src, game, platform } => {
            let target = get_target(game, platform);
            let (compiled, _) = compile_file(&src, CompileSettings { target, ..Default::default() });
            let endian = match target.endian { Endian::Little => "little", Endian::Big => "big" };
            let vm = match target.vm { VmRevision::T7 => "legacy", VmRevision::Vm36 => "vm36" };
            println!("target: {vm} vm, {endian} endian\n");
            dump_image(&compiled, &mut stdout().lock()).unwrap_or_else(|e| crash!(4: "failed to write dump: {e}"));
        }
    }
}
