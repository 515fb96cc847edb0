//! # riverlog
//!
//! The compiler CLI: reads Datalog modules, writes the generated database
//! listing, and optionally the amalgamated module, the data-flow DOT dump,
//! and the interface schema. Exits non-zero iff any user error was
//! recorded.

use anyhow::{Context, Result};
use clap::Parser as ClapParser;
use riverlog::{Compiler, Config};
use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[derive(ClapParser, Debug)]
#[command(name = "riverlog", version, about = "Incremental Datalog compiler")]
struct Args {
    /// Input Datalog modules.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,

    /// Write the generated database listing here.
    #[arg(short = 'o', value_name = "PATH")]
    output: Option<PathBuf>,

    /// Write the combined single-module rendition here.
    #[arg(long = "amalgamation", value_name = "PATH")]
    amalgamation: Option<PathBuf>,

    /// Write the data-flow graph in GraphViz DOT form here.
    #[arg(long = "dot", value_name = "PATH")]
    dot: Option<PathBuf>,

    /// Write the FlatBuffers interface schema here.
    #[arg(long = "interface", value_name = "PATH")]
    interface: Option<PathBuf>,

    /// Module search directory (repeatable).
    #[arg(short = 'M', value_name = "DIR")]
    module_paths: Vec<PathBuf>,

    /// Include search directory (repeatable); searched after -M.
    #[arg(short = 'I', value_name = "DIR")]
    include_paths: Vec<PathBuf>,

    /// System include directory (repeatable); searched last.
    #[arg(long = "isystem", value_name = "DIR")]
    system_paths: Vec<PathBuf>,

    /// Explicit configuration file instead of riverlog.toml.
    #[arg(long = "config", value_name = "PATH")]
    config: Option<PathBuf>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    match run(args) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<bool> {
    let mut config = match &args.config {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => Config::load().context("loading configuration")?,
    };

    // Flag-provided paths take precedence over configured ones.
    let mut search = args.module_paths.clone();
    search.extend(args.include_paths.clone());
    search.extend(std::mem::take(&mut config.modules.search_paths));
    config.modules.search_paths = search;
    config.modules.system_paths.extend(args.system_paths.clone());

    let mut compiler = Compiler::with_config(config);
    let mut ok = true;

    for input in &args.inputs {
        let Some(outcome) = compiler.compile_file(input) else {
            ok = false;
            continue;
        };

        if let Some(path) = &args.output {
            fs::write(path, &outcome.database)
                .with_context(|| format!("writing {}", path.display()))?;
        } else {
            print!("{}", outcome.database);
        }
        if let Some(path) = &args.amalgamation {
            fs::write(path, &outcome.amalgamation)
                .with_context(|| format!("writing {}", path.display()))?;
        }
        if let Some(path) = &args.dot {
            fs::write(path, &outcome.dot)
                .with_context(|| format!("writing {}", path.display()))?;
        }
        if let Some(path) = &args.interface {
            fs::write(path, &outcome.interface)
                .with_context(|| format!("writing {}", path.display()))?;
        }
    }

    for diagnostic in compiler.log().snapshot() {
        eprintln!("{diagnostic}");
    }
    Ok(ok && compiler.log().is_empty())
}
