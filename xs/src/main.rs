//! Command-line driver for the X#/XAssembly/Xenon toolchain, a thin
//! `clap` derive wrapper around `xtc`'s three pipeline stages. Grounded
//! on `vex/src/main.rs`'s mutually-exclusive-input handling (there:
//! `PROGRAM` vs `--assembly`; here: one subcommand per stage instead of
//! one flag per input kind, since `clap`'s derive subcommands model that
//! more directly than the teacher's `ArgGroup`).

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "xs", about = "X# compiler, XAssembly assembler, and Xenon VM")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Compile X# source to XAssembly.
    Compile {
        source: PathBuf,
        #[arg(long)]
        strip_trailing_load_result: bool,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Assemble XAssembly text to a Xenon binary.
    Assemble {
        assembly: PathBuf,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Run a Xenon binary.
    Run {
        binary: PathBuf,
        #[arg(long)]
        max_steps: Option<u64>,
        #[arg(long)]
        hz: Option<u32>,
    },
    /// Compile, assemble and run X# source in one shot.
    Pipeline {
        source: PathBuf,
        #[arg(long)]
        strip_trailing_load_result: bool,
        #[arg(long)]
        max_steps: Option<u64>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Compile { source, strip_trailing_load_result, output } => {
            let text = fs::read_to_string(&source).with_context(|| format!("reading {}", source.display()))?;
            let instructions = xtc::compile(&text, strip_trailing_load_result).map_err(|e| anyhow::anyhow!("{e}"))?;
            write_lines(output, &instructions)
        }
        Command::Assemble { assembly, output } => {
            let text = fs::read_to_string(&assembly).with_context(|| format!("reading {}", assembly.display()))?;
            let lines: Vec<String> = text.lines().map(str::to_string).collect();
            let binary = xtc::assemble(&lines).map_err(|e| anyhow::anyhow!("{e}"))?;
            write_lines(output, &binary)
        }
        Command::Run { binary, max_steps, hz } => {
            let text = fs::read_to_string(&binary).with_context(|| format!("reading {}", binary.display()))?;
            let lines: Vec<String> = text.lines().map(str::to_string).collect();
            let result = match hz {
                Some(hz) => xtc::run_clocked(&lines, hz, max_steps),
                None => xtc::run(&lines, max_steps),
            }
            .map_err(|e| anyhow::anyhow!("{e}"))?;
            print_result(&result);
            Ok(())
        }
        Command::Pipeline { source, strip_trailing_load_result, max_steps } => {
            let text = fs::read_to_string(&source).with_context(|| format!("reading {}", source.display()))?;
            let result = xtc::pipeline(&text, strip_trailing_load_result, max_steps).map_err(|e| anyhow::anyhow!("{e}"))?;
            print_result(&result);
            Ok(())
        }
    }
}

fn write_lines(output: Option<PathBuf>, lines: &[String]) -> Result<()> {
    let text = lines.join("\n") + "\n";
    match output {
        Some(path) => fs::write(&path, text).with_context(|| format!("writing {}", path.display())),
        None => {
            print!("{text}");
            Ok(())
        }
    }
}

fn print_result(result: &xtc::RunResult) {
    println!("halted: {}", result.halted);
    println!("timeout: {}", result.timeout);
    println!("a: {}", result.a);
    println!("d: {}", result.d);
    println!("lit pixels: {}", result.lit_pixels.len());
}
