//! Command-line front end: run or disassemble a serialized module image.
//!
//! Usage: `cilvm run <module.json> [args...]` or `cilvm disasm <module.json>`
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use cilvm::{ArgumentOrder, ModuleImage, Runtime, RuntimeOptions};

#[derive(Parser, Debug)]
#[command(name = "cilvm")]
#[command(about = "Interpret CIL method bodies from a module image")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Execute the module's static Main
    Run {
        /// Path to the module image (JSON)
        module: PathBuf,

        /// Arguments handed to Main as its string array
        args: Vec<String>,

        /// Maximum number of nested calls
        #[arg(long = "max-depth", default_value_t = RuntimeOptions::default().max_call_depth)]
        max_depth: usize,

        /// Maximum number of live heap objects
        #[arg(long = "heap-capacity", default_value_t = RuntimeOptions::default().heap_capacity)]
        heap_capacity: usize,

        /// Maximum number of elements in one array
        #[arg(
            long = "max-array-length",
            default_value_t = RuntimeOptions::default().max_array_length
        )]
        max_array_length: usize,

        /// Pass arguments receiver first in push order, without reordering
        #[arg(long = "strict-arguments")]
        strict_arguments: bool,
    },
    /// Print the listing of every method body
    Disasm {
        /// Path to the module image (JSON)
        module: PathBuf,
    },
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn load(path: &Path) -> anyhow::Result<ModuleImage> {
    let text =
        fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    ModuleImage::from_json(&text).with_context(|| format!("parsing {}", path.display()))
}

fn run(command: Command) -> anyhow::Result<()> {
    match command {
        Command::Run {
            module,
            args,
            max_depth,
            heap_capacity,
            max_array_length,
            strict_arguments,
        } => {
            let image = load(&module)?;
            let order = if strict_arguments {
                ArgumentOrder::Strict
            } else {
                ArgumentOrder::Heuristic
            };
            let options = RuntimeOptions::default()
                .with_max_call_depth(max_depth)
                .with_heap_capacity(heap_capacity)
                .with_max_array_length(max_array_length)
                .with_argument_order(order);
            let mut runtime = Runtime::new(options)?;
            runtime
                .load_module(&image)
                .with_context(|| format!("loading {}", image.name))?;
            if let Some(value) = runtime.start(&args)? {
                println!("{}", runtime.display(value)?);
            }
        }
        Command::Disasm { module } => {
            let image = load(&module)?;
            println!("{}", image.listing()?);
        }
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    init_logging();
    run(Args::parse().command)
}
