use clap::{Parser, Subcommand};
use color_eyre::eyre;
use console::style;
use itertools::Itertools;
use simtflow::{config::Config, kernel::KernelFile};
use std::path::PathBuf;

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Compile and execute a kernel
    Run {
        kernel: PathBuf,
        /// Number of global memory words to print
        #[arg(long = "dump", default_value_t = 16)]
        dump: usize,
        /// Write dispatch statistics as json
        #[arg(long = "stats")]
        stats: Option<PathBuf>,
    },
    /// Print the linearized program of a kernel
    Compile {
        kernel: PathBuf,
        /// Also print the region tree
        #[arg(long = "regions")]
        regions: bool,
    },
}

#[derive(Debug, Clone, Parser)]
#[command(author, version, about = "SIMT divergence control simulator", long_about = None)]
struct Options {
    /// Simulator configuration (yaml)
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Increase log verbosity
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    command: Command,
}

fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    let options = Options::parse();

    let level = match options.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::from_default_env()
        .filter_level(level)
        .init();

    let config = match &options.config {
        Some(path) => Config::from_path(path)?,
        None => Config::default(),
    };

    match options.command {
        Command::Compile { kernel, regions } => {
            let kernel = KernelFile::from_path(&kernel)?;
            let compiled = kernel.compile(&config)?;
            if regions {
                let tree = compiled.region.to_node(&compiled.function);
                println!("{}", serde_yaml::to_string(&tree)?);
            }
            print!("{}", compiled.program);
            println!(
                "{} saved-mask slot(s): {}",
                compiled.mask_stack.slots().len(),
                style(
                    compiled
                        .mask_stack
                        .slots()
                        .iter()
                        .map(|reg| format!("s[{}:{}]", reg, reg + 1))
                        .join(", ")
                )
                .cyan()
            );
        }
        Command::Run {
            kernel,
            dump,
            stats,
        } => {
            let start = std::time::Instant::now();
            let kernel = KernelFile::from_path(&kernel)?;
            let (_, outcome) = kernel.run(&config)?;
            for (i, word) in outcome.global_memory.words().iter().take(dump).enumerate() {
                println!("{:>#8x}: {}", i * 4, word);
            }
            if let Some(path) = stats {
                let file = std::fs::File::create(&path)?;
                serde_json::to_writer_pretty(file, &outcome.stats)?;
            }
            println!(
                "{} {} in {:?}: {} instructions, {} wavefronts, {} barrier releases",
                style("finished").green(),
                kernel.name,
                start.elapsed(),
                outcome.stats.num_steps,
                outcome.stats.num_wavefronts,
                outcome.stats.num_barrier_releases,
            );
        }
    }
    Ok(())
}
