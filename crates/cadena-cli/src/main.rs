//! Cadena CLI - validate, print and run chainsetup files.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use cadena_engine::{parse_chainsetup, serialize, Chainsetup, Engine, Resources};

#[derive(Parser)]
#[command(name = "cadena")]
#[command(author, version, about = "Multitrack audio routing engine", long_about = None)]
struct Cli {
    /// Resources file overriding the compiled-in defaults.
    #[arg(long, global = true)]
    resources: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse a chainsetup file and check it is valid for enable
    Validate {
        /// Chainsetup file (.ecs)
        file: PathBuf,
    },

    /// Parse a chainsetup file and print its canonical form
    Print {
        /// Chainsetup file (.ecs)
        file: PathBuf,
    },

    /// Run a chainsetup until its streams finish
    Run {
        /// Chainsetup file (.ecs)
        file: PathBuf,

        /// Stop after this many seconds, overriding the file's length
        #[arg(long)]
        time: Option<f64>,
    },
}

fn load(file: &PathBuf, resources: Resources) -> anyhow::Result<Chainsetup> {
    let text = std::fs::read_to_string(file)
        .with_context(|| format!("reading chainsetup file '{}'", file.display()))?;
    let setup = parse_chainsetup(&text, resources)
        .with_context(|| format!("parsing chainsetup file '{}'", file.display()))?;
    Ok(setup)
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let resources = match &cli.resources {
        Some(path) => Resources::from_file(path)
            .with_context(|| format!("loading resources from '{}'", path.display()))?,
        None => Resources::defaults(),
    };

    match cli.command {
        Commands::Validate { file } => {
            let setup = load(&file, resources)?;
            if setup.is_valid() {
                println!("{}: valid", setup.name());
                Ok(())
            } else {
                anyhow::bail!(
                    "{}: not valid for enable (needs >= 1 input, output and connected chain)",
                    setup.name()
                );
            }
        }
        Commands::Print { file } => {
            let setup = load(&file, resources)?;
            print!("{}", serialize(&setup));
            Ok(())
        }
        Commands::Run { file, time } => {
            let mut setup = load(&file, resources)?;
            if let Some(secs) = time {
                setup.set_length_secs(secs);
            }
            setup.enable().context("enabling chainsetup")?;
            if setup.length_in_samples().is_none() {
                info!("no finite input or length set; run will continue until interrupted");
            }

            let stats = Engine::new(&mut setup).context("starting engine")?.run();
            info!(
                cycles = stats.cycles,
                frames = stats.frames,
                xruns = stats.xruns,
                "run complete"
            );
            setup.disable().context("disabling chainsetup")?;
            Ok(())
        }
    }
}
