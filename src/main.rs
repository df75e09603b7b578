//! soar-kernel CLI: load production rules and run the decision cycle.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use miette::{IntoDiagnostic, Result};

use soar_kernel::config::{ExplorationMode, KernelConfig};
use soar_kernel::event::{JsonSink, StdoutSink};
use soar_kernel::kernel::Reasoner;
use soar_kernel::loader::RuleFile;

#[derive(Parser)]
#[command(name = "soar-kernel", version, about = "Production-rule execution kernel")]
struct Cli {
    /// Kernel configuration file (TOML). Defaults apply when absent.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the tie-break policy.
    #[arg(long, global = true, value_enum)]
    exploration: Option<Exploration>,

    /// Seed for the selection RNG.
    #[arg(long, global = true)]
    seed: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum Exploration {
    First,
    Last,
    Random,
    EpsilonGreedy,
    Softmax,
}

impl From<Exploration> for ExplorationMode {
    fn from(e: Exploration) -> Self {
        match e {
            Exploration::First => ExplorationMode::First,
            Exploration::Last => ExplorationMode::Last,
            Exploration::Random => ExplorationMode::Random,
            Exploration::EpsilonGreedy => ExplorationMode::EpsilonGreedy,
            Exploration::Softmax => ExplorationMode::Softmax,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Load a rule file and run decision cycles.
    Run {
        /// Rule file (JSON, or TOML with a `.toml` extension).
        #[arg(long)]
        rules: PathBuf,

        /// Number of decision cycles to run.
        #[arg(long, default_value = "10", conflicts_with = "until_halt")]
        decisions: u64,

        /// Run until a rule halts, with `--decisions` as no limit.
        #[arg(long)]
        until_halt: bool,

        /// Emit events as JSON lines instead of a trace.
        #[arg(long)]
        json: bool,

        /// Include element-level events in the trace.
        #[arg(long, short)]
        verbose: bool,

        /// Print the final reasoner snapshot as JSON.
        #[arg(long)]
        snapshot: bool,
    },

    /// Compile a rule file and report network statistics.
    Check {
        /// Rule file (JSON, or TOML with a `.toml` extension).
        #[arg(long)]
        rules: PathBuf,
    },

    /// Print the effective configuration as TOML.
    Config {
        /// Also write it to this path.
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    miette::set_hook(Box::new(|_| {
        Box::new(
            miette::MietteHandlerOpts::new()
                .terminal_links(true)
                .unicode(true)
                .context_lines(3)
                .build(),
        )
    }))
    .ok(); // Ignore error if hook already set (e.g., in tests)

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => KernelConfig::load(path)?,
        None => KernelConfig::default(),
    };
    if let Some(exploration) = cli.exploration {
        config.exploration = exploration.into();
    }
    if cli.seed.is_some() {
        config.seed = cli.seed;
    }

    match cli.command {
        Commands::Run {
            rules,
            decisions,
            until_halt,
            json,
            verbose,
            snapshot,
        } => {
            let file = RuleFile::load(&rules)?;
            let mut reasoner = Reasoner::new(config)?;
            if json {
                reasoner.add_sink(Arc::new(JsonSink));
            } else {
                reasoner.add_sink(Arc::new(StdoutSink::new(verbose)));
            }
            reasoner.load_rules(&file.rules)?;

            let stop = if until_halt {
                reasoner.run_until_halt(None)?
            } else {
                reasoner.run_decisions(decisions)?
            };
            if !json {
                println!(
                    "Stopped ({stop}) after {} decision cycle(s), {} element(s) in working memory",
                    reasoner.cycle(),
                    reasoner.wmes().count()
                );
            }
            if snapshot {
                let json = serde_json::to_string_pretty(&reasoner.snapshot()).into_diagnostic()?;
                println!("{json}");
            }
        }

        Commands::Check { rules } => {
            let file = RuleFile::load(&rules)?;
            let mut reasoner = Reasoner::new(config)?;
            let ids = reasoner.load_rules(&file.rules)?;
            println!("{} production(s) compiled from {}", ids.len(), rules.display());
            println!("{}", reasoner.rete_stats());
            for (_, p) in reasoner.productions() {
                println!("  {} ({:?}-support)", p.def.name, p.support);
            }
        }

        Commands::Config { output } => {
            config.validate()?;
            println!("{}", config.to_toml_string()?);
            if let Some(path) = output {
                config.save(&path)?;
                println!("Written to {}", path.display());
            }
        }
    }

    Ok(())
}
