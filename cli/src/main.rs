mod cli;

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sieve")]
#[command(about = "Declarative row cleaning for large tabular files", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a rule file against a dataset schema without reading data
    Validate {
        /// Path to the configuration file
        #[arg(short, long, default_value = "sieve.yaml")]
        config: String,

        /// Dataset id from the configuration
        #[arg(short, long)]
        dataset: String,

        /// Path to the JSON rule payload
        #[arg(short, long)]
        rules: String,
    },
    /// Count how many sample rows the rules select
    Preview {
        /// Path to the configuration file
        #[arg(short, long, default_value = "sieve.yaml")]
        config: String,

        /// Dataset id from the configuration
        #[arg(short, long)]
        dataset: String,

        /// Path to the JSON rule payload
        #[arg(short, long)]
        rules: String,
    },
    /// Stream the full dataset through the rules and write the result
    Run {
        /// Path to the configuration file
        #[arg(short, long, default_value = "sieve.yaml")]
        config: String,

        /// Dataset id from the configuration
        #[arg(short, long)]
        dataset: String,

        /// Path to the JSON rule payload
        #[arg(short, long)]
        rules: String,

        /// Print Prometheus metrics when the job ends
        #[arg(long)]
        metrics: bool,
    },
    /// Show a persisted job
    Status {
        /// Path to the configuration file
        #[arg(short, long, default_value = "sieve.yaml")]
        config: String,

        /// Job id
        job: String,
    },
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Cli::parse();

    match args.command {
        Commands::Validate {
            config,
            dataset,
            rules,
        } => {
            crate::cli::validate_rules(&config, &dataset, &rules).await?;
        }
        Commands::Preview {
            config,
            dataset,
            rules,
        } => {
            crate::cli::preview_rules(&config, &dataset, &rules).await?;
        }
        Commands::Run {
            config,
            dataset,
            rules,
            metrics,
        } => {
            crate::cli::run_job(&config, &dataset, &rules, metrics).await?;
        }
        Commands::Status { config, job } => {
            crate::cli::show_status(&config, &job).await?;
        }
        Commands::Completions { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "sieve", &mut std::io::stdout());
        }
    }

    Ok(())
}
