//! The capstan command line tool.

use std::io::IsTerminal as _;
use std::io::stderr;

use clap::Parser;
use clap::Subcommand;
use clap_verbosity_flag::InfoLevel;
use clap_verbosity_flag::Verbosity;
use colored::Colorize as _;
use tracing_subscriber::EnvFilter;

use capstan::commands;

/// The capstan subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Starts the supervisor over a fresh pipeline run.
    Start(commands::start::Args),

    /// Restarts the supervisor against the previous run, resubmitting only
    /// failed work packages.
    Retry(commands::retry::Args),

    /// Cancels scheduled array jobs, and optionally the supervisor.
    Abort(commands::abort::Args),

    /// Prints per-job work-package counts.
    Status,

    /// Lists a job's work packages with state and parameters.
    Work(commands::work::Args),

    /// Prints a work package's stdout log.
    Stdout(commands::logs::Args),

    /// Prints a work package's stderr log.
    Stderr(commands::logs::Args),
}

/// A control plane for driving batch-job pipelines through Slurm.
#[derive(Parser)]
#[command(author, version, propagate_version = true, about, long_about = None)]
struct Cli {
    /// The subcommand to run.
    #[command(subcommand)]
    command: Commands,

    /// The verbosity flags.
    #[command(flatten)]
    verbosity: Verbosity<InfoLevel>,
}

/// Parses the command line, configures logging, and dispatches.
async fn inner() -> anyhow::Result<i32> {
    let cli = Cli::parse();

    match std::env::var("RUST_LOG") {
        Ok(_) => {
            let subscriber = tracing_subscriber::fmt()
                .with_env_filter(EnvFilter::from_default_env())
                .with_writer(stderr)
                .with_ansi(stderr().is_terminal())
                .finish();

            tracing::subscriber::set_global_default(subscriber)?;
        }
        Err(_) => {
            let subscriber = tracing_subscriber::fmt()
                .with_max_level(cli.verbosity)
                .with_writer(stderr)
                .with_ansi(stderr().is_terminal())
                .finish();

            tracing::subscriber::set_global_default(subscriber)?;
        }
    };

    match cli.command {
        Commands::Start(args) => commands::start::start(args).await,
        Commands::Retry(args) => commands::retry::retry(args).await,
        Commands::Abort(args) => commands::abort::abort(args).await,
        Commands::Status => commands::status::status().await,
        Commands::Work(args) => commands::work::work(args).await,
        Commands::Stdout(args) => commands::logs::logs(args, commands::logs::Stream::Stdout).await,
        Commands::Stderr(args) => commands::logs::logs(args, commands::logs::Stream::Stderr).await,
    }
}

#[tokio::main]
async fn main() {
    match inner().await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!(
                "{error}: {e:?}",
                error = if stderr().is_terminal() {
                    "error".red().bold()
                } else {
                    "error".normal()
                }
            );
            std::process::exit(1);
        }
    }
}
