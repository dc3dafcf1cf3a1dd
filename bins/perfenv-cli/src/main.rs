mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "perfenv-cli")]
#[command(about = "perfenv CLI - Score Python submissions and manage environment configs", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one reset/step episode on a submission and print the result
    Step {
        /// Python source file, or "-" for stdin
        #[arg(short, long)]
        code: PathBuf,

        /// JSON configuration file
        #[arg(short = 'f', long)]
        config: Option<PathBuf>,

        /// Override a configuration key (e.g. max_time_cost=5)
        #[arg(short, long = "set", value_name = "KEY=JSON")]
        sets: Vec<String>,

        /// Execution backend (process or docker); defaults to PERFENV_BACKEND
        #[arg(short, long)]
        backend: Option<String>,

        /// Print the text observation instead of the JSON step
        #[arg(long, default_value = "false")]
        observation: bool,
    },

    /// Write the default configuration as JSON
    InitConfig {
        /// Output path
        #[arg(short, long, default_value = "perfenv.json")]
        path: PathBuf,

        /// Overwrite an existing file
        #[arg(long, default_value = "false")]
        force: bool,
    },

    /// Validate a configuration file and print the resolved values
    CheckConfig {
        /// JSON configuration file
        #[arg(short = 'f', long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // stdout carries results; logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Step {
            code,
            config,
            sets,
            backend,
            observation,
        } => {
            commands::run_step(&code, config.as_deref(), &sets, backend.as_deref(), observation)
                .await?;
        }
        Commands::InitConfig { path, force } => {
            commands::init_config(&path, force)?;
        }
        Commands::CheckConfig { config } => {
            commands::check_config(&config)?;
        }
    }

    Ok(())
}
