//! moor CLI - run statements on remote workers.

mod colors;
mod run;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(name = "moor")]
#[command(about = "Run statements on supervised remote workers")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Host configuration file (JSON)
    #[arg(short, long, global = true, env = "MOOR_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

/// Options shared by every command that opens a session.
#[derive(Args, Debug, Clone)]
pub struct SessionArgs {
    /// Interpreter (setting) name
    #[arg(short, long, default_value = "sh")]
    interpreter: String,

    /// User to run as (only used with impersonation enabled)
    #[arg(short, long)]
    user: Option<String>,

    /// Worker runner to launch instead of moor-worker
    #[arg(long)]
    runner: Option<PathBuf>,

    /// Launch the worker on this host over the remote shell
    #[arg(long)]
    remote_host: Option<String>,

    /// Interpreter property exported to the worker, KEY=VALUE
    #[arg(short = 'p', long = "property", value_parser = run::parse_key_value)]
    properties: Vec<(String, String)>,

    /// Statement option, KEY=VALUE (e.g. type=single)
    #[arg(short = 'o', long = "option", value_parser = run::parse_key_value)]
    options: Vec<(String, String)>,

    /// Print results as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute statements one after another and print their results
    Run {
        #[command(flatten)]
        session: SessionArgs,

        /// Statements to run; "-" reads one statement from stdin
        #[arg(required = true)]
        statements: Vec<String>,
    },

    /// Submit one statement, optionally cancel it, and wait for the outcome
    Submit {
        #[command(flatten)]
        session: SessionArgs,

        /// Statement to submit
        statement: String,

        /// Cancel the statement after this many milliseconds
        #[arg(long)]
        cancel_after_ms: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        tracing_subscriber::EnvFilter::from_default_env()
            .add_directive(tracing::Level::DEBUG.into())
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    // Helper to format moor-core errors with recovery hints
    let format_error = |err: anyhow::Error| -> anyhow::Error {
        if let Some(moor_err) = err.downcast_ref::<moor_core::Error>() {
            anyhow::anyhow!("{}", moor_err.with_hint())
        } else {
            err
        }
    };

    let config = run::load_config(cli.config.as_deref()).map_err(format_error)?;

    match cli.command {
        Commands::Run {
            session,
            statements,
        } => {
            run::execute(config, &session, &statements)
                .await
                .map_err(format_error)?;
        }

        Commands::Submit {
            session,
            statement,
            cancel_after_ms,
        } => {
            run::submit(config, &session, &statement, cancel_after_ms)
                .await
                .map_err(format_error)?;
        }
    }

    Ok(())
}
