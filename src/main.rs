use anyhow::Result;
use clap::{Parser, Subcommand};

mod cmd;

#[derive(Parser)]
#[command(name = "blueprint")]
#[command(version, about = "Turn a product idea into a plan, a spec, and tracker issues")]
pub struct Cli {
    /// Log at debug level (RUST_LOG still takes precedence)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Drive an idea through the full planning pipeline
    Run {
        /// The product idea; prompted for interactively when omitted
        query: Option<String>,
    },
    /// List the pipeline stages in order
    Stages,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "blueprint=debug"
    } else {
        "blueprint=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();

    match cli.command {
        Commands::Run { query } => cmd::cmd_run(query).await?,
        Commands::Stages => cmd::cmd_stages(),
    }

    Ok(())
}
