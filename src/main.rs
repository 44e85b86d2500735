//! Stratus CLI: declarative, idempotent cloud infrastructure reconciler.

use clap::Parser;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "stratus",
    version,
    about = "Declarative cloud infrastructure reconciler: dependency graph, idempotent apply, recorded state"
)]
struct Cli {
    #[command(subcommand)]
    command: stratus::cli::Commands,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let cli = Cli::parse();
    if let Err(e) = stratus::cli::dispatch(cli.command) {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}
