use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    squad_sync_cli::init_tracing();
    let cli = squad_sync_cli::Cli::parse();
    squad_sync_cli::run_cli(cli)
}
