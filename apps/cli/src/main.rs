//! articleforge CLI: batch SEO article generation from keywords.
//!
//! Runs the whole pipeline for a batch, or any single stage over JSON
//! records on disk.

mod commands;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    let code = commands::run(cli).await?;
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
