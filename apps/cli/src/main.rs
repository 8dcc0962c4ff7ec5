//! Dossier CLI: resumable, domain-by-domain research into structured tables.
//!
//! Researches a subject within a target market across a fixed set of
//! domains, checkpointing after each one so an interrupted run can resume.

mod commands;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
