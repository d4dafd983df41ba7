use anyhow::{Context, Result};
use clap::Parser;
use lora_merge::{cli::Cli, logging, run};

fn main() -> Result<()> {
    let cli = Cli::parse();

    logging::init_logging(cli.verbose, cli.quiet)?;

    let config = cli.into_config().context("Failed to resolve configuration")?;
    let out = config.out.clone();

    run(&config).context("Failed to merge LoRA adapter into base model")?;

    println!("Merged model written to: {}", out.display());
    Ok(())
}
