mod cli;
mod commands;
mod config;
mod source;

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use uelayout::ModuleImage;

use cli::{Cli, Commands};
use config::Config;
use source::Target;

const DEFAULT_FILTER: &str = "uelayout=info,uelayout_cli=info";
const VERBOSE_FILTER: &str = "uelayout=debug,uelayout_cli=debug";

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new(VERBOSE_FILTER)
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = Config::load(cli.config.as_deref())?;
    let target = Target::from_args(cli.pid, cli.process.clone(), cli.dump.clone())?;
    let view = target.open()?;
    let image = Arc::new(
        ModuleImage::locate(view, cli.module.as_deref())
            .context("Failed to locate the module image")?,
    );

    match cli.command {
        Commands::Resolve {
            artifacts,
            json,
            cache,
        } => {
            let cache_dir = if cache { config.cache_dir() } else { None };
            let registry = commands::build_registry(image, config.discovery)?;
            commands::handle_resolve(&registry, &artifacts, json, cache_dir.as_deref())?;
        }

        Commands::Types { filter, json } => {
            let registry = commands::build_registry(image, config.discovery)?;
            commands::handle_types(&registry, filter.as_deref(), json.as_deref())?;
        }

        Commands::Strings { text, wide } => {
            commands::handle_strings(&image, &text, wide)?;
        }

        Commands::Xrefs { address } => {
            commands::handle_xrefs(&image, address)?;
        }

        Commands::Disasm { address, count } => {
            commands::handle_disasm(&image, address, count)?;
        }

        Commands::Info => {
            commands::handle_info(&image)?;
        }
    }

    Ok(())
}
