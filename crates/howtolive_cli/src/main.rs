//! howtolive CLI - Main entry point.
//!
//! Exit codes:
//! - 0: Success
//! - 1: Error

use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod commands;

use commands::{Cli, Commands};

/// Process exit codes
pub struct ExitCodes;

impl ExitCodes {
    pub const SUCCESS: u8 = 0;
    pub const GENERAL_ERROR: u8 = 1;
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let result = match cli.command {
        Commands::Chat(args) => commands::chat::execute(args).await,
        Commands::Sessions(args) => commands::sessions::execute(args).await,
    };

    match result {
        Ok(()) => ExitCode::from(ExitCodes::SUCCESS),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::from(ExitCodes::GENERAL_ERROR)
        }
    }
}

fn init_logging(verbose: bool) {
    let app_level = if verbose { "howtolive=debug" } else { "howtolive=info" };
    let mut filter = EnvFilter::from_default_env();
    for directive in [app_level, "warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    // A subscriber may already be installed.
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .try_init();
}
