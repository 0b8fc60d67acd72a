// Standard library
use std::process;

// External crates
use clap::Parser;
use tracing::debug;

// Internal imports
use fixture_core::fx_error;
use fixture_logging::LoggingConfig;

// Local modules
mod cli;
mod commands;

use cli::Args;
use commands::execute_command;

fn main() {
    let args = Args::parse();

    let mut logging = LoggingConfig::from_env();
    if args.debug {
        logging.level = "debug".to_string();
    }
    let guard = fixture_logging::init_with(&logging);
    debug!("Starting fixture command {:?}", args.command);

    let code = match execute_command(args) {
        Ok(code) => code,
        Err(e) => {
            fx_error!("{:#}", e);
            2
        }
    };
    // `process::exit` skips destructors; flush file logs first.
    drop(guard);
    process::exit(code);
}
