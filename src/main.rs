mod cli;
mod commands;

use clap::Parser;
use std::process::ExitCode;

use crate::cli::{Cli, Commands};

fn main() -> ExitCode {
    let cli = Cli::parse();
    deferc_utils::logger::init_logging(cli.verbose);

    let result = match &cli.command {
        Commands::Build(args) => commands::run_build(args).map(|_| ()),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}
