//! relift CLI - trace recompiler orchestrator.

mod cli;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::{Cli, EXIT_FAILURE, EXIT_SUCCESS};

fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose {
        "relift=debug"
    } else if cli.silent {
        "relift=error"
    } else {
        "relift=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive(default_level.parse().unwrap()),
        )
        .with_target(false)
        .init();

    let exit_code = match relift::run(&cli.to_options()) {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            eprintln!("relift: {e}");
            EXIT_FAILURE
        }
    };
    std::process::exit(exit_code);
}
