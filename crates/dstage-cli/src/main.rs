use dstage_core::logging;

mod cli;

use clap::Parser;

use crate::cli::Cli;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Fall back to stderr when the state directory is not writable.
    if cli.log_stderr || logging::init_logging().is_err() {
        logging::init_logging_stderr();
    }

    if let Err(err) = cli.run().await {
        eprintln!("dstage error: {:#}", err);
        std::process::exit(1);
    }
}
