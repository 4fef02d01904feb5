mod attach;
mod cli;
mod commands;
mod config;
mod error;
mod identity;
mod model;
mod output;
mod reconcile;
mod store;
mod supervisor;
#[cfg(test)]
mod testing;

use clap::Parser;
use error::JobError;

#[tokio::main]
async fn main() {
    let args = cli::Cli::parse();
    config::init_logging(args.verbose);

    if let Err(e) = cli::run(args).await {
        eprintln!("Error: {e:#}");
        let code = e.downcast_ref::<JobError>().map_or(1, JobError::exit_code);
        std::process::exit(code);
    }
}
