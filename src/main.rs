use std::process::ExitCode;

use clap::Parser;

use layerfe::cli::{self, CliArgs};
use layerfe::logger;

fn main() -> ExitCode {
    let args = CliArgs::parse();

    logger::set_echo(args.verbose);
    logger::init();
    layerfe::log_info!("LayerFE {} starting", env!("CARGO_PKG_VERSION"));

    cli::run(args)
}
