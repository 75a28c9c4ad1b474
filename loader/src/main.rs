use std::process::ExitCode;

use clap::Parser;

use lazyload::cli::Cli;
use lazyload::{logging, output, LoaderConfig, LoaderContext, LoaderError, RunReport};

fn main() -> ExitCode {
    let config = LoaderConfig::from_cli(Cli::parse());
    logging::init(config.log_level);

    match load_and_run(&config) {
        Ok(report) => {
            if let Err(e) = output::emit(config.output, &report) {
                log::warn!("cannot write the summary: {e}");
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            output::emit_error(config.output, e.exit_status(), &e.to_string());
            e.exit_code()
        }
    }
}

fn load_and_run(config: &LoaderConfig) -> Result<RunReport, LoaderError> {
    let mut context = LoaderContext::open(config)?;
    // SAFETY: running the named executable is what the user asked for.
    unsafe { context.run() }
}
