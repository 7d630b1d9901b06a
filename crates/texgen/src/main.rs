use std::io;
use std::process::ExitCode;

use clap::Parser;
use console::style;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use texgen::Cli;

/// Environment variable holding a tracing filter, e.g. `TEXGEN_LOG=debug`.
const LOG_ENV: &str = "TEXGEN_LOG";

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let stdout = io::stdout();
    match texgen::run(&cli, &mut stdout.lock()) {
        Ok(_) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{} {}", style(format!("{}:", err.kind())).bold().red(), err);
            ExitCode::from(err.exit_code())
        }
    }
}

/// Logs go to stderr; `TEXGEN_LOG` wins over `-v`.
fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default));

    // Ignore the error if a subscriber is already installed.
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(io::stderr))
        .with(filter)
        .try_init();
}
