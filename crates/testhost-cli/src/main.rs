//! Probar Test Host: serves a test platform controller
//!
//! ## Usage
//!
//! ```bash
//! probar-testhost --port 4100 --framework mocha --runner ./runner.js
//! probar-testhost --port 4100 --coverage --coverage-dir ./coverage
//! ```

use clap::Parser;
use probar_testhost_cli::{build_settings, init_logging, serve, Cli, CliResult, LogConfig};
use std::process::ExitCode;

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(&cli) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> CliResult<u8> {
    init_logging(&LogConfig::from(cli))?;
    let settings = build_settings(cli)?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let exit = runtime.block_on(serve(settings))?;
    Ok(u8::try_from(exit.exit_code()).unwrap_or(1))
}
